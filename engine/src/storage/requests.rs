use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::error::StorageError;
use crate::models::{
    ChannelOperationRequest, RequestPsbt, RequestRef, RequestStatus, WalletWithdrawalRequest,
};

use super::db_manager::{DbManager, Document};

impl Document for WalletWithdrawalRequest {
    const TABLE: &'static str = "withdrawal_requests";
    const ENTITY: &'static str = "withdrawal request";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn status(&self) -> Option<RequestStatus> {
        Some(self.status)
    }
}

impl Document for ChannelOperationRequest {
    const TABLE: &'static str = "channel_operation_requests";
    const ENTITY: &'static str = "channel operation request";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    fn status(&self) -> Option<RequestStatus> {
        Some(self.status)
    }
}

impl DbManager {
    pub fn add_request_psbt(&self, row: &mut RequestPsbt) -> Result<i64, StorageError> {
        let conn = self.get_conn()?;

        conn.execute(
            "INSERT INTO request_psbts
                (request_kind, request_id, psbt, signer_user_id, is_template, is_internal_wallet, is_finalised, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                row.request.kind(),
                row.request.id(),
                row.psbt,
                row.signer_user_id,
                row.is_template,
                row.is_internal_wallet,
                row.is_finalised,
                row.created_at.to_rfc3339(),
            ],
        )?;

        row.id = conn.last_insert_rowid();
        Ok(row.id)
    }

    /// All PSBT rows of a request, oldest first.
    pub fn get_request_psbts(&self, request: RequestRef) -> Result<Vec<RequestPsbt>, StorageError> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            "SELECT id, psbt, signer_user_id, is_template, is_internal_wallet, is_finalised, created_at
             FROM request_psbts
             WHERE request_kind = ?1 AND request_id = ?2
             ORDER BY id",
        )?;

        let rows = stmt
            .query_map(params![request.kind(), request.id()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, bool>(4)?,
                    row.get::<_, bool>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, psbt, signer_user_id, is_template, is_internal_wallet, is_finalised, created_at)| {
                let created_at = DateTime::parse_from_rfc3339(&created_at)
                    .map_err(|e| StorageError::Corrupt(format!("PSBT row {} timestamp: {}", id, e)))?
                    .with_timezone(&Utc);
                Ok(RequestPsbt {
                    id,
                    request,
                    psbt,
                    signer_user_id,
                    is_template,
                    is_internal_wallet,
                    is_finalised,
                    created_at,
                })
            })
            .collect()
    }

    /// The earliest template row; later templates are never written while one exists.
    pub fn get_template_psbt(&self, request: RequestRef) -> Result<Option<RequestPsbt>, StorageError> {
        Ok(self
            .get_request_psbts(request)?
            .into_iter()
            .find(|row| row.is_template))
    }
}
