use std::collections::HashSet;
use std::str::FromStr;

use bitcoin::{OutPoint, Txid};
use rusqlite::{params, Connection, TransactionBehavior};

use crate::error::StorageError;
use crate::models::{FmUtxo, RequestRef, RequestStatus, UtxoTag};

use super::db_manager::DbManager;

fn parse_outpoint(txid: &str, vout: i64) -> Result<OutPoint, StorageError> {
    let txid = Txid::from_str(txid)
        .map_err(|e| StorageError::Corrupt(format!("txid {}: {}", txid, e)))?;
    Ok(OutPoint::new(txid, vout as u32))
}

fn terminal_statuses() -> String {
    RequestStatus::TERMINAL
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Outpoints locked by requests that are not yet terminal, with their owners.
///
/// A lock whose request row is gone stays live.
fn live_locks(conn: &Connection) -> Result<Vec<(OutPoint, RequestRef)>, StorageError> {
    let sql = format!(
        "SELECT u.txid, u.output_index, l.request_kind, l.request_id
         FROM utxo_locks l
         JOIN utxos u ON u.id = l.utxo_id
         LEFT JOIN withdrawal_requests w
            ON l.request_kind = 'withdrawal' AND w.id = l.request_id
         LEFT JOIN channel_operation_requests c
            ON l.request_kind = 'channel_operation' AND c.id = l.request_id
         WHERE COALESCE(w.status, c.status, '') NOT IN ({})",
        terminal_statuses()
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(txid, vout, kind, id)| {
            let outpoint = parse_outpoint(&txid, vout)?;
            let request = RequestRef::from_parts(&kind, id)
                .ok_or_else(|| StorageError::Corrupt(format!("lock owner kind {}", kind)))?;
            Ok((outpoint, request))
        })
        .collect()
}

impl DbManager {
    /// Outpoints reserved by active requests other than `exclude`.
    pub fn get_locked_utxos(&self, exclude: &[RequestRef]) -> Result<HashSet<OutPoint>, StorageError> {
        let conn = self.get_conn()?;
        Ok(live_locks(&conn)?
            .into_iter()
            .filter(|(_, owner)| !exclude.contains(owner))
            .map(|(outpoint, _)| outpoint)
            .collect())
    }

    /// Reserves `utxos` for `request`.
    ///
    /// The live-lock check and the inserts share one immediate transaction, so two
    /// requests cannot both reserve the same outpoint. Locks held by `compatible`
    /// requests (e.g. the request being fee-bumped) do not conflict.
    pub fn lock_utxos(
        &self,
        request: RequestRef,
        utxos: &[FmUtxo],
        compatible: &[RequestRef],
    ) -> Result<(), StorageError> {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let taken: HashSet<OutPoint> = live_locks(&tx)?
            .into_iter()
            .filter(|(_, owner)| *owner != request && !compatible.contains(owner))
            .map(|(outpoint, _)| outpoint)
            .collect();

        if let Some(conflict) = utxos.iter().find(|u| taken.contains(&u.outpoint)) {
            tracing::warn!("UTXO {} already locked, refusing to lock for {}", conflict.outpoint, request);
            return Err(StorageError::UtxoAlreadyLocked(conflict.outpoint));
        }

        for utxo in utxos {
            tx.execute(
                "INSERT INTO utxos (txid, output_index, sats_amount, address, wallet_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (txid, output_index) DO UPDATE SET
                    sats_amount = excluded.sats_amount,
                    address = excluded.address,
                    wallet_id = excluded.wallet_id",
                params![
                    utxo.outpoint.txid.to_string(),
                    utxo.outpoint.vout as i64,
                    utxo.sats_amount as i64,
                    utxo.address,
                    utxo.wallet_id,
                ],
            )?;

            let utxo_id: i64 = tx.query_row(
                "SELECT id FROM utxos WHERE txid = ?1 AND output_index = ?2",
                params![utxo.outpoint.txid.to_string(), utxo.outpoint.vout as i64],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT OR IGNORE INTO utxo_locks (utxo_id, request_kind, request_id) VALUES (?1, ?2, ?3)",
                params![utxo_id, request.kind(), request.id()],
            )?;
        }

        tx.commit()?;

        tracing::info!("Locked {} UTXOs for {}", utxos.len(), request);
        Ok(())
    }

    pub fn get_request_utxos(&self, request: RequestRef) -> Result<Vec<FmUtxo>, StorageError> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(
            "SELECT u.id, u.txid, u.output_index, u.sats_amount, u.address, u.wallet_id
             FROM utxos u
             JOIN utxo_locks l ON l.utxo_id = u.id
             WHERE l.request_kind = ?1 AND l.request_id = ?2
             ORDER BY u.id",
        )?;

        let rows = stmt
            .query_map(params![request.kind(), request.id()], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(id, txid, vout, sats, address, wallet_id)| {
                Ok(FmUtxo {
                    id,
                    outpoint: parse_outpoint(&txid, vout)?,
                    sats_amount: sats as u64,
                    address,
                    wallet_id,
                })
            })
            .collect()
    }

    /// Inserts or replaces the tag for `(key, outpoint)`.
    pub fn set_utxo_tag(&self, tag: &UtxoTag) -> Result<(), StorageError> {
        let conn = self.get_conn()?;

        conn.execute(
            "INSERT INTO utxo_tags (key, value, outpoint) VALUES (?1, ?2, ?3)
             ON CONFLICT (key, outpoint) DO UPDATE SET value = excluded.value",
            params![tag.key, tag.value, tag.outpoint.to_string()],
        )?;

        Ok(())
    }

    pub fn get_utxo_tags(&self, keys: &[&str]) -> Result<Vec<UtxoTag>, StorageError> {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare("SELECT key, value, outpoint FROM utxo_tags ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .filter(|(key, _, _)| keys.contains(&key.as_str()))
            .map(|(key, value, outpoint)| {
                let outpoint = OutPoint::from_str(&outpoint)
                    .map_err(|e| StorageError::Corrupt(format!("outpoint {}: {}", outpoint, e)))?;
                Ok(UtxoTag { key, value, outpoint })
            })
            .collect()
    }
}
