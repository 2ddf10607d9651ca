use crate::error::StorageError;
use crate::models::Channel;

use super::db_manager::{DbManager, Document};

impl Document for Channel {
    const TABLE: &'static str = "channels";
    const ENTITY: &'static str = "channel";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

impl DbManager {
    pub fn find_channel_by_point(&self, funding_tx: &bitcoin::Txid, output_index: u32) -> Result<Option<Channel>, StorageError> {
        Ok(self
            .list::<Channel>()?
            .into_iter()
            .find(|c| &c.funding_tx == funding_tx && c.funding_tx_output_index == output_index))
    }
}
