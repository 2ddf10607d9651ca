use crate::models::{RequestStatus, SwapOut};

use super::db_manager::Document;

impl Document for SwapOut {
    const TABLE: &'static str = "swap_outs";
    const ENTITY: &'static str = "swap out";

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
