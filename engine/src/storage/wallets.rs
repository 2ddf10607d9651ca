use crate::models::{InternalWallet, Node, Wallet};

use super::db_manager::Document;

impl Document for Wallet {
    const TABLE: &'static str = "wallets";
    const ENTITY: &'static str = "wallet";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

impl Document for InternalWallet {
    const TABLE: &'static str = "internal_wallets";
    const ENTITY: &'static str = "internal wallet";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}

impl Document for Node {
    const TABLE: &'static str = "nodes";
    const ENTITY: &'static str = "node";

    fn id(&self) -> i64 {
        self.id
    }

    fn set_id(&mut self, id: i64) {
        self.id = id;
    }
}
