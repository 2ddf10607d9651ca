pub mod channels;
pub mod db_manager;
pub mod key_manager;
pub mod requests;
pub mod swaps;
pub mod utxos;
pub mod wallets;

pub use db_manager::{DbManager, Document};
pub use key_manager::KeyManager;
