pub mod coin_selection;
pub mod fee_estimator;
pub mod transaction_builder;
pub mod utxo_manager;

pub use coin_selection::{select_utxos, CoinSelectionStrategy};
pub use fee_estimator::FeeEstimator;
pub use transaction_builder::{
    Replacement, Template, TemplateKind, TemplateOutcome, TemplateRequest, TransactionBuilder,
};
pub use utxo_manager::UtxoManager;
