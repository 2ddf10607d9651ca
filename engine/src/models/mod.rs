pub mod channel;
pub mod node;
pub mod request;
pub mod swap;
pub mod utxo;
pub mod wallet;

pub use channel::{Channel, ChannelStatus};
pub use node::Node;
pub use request::{
    ChannelOperationRequest, LogLevel, MempoolRecommendedFeesType, OperationRequestType,
    RequestPsbt, RequestRef, RequestStatus, SpendRequest, StatusLogEntry, WalletWithdrawalRequest,
    WithdrawalDestination,
};
pub use swap::SwapOut;
pub use utxo::{ChainUtxo, FmUtxo, UtxoTag, IS_FROZEN_TAG, IS_MANUALLY_FROZEN_TAG};
pub use wallet::{InternalWallet, Key, Keychain, Wallet, WalletAddressType, WalletDescriptor};
