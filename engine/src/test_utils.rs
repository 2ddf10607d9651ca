//! Fixtures and in-memory fakes shared by the unit tests.

use async_trait::async_trait;
use bitcoin::bip32::{DerivationPath, Xpriv, Xpub};
use bitcoin::hashes::{sha256, Hash};
use bitcoin::key::{CompressedPublicKey, Secp256k1};
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::{Address, Amount, FeeRate, Network, OutPoint, Transaction, TxOut, Txid};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::str::FromStr;

use crate::error::{ChainError, NodeError};
use crate::models::{
    ChainUtxo, ChannelOperationRequest, InternalWallet, Key, Keychain, MempoolRecommendedFeesType, Node,
    OperationRequestType, RequestStatus, Wallet, WalletAddressType, WalletDescriptor, WalletWithdrawalRequest,
    WithdrawalDestination,
};
use crate::services::chain::{BroadcastResult, ChainIndex, KeychainAddress, TrackTarget, TransactionStatus, UtxoSet};
use crate::services::lightning::{
    CloseChannelParams, CloseStatusUpdate, FundingStep, LightningNode, NodeInfo, OpenChannelParams,
    OpenStatusUpdate, UpdateStream,
};
use crate::storage::{DbManager, KeyManager};

pub const MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
pub const INTERNAL_FINGERPRINT: &str = "73c5da0a";
pub const ACCOUNT_PATH: &str = "m/48'/1'/0'/2'";

pub fn signer_xpriv(n: u8) -> Xpriv {
    Xpriv::new_master(Network::Regtest, &[n; 32]).unwrap()
}

fn signer_key(id: i64, n: u8) -> Key {
    let secp = Secp256k1::new();
    let master = signer_xpriv(n);
    let path = DerivationPath::from_str(ACCOUNT_PATH).unwrap();
    let account = master.derive_priv(&secp, &path).unwrap();

    Key {
        id,
        name: format!("signer-{}", n),
        xpub: Xpub::from_priv(&secp, &account).to_string(),
        path: ACCOUNT_PATH.to_string(),
        master_fingerprint: master.fingerprint(&secp).to_string(),
        user_id: Some(format!("user-{}", n)),
        internal_wallet_id: None,
        is_bip39_imported: false,
    }
}

pub fn internal_wallet() -> InternalWallet {
    let mut wallet = KeyManager::new(Network::Regtest)
        .import_internal_wallet(MNEMONIC, ACCOUNT_PATH)
        .unwrap();
    wallet.id = 1;
    wallet
}

/// Stores the internal wallet; on a fresh database it gets id 1.
pub fn store_internal_wallet(db: &DbManager) -> InternalWallet {
    let mut wallet = internal_wallet();
    db.add(&mut wallet).unwrap();
    assert_eq!(wallet.id, 1);
    wallet
}

fn wallet(name: &str, mofn: u32, keys: Vec<Key>, address_type: WalletAddressType) -> Wallet {
    Wallet {
        id: 1,
        name: name.to_string(),
        mofn,
        keys,
        internal_wallet_id: Some(1),
        is_hot_wallet: false,
        address_type,
        is_unsorted_multisig: false,
        is_bip39_imported: false,
        is_finalised: true,
        is_archived: false,
        is_compromised: false,
        created_at: Utc::now(),
    }
}

/// Two external signers plus the internal wallet's key.
pub fn multisig_wallet(mofn: u32, address_type: WalletAddressType) -> Wallet {
    let mut internal = internal_wallet().as_key("internal");
    internal.id = 3;
    let keys = vec![signer_key(1, 1), signer_key(2, 2), internal];
    wallet("treasury", mofn, keys, address_type)
}

pub fn hot_wallet() -> Wallet {
    let mut internal = internal_wallet().as_key("internal");
    internal.id = 1;
    let mut wallet = wallet("hot", 1, vec![internal], WalletAddressType::NativeSegwit);
    wallet.is_hot_wallet = true;
    wallet
}

pub fn node(name: &str) -> Node {
    let secret = SecretKey::from_slice(sha256::Hash::hash(name.as_bytes()).as_byte_array()).unwrap();
    let pubkey = PublicKey::from_secret_key(&Secp256k1::new(), &secret);

    Node {
        id: 0,
        name: name.to_string(),
        pubkey: pubkey.to_string(),
        endpoint: Some("https://localhost:10009".to_string()),
        macaroon: Some("0201036c6e64".to_string()),
        tls_cert: None,
    }
}

pub fn withdrawal_request(wallet_id: i64, address: &str, amount: u64) -> WalletWithdrawalRequest {
    WalletWithdrawalRequest {
        id: 0,
        wallet_id,
        description: "test withdrawal".to_string(),
        destinations: vec![WithdrawalDestination {
            address: address.to_string(),
            amount_sats: amount,
        }],
        withdraw_all_funds: false,
        fees_type: MempoolRecommendedFeesType::default(),
        custom_fee_rate: None,
        status: RequestStatus::Pending,
        bumping_request_id: None,
        tx_id: None,
        rejection_reason: None,
        user_requestor_id: Some("user-1".to_string()),
        selected_outpoints: Vec::new(),
        status_logs: Vec::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn channel_open_request(wallet_id: Option<i64>, amount: u64) -> ChannelOperationRequest {
    ChannelOperationRequest {
        id: 0,
        request_type: OperationRequestType::Open,
        amount_sats: amount,
        wallet_id,
        source_node_id: 1,
        destination_node_id: 2,
        status: RequestStatus::Pending,
        fees_type: MempoolRecommendedFeesType::HalfHourFee,
        custom_fee_rate: None,
        changeless: false,
        is_private: false,
        tx_id: None,
        funding_output_index: None,
        channel_id: None,
        close_address: None,
        force_close: false,
        selected_outpoints: Vec::new(),
        status_logs: Vec::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

pub fn outpoint(seed: u8, vout: u32) -> OutPoint {
    OutPoint {
        txid: Txid::from_str(&format!("{:064x}", seed)).unwrap(),
        vout,
    }
}

/// P2WPKH regtest address of the secret key `[n; 32]`.
pub fn external_address(n: u8) -> Address {
    let secret = SecretKey::from_slice(&[n; 32]).unwrap();
    let pubkey = CompressedPublicKey(PublicKey::from_secret_key(&Secp256k1::new(), &secret));
    Address::p2wpkh(&pubkey, Network::Regtest)
}

/// A confirmed UTXO outside any wallet, for selection tests.
pub fn chain_utxo(seed: u8, value: Amount) -> ChainUtxo {
    ChainUtxo {
        outpoint: outpoint(seed, 0),
        txout: TxOut {
            value,
            script_pubkey: external_address(seed).script_pubkey(),
        },
        keychain: Keychain::External,
        derivation_index: seed as u32,
        confirmations: 6,
    }
}

/// A UTXO paying the wallet's script at `keychain/index`.
pub fn wallet_utxo(
    descriptor: &WalletDescriptor,
    keychain: Keychain,
    index: u32,
    value: Amount,
    confirmations: u32,
) -> ChainUtxo {
    let script_pubkey = descriptor.script_pubkey_at(keychain, index).unwrap();
    let mut preimage = script_pubkey.to_bytes();
    preimage.extend_from_slice(&value.to_sat().to_le_bytes());

    ChainUtxo {
        outpoint: OutPoint {
            txid: Txid::hash(&preimage),
            vout: 0,
        },
        txout: TxOut { value, script_pubkey },
        keychain,
        derivation_index: index,
        confirmations,
    }
}

struct ChainState {
    utxos: HashMap<i64, Vec<ChainUtxo>>,
    spent: HashSet<OutPoint>,
    fee_rate: FeeRate,
    synced: bool,
    broadcasts: Vec<Transaction>,
    rejection: Option<(i32, String)>,
    rejected_inputs: HashMap<OutPoint, (i32, String)>,
    confirmations: HashMap<Txid, u32>,
    tracked: usize,
}

impl Default for ChainState {
    fn default() -> Self {
        Self {
            utxos: HashMap::new(),
            spent: HashSet::new(),
            fee_rate: FeeRate::from_sat_per_vb_unchecked(1),
            synced: true,
            broadcasts: Vec::new(),
            rejection: None,
            rejected_inputs: HashMap::new(),
            confirmations: HashMap::new(),
            tracked: 0,
        }
    }
}

/// In-memory chain index keyed by wallet id.
#[derive(Default)]
pub struct FakeChainIndex {
    state: Mutex<ChainState>,
}

impl FakeChainIndex {
    pub fn set_utxos(&self, wallet_id: i64, utxos: Vec<ChainUtxo>) {
        self.state.lock().utxos.insert(wallet_id, utxos);
    }

    pub fn spend(&self, outpoint: OutPoint) {
        self.state.lock().spent.insert(outpoint);
    }

    pub fn set_fee_rate(&self, fee_rate: FeeRate) {
        self.state.lock().fee_rate = fee_rate;
    }

    pub fn set_synced(&self, synced: bool) {
        self.state.lock().synced = synced;
    }

    pub fn reject_broadcasts(&self, code: i32, message: &str) {
        self.state.lock().rejection = Some((code, message.to_string()));
    }

    /// Rejects only transactions spending `outpoint`.
    pub fn reject_spends_of(&self, outpoint: OutPoint, code: i32, message: &str) {
        self.state
            .lock()
            .rejected_inputs
            .insert(outpoint, (code, message.to_string()));
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.state.lock().broadcasts.clone()
    }

    pub fn set_confirmations(&self, txid: Txid, confirmations: u32) {
        self.state.lock().confirmations.insert(txid, confirmations);
    }

    pub fn tracked_count(&self) -> usize {
        self.state.lock().tracked
    }
}

#[async_trait]
impl ChainIndex for FakeChainIndex {
    async fn is_fully_synced(&self) -> Result<bool, ChainError> {
        Ok(self.state.lock().synced)
    }

    async fn get_utxos(&self, descriptor: &WalletDescriptor) -> Result<UtxoSet, ChainError> {
        let state = self.state.lock();
        let (confirmed, unconfirmed): (Vec<_>, Vec<_>) = state
            .utxos
            .get(&descriptor.wallet_id)
            .into_iter()
            .flatten()
            .filter(|u| !state.spent.contains(&u.outpoint))
            .cloned()
            .partition(|u| u.confirmations > 0);

        Ok(UtxoSet { confirmed, unconfirmed })
    }

    async fn get_unused_address(
        &self,
        descriptor: &WalletDescriptor,
        keychain: Keychain,
    ) -> Result<KeychainAddress, ChainError> {
        Ok(KeychainAddress {
            address: descriptor.address_at(keychain, 0, Network::Regtest)?,
            keychain,
            index: 0,
        })
    }

    async fn get_fee_rate(&self, _target_blocks: u16) -> Result<FeeRate, ChainError> {
        Ok(self.state.lock().fee_rate)
    }

    async fn broadcast(&self, tx: &Transaction) -> Result<BroadcastResult, ChainError> {
        let mut state = self.state.lock();
        if let Some((code, message)) = &state.rejection {
            return Ok(BroadcastResult::rejected(*code, message.clone()));
        }
        if let Some((code, message)) = tx
            .input
            .iter()
            .find_map(|txin| state.rejected_inputs.get(&txin.previous_output))
        {
            return Ok(BroadcastResult::rejected(*code, message.clone()));
        }
        state.broadcasts.push(tx.clone());
        Ok(BroadcastResult::accepted())
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<Option<TransactionStatus>, ChainError> {
        let state = self.state.lock();
        let confirmations = match state.confirmations.get(txid) {
            Some(confirmations) => Some(*confirmations),
            None if state.broadcasts.iter().any(|tx| tx.compute_txid() == *txid) => Some(0),
            None => None,
        };

        Ok(confirmations.map(|confirmations| TransactionStatus {
            confirmations,
            block_height: (confirmations > 0).then_some(100),
        }))
    }

    async fn get_raw_transaction(&self, _txid: &Txid) -> Result<Option<Transaction>, ChainError> {
        Ok(None)
    }

    async fn track(&self, _target: TrackTarget) -> Result<(), ChainError> {
        self.state.lock().tracked += 1;
        Ok(())
    }
}

#[derive(Default)]
struct NodeState {
    open_scripts: VecDeque<Vec<Result<OpenStatusUpdate, NodeError>>>,
    close_scripts: VecDeque<Vec<Result<CloseStatusUpdate, NodeError>>>,
    node_info: Option<NodeInfo>,
    connect_failure: Option<NodeError>,
    funding_steps: Vec<([u8; 32], FundingStep)>,
    open_params: Vec<OpenChannelParams>,
    close_params: Vec<CloseChannelParams>,
    connected: Vec<(String, String)>,
}

/// Lightning daemon replaying scripted update streams and recording every call.
#[derive(Default)]
pub struct FakeLightningNode {
    state: Mutex<NodeState>,
}

impl FakeLightningNode {
    pub fn script_open(&self, updates: Vec<Result<OpenStatusUpdate, NodeError>>) {
        self.state.lock().open_scripts.push_back(updates);
    }

    pub fn script_close(&self, updates: Vec<Result<CloseStatusUpdate, NodeError>>) {
        self.state.lock().close_scripts.push_back(updates);
    }

    pub fn set_node_info(&self, info: NodeInfo) {
        self.state.lock().node_info = Some(info);
    }

    pub fn fail_next_connect(&self, error: NodeError) {
        self.state.lock().connect_failure = Some(error);
    }

    pub fn funding_steps(&self) -> Vec<FundingStep> {
        self.state.lock().funding_steps.iter().map(|(_, step)| step.clone()).collect()
    }

    pub fn funding_step_ids(&self) -> Vec<[u8; 32]> {
        self.state.lock().funding_steps.iter().map(|(id, _)| *id).collect()
    }

    pub fn open_params(&self) -> Vec<OpenChannelParams> {
        self.state.lock().open_params.clone()
    }

    pub fn close_params(&self) -> Vec<CloseChannelParams> {
        self.state.lock().close_params.clone()
    }

    pub fn connected_peers(&self) -> Vec<(String, String)> {
        self.state.lock().connected.clone()
    }
}

#[async_trait]
impl LightningNode for FakeLightningNode {
    async fn open_channel(
        &self,
        _node: &Node,
        params: OpenChannelParams,
    ) -> Result<UpdateStream<OpenStatusUpdate>, NodeError> {
        let mut state = self.state.lock();
        state.open_params.push(params);
        let updates = state.open_scripts.pop_front().unwrap_or_default();
        Ok(Box::pin(tokio_stream::iter(updates)))
    }

    async fn funding_state_step(
        &self,
        _node: &Node,
        pending_chan_id: [u8; 32],
        step: FundingStep,
    ) -> Result<(), NodeError> {
        self.state.lock().funding_steps.push((pending_chan_id, step));
        Ok(())
    }

    async fn close_channel(
        &self,
        _node: &Node,
        params: CloseChannelParams,
    ) -> Result<UpdateStream<CloseStatusUpdate>, NodeError> {
        let mut state = self.state.lock();
        state.close_params.push(params);
        let updates = state.close_scripts.pop_front().unwrap_or_default();
        Ok(Box::pin(tokio_stream::iter(updates)))
    }

    async fn get_node_info(&self, _node: &Node, pubkey: &str) -> Result<NodeInfo, NodeError> {
        self.state
            .lock()
            .node_info
            .clone()
            .ok_or_else(|| NodeError::UnexpectedResponse(format!("unknown node {}", pubkey)))
    }

    async fn connect_peer(&self, _node: &Node, pubkey: &str, host: &str) -> Result<(), NodeError> {
        let mut state = self.state.lock();
        if let Some(error) = state.connect_failure.take() {
            return Err(error);
        }
        state.connected.push((pubkey.to_string(), host.to_string()));
        Ok(())
    }
}
