pub mod finalizer;
pub mod remote_signer;

pub use finalizer::{finalize, FinalizedPsbt};
pub use remote_signer::RemoteSigner;

use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{EcdsaSighashType, OutPoint};
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{SigningError, WalletError};
use crate::models::{InternalWallet, RequestPsbt, RequestRef, Wallet};
use crate::storage::{DbManager, KeyManager};

/// Total partial signatures across all inputs.
pub fn signature_count(psbt: &Psbt) -> usize {
    psbt.inputs.iter().map(|i| i.partial_sigs.len()).sum()
}

/// Signatures on the least-signed input.
pub fn min_input_signatures(psbt: &Psbt) -> usize {
    psbt.inputs.iter().map(|i| i.partial_sigs.len()).min().unwrap_or(0)
}

/// Signatures external signers must provide before the internal wallet can complete the set.
pub fn required_signer_signatures(wallet: &Wallet) -> usize {
    let threshold = wallet.mofn as usize;
    if wallet.has_internal_key() {
        threshold.saturating_sub(1)
    } else {
        threshold
    }
}

/// The sighash the template asks signers to use.
pub fn enforced_sighash(psbt: &Psbt) -> EcdsaSighashType {
    psbt.inputs
        .first()
        .and_then(|i| i.sighash_type)
        .and_then(|s| s.ecdsa_hash_ty().ok())
        .unwrap_or(EcdsaSighashType::All)
}

/// Merges the signer submissions in `rows` into `base`.
///
/// Rows spending the same transaction are combined as PSBTs; rows whose outputs differ (channel
/// opens, where the node adds the funding output) contribute partial signatures by outpoint.
/// Unparsable rows are skipped.
pub fn combine(base: &Psbt, rows: &[RequestPsbt]) -> Result<Psbt, SigningError> {
    let mut combined = base.clone();

    for row in rows.iter().filter(|r| r.is_signer_submission()) {
        let signed = match Psbt::from_str(&row.psbt) {
            Ok(psbt) => psbt,
            Err(e) => {
                tracing::warn!("Skipping unparsable PSBT row {} for {}: {}", row.id, row.request, e);
                continue;
            }
        };

        if signed.unsigned_tx == combined.unsigned_tx {
            combined
                .combine(signed)
                .map_err(|e| SigningError::InvalidPsbt(format!("combine row {}: {}", row.id, e)))?;
            continue;
        }

        for (txin, input) in signed.unsigned_tx.input.iter().zip(signed.inputs.into_iter()) {
            let Some(index) = combined
                .unsigned_tx
                .input
                .iter()
                .position(|i| i.previous_output == txin.previous_output)
            else {
                tracing::warn!("Row {} signs unknown input {}", row.id, txin.previous_output);
                continue;
            };
            combined.inputs[index].partial_sigs.extend(input.partial_sigs);
        }
    }

    Ok(combined)
}

/// Signs with keys derived from the internal wallet's mnemonic.
pub struct LocalSigner {
    db: Arc<DbManager>,
    key_manager: Arc<KeyManager>,
}

impl LocalSigner {
    pub fn new(db: Arc<DbManager>, key_manager: Arc<KeyManager>) -> Self {
        Self { db, key_manager }
    }

    fn sign(&self, internal_wallet_id: i64, psbt: &mut Psbt) -> Result<(), SigningError> {
        let internal_wallet: InternalWallet = self.db.get(internal_wallet_id)?;
        let secp = Secp256k1::new();

        let master = self.key_manager.master_xpriv(&internal_wallet)?;
        match psbt.sign(&master, &secp) {
            Ok(signed) => {
                tracing::debug!("Internal wallet {} signed {} inputs", internal_wallet_id, signed.len());
                Ok(())
            }
            Err((_, errors)) => Err(SigningError::Signer(format!("{:?}", errors))),
        }
    }
}

/// How the internal wallet signs, selected by configuration.
pub enum InternalSigner {
    Local(LocalSigner),
    Remote(RemoteSigner),
}

pub struct SigningCoordinator {
    db: Arc<DbManager>,
    signer: InternalSigner,
}

impl SigningCoordinator {
    pub fn new(db: Arc<DbManager>, signer: InternalSigner) -> Self {
        Self { db, signer }
    }

    /// Stores a signer's PSBT after checking it spends exactly the template inputs.
    pub fn submit_signed_psbt(&self, request: RequestRef, user_id: &str, psbt: &str) -> Result<(), SigningError> {
        let template = self
            .db
            .get_template_psbt(request)?
            .ok_or_else(|| SigningError::MissingTemplate(request.to_string()))?;
        let template = Psbt::from_str(&template.psbt).map_err(|e| SigningError::InvalidPsbt(e.to_string()))?;
        let signed = Psbt::from_str(psbt).map_err(|e| SigningError::InvalidPsbt(e.to_string()))?;

        let expected: HashSet<OutPoint> = template.unsigned_tx.input.iter().map(|i| i.previous_output).collect();
        let spent: HashSet<OutPoint> = signed.unsigned_tx.input.iter().map(|i| i.previous_output).collect();
        if expected != spent || signed.unsigned_tx.input.len() != template.unsigned_tx.input.len() {
            tracing::warn!("Rejected PSBT from {} for {}: inputs differ from the template", user_id, request);
            return Err(SigningError::StaleTemplate(
                "signed PSBT does not spend the template inputs".to_string(),
            ));
        }

        self.db
            .add_request_psbt(&mut RequestPsbt::signed(request, signed.to_string(), user_id))?;
        tracing::info!("Stored {} signatures from {} for {}", signature_count(&signed), user_id, request);
        Ok(())
    }

    /// Whether the external signers have provided what the wallet needs.
    pub fn signatures_collected(&self, wallet: &Wallet, request: RequestRef) -> Result<bool, SigningError> {
        let template = self
            .db
            .get_template_psbt(request)?
            .ok_or_else(|| SigningError::MissingTemplate(request.to_string()))?;
        let template = Psbt::from_str(&template.psbt).map_err(|e| SigningError::InvalidPsbt(e.to_string()))?;

        let rows = self.db.get_request_psbts(request)?;
        let combined = combine(&template, &rows)?;

        Ok(min_input_signatures(&combined) >= required_signer_signatures(wallet))
    }

    /// Adds the internal wallet's signature when the wallet has an internal key and the
    /// threshold is not yet met.
    ///
    /// Fails unless the total signature count strictly increases.
    pub async fn sign_with_internal_wallet(&self, wallet: &Wallet, psbt: Psbt) -> Result<Psbt, SigningError> {
        if !wallet.has_internal_key() || min_input_signatures(&psbt) >= wallet.mofn as usize {
            return Ok(psbt);
        }

        let before = signature_count(&psbt);
        let signed = match &self.signer {
            InternalSigner::Local(local) => {
                let internal_wallet_id = wallet
                    .keys
                    .iter()
                    .find_map(|k| k.internal_wallet_id)
                    .or(wallet.internal_wallet_id)
                    .ok_or_else(|| WalletError::InvalidKey(format!("Wallet {} has no internal wallet", wallet.id)))?;

                let mut psbt = psbt;
                local.sign(internal_wallet_id, &mut psbt)?;
                psbt
            }
            InternalSigner::Remote(remote) => {
                let returned = remote.sign(&psbt, enforced_sighash(&psbt)).await?;
                let mut merged = psbt;
                merged
                    .combine(returned)
                    .map_err(|e| SigningError::InvalidPsbt(format!("merge remote signature: {}", e)))?;
                merged
            }
        };

        let after = signature_count(&signed);
        if after <= before {
            tracing::error!("Internal signing of wallet {} added no signatures", wallet.id);
            return Err(SigningError::SignatureCountNotIncreased { before, after });
        }

        Ok(signed)
    }

    /// Combines the signer submissions with the template, completes the signature set and
    /// finalizes.
    pub async fn sign_and_finalize(&self, wallet: &Wallet, request: RequestRef) -> Result<FinalizedPsbt, SigningError> {
        let template = self
            .db
            .get_template_psbt(request)?
            .ok_or_else(|| SigningError::MissingTemplate(request.to_string()))?;
        let template = Psbt::from_str(&template.psbt).map_err(|e| SigningError::InvalidPsbt(e.to_string()))?;

        self.complete(wallet, request, template).await
    }

    /// Merges the request's signer submissions into `base`, adds the internal signature and
    /// finalizes. The internally signed and finalized PSBTs are stored on the request.
    pub async fn complete(&self, wallet: &Wallet, request: RequestRef, base: Psbt) -> Result<FinalizedPsbt, SigningError> {
        let rows = self.db.get_request_psbts(request)?;
        let combined = combine(&base, &rows)?;

        let collected = min_input_signatures(&combined);
        let required = required_signer_signatures(wallet);
        if collected < required {
            return Err(SigningError::InsufficientSignatures { collected, required });
        }

        let signed = self.sign_with_internal_wallet(wallet, combined.clone()).await?;
        if signature_count(&signed) > signature_count(&combined) {
            self.db
                .add_request_psbt(&mut RequestPsbt::internal(request, signed.to_string()))?;
        }

        let finalized = finalize(signed)?;
        self.db
            .add_request_psbt(&mut RequestPsbt::finalised(request, finalized.psbt.to_string()))?;

        Ok(finalized)
    }
}
