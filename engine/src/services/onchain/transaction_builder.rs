use bitcoin::bip32::{ChildNumber, DerivationPath};
use bitcoin::psbt::{Psbt, PsbtSighashType};
use bitcoin::{
    absolute::LockTime, transaction::Version, Address, Amount, EcdsaSighashType, FeeRate, Network, OutPoint,
    ScriptBuf, Sequence, Transaction, TxIn, TxOut, Weight, Witness,
};
use miniscript::psbt::PsbtExt;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use super::coin_selection::{select_coins, select_utxos, Coin, CoinSelectionStrategy};
use super::utxo_manager::UtxoManager;
use crate::error::{CoinSelectionError, TemplateError};
use crate::models::{
    ChainUtxo, Keychain, RequestPsbt, RequestRef, SpendRequest, StatusLogEntry, Wallet, WalletAddressType,
};
use crate::services::chain::ChainIndex;
use crate::storage::DbManager;

pub const MIN_FEE: Amount = Amount::from_sat(160);
pub const DUST_THRESHOLD: Amount = Amount::from_sat(546);

// value (8) + script length (1) + P2WSH script (34), the funding output added by the node
const FUNDING_OUTPUT_WEIGHT: Weight = Weight::from_vb_unchecked(43);

/// What the template pays to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateKind {
    Withdrawal { destinations: Vec<(Address, Amount)> },
    /// The funding output is supplied by the node daemon during the open, so the template
    /// only carries inputs and change.
    ChannelOpen { amount: Amount },
}

impl TemplateKind {
    pub fn sighash(&self) -> EcdsaSighashType {
        match self {
            TemplateKind::Withdrawal { .. } => EcdsaSighashType::All,
            TemplateKind::ChannelOpen { .. } => EcdsaSighashType::None,
        }
    }

    fn send_amount(&self) -> Amount {
        match self {
            TemplateKind::Withdrawal { destinations } => destinations.iter().map(|(_, a)| *a).sum(),
            TemplateKind::ChannelOpen { amount } => *amount,
        }
    }
}

pub struct TemplateRequest<'a> {
    pub request: RequestRef,
    pub wallet: &'a Wallet,
    pub kind: TemplateKind,
    /// Send everything selected with no change output.
    pub spend_all: bool,
    pub fee_rate: FeeRate,
    /// Coin control: restricts selection to these outpoints when non-empty.
    pub selected_outpoints: &'a [OutPoint],
    pub strategy: CoinSelectionStrategy,
    /// Set for a fee bump: the template must spend every input of the replaced transaction.
    pub replacing: Option<Replacement>,
}

/// The transaction a fee bump replaces.
#[derive(Debug, Clone)]
pub struct Replacement {
    /// Owner of the replaced template; its locks do not conflict with the bump.
    pub request: RequestRef,
    pub psbt: Psbt,
}

impl Replacement {
    /// The replaced inputs as wallet UTXOs, including ones the index already reports spent.
    fn inputs(&self) -> Result<Vec<ChainUtxo>, TemplateError> {
        self.psbt
            .unsigned_tx
            .input
            .iter()
            .zip(self.psbt.inputs.iter())
            .map(|(txin, input)| {
                let outpoint = txin.previous_output;
                let txout = input
                    .witness_utxo
                    .clone()
                    .or_else(|| {
                        input
                            .non_witness_utxo
                            .as_ref()
                            .and_then(|tx| tx.output.get(outpoint.vout as usize).cloned())
                    })
                    .ok_or_else(|| TemplateError::Psbt(format!("replaced input {} has no UTXO data", outpoint)))?;
                let (keychain, derivation_index) = input
                    .bip32_derivation
                    .values()
                    .find_map(|(_, path)| keychain_position(path))
                    .ok_or_else(|| {
                        TemplateError::Psbt(format!("replaced input {} has no wallet derivation", outpoint))
                    })?;

                Ok(ChainUtxo {
                    outpoint,
                    txout,
                    keychain,
                    derivation_index,
                    confirmations: 0,
                })
            })
            .collect()
    }

    fn fee(&self) -> Result<Amount, TemplateError> {
        let outputs: Amount = self.psbt.unsigned_tx.output.iter().map(|o| o.value).sum();
        checked_sub(input_value(&self.psbt)?, outputs)
    }
}

/// Keychain and index from the last two steps of a wallet derivation path.
fn keychain_position(path: &DerivationPath) -> Option<(Keychain, u32)> {
    match path.as_ref() {
        [.., ChildNumber::Normal { index: keychain }, ChildNumber::Normal { index }] => {
            let keychain = match *keychain {
                0 => Keychain::External,
                1 => Keychain::Internal,
                _ => return None,
            };
            Some((keychain, *index))
        }
        _ => None,
    }
}

/// A replacement pays more than the replaced transaction in total and per weight unit, and
/// covers its own relay at the minimum rate on top.
fn check_replacement_fee(
    original_fee: Amount,
    original_weight: Weight,
    fee: Amount,
    weight: Weight,
) -> Result<(), TemplateError> {
    let relay = FeeRate::BROADCAST_MIN
        .fee_wu(weight)
        .ok_or_else(|| TemplateError::Psbt(format!("Fee overflow for weight {}", weight)))?;
    let higher_rate = u128::from(fee.to_sat()) * u128::from(original_weight.to_wu())
        > u128::from(original_fee.to_sat()) * u128::from(weight.to_wu());

    if fee < original_fee + relay || !higher_rate {
        return Err(TemplateError::InvalidRequest(format!(
            "Replacement fee {} ({} wu) must exceed the replaced fee {} ({} wu) by at least {} at a higher rate",
            fee,
            weight.to_wu(),
            original_fee,
            original_weight.to_wu(),
            relay
        )));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Template {
    pub psbt: Psbt,
    pub total_in: Amount,
    pub fee: Amount,
    pub change: Option<Amount>,
    /// Amount paid to destinations, or committed to the channel.
    pub send_amount: Amount,
}

impl Template {
    /// Rebuilds the accounting of a stored template.
    pub fn from_psbt(psbt: Psbt, kind: &TemplateKind) -> Result<Self, TemplateError> {
        let total_in = input_value(&psbt)?;
        let change = change_value(&psbt);

        let (send_amount, fee) = match kind {
            TemplateKind::Withdrawal { .. } => {
                let outputs: Amount = psbt.unsigned_tx.output.iter().map(|o| o.value).sum();
                let change_total = change.unwrap_or(Amount::ZERO);
                (outputs - change_total, checked_sub(total_in, outputs)?)
            }
            TemplateKind::ChannelOpen { amount } => {
                let change_total = change.unwrap_or(Amount::ZERO);
                (*amount, checked_sub(checked_sub(total_in, *amount)?, change_total)?)
            }
        };

        Ok(Self {
            psbt,
            total_in,
            fee,
            change,
            send_amount,
        })
    }
}

#[derive(Debug, Clone)]
pub enum TemplateOutcome {
    Created(Template),
    Reused(Template),
    /// The chain index is behind; retry later.
    NotFullySynced,
}

impl TemplateOutcome {
    pub fn template(&self) -> Option<&Template> {
        match self {
            TemplateOutcome::Created(t) | TemplateOutcome::Reused(t) => Some(t),
            TemplateOutcome::NotFullySynced => None,
        }
    }
}

fn checked_sub(a: Amount, b: Amount) -> Result<Amount, TemplateError> {
    a.checked_sub(b)
        .ok_or_else(|| TemplateError::Psbt(format!("outputs {} exceed inputs {}", b, a)))
}

/// Sum of the spent outputs recorded in the PSBT inputs.
pub fn input_value(psbt: &Psbt) -> Result<Amount, TemplateError> {
    psbt.unsigned_tx
        .input
        .iter()
        .zip(psbt.inputs.iter())
        .map(|(txin, input)| {
            if let Some(utxo) = &input.witness_utxo {
                return Ok(utxo.value);
            }
            input
                .non_witness_utxo
                .as_ref()
                .and_then(|tx| tx.output.get(txin.previous_output.vout as usize))
                .map(|o| o.value)
                .ok_or_else(|| TemplateError::Psbt(format!("input {} has no UTXO data", txin.previous_output)))
        })
        .sum()
}

/// Outputs carrying wallet derivation data are change.
pub fn change_value(psbt: &Psbt) -> Option<Amount> {
    psbt.unsigned_tx
        .output
        .iter()
        .zip(psbt.outputs.iter())
        .filter(|(_, meta)| !meta.bip32_derivation.is_empty())
        .map(|(o, _)| o.value)
        .reduce(|a, b| a + b)
}

fn unsigned_tx(inputs: &[OutPoint], outputs: Vec<TxOut>) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|outpoint| TxIn {
                previous_output: *outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs,
    }
}

/// Weight of `tx` once every input carries its largest satisfaction.
fn estimate_weight(tx: &Transaction, coins: &[Coin], extra: Weight, segwit: bool) -> Result<Weight, TemplateError> {
    let mut weight = tx.weight() + extra;
    if segwit {
        // marker and flag
        weight += Weight::from_wu(2);
    }
    for coin in coins {
        weight += coin
            .descriptor
            .max_weight_to_satisfy()
            .map_err(|e| TemplateError::Psbt(format!("Unsatisfiable descriptor: {}", e)))?;
    }
    Ok(weight)
}

fn estimate_fee(
    tx: &Transaction,
    coins: &[Coin],
    extra: Weight,
    segwit: bool,
    fee_rate: FeeRate,
) -> Result<Amount, TemplateError> {
    let weight = estimate_weight(tx, coins, extra, segwit)?;
    let fee = fee_rate
        .fee_wu(weight)
        .ok_or_else(|| TemplateError::Psbt(format!("Fee overflow for weight {}", weight)))?;

    if fee < MIN_FEE {
        tracing::debug!("Increasing fee from {} to {} to meet minimum relay fee", fee, MIN_FEE);
        return Ok(MIN_FEE);
    }
    Ok(fee)
}

/// `required` plus whatever `strategy` picks from `candidates` to reach `target`.
fn select_with_required(
    required: &[ChainUtxo],
    candidates: &[ChainUtxo],
    target: Amount,
    strategy: CoinSelectionStrategy,
) -> Result<Vec<ChainUtxo>, CoinSelectionError> {
    let required_total: Amount = required.iter().map(|u| u.value()).sum();
    if !required.is_empty() && required_total >= target {
        return Ok(required.to_vec());
    }

    let mut selected = required.to_vec();
    selected.extend(select_utxos(candidates, target - required_total, strategy)?);
    Ok(selected)
}

/// Records a template failure on the request.
///
/// Staleness is terminal; running out of funds leaves the request as it was.
pub fn record_template_error<R: SpendRequest>(request: &mut R, err: &TemplateError) {
    match err {
        TemplateError::StaleTemplate(reason) => {
            request.fail(format!("Template PSBT is stale: {}", reason));
        }
        TemplateError::Selection(e) => {
            request.log(StatusLogEntry::warning(format!("Could not build template PSBT: {}", e)));
        }
        other => {
            request.log(StatusLogEntry::error(format!("Could not build template PSBT: {}", other)));
        }
    }
}

/// Builds, reuses and persists template PSBTs.
pub struct TransactionBuilder {
    db: Arc<DbManager>,
    chain: Arc<dyn ChainIndex>,
    utxo_manager: Arc<UtxoManager>,
    network: Network,
}

impl TransactionBuilder {
    pub fn new(db: Arc<DbManager>, chain: Arc<dyn ChainIndex>, utxo_manager: Arc<UtxoManager>, network: Network) -> Self {
        Self {
            db,
            chain,
            utxo_manager,
            network,
        }
    }

    pub async fn build_template(&self, req: TemplateRequest<'_>) -> Result<TemplateOutcome, TemplateError> {
        if !self.chain.is_fully_synced().await? {
            tracing::warn!("Chain index not fully synced, skipping template for {}", req.request);
            return Ok(TemplateOutcome::NotFullySynced);
        }

        let utxos = self.utxo_manager.get_wallet_utxos(req.wallet).await?;

        if let Some(existing) = self.db.get_template_psbt(req.request)? {
            return self.reuse_template(&req, &existing, &utxos.confirmed).map(TemplateOutcome::Reused);
        }

        if let Some(replacement) = &req.replacing {
            tracing::info!("Building replacement of {} for {}", replacement.request, req.request);
        }

        let template = self.create_template(&req, &utxos.confirmed).await?;
        Ok(TemplateOutcome::Created(template))
    }

    fn reuse_template(
        &self,
        req: &TemplateRequest<'_>,
        existing: &RequestPsbt,
        confirmed: &[ChainUtxo],
    ) -> Result<Template, TemplateError> {
        let psbt = Psbt::from_str(&existing.psbt)
            .map_err(|e| TemplateError::Psbt(format!("Stored template for {} is invalid: {}", req.request, e)))?;

        // a replacement may spend inputs its predecessor already spent in the mempool
        let mut spendable: HashSet<OutPoint> = confirmed.iter().map(|u| u.outpoint).collect();
        if let Some(replacement) = &req.replacing {
            spendable.extend(replacement.psbt.unsigned_tx.input.iter().map(|txin| txin.previous_output));
        }
        if let Some(missing) = psbt
            .unsigned_tx
            .input
            .iter()
            .find(|txin| !spendable.contains(&txin.previous_output))
        {
            tracing::error!(
                "Template input {} for {} is no longer a confirmed UTXO",
                missing.previous_output,
                req.request
            );
            return Err(TemplateError::StaleTemplate(format!(
                "input {} is no longer available",
                missing.previous_output
            )));
        }

        if let TemplateKind::Withdrawal { destinations } = &req.kind {
            let paid: Vec<TxOut> = psbt
                .unsigned_tx
                .output
                .iter()
                .zip(psbt.outputs.iter())
                .filter(|(_, meta)| meta.bip32_derivation.is_empty())
                .map(|(o, _)| o.clone())
                .collect();
            let expected: Vec<TxOut> = destinations
                .iter()
                .map(|(address, amount)| TxOut {
                    value: *amount,
                    script_pubkey: address.script_pubkey(),
                })
                .collect();

            if paid != expected {
                tracing::error!("Template outputs for {} no longer match its destinations", req.request);
                return Err(TemplateError::StaleTemplate(
                    "outputs no longer match the request destinations".to_string(),
                ));
            }
        }

        tracing::info!("Reusing template PSBT for {}", req.request);
        Template::from_psbt(psbt, &req.kind)
    }

    fn candidates(&self, req: &TemplateRequest<'_>, confirmed: &[ChainUtxo]) -> Result<Vec<ChainUtxo>, TemplateError> {
        let mut exclude = vec![req.request];
        exclude.extend(req.replacing.as_ref().map(|r| r.request));

        let available = self.utxo_manager.available_from(confirmed, &exclude)?;
        if req.selected_outpoints.is_empty() {
            return Ok(available);
        }

        req.selected_outpoints
            .iter()
            .map(|outpoint| {
                available
                    .iter()
                    .find(|u| u.outpoint == *outpoint)
                    .cloned()
                    .ok_or(TemplateError::Selection(CoinSelectionError::UnavailableOutpoint(*outpoint)))
            })
            .collect()
    }

    async fn create_template(&self, req: &TemplateRequest<'_>, confirmed: &[ChainUtxo]) -> Result<Template, TemplateError> {
        let wallet = req.wallet;
        let descriptor = wallet.wallet_descriptor()?;
        let segwit = wallet.address_type != WalletAddressType::Legacy;
        let coin_control = !req.selected_outpoints.is_empty();

        let required = match &req.replacing {
            Some(replacement) => replacement.inputs()?,
            None => Vec::new(),
        };
        let required_outpoints: HashSet<OutPoint> = required.iter().map(|u| u.outpoint).collect();

        let candidates: Vec<ChainUtxo> = self
            .candidates(req, confirmed)?
            .into_iter()
            .filter(|u| !required_outpoints.contains(&u.outpoint))
            .collect();
        if candidates.is_empty() && required.is_empty() {
            return Err(CoinSelectionError::NoUtxosAvailable.into());
        }

        let extra = match req.kind {
            TemplateKind::ChannelOpen { .. } => FUNDING_OUTPUT_WEIGHT,
            TemplateKind::Withdrawal { .. } => Weight::ZERO,
        };

        let destination_outputs = |amounts: &[(Address, Amount)]| -> Vec<TxOut> {
            amounts
                .iter()
                .map(|(address, amount)| TxOut {
                    value: *amount,
                    script_pubkey: address.script_pubkey(),
                })
                .collect()
        };

        let (coins, outputs, change, fee, send_amount) = if req.spend_all {
            let coins = select_coins(wallet, required.iter().cloned().chain(candidates).collect())?;
            let total_in: Amount = coins.iter().map(|c| c.utxo.value()).sum();
            let outpoints: Vec<OutPoint> = coins.iter().map(|c| c.utxo.outpoint).collect();

            let destinations = match &req.kind {
                TemplateKind::Withdrawal { destinations } if destinations.len() == 1 => destinations.clone(),
                TemplateKind::Withdrawal { .. } => {
                    return Err(TemplateError::InvalidRequest(
                        "Withdrawing all funds requires exactly one destination".to_string(),
                    ))
                }
                TemplateKind::ChannelOpen { .. } => Vec::new(),
            };

            let sizing = unsigned_tx(&outpoints, destination_outputs(&destinations));
            let fee = estimate_fee(&sizing, &coins, extra, segwit, req.fee_rate)?;

            let spendable = total_in
                .checked_sub(fee)
                .filter(|s| *s >= DUST_THRESHOLD)
                .ok_or(CoinSelectionError::NotEnoughRoomInUtxosForFees {
                    needed: fee + DUST_THRESHOLD,
                    available: total_in,
                })?;

            let outputs = destinations
                .iter()
                .map(|(address, _)| TxOut {
                    value: spendable,
                    script_pubkey: address.script_pubkey(),
                })
                .collect();

            (coins, outputs, None, fee, spendable)
        } else {
            let send_amount = req.kind.send_amount();
            let destinations = match &req.kind {
                TemplateKind::Withdrawal { destinations } => destinations.clone(),
                TemplateKind::ChannelOpen { .. } => Vec::new(),
            };

            let change_address = self.chain.get_unused_address(&descriptor, Keychain::Internal).await?;
            let mut with_change = destination_outputs(&destinations);
            with_change.push(TxOut {
                value: Amount::ZERO,
                script_pubkey: change_address.address.script_pubkey(),
            });

            let total_available: Amount = required.iter().chain(candidates.iter()).map(|u| u.value()).sum();
            if total_available < send_amount {
                return Err(CoinSelectionError::NotEnoughBalance {
                    needed: send_amount,
                    available: total_available,
                }
                .into());
            }

            // grow the selection until it also covers the fee of its own inputs
            let mut fee_guess = Amount::ZERO;
            let (selected, fee) = loop {
                let target = send_amount + fee_guess;
                let selected = if coin_control {
                    required.iter().cloned().chain(candidates.iter().cloned()).collect()
                } else {
                    select_with_required(&required, &candidates, target, req.strategy).map_err(|e| match e {
                        CoinSelectionError::NotEnoughBalance { needed, available } => {
                            CoinSelectionError::NotEnoughRoomInUtxosForFees { needed, available }
                        }
                        other => other,
                    })?
                };

                let coins = select_coins(wallet, selected.clone())?;
                let outpoints: Vec<OutPoint> = selected.iter().map(|u| u.outpoint).collect();
                let fee = estimate_fee(&unsigned_tx(&outpoints, with_change.clone()), &coins, extra, segwit, req.fee_rate)?;

                let total_in: Amount = selected.iter().map(|u| u.value()).sum();
                if total_in >= send_amount + fee {
                    break (coins, fee);
                }
                if coin_control || fee <= fee_guess {
                    return Err(CoinSelectionError::NotEnoughRoomInUtxosForFees {
                        needed: send_amount + fee,
                        available: total_in,
                    }
                    .into());
                }
                fee_guess = fee;
            };

            let total_in: Amount = selected.iter().map(|c| c.utxo.value()).sum();
            let remainder = total_in - send_amount - fee;

            let mut outputs = destination_outputs(&destinations);
            let (change, fee) = if remainder >= DUST_THRESHOLD {
                outputs.push(TxOut {
                    value: remainder,
                    script_pubkey: change_address.address.script_pubkey(),
                });
                (Some((change_address, remainder)), fee)
            } else {
                // dust change goes to the fee
                (None, fee + remainder)
            };

            (selected, outputs, change, fee, send_amount)
        };

        let outpoints: Vec<OutPoint> = coins.iter().map(|c| c.utxo.outpoint).collect();

        if let Some(replacement) = &req.replacing {
            let replaced_coins = select_coins(wallet, required.clone())?;
            let replaced_weight = estimate_weight(&replacement.psbt.unsigned_tx, &replaced_coins, extra, segwit)?;
            let weight = estimate_weight(&unsigned_tx(&outpoints, outputs.clone()), &coins, extra, segwit)?;
            check_replacement_fee(replacement.fee()?, replaced_weight, fee, weight)?;
        }

        let mut psbt = Psbt::from_unsigned_tx(unsigned_tx(&outpoints, outputs))
            .map_err(|e| TemplateError::Psbt(e.to_string()))?;

        let sighash = PsbtSighashType::from(req.kind.sighash());
        for (index, coin) in coins.iter().enumerate() {
            if segwit {
                psbt.inputs[index].witness_utxo = Some(coin.utxo.txout.clone());
            } else {
                let previous = self
                    .chain
                    .get_raw_transaction(&coin.utxo.outpoint.txid)
                    .await?
                    .ok_or_else(|| TemplateError::Psbt(format!("Previous transaction of {} not found", coin.utxo.outpoint)))?;
                psbt.inputs[index].non_witness_utxo = Some(previous);
            }

            psbt.update_input_with_descriptor(index, &coin.descriptor)
                .map_err(|e| TemplateError::Psbt(format!("input {}: {:?}", index, e)))?;
            psbt.inputs[index].sighash_type = Some(sighash);
        }

        if let Some((change_address, _)) = &change {
            let change_index = psbt.unsigned_tx.output.len() - 1;
            let change_descriptor = descriptor.at(Keychain::Internal, change_address.index)?;
            psbt.update_output_with_descriptor(change_index, &change_descriptor)
                .map_err(|e| TemplateError::Psbt(format!("change output: {:?}", e)))?;
        }

        for key in &wallet.keys {
            psbt.xpub.insert(key.parsed_xpub()?, key.origin()?);
        }

        let total_in: Amount = coins.iter().map(|c| c.utxo.value()).sum();
        let locked: Vec<ChainUtxo> = coins.iter().map(|c| c.utxo.clone()).collect();

        let compatible: Vec<RequestRef> = req.replacing.iter().map(|r| r.request).collect();
        self.utxo_manager.lock(req.request, wallet, &locked, &compatible)?;

        let mut row = RequestPsbt::template(req.request, psbt.to_string());
        if let Err(e) = self.db.add_request_psbt(&mut row) {
            // locks stay; the next run rebuilds against the same reservation
            tracing::error!("Failed to persist template PSBT for {}: {}", req.request, e);
        }

        tracing::info!(
            "Created template PSBT for {} with {} inputs, fee {} on {}",
            req.request,
            coins.len(),
            fee,
            self.network
        );

        Ok(Template {
            psbt,
            total_in,
            fee,
            change: change.map(|(_, amount)| amount),
            send_amount,
        })
    }
}
