use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Amount, Transaction, Weight};
use miniscript::psbt::PsbtExt;
use std::collections::HashSet;

use crate::error::SigningError;

// standardness limit for relay
const MAX_STANDARD_TX_WEIGHT: Weight = Weight::from_wu(400_000);

#[derive(Debug, Clone)]
pub struct FinalizedPsbt {
    pub psbt: Psbt,
    pub tx: Transaction,
}

/// Finalizes every input, checks the result and extracts the raw transaction.
pub fn finalize(mut psbt: Psbt) -> Result<FinalizedPsbt, SigningError> {
    let secp = Secp256k1::verification_only();

    psbt.finalize_mut(&secp).map_err(|errors| {
        let reasons: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
        SigningError::SanityCheckFailed(format!("finalize failed: {}", reasons.join("; ")))
    })?;

    sanity_check(&psbt)?;

    let tx = psbt
        .clone()
        .extract_tx()
        .map_err(|e| SigningError::SanityCheckFailed(format!("extract failed: {}", e)))?;

    check_transaction(&tx)?;

    tracing::info!("Finalized transaction {}", tx.compute_txid());
    Ok(FinalizedPsbt { psbt, tx })
}

/// Structural checks on a finalized PSBT.
pub fn sanity_check(psbt: &Psbt) -> Result<(), SigningError> {
    if psbt.inputs.len() != psbt.unsigned_tx.input.len() || psbt.outputs.len() != psbt.unsigned_tx.output.len() {
        return Err(SigningError::SanityCheckFailed(
            "PSBT maps do not match the unsigned transaction".to_string(),
        ));
    }

    for (index, input) in psbt.inputs.iter().enumerate() {
        if input.final_script_sig.is_none() && input.final_script_witness.is_none() {
            return Err(SigningError::SanityCheckFailed(format!("input {} is not finalized", index)));
        }
        if !input.partial_sigs.is_empty() {
            return Err(SigningError::SanityCheckFailed(format!(
                "input {} still carries partial signatures",
                index
            )));
        }
    }

    let fee = psbt
        .fee()
        .map_err(|e| SigningError::SanityCheckFailed(format!("fee: {}", e)))?;
    if fee == Amount::ZERO {
        return Err(SigningError::SanityCheckFailed("transaction pays no fee".to_string()));
    }

    Ok(())
}

/// Context-free transaction checks.
pub fn check_transaction(tx: &Transaction) -> Result<(), SigningError> {
    if tx.input.is_empty() {
        return Err(SigningError::SanityCheckFailed("transaction has no inputs".to_string()));
    }
    if tx.output.is_empty() {
        return Err(SigningError::SanityCheckFailed("transaction has no outputs".to_string()));
    }
    if tx.weight() > MAX_STANDARD_TX_WEIGHT {
        return Err(SigningError::SanityCheckFailed(format!("transaction weight {} too large", tx.weight())));
    }

    let mut seen = HashSet::new();
    for txin in &tx.input {
        if !seen.insert(txin.previous_output) {
            return Err(SigningError::SanityCheckFailed(format!(
                "duplicate input {}",
                txin.previous_output
            )));
        }
    }

    let mut total = Amount::ZERO;
    for (index, output) in tx.output.iter().enumerate() {
        if output.value > Amount::MAX_MONEY {
            return Err(SigningError::SanityCheckFailed(format!("output {} exceeds the money supply", index)));
        }
        if output.value < output.script_pubkey.minimal_non_dust() {
            return Err(SigningError::SanityCheckFailed(format!("output {} is dust", index)));
        }
        total = total
            .checked_add(output.value)
            .filter(|t| *t <= Amount::MAX_MONEY)
            .ok_or_else(|| SigningError::SanityCheckFailed("outputs exceed the money supply".to_string()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;
    use bitcoin::{absolute::LockTime, transaction::Version, OutPoint, ScriptBuf, Sequence, TxIn, TxOut, Witness};

    fn tx(inputs: Vec<OutPoint>, outputs: Vec<u64>) -> Transaction {
        let script = test_utils::external_address(1).script_pubkey();
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs
                .into_iter()
                .map(|previous_output| TxIn {
                    previous_output,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: outputs
                .into_iter()
                .map(|v| TxOut {
                    value: Amount::from_sat(v),
                    script_pubkey: script.clone(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_check_transaction_rejects_malformed() {
        let a = test_utils::outpoint(1, 0);
        let b = test_utils::outpoint(2, 0);

        assert!(check_transaction(&tx(vec![a, b], vec![10_000])).is_ok());
        assert!(check_transaction(&tx(vec![], vec![10_000])).is_err());
        assert!(check_transaction(&tx(vec![a], vec![])).is_err());
        assert!(check_transaction(&tx(vec![a, a], vec![10_000])).is_err());
        assert!(check_transaction(&tx(vec![a], vec![100])).is_err());
    }

    #[test]
    fn test_unsigned_psbt_fails_finalize() {
        let psbt = Psbt::from_unsigned_tx(tx(vec![test_utils::outpoint(1, 0)], vec![10_000])).unwrap();
        assert!(matches!(finalize(psbt), Err(SigningError::SanityCheckFailed(_))));
    }
}
