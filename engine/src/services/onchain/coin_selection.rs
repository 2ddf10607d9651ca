use bitcoin::{Amount, Transaction};
use miniscript::descriptor::DefiniteDescriptorKey;
use miniscript::Descriptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoinSelectionError, WalletError};
use crate::models::{ChainUtxo, Wallet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CoinSelectionStrategy {
    /// Consume small UTXOs first to limit fragmentation.
    #[default]
    SmallestFirst,
    BiggestFirst,
    /// Prefer UTXOs whose value is closest to the target, keeping change small.
    ClosestToTargetFirst,
    /// Take UTXOs in the order the chain index reports them.
    UpToAmount,
}

impl fmt::Display for CoinSelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoinSelectionStrategy::SmallestFirst => "SmallestFirst",
            CoinSelectionStrategy::BiggestFirst => "BiggestFirst",
            CoinSelectionStrategy::ClosestToTargetFirst => "ClosestToTargetFirst",
            CoinSelectionStrategy::UpToAmount => "UpToAmount",
        };
        f.write_str(name)
    }
}

impl FromStr for CoinSelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "smallestfirst" | "smallest_first" => Ok(CoinSelectionStrategy::SmallestFirst),
            "biggestfirst" | "biggest_first" => Ok(CoinSelectionStrategy::BiggestFirst),
            "closesttotargetfirst" | "closest_to_target_first" => Ok(CoinSelectionStrategy::ClosestToTargetFirst),
            "uptoamount" | "up_to_amount" => Ok(CoinSelectionStrategy::UpToAmount),
            other => Err(format!("Unknown coin selection strategy: {}", other)),
        }
    }
}

/// A UTXO bound to the definite descriptor that spends it.
#[derive(Debug, Clone)]
pub struct Coin {
    pub utxo: ChainUtxo,
    pub descriptor: Descriptor<DefiniteDescriptorKey>,
    /// Full previous transaction, required to sign legacy inputs.
    pub previous_tx: Option<Transaction>,
}

/// Selects UTXOs in strategy order until their sum reaches `target`.
///
/// Never returns a selection that falls short of the target.
pub fn select_utxos(
    available: &[ChainUtxo],
    target: Amount,
    strategy: CoinSelectionStrategy,
) -> Result<Vec<ChainUtxo>, CoinSelectionError> {
    if available.is_empty() {
        return Err(CoinSelectionError::NoUtxosAvailable);
    }

    let total_available: Amount = available.iter().map(|u| u.value()).sum();
    if total_available < target {
        return Err(CoinSelectionError::NotEnoughBalance {
            needed: target,
            available: total_available,
        });
    }

    let mut ordered = available.to_vec();
    match strategy {
        CoinSelectionStrategy::SmallestFirst => {
            ordered.sort_by(|a, b| a.value().cmp(&b.value()).then(a.outpoint.cmp(&b.outpoint)))
        }
        CoinSelectionStrategy::BiggestFirst => {
            ordered.sort_by(|a, b| b.value().cmp(&a.value()).then(a.outpoint.cmp(&b.outpoint)))
        }
        CoinSelectionStrategy::ClosestToTargetFirst => ordered.sort_by(|a, b| {
            let distance_a = a.value().to_sat().abs_diff(target.to_sat());
            let distance_b = b.value().to_sat().abs_diff(target.to_sat());
            distance_a.cmp(&distance_b).then(a.outpoint.cmp(&b.outpoint))
        }),
        CoinSelectionStrategy::UpToAmount => {}
    }

    let mut selected = Vec::new();
    let mut total_selected = Amount::ZERO;

    for utxo in ordered {
        total_selected += utxo.value();
        selected.push(utxo);

        if total_selected >= target {
            break;
        }
    }

    tracing::info!(
        "Selected {} UTXOs totaling {} for target {} using {}",
        selected.len(),
        total_selected,
        target,
        strategy
    );

    Ok(selected)
}

/// Binds each UTXO to the wallet descriptor at its keychain and index.
pub fn select_coins(wallet: &Wallet, utxos: Vec<ChainUtxo>) -> Result<Vec<Coin>, WalletError> {
    let descriptor = wallet.wallet_descriptor()?;

    utxos
        .into_iter()
        .map(|utxo| {
            let definite = descriptor.at(utxo.keychain, utxo.derivation_index)?;
            if definite.script_pubkey() != utxo.txout.script_pubkey {
                return Err(WalletError::Derivation {
                    index: utxo.derivation_index,
                    reason: format!("{} does not belong to wallet {}", utxo.outpoint, wallet.id),
                });
            }

            Ok(Coin {
                utxo,
                descriptor: definite,
                previous_tx: None,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Keychain, WalletAddressType};
    use crate::test_utils;

    fn utxos(values: &[u64]) -> Vec<ChainUtxo> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| test_utils::chain_utxo(i as u8 + 1, Amount::from_sat(*v)))
            .collect()
    }

    fn values(selected: &[ChainUtxo]) -> Vec<u64> {
        selected.iter().map(|u| u.value().to_sat()).collect()
    }

    #[test]
    fn test_smallest_first_accumulates_in_ascending_order() {
        let available = utxos(&[50_000, 30_000, 20_000]);
        let fee = Amount::from_sat(1_000);

        let selected = select_utxos(&available, Amount::from_sat(60_000) + fee, CoinSelectionStrategy::SmallestFirst).unwrap();

        assert_eq!(values(&selected), vec![20_000, 30_000, 50_000]);
    }

    #[test]
    fn test_biggest_first_stops_when_target_met() {
        let available = utxos(&[50_000, 30_000, 20_000]);

        let selected = select_utxos(&available, Amount::from_sat(60_000), CoinSelectionStrategy::BiggestFirst).unwrap();

        assert_eq!(values(&selected), vec![50_000, 30_000]);
    }

    #[test]
    fn test_closest_to_target_prefers_exact_match() {
        let available = utxos(&[50_000, 31_000, 20_000, 100_000]);

        let selected =
            select_utxos(&available, Amount::from_sat(30_000), CoinSelectionStrategy::ClosestToTargetFirst).unwrap();

        assert_eq!(values(&selected), vec![31_000]);
    }

    #[test]
    fn test_up_to_amount_keeps_index_order() {
        let available = utxos(&[30_000, 50_000, 20_000]);

        let selected = select_utxos(&available, Amount::from_sat(70_000), CoinSelectionStrategy::UpToAmount).unwrap();

        assert_eq!(values(&selected), vec![30_000, 50_000]);
    }

    #[test]
    fn test_selection_is_always_sufficient() {
        let available = utxos(&[1_000, 7_500, 12_000, 330, 98_000, 45_000, 546]);
        let total: u64 = values(&available).iter().sum();

        for strategy in [
            CoinSelectionStrategy::SmallestFirst,
            CoinSelectionStrategy::BiggestFirst,
            CoinSelectionStrategy::ClosestToTargetFirst,
            CoinSelectionStrategy::UpToAmount,
        ] {
            for target in (1..=total).step_by(997) {
                let selected = select_utxos(&available, Amount::from_sat(target), strategy).unwrap();
                let sum: u64 = values(&selected).iter().sum();
                assert!(sum >= target, "{} selected {} for {}", strategy, sum, target);
            }

            let err = select_utxos(&available, Amount::from_sat(total + 1), strategy).unwrap_err();
            assert!(matches!(err, CoinSelectionError::NotEnoughBalance { .. }));
        }
    }

    #[test]
    fn test_empty_pool_reports_no_utxos() {
        let err = select_utxos(&[], Amount::from_sat(1), CoinSelectionStrategy::SmallestFirst).unwrap_err();
        assert_eq!(err, CoinSelectionError::NoUtxosAvailable);
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("SmallestFirst".parse::<CoinSelectionStrategy>().unwrap(), CoinSelectionStrategy::SmallestFirst);
        assert_eq!("up_to_amount".parse::<CoinSelectionStrategy>().unwrap(), CoinSelectionStrategy::UpToAmount);
        assert!("random".parse::<CoinSelectionStrategy>().is_err());
    }

    #[test]
    fn test_select_coins_binds_descriptor_and_rejects_foreign_scripts() {
        let wallet = test_utils::multisig_wallet(2, WalletAddressType::NativeSegwit);
        let descriptor = wallet.wallet_descriptor().unwrap();

        let owned = test_utils::wallet_utxo(&descriptor, Keychain::External, 3, Amount::from_sat(10_000), 1);
        let coins = select_coins(&wallet, vec![owned.clone()]).unwrap();
        assert_eq!(coins[0].descriptor.script_pubkey(), owned.txout.script_pubkey);

        let mut foreign = owned;
        foreign.derivation_index = 4;
        assert!(select_coins(&wallet, vec![foreign]).is_err());
    }
}
