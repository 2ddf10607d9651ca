use bitcoin::{Amount, OutPoint, Txid};
use bitcoin::psbt::Psbt;

use crate::error::ChannelOpenError;
use crate::services::lightning::OpenStatusUpdate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenState {
    /// The open was requested, the daemon has not asked for funding yet.
    AwaitingFunding,
    FundingSubmitted,
    PendingConfirmation { txid: Txid, output_index: u32 },
    Open { txid: Txid, output_index: u32 },
}

impl OpenState {
    pub fn name(&self) -> &'static str {
        match self {
            OpenState::AwaitingFunding => "AwaitingFunding",
            OpenState::FundingSubmitted => "FundingSubmitted",
            OpenState::PendingConfirmation { .. } => "PendingConfirmation",
            OpenState::Open { .. } => "Open",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, OpenState::Open { .. })
    }

    /// Set once the daemon has broadcast the funding transaction.
    pub fn funding_outpoint(&self) -> Option<OutPoint> {
        match self {
            OpenState::PendingConfirmation { txid, output_index } | OpenState::Open { txid, output_index } => {
                Some(OutPoint::new(*txid, *output_index))
            }
            OpenState::AwaitingFunding | OpenState::FundingSubmitted => None,
        }
    }
}

/// Work the driver performs after a transition.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Build, sign and hand back the transaction paying `funding_amount` to `funding_address`.
    FundPsbt {
        funding_address: String,
        funding_amount: Amount,
        psbt: Psbt,
    },
    RecordPending { txid: Txid, output_index: u32 },
    PersistChannel { txid: Txid, output_index: u32 },
}

pub fn transition(state: &OpenState, event: OpenStatusUpdate) -> Result<(OpenState, Vec<SideEffect>), ChannelOpenError> {
    match (state, event) {
        (
            OpenState::AwaitingFunding,
            OpenStatusUpdate::PsbtFund {
                funding_address,
                funding_amount,
                psbt,
            },
        ) => Ok((
            OpenState::FundingSubmitted,
            vec![SideEffect::FundPsbt {
                funding_address,
                funding_amount,
                psbt,
            }],
        )),
        (OpenState::FundingSubmitted, OpenStatusUpdate::ChanPending { txid, output_index }) => Ok((
            OpenState::PendingConfirmation { txid, output_index },
            vec![SideEffect::RecordPending { txid, output_index }],
        )),
        (OpenState::PendingConfirmation { .. }, OpenStatusUpdate::ChanOpen { txid, output_index }) => Ok((
            OpenState::Open { txid, output_index },
            vec![SideEffect::PersistChannel { txid, output_index }],
        )),
        (state, event) => Err(ChannelOpenError::UnexpectedEvent {
            state: state.name().to_string(),
            event: event.name().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils;
    use bitcoin::{absolute::LockTime, transaction::Version, Transaction};

    fn empty_psbt() -> Psbt {
        Psbt::from_unsigned_tx(Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![],
        })
        .unwrap()
    }

    fn fund() -> OpenStatusUpdate {
        OpenStatusUpdate::PsbtFund {
            funding_address: "bcrt1qfunding".to_string(),
            funding_amount: Amount::from_sat(100_000),
            psbt: empty_psbt(),
        }
    }

    fn txid() -> Txid {
        test_utils::outpoint(9, 0).txid
    }

    #[test]
    fn test_happy_path_transitions() {
        let (state, effects) = transition(&OpenState::AwaitingFunding, fund()).unwrap();
        assert_eq!(state, OpenState::FundingSubmitted);
        assert!(matches!(effects.as_slice(), [SideEffect::FundPsbt { funding_amount, .. }] if *funding_amount == Amount::from_sat(100_000)));

        let (state, effects) = transition(
            &state,
            OpenStatusUpdate::ChanPending {
                txid: txid(),
                output_index: 1,
            },
        )
        .unwrap();
        assert_eq!(
            state,
            OpenState::PendingConfirmation {
                txid: txid(),
                output_index: 1
            }
        );
        assert_eq!(
            effects,
            vec![SideEffect::RecordPending {
                txid: txid(),
                output_index: 1
            }]
        );

        let (state, effects) = transition(
            &state,
            OpenStatusUpdate::ChanOpen {
                txid: txid(),
                output_index: 1,
            },
        )
        .unwrap();
        assert!(state.is_open());
        assert_eq!(
            effects,
            vec![SideEffect::PersistChannel {
                txid: txid(),
                output_index: 1
            }]
        );
    }

    #[test]
    fn test_funding_outpoint_known_only_after_broadcast() {
        assert!(OpenState::AwaitingFunding.funding_outpoint().is_none());
        assert!(OpenState::FundingSubmitted.funding_outpoint().is_none());

        let pending = OpenState::PendingConfirmation {
            txid: txid(),
            output_index: 2,
        };
        assert_eq!(pending.funding_outpoint(), Some(OutPoint::new(txid(), 2)));
        let open = OpenState::Open {
            txid: txid(),
            output_index: 2,
        };
        assert_eq!(open.funding_outpoint(), pending.funding_outpoint());
    }

    #[test]
    fn test_out_of_order_events_are_protocol_errors() {
        let pending = OpenStatusUpdate::ChanPending {
            txid: txid(),
            output_index: 0,
        };
        let open = OpenStatusUpdate::ChanOpen {
            txid: txid(),
            output_index: 0,
        };
        let confirming = OpenState::PendingConfirmation {
            txid: txid(),
            output_index: 0,
        };

        let cases = [
            (OpenState::AwaitingFunding, pending.clone()),
            (OpenState::AwaitingFunding, open.clone()),
            (OpenState::FundingSubmitted, fund()),
            (OpenState::FundingSubmitted, open.clone()),
            (confirming.clone(), fund()),
            (confirming, pending.clone()),
            (
                OpenState::Open {
                    txid: txid(),
                    output_index: 0,
                },
                open,
            ),
        ];

        for (state, event) in cases {
            let event_name = event.name();
            match transition(&state, event) {
                Err(ChannelOpenError::UnexpectedEvent { state: s, event: e }) => {
                    assert_eq!(s, state.name());
                    assert_eq!(e, event_name);
                }
                other => panic!("{} + {} should be rejected, got {:?}", state.name(), event_name, other),
            }
        }
    }
}
