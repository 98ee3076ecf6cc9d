//! How a call proves where its stake comes from.
//!
//! Native value: the call value is the stake delta and the caller is the
//! owner. Abstract staking: the configured authority reports the owner and the
//! value as trailing arguments, native transfers are disabled and payouts are
//! reported through return data and a log entry instead.

use cosmwasm_std::Uint128;

use crate::config::FundingMode;
use crate::eei::Eei;
use crate::error::ContractError;
use crate::helpers::{decode_biguint, display_key, encode_biguint, require_address};
use crate::msg::{ContractCallInput, LogEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FundingPolicy {
    NativeValue,
    AbstractStaking { authority: Vec<u8> },
}

impl From<&FundingMode> for FundingPolicy {
    fn from(mode: &FundingMode) -> Self {
        match mode {
            FundingMode::NativeValue => FundingPolicy::NativeValue,
            FundingMode::AbstractStaking { authority } => FundingPolicy::AbstractStaking {
                authority: authority.to_vec(),
            },
        }
    }
}

/// Authenticated view of a funding-sensitive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Funded {
    pub owner: Vec<u8>,
    /// Leading arguments with the policy's trailing ones stripped.
    pub args: Vec<Vec<u8>>,
    /// Value reported by the authority: a new total for validator calls, an
    /// amount for delegation calls. `None` under native value.
    pub reported_value: Option<Uint128>,
    pub call_value: Uint128,
}

impl FundingPolicy {
    pub fn transfers_enabled(&self) -> bool {
        matches!(self, FundingPolicy::NativeValue)
    }

    pub fn is_abstract(&self) -> bool {
        !self.transfers_enabled()
    }

    /// Resolves the owner of a call. Under abstract staking the trailing
    /// arguments are `owner` and, when `carries_value`, the reported value.
    pub fn authenticate(
        &self,
        eei: &Eei,
        input: &ContractCallInput,
        carries_value: bool,
    ) -> Result<Funded, ContractError> {
        let caller = input.caller.as_slice();
        let mut args: Vec<Vec<u8>> = input.arguments.iter().map(|a| a.to_vec()).collect();

        match self {
            FundingPolicy::NativeValue => Ok(Funded {
                owner: caller.to_vec(),
                args,
                reported_value: None,
                call_value: input.call_value,
            }),
            FundingPolicy::AbstractStaking { authority } => {
                if !input.call_value.is_zero() {
                    return Err(ContractError::TransferNotAllowed);
                }
                let trailing = if carries_value { 2 } else { 1 };
                if args.len() < trailing {
                    return Err(ContractError::WrongNumberOfArguments {
                        expected: trailing,
                        got: args.len(),
                    });
                }
                let reported_value = if carries_value {
                    let raw = args.pop().unwrap_or_default();
                    Some(decode_biguint(&raw)?)
                } else {
                    None
                };
                let owner = require_address(&args.pop().unwrap_or_default(), "owner")?;

                let from_authority = caller == authority.as_slice();
                let delegation_for_itself = eei.is_delegation_contract(caller) && owner == caller;
                if !from_authority && !delegation_for_itself {
                    return Err(ContractError::unauthorized(format!(
                        "{} can only be called by the abstract staking authority, caller {}",
                        input.function,
                        display_key(caller)
                    )));
                }

                Ok(Funded {
                    owner,
                    args,
                    reported_value,
                    call_value: Uint128::zero(),
                })
            }
        }
    }

    /// Sends `value` from the executing contract to `receiver`.
    pub fn pay_out(
        &self,
        eei: &mut Eei,
        receiver: &[u8],
        value: Uint128,
        identifier: &str,
    ) -> Result<(), ContractError> {
        if value.is_zero() {
            return Ok(());
        }
        let sender = eei.current_address().to_vec();
        match self {
            FundingPolicy::NativeValue => eei.transfer(receiver, &sender, value, identifier.as_bytes()),
            FundingPolicy::AbstractStaking { .. } => {
                eei.finish(encode_biguint(value));
                eei.add_log_entry(
                    LogEntry::new(identifier, &sender)
                        .add_topic(receiver)
                        .add_topic(encode_biguint(value)),
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::StateDb;
    use crate::address::ABSTRACT_STAKING_ADDRESS;
    use crate::contract::{SystemContracts, DELEGATION_CODE};
    use crate::eei::BlockInfo;
    use crate::features::FeatureSet;
    use std::sync::Arc;

    const OWNER: [u8; 32] = [7u8; 32];
    const STRANGER: [u8; 32] = [9u8; 32];

    fn eei_with(state: StateDb) -> Eei {
        Eei::new(
            state,
            Arc::new(SystemContracts::default()),
            BlockInfo::default(),
            FeatureSet::default(),
            1_000,
            false,
        )
    }

    fn abstract_policy() -> FundingPolicy {
        FundingPolicy::AbstractStaking {
            authority: ABSTRACT_STAKING_ADDRESS.to_vec(),
        }
    }

    #[test]
    fn native_value_owner_is_caller() {
        let eei = eei_with(StateDb::new());
        let input = ContractCallInput::new(&OWNER, b"validator", "stake")
            .with_args([b"a".to_vec()])
            .with_value(5u128);
        let funded = FundingPolicy::NativeValue.authenticate(&eei, &input, true).unwrap();
        assert_eq!(funded.owner, OWNER.to_vec());
        assert_eq!(funded.args, vec![b"a".to_vec()]);
        assert_eq!(funded.reported_value, None);
        assert_eq!(funded.call_value, Uint128::new(5));
    }

    #[test]
    fn abstract_staking_strips_trailing_arguments() {
        let eei = eei_with(StateDb::new());
        let input = ContractCallInput::new(&ABSTRACT_STAKING_ADDRESS, b"validator", "stake")
            .with_args([b"a".to_vec(), OWNER.to_vec(), vec![1, 0]]);
        let funded = abstract_policy().authenticate(&eei, &input, true).unwrap();
        assert_eq!(funded.owner, OWNER.to_vec());
        assert_eq!(funded.args, vec![b"a".to_vec()]);
        assert_eq!(funded.reported_value, Some(Uint128::new(256)));
    }

    #[test]
    fn abstract_staking_rejects_other_callers_and_value() {
        let eei = eei_with(StateDb::new());
        let input = ContractCallInput::new(&STRANGER, b"validator", "stake")
            .with_args([OWNER.to_vec(), vec![1]]);
        assert!(matches!(
            abstract_policy().authenticate(&eei, &input, true),
            Err(ContractError::Unauthorized(_))
        ));

        let input = ContractCallInput::new(&ABSTRACT_STAKING_ADDRESS, b"validator", "stake")
            .with_args([OWNER.to_vec(), vec![1]])
            .with_value(1u128);
        assert_eq!(
            abstract_policy().authenticate(&eei, &input, true),
            Err(ContractError::TransferNotAllowed)
        );
    }

    #[test]
    fn delegation_contract_may_act_for_itself() {
        let mut state = StateDb::new();
        state.set_code(&STRANGER, DELEGATION_CODE, &OWNER);
        let eei = eei_with(state);
        let input = ContractCallInput::new(&STRANGER, b"validator", "unBondNodes")
            .with_args([b"k".to_vec(), STRANGER.to_vec()]);
        let funded = abstract_policy().authenticate(&eei, &input, false).unwrap();
        assert_eq!(funded.owner, STRANGER.to_vec());

        let input = ContractCallInput::new(&STRANGER, b"validator", "unBondNodes")
            .with_args([b"k".to_vec(), OWNER.to_vec()]);
        assert!(abstract_policy().authenticate(&eei, &input, false).is_err());
    }
}
