//! Per-owner aggregate of stake across BLS keys.
//!
//! Every funding-sensitive entry point first runs the configured
//! `FundingPolicy`, then drives the same state machine: the owner's
//! `ValidatorData` here, per-key registration through nested calls into the
//! staking contract.

use cosmwasm_std::{to_json_vec, Uint128};
use cw2::set_contract_version;
use std::sync::Arc;
use tracing::{debug, info};

use crate::address::{
    is_smart_contract_address, DELEGATION_MANAGER_SC_ADDRESS, END_OF_EPOCH_ADDRESS,
    STAKING_SC_ADDRESS,
};
use crate::config::{GasCost, StakingSystemScConfig, ValidatorSystemScConfig};
use crate::contract::{validate_caller, SystemSmartContract};
use crate::eei::Eei;
use crate::error::ContractError;
use crate::funding::{Funded, FundingPolicy};
use crate::helpers::{
    decode_biguint, decode_u64, display_key, encode_biguint, encode_u64, has_duplicates,
    require_address, require_num_args,
};
use crate::msg::{ContractCallInput, LogEntry, NestedOutput};
use crate::state::{
    KeyStatus, UnstakedValue, ValidatorConfig, ValidatorData, STAKED_DATA,
    UNSTAKE_UNBOND_PAUSED, VALIDATORS, VALIDATOR_CONFIG,
};

const CONTRACT_NAME: &str = "crates.io:staking-system-sc-validator";
const CONTRACT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const NUMBER_OF_NODES_TOO_HIGH: &str = "numberOfNodesTooHigh";
pub const NO_TOKENS_TO_UNBOND: &str = "no tokens that can be unbond at this time";

/// Proof that the staker controls a BLS key. The signed message is the owner
/// address.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), ContractError>;
}

/// Accepts every signature. BLS key ownership is checked outside this crate.
#[derive(Debug, Default)]
pub struct SkipSignatureCheck;

impl SignatureVerifier for SkipSignatureCheck {
    fn verify(&self, _public_key: &[u8], _message: &[u8], _signature: &[u8]) -> Result<(), ContractError> {
        Ok(())
    }
}

pub struct ValidatorContract {
    gas_cost: GasCost,
    staking_config: StakingSystemScConfig,
    initial_config: ValidatorSystemScConfig,
    funding: FundingPolicy,
    signature_verifier: Arc<dyn SignatureVerifier>,
}

impl ValidatorContract {
    pub fn new(
        gas_cost: GasCost,
        staking_config: StakingSystemScConfig,
        initial_config: ValidatorSystemScConfig,
        funding: FundingPolicy,
        signature_verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            gas_cost,
            staking_config,
            initial_config,
            funding,
            signature_verifier,
        }
    }

    fn init(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        if VALIDATOR_CONFIG.may_load(&eei.storage_read())?.is_some() {
            return Err(ContractError::AlreadyInitialized);
        }
        set_contract_version(&mut eei.storage(), CONTRACT_NAME, CONTRACT_VERSION)?;
        let config = ValidatorConfig {
            node_price: self.initial_config.node_price,
            min_deposit: self.initial_config.min_deposit,
            unjail_price: self.initial_config.unjail_price,
            owner: input.caller.clone(),
        };
        VALIDATOR_CONFIG.save(&mut eei.storage(), &config)?;
        UNSTAKE_UNBOND_PAUSED.save(&mut eei.storage(), &false)?;
        Ok(())
    }

    fn load_config(eei: &Eei) -> Result<ValidatorConfig, ContractError> {
        VALIDATOR_CONFIG
            .may_load(&eei.storage_read())?
            .ok_or_else(|| ContractError::invalid_state("validator contract is not initialized"))
    }

    fn load_validator(eei: &Eei, owner: &[u8]) -> Result<ValidatorData, ContractError> {
        VALIDATORS
            .may_load(&eei.storage_read(), owner)?
            .ok_or(ContractError::ValidatorNotFound)
    }

    /// Writes the owner's record back, deleting it once nothing is left.
    fn save_validator(eei: &mut Eei, owner: &[u8], data: &ValidatorData) -> Result<(), ContractError> {
        if data.is_empty() {
            VALIDATORS.remove(&mut eei.storage(), owner);
        } else {
            VALIDATORS.save(&mut eei.storage(), owner, data)?;
        }
        Ok(())
    }

    fn check_not_paused(eei: &Eei) -> Result<(), ContractError> {
        if UNSTAKE_UNBOND_PAUSED.may_load(&eei.storage_read())?.unwrap_or(false) {
            return Err(ContractError::UnStakeUnBondPaused);
        }
        Ok(())
    }

    /// One unit of `cost`, then one more for each key past the first.
    fn use_gas_per_key(eei: &mut Eei, cost: u64, num_keys: usize) -> Result<(), ContractError> {
        eei.use_gas(cost)?;
        if num_keys > 1 {
            eei.use_gas(cost.saturating_mul(num_keys as u64 - 1))?;
        }
        Ok(())
    }

    fn key_status(eei: &Eei, key: &[u8]) -> Result<Option<KeyStatus>, ContractError> {
        Ok(STAKED_DATA
            .may_load(&eei.storage_of(&STAKING_SC_ADDRESS), key)?
            .map(|d| d.status()))
    }

    fn call_staking(eei: &mut Eei, function: &str, args: &[Vec<u8>]) -> Result<NestedOutput, ContractError> {
        let sender = eei.current_address().to_vec();
        eei.execute_on_dest_context(&STAKING_SC_ADDRESS, &sender, Uint128::zero(), function, args)
    }

    fn call_staking_checked(eei: &mut Eei, function: &str, args: &[Vec<u8>]) -> Result<NestedOutput, ContractError> {
        let output = Self::call_staking(eei, function, args)?;
        if !output.is_ok() {
            return Err(ContractError::NestedCallFailed {
                function: function.to_string(),
                address: display_key(&STAKING_SC_ADDRESS),
                message: output.return_message,
            });
        }
        Ok(output)
    }

    fn check_key_length(&self, key: &[u8]) -> Result<(), ContractError> {
        let valid = match self.initial_config.bls_key_length {
            Some(len) => key.len() == len,
            None => !key.is_empty(),
        };
        if !valid {
            return Err(ContractError::invalid_args(format!(
                "invalid bls key length {} for key {}",
                key.len(),
                display_key(key)
            )));
        }
        Ok(())
    }

    fn require_owned_keys(data: &ValidatorData, keys: &[Vec<u8>]) -> Result<(), ContractError> {
        match keys.iter().find(|k| !data.has_key(k)) {
            Some(key) => Err(ContractError::invalid_args(format!(
                "bls key {} is not registered by this owner",
                display_key(key)
            ))),
            None => Ok(()),
        }
    }

    fn relock(data: &mut ValidatorData, node_price: Uint128) -> Result<(), ContractError> {
        data.num_registered = data.bls_pub_keys.len() as u32;
        data.locked_stake = node_price.checked_mul(Uint128::from(data.num_registered))?;
        Ok(())
    }

    fn push_unstaked(data: &mut ValidatorData, epoch: u32, value: Uint128) -> Result<(), ContractError> {
        data.unstaked_info.push(UnstakedValue {
            unstaked_epoch: epoch,
            unstaked_value: value,
        });
        data.total_unstaked = data.total_unstaked.checked_add(value)?;
        Ok(())
    }

    fn stake(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.stake)?;
        let Funded {
            owner,
            args,
            reported_value,
            call_value,
        } = self.funding.authenticate(eei, input, true)?;
        let config = Self::load_config(eei)?;
        let features = eei.features();
        let block = eei.block();

        let num_nodes = match args.first() {
            Some(raw) => usize::try_from(decode_u64(raw)?).unwrap_or(usize::MAX),
            None => 0,
        };
        let key_args = match num_nodes.checked_mul(2).and_then(|n| n.checked_add(1)) {
            Some(n) if num_nodes <= args.len() => n,
            _ => {
                return Err(ContractError::WrongNumberOfArguments {
                    expected: num_nodes.saturating_mul(2).saturating_add(1),
                    got: args.len(),
                })
            }
        };
        let reward = if args.is_empty() {
            None
        } else if args.len() == key_args {
            None
        } else if args.len() == key_args + 1 && !self.funding.is_abstract() {
            Some(require_address(&args[key_args], "reward")?)
        } else {
            return Err(ContractError::WrongNumberOfArguments {
                expected: key_args,
                got: args.len(),
            });
        };
        if num_nodes > 1 {
            eei.use_gas(self.gas_cost.stake.saturating_mul(num_nodes as u64 - 1))?;
        }

        let pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..num_nodes)
            .map(|i| (args[1 + 2 * i].clone(), args[2 + 2 * i].clone()))
            .collect();
        let keys: Vec<Vec<u8>> = pairs.iter().map(|(k, _)| k.clone()).collect();
        for key in keys.iter() {
            self.check_key_length(key)?;
        }
        if features.double_key_protection && has_duplicates(&keys) {
            return Err(ContractError::invalid_args("invalid arguments, found same bls key twice"));
        }

        let mut data = match VALIDATORS.may_load(&eei.storage_read(), &owner)? {
            Some(data) => data,
            None => ValidatorData::new(&owner, block.nonce, block.epoch),
        };
        if let Some(reward) = &reward {
            data.reward_address = reward.as_slice().into();
        }

        let new_total = match reported_value {
            Some(total) => {
                if total < data.total_stake_value {
                    return Err(ContractError::invalid_args(format!(
                        "stake can not decrease total stake value: current {}, got {total}",
                        data.total_stake_value
                    )));
                }
                total
            }
            None => data.total_stake_value.checked_add(call_value)?,
        };
        if !is_smart_contract_address(&owner) && new_total < config.node_price {
            return Err(ContractError::InsufficientStakeValue {
                expected: config.node_price,
                got: new_total,
            });
        }

        let mut new_keys: Vec<&(Vec<u8>, Vec<u8>)> = vec![];
        for pair in pairs.iter() {
            if !data.has_key(&pair.0) && !new_keys.iter().any(|p| p.0 == pair.0) {
                new_keys.push(pair);
            }
        }
        for (key, signature) in new_keys.iter().map(|p| (&p.0, &p.1)) {
            self.signature_verifier.verify(key, &owner, signature)?;
        }

        let num_qualified = (new_total / config.node_price).u128();
        let wanted = data.bls_pub_keys.len() as u128 + new_keys.len() as u128;
        let mut to_activate = new_keys.len();
        if wanted > num_qualified {
            if !features.staking_v2 {
                return Err(ContractError::OutOfFunds(format!(
                    "not enough stake to register {wanted} nodes, stake covers {num_qualified}"
                )));
            }
            to_activate = num_qualified.saturating_sub(data.bls_pub_keys.len() as u128) as usize;
        }

        let stake_value = encode_biguint(config.node_price);
        for (key, _) in new_keys.iter().take(to_activate).map(|p| (&p.0, &p.1)) {
            Self::call_staking_checked(
                eei,
                "register",
                &[key.clone(), data.reward_address.to_vec(), owner.clone(), stake_value.clone()],
            )?;
            data.bls_pub_keys.push(key.as_slice().into());
        }

        data.total_stake_value = new_total;
        data.max_stake_per_node = config.node_price;
        Self::relock(&mut data, config.node_price)?;

        if to_activate < new_keys.len() {
            let address = eei.current_address().to_vec();
            eei.add_log_entry(
                LogEntry::new("stake", &address)
                    .add_topic(NUMBER_OF_NODES_TOO_HIGH)
                    .add_topic(encode_u64(u64::from(data.num_registered)))
                    .add_topic(encode_biguint(Uint128::new(num_qualified))),
            );
        }
        debug!(
            owner = %display_key(&owner),
            total = %data.total_stake_value,
            registered = data.num_registered,
            "stake"
        );
        Self::save_validator(eei, &owner, &data)
    }

    fn unstake_nodes(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        Self::check_not_paused(eei)?;
        let Funded {
            owner,
            args: keys,
            reported_value,
            ..
        } = self.funding.authenticate(eei, input, true)?;
        if keys.is_empty() {
            return Err(ContractError::WrongNumberOfArguments { expected: 1, got: 0 });
        }
        Self::use_gas_per_key(eei, self.gas_cost.unstake, keys.len())?;
        let config = Self::load_config(eei)?;
        let mut data = Self::load_validator(eei, &owner)?;
        Self::require_owned_keys(&data, &keys)?;

        for key in keys.iter() {
            Self::call_staking_checked(eei, "unStake", &[key.clone(), owner.clone()])?;
        }

        if let Some(new_total) = reported_value {
            if new_total > data.total_stake_value {
                return Err(ContractError::invalid_args(format!(
                    "unStake can not increase total stake value: current {}, got {new_total}",
                    data.total_stake_value
                )));
            }
            if new_total < data.locked_stake {
                return Err(ContractError::invalid_state(format!(
                    "not enough stake left for the registered nodes: locked {}, remaining {new_total}",
                    data.locked_stake
                )));
            }
            let released = data.total_stake_value - new_total;
            if !released.is_zero() {
                Self::push_unstaked(&mut data, eei.block().epoch, released)?;
                data.total_stake_value = new_total;
            }
        }
        Self::relock(&mut data, config.node_price)?;
        Self::save_validator(eei, &owner, &data)
    }

    fn unstake_tokens(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        Self::check_not_paused(eei)?;
        eei.use_gas(self.gas_cost.unstake)?;
        let Funded {
            owner,
            args,
            reported_value,
            ..
        } = self.funding.authenticate(eei, input, true)?;
        let config = Self::load_config(eei)?;
        let mut data = Self::load_validator(eei, &owner)?;

        let new_total = match reported_value {
            Some(total) => {
                require_num_args(&args, 0)?;
                total
            }
            None => {
                require_num_args(&args, 1)?;
                let value = decode_biguint(&args[0])?;
                data.total_stake_value.checked_sub(value).map_err(|_| {
                    ContractError::invalid_args(format!(
                        "cannot unStake {value}, total stake is {}",
                        data.total_stake_value
                    ))
                })?
            }
        };
        if new_total >= data.total_stake_value {
            return Err(ContractError::invalid_args("unStakeTokens must lower the total stake value"));
        }
        if new_total < data.locked_stake {
            return Err(ContractError::invalid_state(format!(
                "not enough stake left for the registered nodes: locked {}, remaining {new_total}",
                data.locked_stake
            )));
        }
        if data.num_registered > 0 && new_total < config.min_deposit {
            return Err(ContractError::invalid_state(format!(
                "remaining stake {new_total} is below the minimum deposit {}",
                config.min_deposit
            )));
        }

        let released = data.total_stake_value - new_total;
        Self::push_unstaked(&mut data, eei.block().epoch, released)?;
        data.total_stake_value = new_total;
        Self::save_validator(eei, &owner, &data)
    }

    fn unbond_nodes(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        Self::check_not_paused(eei)?;
        let Funded { owner, args: keys, .. } = self.funding.authenticate(eei, input, false)?;
        if keys.is_empty() {
            return Err(ContractError::WrongNumberOfArguments { expected: 1, got: 0 });
        }
        Self::use_gas_per_key(eei, self.gas_cost.unbond, keys.len())?;
        let config = Self::load_config(eei)?;
        let mut data = Self::load_validator(eei, &owner)?;
        Self::require_owned_keys(&data, &keys)?;

        let mut unbonded = 0u128;
        for key in keys.iter() {
            let output = Self::call_staking(eei, "unBond", &[key.clone()])?;
            if output.is_ok() {
                data.bls_pub_keys.retain(|k| k.as_slice() != key.as_slice());
                unbonded += 1;
            } else {
                eei.add_return_message(format!(
                    "unBond is not possible for key {}: {}",
                    display_key(key),
                    output.return_message
                ));
            }
        }

        let released = config.node_price.checked_mul(Uint128::new(unbonded))?;
        data.total_stake_value = data.total_stake_value.checked_sub(released)?;
        Self::relock(&mut data, config.node_price)?;
        Self::save_validator(eei, &owner, &data)?;
        self.funding.pay_out(eei, &owner, released, "unBond")
    }

    fn unbond_tokens(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        Self::check_not_paused(eei)?;
        eei.use_gas(self.gas_cost.unbond)?;
        let Funded { owner, args, .. } = self.funding.authenticate(eei, input, false)?;
        if args.len() > 1 {
            return Err(ContractError::WrongNumberOfArguments {
                expected: 1,
                got: args.len(),
            });
        }
        let features = eei.features();
        let epoch = eei.block().epoch;
        let mut data = Self::load_validator(eei, &owner)?;

        let requested = match args.first() {
            Some(raw) if features.unbond_tokens_v2 => {
                let value = decode_biguint(raw)?;
                if value.is_zero() {
                    return Err(ContractError::invalid_args("cannot unBond zero tokens"));
                }
                Some(value)
            }
            _ => None,
        };

        let released = unbond_eligible(
            &mut data.unstaked_info,
            epoch,
            self.staking_config.unbond_period_in_epochs,
            requested,
        )?;
        if released.is_zero() {
            eei.add_return_message(NO_TOKENS_TO_UNBOND);
            return Ok(());
        }

        data.total_unstaked = data.total_unstaked.checked_sub(released)?;
        Self::save_validator(eei, &owner, &data)?;
        info!(owner = %display_key(&owner), %released, "unBondTokens");
        self.funding.pay_out(eei, &owner, released, "unBondTokens")
    }

    fn unjail(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        let Funded {
            owner,
            args: keys,
            call_value,
            ..
        } = self.funding.authenticate(eei, input, false)?;
        if keys.is_empty() {
            return Err(ContractError::WrongNumberOfArguments { expected: 1, got: 0 });
        }
        Self::use_gas_per_key(eei, self.gas_cost.unjail, keys.len())?;
        let config = Self::load_config(eei)?;
        let mut data = Self::load_validator(eei, &owner)?;
        Self::require_owned_keys(&data, &keys)?;

        let fee = config.unjail_price.checked_mul(Uint128::from(keys.len() as u64))?;
        if !self.funding.is_abstract() && call_value != fee {
            return Err(ContractError::invalid_args(format!(
                "wanted exact unjail price * numNodes: expected {fee}, got {call_value}"
            )));
        }

        let address = eei.current_address().to_vec();
        let mut failed = 0u64;
        for key in keys.iter() {
            let output = Self::call_staking(eei, "unJail", &[key.clone()])?;
            if output.is_ok() {
                continue;
            }
            failed += 1;
            eei.add_log_entry(
                LogEntry::new("unJail", &address)
                    .add_topic(key.clone())
                    .add_topic(output.return_message.clone()),
            );
            eei.add_return_message(format!(
                "unJail failed for key {}: {}",
                display_key(key),
                output.return_message
            ));
        }

        if self.funding.is_abstract() {
            // the fee is taken from the owner's stake
            let charged = config
                .unjail_price
                .checked_mul(Uint128::from(keys.len() as u64 - failed))?;
            let remaining = data.total_stake_value.checked_sub(charged).map_err(|_| {
                ContractError::OutOfFunds(format!("unJail fee {charged} exceeds total stake"))
            })?;
            if remaining < data.locked_stake {
                return Err(ContractError::OutOfFunds(format!(
                    "unJail fee {charged} would leave less than the locked stake {}",
                    data.locked_stake
                )));
            }
            data.total_stake_value = remaining;
            return Self::save_validator(eei, &owner, &data);
        }

        let refund = config.unjail_price.checked_mul(Uint128::from(failed))?;
        self.funding.pay_out(eei, &owner, refund, "unJail")
    }

    fn restake_unstaked_nodes(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        let Funded { owner, args: keys, .. } = self.funding.authenticate(eei, input, false)?;
        if keys.is_empty() {
            return Err(ContractError::WrongNumberOfArguments { expected: 1, got: 0 });
        }
        Self::use_gas_per_key(eei, self.gas_cost.stake, keys.len())?;
        let data = Self::load_validator(eei, &owner)?;
        Self::require_owned_keys(&data, &keys)?;
        if data.total_stake_value < data.locked_stake {
            return Err(ContractError::invalid_state("not enough stake to reStake nodes"));
        }
        Self::call_staking_checked(eei, "reStakeUnStakedNodes", &keys)?;
        Ok(())
    }

    fn clean_registered_data(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.stake)?;
        let Funded { owner, .. } = self.funding.authenticate(eei, input, false)?;
        let config = Self::load_config(eei)?;
        let mut data = Self::load_validator(eei, &owner)?;
        let before = data.bls_pub_keys.len();
        let mut kept = Vec::with_capacity(before);
        for key in data.bls_pub_keys.drain(..) {
            if STAKED_DATA.has(&eei.storage_of(&STAKING_SC_ADDRESS), &key) {
                kept.push(key);
            }
        }
        data.bls_pub_keys = kept;
        Self::relock(&mut data, config.node_price)?;
        if data.bls_pub_keys.len() != before {
            eei.add_return_message(format!(
                "removed {} stale keys",
                before - data.bls_pub_keys.len()
            ));
        }
        Self::save_validator(eei, &owner, &data)
    }

    fn set_pause(&self, eei: &mut Eei, input: &ContractCallInput, paused: bool) -> Result<(), ContractError> {
        validate_caller(input, &END_OF_EPOCH_ADDRESS, &input.function)?;
        UNSTAKE_UNBOND_PAUSED.save(&mut eei.storage(), &paused)?;
        Ok(())
    }

    fn set_config(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        let mut config = Self::load_config(eei)?;
        validate_caller(input, config.owner.as_slice(), "setConfig")?;
        require_num_args(&input.arguments, 3)?;
        let node_price = decode_biguint(&input.arguments[0])?;
        if node_price.is_zero() {
            return Err(ContractError::invalid_args("node price must be greater than zero"));
        }
        config.node_price = node_price;
        config.min_deposit = decode_biguint(&input.arguments[1])?;
        config.unjail_price = decode_biguint(&input.arguments[2])?;
        VALIDATOR_CONFIG.save(&mut eei.storage(), &config)?;
        Ok(())
    }

    fn change_owner_of_validator_data(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &DELEGATION_MANAGER_SC_ADDRESS, "changeOwnerOfValidatorData")?;
        eei.use_gas(self.gas_cost.validator_to_delegation)?;
        require_num_args(&input.arguments, 2)?;
        let old_owner = require_address(&input.arguments[0], "old owner")?;
        let new_owner = require_address(&input.arguments[1], "new owner")?;
        if VALIDATORS.has(&eei.storage_read(), &new_owner) {
            return Err(ContractError::invalid_state(
                "there is already a validator data under the new address",
            ));
        }
        let mut data = Self::load_validator(eei, &old_owner)?;
        if !data.bls_pub_keys.is_empty() {
            let mut args = vec![new_owner.clone()];
            args.extend(data.bls_pub_keys.iter().map(|k| k.to_vec()));
            Self::call_staking_checked(eei, "changeOwnerAndRewardAddress", &args)?;
        }
        data.reward_address = new_owner.as_slice().into();
        VALIDATORS.remove(&mut eei.storage(), &old_owner);
        VALIDATORS.save(&mut eei.storage(), &new_owner, &data)?;
        Ok(())
    }

    fn merge_validator_data(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &DELEGATION_MANAGER_SC_ADDRESS, "mergeValidatorData")?;
        eei.use_gas(self.gas_cost.validator_to_delegation)?;
        require_num_args(&input.arguments, 2)?;
        let old_owner = require_address(&input.arguments[0], "old owner")?;
        let new_owner = require_address(&input.arguments[1], "new owner")?;
        let config = Self::load_config(eei)?;
        let source = Self::load_validator(eei, &old_owner)?;
        if !source.unstaked_info.is_empty() || !source.total_unstaked.is_zero() || !source.total_slashed.is_zero() {
            return Err(ContractError::invalid_state(
                "cannot merge with validator who has unStaked tokens",
            ));
        }

        let block = eei.block();
        let mut target = match VALIDATORS.may_load(&eei.storage_read(), &new_owner)? {
            Some(data) => data,
            None => ValidatorData::new(&new_owner, block.nonce, block.epoch),
        };
        if !source.bls_pub_keys.is_empty() {
            let mut args = vec![new_owner.clone()];
            args.extend(source.bls_pub_keys.iter().map(|k| k.to_vec()));
            Self::call_staking_checked(eei, "changeOwnerAndRewardAddress", &args)?;
        }
        target.bls_pub_keys.extend(source.bls_pub_keys.iter().cloned());
        target.total_stake_value = target.total_stake_value.checked_add(source.total_stake_value)?;
        Self::relock(&mut target, config.node_price)?;

        VALIDATORS.remove(&mut eei.storage(), &old_owner);
        Self::save_validator(eei, &new_owner, &target)
    }

    // views

    fn owner_arg(input: &ContractCallInput) -> Result<Vec<u8>, ContractError> {
        require_num_args(&input.arguments, 1)?;
        require_address(&input.arguments[0], "owner")
    }

    fn get(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        let owner = Self::owner_arg(input)?;
        let data = Self::load_validator(eei, &owner)?;
        eei.finish(to_json_vec(&data)?);
        Ok(())
    }

    fn get_total_staked(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        let owner = Self::owner_arg(input)?;
        let data = Self::load_validator(eei, &owner)?;
        eei.finish(data.total_stake_value.to_string());
        Ok(())
    }

    fn get_total_staked_top_up_staked_bls_keys(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        let owner = Self::owner_arg(input)?;
        let config = Self::load_config(eei)?;
        let data = Self::load_validator(eei, &owner)?;
        let mut staked_keys = vec![];
        for key in data.bls_pub_keys.iter() {
            if Self::key_status(eei, key)? == Some(KeyStatus::Staked) {
                staked_keys.push(key.to_vec());
            }
        }
        let locked = config.node_price.checked_mul(Uint128::from(staked_keys.len() as u64))?;
        let top_up = data.total_stake_value.saturating_sub(locked);
        eei.finish(encode_biguint(top_up));
        eei.finish(encode_biguint(data.total_stake_value));
        for key in staked_keys {
            eei.finish(key);
        }
        Ok(())
    }

    fn get_bls_keys_status(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        let owner = Self::owner_arg(input)?;
        let data = Self::load_validator(eei, &owner)?;
        for key in data.bls_pub_keys.iter() {
            let status = Self::key_status(eei, key)?
                .map(|s| s.as_str())
                .unwrap_or("unknown");
            eei.finish(key.to_vec());
            eei.finish(status);
        }
        Ok(())
    }

    fn get_unstaked_tokens_list(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        let owner = Self::owner_arg(input)?;
        let data = Self::load_validator(eei, &owner)?;
        let epoch = eei.block().epoch;
        let period = self.staking_config.unbond_period_in_epochs;
        for entry in data.unstaked_info.iter() {
            let unbond_epoch = entry.unstaked_epoch.saturating_add(period);
            eei.finish(encode_biguint(entry.unstaked_value));
            eei.finish(encode_u64(u64::from(unbond_epoch.saturating_sub(epoch))));
        }
        Ok(())
    }
}

/// Releases eligible unstaked entries, oldest first. With `requested` only
/// that much is released and the last consumed entry may be split; entries
/// keep their order.
pub fn unbond_eligible(
    entries: &mut Vec<UnstakedValue>,
    epoch: u32,
    unbond_period_in_epochs: u32,
    requested: Option<Uint128>,
) -> Result<Uint128, ContractError> {
    let is_eligible = |e: &UnstakedValue| e.unstaked_epoch.saturating_add(unbond_period_in_epochs) <= epoch;
    let mut remaining = requested;
    let mut released = Uint128::zero();
    let mut kept = Vec::with_capacity(entries.len());

    for mut entry in entries.drain(..) {
        if !is_eligible(&entry) {
            kept.push(entry);
            continue;
        }
        match remaining {
            None => released = released.checked_add(entry.unstaked_value)?,
            Some(left) if left.is_zero() => kept.push(entry),
            Some(left) if entry.unstaked_value <= left => {
                released = released.checked_add(entry.unstaked_value)?;
                remaining = Some(left - entry.unstaked_value);
            }
            Some(left) => {
                released = released.checked_add(left)?;
                entry.unstaked_value -= left;
                remaining = Some(Uint128::zero());
                kept.push(entry);
            }
        }
    }
    *entries = kept;
    Ok(released)
}

impl SystemSmartContract for ValidatorContract {
    fn name(&self) -> &'static str {
        "validator"
    }

    fn execute(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        if input.function == "init" {
            return self.init(eei, input);
        }
        Self::load_config(eei)?;

        match input.function.as_str() {
            "stake" => self.stake(eei, input),
            "stakeNodes" | "reStakeUnStakedNodes" => self.restake_unstaked_nodes(eei, input),
            "unStake" | "unStakeNodes" => self.unstake_nodes(eei, input),
            "unStakeTokens" => self.unstake_tokens(eei, input),
            "unBond" | "unBondNodes" => self.unbond_nodes(eei, input),
            "unBondTokens" => self.unbond_tokens(eei, input),
            "unJail" => self.unjail(eei, input),
            "get" => self.get(eei, input),
            "setConfig" => self.set_config(eei, input),
            "getTotalStaked" => self.get_total_staked(eei, input),
            "getTotalStakedTopUpStakedBlsKeys" => self.get_total_staked_top_up_staked_bls_keys(eei, input),
            "getBlsKeysStatus" => self.get_bls_keys_status(eei, input),
            "getUnStakedTokensList" => self.get_unstaked_tokens_list(eei, input),
            "cleanRegisteredData" => self.clean_registered_data(eei, input),
            "pauseUnStakeUnBond" => self.set_pause(eei, input, true),
            "unPauseUnStakeUnBond" => self.set_pause(eei, input, false),
            "changeOwnerOfValidatorData" => self.change_owner_of_validator_data(eei, input),
            "mergeValidatorData" => self.merge_validator_data(eei, input),
            _ => Err(ContractError::InvalidMethod),
        }
    }
}
