//! Pooled stake contract, one instance per delegation operator.
//!
//! The instance is the owner of a single `ValidatorData` entry and drives it
//! through nested validator calls. Delegators are accounted per address:
//! active stake, unstaked funds with their epoch and rewards computed lazily
//! from the per-epoch reward records.

use cosmwasm_std::{CanonicalAddr, Order, StdResult, Uint128};
use cw2::set_contract_version;
use cw_storage_plus::Bound;
use tracing::debug;

use crate::address::{
    DELEGATION_MANAGER_SC_ADDRESS, END_OF_EPOCH_ADDRESS, STAKING_SC_ADDRESS, VALIDATOR_SC_ADDRESS,
};
use crate::config::{GasCost, MAX_SERVICE_FEE};
use crate::contract::{validate_caller, SystemSmartContract};
use crate::eei::Eei;
use crate::error::{ConfigError, ContractError};
use crate::features::{EnableEpochFlag, EnableEpochs};
use crate::funding::{Funded, FundingPolicy};
use crate::helpers::{
    decode_biguint, decode_bool, decode_u64, display_key, encode_biguint, encode_u64,
    has_duplicates, require_address, require_min_args, require_num_args, to_vecs,
};
use crate::msg::{ContractCallInput, LogEntry, NestedOutput};
use crate::state::{
    DelegationConfig, DelegationContractStatus, DelegationManagement, DelegatorData,
    GlobalFundData, KeyStatus, NodesData, RewardComputationData, UnstakedFund, DELEGATION_CONFIG,
    DELEGATION_MANAGEMENT, DELEGATION_OWNER, DELEGATION_STATUS, DELEGATORS, GLOBAL_FUND,
    REWARDS_BY_EPOCH, SERVICE_FEE, STAKED_DATA, TOTAL_STAKED_REWARDS, VALIDATORS,
    WHITELIST_FOR_MERGE,
};

const CONTRACT_NAME: &str = "crates.io:staking-system-sc-delegation";
const CONTRACT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Flags a delegation contract cannot run without.
pub const REQUIRED_FLAGS: [EnableEpochFlag; 10] = [
    EnableEpochFlag::DelegationManager,
    EnableEpochFlag::ValidatorToDelegation,
    EnableEpochFlag::FixDelegationChangeOwnerOnAccount,
    EnableEpochFlag::MultiClaimOnDelegation,
    EnableEpochFlag::AddTokensToDelegation,
    EnableEpochFlag::ComputeRewardCheckpointFromDelegationOwner,
    EnableEpochFlag::ReDelegateBelowMinCheck,
    EnableEpochFlag::DeleteDelegatorAfterClaimRewards,
    EnableEpochFlag::ChangeDelegationOwner,
    EnableEpochFlag::StakingV2AfterEpoch,
];

pub struct DelegationContract {
    gas_cost: GasCost,
    unbond_period_in_epochs: u32,
    funding: FundingPolicy,
}

fn take_key(list: &mut Vec<NodesData>, key: &[u8]) -> Option<NodesData> {
    let index = list.iter().position(|n| n.bls_key.as_slice() == key)?;
    Some(list.remove(index))
}

fn has_key(list: &[NodesData], key: &[u8]) -> bool {
    list.iter().any(|n| n.bls_key.as_slice() == key)
}

impl DelegationContract {
    pub fn new(
        enable_epochs: &EnableEpochs,
        gas_cost: GasCost,
        unbond_period_in_epochs: u32,
        funding: FundingPolicy,
    ) -> Result<Self, ConfigError> {
        enable_epochs.check_compatibility(&REQUIRED_FLAGS)?;
        Ok(Self {
            gas_cost,
            unbond_period_in_epochs,
            funding,
        })
    }

    // storage helpers

    fn load_config(eei: &Eei) -> Result<DelegationConfig, ContractError> {
        DELEGATION_CONFIG
            .may_load(&eei.storage_read())?
            .ok_or_else(|| ContractError::invalid_state("delegation contract is not initialized"))
    }

    fn load_owner(eei: &Eei) -> Result<Vec<u8>, ContractError> {
        Ok(DELEGATION_OWNER.load(&eei.storage_read())?.to_vec())
    }

    fn only_owner(eei: &Eei, input: &ContractCallInput) -> Result<Vec<u8>, ContractError> {
        let owner = Self::load_owner(eei)?;
        validate_caller(input, &owner, &input.function)?;
        Ok(owner)
    }

    fn load_status(eei: &Eei) -> Result<DelegationContractStatus, ContractError> {
        Ok(DELEGATION_STATUS.may_load(&eei.storage_read())?.unwrap_or_default())
    }

    fn save_status(eei: &mut Eei, status: &DelegationContractStatus) -> Result<(), ContractError> {
        DELEGATION_STATUS.save(&mut eei.storage(), status)?;
        Ok(())
    }

    fn load_fund(eei: &Eei) -> Result<GlobalFundData, ContractError> {
        Ok(GLOBAL_FUND.may_load(&eei.storage_read())?.unwrap_or_default())
    }

    fn save_fund(eei: &mut Eei, fund: &GlobalFundData) -> Result<(), ContractError> {
        GLOBAL_FUND.save(&mut eei.storage(), fund)?;
        Ok(())
    }

    fn load_delegator(eei: &Eei, address: &[u8]) -> Result<Option<DelegatorData>, ContractError> {
        Ok(DELEGATORS.may_load(&eei.storage_read(), address)?)
    }

    fn management(eei: &Eei) -> Result<DelegationManagement, ContractError> {
        DELEGATION_MANAGEMENT
            .may_load(&eei.storage_of(&DELEGATION_MANAGER_SC_ADDRESS))?
            .ok_or_else(|| ContractError::invalid_state("delegation manager is not initialized"))
    }

    fn validator_total(eei: &Eei) -> Result<Uint128, ContractError> {
        let me = eei.current_address();
        Ok(VALIDATORS
            .may_load(&eei.storage_of(&VALIDATOR_SC_ADDRESS), me)?
            .map(|d| d.total_stake_value)
            .unwrap_or_default())
    }

    fn key_status(eei: &Eei, key: &[u8]) -> Result<Option<KeyStatus>, ContractError> {
        Ok(STAKED_DATA
            .may_load(&eei.storage_of(&STAKING_SC_ADDRESS), key)?
            .map(|d| d.status()))
    }

    fn check_cap(config: &DelegationConfig, new_total: Uint128) -> Result<(), ContractError> {
        if !config.max_delegation_cap.is_zero() && new_total > config.max_delegation_cap {
            return Err(ContractError::invalid_args("total delegation cap reached"));
        }
        Ok(())
    }

    fn check_service_fee(eei: &Eei, fee: u64) -> Result<(), ContractError> {
        let management = Self::management(eei)?;
        if fee < management.min_service_fee || fee > management.max_service_fee {
            return Err(ContractError::invalid_args(format!(
                "service fee {fee} out of bounds [{}, {}]",
                management.min_service_fee, management.max_service_fee
            )));
        }
        Ok(())
    }

    // validator calls

    /// Calls the validator contract as the owner of this instance. Under
    /// abstract staking the owner and, when given, the new total are appended.
    fn call_validator(
        &self,
        eei: &mut Eei,
        function: &str,
        mut args: Vec<Vec<u8>>,
        value: Uint128,
        new_total: Option<Uint128>,
    ) -> Result<NestedOutput, ContractError> {
        let me = eei.current_address().to_vec();
        let value = if self.funding.is_abstract() {
            args.push(me.clone());
            if let Some(total) = new_total {
                args.push(encode_biguint(total));
            }
            Uint128::zero()
        } else {
            value
        };
        let output = eei.execute_on_dest_context(&VALIDATOR_SC_ADDRESS, &me, value, function, &args)?;
        if !output.is_ok() {
            return Err(ContractError::NestedCallFailed {
                function: function.to_string(),
                address: display_key(&VALIDATOR_SC_ADDRESS),
                message: output.return_message,
            });
        }
        Ok(output)
    }

    fn stake_top_up(&self, eei: &mut Eei, amount: Uint128) -> Result<(), ContractError> {
        if amount.is_zero() {
            return Ok(());
        }
        let new_total = Self::validator_total(eei)?.checked_add(amount)?;
        self.call_validator(eei, "stake", vec![], amount, Some(new_total))?;
        Ok(())
    }

    /// Value paid out to this instance by a validator call.
    fn received(&self, eei: &Eei, output: &NestedOutput, balance_before: Uint128) -> Result<Uint128, ContractError> {
        if self.funding.is_abstract() {
            return match output.return_data.first() {
                Some(raw) => decode_biguint(raw),
                None => Ok(Uint128::zero()),
            };
        }
        Ok(eei.balance(eei.current_address()).checked_sub(balance_before)?)
    }

    // rewards

    /// Folds reward records from the delegator's checkpoint up to the current
    /// epoch into `unclaimed_rewards`.
    fn compute_rewards(eei: &Eei, data: &mut DelegatorData, is_owner: bool) -> Result<(), ContractError> {
        let epoch = eei.block().epoch;
        if data.reward_checkpoint_epoch > epoch {
            return Ok(());
        }
        let records: Vec<(u32, RewardComputationData)> = {
            let store = eei.storage_read();
            REWARDS_BY_EPOCH
                .range(
                    &store,
                    Some(Bound::inclusive(data.reward_checkpoint_epoch)),
                    Some(Bound::inclusive(epoch)),
                    Order::Ascending,
                )
                .collect::<StdResult<_>>()?
        };

        let mut earned = Uint128::zero();
        for (_, record) in records {
            if record.total_active.is_zero() {
                continue;
            }
            let fee = record.reward.multiply_ratio(record.service_fee, MAX_SERVICE_FEE);
            let rest = record.reward.checked_sub(fee)?;
            earned = earned.checked_add(rest.multiply_ratio(data.active_fund, record.total_active))?;
            if is_owner {
                earned = earned.checked_add(fee)?;
            }
        }
        data.unclaimed_rewards = data.unclaimed_rewards.checked_add(earned)?;
        data.reward_checkpoint_epoch = epoch + 1;
        Ok(())
    }

    /// Saves a delegator, dropping it once it holds nothing. The owner entry
    /// is always kept.
    fn save_delegator(
        eei: &mut Eei,
        address: &[u8],
        data: &DelegatorData,
        status: &mut DelegationContractStatus,
        owner: &[u8],
    ) -> Result<(), ContractError> {
        if data.is_empty() && address != owner && eei.features().delete_delegator_after_claim_rewards {
            if DELEGATORS.has(&eei.storage_read(), address) {
                DELEGATORS.remove(&mut eei.storage(), address);
                status.num_users = status.num_users.saturating_sub(1);
            }
            return Ok(());
        }
        DELEGATORS.save(&mut eei.storage(), address, data)?;
        Ok(())
    }

    // initialisation

    fn init(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &DELEGATION_MANAGER_SC_ADDRESS, "init")?;
        if DELEGATION_CONFIG.may_load(&eei.storage_read())?.is_some() {
            return Err(ContractError::AlreadyInitialized);
        }
        require_num_args(&input.arguments, 4)?;
        let owner = require_address(&input.arguments[0], "owner")?;
        let max_cap = decode_biguint(&input.arguments[1])?;
        let service_fee = decode_u64(&input.arguments[2])?;
        let deposit = decode_biguint(&input.arguments[3])?;
        if self.funding.transfers_enabled() && input.call_value != deposit {
            return Err(ContractError::invalid_args(format!(
                "deposit {deposit} does not match call value {}",
                input.call_value
            )));
        }

        let config = self.new_config(eei, max_cap, deposit);
        Self::check_cap(&config, deposit)?;
        let epoch = eei.block().epoch;
        let owner_data = DelegatorData {
            active_fund: deposit,
            reward_checkpoint_epoch: epoch + 1,
            ..DelegatorData::default()
        };
        let status = DelegationContractStatus {
            num_users: 1,
            ..DelegationContractStatus::default()
        };
        let fund = GlobalFundData {
            total_active: deposit,
            total_unstaked: Uint128::zero(),
        };
        self.save_initial_state(eei, &owner, &config, service_fee, &status, &fund, &owner_data)?;
        self.stake_top_up(eei, deposit)
    }

    fn new_config(&self, eei: &Eei, max_cap: Uint128, initial_owner_funds: Uint128) -> DelegationConfig {
        DelegationConfig {
            max_delegation_cap: max_cap,
            initial_owner_funds,
            automatic_activation: false,
            changeable_service_fee: true,
            check_cap_on_redelegate: false,
            created_nonce: eei.block().nonce,
            unbond_period_in_epochs: self.unbond_period_in_epochs,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn save_initial_state(
        &self,
        eei: &mut Eei,
        owner: &[u8],
        config: &DelegationConfig,
        service_fee: u64,
        status: &DelegationContractStatus,
        fund: &GlobalFundData,
        owner_data: &DelegatorData,
    ) -> Result<(), ContractError> {
        set_contract_version(&mut eei.storage(), CONTRACT_NAME, CONTRACT_VERSION)?;
        DELEGATION_CONFIG.save(&mut eei.storage(), config)?;
        DELEGATION_OWNER.save(&mut eei.storage(), &CanonicalAddr::from(owner))?;
        SERVICE_FEE.save(&mut eei.storage(), &service_fee)?;
        TOTAL_STAKED_REWARDS.save(&mut eei.storage(), &Uint128::zero())?;
        Self::save_status(eei, status)?;
        Self::save_fund(eei, fund)?;
        DELEGATORS.save(&mut eei.storage(), owner, owner_data)?;
        Ok(())
    }

    fn init_from_validator_data(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &DELEGATION_MANAGER_SC_ADDRESS, "initFromValidatorData")?;
        if DELEGATION_CONFIG.may_load(&eei.storage_read())?.is_some() {
            return Err(ContractError::AlreadyInitialized);
        }
        require_num_args(&input.arguments, 3)?;
        let owner = require_address(&input.arguments[0], "owner")?;
        let max_cap = decode_biguint(&input.arguments[1])?;
        let service_fee = decode_u64(&input.arguments[2])?;

        let me = eei.current_address().to_vec();
        let validator = VALIDATORS
            .may_load(&eei.storage_of(&VALIDATOR_SC_ADDRESS), &me)?
            .ok_or(ContractError::ValidatorNotFound)?;
        let config = self.new_config(eei, max_cap, validator.total_stake_value);
        Self::check_cap(&config, validator.total_stake_value)?;

        let mut status = DelegationContractStatus {
            num_users: 1,
            ..DelegationContractStatus::default()
        };
        for key in validator.bls_pub_keys.iter() {
            let node = NodesData {
                bls_key: key.clone(),
                signed_msg: Default::default(),
            };
            match Self::key_status(eei, key)? {
                Some(KeyStatus::UnStaked) => status.unstaked_keys.push(node),
                Some(_) => status.staked_keys.push(node),
                None => status.not_staked_keys.push(node),
            }
        }

        let epoch = eei.block().epoch;
        let owner_data = DelegatorData {
            active_fund: validator.total_stake_value,
            unstaked_funds: validator
                .unstaked_info
                .iter()
                .map(|u| UnstakedFund {
                    value: u.unstaked_value,
                    epoch: u.unstaked_epoch,
                })
                .collect(),
            reward_checkpoint_epoch: if eei.features().compute_reward_checkpoint { epoch + 1 } else { 0 },
            ..DelegatorData::default()
        };
        let fund = GlobalFundData {
            total_active: validator.total_stake_value,
            total_unstaked: validator.total_unstaked,
        };
        self.save_initial_state(eei, &owner, &config, service_fee, &status, &fund, &owner_data)
    }

    fn merge_validator_data_to_contract(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &DELEGATION_MANAGER_SC_ADDRESS, "mergeValidatorDataToContract")?;
        eei.use_gas(self.gas_cost.validator_to_delegation)?;
        require_num_args(&input.arguments, 2)?;
        let from = require_address(&input.arguments[0], "merged owner")?;
        let amount = decode_biguint(&input.arguments[1])?;

        let whitelisted = WHITELIST_FOR_MERGE.may_load(&eei.storage_read())?;
        if whitelisted.as_ref().map(|a| a.as_slice()) != Some(from.as_slice()) {
            return Err(ContractError::unauthorized("address is not whitelisted for merge"));
        }

        let me = eei.current_address().to_vec();
        let validator = VALIDATORS
            .may_load(&eei.storage_of(&VALIDATOR_SC_ADDRESS), &me)?
            .ok_or(ContractError::ValidatorNotFound)?;
        let mut status = Self::load_status(eei)?;
        for key in validator.bls_pub_keys.iter() {
            if status.contains(key) {
                continue;
            }
            let node = NodesData {
                bls_key: key.clone(),
                signed_msg: Default::default(),
            };
            match Self::key_status(eei, key)? {
                Some(KeyStatus::UnStaked) => status.unstaked_keys.push(node),
                _ => status.staked_keys.push(node),
            }
        }

        let config = Self::load_config(eei)?;
        let owner = Self::load_owner(eei)?;
        let mut fund = Self::load_fund(eei)?;
        fund.total_active = fund.total_active.checked_add(amount)?;
        Self::check_cap(&config, fund.total_active)?;

        let mut data = match Self::load_delegator(eei, &from)? {
            Some(mut data) => {
                Self::compute_rewards(eei, &mut data, from == owner)?;
                data
            }
            None => {
                status.num_users += 1;
                DelegatorData {
                    reward_checkpoint_epoch: eei.block().epoch + 1,
                    ..DelegatorData::default()
                }
            }
        };
        data.active_fund = data.active_fund.checked_add(amount)?;

        Self::save_delegator(eei, &from, &data, &mut status, &owner)?;
        Self::save_status(eei, &status)?;
        Self::save_fund(eei, &fund)?;
        WHITELIST_FOR_MERGE.remove(&mut eei.storage());
        Ok(())
    }

    // node management

    fn add_nodes(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        Self::only_owner(eei, input)?;
        eei.use_gas(self.gas_cost.delegation_ops)?;
        require_min_args(&input.arguments, 2)?;
        if input.arguments.len() % 2 != 0 {
            return Err(ContractError::invalid_args("arguments must be pairs of blsKey and signature"));
        }
        let args = to_vecs(&input.arguments);
        let keys: Vec<Vec<u8>> = args.iter().step_by(2).cloned().collect();
        if has_duplicates(&keys) {
            return Err(ContractError::invalid_args("invalid arguments, found same bls key twice"));
        }

        let mut status = Self::load_status(eei)?;
        for pair in args.chunks(2) {
            let key = &pair[0];
            if status.contains(key) || STAKED_DATA.has(&eei.storage_of(&STAKING_SC_ADDRESS), key) {
                return Err(ContractError::invalid_args(format!(
                    "blsKey already in use: {}",
                    display_key(key)
                )));
            }
            status.not_staked_keys.push(NodesData {
                bls_key: key.as_slice().into(),
                signed_msg: pair[1].as_slice().into(),
            });
        }
        Self::save_status(eei, &status)
    }

    fn remove_nodes(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        Self::only_owner(eei, input)?;
        eei.use_gas(self.gas_cost.delegation_ops)?;
        require_min_args(&input.arguments, 1)?;
        let mut status = Self::load_status(eei)?;
        for key in to_vecs(&input.arguments) {
            if take_key(&mut status.not_staked_keys, &key).is_none() {
                return Err(ContractError::invalid_args(format!(
                    "blsKey {} is not in the not staked list",
                    display_key(&key)
                )));
            }
        }
        Self::save_status(eei, &status)
    }

    fn stake_nodes(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        Self::only_owner(eei, input)?;
        eei.use_gas(self.gas_cost.delegation_ops)?;
        require_min_args(&input.arguments, 1)?;
        let keys = to_vecs(&input.arguments);
        let mut status = Self::load_status(eei)?;
        self.activate_keys(eei, &mut status, &keys)?;
        Self::save_status(eei, &status)
    }

    /// Registers not-staked keys and re-stakes unstaked ones. Keys the
    /// validator did not activate stay where they were.
    fn activate_keys(
        &self,
        eei: &mut Eei,
        status: &mut DelegationContractStatus,
        keys: &[Vec<u8>],
    ) -> Result<(), ContractError> {
        let mut fresh = vec![];
        let mut restake = vec![];
        for key in keys {
            if let Some(node) = status.not_staked_keys.iter().find(|n| n.bls_key.as_slice() == key.as_slice()) {
                fresh.push(node.clone());
            } else if has_key(&status.unstaked_keys, key) {
                restake.push(key.clone());
            } else {
                return Err(ContractError::invalid_args(format!(
                    "blsKey {} is not in a stakeable state",
                    display_key(key)
                )));
            }
        }

        if !fresh.is_empty() {
            let mut args = vec![encode_u64(fresh.len() as u64)];
            for node in fresh.iter() {
                args.push(node.bls_key.to_vec());
                args.push(node.signed_msg.to_vec());
            }
            let total = Self::validator_total(eei)?;
            self.call_validator(eei, "stake", args, Uint128::zero(), Some(total))?;
            for node in fresh {
                if Self::key_status(eei, &node.bls_key)?.is_some() {
                    take_key(&mut status.not_staked_keys, &node.bls_key);
                    status.staked_keys.push(node);
                }
            }
        }
        if !restake.is_empty() {
            self.call_validator(eei, "reStakeUnStakedNodes", restake.clone(), Uint128::zero(), None)?;
            for key in restake {
                if let Some(node) = take_key(&mut status.unstaked_keys, &key) {
                    status.staked_keys.push(node);
                }
            }
        }
        Ok(())
    }

    fn unstake_nodes(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        Self::only_owner(eei, input)?;
        eei.use_gas(self.gas_cost.delegation_ops)?;
        require_min_args(&input.arguments, 1)?;
        let keys = to_vecs(&input.arguments);
        let mut status = Self::load_status(eei)?;
        if let Some(key) = keys.iter().find(|k| !has_key(&status.staked_keys, k)) {
            return Err(ContractError::invalid_args(format!(
                "blsKey {} is not staked",
                display_key(key)
            )));
        }
        let total = Self::validator_total(eei)?;
        self.call_validator(eei, "unStakeNodes", keys.clone(), Uint128::zero(), Some(total))?;
        for key in keys {
            if let Some(node) = take_key(&mut status.staked_keys, &key) {
                status.unstaked_keys.push(node);
            }
        }
        Self::save_status(eei, &status)
    }

    fn unbond_nodes(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        Self::only_owner(eei, input)?;
        eei.use_gas(self.gas_cost.delegation_ops)?;
        require_min_args(&input.arguments, 1)?;
        let keys = to_vecs(&input.arguments);
        let mut status = Self::load_status(eei)?;
        if let Some(key) = keys.iter().find(|k| !has_key(&status.unstaked_keys, k)) {
            return Err(ContractError::invalid_args(format!(
                "blsKey {} is not unStaked",
                display_key(key)
            )));
        }

        let balance_before = eei.balance(eei.current_address());
        let output = self.call_validator(eei, "unBondNodes", keys.clone(), Uint128::zero(), None)?;
        let released = self.received(eei, &output, balance_before)?;
        if !output.return_message.is_empty() {
            eei.add_return_message(&output.return_message);
        }
        for key in keys {
            if Self::key_status(eei, &key)?.is_none() {
                if let Some(node) = take_key(&mut status.unstaked_keys, &key) {
                    status.not_staked_keys.push(node);
                }
            }
        }
        Self::save_status(eei, &status)?;
        // node stake stays in the pool as top-up
        self.stake_top_up(eei, released)
    }

    // delegator operations

    fn delegate(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.delegation_ops)?;
        let Funded {
            owner: delegator,
            args,
            reported_value,
            call_value,
        } = self.funding.authenticate(eei, input, true)?;
        if !args.is_empty() {
            return Err(ContractError::WrongNumberOfArguments {
                expected: 0,
                got: args.len(),
            });
        }
        let value = reported_value.unwrap_or(call_value);
        let management = Self::management(eei)?;
        if value < management.min_delegation_amount {
            return Err(ContractError::invalid_args(format!(
                "delegate value must be higher than minDelegationAmount {}",
                management.min_delegation_amount
            )));
        }

        let config = Self::load_config(eei)?;
        let owner = Self::load_owner(eei)?;
        let mut fund = Self::load_fund(eei)?;
        fund.total_active = fund.total_active.checked_add(value)?;
        Self::check_cap(&config, fund.total_active)?;

        let mut status = Self::load_status(eei)?;
        let mut data = match Self::load_delegator(eei, &delegator)? {
            Some(mut data) => {
                Self::compute_rewards(eei, &mut data, delegator == owner)?;
                data
            }
            None => {
                status.num_users += 1;
                DelegatorData {
                    reward_checkpoint_epoch: eei.block().epoch + 1,
                    ..DelegatorData::default()
                }
            }
        };
        data.active_fund = data.active_fund.checked_add(value)?;

        self.stake_top_up(eei, value)?;
        if config.automatic_activation && !status.not_staked_keys.is_empty() {
            let keys: Vec<Vec<u8>> = status.not_staked_keys.iter().map(|n| n.bls_key.to_vec()).collect();
            match self.activate_keys(eei, &mut status, &keys) {
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => eei.add_return_message(format!("automatic activation failed: {err}")),
                Ok(()) => {}
            }
        }

        Self::save_delegator(eei, &delegator, &data, &mut status, &owner)?;
        Self::save_status(eei, &status)?;
        Self::save_fund(eei, &fund)?;
        let me = eei.current_address().to_vec();
        eei.add_log_entry(
            LogEntry::new("delegate", &me)
                .add_topic(encode_biguint(value))
                .add_topic(encode_biguint(data.active_fund))
                .add_topic(encode_u64(status.num_users))
                .add_topic(encode_biguint(fund.total_active))
                .with_data(delegator.clone()),
        );
        debug!(delegator = %display_key(&delegator), %value, "delegate");
        Ok(())
    }

    fn undelegate(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.delegation_ops)?;
        let Funded {
            owner: delegator,
            args,
            reported_value,
            ..
        } = self.funding.authenticate(eei, input, true)?;
        let value = match reported_value {
            Some(value) => value,
            None => {
                if args.len() != 1 {
                    return Err(ContractError::WrongNumberOfArguments {
                        expected: 1,
                        got: args.len(),
                    });
                }
                decode_biguint(&args[0])?
            }
        };
        if value.is_zero() {
            return Err(ContractError::invalid_args("cannot unDelegate zero"));
        }

        let owner = Self::load_owner(eei)?;
        let mut data = Self::load_delegator(eei, &delegator)?
            .ok_or_else(|| ContractError::invalid_args("caller is not a delegator"))?;
        if value > data.active_fund {
            return Err(ContractError::invalid_args(format!(
                "invalid value to unDelegate: active fund is {}",
                data.active_fund
            )));
        }
        let remaining = data.active_fund - value;
        let management = Self::management(eei)?;
        if !remaining.is_zero() && remaining < management.min_delegation_amount {
            return Err(ContractError::invalid_args(
                "invalid value to unDelegate - need to unDelegate all - remaining is under minimum",
            ));
        }

        Self::compute_rewards(eei, &mut data, delegator == owner)?;
        let new_total = Self::validator_total(eei)?.checked_sub(value)?;
        let args = if self.funding.is_abstract() { vec![] } else { vec![encode_biguint(value)] };
        self.call_validator(eei, "unStakeTokens", args, Uint128::zero(), Some(new_total))?;

        let epoch = eei.block().epoch;
        data.active_fund = remaining;
        data.unstaked_funds.push(UnstakedFund { value, epoch });
        let mut fund = Self::load_fund(eei)?;
        fund.total_active = fund.total_active.checked_sub(value)?;
        fund.total_unstaked = fund.total_unstaked.checked_add(value)?;

        let mut status = Self::load_status(eei)?;
        Self::save_delegator(eei, &delegator, &data, &mut status, &owner)?;
        Self::save_status(eei, &status)?;
        Self::save_fund(eei, &fund)
    }

    fn unbondable(&self, data: &DelegatorData, epoch: u32) -> Result<Uint128, ContractError> {
        let mut total = Uint128::zero();
        for fund in data.unstaked_funds.iter() {
            if fund.epoch.saturating_add(self.unbond_period_in_epochs) <= epoch {
                total = total.checked_add(fund.value)?;
            }
        }
        Ok(total)
    }

    fn withdraw(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        if !eei.features().unbond_tokens_v2 {
            return Err(ContractError::FeatureNotEnabled("withdraw is not enabled".to_string()));
        }
        eei.use_gas(self.gas_cost.delegation_ops)?;
        let Funded { owner: delegator, .. } = self.funding.authenticate(eei, input, false)?;
        let owner = Self::load_owner(eei)?;
        let mut data = Self::load_delegator(eei, &delegator)?
            .ok_or_else(|| ContractError::invalid_args("caller is not a delegator"))?;
        let epoch = eei.block().epoch;
        let eligible = self.unbondable(&data, epoch)?;
        if eligible.is_zero() {
            return Err(ContractError::invalid_args("nothing to unBond"));
        }

        let balance_before = eei.balance(eei.current_address());
        let output = self.call_validator(eei, "unBondTokens", vec![encode_biguint(eligible)], Uint128::zero(), None)?;
        let released = self.received(eei, &output, balance_before)?;
        if released.is_zero() {
            return Err(ContractError::invalid_args("nothing to unBond"));
        }

        let period = self.unbond_period_in_epochs;
        let mut left = released;
        data.unstaked_funds.retain_mut(|fund| {
            if left.is_zero() || fund.epoch.saturating_add(period) > epoch {
                return true;
            }
            if fund.value <= left {
                left -= fund.value;
                return false;
            }
            fund.value -= left;
            left = Uint128::zero();
            true
        });

        let mut fund = Self::load_fund(eei)?;
        fund.total_unstaked = fund.total_unstaked.checked_sub(released)?;
        Self::save_fund(eei, &fund)?;
        let mut status = Self::load_status(eei)?;
        Self::save_delegator(eei, &delegator, &data, &mut status, &owner)?;
        Self::save_status(eei, &status)?;
        self.funding.pay_out(eei, &delegator, released, "withdraw")
    }

    fn claim_rewards(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.claim)?;
        let Funded { owner: delegator, .. } = self.funding.authenticate(eei, input, false)?;
        let owner = Self::load_owner(eei)?;
        let mut data = Self::load_delegator(eei, &delegator)?
            .ok_or_else(|| ContractError::invalid_args("caller is not a delegator"))?;
        Self::compute_rewards(eei, &mut data, delegator == owner)?;

        let amount = data.unclaimed_rewards;
        data.unclaimed_rewards = Uint128::zero();
        data.total_cumulated_rewards = data.total_cumulated_rewards.checked_add(amount)?;

        let mut status = Self::load_status(eei)?;
        Self::save_delegator(eei, &delegator, &data, &mut status, &owner)?;
        Self::save_status(eei, &status)?;
        self.funding.pay_out(eei, &delegator, amount, "claimRewards")
    }

    fn redelegate_rewards(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.delegation_ops)?;
        let Funded { owner: delegator, .. } = self.funding.authenticate(eei, input, false)?;
        let owner = Self::load_owner(eei)?;
        let config = Self::load_config(eei)?;
        let mut data = Self::load_delegator(eei, &delegator)?
            .ok_or_else(|| ContractError::invalid_args("caller is not a delegator"))?;
        Self::compute_rewards(eei, &mut data, delegator == owner)?;

        let amount = data.unclaimed_rewards;
        if amount.is_zero() {
            return Err(ContractError::invalid_args("no rewards to reDelegate"));
        }
        if eei.features().redelegate_below_min_check {
            let management = Self::management(eei)?;
            if amount < management.min_delegation_amount {
                return Err(ContractError::invalid_args(format!(
                    "can not reDelegate rewards below minDelegationAmount {}",
                    management.min_delegation_amount
                )));
            }
        }
        let mut fund = Self::load_fund(eei)?;
        fund.total_active = fund.total_active.checked_add(amount)?;
        if config.check_cap_on_redelegate {
            Self::check_cap(&config, fund.total_active)?;
        }

        self.stake_top_up(eei, amount)?;
        data.unclaimed_rewards = Uint128::zero();
        data.total_cumulated_rewards = data.total_cumulated_rewards.checked_add(amount)?;
        data.active_fund = data.active_fund.checked_add(amount)?;

        let mut status = Self::load_status(eei)?;
        Self::save_delegator(eei, &delegator, &data, &mut status, &owner)?;
        Self::save_status(eei, &status)?;
        Self::save_fund(eei, &fund)
    }

    fn update_rewards(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &END_OF_EPOCH_ADDRESS, "updateRewards")?;
        let value = if self.funding.is_abstract() {
            require_num_args(&input.arguments, 1)?;
            decode_biguint(&input.arguments[0])?
        } else {
            require_num_args(&input.arguments, 0)?;
            input.call_value
        };

        let epoch = eei.block().epoch;
        let fund = Self::load_fund(eei)?;
        let service_fee = SERVICE_FEE.load(&eei.storage_read())?;
        let mut record = REWARDS_BY_EPOCH
            .may_load(&eei.storage_read(), epoch)?
            .unwrap_or(RewardComputationData {
                reward: Uint128::zero(),
                total_active: fund.total_active,
                service_fee,
            });
        record.reward = record.reward.checked_add(value)?;
        record.total_active = fund.total_active;
        record.service_fee = service_fee;
        REWARDS_BY_EPOCH.save(&mut eei.storage(), epoch, &record)?;

        let total = TOTAL_STAKED_REWARDS.may_load(&eei.storage_read())?.unwrap_or_default();
        TOTAL_STAKED_REWARDS.save(&mut eei.storage(), &total.checked_add(value)?)?;
        Ok(())
    }

    // owner settings

    fn change_service_fee(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        Self::only_owner(eei, input)?;
        eei.use_gas(self.gas_cost.delegation_ops)?;
        require_num_args(&input.arguments, 1)?;
        let config = Self::load_config(eei)?;
        if !config.changeable_service_fee {
            return Err(ContractError::invalid_state("service fee is not changeable"));
        }
        let fee = decode_u64(&input.arguments[0])?;
        Self::check_service_fee(eei, fee)?;
        SERVICE_FEE.save(&mut eei.storage(), &fee)?;
        Ok(())
    }

    fn modify_total_delegation_cap(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        Self::only_owner(eei, input)?;
        eei.use_gas(self.gas_cost.delegation_ops)?;
        require_num_args(&input.arguments, 1)?;
        let cap = decode_biguint(&input.arguments[0])?;
        let fund = Self::load_fund(eei)?;
        if !cap.is_zero() && cap < fund.total_active {
            return Err(ContractError::invalid_args(format!(
                "cannot set max delegation cap {cap} below the total active stake {}",
                fund.total_active
            )));
        }
        let mut config = Self::load_config(eei)?;
        config.max_delegation_cap = cap;
        DELEGATION_CONFIG.save(&mut eei.storage(), &config)?;
        Ok(())
    }

    fn set_config_flag(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        Self::only_owner(eei, input)?;
        eei.use_gas(self.gas_cost.delegation_ops)?;
        require_num_args(&input.arguments, 1)?;
        let value = decode_bool(&input.arguments[0])?;
        let mut config = Self::load_config(eei)?;
        match input.function.as_str() {
            "setAutomaticActivation" => config.automatic_activation = value,
            _ => config.check_cap_on_redelegate = value,
        }
        DELEGATION_CONFIG.save(&mut eei.storage(), &config)?;
        Ok(())
    }

    fn whitelist_for_merge(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        let owner = Self::only_owner(eei, input)?;
        eei.use_gas(self.gas_cost.delegation_ops)?;
        require_num_args(&input.arguments, 1)?;
        let address = require_address(&input.arguments[0], "whitelisted address")?;
        if address == owner {
            return Err(ContractError::invalid_args("cannot whitelist own address"));
        }
        WHITELIST_FOR_MERGE.save(&mut eei.storage(), &CanonicalAddr::from(address.as_slice()))?;
        Ok(())
    }

    fn delete_whitelist_for_merge(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        Self::only_owner(eei, input)?;
        eei.use_gas(self.gas_cost.delegation_ops)?;
        WHITELIST_FOR_MERGE.remove(&mut eei.storage());
        Ok(())
    }

    fn change_owner(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        if !eei.features().change_delegation_owner {
            return Err(ContractError::FeatureNotEnabled(
                "change delegation owner is not enabled".to_string(),
            ));
        }
        let owner = Self::only_owner(eei, input)?;
        eei.use_gas(self.gas_cost.delegation_ops)?;
        require_num_args(&input.arguments, 1)?;
        let new_owner = require_address(&input.arguments[0], "new owner")?;
        if DELEGATORS.has(&eei.storage_read(), &new_owner) {
            return Err(ContractError::invalid_args("destination should not be a delegator"));
        }

        let mut data = Self::load_delegator(eei, &owner)?.unwrap_or_default();
        Self::compute_rewards(eei, &mut data, true)?;
        DELEGATORS.remove(&mut eei.storage(), &owner);
        DELEGATORS.save(&mut eei.storage(), &new_owner, &data)?;
        DELEGATION_OWNER.save(&mut eei.storage(), &CanonicalAddr::from(new_owner.as_slice()))?;

        if eei.features().fix_delegation_change_owner {
            let me = eei.current_address().to_vec();
            let output = eei.execute_on_dest_context(
                &DELEGATION_MANAGER_SC_ADDRESS,
                &me,
                Uint128::zero(),
                "correctOwnerOnAccount",
                &[me.clone(), new_owner.clone()],
            )?;
            if !output.is_ok() {
                return Err(ContractError::NestedCallFailed {
                    function: "correctOwnerOnAccount".to_string(),
                    address: display_key(&DELEGATION_MANAGER_SC_ADDRESS),
                    message: output.return_message,
                });
            }
        }
        Ok(())
    }

    // views

    fn address_arg(input: &ContractCallInput) -> Result<Vec<u8>, ContractError> {
        require_num_args(&input.arguments, 1)?;
        require_address(&input.arguments[0], "delegator")
    }

    fn get_all_node_states(&self, eei: &mut Eei) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get_all_node_states)?;
        let status = Self::load_status(eei)?;
        for (label, list) in [
            ("staked", &status.staked_keys),
            ("notStaked", &status.not_staked_keys),
            ("unStaked", &status.unstaked_keys),
        ] {
            if list.is_empty() {
                continue;
            }
            eei.finish(label);
            for node in list {
                eei.finish(node.bls_key.to_vec());
            }
        }
        Ok(())
    }

    fn get_total_active_stake(&self, eei: &mut Eei) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get_active_fund)?;
        let fund = Self::load_fund(eei)?;
        eei.finish(encode_biguint(fund.total_active));
        Ok(())
    }

    fn get_delegator_view(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        let address = Self::address_arg(input)?;
        let owner = Self::load_owner(eei)?;
        let Some(mut data) = Self::load_delegator(eei, &address)? else {
            return Err(ContractError::invalid_args("view function works only for existing delegators"));
        };
        let epoch = eei.block().epoch;
        let value = match input.function.as_str() {
            "getUserActiveStake" => data.active_fund,
            "getUserUnStakedValue" => data
                .unstaked_funds
                .iter()
                .try_fold(Uint128::zero(), |acc, f| acc.checked_add(f.value))?,
            "getUserUnBondable" => self.unbondable(&data, epoch)?,
            _ => {
                Self::compute_rewards(eei, &mut data, address == owner)?;
                data.unclaimed_rewards
            }
        };
        eei.finish(encode_biguint(value));
        Ok(())
    }

    fn get_num_users(&self, eei: &mut Eei) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        let status = Self::load_status(eei)?;
        eei.finish(encode_u64(status.num_users));
        Ok(())
    }

    fn get_whitelist_for_merge(&self, eei: &mut Eei) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        if let Some(address) = WHITELIST_FOR_MERGE.may_load(&eei.storage_read())? {
            eei.finish(address.to_vec());
        }
        Ok(())
    }

    fn get_contract_config(&self, eei: &mut Eei) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        let config = Self::load_config(eei)?;
        let owner = Self::load_owner(eei)?;
        let service_fee = SERVICE_FEE.load(&eei.storage_read())?;
        let flag = |b: bool| if b { "true" } else { "false" };
        eei.finish(owner);
        eei.finish(encode_u64(service_fee));
        eei.finish(encode_biguint(config.max_delegation_cap));
        eei.finish(encode_biguint(config.initial_owner_funds));
        eei.finish(flag(config.automatic_activation));
        eei.finish(flag(config.changeable_service_fee));
        eei.finish(flag(config.check_cap_on_redelegate));
        eei.finish(encode_u64(config.created_nonce));
        eei.finish(encode_u64(u64::from(config.unbond_period_in_epochs)));
        Ok(())
    }
}

impl SystemSmartContract for DelegationContract {
    fn name(&self) -> &'static str {
        "delegation"
    }

    fn execute(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        match input.function.as_str() {
            "init" => return self.init(eei, input),
            "initFromValidatorData" => return self.init_from_validator_data(eei, input),
            _ => {}
        }
        if !eei.features().delegation_sc {
            return Err(ContractError::FeatureNotEnabled(
                "delegation contract is not enabled".to_string(),
            ));
        }
        Self::load_config(eei)?;

        match input.function.as_str() {
            "addNodes" => self.add_nodes(eei, input),
            "removeNodes" => self.remove_nodes(eei, input),
            "stakeNodes" => self.stake_nodes(eei, input),
            "unStakeNodes" => self.unstake_nodes(eei, input),
            "unBondNodes" => self.unbond_nodes(eei, input),
            "delegate" => self.delegate(eei, input),
            "unDelegate" => self.undelegate(eei, input),
            "withdraw" => self.withdraw(eei, input),
            "claimRewards" => self.claim_rewards(eei, input),
            "reDelegateRewards" => self.redelegate_rewards(eei, input),
            "updateRewards" => self.update_rewards(eei, input),
            "changeServiceFee" => self.change_service_fee(eei, input),
            "modifyTotalDelegationCap" => self.modify_total_delegation_cap(eei, input),
            "setAutomaticActivation" | "setCheckCapOnReDelegateRewards" => self.set_config_flag(eei, input),
            "whitelistForMerge" => self.whitelist_for_merge(eei, input),
            "deleteWhitelistForMerge" => self.delete_whitelist_for_merge(eei, input),
            "getWhitelistForMerge" => self.get_whitelist_for_merge(eei),
            "changeOwner" => self.change_owner(eei, input),
            "mergeValidatorDataToContract" => self.merge_validator_data_to_contract(eei, input),
            "getAllNodeStates" => self.get_all_node_states(eei),
            "getTotalActiveStake" => self.get_total_active_stake(eei),
            "getUserActiveStake" | "getUserUnStakedValue" | "getUserUnBondable" | "getClaimableRewards" => {
                self.get_delegator_view(eei, input)
            }
            "getNumUsers" => self.get_num_users(eei),
            "getContractConfig" => self.get_contract_config(eei),
            _ => Err(ContractError::InvalidMethod),
        }
    }
}
