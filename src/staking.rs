//! Per-BLS-key registry: node status, jail state and the waiting list.
//!
//! Registry mutations come from the validator contract; jail and queue
//! maintenance come from the end-of-epoch address. Views are open to anyone.

use cosmwasm_std::{to_json_vec, Uint128};
use cw2::set_contract_version;
use tracing::debug;

use crate::address::{END_OF_EPOCH_ADDRESS, VALIDATOR_SC_ADDRESS};
use crate::config::{GasCost, StakingSystemScConfig};
use crate::contract::{validate_caller, SystemSmartContract};
use crate::eei::Eei;
use crate::error::ContractError;
use crate::helpers::{
    decode_biguint, decode_u64, display_key, encode_biguint, encode_u64, require_address, require_min_args,
    require_num_args, to_vecs,
};
use crate::msg::{ContractCallInput, LogEntry};
use crate::state::{
    StakedData, StakingNodesConfig, JAILED_ROUND_SENTINEL, STAKED_DATA, STAKING_CONFIG,
    UNSTAKED_EPOCH_SENTINEL,
};
use crate::waiting_list;

const CONTRACT_NAME: &str = "crates.io:staking-system-sc-staking";
const CONTRACT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub struct StakingContract {
    config: StakingSystemScConfig,
    gas_cost: GasCost,
    stake_access: Vec<u8>,
    jail_access: Vec<u8>,
    end_of_epoch_access: Vec<u8>,
}

impl StakingContract {
    pub fn new(config: StakingSystemScConfig, gas_cost: GasCost) -> Self {
        Self {
            config,
            gas_cost,
            stake_access: VALIDATOR_SC_ADDRESS.to_vec(),
            jail_access: END_OF_EPOCH_ADDRESS.to_vec(),
            end_of_epoch_access: END_OF_EPOCH_ADDRESS.to_vec(),
        }
    }

    fn init(&self, eei: &mut Eei) -> Result<(), ContractError> {
        if STAKING_CONFIG.may_load(&eei.storage_read())?.is_some() {
            return Err(ContractError::AlreadyInitialized);
        }
        set_contract_version(&mut eei.storage(), CONTRACT_NAME, CONTRACT_VERSION)?;
        let nodes_config = StakingNodesConfig {
            min_num_nodes: self.config.min_num_nodes,
            max_num_nodes: self.config.max_num_nodes,
            staked_nodes: 0,
            jailed_nodes: 0,
        };
        STAKING_CONFIG.save(&mut eei.storage(), &nodes_config)?;
        Ok(())
    }

    fn use_gas_per_key(eei: &mut Eei, cost: u64, num_keys: usize) -> Result<(), ContractError> {
        eei.use_gas(cost.saturating_mul(num_keys.max(1) as u64))
    }

    fn load_config(eei: &Eei) -> Result<StakingNodesConfig, ContractError> {
        STAKING_CONFIG
            .may_load(&eei.storage_read())?
            .ok_or_else(|| ContractError::invalid_state("staking contract is not initialized"))
    }

    fn save_config(eei: &mut Eei, config: &StakingNodesConfig) -> Result<(), ContractError> {
        STAKING_CONFIG.save(&mut eei.storage(), config)?;
        Ok(())
    }

    fn load_key(eei: &Eei, key: &[u8]) -> Result<StakedData, ContractError> {
        STAKED_DATA
            .may_load(&eei.storage_read(), key)?
            .ok_or_else(|| ContractError::KeyNotFound(display_key(key)))
    }

    fn save_key(eei: &mut Eei, key: &[u8], data: &StakedData) -> Result<(), ContractError> {
        STAKED_DATA.save(&mut eei.storage(), key, data)?;
        Ok(())
    }

    /// Stakes the key when there is an active slot, queues it otherwise.
    fn activate_or_queue(
        eei: &mut Eei,
        key: &[u8],
        data: &mut StakedData,
        config: &mut StakingNodesConfig,
        unjailed: bool,
    ) -> Result<(), ContractError> {
        if config.staked_nodes < config.max_num_nodes {
            data.staked = true;
            data.waiting = false;
            data.staked_nonce = eei.block().nonce;
            config.staked_nodes += 1;
            return Ok(());
        }
        if unjailed {
            waiting_list::add_jailed_to_front(&mut eei.storage(), key)?;
        } else {
            waiting_list::add_to_end(&mut eei.storage(), key)?;
        }
        data.staked = false;
        data.waiting = true;
        Ok(())
    }

    /// Moves the waiting head into the active set.
    fn promote_from_queue(
        eei: &mut Eei,
        config: &mut StakingNodesConfig,
    ) -> Result<Option<Vec<u8>>, ContractError> {
        let Some(key) = waiting_list::pop_front(&mut eei.storage())? else {
            return Ok(None);
        };
        let mut data = Self::load_key(eei, &key)?;
        data.waiting = false;
        data.staked = true;
        data.staked_nonce = eei.block().nonce;
        Self::save_key(eei, &key, &data)?;
        config.staked_nodes += 1;
        debug!(key = %display_key(&key), "waiting node promoted");
        Ok(Some(key))
    }

    fn register(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &self.stake_access, "register")?;
        eei.use_gas(self.gas_cost.stake)?;
        require_num_args(&input.arguments, 4)?;
        let key = input.arguments[0].to_vec();
        if key.is_empty() {
            return Err(ContractError::invalid_args("empty bls key"));
        }
        let reward = require_address(&input.arguments[1], "reward")?;
        let owner = require_address(&input.arguments[2], "owner")?;
        let stake_value = decode_biguint(&input.arguments[3])?;

        let mut config = Self::load_config(eei)?;
        let existing = STAKED_DATA.may_load(&eei.storage_read(), &key)?;
        let mut data = match existing {
            Some(mut data) => {
                if data.owner_address.as_slice() != owner.as_slice() {
                    return Err(ContractError::invalid_state(format!(
                        "bls key {} already registered by another owner",
                        display_key(&key)
                    )));
                }
                if data.jailed {
                    return Err(ContractError::invalid_state(format!(
                        "bls key {} is jailed",
                        display_key(&key)
                    )));
                }
                data.stake_value = stake_value;
                data.reward_address = reward.as_slice().into();
                if data.staked || data.waiting {
                    return Self::save_key(eei, &key, &data);
                }
                data
            }
            None => StakedData::new(eei.block().nonce, &reward, &owner, stake_value),
        };

        data.unstaked_nonce = 0;
        data.unstaked_epoch = UNSTAKED_EPOCH_SENTINEL;
        Self::activate_or_queue(eei, &key, &mut data, &mut config, false)?;
        Self::save_key(eei, &key, &data)?;
        Self::save_config(eei, &config)
    }

    /// Takes a key out of rotation. `bypass_min` skips the minimum active
    /// nodes check, used at the end of an epoch.
    fn unstake_key(
        &self,
        eei: &mut Eei,
        key: &[u8],
        owner: Option<&[u8]>,
        bypass_min: bool,
    ) -> Result<(), ContractError> {
        let mut data = Self::load_key(eei, key)?;
        if let Some(owner) = owner {
            if data.owner_address.as_slice() != owner {
                return Err(ContractError::unauthorized(format!(
                    "bls key {} is not owned by caller",
                    display_key(key)
                )));
            }
        }
        let block = eei.block();
        let mut config = Self::load_config(eei)?;

        if data.waiting {
            waiting_list::remove(&mut eei.storage(), key)?;
            data.waiting = false;
        } else if data.staked {
            let head = waiting_list::load_head(&eei.storage_read())?;
            let remaining = config.staked_nodes.saturating_sub(1);
            if head.length == 0 && remaining < config.min_num_nodes && !bypass_min {
                return Err(ContractError::invalid_state(format!(
                    "unStake is not possible as there would be fewer than {} nodes left",
                    config.min_num_nodes
                )));
            }
            data.staked = false;
            config.staked_nodes = remaining;
            Self::promote_from_queue(eei, &mut config)?;
        } else if !data.jailed || data.unstaked_nonce > 0 {
            return Err(ContractError::invalid_state(format!(
                "bls key {} is already unStaked",
                display_key(key)
            )));
        }

        data.unstaked_nonce = block.nonce.max(1);
        data.unstaked_epoch = block.epoch;
        Self::save_key(eei, key, &data)?;
        Self::save_config(eei, &config)
    }

    fn unstake(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        let caller = input.caller.as_slice();
        let from_end_of_epoch = caller == self.end_of_epoch_access.as_slice();
        if !from_end_of_epoch {
            validate_caller(input, &self.stake_access, "unStake")?;
        }
        eei.use_gas(self.gas_cost.unstake)?;
        require_num_args(&input.arguments, 2)?;
        self.unstake_key(
            eei,
            &input.arguments[0],
            Some(input.arguments[1].as_slice()),
            from_end_of_epoch,
        )
    }

    fn unstake_at_end_of_epoch(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &self.end_of_epoch_access, "unStakeAtEndOfEpoch")?;
        eei.use_gas(self.gas_cost.unstake)?;
        require_num_args(&input.arguments, 1)?;
        self.unstake_key(eei, &input.arguments[0], None, true)
    }

    fn unbond(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &self.stake_access, "unBond")?;
        eei.use_gas(self.gas_cost.unbond)?;
        require_num_args(&input.arguments, 1)?;
        let key = input.arguments[0].as_slice();
        let data = Self::load_key(eei, key)?;
        let block = eei.block();

        if data.staked || data.waiting {
            return Err(ContractError::invalid_state("unBond is not possible for key which is staked"));
        }
        if data.jailed {
            return Err(ContractError::invalid_state("unBond is not possible for jailed key"));
        }
        if data.unstaked_nonce == 0 {
            return Err(ContractError::invalid_state(
                "unBond is not possible for key which was not unStaked",
            ));
        }
        if block.nonce.saturating_sub(data.unstaked_nonce) < self.config.unbond_period {
            return Err(ContractError::invalid_state("unBond period did not pass"));
        }
        if eei.features().unbond_epoch_check
            && block.epoch.saturating_sub(data.unstaked_epoch) < self.config.unbond_period_in_epochs
        {
            return Err(ContractError::invalid_state("unBond period did not pass"));
        }

        STAKED_DATA.remove(&mut eei.storage(), key);
        Ok(())
    }

    fn jail_key(eei: &mut Eei, key: &[u8], config: &mut StakingNodesConfig) -> Result<(), ContractError> {
        let mut data = Self::load_key(eei, key)?;
        if data.jailed {
            return Ok(());
        }
        let block = eei.block();
        if data.staked {
            data.staked = false;
            config.staked_nodes = config.staked_nodes.saturating_sub(1);
        } else if data.waiting {
            waiting_list::remove(&mut eei.storage(), key)?;
            data.waiting = false;
        }
        data.jailed = true;
        data.jailed_round = block.round;
        data.jailed_nonce = block.nonce;
        data.num_jailed += 1;
        config.jailed_nodes += 1;
        Self::save_key(eei, key, &data)
    }

    fn jail(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &self.jail_access, "jail")?;
        require_min_args(&input.arguments, 1)?;
        Self::use_gas_per_key(eei, self.gas_cost.unjail, input.arguments.len())?;
        let mut config = Self::load_config(eei)?;
        let address = eei.current_address().to_vec();
        for key in to_vecs(&input.arguments) {
            Self::jail_key(eei, &key, &mut config)?;
            eei.add_log_entry(LogEntry::new("jail", &address).add_topic(key));
        }
        Self::save_config(eei, &config)
    }

    fn unjail(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &self.stake_access, "unJail")?;
        eei.use_gas(self.gas_cost.unjail)?;
        require_num_args(&input.arguments, 1)?;
        let key = input.arguments[0].as_slice();
        let mut data = Self::load_key(eei, key)?;
        if !data.jailed {
            return Err(ContractError::invalid_state(format!(
                "cannot unJail a key that is not jailed: {}",
                display_key(key)
            )));
        }
        let mut config = Self::load_config(eei)?;
        data.jailed = false;
        data.jailed_round = JAILED_ROUND_SENTINEL;
        data.unjailed_nonce = eei.block().nonce;
        config.jailed_nodes = config.jailed_nodes.saturating_sub(1);
        if data.unstaked_nonce == 0 {
            Self::activate_or_queue(eei, key, &mut data, &mut config, true)?;
        }
        Self::save_key(eei, key, &data)?;
        Self::save_config(eei, &config)
    }

    fn switch_jailed_with_waiting(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &self.end_of_epoch_access, "switchJailedWithWaiting")?;
        eei.use_gas(self.gas_cost.unjail)?;
        require_num_args(&input.arguments, 1)?;
        let key = input.arguments[0].to_vec();
        let data = Self::load_key(eei, &key)?;
        if !data.staked {
            return Err(ContractError::invalid_state(format!(
                "cannot switch a key that is not staked: {}",
                display_key(&key)
            )));
        }
        let mut config = Self::load_config(eei)?;
        Self::jail_key(eei, &key, &mut config)?;
        let promoted = Self::promote_from_queue(eei, &mut config)?;
        let address = eei.current_address().to_vec();
        let mut entry = LogEntry::new("switchJailedWithWaiting", &address).add_topic(key);
        if let Some(promoted) = promoted {
            entry = entry.add_topic(promoted);
        }
        eei.add_log_entry(entry);
        Self::save_config(eei, &config)
    }

    fn restake_unstaked_nodes(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &self.stake_access, "reStakeUnStakedNodes")?;
        require_min_args(&input.arguments, 1)?;
        Self::use_gas_per_key(eei, self.gas_cost.stake, input.arguments.len())?;
        let mut config = Self::load_config(eei)?;
        for key in to_vecs(&input.arguments) {
            let mut data = Self::load_key(eei, &key)?;
            if data.staked || data.waiting || data.jailed || data.unstaked_nonce == 0 {
                return Err(ContractError::invalid_state(format!(
                    "cannot reStake key {} which is not unStaked",
                    display_key(&key)
                )));
            }
            data.unstaked_nonce = 0;
            data.unstaked_epoch = UNSTAKED_EPOCH_SENTINEL;
            Self::activate_or_queue(eei, &key, &mut data, &mut config, false)?;
            Self::save_key(eei, &key, &data)?;
        }
        Self::save_config(eei, &config)
    }

    fn change_reward_address(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &self.stake_access, "changeRewardAddress")?;
        eei.use_gas(self.gas_cost.change_reward_address)?;
        require_min_args(&input.arguments, 2)?;
        let reward = require_address(&input.arguments[0], "reward")?;
        for key in to_vecs(&input.arguments[1..]) {
            let mut data = Self::load_key(eei, &key)?;
            data.reward_address = reward.as_slice().into();
            Self::save_key(eei, &key, &data)?;
        }
        Ok(())
    }

    fn change_owner_and_reward_address(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &self.stake_access, "changeOwnerAndRewardAddress")?;
        eei.use_gas(self.gas_cost.change_reward_address)?;
        require_min_args(&input.arguments, 2)?;
        let owner = require_address(&input.arguments[0], "owner")?;
        for key in to_vecs(&input.arguments[1..]) {
            let mut data = Self::load_key(eei, &key)?;
            data.owner_address = owner.as_slice().into();
            data.reward_address = owner.as_slice().into();
            Self::save_key(eei, &key, &data)?;
        }
        Ok(())
    }

    fn stake_nodes_from_queue(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &self.end_of_epoch_access, "stakeNodesFromQueue")?;
        require_num_args(&input.arguments, 1)?;
        let requested = decode_u64(&input.arguments[0])?;
        let mut config = Self::load_config(eei)?;
        let mut promoted = 0u64;
        while promoted < requested && config.staked_nodes < config.max_num_nodes {
            if Self::promote_from_queue(eei, &mut config)?.is_none() {
                break;
            }
            promoted += 1;
        }
        eei.finish(encode_u64(promoted));
        Self::save_config(eei, &config)
    }

    fn update_config_min_nodes(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &self.end_of_epoch_access, "updateConfigMinNodes")?;
        require_num_args(&input.arguments, 1)?;
        let min = decode_u64(&input.arguments[0])?;
        let mut config = Self::load_config(eei)?;
        if min > config.max_num_nodes {
            return Err(ContractError::invalid_args(format!(
                "min nodes {min} greater than max nodes {}",
                config.max_num_nodes
            )));
        }
        eei.finish(encode_u64(config.min_num_nodes));
        config.min_num_nodes = min;
        Self::save_config(eei, &config)
    }

    fn update_config_max_nodes(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &self.end_of_epoch_access, "updateConfigMaxNodes")?;
        require_num_args(&input.arguments, 1)?;
        let max = decode_u64(&input.arguments[0])?;
        let mut config = Self::load_config(eei)?;
        if max < config.min_num_nodes || max < config.staked_nodes {
            return Err(ContractError::invalid_args(format!(
                "max nodes {max} lower than min nodes {} or staked nodes {}",
                config.min_num_nodes, config.staked_nodes
            )));
        }
        eei.finish(encode_u64(config.max_num_nodes));
        config.max_num_nodes = max;
        while config.staked_nodes < config.max_num_nodes {
            if Self::promote_from_queue(eei, &mut config)?.is_none() {
                break;
            }
        }
        Self::save_config(eei, &config)
    }

    // views

    fn get(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        require_num_args(&input.arguments, 1)?;
        let data = Self::load_key(eei, &input.arguments[0])?;
        eei.finish(to_json_vec(&data)?);
        Ok(())
    }

    fn get_bls_key_status(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        require_num_args(&input.arguments, 1)?;
        let data = Self::load_key(eei, &input.arguments[0])?;
        eei.finish(data.status().as_str());
        Ok(())
    }

    fn is_staked(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        require_num_args(&input.arguments, 1)?;
        let data = Self::load_key(eei, &input.arguments[0])?;
        if !data.staked {
            return Err(ContractError::invalid_state("account not staked"));
        }
        Ok(())
    }

    fn get_remaining_unbond_period(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        require_num_args(&input.arguments, 1)?;
        let data = Self::load_key(eei, &input.arguments[0])?;
        if data.staked || data.waiting || data.unstaked_nonce == 0 {
            return Err(ContractError::invalid_state("key is not unStaked"));
        }
        let unbond_nonce = data.unstaked_nonce.saturating_add(self.config.unbond_period);
        let remaining = unbond_nonce.saturating_sub(eei.block().nonce);
        eei.finish(encode_u64(remaining));
        Ok(())
    }

    fn get_queue_size(&self, eei: &mut Eei) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        let head = waiting_list::load_head(&eei.storage_read())?;
        eei.finish(encode_u64(u64::from(head.length)));
        Ok(())
    }

    fn get_queue_index(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        require_num_args(&input.arguments, 1)?;
        let index = waiting_list::index_of(&eei.storage_read(), &input.arguments[0])?
            .ok_or_else(|| ContractError::invalid_args("element not in waiting list"))?;
        eei.finish(encode_u64(u64::from(index)));
        Ok(())
    }

    fn get_reward_address(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        require_num_args(&input.arguments, 1)?;
        let data = Self::load_key(eei, &input.arguments[0])?;
        eei.finish(data.reward_address.to_vec());
        Ok(())
    }

    fn get_owner(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        require_num_args(&input.arguments, 1)?;
        let data = Self::load_key(eei, &input.arguments[0])?;
        eei.finish(data.owner_address.to_vec());
        Ok(())
    }

    fn get_total_number_of_registered_nodes(&self, eei: &mut Eei) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.get)?;
        let config = Self::load_config(eei)?;
        let head = waiting_list::load_head(&eei.storage_read())?;
        let total = Uint128::from(config.staked_nodes) + Uint128::from(head.length);
        eei.finish(encode_biguint(total));
        Ok(())
    }
}

impl SystemSmartContract for StakingContract {
    fn name(&self) -> &'static str {
        "staking"
    }

    fn execute(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        if input.function == "init" {
            return self.init(eei);
        }
        Self::load_config(eei)?;

        match input.function.as_str() {
            "register" => self.register(eei, input),
            "unStake" => self.unstake(eei, input),
            "unStakeAtEndOfEpoch" => self.unstake_at_end_of_epoch(eei, input),
            "unBond" => self.unbond(eei, input),
            "jail" => self.jail(eei, input),
            "unJail" => self.unjail(eei, input),
            "switchJailedWithWaiting" => self.switch_jailed_with_waiting(eei, input),
            "reStakeUnStakedNodes" => self.restake_unstaked_nodes(eei, input),
            "changeRewardAddress" => self.change_reward_address(eei, input),
            "changeOwnerAndRewardAddress" => self.change_owner_and_reward_address(eei, input),
            "stakeNodesFromQueue" => self.stake_nodes_from_queue(eei, input),
            "updateConfigMinNodes" => self.update_config_min_nodes(eei, input),
            "updateConfigMaxNodes" => self.update_config_max_nodes(eei, input),
            "get" => self.get(eei, input),
            "getBLSKeyStatus" => self.get_bls_key_status(eei, input),
            "isStaked" => self.is_staked(eei, input),
            "getRemainingUnBondPeriod" => self.get_remaining_unbond_period(eei, input),
            "getQueueSize" => self.get_queue_size(eei),
            "getQueueIndex" => self.get_queue_index(eei, input),
            "getRewardAddress" => self.get_reward_address(eei, input),
            "getOwner" => self.get_owner(eei, input),
            "getTotalNumberOfRegisteredNodes" => self.get_total_number_of_registered_nodes(eei),
            _ => Err(ContractError::InvalidMethod),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cosmwasm_std::Binary;
    use crate::address::STAKING_SC_ADDRESS;
    use crate::config::SystemScConfig;
    use crate::contract::SystemVm;
    use crate::msg::{ReturnCode, VmOutput};
    use crate::query::QueryFacade;
    use crate::validator::SkipSignatureCheck;
    use std::sync::Arc;

    const OWNER: [u8; 32] = [3u8; 32];

    fn vm(min_num_nodes: u64, max_num_nodes: u64) -> Arc<SystemVm> {
        let mut config = SystemScConfig::default();
        config.staking.min_num_nodes = min_num_nodes;
        config.staking.max_num_nodes = max_num_nodes;
        let vm = SystemVm::new(&config, Arc::new(SkipSignatureCheck)).unwrap();
        vm.init_system_contracts(&OWNER).unwrap();
        Arc::new(vm)
    }

    fn call(vm: &SystemVm, caller: &[u8], function: &str, args: Vec<Vec<u8>>) -> VmOutput {
        vm.run_contract_call(&ContractCallInput::new(caller, &STAKING_SC_ADDRESS, function).with_args(args))
    }

    fn register(vm: &SystemVm, key: &[u8]) -> VmOutput {
        call(
            vm,
            &VALIDATOR_SC_ADDRESS,
            "register",
            vec![key.to_vec(), OWNER.to_vec(), OWNER.to_vec(), encode_biguint(Uint128::new(2_500_000))],
        )
    }

    fn status(vm: &Arc<SystemVm>, key: &[u8]) -> String {
        QueryFacade::new(vm.clone()).staked_key(key).unwrap().unwrap().status
    }

    fn queue_size(vm: &SystemVm) -> Vec<u8> {
        let output = vm.run_query(&ContractCallInput::new(&OWNER, &STAKING_SC_ADDRESS, "getQueueSize"));
        output.return_data[0].to_vec()
    }

    #[test]
    fn keys_past_the_cap_wait_for_a_free_slot() {
        let vm = vm(0, 2);
        for key in [b"k1", b"k2", b"k3"] {
            assert!(register(&vm, key).is_ok());
        }
        assert_eq!(status(&vm, b"k3"), "queued");
        assert_eq!(queue_size(&vm), encode_u64(1));

        let output = call(&vm, &VALIDATOR_SC_ADDRESS, "unStake", vec![b"k1".to_vec(), OWNER.to_vec()]);
        assert!(output.is_ok(), "{}", output.return_message);
        assert_eq!(status(&vm, b"k1"), "unStaked");
        assert_eq!(status(&vm, b"k3"), "staked");
        assert_eq!(queue_size(&vm), encode_u64(0));
    }

    #[test]
    fn unstake_keeps_the_minimum_active_set() {
        let vm = vm(1, 4);
        assert!(register(&vm, b"k1").is_ok());

        let output = call(&vm, &VALIDATOR_SC_ADDRESS, "unStake", vec![b"k1".to_vec(), OWNER.to_vec()]);
        assert_eq!(output.return_code, ReturnCode::UserError);
        assert!(output.return_message.contains("fewer than 1 nodes"));
        assert_eq!(status(&vm, b"k1"), "staked");

        let output = call(&vm, &END_OF_EPOCH_ADDRESS, "unStake", vec![b"k1".to_vec(), OWNER.to_vec()]);
        assert!(output.is_ok(), "{}", output.return_message);
        assert_eq!(status(&vm, b"k1"), "unStaked");
    }

    #[test]
    fn unjailed_key_goes_to_the_front_of_the_queue() {
        let vm = vm(0, 1);
        for key in [b"k1", b"k2", b"k3"] {
            assert!(register(&vm, key).is_ok());
        }

        let output = call(&vm, &END_OF_EPOCH_ADDRESS, "switchJailedWithWaiting", vec![b"k1".to_vec()]);
        assert!(output.is_ok(), "{}", output.return_message);
        let log = &output.logs[0];
        assert_eq!(log.topics, vec![Binary::from(b"k1".as_slice()), Binary::from(b"k2".as_slice())]);
        assert_eq!(status(&vm, b"k1"), "jailed");
        assert_eq!(status(&vm, b"k2"), "staked");

        let output = call(&vm, &VALIDATOR_SC_ADDRESS, "unJail", vec![b"k1".to_vec()]);
        assert!(output.is_ok(), "{}", output.return_message);
        assert_eq!(status(&vm, b"k1"), "queued");

        let index = vm.run_query(
            &ContractCallInput::new(&OWNER, &STAKING_SC_ADDRESS, "getQueueIndex").with_args(vec![b"k1".to_vec()]),
        );
        assert_eq!(index.return_data[0].to_vec(), encode_u64(1));
        assert_eq!(queue_size(&vm), encode_u64(2));
    }

    #[test]
    fn jail_frees_an_active_slot() {
        let vm = vm(0, 2);
        assert!(register(&vm, b"k1").is_ok());

        let output = call(&vm, &END_OF_EPOCH_ADDRESS, "jail", vec![b"k1".to_vec()]);
        assert!(output.is_ok(), "{}", output.return_message);
        assert_eq!(status(&vm, b"k1"), "jailed");

        let output = call(&vm, &VALIDATOR_SC_ADDRESS, "unBond", vec![b"k1".to_vec()]);
        assert!(output.return_message.contains("unBond is not possible for jailed key"));

        let output = call(&vm, &OWNER, "jail", vec![b"k1".to_vec()]);
        assert_eq!(output.return_code, ReturnCode::UserError);
    }

    #[test]
    fn registry_changes_are_charged() {
        let vm = vm(0, 2);
        let input = ContractCallInput::new(&VALIDATOR_SC_ADDRESS, &STAKING_SC_ADDRESS, "register")
            .with_args(vec![b"k1".to_vec(), OWNER.to_vec(), OWNER.to_vec(), encode_biguint(Uint128::new(1))])
            .with_gas(1_000);
        let output = vm.run_contract_call(&input);
        assert_eq!(output.return_code, ReturnCode::OutOfGas);
        assert!(QueryFacade::new(vm.clone()).staked_key(b"k1").unwrap().is_none());
    }

    #[test]
    fn empty_key_is_refused() {
        let vm = vm(0, 2);
        let output = register(&vm, b"");
        assert_eq!(output.return_code, ReturnCode::UserError);
        assert_eq!(queue_size(&vm), encode_u64(0));
    }
}
