//! Read-only access for API readers running next to block execution.
//!
//! Every read works on the committed state under a read guard; contract views
//! run against a private clone that is dropped afterwards.

use cosmwasm_std::{Binary, Order, StdResult};
use cw_storage_plus::Bound;
use std::sync::Arc;
use tracing::debug;

use crate::address::{
    DELEGATION_MANAGER_SC_ADDRESS, STAKING_SC_ADDRESS, VALIDATOR_SC_ADDRESS,
};
use crate::contract::SystemVm;
use crate::msg::{
    ContractCallInput, DelegationContractsResponse, StakedKeyResponse, ValidatorResponse, VmOutput,
};
use crate::state::{
    DelegatorData, StakedData, ValidatorData, DELEGATION_CONTRACT_LIST, DELEGATORS, STAKED_DATA,
    VALIDATORS,
};

const DEFAULT_LIMIT: u32 = 10;
const MAX_LIMIT: u32 = 30;

fn staked_key_response(key: Vec<u8>, data: StakedData) -> StakedKeyResponse {
    StakedKeyResponse {
        bls_key: Binary::from(key),
        owner: Binary::from(data.owner_address.as_slice()),
        status: data.status().as_str().to_string(),
        jailed: data.jailed,
        unstaked_nonce: data.unstaked_nonce,
    }
}

fn validator_response(owner: Vec<u8>, data: ValidatorData) -> ValidatorResponse {
    ValidatorResponse {
        owner: Binary::from(owner),
        num_registered: data.num_registered,
        total_stake_value: data.total_stake_value,
        locked_stake: data.locked_stake,
        total_unstaked: data.total_unstaked,
        bls_keys: data.bls_pub_keys,
    }
}

#[derive(Clone)]
pub struct QueryFacade {
    vm: Arc<SystemVm>,
}

impl QueryFacade {
    pub fn new(vm: Arc<SystemVm>) -> Self {
        Self { vm }
    }

    /// Runs a contract view such as `getBlsKeysStatus` or `getTotalStaked`.
    /// Writes made by the view are discarded.
    pub fn execute_view(&self, caller: &[u8], recipient: &[u8], function: &str, args: &[Vec<u8>]) -> VmOutput {
        debug!(function, "system contract view");
        let input = ContractCallInput::new(caller, recipient, function).with_args(args.iter().map(|a| a.as_slice()));
        self.vm.run_query(&input)
    }

    pub fn staked_key(&self, bls_key: &[u8]) -> StdResult<Option<StakedKeyResponse>> {
        let state = self.vm.state();
        let state = state.read();
        let data = STAKED_DATA.may_load(&state.contract_storage_read(&STAKING_SC_ADDRESS), bls_key)?;
        Ok(data.map(|d| staked_key_response(bls_key.to_vec(), d)))
    }

    /// Registered keys in key order, paginated with `start_after`.
    pub fn staked_keys(&self, start_after: Option<&[u8]>, limit: Option<u32>) -> StdResult<Vec<StakedKeyResponse>> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT) as usize;
        let start = start_after.map(|key| Bound::exclusive(key));

        let state = self.vm.state();
        let state = state.read();
        let storage = state.contract_storage_read(&STAKING_SC_ADDRESS);
        STAKED_DATA
            .range(&storage, start, None, Order::Ascending)
            .take(limit)
            .map(|item| item.map(|(key, data)| staked_key_response(key, data)))
            .collect()
    }

    pub fn validator(&self, owner: &[u8]) -> StdResult<Option<ValidatorResponse>> {
        let state = self.vm.state();
        let state = state.read();
        let data = VALIDATORS.may_load(&state.contract_storage_read(&VALIDATOR_SC_ADDRESS), owner)?;
        Ok(data.map(|d| validator_response(owner.to_vec(), d)))
    }

    pub fn validators(&self, start_after: Option<&[u8]>, limit: Option<u32>) -> StdResult<Vec<ValidatorResponse>> {
        let limit = limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT) as usize;
        let start = start_after.map(|key| Bound::exclusive(key));

        let state = self.vm.state();
        let state = state.read();
        let storage = state.contract_storage_read(&VALIDATOR_SC_ADDRESS);
        VALIDATORS
            .range(&storage, start, None, Order::Ascending)
            .take(limit)
            .map(|item| item.map(|(owner, data)| validator_response(owner, data)))
            .collect()
    }

    /// Deployed delegation contracts, oldest first.
    pub fn delegation_contracts(&self) -> StdResult<DelegationContractsResponse> {
        let state = self.vm.state();
        let state = state.read();
        let list = DELEGATION_CONTRACT_LIST
            .may_load(&state.contract_storage_read(&DELEGATION_MANAGER_SC_ADDRESS))?
            .unwrap_or_default();
        Ok(DelegationContractsResponse {
            addresses: list
                .addresses
                .iter()
                .skip(1)
                .map(|a| Binary::from(a.as_slice()))
                .collect(),
        })
    }

    pub fn delegator(&self, delegation: &[u8], address: &[u8]) -> StdResult<Option<DelegatorData>> {
        let state = self.vm.state();
        let state = state.read();
        DELEGATORS.may_load(&state.contract_storage_read(delegation), address)
    }
}
