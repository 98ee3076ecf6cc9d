use cosmwasm_schema::cw_serde;
use cosmwasm_std::{Binary, CanonicalAddr, Uint128};
use cw_storage_plus::{Item, Map};

/// `unstaked_epoch` of a key that was never unstaked.
pub const UNSTAKED_EPOCH_SENTINEL: u32 = u32::MAX;
/// `jailed_round` of a key that is not jailed.
pub const JAILED_ROUND_SENTINEL: u64 = u64::MAX;

// ============================================================================
// Staking
// ============================================================================

#[cw_serde]
pub struct StakedData {
    pub register_nonce: u64,
    pub staked_nonce: u64,
    /// Zero while the key is staked.
    pub unstaked_nonce: u64,
    pub unstaked_epoch: u32,
    pub staked: bool,
    pub reward_address: CanonicalAddr,
    pub owner_address: CanonicalAddr,
    pub stake_value: Uint128,
    pub jailed_round: u64,
    pub jailed_nonce: u64,
    pub unjailed_nonce: u64,
    pub jailed: bool,
    /// Registered but queued in the waiting list.
    pub waiting: bool,
    pub num_jailed: u32,
    pub slash_value: Uint128,
}

impl StakedData {
    pub fn new(nonce: u64, reward: &[u8], owner: &[u8], stake_value: Uint128) -> Self {
        Self {
            register_nonce: nonce,
            staked_nonce: 0,
            unstaked_nonce: 0,
            unstaked_epoch: UNSTAKED_EPOCH_SENTINEL,
            staked: false,
            reward_address: CanonicalAddr::from(reward),
            owner_address: CanonicalAddr::from(owner),
            stake_value,
            jailed_round: JAILED_ROUND_SENTINEL,
            jailed_nonce: 0,
            unjailed_nonce: 0,
            jailed: false,
            waiting: false,
            num_jailed: 0,
            slash_value: Uint128::zero(),
        }
    }

    pub fn status(&self) -> KeyStatus {
        if self.jailed || self.jailed_round != JAILED_ROUND_SENTINEL {
            KeyStatus::Jailed
        } else if self.waiting {
            KeyStatus::Queued
        } else if self.staked {
            KeyStatus::Staked
        } else {
            KeyStatus::UnStaked
        }
    }
}

#[cw_serde]
#[derive(Copy, Eq)]
pub enum KeyStatus {
    Staked,
    Jailed,
    Queued,
    UnStaked,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Staked => "staked",
            KeyStatus::Jailed => "jailed",
            KeyStatus::Queued => "queued",
            KeyStatus::UnStaked => "unStaked",
        }
    }
}

#[cw_serde]
pub struct StakingNodesConfig {
    pub min_num_nodes: u64,
    pub max_num_nodes: u64,
    pub staked_nodes: u64,
    pub jailed_nodes: u64,
}

#[cw_serde]
#[derive(Default)]
pub struct WaitingListHead {
    pub first_key: Binary,
    pub last_key: Binary,
    pub length: u32,
    /// Last unjailed key placed at the front; later unjailed keys go after it.
    pub last_jailed_key: Binary,
}

#[cw_serde]
pub struct ElementInList {
    pub bls_public_key: Binary,
    pub previous_key: Binary,
    pub next_key: Binary,
}

pub const STAKING_CONFIG: Item<StakingNodesConfig> = Item::new("nodesConfig");
pub const STAKED_DATA: Map<&[u8], StakedData> = Map::new("staked");
pub const WAITING_LIST_HEAD: Item<WaitingListHead> = Item::new("waitingList");
pub const WAITING_ELEMENTS: Map<&[u8], ElementInList> = Map::new("w_");

// ============================================================================
// Validator
// ============================================================================

#[cw_serde]
pub struct UnstakedValue {
    pub unstaked_epoch: u32,
    pub unstaked_value: Uint128,
}

#[cw_serde]
pub struct ValidatorData {
    pub reward_address: CanonicalAddr,
    pub register_nonce: u64,
    pub epoch: u32,
    pub bls_pub_keys: Vec<Binary>,
    pub total_stake_value: Uint128,
    pub locked_stake: Uint128,
    pub max_stake_per_node: Uint128,
    pub num_registered: u32,
    pub unstaked_info: Vec<UnstakedValue>,
    pub total_unstaked: Uint128,
    pub total_slashed: Uint128,
}

impl ValidatorData {
    pub fn new(reward: &[u8], nonce: u64, epoch: u32) -> Self {
        Self {
            reward_address: CanonicalAddr::from(reward),
            register_nonce: nonce,
            epoch,
            bls_pub_keys: vec![],
            total_stake_value: Uint128::zero(),
            locked_stake: Uint128::zero(),
            max_stake_per_node: Uint128::zero(),
            num_registered: 0,
            unstaked_info: vec![],
            total_unstaked: Uint128::zero(),
            total_slashed: Uint128::zero(),
        }
    }

    pub fn has_key(&self, key: &[u8]) -> bool {
        self.bls_pub_keys.iter().any(|k| k.as_slice() == key)
    }

    /// Nothing left to track for this owner.
    pub fn is_empty(&self) -> bool {
        self.num_registered == 0 && self.total_stake_value.is_zero() && self.total_unstaked.is_zero()
    }
}

#[cw_serde]
pub struct ValidatorConfig {
    pub node_price: Uint128,
    pub min_deposit: Uint128,
    pub unjail_price: Uint128,
    /// Address allowed to call `setConfig`.
    pub owner: CanonicalAddr,
}

pub const VALIDATOR_CONFIG: Item<ValidatorConfig> = Item::new("config");
pub const VALIDATORS: Map<&[u8], ValidatorData> = Map::new("validator");
pub const UNSTAKE_UNBOND_PAUSED: Item<bool> = Item::new("unStakeUnBondPause");

// ============================================================================
// Delegation manager
// ============================================================================

#[cw_serde]
pub struct DelegationManagement {
    pub num_of_contracts: u32,
    pub last_address: CanonicalAddr,
    pub min_service_fee: u64,
    pub max_service_fee: u64,
    pub min_deposit: Uint128,
    pub min_delegation_amount: Uint128,
}

#[cw_serde]
#[derive(Default)]
pub struct DelegationContractList {
    /// Head element is the first delegation address sentinel.
    pub addresses: Vec<CanonicalAddr>,
}

pub const DELEGATION_MANAGEMENT: Item<DelegationManagement> = Item::new("delegationManagement");
pub const DELEGATION_CONTRACT_LIST: Item<DelegationContractList> = Item::new("delegationContracts");
/// Owner address to the delegation contract it deployed.
pub const DEPLOYED_BY_OWNER: Map<&[u8], CanonicalAddr> = Map::new("owner");

// ============================================================================
// Delegation
// ============================================================================

#[cw_serde]
pub struct DelegationConfig {
    pub max_delegation_cap: Uint128,
    pub initial_owner_funds: Uint128,
    pub automatic_activation: bool,
    pub changeable_service_fee: bool,
    pub check_cap_on_redelegate: bool,
    pub created_nonce: u64,
    pub unbond_period_in_epochs: u32,
}

#[cw_serde]
pub struct NodesData {
    pub bls_key: Binary,
    pub signed_msg: Binary,
}

#[cw_serde]
#[derive(Default)]
pub struct DelegationContractStatus {
    pub staked_keys: Vec<NodesData>,
    pub not_staked_keys: Vec<NodesData>,
    pub unstaked_keys: Vec<NodesData>,
    pub num_users: u64,
}

impl DelegationContractStatus {
    pub fn contains(&self, key: &[u8]) -> bool {
        self.staked_keys
            .iter()
            .chain(self.not_staked_keys.iter())
            .chain(self.unstaked_keys.iter())
            .any(|n| n.bls_key.as_slice() == key)
    }
}

#[cw_serde]
#[derive(Default)]
pub struct GlobalFundData {
    pub total_active: Uint128,
    pub total_unstaked: Uint128,
}

#[cw_serde]
pub struct UnstakedFund {
    pub value: Uint128,
    pub epoch: u32,
}

#[cw_serde]
#[derive(Default)]
pub struct DelegatorData {
    pub active_fund: Uint128,
    pub unstaked_funds: Vec<UnstakedFund>,
    pub unclaimed_rewards: Uint128,
    pub total_cumulated_rewards: Uint128,
    pub reward_checkpoint_epoch: u32,
}

impl DelegatorData {
    pub fn is_empty(&self) -> bool {
        self.active_fund.is_zero() && self.unstaked_funds.is_empty() && self.unclaimed_rewards.is_zero()
    }
}

#[cw_serde]
pub struct RewardComputationData {
    pub reward: Uint128,
    pub total_active: Uint128,
    pub service_fee: u64,
}

pub const DELEGATION_CONFIG: Item<DelegationConfig> = Item::new("delegationConfig");
pub const DELEGATION_STATUS: Item<DelegationContractStatus> = Item::new("delegationStatus");
pub const DELEGATION_OWNER: Item<CanonicalAddr> = Item::new("owner");
pub const SERVICE_FEE: Item<u64> = Item::new("serviceFee");
pub const GLOBAL_FUND: Item<GlobalFundData> = Item::new("globalFund");
pub const TOTAL_STAKED_REWARDS: Item<Uint128> = Item::new("totalStakedRewards");
pub const DELEGATORS: Map<&[u8], DelegatorData> = Map::new("delegator");
pub const REWARDS_BY_EPOCH: Map<u32, RewardComputationData> = Map::new("rewards");
pub const WHITELIST_FOR_MERGE: Item<CanonicalAddr> = Item::new("whitelistedAddress");

#[cfg(test)]
mod tests {
    use super::*;
    use cosmwasm_std::{from_json, to_json_vec};

    #[test]
    fn new_staked_data_uses_sentinels() {
        let data = StakedData::new(3, b"reward", b"owner", Uint128::new(10));
        assert_eq!(data.unstaked_epoch, UNSTAKED_EPOCH_SENTINEL);
        assert_eq!(data.jailed_round, JAILED_ROUND_SENTINEL);
        assert_eq!(data.status(), KeyStatus::UnStaked);
    }

    #[test]
    fn stored_records_keep_every_field() {
        let mut data = ValidatorData::new(b"reward", 7, 2);
        data.bls_pub_keys.push(Binary::from(b"key".as_slice()));
        data.unstaked_info.push(UnstakedValue {
            unstaked_epoch: u32::MAX,
            unstaked_value: Uint128::MAX,
        });
        data.total_unstaked = Uint128::MAX;
        let raw = to_json_vec(&data).unwrap();
        let back: ValidatorData = from_json(&raw).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn status_precedence() {
        let mut data = StakedData::new(1, b"r", b"o", Uint128::zero());
        data.staked = true;
        assert_eq!(data.status(), KeyStatus::Staked);
        data.staked = false;
        data.waiting = true;
        assert_eq!(data.status(), KeyStatus::Queued);
        data.jailed = true;
        assert_eq!(data.status(), KeyStatus::Jailed);
    }
}
