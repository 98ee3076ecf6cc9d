//! Epoch-gated behaviour switches.
//!
//! `EnableEpochs` is the configured activation table. Contracts never consult
//! it from business logic: at call entry they project it into a `FeatureSet`
//! for the current epoch and branch on the resulting booleans.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EnableEpochFlag {
    StakingV2,
    StakingV2AfterEpoch,
    DoubleKeyProtection,
    UnBondTokensV2,
    UnBondEpochCheck,
    ValidatorToDelegation,
    DelegationManager,
    DelegationSmartContract,
    FixDelegationChangeOwnerOnAccount,
    MultiClaimOnDelegation,
    AddTokensToDelegation,
    ComputeRewardCheckpointFromDelegationOwner,
    ReDelegateBelowMinCheck,
    DeleteDelegatorAfterClaimRewards,
    ChangeDelegationOwner,
}

impl EnableEpochFlag {
    pub const ALL: [EnableEpochFlag; 15] = [
        EnableEpochFlag::StakingV2,
        EnableEpochFlag::StakingV2AfterEpoch,
        EnableEpochFlag::DoubleKeyProtection,
        EnableEpochFlag::UnBondTokensV2,
        EnableEpochFlag::UnBondEpochCheck,
        EnableEpochFlag::ValidatorToDelegation,
        EnableEpochFlag::DelegationManager,
        EnableEpochFlag::DelegationSmartContract,
        EnableEpochFlag::FixDelegationChangeOwnerOnAccount,
        EnableEpochFlag::MultiClaimOnDelegation,
        EnableEpochFlag::AddTokensToDelegation,
        EnableEpochFlag::ComputeRewardCheckpointFromDelegationOwner,
        EnableEpochFlag::ReDelegateBelowMinCheck,
        EnableEpochFlag::DeleteDelegatorAfterClaimRewards,
        EnableEpochFlag::ChangeDelegationOwner,
    ];
}

/// Activation epoch per flag. A flag missing from the table is never active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnableEpochs(BTreeMap<EnableEpochFlag, u32>);

impl Default for EnableEpochs {
    fn default() -> Self {
        Self::all_at(0)
    }
}

impl EnableEpochs {
    pub fn all_at(epoch: u32) -> Self {
        Self(EnableEpochFlag::ALL.iter().map(|f| (*f, epoch)).collect())
    }

    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    pub fn with(mut self, flag: EnableEpochFlag, epoch: u32) -> Self {
        self.0.insert(flag, epoch);
        self
    }

    pub fn without(mut self, flag: EnableEpochFlag) -> Self {
        self.0.remove(&flag);
        self
    }

    pub fn is_active(&self, flag: EnableEpochFlag, epoch: u32) -> bool {
        self.0.get(&flag).map_or(false, |activation| epoch >= *activation)
    }

    /// Fails when one of `required` has no activation epoch configured.
    pub fn check_compatibility(&self, required: &[EnableEpochFlag]) -> Result<(), ConfigError> {
        match required.iter().find(|f| !self.0.contains_key(f)) {
            Some(missing) => Err(ConfigError::MissingFlag(format!("{missing:?}"))),
            None => Ok(()),
        }
    }

    pub fn features_at(&self, epoch: u32) -> FeatureSet {
        use EnableEpochFlag::*;
        let on = |flag| self.is_active(flag, epoch);
        FeatureSet {
            staking_v2: on(StakingV2),
            staking_v2_after_epoch: on(StakingV2AfterEpoch),
            double_key_protection: on(DoubleKeyProtection),
            unbond_tokens_v2: on(UnBondTokensV2),
            unbond_epoch_check: on(UnBondEpochCheck),
            validator_to_delegation: on(ValidatorToDelegation),
            delegation_manager: on(DelegationManager),
            delegation_sc: on(DelegationSmartContract),
            fix_delegation_change_owner: on(FixDelegationChangeOwnerOnAccount),
            multi_claim_on_delegation: on(MultiClaimOnDelegation),
            add_tokens: on(AddTokensToDelegation),
            compute_reward_checkpoint: on(ComputeRewardCheckpointFromDelegationOwner),
            redelegate_below_min_check: on(ReDelegateBelowMinCheck),
            delete_delegator_after_claim_rewards: on(DeleteDelegatorAfterClaimRewards),
            change_delegation_owner: on(ChangeDelegationOwner),
        }
    }
}

/// Flag states for one call, projected at call entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureSet {
    pub staking_v2: bool,
    pub staking_v2_after_epoch: bool,
    pub double_key_protection: bool,
    pub unbond_tokens_v2: bool,
    pub unbond_epoch_check: bool,
    pub validator_to_delegation: bool,
    pub delegation_manager: bool,
    pub delegation_sc: bool,
    pub fix_delegation_change_owner: bool,
    pub multi_claim_on_delegation: bool,
    pub add_tokens: bool,
    pub compute_reward_checkpoint: bool,
    pub redelegate_below_min_check: bool,
    pub delete_delegator_after_claim_rewards: bool,
    pub change_delegation_owner: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_activate_at_their_epoch() {
        let epochs = EnableEpochs::empty()
            .with(EnableEpochFlag::StakingV2, 5)
            .with(EnableEpochFlag::UnBondTokensV2, 0);

        let before = epochs.features_at(4);
        assert!(!before.staking_v2);
        assert!(before.unbond_tokens_v2);
        assert!(!before.delegation_manager);

        let after = epochs.features_at(5);
        assert!(after.staking_v2);
    }

    #[test]
    fn compatibility_reports_missing_flag() {
        let epochs = EnableEpochs::all_at(0).without(EnableEpochFlag::AddTokensToDelegation);
        let err = epochs
            .check_compatibility(&[EnableEpochFlag::StakingV2, EnableEpochFlag::AddTokensToDelegation])
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingFlag("AddTokensToDelegation".to_string()));
        assert!(epochs.check_compatibility(&[EnableEpochFlag::StakingV2]).is_ok());
    }

    #[test]
    fn table_loads_from_json() {
        let epochs: EnableEpochs =
            serde_json::from_str(r#"{"StakingV2": 3, "DelegationManager": 1}"#).unwrap();
        assert!(epochs.is_active(EnableEpochFlag::DelegationManager, 1));
        assert!(!epochs.is_active(EnableEpochFlag::StakingV2, 2));
        assert!(!epochs.is_active(EnableEpochFlag::DoubleKeyProtection, 100));
    }
}
