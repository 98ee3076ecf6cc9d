//! Factory and registry of delegation contract instances.

use cosmwasm_std::{CanonicalAddr, Uint128};
use cw2::set_contract_version;
use tracing::info;

use crate::address::{
    next_delegation_address, FIRST_DELEGATION_SC_ADDRESS, GOVERNANCE_SC_ADDRESS,
    VALIDATOR_SC_ADDRESS,
};
use crate::config::{DelegationManagerSystemScConfig, GasCost};
use crate::contract::{validate_caller, SystemSmartContract, DELEGATION_CODE};
use crate::eei::Eei;
use crate::error::ContractError;
use crate::funding::{Funded, FundingPolicy};
use crate::helpers::{
    decode_biguint, decode_u64, display_key, encode_biguint, encode_u64, require_address,
    require_num_args,
};
use crate::msg::{ContractCallInput, LogEntry, NestedOutput};
use crate::state::{
    DelegationContractList, DelegationManagement, DELEGATION_CONTRACT_LIST, DELEGATION_MANAGEMENT,
    DEPLOYED_BY_OWNER, VALIDATORS, WHITELIST_FOR_MERGE,
};

const CONTRACT_NAME: &str = "crates.io:staking-system-sc-delegation-manager";
const CONTRACT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const ALREADY_DEPLOYED: &str = "caller already deployed a delegation sc";

pub struct DelegationManagerContract {
    config: DelegationManagerSystemScConfig,
    gas_cost: GasCost,
    funding: FundingPolicy,
}

impl DelegationManagerContract {
    pub fn new(config: DelegationManagerSystemScConfig, gas_cost: GasCost, funding: FundingPolicy) -> Self {
        Self {
            config,
            gas_cost,
            funding,
        }
    }

    fn init(&self, eei: &mut Eei) -> Result<(), ContractError> {
        if DELEGATION_MANAGEMENT.may_load(&eei.storage_read())?.is_some() {
            return Err(ContractError::AlreadyInitialized);
        }
        set_contract_version(&mut eei.storage(), CONTRACT_NAME, CONTRACT_VERSION)?;
        let management = DelegationManagement {
            num_of_contracts: 0,
            last_address: CanonicalAddr::from(FIRST_DELEGATION_SC_ADDRESS.as_slice()),
            min_service_fee: self.config.min_service_fee,
            max_service_fee: self.config.max_service_fee,
            min_deposit: self.config.min_creation_deposit,
            min_delegation_amount: self.config.min_delegation_amount,
        };
        DELEGATION_MANAGEMENT.save(&mut eei.storage(), &management)?;
        DELEGATION_CONTRACT_LIST.save(
            &mut eei.storage(),
            &DelegationContractList {
                addresses: vec![CanonicalAddr::from(FIRST_DELEGATION_SC_ADDRESS.as_slice())],
            },
        )?;
        Ok(())
    }

    fn load_management(eei: &Eei) -> Result<DelegationManagement, ContractError> {
        DELEGATION_MANAGEMENT
            .may_load(&eei.storage_read())?
            .ok_or_else(|| ContractError::invalid_state("delegation manager is not initialized"))
    }

    fn check_not_deployed(eei: &Eei, owner: &[u8]) -> Result<(), ContractError> {
        if DEPLOYED_BY_OWNER.has(&eei.storage_read(), owner) {
            return Err(ContractError::invalid_args(ALREADY_DEPLOYED));
        }
        Ok(())
    }

    fn check_service_fee(management: &DelegationManagement, fee: u64) -> Result<(), ContractError> {
        if fee < management.min_service_fee || fee > management.max_service_fee {
            return Err(ContractError::invalid_args(format!(
                "service fee {fee} out of bounds [{}, {}]",
                management.min_service_fee, management.max_service_fee
            )));
        }
        Ok(())
    }

    /// Records a freshly deployed instance and returns its address to the caller.
    fn register_contract(
        eei: &mut Eei,
        mut management: DelegationManagement,
        owner: &[u8],
        address: &[u8],
        function: &str,
    ) -> Result<(), ContractError> {
        management.num_of_contracts += 1;
        management.last_address = CanonicalAddr::from(address);
        DELEGATION_MANAGEMENT.save(&mut eei.storage(), &management)?;

        let mut list = DELEGATION_CONTRACT_LIST
            .may_load(&eei.storage_read())?
            .unwrap_or(DelegationContractList { addresses: vec![] });
        list.addresses.push(CanonicalAddr::from(address));
        DELEGATION_CONTRACT_LIST.save(&mut eei.storage(), &list)?;
        DEPLOYED_BY_OWNER.save(&mut eei.storage(), owner, &CanonicalAddr::from(address))?;

        let manager = eei.current_address().to_vec();
        eei.add_log_entry(
            LogEntry::new(function, &manager)
                .add_topic(owner)
                .add_topic(address),
        );
        eei.finish(address);
        info!(owner = %display_key(owner), contract = %display_key(address), "delegation contract deployed");
        Ok(())
    }

    fn checked(output: NestedOutput, function: &str, address: &[u8]) -> Result<NestedOutput, ContractError> {
        if !output.is_ok() {
            return Err(ContractError::NestedCallFailed {
                function: function.to_string(),
                address: display_key(address),
                message: output.return_message,
            });
        }
        Ok(output)
    }

    fn create_new_delegation_contract(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        eei.use_gas(self.gas_cost.delegation_mgr_ops)?;
        let Funded {
            owner,
            args,
            reported_value,
            call_value,
        } = self.funding.authenticate(eei, input, true)?;
        if args.len() != 2 {
            return Err(ContractError::WrongNumberOfArguments {
                expected: 2,
                got: args.len(),
            });
        }
        let management = Self::load_management(eei)?;
        Self::check_not_deployed(eei, &owner)?;

        let deposit = reported_value.unwrap_or(call_value);
        if deposit < management.min_deposit {
            return Err(ContractError::invalid_args(format!(
                "not enough call value, needed {}, got {deposit}",
                management.min_deposit
            )));
        }
        let max_cap = decode_biguint(&args[0])?;
        let service_fee = decode_u64(&args[1])?;
        Self::check_service_fee(&management, service_fee)?;

        let address = next_delegation_address(management.last_address.as_slice())?;
        let output = eei.deploy_system_contract(
            DELEGATION_CODE,
            &address,
            &owner,
            call_value,
            "init",
            &[owner.clone(), encode_biguint(max_cap), encode_u64(service_fee), encode_biguint(deposit)],
        )?;
        Self::checked(output, "init", &address)?;
        Self::register_contract(eei, management, &owner, &address, "createNewDelegationContract")
    }

    fn make_new_contract_from_validator_data(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        if !eei.features().validator_to_delegation {
            return Err(ContractError::FeatureNotEnabled(
                "validator to delegation is not enabled".to_string(),
            ));
        }
        eei.use_gas(self.gas_cost.validator_to_delegation)?;
        let Funded { owner, args, .. } = self.funding.authenticate(eei, input, false)?;
        if args.len() != 2 {
            return Err(ContractError::WrongNumberOfArguments {
                expected: 2,
                got: args.len(),
            });
        }
        let management = Self::load_management(eei)?;
        Self::check_not_deployed(eei, &owner)?;
        let max_cap = decode_biguint(&args[0])?;
        let service_fee = decode_u64(&args[1])?;
        Self::check_service_fee(&management, service_fee)?;

        let address = next_delegation_address(management.last_address.as_slice())?;
        let manager = eei.current_address().to_vec();
        let output = eei.execute_on_dest_context(
            &VALIDATOR_SC_ADDRESS,
            &manager,
            Uint128::zero(),
            "changeOwnerOfValidatorData",
            &[owner.clone(), address.clone()],
        )?;
        Self::checked(output, "changeOwnerOfValidatorData", &VALIDATOR_SC_ADDRESS)?;

        let output = eei.deploy_system_contract(
            DELEGATION_CODE,
            &address,
            &owner,
            Uint128::zero(),
            "initFromValidatorData",
            &[owner.clone(), encode_biguint(max_cap), encode_u64(service_fee)],
        )?;
        Self::checked(output, "initFromValidatorData", &address)?;
        Self::register_contract(eei, management, &owner, &address, "makeNewContractFromValidatorData")
    }

    fn merge_validator_to_delegation_with_whitelist(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        if !eei.features().validator_to_delegation {
            return Err(ContractError::FeatureNotEnabled(
                "validator to delegation is not enabled".to_string(),
            ));
        }
        eei.use_gas(self.gas_cost.validator_to_delegation)?;
        let Funded { owner, args, .. } = self.funding.authenticate(eei, input, false)?;
        if args.len() != 1 {
            return Err(ContractError::WrongNumberOfArguments {
                expected: 1,
                got: args.len(),
            });
        }
        let delegation = require_address(&args[0], "delegation contract")?;
        if !eei.is_delegation_contract(&delegation) {
            return Err(ContractError::invalid_args("destination is not a delegation contract"));
        }
        let whitelisted = WHITELIST_FOR_MERGE.may_load(&eei.storage_of(&delegation))?;
        if whitelisted.as_ref().map(|a| a.as_slice()) != Some(owner.as_slice()) {
            return Err(ContractError::unauthorized("address is not whitelisted for merge"));
        }
        let merged = VALIDATORS
            .may_load(&eei.storage_of(&VALIDATOR_SC_ADDRESS), &owner)?
            .ok_or(ContractError::ValidatorNotFound)?
            .total_stake_value;

        let manager = eei.current_address().to_vec();
        let output = eei.execute_on_dest_context(
            &VALIDATOR_SC_ADDRESS,
            &manager,
            Uint128::zero(),
            "mergeValidatorData",
            &[owner.clone(), delegation.clone()],
        )?;
        Self::checked(output, "mergeValidatorData", &VALIDATOR_SC_ADDRESS)?;

        let output = eei.execute_on_dest_context(
            &delegation,
            &manager,
            Uint128::zero(),
            "mergeValidatorDataToContract",
            &[owner, encode_biguint(merged)],
        )?;
        Self::checked(output, "mergeValidatorDataToContract", &delegation)?;
        Ok(())
    }

    fn get_all_contract_addresses(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        let manager = eei.current_address().to_vec();
        validate_caller(input, &manager, "getAllContractAddresses")?;
        let list = DELEGATION_CONTRACT_LIST
            .may_load(&eei.storage_read())?
            .unwrap_or(DelegationContractList { addresses: vec![] });
        for address in list.addresses.into_iter().skip(1) {
            eei.finish(address.to_vec());
        }
        Ok(())
    }

    fn get_contract_config(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        let manager = eei.current_address().to_vec();
        validate_caller(input, &manager, "getContractConfig")?;
        let management = Self::load_management(eei)?;
        eei.finish(encode_u64(u64::from(management.num_of_contracts)));
        eei.finish(management.last_address.to_vec());
        eei.finish(encode_u64(management.min_service_fee));
        eei.finish(encode_u64(management.max_service_fee));
        eei.finish(encode_biguint(management.min_deposit));
        eei.finish(encode_biguint(management.min_delegation_amount));
        Ok(())
    }

    fn correct_owner_on_account(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        if !eei.features().fix_delegation_change_owner {
            return Err(ContractError::FeatureNotEnabled(
                "correct owner on account is not enabled".to_string(),
            ));
        }
        eei.use_gas(self.gas_cost.delegation_mgr_ops)?;
        require_num_args(&input.arguments, 2)?;
        let delegation = require_address(&input.arguments[0], "delegation contract")?;
        let new_owner = require_address(&input.arguments[1], "new owner")?;
        validate_caller(input, &delegation, "correctOwnerOnAccount")?;
        if !eei.is_delegation_contract(&delegation) {
            return Err(ContractError::invalid_args("caller is not a delegation contract"));
        }
        Self::check_not_deployed(eei, &new_owner)?;

        if let Some(old_owner) = eei.code_deployer(&delegation).map(<[u8]>::to_vec) {
            let indexed = DEPLOYED_BY_OWNER.may_load(&eei.storage_read(), &old_owner)?;
            if indexed.as_ref().map(|a| a.as_slice()) == Some(delegation.as_slice()) {
                DEPLOYED_BY_OWNER.remove(&mut eei.storage(), &old_owner);
            }
        }
        eei.update_code_deployer(&delegation, &new_owner)?;
        DEPLOYED_BY_OWNER.save(&mut eei.storage(), &new_owner, &CanonicalAddr::from(delegation.as_slice()))?;
        Ok(())
    }

    fn change_min_deposit(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &GOVERNANCE_SC_ADDRESS, "changeMinDeposit")?;
        require_num_args(&input.arguments, 1)?;
        let mut management = Self::load_management(eei)?;
        management.min_deposit = decode_biguint(&input.arguments[0])?;
        DELEGATION_MANAGEMENT.save(&mut eei.storage(), &management)?;
        Ok(())
    }

    fn change_min_delegation_amount(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        validate_caller(input, &GOVERNANCE_SC_ADDRESS, "changeMinDelegationAmount")?;
        require_num_args(&input.arguments, 1)?;
        let amount = decode_biguint(&input.arguments[0])?;
        if amount.is_zero() {
            return Err(ContractError::invalid_args("min delegation amount must be greater than zero"));
        }
        let mut management = Self::load_management(eei)?;
        management.min_delegation_amount = amount;
        DELEGATION_MANAGEMENT.save(&mut eei.storage(), &management)?;
        Ok(())
    }
}

impl SystemSmartContract for DelegationManagerContract {
    fn name(&self) -> &'static str {
        "delegationManager"
    }

    fn execute(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError> {
        if input.function == "init" {
            return self.init(eei);
        }
        if !eei.features().delegation_manager {
            return Err(ContractError::FeatureNotEnabled(
                "delegation manager is not enabled".to_string(),
            ));
        }
        Self::load_management(eei)?;

        match input.function.as_str() {
            "createNewDelegationContract" => self.create_new_delegation_contract(eei, input),
            "makeNewContractFromValidatorData" => self.make_new_contract_from_validator_data(eei, input),
            "mergeValidatorToDelegationWithWhitelist" => {
                self.merge_validator_to_delegation_with_whitelist(eei, input)
            }
            "getAllContractAddresses" => self.get_all_contract_addresses(eei, input),
            "getContractConfig" => self.get_contract_config(eei, input),
            "correctOwnerOnAccount" => self.correct_owner_on_account(eei, input),
            "changeMinDeposit" => self.change_min_deposit(eei, input),
            "changeMinDelegationAmount" => self.change_min_delegation_amount(eei, input),
            _ => Err(ContractError::InvalidMethod),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::DELEGATION_MANAGER_SC_ADDRESS;
    use crate::config::{SystemScConfig, MAX_SERVICE_FEE};
    use crate::contract::SystemVm;
    use crate::eei::BlockInfo;
    use crate::msg::{ReturnCode, VmOutput};
    use crate::validator::SkipSignatureCheck;
    use std::sync::Arc;

    const OWNER: [u8; 32] = [3u8; 32];
    const OWNER2: [u8; 32] = [4u8; 32];
    const DEPOSIT: u128 = 1_250_000;

    fn vm() -> Arc<SystemVm> {
        let mut config = SystemScConfig::default();
        config.staking.min_num_nodes = 0;
        let vm = SystemVm::new(&config, Arc::new(SkipSignatureCheck)).unwrap();
        vm.init_system_contracts(&OWNER).unwrap();
        vm.set_block(BlockInfo {
            nonce: 1,
            round: 1,
            epoch: 1,
        });
        Arc::new(vm)
    }

    fn call(vm: &SystemVm, caller: &[u8], function: &str, args: Vec<Vec<u8>>) -> VmOutput {
        vm.run_contract_call(
            &ContractCallInput::new(caller, &DELEGATION_MANAGER_SC_ADDRESS, function).with_args(args),
        )
    }

    fn create(vm: &SystemVm, owner: &[u8]) -> Vec<u8> {
        vm.fund_account(owner, Uint128::new(DEPOSIT)).unwrap();
        let input = ContractCallInput::new(owner, &DELEGATION_MANAGER_SC_ADDRESS, "createNewDelegationContract")
            .with_args(vec![vec![], encode_u64(1_000)])
            .with_value(DEPOSIT);
        let output = vm.run_contract_call(&input);
        assert!(output.is_ok(), "{}", output.return_message);
        output.return_data[0].to_vec()
    }

    fn config_of(vm: &SystemVm) -> Vec<Vec<u8>> {
        let output = vm.run_query(&ContractCallInput::new(
            &DELEGATION_MANAGER_SC_ADDRESS,
            &DELEGATION_MANAGER_SC_ADDRESS,
            "getContractConfig",
        ));
        assert!(output.is_ok(), "{}", output.return_message);
        output.return_data.iter().map(|data| data.to_vec()).collect()
    }

    #[test]
    fn config_lists_counters_then_limits() {
        let vm = vm();
        let first = create(&vm, &OWNER);
        let second = create(&vm, &OWNER2);
        assert_ne!(first, second);

        let config = config_of(&vm);
        assert_eq!(
            config,
            vec![
                encode_u64(2),
                second.clone(),
                encode_u64(0),
                encode_u64(MAX_SERVICE_FEE),
                encode_biguint(Uint128::new(DEPOSIT)),
                encode_biguint(Uint128::new(1_000)),
            ]
        );

        let output = vm.run_query(&ContractCallInput::new(
            &DELEGATION_MANAGER_SC_ADDRESS,
            &DELEGATION_MANAGER_SC_ADDRESS,
            "getAllContractAddresses",
        ));
        let addresses: Vec<Vec<u8>> = output.return_data.iter().map(|data| data.to_vec()).collect();
        assert_eq!(addresses, vec![first, second]);
    }

    #[test]
    fn registry_views_are_internal() {
        let vm = vm();
        for function in ["getContractConfig", "getAllContractAddresses"] {
            let output = vm.run_query(&ContractCallInput::new(&OWNER, &DELEGATION_MANAGER_SC_ADDRESS, function));
            assert_eq!(output.return_code, ReturnCode::UserError, "{function}");
        }
    }

    #[test]
    fn minimums_change_only_through_governance() {
        let vm = vm();
        let amount = encode_biguint(Uint128::new(5_000_000));

        let output = call(&vm, &OWNER, "changeMinDeposit", vec![amount.clone()]);
        assert_eq!(output.return_code, ReturnCode::UserError);
        let output = call(&vm, &GOVERNANCE_SC_ADDRESS, "changeMinDeposit", vec![amount.clone()]);
        assert!(output.is_ok(), "{}", output.return_message);
        assert_eq!(config_of(&vm)[4], amount);

        let output = call(&vm, &GOVERNANCE_SC_ADDRESS, "changeMinDelegationAmount", vec![encode_biguint(Uint128::zero())]);
        assert_eq!(output.return_code, ReturnCode::UserError);
        assert!(output.return_message.contains("greater than zero"));
        let output = call(&vm, &GOVERNANCE_SC_ADDRESS, "changeMinDelegationAmount", vec![encode_biguint(Uint128::new(7))]);
        assert!(output.is_ok(), "{}", output.return_message);
        assert_eq!(config_of(&vm)[5], encode_biguint(Uint128::new(7)));
    }

    #[test]
    fn creation_below_min_deposit_is_refused() {
        let vm = vm();
        vm.fund_account(&OWNER, Uint128::new(DEPOSIT)).unwrap();
        let input = ContractCallInput::new(&OWNER, &DELEGATION_MANAGER_SC_ADDRESS, "createNewDelegationContract")
            .with_args(vec![vec![], encode_u64(1_000)])
            .with_value(DEPOSIT - 1);
        let output = vm.run_contract_call(&input);
        assert_eq!(output.return_code, ReturnCode::UserError);
        assert_eq!(config_of(&vm)[0], encode_u64(0));
    }
}
