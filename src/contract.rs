//! Entry point for system smart contract calls.
//!
//! `SystemVm` routes a `ContractCallInput` to the contract registered at the
//! recipient address, or to the delegation contract when the recipient holds
//! delegation code, and commits the working state only when the call
//! returns `Ok`.

use cosmwasm_std::Uint128;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::accounts::StateDb;
use crate::address::{
    DELEGATION_MANAGER_SC_ADDRESS, END_OF_EPOCH_ADDRESS, STAKING_SC_ADDRESS, VALIDATOR_SC_ADDRESS,
};
use crate::config::SystemScConfig;
use crate::delegation::DelegationContract;
use crate::delegation_manager::DelegationManagerContract;
use crate::eei::{BlockInfo, Eei};
use crate::error::{ConfigError, ContractError};
use crate::features::EnableEpochs;
use crate::funding::FundingPolicy;
use crate::helpers::display_key;
use crate::msg::{ContractCallInput, VmOutput};
use crate::staking::StakingContract;
use crate::validator::{SignatureVerifier, ValidatorContract};

/// Code marker of deployed delegation contract instances.
pub const DELEGATION_CODE: &[u8] = b"delegation";

pub trait SystemSmartContract: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs one call. A single error is the whole failure report; output
    /// written to the `Eei` before the error is discarded by the caller.
    fn execute(&self, eei: &mut Eei, input: &ContractCallInput) -> Result<(), ContractError>;
}

/// Registry of contract implementations.
#[derive(Default)]
pub struct SystemContracts {
    by_address: BTreeMap<Vec<u8>, Arc<dyn SystemSmartContract>>,
    delegation: Option<Arc<dyn SystemSmartContract>>,
}

impl SystemContracts {
    /// Builds every system contract from configuration.
    pub fn from_config(
        config: &SystemScConfig,
        signature_verifier: Arc<dyn SignatureVerifier>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let funding = FundingPolicy::from(&config.funding);

        let staking = StakingContract::new(config.staking.clone(), config.gas_cost.clone());
        let validator = ValidatorContract::new(
            config.gas_cost.clone(),
            config.staking.clone(),
            config.validator.clone(),
            funding.clone(),
            signature_verifier,
        );
        let manager = DelegationManagerContract::new(
            config.delegation_manager.clone(),
            config.gas_cost.clone(),
            funding.clone(),
        );
        let delegation = DelegationContract::new(
            &config.enable_epochs,
            config.gas_cost.clone(),
            config.staking.unbond_period_in_epochs,
            funding,
        )?;

        Ok(Self::default()
            .with_contract(&STAKING_SC_ADDRESS, Arc::new(staking))
            .with_contract(&VALIDATOR_SC_ADDRESS, Arc::new(validator))
            .with_contract(&DELEGATION_MANAGER_SC_ADDRESS, Arc::new(manager))
            .with_delegation(Arc::new(delegation)))
    }

    pub fn with_contract(mut self, address: &[u8], contract: Arc<dyn SystemSmartContract>) -> Self {
        self.by_address.insert(address.to_vec(), contract);
        self
    }

    pub fn with_delegation(mut self, contract: Arc<dyn SystemSmartContract>) -> Self {
        self.delegation = Some(contract);
        self
    }

    pub fn addresses(&self) -> impl Iterator<Item = &[u8]> {
        self.by_address.keys().map(Vec::as_slice)
    }

    pub fn resolve(
        &self,
        state: &StateDb,
        address: &[u8],
    ) -> Result<Arc<dyn SystemSmartContract>, ContractError> {
        if let Some(contract) = self.by_address.get(address) {
            return Ok(contract.clone());
        }
        match (&self.delegation, state.code(address)) {
            (Some(delegation), Some(code)) if code == DELEGATION_CODE => Ok(delegation.clone()),
            _ => Err(ContractError::UnknownContract(display_key(address))),
        }
    }
}

pub(crate) fn validate_caller(
    input: &ContractCallInput,
    allowed: &[u8],
    function: &str,
) -> Result<(), ContractError> {
    if input.caller.as_slice() != allowed {
        return Err(ContractError::unauthorized(format!(
            "{function} function not allowed to be called by address {}",
            display_key(input.caller.as_slice())
        )));
    }
    Ok(())
}

/// Host of the system contracts: owns the committed world state and the
/// current block.
///
/// Calls run one at a time on a private copy of the committed state; the
/// state lock is only taken to copy it out and to swap the result back in,
/// so readers never wait for a call to finish executing.
pub struct SystemVm {
    state: Arc<RwLock<StateDb>>,
    executing: Mutex<()>,
    contracts: Arc<SystemContracts>,
    enable_epochs: EnableEpochs,
    funding: FundingPolicy,
    block: RwLock<BlockInfo>,
}

impl SystemVm {
    pub fn new(config: &SystemScConfig, signature_verifier: Arc<dyn SignatureVerifier>) -> Result<Self, ConfigError> {
        let contracts = SystemContracts::from_config(config, signature_verifier)?;
        Ok(Self {
            state: Arc::new(RwLock::new(StateDb::new())),
            executing: Mutex::new(()),
            contracts: Arc::new(contracts),
            enable_epochs: config.enable_epochs.clone(),
            funding: FundingPolicy::from(&config.funding),
            block: RwLock::new(BlockInfo::default()),
        })
    }

    pub fn set_block(&self, block: BlockInfo) {
        *self.block.write() = block;
    }

    pub fn block(&self) -> BlockInfo {
        *self.block.read()
    }

    /// Shared handle on the committed state, for readers.
    pub fn state(&self) -> Arc<RwLock<StateDb>> {
        self.state.clone()
    }

    pub fn balance(&self, address: &[u8]) -> Uint128 {
        self.state.read().balance(address)
    }

    /// Credits an account outside of any call, e.g. at genesis.
    pub fn fund_account(&self, address: &[u8], value: Uint128) -> Result<(), ContractError> {
        let _executing = self.executing.lock();
        let mut state = self.state.write();
        state.add_balance(address, value)?;
        state.commit();
        Ok(())
    }

    /// Deploys and initialises the staking, validator and delegation manager
    /// contracts. `owner` becomes the validator contract owner.
    pub fn init_system_contracts(&self, owner: &[u8]) -> Result<(), ContractError> {
        for (address, caller) in [
            (STAKING_SC_ADDRESS, END_OF_EPOCH_ADDRESS.to_vec()),
            (VALIDATOR_SC_ADDRESS, owner.to_vec()),
            (DELEGATION_MANAGER_SC_ADDRESS, owner.to_vec()),
        ] {
            let contract = self.contracts.resolve(&self.state.read(), &address)?;
            {
                let _executing = self.executing.lock();
                let mut state = self.state.write();
                state.set_code(&address, contract.name().as_bytes(), &caller);
                state.commit();
            }

            let output = self.run_contract_call(&ContractCallInput::new(&caller, &address, "init"));
            if !output.is_ok() {
                return Err(ContractError::NestedCallFailed {
                    function: "init".to_string(),
                    address: display_key(&address),
                    message: output.return_message,
                });
            }
            info!(contract = contract.name(), "system contract initialised");
        }
        Ok(())
    }

    fn precheck(&self, input: &ContractCallInput) -> Result<(), ContractError> {
        if !input.esdt_transfers.is_empty() {
            return Err(ContractError::EsdtTransferNotAccepted);
        }
        if !self.funding.transfers_enabled() && !input.call_value.is_zero() {
            return Err(ContractError::TransferNotAllowed);
        }
        Ok(())
    }

    fn execute_in(&self, state: StateDb, input: &ContractCallInput) -> (StateDb, VmOutput) {
        let block = self.block();
        let features = self.enable_epochs.features_at(block.epoch);
        let mut eei = Eei::new(
            state,
            self.contracts.clone(),
            block,
            features,
            input.gas_provided,
            self.funding.transfers_enabled(),
        );

        let recipient = input.recipient.as_slice();
        let result = self.precheck(input).and_then(|_| {
            let contract = self.contracts.resolve(eei.state(), recipient)?;
            eei.enter(recipient);
            if !input.call_value.is_zero() {
                eei.transfer(recipient, input.caller.as_slice(), input.call_value, input.function.as_bytes())?;
            }
            debug!(
                function = %input.function,
                contract = contract.name(),
                caller = %display_key(input.caller.as_slice()),
                "system contract call"
            );
            contract.execute(&mut eei, input)
        });
        eei.finalize(result)
    }

    /// Executes a state-changing call. The state is replaced only on `Ok`.
    pub fn run_contract_call(&self, input: &ContractCallInput) -> VmOutput {
        let _executing = self.executing.lock();
        let working = self.state.read().clone();
        let (mut state, output) = self.execute_in(working, input);
        if output.is_ok() {
            state.commit();
            *self.state.write() = state;
        } else {
            warn!(
                function = %input.function,
                code = ?output.return_code,
                message = %output.return_message,
                "system contract call failed"
            );
        }
        output
    }

    /// Executes a call against a copy of the committed state and drops the
    /// copy afterwards.
    pub fn run_query(&self, input: &ContractCallInput) -> VmOutput {
        let snapshot = self.state.read().clone();
        self.execute_in(snapshot, input).1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers::encode_u64;
    use crate::msg::{EsdtTransfer, ReturnCode};
    use crate::query::QueryFacade;
    use crate::validator::SkipSignatureCheck;
    use std::sync::mpsc;

    const OWNER: [u8; 32] = [3u8; 32];

    fn vm() -> SystemVm {
        let vm = SystemVm::new(&SystemScConfig::default(), Arc::new(SkipSignatureCheck)).unwrap();
        vm.init_system_contracts(&OWNER).unwrap();
        vm
    }

    #[test]
    fn unknown_recipient_is_reported() {
        let vm = vm();
        let output = vm.run_contract_call(&ContractCallInput::new(&OWNER, &[1u8; 32], "get"));
        assert_eq!(output.return_code, ReturnCode::UserError);
        assert!(output.return_message.contains("unknown system smart contract"));
    }

    #[test]
    fn esdt_transfers_are_refused() {
        let vm = vm();
        let mut input = ContractCallInput::new(&OWNER, &VALIDATOR_SC_ADDRESS, "stake");
        input.esdt_transfers.push(EsdtTransfer {
            token_identifier: "TKN-123456".to_string(),
            nonce: 0,
            value: Uint128::new(1),
        });
        let output = vm.run_contract_call(&input);
        assert_eq!(output.return_code, ReturnCode::UserError);
        assert_eq!(output.return_message, ContractError::EsdtTransferNotAccepted.to_string());
    }

    #[test]
    fn init_is_one_shot() {
        let vm = vm();
        let output = vm.run_contract_call(&ContractCallInput::new(&END_OF_EPOCH_ADDRESS, &STAKING_SC_ADDRESS, "init"));
        assert_eq!(output.return_message, ContractError::AlreadyInitialized.to_string());
    }

    struct GatedVerifier {
        entered: Mutex<mpsc::Sender<()>>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl SignatureVerifier for GatedVerifier {
        fn verify(&self, _public_key: &[u8], _message: &[u8], _signature: &[u8]) -> Result<(), ContractError> {
            self.entered.lock().send(()).map_err(|e| ContractError::invalid_state(e.to_string()))?;
            self.release.lock().recv().map_err(|e| ContractError::invalid_state(e.to_string()))?;
            Ok(())
        }
    }

    #[test]
    fn readers_do_not_wait_for_a_running_call() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let verifier = GatedVerifier {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        };
        let vm = Arc::new(SystemVm::new(&SystemScConfig::default(), Arc::new(verifier)).unwrap());
        vm.init_system_contracts(&OWNER).unwrap();
        vm.fund_account(&OWNER, Uint128::new(2_500_000)).unwrap();

        let writer = {
            let vm = vm.clone();
            std::thread::spawn(move || {
                let input = ContractCallInput::new(&OWNER, &VALIDATOR_SC_ADDRESS, "stake")
                    .with_args(vec![encode_u64(1), b"K1".to_vec(), b"s".to_vec()])
                    .with_value(2_500_000u128);
                vm.run_contract_call(&input)
            })
        };

        // the stake call is parked inside signature verification
        entered_rx.recv().unwrap();
        let facade = QueryFacade::new(vm.clone());
        assert!(facade.validator(&OWNER).unwrap().is_none());
        assert_eq!(vm.balance(&OWNER), Uint128::new(2_500_000));
        let view = facade.execute_view(&OWNER, &VALIDATOR_SC_ADDRESS, "getTotalStaked", &[OWNER.to_vec()]);
        assert_eq!(view.return_code, ReturnCode::UserError);

        release_tx.send(()).unwrap();
        let output = writer.join().unwrap();
        assert!(output.is_ok(), "{}", output.return_message);
        assert_eq!(facade.validator(&OWNER).unwrap().unwrap().num_registered, 1);
        assert_eq!(vm.state().read().journal_len(), 0);
    }

    #[test]
    fn failed_call_leaves_state_untouched() {
        let vm = vm();
        vm.fund_account(&OWNER, Uint128::new(10)).unwrap();
        let input = ContractCallInput::new(&OWNER, &VALIDATOR_SC_ADDRESS, "stake").with_value(10u128);
        let output = vm.run_contract_call(&input);
        assert!(!output.is_ok());
        assert_eq!(vm.balance(&OWNER), Uint128::new(10));
        assert_eq!(vm.balance(&VALIDATOR_SC_ADDRESS), Uint128::zero());
    }
}
