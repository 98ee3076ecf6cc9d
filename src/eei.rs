//! Execution environment handed to system smart contracts for one call.
//!
//! The `Eei` owns a working copy of the world state. Storage writes land in
//! that copy directly and are journaled; a failing nested call is undone back
//! to the checkpoint taken before it, and the router only commits the copy
//! when the top-level call returns `Ok`.

use cosmwasm_std::{Binary, CanonicalAddr, Storage, Uint128};
use cosmwasm_storage::{PrefixedStorage, ReadonlyPrefixedStorage};
use std::mem;
use std::sync::Arc;
use tracing::debug;

use crate::accounts::{Checkpoint, StateDb};
use crate::contract::{SystemContracts, DELEGATION_CODE};
use crate::error::ContractError;
use crate::features::FeatureSet;
use crate::helpers::display_key;
use crate::msg::{
    ContractCallInput, LogEntry, NestedOutput, OutputTransfer, ReturnCode, VmOutput,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockInfo {
    pub nonce: u64,
    pub round: u64,
    pub epoch: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct GasMeter {
    pub limit: u64,
    pub used: u64,
}

impl GasMeter {
    pub fn new(limit: u64) -> Self {
        Self { limit, used: 0 }
    }

    /// Charge `amount` gas. Exhausts the meter when the limit is exceeded.
    pub fn charge(&mut self, amount: u64) -> Result<(), ContractError> {
        let new = self.used.saturating_add(amount);
        if new > self.limit {
            self.used = self.limit;
            return Err(ContractError::OutOfGas);
        }
        self.used = new;
        Ok(())
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

struct Snapshot {
    state: Checkpoint,
    logs: usize,
    transfers: usize,
}

pub struct Eei {
    state: StateDb,
    contracts: Arc<SystemContracts>,
    block: BlockInfo,
    features: FeatureSet,
    gas: GasMeter,
    transfers_enabled: bool,
    frames: Vec<Vec<u8>>,
    return_data: Vec<Binary>,
    return_message: String,
    logs: Vec<LogEntry>,
    transfers: Vec<OutputTransfer>,
}

impl Eei {
    pub fn new(
        state: StateDb,
        contracts: Arc<SystemContracts>,
        block: BlockInfo,
        features: FeatureSet,
        gas_limit: u64,
        transfers_enabled: bool,
    ) -> Self {
        Self {
            state,
            contracts,
            block,
            features,
            gas: GasMeter::new(gas_limit),
            transfers_enabled,
            frames: vec![],
            return_data: vec![],
            return_message: String::new(),
            logs: vec![],
            transfers: vec![],
        }
    }

    pub(crate) fn enter(&mut self, address: &[u8]) {
        self.frames.push(address.to_vec());
    }

    /// Address of the contract currently executing.
    pub fn current_address(&self) -> &[u8] {
        self.frames.last().map(Vec::as_slice).unwrap_or_default()
    }

    pub(crate) fn state(&self) -> &StateDb {
        &self.state
    }

    pub fn block(&self) -> BlockInfo {
        self.block
    }

    pub fn features(&self) -> FeatureSet {
        self.features
    }

    pub fn transfers_enabled(&self) -> bool {
        self.transfers_enabled
    }

    // storage

    pub fn storage(&mut self) -> PrefixedStorage<'_> {
        let address = self.current_address().to_vec();
        self.state.contract_storage(&address)
    }

    pub fn storage_read(&self) -> ReadonlyPrefixedStorage<'_> {
        self.state.contract_storage_read(self.current_address())
    }

    /// Read-only view of another contract's storage.
    pub fn storage_of(&self, address: &[u8]) -> ReadonlyPrefixedStorage<'_> {
        self.state.contract_storage_read(address)
    }

    pub fn get_storage(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.storage_read().get(key)
    }

    /// An empty value deletes the key.
    pub fn set_storage(&mut self, key: &[u8], value: &[u8]) {
        if value.is_empty() {
            self.storage().remove(key);
        } else {
            self.storage().set(key, value);
        }
    }

    pub fn get_storage_from_address(&self, address: &[u8], key: &[u8]) -> Option<Vec<u8>> {
        self.storage_of(address).get(key)
    }

    // gas

    pub fn use_gas(&mut self, cost: u64) -> Result<(), ContractError> {
        self.gas.charge(cost)
    }

    pub fn gas_remaining(&self) -> u64 {
        self.gas.remaining()
    }

    // output

    pub fn finish(&mut self, data: impl Into<Vec<u8>>) {
        self.return_data.push(Binary::from(data.into()));
    }

    pub fn add_return_message(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        if message.is_empty() {
            return;
        }
        if !self.return_message.is_empty() {
            self.return_message.push('@');
        }
        self.return_message.push_str(message);
    }

    pub fn add_log_entry(&mut self, entry: LogEntry) {
        self.logs.push(entry);
    }

    pub fn return_data(&self) -> &[Binary] {
        &self.return_data
    }

    // accounts

    pub fn balance(&self, address: &[u8]) -> Uint128 {
        self.state.balance(address)
    }

    pub fn account_code(&self, address: &[u8]) -> Option<&[u8]> {
        self.state.code(address)
    }

    pub fn code_deployer(&self, address: &[u8]) -> Option<&[u8]> {
        self.state.code_deployer(address)
    }

    pub fn is_delegation_contract(&self, address: &[u8]) -> bool {
        self.state.code(address) == Some(DELEGATION_CODE)
    }

    pub fn update_code_deployer(&mut self, address: &[u8], deployer: &[u8]) -> Result<(), ContractError> {
        if self.state.code(address).is_none() {
            return Err(ContractError::invalid_args(format!(
                "no contract deployed at {}",
                display_key(address)
            )));
        }
        self.state.set_code_deployer(address, deployer);
        Ok(())
    }

    pub fn transfer(
        &mut self,
        destination: &[u8],
        sender: &[u8],
        value: Uint128,
        data: &[u8],
    ) -> Result<(), ContractError> {
        if !self.transfers_enabled && !value.is_zero() {
            return Err(ContractError::TransferNotAllowed);
        }
        self.state.move_balance(sender, destination, value)?;
        self.transfers.push(OutputTransfer {
            sender: CanonicalAddr::from(sender),
            receiver: CanonicalAddr::from(destination),
            value,
            data: Binary::from(data),
        });
        Ok(())
    }

    // journal

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state.checkpoint(),
            logs: self.logs.len(),
            transfers: self.transfers.len(),
        }
    }

    fn restore(&mut self, snapshot: Snapshot) {
        self.state.revert_to(snapshot.state);
        self.logs.truncate(snapshot.logs);
        self.transfers.truncate(snapshot.transfers);
    }

    /// Synchronous call into another system contract. A failing callee is
    /// rolled back on its own and reported through the returned code; running
    /// out of gas aborts the whole call chain.
    pub fn execute_on_dest_context(
        &mut self,
        destination: &[u8],
        sender: &[u8],
        value: Uint128,
        function: &str,
        arguments: &[Vec<u8>],
    ) -> Result<NestedOutput, ContractError> {
        let contract = self.contracts.resolve(&self.state, destination)?;
        let input = ContractCallInput {
            caller: CanonicalAddr::from(sender),
            recipient: CanonicalAddr::from(destination),
            function: function.to_string(),
            arguments: arguments.iter().map(|a| Binary::from(a.as_slice())).collect(),
            call_value: value,
            gas_provided: self.gas.remaining(),
            gas_price: 1,
            esdt_transfers: vec![],
        };
        debug!(
            function,
            destination = %display_key(destination),
            contract = contract.name(),
            "nested system contract call"
        );

        let snapshot = self.snapshot();
        let outer_data = mem::take(&mut self.return_data);
        let outer_message = mem::take(&mut self.return_message);

        self.enter(destination);
        let funded = if value.is_zero() {
            Ok(())
        } else {
            self.transfer(destination, sender, value, function.as_bytes())
        };
        let result = funded.and_then(|_| contract.execute(self, &input));
        self.frames.pop();

        let return_data = mem::replace(&mut self.return_data, outer_data);
        let mut return_message = mem::replace(&mut self.return_message, outer_message);

        match result {
            Ok(()) => Ok(NestedOutput {
                return_code: ReturnCode::Ok,
                return_message,
                return_data,
            }),
            Err(ContractError::OutOfGas) => {
                self.restore(snapshot);
                Err(ContractError::OutOfGas)
            }
            Err(err) => {
                self.restore(snapshot);
                if !return_message.is_empty() {
                    return_message.push('@');
                }
                return_message.push_str(&err.to_string());
                Ok(NestedOutput {
                    return_code: err.return_code(),
                    return_message,
                    return_data: vec![],
                })
            }
        }
    }

    /// Deploys a contract instance at `address` and runs `init_function` on
    /// it in place. The deployment is undone when that call fails.
    pub fn deploy_system_contract(
        &mut self,
        code: &[u8],
        address: &[u8],
        deployer: &[u8],
        value: Uint128,
        init_function: &str,
        init_args: &[Vec<u8>],
    ) -> Result<NestedOutput, ContractError> {
        if self.state.code(address).is_some() {
            return Err(ContractError::invalid_state(format!(
                "address {} already holds a contract",
                display_key(address)
            )));
        }
        let snapshot = self.snapshot();
        self.state.set_code(address, code, deployer);
        let sender = self.current_address().to_vec();
        let output = self.execute_on_dest_context(address, &sender, value, init_function, init_args)?;
        if !output.is_ok() {
            self.restore(snapshot);
        }
        Ok(output)
    }

    /// Converts the call result into the transaction output and hands back the
    /// working state.
    pub fn finalize(mut self, result: Result<(), ContractError>) -> (StateDb, VmOutput) {
        let return_code = match &result {
            Ok(()) => ReturnCode::Ok,
            Err(err) => {
                let message = err.to_string();
                self.add_return_message(message);
                err.return_code()
            }
        };
        if return_code != ReturnCode::Ok {
            self.return_data.clear();
            self.logs.clear();
            self.transfers.clear();
        }
        let output = VmOutput {
            return_code,
            return_message: self.return_message,
            return_data: self.return_data,
            gas_remaining: self.gas.remaining(),
            logs: self.logs,
            transfers: self.transfers,
        };
        (self.state, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gas_meter_exhausts() {
        let mut g = GasMeter::new(100);
        assert!(g.charge(50).is_ok());
        assert_eq!(g.charge(60), Err(ContractError::OutOfGas));
        assert_eq!(g.remaining(), 0);
    }

    fn eei() -> Eei {
        Eei::new(
            StateDb::new(),
            Arc::new(SystemContracts::default()),
            BlockInfo::default(),
            FeatureSet::default(),
            1_000,
            true,
        )
    }

    #[test]
    fn storage_is_scoped_to_current_contract() {
        let mut eei = eei();
        eei.enter(b"first");
        eei.set_storage(b"k", b"v");
        eei.enter(b"second");
        assert_eq!(eei.get_storage(b"k"), None);
        assert_eq!(eei.get_storage_from_address(b"first", b"k"), Some(b"v".to_vec()));
        eei.frames.pop();
        eei.set_storage(b"k", b"");
        assert_eq!(eei.get_storage(b"k"), None);
    }

    #[test]
    fn return_messages_are_joined() {
        let mut eei = eei();
        eei.add_return_message("first");
        eei.add_return_message("");
        eei.add_return_message("second");
        let (_, output) = eei.finalize(Ok(()));
        assert_eq!(output.return_message, "first@second");
    }

    #[test]
    fn disabled_transfers_refuse_value() {
        let mut eei = Eei::new(
            StateDb::new(),
            Arc::new(SystemContracts::default()),
            BlockInfo::default(),
            FeatureSet::default(),
            1_000,
            false,
        );
        let err = eei.transfer(b"to", b"from", Uint128::new(1), b"").unwrap_err();
        assert_eq!(err, ContractError::TransferNotAllowed);
        assert!(eei.transfer(b"to", b"from", Uint128::zero(), b"").is_ok());
    }

    #[test]
    fn failed_call_discards_output() {
        let mut eei = eei();
        eei.finish(b"data".to_vec());
        eei.add_log_entry(LogEntry::new("stake", b"addr"));
        let (_, output) = eei.finalize(Err(ContractError::OutOfGas));
        assert_eq!(output.return_code, ReturnCode::OutOfGas);
        assert!(output.return_data.is_empty());
        assert!(output.logs.is_empty());
        assert_eq!(output.return_message, "not enough gas");
    }
}
