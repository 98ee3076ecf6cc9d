use cosmwasm_schema::cw_serde;
use cosmwasm_std::{Binary, CanonicalAddr, Uint128};

/// Gas given to calls built without an explicit limit.
pub const DEFAULT_GAS_PROVIDED: u64 = 100_000_000;

/// An ESDT token transfer attached to a call. System contracts refuse them.
#[cw_serde]
pub struct EsdtTransfer {
    pub token_identifier: String,
    pub nonce: u64,
    pub value: Uint128,
}

/// Message type for every system smart contract call.
/// Arguments are positional byte strings; numbers are big-endian minimal-byte
/// unsigned integers.
#[cw_serde]
pub struct ContractCallInput {
    pub caller: CanonicalAddr,
    pub recipient: CanonicalAddr,
    pub function: String,
    pub arguments: Vec<Binary>,
    pub call_value: Uint128,
    pub gas_provided: u64,
    pub gas_price: u64,
    pub esdt_transfers: Vec<EsdtTransfer>,
}

impl ContractCallInput {
    pub fn new(caller: &[u8], recipient: &[u8], function: &str) -> Self {
        Self {
            caller: CanonicalAddr::from(caller),
            recipient: CanonicalAddr::from(recipient),
            function: function.to_string(),
            arguments: vec![],
            call_value: Uint128::zero(),
            gas_provided: DEFAULT_GAS_PROVIDED,
            gas_price: 1,
            esdt_transfers: vec![],
        }
    }

    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Vec<u8>>,
    {
        self.arguments = args.into_iter().map(|a| Binary::from(a.into())).collect();
        self
    }

    pub fn with_value(mut self, value: impl Into<Uint128>) -> Self {
        self.call_value = value.into();
        self
    }

    pub fn with_gas(mut self, gas: u64) -> Self {
        self.gas_provided = gas;
        self
    }
}

#[cw_serde]
#[derive(Copy, Eq)]
pub enum ReturnCode {
    Ok,
    UserError,
    OutOfGas,
    OutOfFunds,
}

/// Structured event appended by a system contract. The identifier is the
/// function name and the address is the emitting contract.
#[cw_serde]
pub struct LogEntry {
    pub identifier: String,
    pub address: CanonicalAddr,
    pub topics: Vec<Binary>,
    pub data: Binary,
}

impl LogEntry {
    pub fn new(identifier: &str, address: &[u8]) -> Self {
        Self {
            identifier: identifier.to_string(),
            address: CanonicalAddr::from(address),
            topics: vec![],
            data: Binary::default(),
        }
    }

    pub fn add_topic(mut self, topic: impl Into<Vec<u8>>) -> Self {
        self.topics.push(Binary::from(topic.into()));
        self
    }

    pub fn with_data(mut self, data: impl Into<Vec<u8>>) -> Self {
        self.data = Binary::from(data.into());
        self
    }
}

/// Native value moved while executing a call.
#[cw_serde]
pub struct OutputTransfer {
    pub sender: CanonicalAddr,
    pub receiver: CanonicalAddr,
    pub value: Uint128,
    pub data: Binary,
}

/// What a top-level call reports back to the transaction result.
#[cw_serde]
pub struct VmOutput {
    pub return_code: ReturnCode,
    pub return_message: String,
    pub return_data: Vec<Binary>,
    pub gas_remaining: u64,
    pub logs: Vec<LogEntry>,
    pub transfers: Vec<OutputTransfer>,
}

impl VmOutput {
    pub fn is_ok(&self) -> bool {
        self.return_code == ReturnCode::Ok
    }
}

/// Result of a synchronous call from one system contract into another.
#[derive(Debug, Clone, PartialEq)]
pub struct NestedOutput {
    pub return_code: ReturnCode,
    pub return_message: String,
    pub return_data: Vec<Binary>,
}

impl NestedOutput {
    pub fn is_ok(&self) -> bool {
        self.return_code == ReturnCode::Ok
    }
}

// query facade responses

#[cw_serde]
pub struct StakedKeyResponse {
    pub bls_key: Binary,
    pub owner: Binary,
    pub status: String,
    pub jailed: bool,
    pub unstaked_nonce: u64,
}

#[cw_serde]
pub struct ValidatorResponse {
    pub owner: Binary,
    pub num_registered: u32,
    pub total_stake_value: Uint128,
    pub locked_stake: Uint128,
    pub total_unstaked: Uint128,
    pub bls_keys: Vec<Binary>,
}

#[cw_serde]
pub struct DelegationContractsResponse {
    pub addresses: Vec<Binary>,
}
