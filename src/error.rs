use cosmwasm_std::{OverflowError, StdError, Uint128};
use thiserror::Error;

use crate::msg::ReturnCode;

#[derive(Error, Debug, PartialEq)]
pub enum ContractError {
    #[error("{0}")]
    Std(#[from] StdError),

    #[error("{0}")]
    Overflow(#[from] OverflowError),

    #[error("not enough gas")]
    OutOfGas,

    #[error("{0}")]
    OutOfFunds(String),

    #[error("invalid method to call")]
    InvalidMethod,

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    InvalidArguments(String),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    FeatureNotEnabled(String),

    #[error("insufficient stake value: expected {expected}, got {got}")]
    InsufficientStakeValue { expected: Uint128, got: Uint128 },

    #[error("invalid number of arguments: expected {expected}, got {got}")]
    WrongNumberOfArguments { expected: usize, got: usize },

    #[error("bls key not found: {0}")]
    KeyNotFound(String),

    #[error("validator data not found")]
    ValidatorNotFound,

    #[error("unStake/unBond is paused as not all nodes have been processed")]
    UnStakeUnBondPaused,

    #[error("contract already initialized")]
    AlreadyInitialized,

    #[error("system smart contracts do not accept ESDT transfers")]
    EsdtTransferNotAccepted,

    #[error("unknown system smart contract address {0}")]
    UnknownContract(String),

    #[error("transfer is not allowed in abstract staking mode")]
    TransferNotAllowed,

    #[error("insufficient funds: {address} has {balance}, needs {required}")]
    InsufficientFunds {
        address: String,
        balance: Uint128,
        required: Uint128,
    },

    #[error("{function} failed on {address}: {message}")]
    NestedCallFailed {
        function: String,
        address: String,
        message: String,
    },
}

impl ContractError {
    /// The code reported to the transaction result for this error.
    pub fn return_code(&self) -> ReturnCode {
        match self {
            ContractError::OutOfGas => ReturnCode::OutOfGas,
            ContractError::OutOfFunds(_) | ContractError::InsufficientFunds { .. } => {
                ReturnCode::OutOfFunds
            }
            _ => ReturnCode::UserError,
        }
    }

    /// Failures that abort the whole call chain instead of being reported
    /// back to the calling contract.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ContractError::OutOfGas | ContractError::Std(_) | ContractError::Overflow(_)
        )
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        ContractError::Unauthorized(msg.into())
    }

    pub fn invalid_args(msg: impl Into<String>) -> Self {
        ContractError::InvalidArguments(msg.into())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        ContractError::InvalidState(msg.into())
    }
}

/// Errors raised while building the system contracts from configuration.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid enable epochs table: missing flag {0}")]
    MissingFlag(String),

    #[error("node price must be greater than zero")]
    ZeroNodePrice,

    #[error("invalid address length for {name}: expected {expected}, got {got}")]
    InvalidAddress {
        name: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("could not read config: {0}")]
    Io(String),

    #[error("could not parse config: {0}")]
    Parse(String),
}

#[derive(Error, Debug, PartialEq)]
pub enum RatingError {
    #[error("nil or empty validator infos")]
    EmptyValidatorInfos,

    #[error("peer account not found for {0}")]
    PeerNotFound(String),

    #[error("empty consensus group for shard {shard_id} round {round}")]
    EmptyConsensusGroup { shard_id: u32, round: u64 },

    #[error("no eligible validators for shard {0}")]
    NoEligibleValidators(u32),

    #[error("nodes coordinator: {0}")]
    NodesCoordinator(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("{0}")]
    Config(#[from] ConfigError),
}
