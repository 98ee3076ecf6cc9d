//! System smart contracts of a proof-of-stake chain (staking, validator,
//! delegation manager and delegation) running on an in-process execution
//! environment, plus the validator rating engine.

pub mod accounts;
pub mod address;
pub mod config;
pub mod contract;
pub mod delegation;
pub mod delegation_manager;
pub mod eei;
pub mod error;
pub mod features;
pub mod funding;
pub mod helpers;
pub mod msg;
pub mod query;
pub mod rating;
pub mod staking;
pub mod state;
pub mod statistics;
pub mod validator;
pub mod waiting_list;


pub use crate::contract::{SystemContracts, SystemSmartContract, SystemVm};
pub use crate::error::{ConfigError, ContractError, RatingError};
pub use crate::query::QueryFacade;
