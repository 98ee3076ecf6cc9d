//! Reserved system addresses and delegation contract address allocation.
//!
//! Addresses are 32 bytes. Smart contract addresses start with eight zero
//! bytes; the three trailing bytes of a delegation contract address are fixed
//! and the bytes between the prefix and the trailer form a big-endian counter.

use crate::error::ContractError;

pub const ADDRESS_LEN: usize = 32;

const SC_PREFIX_LEN: usize = 8;
const DELEGATION_COUNTER_END: usize = 29;

const fn system_address(id: u8) -> [u8; ADDRESS_LEN] {
    let mut addr = [0u8; ADDRESS_LEN];
    addr[9] = 1;
    addr[29] = id;
    addr[30] = 255;
    addr[31] = 255;
    addr
}

pub const STAKING_SC_ADDRESS: [u8; ADDRESS_LEN] = system_address(1);
pub const VALIDATOR_SC_ADDRESS: [u8; ADDRESS_LEN] = system_address(2);
pub const GOVERNANCE_SC_ADDRESS: [u8; ADDRESS_LEN] = system_address(3);
pub const ESDT_SC_ADDRESS: [u8; ADDRESS_LEN] = system_address(4);
pub const DELEGATION_MANAGER_SC_ADDRESS: [u8; ADDRESS_LEN] = system_address(5);
pub const END_OF_EPOCH_ADDRESS: [u8; ADDRESS_LEN] = system_address(6);
pub const ABSTRACT_STAKING_ADDRESS: [u8; ADDRESS_LEN] = system_address(7);

pub const FIRST_DELEGATION_SC_ADDRESS: [u8; ADDRESS_LEN] = [
    0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 255,
    255, 255,
];

const RESERVED: [[u8; ADDRESS_LEN]; 7] = [
    STAKING_SC_ADDRESS,
    VALIDATOR_SC_ADDRESS,
    GOVERNANCE_SC_ADDRESS,
    ESDT_SC_ADDRESS,
    DELEGATION_MANAGER_SC_ADDRESS,
    END_OF_EPOCH_ADDRESS,
    ABSTRACT_STAKING_ADDRESS,
];

pub fn is_smart_contract_address(addr: &[u8]) -> bool {
    addr.len() == ADDRESS_LEN && addr[..SC_PREFIX_LEN].iter().all(|b| *b == 0)
}

pub fn is_reserved_system_address(addr: &[u8]) -> bool {
    RESERVED.iter().any(|reserved| reserved.as_slice() == addr)
}

/// Derives the delegation contract address that follows `last`.
pub fn next_delegation_address(last: &[u8]) -> Result<Vec<u8>, ContractError> {
    if last.len() != ADDRESS_LEN {
        return Err(ContractError::invalid_state(format!(
            "invalid last delegation address length {}",
            last.len()
        )));
    }

    let mut next = last.to_vec();
    for i in (SC_PREFIX_LEN..DELEGATION_COUNTER_END).rev() {
        if next[i] == u8::MAX {
            next[i] = 0;
            continue;
        }
        next[i] += 1;
        return Ok(next);
    }

    Err(ContractError::invalid_state("delegation address space exhausted"))
}
