use cosmwasm_std::{Binary, Uint128};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::address::ADDRESS_LEN;
use crate::error::ContractError;

const MAX_UINT128_BYTES: usize = 16;

/// Deserialize a string or a number into a number
pub fn deserialize_int<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr + serde::Deserialize<'de>,
    <T as FromStr>::Err: std::fmt::Display,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrInt<T> {
        String(String),
        Number(T),
    }

    match StringOrInt::<T>::deserialize(deserializer)? {
        StringOrInt::String(s) => s.parse::<T>().map_err(serde::de::Error::custom),
        StringOrInt::Number(i) => Ok(i),
    }
}

/// Decodes a big-endian unsigned integer argument. Leading zero bytes are
/// accepted, an empty slice is zero.
pub fn decode_biguint(bytes: &[u8]) -> Result<Uint128, ContractError> {
    let significant: &[u8] = match bytes.iter().position(|b| *b != 0) {
        Some(first) => &bytes[first..],
        None => &[],
    };
    if significant.len() > MAX_UINT128_BYTES {
        return Err(ContractError::invalid_args("number argument too large"));
    }
    let value = significant
        .iter()
        .fold(0u128, |acc, b| (acc << 8) | u128::from(*b));
    Ok(Uint128::new(value))
}

/// Minimal big-endian encoding; zero encodes to an empty byte string.
pub fn encode_biguint(value: Uint128) -> Vec<u8> {
    let bytes = value.u128().to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[first..].to_vec()
}

pub fn decode_u64(bytes: &[u8]) -> Result<u64, ContractError> {
    let value = decode_biguint(bytes)?;
    u64::try_from(value.u128()).map_err(|_| ContractError::invalid_args("number argument exceeds u64"))
}

pub fn encode_u64(value: u64) -> Vec<u8> {
    encode_biguint(Uint128::from(value))
}

pub fn decode_bool(bytes: &[u8]) -> Result<bool, ContractError> {
    match bytes {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(ContractError::invalid_args("invalid boolean argument")),
    }
}

pub fn require_address(bytes: &[u8], name: &str) -> Result<Vec<u8>, ContractError> {
    if bytes.len() != ADDRESS_LEN {
        return Err(ContractError::invalid_args(format!(
            "invalid {name} address length: expected {ADDRESS_LEN}, got {}",
            bytes.len()
        )));
    }
    Ok(bytes.to_vec())
}

pub fn require_num_args<T>(args: &[T], expected: usize) -> Result<(), ContractError> {
    if args.len() != expected {
        return Err(ContractError::WrongNumberOfArguments {
            expected,
            got: args.len(),
        });
    }
    Ok(())
}

pub fn require_min_args<T>(args: &[T], min: usize) -> Result<(), ContractError> {
    if args.len() < min {
        return Err(ContractError::WrongNumberOfArguments {
            expected: min,
            got: args.len(),
        });
    }
    Ok(())
}

/// Hex rendering used in return messages and logs.
pub fn display_key(key: &[u8]) -> String {
    hex::encode(key)
}

pub fn has_duplicates(keys: &[Vec<u8>]) -> bool {
    let mut seen = BTreeSet::new();
    keys.iter().any(|k| !seen.insert(k.as_slice()))
}

pub fn to_vecs(args: &[Binary]) -> Vec<Vec<u8>> {
    args.iter().map(|a| a.to_vec()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn biguint_encoding_is_minimal() {
        assert_eq!(encode_biguint(Uint128::zero()), Vec::<u8>::new());
        assert_eq!(encode_biguint(Uint128::new(1)), vec![1]);
        assert_eq!(encode_biguint(Uint128::new(0x0100)), vec![1, 0]);
        assert_eq!(decode_biguint(&[0, 0, 1, 0]).unwrap(), Uint128::new(256));
        assert_eq!(decode_biguint(&[]).unwrap(), Uint128::zero());
    }

    #[test]
    fn oversized_numbers_are_rejected() {
        assert!(decode_biguint(&[1u8; 17]).is_err());
        assert!(decode_u64(&[1u8; 9]).is_err());
        assert_eq!(decode_u64(&[0, 0, 5]).unwrap(), 5);
    }

    #[test]
    fn booleans_are_single_bytes() {
        assert!(decode_bool(&[1]).unwrap());
        assert!(!decode_bool(&[0]).unwrap());
        assert!(decode_bool(&[2]).is_err());
        assert!(decode_bool(&[]).is_err());
    }

    #[test]
    fn duplicate_detection() {
        assert!(has_duplicates(&[b"a".to_vec(), b"b".to_vec(), b"a".to_vec()]));
        assert!(!has_duplicates(&[b"a".to_vec(), b"b".to_vec()]));
    }

    #[test]
    fn deserialize_int_accepts_strings() {
        #[derive(Deserialize)]
        struct Probe {
            #[serde(deserialize_with = "deserialize_int")]
            value: u64,
        }
        let from_str: Probe = serde_json::from_str(r#"{"value": "42"}"#).unwrap();
        let from_num: Probe = serde_json::from_str(r#"{"value": 42}"#).unwrap();
        assert_eq!(from_str.value, 42);
        assert_eq!(from_num.value, 42);
    }
}
