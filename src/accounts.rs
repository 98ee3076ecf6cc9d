//! In-memory world state: accounts plus one ordered key/value store shared by
//! every contract, each contract writing under its own address namespace.
//!
//! Every write records the value it replaced, so a nested call can be undone
//! by walking the journal back to a `Checkpoint` instead of copying the world.

use cosmwasm_std::{Order, Record, Storage, Uint128};
use cosmwasm_storage::{prefixed, prefixed_read, PrefixedStorage, ReadonlyPrefixedStorage};
use std::collections::BTreeMap;
use std::ops::Bound;

use crate::error::ContractError;
use crate::helpers::display_key;

type Undo<V> = (Vec<u8>, Option<V>);

/// Ordered byte store implementing `cosmwasm_std::Storage`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrieStorage {
    data: BTreeMap<Vec<u8>, Vec<u8>>,
    journal: Vec<Undo<Vec<u8>>>,
}

impl TrieStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn revert_to(&mut self, len: usize) {
        while self.journal.len() > len {
            let Some((key, old)) = self.journal.pop() else {
                break;
            };
            match old {
                Some(value) => self.data.insert(key, value),
                None => self.data.remove(&key),
            };
        }
    }
}

impl Storage for TrieStorage {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.get(key).cloned()
    }

    fn range<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        order: Order,
    ) -> Box<dyn Iterator<Item = Record> + 'a> {
        if let (Some(s), Some(e)) = (start, end) {
            if s >= e {
                return Box::new(std::iter::empty());
            }
        }
        let lower = start.map_or(Bound::Unbounded, |s| Bound::Included(s.to_vec()));
        let upper = end.map_or(Bound::Unbounded, |e| Bound::Excluded(e.to_vec()));
        let iter = self
            .data
            .range((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()));
        match order {
            Order::Ascending => Box::new(iter),
            Order::Descending => Box::new(iter.rev()),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        let old = self.data.insert(key.to_vec(), value.to_vec());
        self.journal.push((key.to_vec(), old));
    }

    fn remove(&mut self, key: &[u8]) {
        if let Some(old) = self.data.remove(key) {
            self.journal.push((key.to_vec(), Some(old)));
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    pub balance: Uint128,
    /// Code identifier; empty for user accounts.
    pub code: Vec<u8>,
    pub code_deployer: Vec<u8>,
}

/// Position in the write journal of a `StateDb`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    storage: usize,
    accounts: usize,
}

/// Accounts and contract storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateDb {
    accounts: BTreeMap<Vec<u8>, Account>,
    storage: TrieStorage,
    journal: Vec<Undo<Account>>,
}

impl StateDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(&self, address: &[u8]) -> Option<&Account> {
        self.accounts.get(address)
    }

    pub fn account_mut(&mut self, address: &[u8]) -> &mut Account {
        self.journal
            .push((address.to_vec(), self.accounts.get(address).cloned()));
        self.accounts.entry(address.to_vec()).or_default()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            storage: self.storage.journal.len(),
            accounts: self.journal.len(),
        }
    }

    /// Undoes every write made after `checkpoint`.
    pub fn revert_to(&mut self, checkpoint: Checkpoint) {
        self.storage.revert_to(checkpoint.storage);
        while self.journal.len() > checkpoint.accounts {
            let Some((address, old)) = self.journal.pop() else {
                break;
            };
            match old {
                Some(account) => self.accounts.insert(address, account),
                None => self.accounts.remove(&address),
            };
        }
    }

    /// Forgets the journal once the writes are final.
    pub fn commit(&mut self) {
        self.storage.journal.clear();
        self.journal.clear();
    }

    pub fn journal_len(&self) -> usize {
        self.storage.journal.len() + self.journal.len()
    }

    pub fn balance(&self, address: &[u8]) -> Uint128 {
        self.account(address).map(|a| a.balance).unwrap_or_default()
    }

    pub fn add_balance(&mut self, address: &[u8], value: Uint128) -> Result<(), ContractError> {
        let account = self.account_mut(address);
        account.balance = account.balance.checked_add(value)?;
        Ok(())
    }

    pub fn sub_balance(&mut self, address: &[u8], value: Uint128) -> Result<(), ContractError> {
        let balance = self.balance(address);
        if balance < value {
            return Err(ContractError::InsufficientFunds {
                address: display_key(address),
                balance,
                required: value,
            });
        }
        self.account_mut(address).balance = balance - value;
        Ok(())
    }

    pub fn move_balance(
        &mut self,
        from: &[u8],
        to: &[u8],
        value: Uint128,
    ) -> Result<(), ContractError> {
        if value.is_zero() {
            return Ok(());
        }
        self.sub_balance(from, value)?;
        self.add_balance(to, value)
    }

    pub fn code(&self, address: &[u8]) -> Option<&[u8]> {
        self.account(address)
            .map(|a| a.code.as_slice())
            .filter(|code| !code.is_empty())
    }

    pub fn set_code(&mut self, address: &[u8], code: &[u8], deployer: &[u8]) {
        let account = self.account_mut(address);
        account.code = code.to_vec();
        account.code_deployer = deployer.to_vec();
    }

    pub fn code_deployer(&self, address: &[u8]) -> Option<&[u8]> {
        self.account(address).map(|a| a.code_deployer.as_slice())
    }

    pub fn set_code_deployer(&mut self, address: &[u8], deployer: &[u8]) {
        self.account_mut(address).code_deployer = deployer.to_vec();
    }

    /// Storage of one contract, namespaced by its address.
    pub fn contract_storage(&mut self, address: &[u8]) -> PrefixedStorage<'_> {
        prefixed(&mut self.storage, address)
    }

    pub fn contract_storage_read(&self, address: &[u8]) -> ReadonlyPrefixedStorage<'_> {
        prefixed_read(&self.storage, address)
    }

    pub fn raw_storage(&self) -> &TrieStorage {
        &self.storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_respects_bounds_and_order() {
        let mut store = TrieStorage::new();
        for k in [b"a", b"b", b"c", b"d"] {
            store.set(k, k);
        }
        let keys: Vec<Vec<u8>> = store
            .range(Some(b"b".as_slice()), Some(b"d".as_slice()), Order::Ascending)
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

        let keys: Vec<Vec<u8>> = store
            .range(None, None, Order::Descending)
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys.first(), Some(&b"d".to_vec()));
        assert_eq!(store.range(Some(b"c".as_slice()), Some(b"a".as_slice()), Order::Ascending).count(), 0);
    }

    #[test]
    fn contract_namespaces_are_isolated() {
        let mut state = StateDb::new();
        state.contract_storage(b"first").set(b"key", b"1");
        state.contract_storage(b"second").set(b"key", b"2");

        assert_eq!(state.contract_storage_read(b"first").get(b"key"), Some(b"1".to_vec()));
        assert_eq!(state.contract_storage_read(b"second").get(b"key"), Some(b"2".to_vec()));
        assert_eq!(state.contract_storage_read(b"third").get(b"key"), None);
    }

    #[test]
    fn revert_undoes_writes_after_checkpoint() {
        let mut state = StateDb::new();
        state.add_balance(b"alice", Uint128::new(10)).unwrap();
        state.contract_storage(b"sc").set(b"kept", b"1");
        let checkpoint = state.checkpoint();

        state.contract_storage(b"sc").set(b"kept", b"2");
        state.contract_storage(b"sc").set(b"added", b"3");
        state.contract_storage(b"sc").remove(b"kept");
        state.move_balance(b"alice", b"bob", Uint128::new(4)).unwrap();
        state.set_code(b"contract", b"delegation", b"alice");

        state.revert_to(checkpoint);
        assert_eq!(state.contract_storage_read(b"sc").get(b"kept"), Some(b"1".to_vec()));
        assert_eq!(state.contract_storage_read(b"sc").get(b"added"), None);
        assert_eq!(state.balance(b"alice"), Uint128::new(10));
        assert!(state.account(b"bob").is_none());
        assert!(state.code(b"contract").is_none());
    }

    #[test]
    fn commit_drops_the_journal() {
        let mut state = StateDb::new();
        state.add_balance(b"alice", Uint128::new(1)).unwrap();
        state.contract_storage(b"sc").set(b"k", b"v");
        assert!(state.journal_len() > 0);
        state.commit();
        assert_eq!(state.journal_len(), 0);
        assert_eq!(state.balance(b"alice"), Uint128::new(1));
    }

    #[test]
    fn balance_moves_are_checked() {
        let mut state = StateDb::new();
        state.add_balance(b"alice", Uint128::new(10)).unwrap();
        state.move_balance(b"alice", b"bob", Uint128::new(4)).unwrap();
        assert_eq!(state.balance(b"alice"), Uint128::new(6));
        assert_eq!(state.balance(b"bob"), Uint128::new(4));

        let err = state.move_balance(b"bob", b"alice", Uint128::new(5)).unwrap_err();
        assert!(matches!(err, ContractError::InsufficientFunds { .. }));
        assert_eq!(state.balance(b"bob"), Uint128::new(4));
    }
}
