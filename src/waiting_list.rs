//! Doubly linked FIFO of BLS keys waiting for an active slot.
//!
//! The head record holds the first and last keys and the length; every element
//! stores its neighbours by key. An empty key means "no neighbour".

use cosmwasm_std::{Binary, Storage};

use crate::error::ContractError;
use crate::helpers::display_key;
use crate::state::{ElementInList, WaitingListHead, WAITING_ELEMENTS, WAITING_LIST_HEAD};

pub fn load_head(store: &dyn Storage) -> Result<WaitingListHead, ContractError> {
    Ok(WAITING_LIST_HEAD.may_load(store)?.unwrap_or_default())
}

pub fn contains(store: &dyn Storage, key: &[u8]) -> bool {
    WAITING_ELEMENTS.has(store, key)
}

fn load_element(store: &dyn Storage, key: &[u8]) -> Result<ElementInList, ContractError> {
    WAITING_ELEMENTS
        .may_load(store, key)?
        .ok_or_else(|| ContractError::invalid_state(format!("waiting list element missing for {}", display_key(key))))
}

fn set_next(store: &mut dyn Storage, key: &[u8], next: &[u8]) -> Result<(), ContractError> {
    let mut element = load_element(store, key)?;
    element.next_key = Binary::from(next);
    WAITING_ELEMENTS.save(store, key, &element)?;
    Ok(())
}

fn set_previous(store: &mut dyn Storage, key: &[u8], previous: &[u8]) -> Result<(), ContractError> {
    let mut element = load_element(store, key)?;
    element.previous_key = Binary::from(previous);
    WAITING_ELEMENTS.save(store, key, &element)?;
    Ok(())
}

pub fn add_to_end(store: &mut dyn Storage, key: &[u8]) -> Result<(), ContractError> {
    if contains(store, key) {
        return Err(ContractError::invalid_state(format!(
            "key {} already in waiting list",
            display_key(key)
        )));
    }
    let mut head = load_head(store)?;
    let element = ElementInList {
        bls_public_key: Binary::from(key),
        previous_key: head.last_key.clone(),
        next_key: Binary::default(),
    };
    WAITING_ELEMENTS.save(store, key, &element)?;

    if head.length == 0 {
        head.first_key = Binary::from(key);
    } else {
        set_next(store, &head.last_key, key)?;
    }
    head.last_key = Binary::from(key);
    head.length += 1;
    WAITING_LIST_HEAD.save(store, &head)?;
    Ok(())
}

/// Unjailed keys get ahead of normally queued keys, in unjail order: the key
/// goes right after the previously unjailed one still waiting, or first.
pub fn add_jailed_to_front(store: &mut dyn Storage, key: &[u8]) -> Result<(), ContractError> {
    if contains(store, key) {
        return Err(ContractError::invalid_state(format!(
            "key {} already in waiting list",
            display_key(key)
        )));
    }
    let mut head = load_head(store)?;
    if head.length == 0 {
        add_to_end(store, key)?;
        let mut head = load_head(store)?;
        head.last_jailed_key = Binary::from(key);
        WAITING_LIST_HEAD.save(store, &head)?;
        return Ok(());
    }

    let anchor = if !head.last_jailed_key.is_empty() && contains(store, &head.last_jailed_key) {
        Some(head.last_jailed_key.to_vec())
    } else {
        None
    };

    match anchor {
        Some(previous) => {
            let previous_element = load_element(store, &previous)?;
            let next = previous_element.next_key.to_vec();
            WAITING_ELEMENTS.save(
                store,
                key,
                &ElementInList {
                    bls_public_key: Binary::from(key),
                    previous_key: Binary::from(previous.as_slice()),
                    next_key: Binary::from(next.as_slice()),
                },
            )?;
            set_next(store, &previous, key)?;
            if next.is_empty() {
                head.last_key = Binary::from(key);
            } else {
                set_previous(store, &next, key)?;
            }
        }
        None => {
            let first = head.first_key.to_vec();
            WAITING_ELEMENTS.save(
                store,
                key,
                &ElementInList {
                    bls_public_key: Binary::from(key),
                    previous_key: Binary::default(),
                    next_key: Binary::from(first.as_slice()),
                },
            )?;
            set_previous(store, &first, key)?;
            head.first_key = Binary::from(key);
        }
    }

    head.length += 1;
    head.last_jailed_key = Binary::from(key);
    WAITING_LIST_HEAD.save(store, &head)?;
    Ok(())
}

pub fn remove(store: &mut dyn Storage, key: &[u8]) -> Result<(), ContractError> {
    let element = load_element(store, key)?;
    let mut head = load_head(store)?;
    let previous = element.previous_key.to_vec();
    let next = element.next_key.to_vec();

    if previous.is_empty() {
        head.first_key = Binary::from(next.as_slice());
    } else {
        set_next(store, &previous, &next)?;
    }
    if next.is_empty() {
        head.last_key = Binary::from(previous.as_slice());
    } else {
        set_previous(store, &next, &previous)?;
    }
    if head.last_jailed_key.as_slice() == key {
        head.last_jailed_key = Binary::from(previous.as_slice());
    }

    head.length = head.length.saturating_sub(1);
    WAITING_ELEMENTS.remove(store, key);
    WAITING_LIST_HEAD.save(store, &head)?;
    Ok(())
}

pub fn pop_front(store: &mut dyn Storage) -> Result<Option<Vec<u8>>, ContractError> {
    let head = load_head(store)?;
    if head.length == 0 {
        return Ok(None);
    }
    let first = head.first_key.to_vec();
    remove(store, &first)?;
    Ok(Some(first))
}

/// One-based position of `key` in the queue.
pub fn index_of(store: &dyn Storage, key: &[u8]) -> Result<Option<u32>, ContractError> {
    Ok(keys(store)?
        .iter()
        .position(|k| k.as_slice() == key)
        .map(|i| i as u32 + 1))
}

pub fn keys(store: &dyn Storage) -> Result<Vec<Vec<u8>>, ContractError> {
    let head = load_head(store)?;
    let mut out = Vec::with_capacity(head.length as usize);
    let mut current = head.first_key.to_vec();
    while !current.is_empty() {
        if out.len() > head.length as usize {
            return Err(ContractError::invalid_state("waiting list is cyclic"));
        }
        let element = load_element(store, &current)?;
        out.push(current);
        current = element.next_key.to_vec();
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::TrieStorage;

    fn k(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    fn queued(store: &dyn Storage) -> Vec<Vec<u8>> {
        keys(store).unwrap()
    }

    #[test]
    fn fifo_order_and_removal_in_the_middle() {
        let mut store = TrieStorage::new();
        for key in ["a", "b", "c"] {
            add_to_end(&mut store, key.as_bytes()).unwrap();
        }
        assert_eq!(queued(&store), vec![k("a"), k("b"), k("c")]);

        remove(&mut store, b"b").unwrap();
        assert_eq!(queued(&store), vec![k("a"), k("c")]);
        assert_eq!(load_head(&store).unwrap().length, 2);

        assert_eq!(pop_front(&mut store).unwrap(), Some(k("a")));
        assert_eq!(pop_front(&mut store).unwrap(), Some(k("c")));
        assert_eq!(pop_front(&mut store).unwrap(), None);
        assert_eq!(load_head(&store).unwrap(), WaitingListHead::default());
    }

    #[test]
    fn removing_the_tail_updates_last_key() {
        let mut store = TrieStorage::new();
        add_to_end(&mut store, b"a").unwrap();
        add_to_end(&mut store, b"b").unwrap();
        remove(&mut store, b"b").unwrap();
        add_to_end(&mut store, b"c").unwrap();
        assert_eq!(queued(&store), vec![k("a"), k("c")]);
        assert_eq!(index_of(&store, b"c").unwrap(), Some(2));
        assert_eq!(index_of(&store, b"b").unwrap(), None);
    }

    #[test]
    fn unjailed_keys_queue_ahead_in_unjail_order() {
        let mut store = TrieStorage::new();
        add_to_end(&mut store, b"a").unwrap();
        add_to_end(&mut store, b"b").unwrap();
        add_jailed_to_front(&mut store, b"j1").unwrap();
        add_jailed_to_front(&mut store, b"j2").unwrap();
        assert_eq!(queued(&store), vec![k("j1"), k("j2"), k("a"), k("b")]);

        remove(&mut store, b"j2").unwrap();
        add_jailed_to_front(&mut store, b"j3").unwrap();
        assert_eq!(queued(&store), vec![k("j1"), k("j3"), k("a"), k("b")]);
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut store = TrieStorage::new();
        add_to_end(&mut store, b"a").unwrap();
        assert!(add_to_end(&mut store, b"a").is_err());
        assert!(remove(&mut store, b"missing").is_err());
    }
}
