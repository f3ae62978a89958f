//! Paths and their address slots.
//!
//! A path is the rendezvous point for one initiator public key. It holds
//! one initiator slot (`0x01`) and 254 responder slots (`0x02..=0xff`).
//! Only authenticated clients ever occupy a slot.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use salty_types::{Address, PublicKey};
use thiserror::Error;

use crate::client::Client;

/// No free responder slot left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("all responder slots are taken")]
pub struct SlotsFull;

/// Concurrent address to value map with round-robin responder allocation.
///
/// Values are handed out as clones; no map guard escapes a method, so
/// callers may freely call back into the map.
pub struct SlotMap<T> {
    slots: DashMap<Address, T>,
    last_allocated: AtomicU8,
}

impl<T: Clone> SlotMap<T> {
    /// Empty map. The first responder gets `0x02`.
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            last_allocated: AtomicU8::new(Address::INITIATOR.value()),
        }
    }

    /// Put `value` into the first free responder slot after the last one
    /// handed out, wrapping around once.
    pub fn add_responder(&self, value: T) -> Result<Address, SlotsFull> {
        let last = u16::from(self.last_allocated.load(Ordering::Acquire));
        let first = u16::from(Address::FIRST_RESPONDER.value());
        let upper = u16::from(Address::LAST_RESPONDER.value());

        for slot in (last + 1..=upper).chain(first..=last) {
            // slot <= 0xff by construction of both ranges
            let address = Address::new(slot as u8);
            if !address.is_valid_responder() {
                continue;
            }
            if let Entry::Vacant(vacant) = self.slots.entry(address) {
                vacant.insert(value);
                self.last_allocated.store(address.value(), Ordering::Release);
                return Ok(address);
            }
        }
        Err(SlotsFull)
    }

    /// Install `value` as initiator, returning the one it replaced.
    pub fn set_initiator(&self, value: T) -> Option<T> {
        self.slots.insert(Address::INITIATOR, value)
    }

    /// Current initiator.
    pub fn initiator(&self) -> Option<T> {
        self.get(Address::INITIATOR)
    }

    /// Value at `id`.
    pub fn get(&self, id: Address) -> Option<T> {
        self.slots.get(&id).map(|entry| entry.value().clone())
    }

    /// Remove and return the value at `id`.
    pub fn del(&self, id: Address) -> Option<T> {
        self.slots.remove(&id).map(|(_, value)| value)
    }

    /// Remove the value at `id` only if `same` accepts it.
    pub fn remove_if(&self, id: Address, same: impl FnOnce(&T) -> bool) -> Option<T> {
        self.slots
            .remove_if(&id, |_, value| same(value))
            .map(|(_, value)| value)
    }

    /// Occupied responder slots in address order.
    pub fn responders(&self) -> Vec<(Address, T)> {
        let mut out: Vec<_> = self
            .slots
            .iter()
            .filter(|entry| entry.key().is_valid_responder())
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        out.sort_by_key(|(address, _)| *address);
        out
    }

    /// Addresses of occupied responder slots in order.
    pub fn responder_ids(&self) -> Vec<Address> {
        self.responders().into_iter().map(|(id, _)| id).collect()
    }

    /// Number of occupied slots, initiator included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True if no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<T: Clone> Default for SlotMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A path: the initiator key it is named after and the clients on it.
pub struct Path {
    key: PublicKey,
    key_hex: String,
    number: u64,
    slots: SlotMap<Arc<Client>>,
    orphan: AtomicBool,
}

impl Path {
    /// New empty path.
    pub fn new(key: PublicKey, number: u64) -> Self {
        let key_hex = hex::encode(key.as_bytes());
        Self {
            key,
            key_hex,
            number,
            slots: SlotMap::new(),
            orphan: AtomicBool::new(false),
        }
    }

    /// Initiator public key the path is named after.
    pub fn initiator_key(&self) -> &PublicKey {
        &self.key
    }

    /// Lowercase hex of the initiator key.
    pub fn key_hex(&self) -> &str {
        &self.key_hex
    }

    /// Sequence number of this path, for logs.
    pub fn number(&self) -> u64 {
        self.number
    }

    /// Clients on this path.
    pub fn slots(&self) -> &SlotMap<Arc<Client>> {
        &self.slots
    }

    /// True if no client is installed.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// True once the path was removed from the registry.
    pub fn is_orphan(&self) -> bool {
        self.orphan.load(Ordering::SeqCst)
    }

    // SeqCst pairs with `Client::install`: a client that inserts itself and
    // then sees no orphan flag is guaranteed to be seen by `Paths::prune`.
    pub(crate) fn mark_orphan(&self) {
        self.orphan.store(true, Ordering::SeqCst);
    }

    pub(crate) fn clear_orphan(&self) {
        self.orphan.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Path")
            .field("number", &self.number)
            .field("key", &&self.key_hex[..8])
            .field("clients", &self.slots.len())
            .field("orphan", &self.is_orphan())
            .finish()
    }
}
