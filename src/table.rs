// src/table.rs
//
// Connection arena: a fixed number of slots, each holding one `Conn` behind
// a mutex, addressed by index plus a generation counter. The generation is
// part of the epoll token, so an event for a closed-and-reused slot can be
// recognized as stale instead of being mistaken for the new occupant.
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::conn::Conn;

/// Stable handle to a connection slot. Packs into the epoll `u64` token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnToken {
    pub index: u32,
    pub generation: u32,
}

impl ConnToken {
    pub fn as_u64(self) -> u64 {
        (self.generation as u64) << 32 | self.index as u64
    }

    pub fn from_u64(raw: u64) -> Self {
        Self {
            index: raw as u32,
            generation: (raw >> 32) as u32,
        }
    }
}

struct Slot {
    generation: AtomicU32,
    conn: Mutex<Conn>,
}

pub struct ConnTable {
    slots: Box<[Slot]>,
    free: Mutex<Vec<u32>>,
}

impl ConnTable {
    /// Allocate every slot up front; the capacity is the maximum number of
    /// tracked connections.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                generation: AtomicU32::new(0),
                conn: Mutex::new(Conn::new()),
            });
        }
        // LIFO free list; lowest indices come out first.
        let free: Vec<u32> = (0..capacity as u32).rev().collect();
        Self {
            slots: slots.into_boxed_slice(),
            free: Mutex::new(free),
        }
    }

    /// O(1) allocation of a free slot. `None` when at capacity. The caller
    /// initializes the `Conn` under its lock.
    pub fn allocate(&self) -> Option<ConnToken> {
        let mut free = self.free.lock().expect("free list poisoned");
        let index = free.pop()?;
        let generation = self.slots[index as usize].generation.load(Ordering::Acquire);
        Some(ConnToken { index, generation })
    }

    /// Slot lookup, refusing stale tokens from a previous occupant.
    pub fn get(&self, token: ConnToken) -> Option<&Mutex<Conn>> {
        let slot = self.slots.get(token.index as usize)?;
        if slot.generation.load(Ordering::Acquire) != token.generation {
            return None;
        }
        Some(&slot.conn)
    }

    /// First half of teardown: bump the generation so the token dies.
    /// Exactly one caller wins and gets the slot back to clean up; losers
    /// see `None` and must not touch it. The slot is not reusable until
    /// [`ConnTable::release`].
    pub fn retire(&self, token: ConnToken) -> Option<&Mutex<Conn>> {
        let _free = self.free.lock().expect("free list poisoned");
        let slot = self.slots.get(token.index as usize)?;
        if slot.generation.load(Ordering::Acquire) != token.generation {
            return None;
        }
        slot.generation
            .store(token.generation.wrapping_add(1), Ordering::Release);
        Some(&slot.conn)
    }

    /// Second half of teardown: return the slot to the free list, after the
    /// winning retirer has closed the socket and cleared the `Conn`.
    pub fn release(&self, index: u32) {
        let mut free = self.free.lock().expect("free list poisoned");
        debug_assert!(!free.contains(&index));
        free.push(index);
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.free.lock().expect("free list poisoned").is_empty()
    }

    pub fn active(&self) -> usize {
        self.capacity() - self.free.lock().expect("free list poisoned").len()
    }

    /// Snapshot of the tokens currently in use. Used by shutdown to close
    /// whatever connections remain.
    pub fn active_tokens(&self) -> Vec<ConnToken> {
        let free = self.free.lock().expect("free list poisoned");
        let mut in_use = vec![true; self.capacity()];
        for &index in free.iter() {
            in_use[index as usize] = false;
        }
        in_use
            .iter()
            .enumerate()
            .filter(|(_, used)| **used)
            .map(|(index, _)| ConnToken {
                index: index as u32,
                generation: self.slots[index].generation.load(Ordering::Acquire),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trips_through_u64() {
        let token = ConnToken {
            index: 1234,
            generation: 987,
        };
        assert_eq!(ConnToken::from_u64(token.as_u64()), token);
    }

    #[test]
    fn allocate_retire_release_cycle() {
        let table = ConnTable::new(2);
        let t1 = table.allocate().unwrap();
        let t2 = table.allocate().unwrap();
        assert!(table.allocate().is_none());
        assert!(table.is_full());
        assert_eq!(table.active(), 2);

        assert!(table.retire(t1).is_some());
        // Second retire is a stale token: exactly one winner.
        assert!(table.retire(t1).is_none());
        table.release(t1.index);
        assert_eq!(table.active(), 1);

        // The reused slot gets a new generation; the old token is dead.
        let t3 = table.allocate().unwrap();
        assert_eq!(t3.index, t1.index);
        assert_ne!(t3.generation, t1.generation);
        assert!(table.get(t1).is_none());
        assert!(table.get(t3).is_some());
        assert!(table.get(t2).is_some());
    }

    #[test]
    fn get_refuses_out_of_range_index() {
        let table = ConnTable::new(1);
        let bogus = ConnToken {
            index: 42,
            generation: 0,
        };
        assert!(table.get(bogus).is_none());
        assert!(table.retire(bogus).is_none());
    }
}
