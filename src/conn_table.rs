//! Fixed-size connection arena shared by every worker under shared registration.
//!
//! Each slot carries a one-bit try-lock and a generation counter. Event data
//! is a `Token` packing `(generation << 32) | index`, so an event that names a
//! destroyed connection (possibly with its slot already reused) is recognised
//! as stale instead of driving the wrong connection.
//!
//! The slot's connection is only touched while its lock bit is held.
//! Losing the lock race is not an error; the level-triggered queue reports the
//! outstanding readiness again.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Packed slot index and generation carried in event data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

impl Token {
    pub fn new(index: u32, generation: u32) -> Self {
        Token((u64::from(generation) << 32) | u64::from(index))
    }

    pub fn from_raw(raw: u64) -> Self {
        Token(raw)
    }

    pub fn into_raw(self) -> u64 {
        self.0
    }

    pub fn index(self) -> u32 {
        self.0 as u32
    }

    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

struct Slot<T> {
    locked: AtomicBool,
    generation: AtomicU32,
    value: UnsafeCell<Option<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            generation: AtomicU32::new(0),
            value: UnsafeCell::new(None),
        }
    }

    fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// Outcome of a non-blocking acquire.
pub enum Acquire<'a, T> {
    Granted(SlotGuard<'a, T>),
    /// Another worker holds the slot right now.
    Contended,
    /// The token's connection no longer exists.
    Stale,
}

pub struct SharedTable<T> {
    slots: Box<[Slot<T>]>,
    free: Mutex<Vec<u32>>,
}

// SAFETY: a slot's value is only accessed through a `SlotGuard`, which exists
// only while that slot's lock bit is held by the guard's owner.
unsafe impl<T: Send> Sync for SharedTable<T> {}

impl<T> SharedTable<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity < u32::MAX as usize, "slot index must fit in u32");
        let slots: Vec<Slot<T>> = (0..capacity).map(|_| Slot::new()).collect();
        // Pop from the back hands out low indices first.
        let free: Vec<u32> = (0..capacity as u32).rev().collect();
        Self {
            slots: slots.into_boxed_slice(),
            free: Mutex::new(free),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        self.capacity() - self.free_list().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn free_list(&self) -> std::sync::MutexGuard<'_, Vec<u32>> {
        // A panic while holding this lock cannot leave the Vec inconsistent.
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store `value` in a free slot and return it still locked, so the caller
    /// can finish publishing `guard.token()` before any other thread can
    /// acquire it. Gives the value back when the table is full.
    pub fn insert(&self, value: T) -> Result<SlotGuard<'_, T>, T> {
        let Some(index) = self.free_list().pop() else {
            return Err(value);
        };
        let slot = &self.slots[index as usize];

        // A worker holding a stale event may have the bit for the instant it
        // takes to see the generation mismatch.
        while !slot.try_lock() {
            std::hint::spin_loop();
        }
        // SAFETY: lock bit held.
        unsafe {
            *slot.value.get() = Some(value);
        }
        Ok(SlotGuard {
            table: self,
            slot,
            index,
        })
    }

    /// Non-blocking acquire of the connection named by `token`.
    pub fn try_acquire(&self, token: Token) -> Acquire<'_, T> {
        let Some(slot) = self.slots.get(token.index() as usize) else {
            return Acquire::Stale;
        };
        if !slot.try_lock() {
            return Acquire::Contended;
        }
        // SAFETY: lock bit held.
        let live = unsafe { (*slot.value.get()).is_some() };
        if !live || slot.generation.load(Ordering::Relaxed) != token.generation() {
            slot.unlock();
            return Acquire::Stale;
        }
        Acquire::Granted(SlotGuard {
            table: self,
            slot,
            index: token.index(),
        })
    }
}

/// Exclusive access to one live slot; releases the lock bit on drop.
pub struct SlotGuard<'a, T> {
    table: &'a SharedTable<T>,
    slot: &'a Slot<T>,
    index: u32,
}

impl<T> SlotGuard<'_, T> {
    /// Token naming this slot's current occupant.
    pub fn token(&self) -> Token {
        Token::new(self.index, self.slot.generation.load(Ordering::Relaxed))
    }

    /// Take the value out, retire the token and return the slot to the free list.
    pub fn remove(self) -> T {
        // SAFETY: lock bit held by this guard.
        let value = unsafe { (*self.slot.value.get()).take() };
        self.slot.generation.fetch_add(1, Ordering::Relaxed);
        self.table.free_list().push(self.index);
        // Drop releases the bit after the slot is empty and retired.
        match value {
            Some(value) => value,
            None => unreachable!("guard is only granted for live slots"),
        }
    }
}

impl<T> Deref for SlotGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: lock bit held; slot verified live at acquire.
        match unsafe { &*self.slot.value.get() } {
            Some(value) => value,
            None => unreachable!("guard is only granted for live slots"),
        }
    }
}

impl<T> DerefMut for SlotGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: lock bit held; slot verified live at acquire.
        match unsafe { &mut *self.slot.value.get() } {
            Some(value) => value,
            None => unreachable!("guard is only granted for live slots"),
        }
    }
}

impl<T> Drop for SlotGuard<'_, T> {
    fn drop(&mut self) {
        self.slot.unlock();
    }
}
