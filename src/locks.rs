//! The channel keeps its read side and its write side behind separate locks. Which kind of lock
//!  is chosen when the channel is created, through the channel's type parameter:
//!
//! * [RealLocks] uses a mutex per side, so the channel can be shared between threads
//! * [NoLocks] uses a `RefCell` per side. The channel is not `Sync` then, so the compiler enforces
//!   the single-threaded access that makes locking unnecessary

use std::cell::{RefCell, RefMut};
use std::ops::DerefMut;
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};

pub trait LockCell<T> {
    type Guard<'a>: DerefMut<Target = T> where Self: 'a;

    fn new(value: T) -> Self;

    fn lock(&self) -> Self::Guard<'_>;

    /// Returns `None` if the lock is held elsewhere
    fn try_lock(&self) -> Option<Self::Guard<'_>>;
}

pub trait LockingStrategy: 'static {
    type Cell<T>: LockCell<T>;
}

pub struct RealLocks {}

impl LockingStrategy for RealLocks {
    type Cell<T> = MutexCell<T>;
}

pub struct NoLocks {}

impl LockingStrategy for NoLocks {
    type Cell<T> = UnlockedCell<T>;
}

pub struct MutexCell<T>(Mutex<T>);

/// NB: a panic while the lock is held does not leave the channel's data inconsistent in a way that
///  a later operation could not detect, so poisoning is ignored
impl <T> LockCell<T> for MutexCell<T> {
    type Guard<'a> = MutexGuard<'a, T> where Self: 'a;

    fn new(value: T) -> Self {
        MutexCell(Mutex::new(value))
    }

    fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        match self.0.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }
}

pub struct UnlockedCell<T>(RefCell<T>);

impl <T> LockCell<T> for UnlockedCell<T> {
    type Guard<'a> = RefMut<'a, T> where Self: 'a;

    fn new(value: T) -> Self {
        UnlockedCell(RefCell::new(value))
    }

    /// Panics if the cell is borrowed already, i.e. on re-entrant use
    fn lock(&self) -> RefMut<'_, T> {
        self.0.borrow_mut()
    }

    fn try_lock(&self) -> Option<RefMut<'_, T>> {
        self.0.try_borrow_mut().ok()
    }
}
