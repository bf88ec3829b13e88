//! Memory-bridge contract.
//!
//! The register bridge itself (address-range registration, reads and writes
//! into mapped pages) lives outside this crate; the protocol core only
//! depends on this contract. What is modeled here is the caller-visible
//! [`Transaction`] and the lock capability it carries: a holder may keep the
//! lock across a read-modify-write sequence to guarantee no interleaving
//! with other users of the same transaction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use thiserror::Error;

/// Errors from a memory-bridge implementation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The address range is not mapped. Surfaced per request; sibling
    /// requests in a batch are unaffected.
    #[error("address range not mapped: 0x{0:08x}")]
    AddressNotMapped(u64),
}

/// The register-access contract a memory bridge fulfills.
#[async_trait]
pub trait MemoryBridge: Send + Sync {
    /// Write `data` at `address`.
    async fn write(&self, address: u64, data: &[u8]) -> Result<(), BridgeError>;

    /// Read `length` bytes from `address`.
    async fn read(&self, address: u64, length: usize) -> Result<Vec<u8>, BridgeError>;
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// One register-access transaction.
///
/// Carries its own lock as a capability: [`lock`](Transaction::lock) returns
/// a guard whose construction acquires, whose release is idempotent, and
/// which may re-acquire after releasing.
#[derive(Debug)]
pub struct Transaction {
    id: u64,
    address: u64,
    size: usize,
    excl: Mutex<()>,
}

impl Transaction {
    /// Create a transaction covering `size` bytes at `address`.
    pub fn new(address: u64, size: usize) -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            address,
            size,
            excl: Mutex::new(()),
        }
    }

    /// Unique transaction id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Target address.
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Transaction size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Acquire the transaction lock.
    ///
    /// Blocks the calling thread while another holder has it.
    pub fn lock(&self) -> TransactionLock<'_> {
        let guard = self.excl.lock().unwrap_or_else(|e| e.into_inner());
        TransactionLock {
            tran: self,
            guard: Some(guard),
        }
    }
}

/// Scoped guard over a [`Transaction`]'s lock.
///
/// [`unlock`](TransactionLock::unlock) may be called any number of times;
/// [`lock`](TransactionLock::lock) re-acquires after a release. Dropping the
/// guard releases the lock if still held.
#[derive(Debug)]
pub struct TransactionLock<'a> {
    tran: &'a Transaction,
    guard: Option<MutexGuard<'a, ()>>,
}

impl TransactionLock<'_> {
    /// Re-acquire the lock if this guard released it earlier.
    pub fn lock(&mut self) {
        if self.guard.is_none() {
            self.guard = Some(self.tran.excl.lock().unwrap_or_else(|e| e.into_inner()));
        }
    }

    /// Release the lock. Idempotent.
    pub fn unlock(&mut self) {
        self.guard = None;
    }

    /// Whether this guard currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.guard.is_some()
    }
}
