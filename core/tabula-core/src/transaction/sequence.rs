use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

/// A source of monotonically increasing transaction numbers.
///
/// Numbers only identify transactions in logs and error messages, and name
/// savepoints; nothing orders on them.
#[derive(Debug)]
pub struct TransactionSequence {
    /// The last number handed out.
    last: AtomicU64,
}

static GLOBAL: LazyLock<TransactionSequence> = LazyLock::new(TransactionSequence::default);

impl TransactionSequence {
    /// Create a sequence whose first number is `start + 1`.
    pub fn new(start: u64) -> Self {
        Self {
            last: AtomicU64::new(start),
        }
    }

    /// The process-wide sequence used by every transaction.
    pub fn global() -> &'static TransactionSequence {
        &GLOBAL
    }

    /// Allocate and return the next number.
    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Read the last allocated number without incrementing.
    pub fn current(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}

impl Default for TransactionSequence {
    fn default() -> Self {
        Self::new(0)
    }
}
