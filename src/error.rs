//! Error types for the SPI master engine
//!
//! Every fallible operation returns the flat [`Error`] enum. Operations that
//! take ownership of a [`Transaction`] hand it back inside [`Rejected`] when
//! they fail, so caller buffers are never lost on a timeout or a bad request.
//!
//! DMA overrun/underrun is not an error here: the transfer still completed,
//! so it is reported through sentinel flags on the retrieved transaction
//! (see [`TransFlags::DMA_RX_FAIL`](crate::TransFlags::DMA_RX_FAIL)).

use crate::driver::transaction::Transaction;

// =============================================================================
// Error
// =============================================================================

/// Engine error taxonomy.
///
/// Nothing in the engine retries on its own; `NoMemory` and `Timeout` are
/// transient and may succeed once other work drains, the rest are caller
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Malformed request or configuration
    InvalidArgument,
    /// Operation attempted in the wrong mode (e.g. while polling)
    InvalidState,
    /// The host hardware cannot do what was asked
    NotSupported,
    /// Buffer or descriptor exhaustion
    NoMemory,
    /// Queue full, or hardware did not finish within the wait
    Timeout,
    /// No free chip-select slot on the bus
    NotFound,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Returns a human-readable description of the error
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Error::InvalidArgument => "invalid argument",
            Error::InvalidState => "invalid state for operation",
            Error::NotSupported => "not supported by host hardware",
            Error::NoMemory => "out of memory or descriptors",
            Error::Timeout => "operation timed out",
            Error::NotFound => "no free chip-select slot",
        }
    }

    /// Whether the caller may retry after other work has drained
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Error::NoMemory | Error::Timeout)
    }
}

/// Result type alias for engine operations
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// Rejected transactions
// =============================================================================

/// A request the engine refused, together with the reason.
///
/// Returned by operations that take a transaction (or a burst's segment
/// list) by value. Convert into [`Error`] with `?` when the buffers are not
/// needed back.
pub struct Rejected<T = Transaction> {
    /// Why the request was refused
    pub error: Error,
    /// The request, unchanged apart from any fields the engine defaulted
    pub transaction: T,
}

impl<T> Rejected<T> {
    pub(crate) fn new(error: Error, transaction: T) -> Self {
        Self { error, transaction }
    }
}

impl<T> core::fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Rejected")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl<T> core::fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "transaction rejected: {}", self.error.as_str())
    }
}

impl<T> From<Rejected<T>> for Error {
    fn from(r: Rejected<T>) -> Self {
        r.error
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
