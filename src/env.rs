//! Platform capabilities the core depends on.
//!
//! The core consumes exactly four collaborator capabilities: a strong RNG, a
//! monotonic millisecond clock, and an opaque blob load/store pair. They are
//! bundled into the [`Env`] trait so the core stays free of process-wide
//! state and can be instantiated multiple times in tests.

use crate::error::Error;

/// The environment an authenticator core instance runs against.
pub trait Env {
    /// Fills `buf` with cryptographically strong random bytes. Must not fail.
    fn fill_random(&mut self, buf: &mut [u8]);

    /// Monotonic millisecond clock. Wraps modulo 2^32; consumers use
    /// wrapping subtraction for time deltas.
    fn now_ms(&mut self) -> u32;

    /// Reads the persisted state blob.
    ///
    /// Returns [`Error::NotFound`] if no blob has ever been stored and
    /// [`Error::StorageError`] on an I/O failure.
    fn persist_load(&mut self) -> Result<Vec<u8>, Error>;

    /// Writes the persisted state blob, replacing any previous one.
    fn persist_store(&mut self, blob: &[u8]) -> Result<(), Error>;
}

/// Draws a fixed-size array of random bytes from the environment.
pub fn random_array<const N: usize, E: Env + ?Sized>(env: &mut E) -> [u8; N] {
    let mut out = [0u8; N];
    env.fill_random(&mut out);
    out
}
