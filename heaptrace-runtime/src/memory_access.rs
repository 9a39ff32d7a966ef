use crate::codec::{ScalarKind, Value};
use crate::error::Result;

/// Interface for the target's memory and symbol table. Addresses are absolute addresses
/// within the target's address space, which is generally not the controller's own.
///
/// Implementations block on each call and are safe to use from one controller thread at a
/// time; nothing here caches values between calls, so every scalar read observes the
/// target's memory as it is at call time.
pub trait TargetMemory {
    /// Returns true while a target process exists to read from
    fn is_attached(&self) -> bool;

    /// Returns true if the named module (shared object) is mapped into the target
    fn module_loaded(&self, module: &str) -> bool;

    /// Reads `buffer.len()` bytes starting at `address`. Unmapped memory is a
    /// `MemoryAccessFault`, never a short read.
    fn read_chunk(&self, address: u64, buffer: &mut [u8]) -> Result<()>;

    /// Writes the whole buffer starting at `address`
    fn write_chunk(&self, address: u64, buffer: &[u8]) -> Result<()>;

    /// Resolves the current absolute address of a named symbol, optionally scoped to one
    /// loaded module. Symbols move when the target reloads, so callers must not cache the
    /// result across target restarts.
    fn resolve_symbol(&self, symbol: &str, module: Option<&str>) -> Result<u64>;

    /// Reads and decodes one scalar at `address`
    fn read_scalar(&self, kind: ScalarKind, address: u64) -> Result<Value> {
        let mut buffer = vec![0u8; kind.width()];
        self.read_chunk(address, &mut buffer)?;
        kind.decode(&buffer)
    }

    /// Encodes and writes one scalar at `address`
    fn write_scalar(&self, kind: ScalarKind, address: u64, value: &Value) -> Result<()> {
        let bytes = kind.encode(value)?;
        self.write_chunk(address, &bytes)
    }
}
