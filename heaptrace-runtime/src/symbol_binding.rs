use std::sync::Arc;

use log::debug;

use crate::codec::Value;
use crate::error::Result;
use crate::memory_access::TargetMemory;
use crate::variable_model::{Pointee, RemoteVariable, TypeDesc};

/// A variable whose address is not fixed but looked up from a named symbol, optionally
/// scoped to one loaded module.
///
/// The symbol is re-resolved before every operation so the variable follows the symbol
/// across target (re)loads; a resolved address is never trusted once the call that
/// produced it has returned. If the symbol cannot be found (library unloaded, process
/// gone), the operation fails with `SymbolNotFound` instead of falling back to a stale
/// address.
pub struct SymbolBoundVariable<M: TargetMemory> {
    symbol: String,
    module: Option<String>,
    inner: RemoteVariable<M>,
}

impl<M: TargetMemory> SymbolBoundVariable<M> {
    pub fn new(
        memory: Arc<M>,
        symbol: &str,
        module: Option<&str>,
        desc: &TypeDesc,
    ) -> SymbolBoundVariable<M> {
        SymbolBoundVariable {
            symbol: symbol.to_string(),
            module: module.map(|module| module.to_string()),
            inner: RemoteVariable::new(memory, desc),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Resolves the symbol and re-points the inner variable when the address moved
    fn rebind(&mut self) -> Result<u64> {
        let address = self
            .inner
            .memory()
            .resolve_symbol(&self.symbol, self.module.as_deref())?;
        if self.inner.address().ok() != Some(address) {
            debug!("symbol `{}` resolved to {address:#x}", self.symbol);
            self.inner.assign_address(address)?;
        }
        Ok(address)
    }

    /// Current address of the symbol in the target
    pub fn address(&mut self) -> Result<u64> {
        self.rebind()
    }

    pub fn size(&mut self) -> Result<u64> {
        self.rebind()?;
        self.inner.size()
    }

    pub fn get(&mut self) -> Result<Value> {
        self.rebind()?;
        self.inner.get()
    }

    pub fn set(&mut self, value: &Value) -> Result<()> {
        self.rebind()?;
        self.inner.set(value)
    }

    /// Dereferences a symbol-bound pointer variable, yielding a live view of its pointee
    pub fn dereference(&mut self) -> Result<Pointee<'_, M>> {
        self.rebind()?;
        self.inner.dereference()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CapturedMemory;
    use crate::codec::ScalarKind;
    use crate::error::Error;

    #[test]
    fn resolves_on_each_access() {
        let memory = CapturedMemory::new();
        memory.map_region(0x1000, vec![0u8; 0x100]);
        memory.load_module("libtraced.so");
        memory.define_symbol(Some("libtraced.so"), "COUNTER", 0x1000);
        let memory = Arc::new(memory);

        let mut var = SymbolBoundVariable::new(
            memory.clone(),
            "COUNTER",
            Some("libtraced.so"),
            &TypeDesc::Scalar(ScalarKind::UInt64),
        );
        var.set(&Value::UInt64(3)).unwrap();
        assert_eq!(var.get().unwrap(), Value::UInt64(3));
        assert_eq!(var.address().unwrap(), 0x1000);

        // Simulate a target reload that moved the symbol
        memory.define_symbol(Some("libtraced.so"), "COUNTER", 0x1040);
        assert_eq!(var.address().unwrap(), 0x1040);
        assert_eq!(var.get().unwrap(), Value::UInt64(0));
    }

    #[test]
    fn missing_symbol_is_an_error_not_a_stale_read() {
        let memory = Arc::new(CapturedMemory::new());
        let mut var = SymbolBoundVariable::new(
            memory,
            "GONE",
            None,
            &TypeDesc::Scalar(ScalarKind::UInt8),
        );
        assert!(matches!(var.get(), Err(Error::SymbolNotFound { .. })));
    }
}
