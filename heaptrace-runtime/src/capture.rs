use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::memory_access::TargetMemory;

/// A byte-for-byte capture of target state backing the `TargetMemory` trait with owned
/// buffers: mapped regions, a symbol table and the set of loaded modules.
///
/// Useful for replaying previously captured targets offline and as a deterministic
/// backend in tests. Writes mutate the captured bytes, so snapshot protocols can be
/// exercised end to end without a live process.
pub struct CapturedMemory {
    inner: Mutex<Inner>,
}

struct Inner {
    regions: Vec<Region>,
    symbols: BTreeMap<(Option<String>, String), u64>,
    modules: BTreeSet<String>,
    attached: bool,
}

struct Region {
    start: u64,
    bytes: Vec<u8>,
}

impl Region {
    fn end(&self) -> u64 {
        self.start + self.bytes.len() as u64
    }

    /// True if `[address, address + length)` lies fully inside the region. Accesses
    /// wrapping the top of the address space are out by definition.
    fn contains(&self, address: u64, length: usize) -> bool {
        address >= self.start
            && address
                .checked_add(length as u64)
                .is_some_and(|end| end <= self.end())
    }
}

impl Default for CapturedMemory {
    fn default() -> CapturedMemory {
        CapturedMemory::new()
    }
}

impl CapturedMemory {
    pub fn new() -> CapturedMemory {
        CapturedMemory {
            inner: Mutex::new(Inner {
                regions: Vec::new(),
                symbols: BTreeMap::new(),
                modules: BTreeSet::new(),
                attached: true,
            }),
        }
    }

    /// Maps a region of captured bytes at `start`
    pub fn map_region(&self, start: u64, bytes: Vec<u8>) {
        self.inner.lock().unwrap().regions.push(Region { start, bytes });
    }

    /// Records a module as loaded in the captured target
    pub fn load_module(&self, module: &str) {
        self.inner.lock().unwrap().modules.insert(module.to_string());
    }

    pub fn unload_module(&self, module: &str) {
        self.inner.lock().unwrap().modules.remove(module);
    }

    /// Defines (or moves) a symbol; redefining models a target reload
    pub fn define_symbol(&self, module: Option<&str>, symbol: &str, address: u64) {
        self.inner.lock().unwrap().symbols.insert(
            (module.map(|module| module.to_string()), symbol.to_string()),
            address,
        );
    }

    pub fn undefine_symbol(&self, module: Option<&str>, symbol: &str) {
        self.inner
            .lock()
            .unwrap()
            .symbols
            .remove(&(module.map(|module| module.to_string()), symbol.to_string()));
    }

    /// Marks the captured target as running or gone
    pub fn set_attached(&self, attached: bool) {
        self.inner.lock().unwrap().attached = attached;
    }

    /// Copies out a region of captured bytes without going through the trait
    pub fn dump(&self, address: u64, length: usize) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; length];
        self.read_chunk(address, &mut buffer)?;
        Ok(buffer)
    }
}

impl TargetMemory for CapturedMemory {
    fn is_attached(&self) -> bool {
        self.inner.lock().unwrap().attached
    }

    fn module_loaded(&self, module: &str) -> bool {
        self.inner.lock().unwrap().modules.contains(module)
    }

    fn read_chunk(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let region = inner.find_region(address, buffer.len())?;
        let offset = (address - region.start) as usize;
        buffer.copy_from_slice(&region.bytes[offset..offset + buffer.len()]);
        Ok(())
    }

    fn write_chunk(&self, address: u64, buffer: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let region = inner.find_region_mut(address, buffer.len())?;
        let offset = (address - region.start) as usize;
        region.bytes[offset..offset + buffer.len()].copy_from_slice(buffer);
        Ok(())
    }

    fn resolve_symbol(&self, symbol: &str, module: Option<&str>) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        if let Some(module) = module {
            if !inner.modules.contains(module) {
                return Err(Error::symbol_not_found(symbol, Some(module)));
            }
            return inner
                .symbols
                .get(&(Some(module.to_string()), symbol.to_string()))
                .copied()
                .ok_or_else(|| Error::symbol_not_found(symbol, Some(module)));
        }
        inner
            .symbols
            .iter()
            .find(|((_, name), _)| name == symbol)
            .map(|(_, address)| *address)
            .ok_or_else(|| Error::symbol_not_found(symbol, None))
    }
}

impl Inner {
    fn find_region(&self, address: u64, length: usize) -> Result<&Region> {
        self.regions
            .iter()
            .find(|region| region.contains(address, length))
            .ok_or(Error::MemoryAccessFault { address, length })
    }

    fn find_region_mut(&mut self, address: u64, length: usize) -> Result<&mut Region> {
        self.regions
            .iter_mut()
            .find(|region| region.contains(address, length))
            .ok_or(Error::MemoryAccessFault { address, length })
    }
}
