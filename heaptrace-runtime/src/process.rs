//! Live target backend: reads and writes another process's memory through
//! `process_vm_readv`/`process_vm_writev` and resolves symbol names against the ELF
//! symbol tables of the modules currently mapped into the target.

use std::fs;
use std::path::Path;

use log::{debug, warn};
use process_memory::{CopyAddress, Pid, ProcessHandle, PutAddress, TryIntoProcessHandle};

use crate::error::{Error, Result};
use crate::memory_access::TargetMemory;

/// A running target process identified by pid.
///
/// Symbol resolution re-reads `/proc/<pid>/maps` on every lookup so module load
/// addresses are never trusted across a target restart.
pub struct LiveProcess {
    pid: Pid,
    handle: ProcessHandle,
}

struct MappedModule {
    path: String,
    base: u64,
}

impl LiveProcess {
    /// Attaches to the process with the given pid
    pub fn attach(pid: u32) -> Result<LiveProcess> {
        let handle = (pid as Pid)
            .try_into_process_handle()
            .map_err(|err| Error::NotLoaded(format!("cannot attach to pid {pid}: {err}")))?;
        debug!("attached to target pid {pid}");
        Ok(LiveProcess { pid: pid as Pid, handle })
    }

    pub fn pid(&self) -> u32 {
        self.pid as u32
    }

    /// Parses `/proc/<pid>/maps` into one entry per file-backed module, keeping the
    /// lowest mapped address of each file as its load base
    fn mapped_modules(&self) -> Result<Vec<MappedModule>> {
        let maps = fs::read_to_string(format!("/proc/{}/maps", self.pid))
            .map_err(|err| Error::NotLoaded(format!("no target process: {err}")))?;
        let mut modules: Vec<MappedModule> = Vec::new();
        for line in maps.lines() {
            let mut columns = line.split_whitespace();
            let range = columns.next().unwrap_or("");
            let path = match columns.nth(4) {
                Some(path) if path.starts_with('/') => path,
                _ => continue,
            };
            let Some(start) = range
                .split('-')
                .next()
                .and_then(|start| u64::from_str_radix(start, 16).ok())
            else {
                continue;
            };
            match modules.iter_mut().find(|module| module.path == path) {
                Some(module) => module.base = module.base.min(start),
                None => modules.push(MappedModule { path: path.to_string(), base: start }),
            }
        }
        Ok(modules)
    }

    /// Looks the symbol up in one module's ELF symbol tables, adjusting for the load
    /// base when the object is position independent
    fn lookup_in_module(&self, module: &MappedModule, symbol: &str) -> Option<u64> {
        let bytes = match fs::read(&module.path) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!("cannot read `{}`: {err}", module.path);
                return None;
            }
        };
        let elf = match goblin::elf::Elf::parse(&bytes) {
            Ok(elf) => elf,
            Err(err) => {
                warn!("`{}` is not a parsable ELF: {err}", module.path);
                return None;
            }
        };
        let tables = [(&elf.dynsyms, &elf.dynstrtab), (&elf.syms, &elf.strtab)];
        for (symtab, strtab) in tables {
            for sym in symtab.iter() {
                if sym.st_value == 0 {
                    continue;
                }
                if strtab.get_at(sym.st_name) != Some(symbol) {
                    continue;
                }
                let address = if elf.header.e_type == goblin::elf::header::ET_DYN {
                    module.base + sym.st_value
                } else {
                    sym.st_value
                };
                debug!("resolved `{symbol}` in `{}` to {address:#x}", module.path);
                return Some(address);
            }
        }
        None
    }
}

fn module_matches(path: &str, module: &str) -> bool {
    Path::new(path)
        .file_name()
        .map(|name| name == module)
        .unwrap_or(false)
        || path == module
}

impl TargetMemory for LiveProcess {
    fn is_attached(&self) -> bool {
        // Signal 0 probes for existence without delivering anything
        unsafe { libc::kill(self.pid, 0) == 0 }
    }

    fn module_loaded(&self, module: &str) -> bool {
        self.mapped_modules()
            .map(|modules| modules.iter().any(|mapped| module_matches(&mapped.path, module)))
            .unwrap_or(false)
    }

    fn read_chunk(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        self.handle.copy_address(address as usize, buffer).map_err(|err| {
            debug!("read of {} bytes at {address:#x} failed: {err}", buffer.len());
            Error::MemoryAccessFault { address, length: buffer.len() }
        })
    }

    fn write_chunk(&self, address: u64, buffer: &[u8]) -> Result<()> {
        self.handle.put_address(address as usize, buffer).map_err(|err| {
            debug!("write of {} bytes at {address:#x} failed: {err}", buffer.len());
            Error::MemoryAccessFault { address, length: buffer.len() }
        })
    }

    fn resolve_symbol(&self, symbol: &str, module: Option<&str>) -> Result<u64> {
        let modules = self.mapped_modules()?;
        let scoped: Vec<&MappedModule> = match module {
            Some(module) => modules
                .iter()
                .filter(|mapped| module_matches(&mapped.path, module))
                .collect(),
            None => modules.iter().collect(),
        };
        scoped
            .iter()
            .find_map(|mapped| self.lookup_in_module(mapped, symbol))
            .ok_or_else(|| Error::symbol_not_found(symbol, module))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_name_matching() {
        assert!(module_matches("/usr/lib/libmalloctrace.so", "libmalloctrace.so"));
        assert!(module_matches("/usr/lib/libmalloctrace.so", "/usr/lib/libmalloctrace.so"));
        assert!(!module_matches("/usr/lib/libc.so.6", "libmalloctrace.so"));
    }
}
