//! The snapshot bridge: copies the target-owned heap map into local memory, runs the
//! native iteration/mutation routines against the copy, and writes the safe subset of
//! results back.
//!
//! Every operation is stateless: it re-resolves the header symbol, re-reads the header
//! and (for iteration) re-copies the payload. Nothing is cached between calls and the
//! operations are not atomic with respect to the target's own allocations; the contract
//! is "last head observed at header-read time".

use std::sync::Arc;

use log::debug;
use strum::{Display, FromRepr};

use heaptrace_runtime::codec::{ScalarKind, Value};
use heaptrace_runtime::error::{Error, Result};
use heaptrace_runtime::memory_access::TargetMemory;
use heaptrace_runtime::symbol_binding::SymbolBoundVariable;
use heaptrace_runtime::variable_model::TypeDesc;

use crate::layout::{
    heap_map_header_type, AllocationRecord, CapacityInfo, Chunk, HeapMapHeader, ACTIVE_SYMBOL,
    ERR_CODE_SYMBOL, HEAP_MAP_SYMBOL, MALLOCTRACE_LIBRARY,
};
use crate::native::HeapMapRoutines;

/// Initialization state the instrumentation library reports about itself
#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, FromRepr)]
#[repr(i8)]
pub enum TraceErrCode {
    Uninitialized = -1,
    None = 0,
    MapSize = 1,
    MapAlloc = 2,
}

/// Controller-side view of the instrumentation's status flags
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TraceStatus {
    pub active: bool,
    pub err_code: i8,
}

impl TraceStatus {
    pub fn decoded_err(&self) -> Option<TraceErrCode> {
        TraceErrCode::from_repr(self.err_code)
    }
}

/// Bridge between the controller and the heap map living inside the target.
///
/// Holds explicit symbol-bound handles to the target's globals; each operation
/// re-resolves them, so the bridge survives target restarts without reconstruction.
pub struct HeapTraceBridge<M: TargetMemory, R: HeapMapRoutines> {
    memory: Arc<M>,
    routines: R,
    heap_map: SymbolBoundVariable<M>,
    active: SymbolBoundVariable<M>,
    err_code: SymbolBoundVariable<M>,
}

impl<M: TargetMemory, R: HeapMapRoutines> HeapTraceBridge<M, R> {
    pub fn new(memory: Arc<M>, routines: R) -> HeapTraceBridge<M, R> {
        let heap_map = SymbolBoundVariable::new(
            memory.clone(),
            HEAP_MAP_SYMBOL,
            Some(MALLOCTRACE_LIBRARY),
            &TypeDesc::pointer(heap_map_header_type()),
        );
        let active = SymbolBoundVariable::new(
            memory.clone(),
            ACTIVE_SYMBOL,
            Some(MALLOCTRACE_LIBRARY),
            &TypeDesc::Scalar(ScalarKind::UInt8),
        );
        let err_code = SymbolBoundVariable::new(
            memory.clone(),
            ERR_CODE_SYMBOL,
            Some(MALLOCTRACE_LIBRARY),
            &TypeDesc::Scalar(ScalarKind::Int8),
        );
        HeapTraceBridge { memory, routines, heap_map, active, err_code }
    }

    /// Fails fast with `NotLoaded` before any memory is touched
    fn ensure_loaded(&self) -> Result<()> {
        if !self.memory.is_attached() {
            return Err(Error::NotLoaded("no target process is running".to_string()));
        }
        if !self.memory.module_loaded(MALLOCTRACE_LIBRARY) {
            return Err(Error::NotLoaded(format!(
                "`{MALLOCTRACE_LIBRARY}` is not loaded in the target"
            )));
        }
        Ok(())
    }

    /// Resolves the header symbol, dereferences it and reads the live header
    fn read_header(&mut self) -> Result<HeapMapHeader> {
        let header_var = self.heap_map.dereference()?;
        HeapMapHeader::from_value(&header_var.get()?)
    }

    /// Bulk-copies the payload `[base, base + size)` into an 8-aligned local buffer.
    /// Records hold u64 fields the native walk dereferences, so byte buffers won't do.
    fn copy_payload(&self, header: &HeapMapHeader) -> Result<Vec<u64>> {
        let length = header.size as usize;
        let mut payload = vec![0u64; length.div_ceil(8)];
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(payload.as_mut_ptr() as *mut u8, length)
        };
        self.memory.read_chunk(header.base, bytes)?;
        Ok(payload)
    }

    /// Rebase: a local header whose `base`/`head` point into the copied buffer while
    /// preserving the head offset observed in the target. The native routines walk
    /// memory by pointer arithmetic from these two fields, so they must be valid local
    /// addresses.
    fn rebase(payload: &mut [u64], remote: &HeapMapHeader) -> Result<HeapMapHeader> {
        let head_offset = remote.used_bytes()?;
        let local_base = payload.as_mut_ptr() as u64;
        Ok(HeapMapHeader {
            base: local_base,
            size: remote.size,
            head: local_base + head_offset,
        })
    }

    /// Visits every allocation record in address order. The visitor returns `true` to
    /// continue; returning `false` stops after the current record.
    pub fn for_each<F>(&mut self, mut visit: F) -> Result<()>
    where
        F: FnMut(&AllocationRecord) -> bool,
    {
        self.ensure_loaded()?;
        let remote = self.read_header()?;
        let mut payload = self.copy_payload(&remote)?;
        let mut local = Self::rebase(&mut payload, &remote)?;
        debug!(
            "walking heap map snapshot: {} payload bytes, {} used",
            remote.size,
            remote.used_bytes()?
        );
        self.routines.for_each(&mut local, &mut visit)
    }

    /// Like `for_each`, restricted to records whose chunk address falls in
    /// `[start, end)`. The bounds refer to target addresses and are deliberately not
    /// adjusted for the copy.
    pub fn for_each_in_range<F>(&mut self, mut visit: F, start: u64, end: u64) -> Result<()>
    where
        F: FnMut(&AllocationRecord) -> bool,
    {
        self.ensure_loaded()?;
        let remote = self.read_header()?;
        let mut payload = self.copy_payload(&remote)?;
        let mut local = Self::rebase(&mut payload, &remote)?;
        let start_chunk = Chunk { address: start, size: 0 };
        let end_chunk = Chunk { address: end, size: 0 };
        // The native comparison includes the upper bound; mask it off here so the
        // half-open contract holds for every library version
        let mut masked = |record: &AllocationRecord| {
            if record.chunk.address < start || record.chunk.address >= end {
                return true;
            }
            visit(record)
        };
        self.routines
            .for_each_in_range(&mut local, &start_chunk, &end_chunk, &mut masked)
    }

    /// Free and total capacity of the map. Works on a header copy only; the capacity
    /// arithmetic never dereferences `base`/`head`, so no payload copy is needed.
    pub fn capacity(&mut self) -> Result<CapacityInfo> {
        self.ensure_loaded()?;
        let mut local = self.read_header()?;
        self.routines.capacity(&mut local)
    }

    /// Resets the map's high-water mark so the ledger reads as empty.
    ///
    /// Only the header fields are written back, in declaration order with `head` last
    /// since it alone determines validity. Payload bytes beyond the new head survive in
    /// the target until overwritten by new allocations; a known hazard of the native
    /// design, deliberately not papered over here.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_loaded()?;
        let mut local = self.read_header()?;
        // On the un-rebased copy the native reset assigns head = base using
        // target-relative values, which is exactly what the write-back needs
        self.routines.clear(&mut local)?;
        debug!("clearing heap map: head reset to {:#x}", local.head);
        let header_var = self.heap_map.dereference()?;
        header_var.set(&local.to_value())
    }

    /// Reads the instrumentation's activity flag and last error code
    pub fn status(&mut self) -> Result<TraceStatus> {
        self.ensure_loaded()?;
        let active = match self.active.get()? {
            Value::UInt8(raw) => raw != 0,
            other => {
                return Err(Error::InvalidLayout(format!(
                    "activity flag read as {}",
                    other.kind_name()
                )))
            }
        };
        let err_code = match self.err_code.get()? {
            Value::Int8(raw) => raw,
            other => {
                return Err(Error::InvalidLayout(format!(
                    "error-code flag read as {}",
                    other.kind_name()
                )))
            }
        };
        Ok(TraceStatus { active, err_code })
    }

    /// Turns allocation recording on or off inside the target
    pub fn set_active(&mut self, enabled: bool) -> Result<()> {
        self.ensure_loaded()?;
        debug!("setting trace active flag to {enabled}");
        self.active.set(&Value::UInt8(enabled as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::testing::LocalRoutines;
    use heaptrace_runtime::capture::CapturedMemory;

    const RECORD_SIZE: u64 = std::mem::size_of::<AllocationRecord>() as u64;
    const SYMBOL_REGION: u64 = 0x30_0000;
    const HEADER_ADDR: u64 = 0x40_0000;
    const PAYLOAD_BASE: u64 = 0x50_0000;

    fn record(address: u64) -> AllocationRecord {
        AllocationRecord {
            chunk: Chunk { address, size: 32 },
            backtrace: [0xb0, 0xb1, 0xb2, 0xb3],
        }
    }

    fn push_record(bytes: &mut Vec<u8>, record: &AllocationRecord) {
        bytes.extend_from_slice(&record.chunk.address.to_le_bytes());
        bytes.extend_from_slice(&record.chunk.size.to_le_bytes());
        for frame in record.backtrace {
            bytes.extend_from_slice(&frame.to_le_bytes());
        }
    }

    /// Lays out a full target image: symbol globals, header and payload
    fn target_with(records: &[AllocationRecord], map_size: u64) -> Arc<CapturedMemory> {
        let memory = CapturedMemory::new();
        memory.load_module(MALLOCTRACE_LIBRARY);

        // Globals: heap map pointer, active flag, err code
        let mut globals = Vec::new();
        globals.extend_from_slice(&HEADER_ADDR.to_le_bytes());
        globals.push(1); // active
        globals.push(0); // err code = none
        memory.map_region(SYMBOL_REGION, globals);
        memory.define_symbol(Some(MALLOCTRACE_LIBRARY), HEAP_MAP_SYMBOL, SYMBOL_REGION);
        memory.define_symbol(Some(MALLOCTRACE_LIBRARY), ACTIVE_SYMBOL, SYMBOL_REGION + 8);
        memory.define_symbol(Some(MALLOCTRACE_LIBRARY), ERR_CODE_SYMBOL, SYMBOL_REGION + 9);

        // Header
        let head = PAYLOAD_BASE + records.len() as u64 * RECORD_SIZE;
        let mut header = Vec::new();
        header.extend_from_slice(&PAYLOAD_BASE.to_le_bytes());
        header.extend_from_slice(&map_size.to_le_bytes());
        header.extend_from_slice(&head.to_le_bytes());
        memory.map_region(HEADER_ADDR, header);

        // Payload, zero-padded to the full map size
        let mut payload = Vec::new();
        for entry in records {
            push_record(&mut payload, entry);
        }
        payload.resize(map_size as usize, 0);
        memory.map_region(PAYLOAD_BASE, payload);

        Arc::new(memory)
    }

    fn bridge_over(
        memory: &Arc<CapturedMemory>,
    ) -> HeapTraceBridge<CapturedMemory, LocalRoutines> {
        HeapTraceBridge::new(memory.clone(), LocalRoutines)
    }

    #[test]
    fn capacity_of_empty_map_reports_free_equals_total() {
        // An empty map: header {base=0x1000, size=0x40, head=0x1000}
        let memory = CapturedMemory::new();
        memory.load_module(MALLOCTRACE_LIBRARY);
        let mut globals = Vec::new();
        globals.extend_from_slice(&HEADER_ADDR.to_le_bytes());
        memory.map_region(SYMBOL_REGION, globals);
        memory.define_symbol(Some(MALLOCTRACE_LIBRARY), HEAP_MAP_SYMBOL, SYMBOL_REGION);
        let mut header = Vec::new();
        header.extend_from_slice(&0x1000u64.to_le_bytes());
        header.extend_from_slice(&0x40u64.to_le_bytes());
        header.extend_from_slice(&0x1000u64.to_le_bytes());
        memory.map_region(HEADER_ADDR, header);

        let mut bridge = bridge_over(&Arc::new(memory));
        let capacity = bridge.capacity().unwrap();
        assert_eq!(capacity.free_bytes, 0x40);
        assert_eq!(capacity.total_bytes, 0x40);
        assert_eq!(capacity.free_entries, 0x40 / RECORD_SIZE);
        assert_eq!(capacity.total_entries, 0x40 / RECORD_SIZE);
    }

    #[test]
    fn capacity_is_idempotent() {
        let memory = target_with(&[record(0x1000), record(0x2000)], 0x400);
        let mut bridge = bridge_over(&memory);
        let first = bridge.capacity().unwrap();
        let second = bridge.capacity().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.free_bytes, 0x400 - 2 * RECORD_SIZE);
    }

    #[test]
    fn for_each_visits_every_record_in_address_order() {
        let records = [record(0x1000), record(0x2000), record(0x3000)];
        let memory = target_with(&records, 0x400);
        let mut bridge = bridge_over(&memory);

        let mut seen = Vec::new();
        bridge
            .for_each(|entry| {
                seen.push(entry.chunk.address);
                assert_eq!(entry.backtrace, [0xb0, 0xb1, 0xb2, 0xb3]);
                true
            })
            .unwrap();
        assert_eq!(seen, vec![0x1000, 0x2000, 0x3000]);
    }

    #[test]
    fn for_each_over_empty_map_never_calls_back() {
        let memory = target_with(&[], 0x400);
        let mut bridge = bridge_over(&memory);
        let mut calls = 0;
        bridge
            .for_each(|_| {
                calls += 1;
                true
            })
            .unwrap();
        assert_eq!(calls, 0);
    }

    #[test]
    fn for_each_stops_after_the_stopping_record() {
        let records = [record(0x1000), record(0x2000), record(0x3000)];
        let memory = target_with(&records, 0x400);
        let mut bridge = bridge_over(&memory);
        let mut seen = Vec::new();
        bridge
            .for_each(|entry| {
                seen.push(entry.chunk.address);
                entry.chunk.address < 0x2000
            })
            .unwrap();
        assert_eq!(seen, vec![0x1000, 0x2000]);
    }

    #[test]
    fn range_walk_is_half_open() {
        let records = [record(0x1000), record(0x2000), record(0x3000)];
        let memory = target_with(&records, 0x400);
        let mut bridge = bridge_over(&memory);
        let mut seen = Vec::new();
        bridge
            .for_each_in_range(
                |entry| {
                    seen.push(entry.chunk.address);
                    true
                },
                0x1000,
                0x3000,
            )
            .unwrap();
        // 0x3000 sits exactly on the upper bound and must not be yielded
        assert_eq!(seen, vec![0x1000, 0x2000]);
    }

    #[test]
    fn clear_writes_back_only_the_header() {
        let records = [record(0x1000), record(0x2000)];
        let memory = target_with(&records, 0x400);
        let payload_before = memory.dump(PAYLOAD_BASE, 0x400).unwrap();
        let mut bridge = bridge_over(&memory);
        bridge.clear().unwrap();

        let header_bytes = memory.dump(HEADER_ADDR, 24).unwrap();
        let base = u64::from_le_bytes(header_bytes[0..8].try_into().unwrap());
        let size = u64::from_le_bytes(header_bytes[8..16].try_into().unwrap());
        let head = u64::from_le_bytes(header_bytes[16..24].try_into().unwrap());
        assert_eq!(base, PAYLOAD_BASE);
        assert_eq!(size, 0x400);
        assert_eq!(head, PAYLOAD_BASE);

        // Payload bytes are never written back; stale records survive past the new head
        assert_eq!(memory.dump(PAYLOAD_BASE, 0x400).unwrap(), payload_before);

        let capacity = bridge.capacity().unwrap();
        assert_eq!(capacity.free_bytes, capacity.total_bytes);

        let mut calls = 0;
        bridge
            .for_each(|_| {
                calls += 1;
                true
            })
            .unwrap();
        assert_eq!(calls, 0);
    }

    #[test]
    fn operations_fail_fast_when_not_loaded() {
        let memory = target_with(&[record(0x1000)], 0x400);
        let mut bridge = bridge_over(&memory);

        memory.set_attached(false);
        assert!(matches!(bridge.capacity(), Err(Error::NotLoaded(_))));
        assert!(matches!(bridge.clear(), Err(Error::NotLoaded(_))));
        assert!(matches!(bridge.for_each(|_| true), Err(Error::NotLoaded(_))));

        memory.set_attached(true);
        memory.unload_module(MALLOCTRACE_LIBRARY);
        assert!(matches!(bridge.status(), Err(Error::NotLoaded(_))));
        assert!(matches!(
            bridge.for_each_in_range(|_| true, 0, u64::MAX),
            Err(Error::NotLoaded(_))
        ));
    }

    #[test]
    fn faulting_payload_copy_propagates_unchanged() {
        // Header advertises a payload the target does not actually have mapped; the
        // bulk copy's fault must reach the caller as-is
        let memory = CapturedMemory::new();
        memory.load_module(MALLOCTRACE_LIBRARY);
        memory.map_region(SYMBOL_REGION, HEADER_ADDR.to_le_bytes().to_vec());
        memory.define_symbol(Some(MALLOCTRACE_LIBRARY), HEAP_MAP_SYMBOL, SYMBOL_REGION);
        let mut header = Vec::new();
        header.extend_from_slice(&0x9000_0000u64.to_le_bytes());
        header.extend_from_slice(&0x400u64.to_le_bytes());
        header.extend_from_slice(&0x9000_0000u64.to_le_bytes());
        memory.map_region(HEADER_ADDR, header);

        let mut bridge = bridge_over(&Arc::new(memory));
        assert!(matches!(
            bridge.for_each(|_| true),
            Err(Error::MemoryAccessFault { address: 0x9000_0000, length: 0x400 })
        ));
        assert!(matches!(
            bridge.for_each_in_range(|_| true, 0, u64::MAX),
            Err(Error::MemoryAccessFault { .. })
        ));
    }

    #[test]
    fn missing_header_symbol_is_symbol_not_found() {
        let memory = target_with(&[], 0x400);
        memory.undefine_symbol(Some(MALLOCTRACE_LIBRARY), HEAP_MAP_SYMBOL);
        let mut bridge = bridge_over(&memory);
        assert!(matches!(bridge.capacity(), Err(Error::SymbolNotFound { .. })));
    }

    #[test]
    fn status_and_activity_flag() {
        let memory = target_with(&[], 0x400);
        let mut bridge = bridge_over(&memory);
        let status = bridge.status().unwrap();
        assert!(status.active);
        assert_eq!(status.decoded_err(), Some(TraceErrCode::None));

        bridge.set_active(false).unwrap();
        let status = bridge.status().unwrap();
        assert!(!status.active);

        // An unknown raw code decodes to nothing but is still reported
        memory.write_chunk(SYMBOL_REGION + 9, &[0x7f]).unwrap();
        let status = bridge.status().unwrap();
        assert_eq!(status.err_code, 0x7f);
        assert_eq!(status.decoded_err(), None);
    }

    #[test]
    fn records_are_read_through_the_variable_model_too() {
        // Cross-check the typed record description against the packed layout
        let records = [record(0x1000)];
        let memory = target_with(&records, 0x400);
        let var = heaptrace_runtime::variable_model::RemoteVariable::with_address(
            memory.clone(),
            &crate::layout::allocation_record_type(),
            PAYLOAD_BASE,
        )
        .unwrap();
        assert_eq!(var.size().unwrap(), RECORD_SIZE);
        let value = var.get().unwrap();
        assert_eq!(
            value.field("chunk").and_then(|chunk| chunk.field("address")).and_then(Value::as_u64),
            Some(0x1000)
        );
        let backtrace = value.field("backtrace").unwrap();
        assert_eq!(
            *backtrace,
            Value::Array(vec![
                Value::Address(0xb0),
                Value::Address(0xb1),
                Value::Address(0xb2),
                Value::Address(0xb3),
            ])
        );
    }
}
