//! Foreign-function boundary to the instrumentation library's heap-map routines.
//!
//! The routines are loaded into the controller with `dlopen` and run against *local*
//! copies of the target's heap map; they never see target addresses except inside the
//! header fields they treat as plain integers. The per-record callback follows the C
//! contract: return `0` to continue, non-zero to stop.

use std::ffi::CStr;
use std::panic::{catch_unwind, AssertUnwindSafe};

use libc::{c_char, c_int, c_void};
use log::debug;

use heaptrace_runtime::error::{Error, Result};

use crate::layout::{AllocationRecord, CapacityInfo, Chunk, HeapMapHeader};

/// Visitor invoked once per allocation record in address order; `false` stops early
pub type Visit<'a> = &'a mut dyn FnMut(&AllocationRecord) -> bool;

/// The four native operations the snapshot bridge invokes. All of them take a header
/// describing memory in the *controller's* address space; the iteration operations
/// additionally walk `[base, head)` through pointer arithmetic.
pub trait HeapMapRoutines {
    fn for_each(&self, map: &mut HeapMapHeader, visit: Visit<'_>) -> Result<()>;

    /// Restricts iteration to records whose chunk address falls inside the given bounds;
    /// chunk sizes play no part in the comparison
    fn for_each_in_range(
        &self,
        map: &mut HeapMapHeader,
        start: &Chunk,
        end: &Chunk,
        visit: Visit<'_>,
    ) -> Result<()>;

    fn capacity(&self, map: &mut HeapMapHeader) -> Result<CapacityInfo>;

    /// Resets `head` back to `base` inside the local header copy
    fn clear(&self, map: &mut HeapMapHeader) -> Result<()>;
}

type RawCallback = unsafe extern "C" fn(*mut AllocationRecord, *mut c_void) -> c_int;
type RawForEachFn = unsafe extern "C" fn(*mut HeapMapHeader, RawCallback, *mut c_void);
type RawForEachInRangeFn =
    unsafe extern "C" fn(*mut HeapMapHeader, *mut Chunk, *mut Chunk, RawCallback, *mut c_void);
type RawCapacityFn = unsafe extern "C" fn(*mut HeapMapHeader) -> CapacityInfo;
type RawClearFn = unsafe extern "C" fn(*mut HeapMapHeader);

/// The instrumentation library loaded into the controller process.
///
/// The same shared object is preloaded into the target; loading a second copy here only
/// serves to run its pure iteration routines over local snapshots.
pub struct MalloctraceLibrary {
    handle: *mut c_void,
    for_each_fn: RawForEachFn,
    for_each_in_range_fn: RawForEachInRangeFn,
    capacity_fn: RawCapacityFn,
    clear_fn: RawClearFn,
}

impl MalloctraceLibrary {
    /// Loads the shared object at `path` and resolves the heap-map entry points
    pub fn open(path: &str) -> Result<MalloctraceLibrary> {
        let c_path = std::ffi::CString::new(path)
            .map_err(|_| Error::NotLoaded(format!("invalid library path `{path}`")))?;
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if handle.is_null() {
            return Err(Error::NotLoaded(format!(
                "cannot load `{path}`: {}",
                last_dl_error()
            )));
        }
        debug!("loaded native heap-map routines from `{path}`");
        let library = unsafe {
            MalloctraceLibrary {
                handle,
                for_each_fn: std::mem::transmute::<*mut c_void, RawForEachFn>(resolve(
                    handle,
                    b"heap_map_for_each\0",
                )?),
                for_each_in_range_fn: std::mem::transmute::<*mut c_void, RawForEachInRangeFn>(
                    resolve(handle, b"heap_map_for_each_in_range\0")?,
                ),
                capacity_fn: std::mem::transmute::<*mut c_void, RawCapacityFn>(resolve(
                    handle,
                    b"heap_map_capacity\0",
                )?),
                clear_fn: std::mem::transmute::<*mut c_void, RawClearFn>(resolve(
                    handle,
                    b"heap_map_clear\0",
                )?),
            }
        };
        Ok(library)
    }
}

impl Drop for MalloctraceLibrary {
    fn drop(&mut self) {
        unsafe { libc::dlclose(self.handle) };
    }
}

fn resolve(handle: *mut c_void, name: &'static [u8]) -> Result<*mut c_void> {
    let pointer = unsafe { libc::dlsym(handle, name.as_ptr() as *const c_char) };
    if pointer.is_null() {
        let name = std::str::from_utf8(&name[..name.len() - 1]).unwrap_or("?");
        return Err(Error::symbol_not_found(name, None));
    }
    Ok(pointer)
}

fn last_dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        "unknown dlopen failure".to_string()
    } else {
        unsafe { CStr::from_ptr(message) }.to_string_lossy().into_owned()
    }
}

/// Visitor state threaded through the C callback as userdata. Panics must not unwind
/// across the C frame, so the trampoline parks the payload here and the caller rethrows
/// it once the native routine has returned.
struct VisitState<'a, 'b> {
    visit: &'a mut Visit<'b>,
    panic: Option<Box<dyn std::any::Any + Send>>,
}

impl VisitState<'_, '_> {
    /// Rethrows a panic a visitor raised mid-iteration
    fn rethrow(self) {
        if let Some(payload) = self.panic {
            std::panic::resume_unwind(payload);
        }
    }
}

/// Adapts the C callback to a Rust visitor. A panicking visitor stops the iteration and
/// leaves its payload in the state for the caller to rethrow.
unsafe extern "C" fn visit_trampoline(record: *mut AllocationRecord, data: *mut c_void) -> c_int {
    let state = &mut *(data as *mut VisitState<'_, '_>);
    match catch_unwind(AssertUnwindSafe(|| (state.visit)(&*record))) {
        Ok(true) => 0,
        Ok(false) => -1,
        Err(payload) => {
            state.panic = Some(payload);
            -1
        }
    }
}

impl HeapMapRoutines for MalloctraceLibrary {
    fn for_each(&self, map: &mut HeapMapHeader, visit: Visit<'_>) -> Result<()> {
        let mut visit = visit;
        let mut state = VisitState { visit: &mut visit, panic: None };
        let data = &mut state as *mut VisitState<'_, '_> as *mut c_void;
        unsafe { (self.for_each_fn)(map, visit_trampoline, data) };
        state.rethrow();
        Ok(())
    }

    fn for_each_in_range(
        &self,
        map: &mut HeapMapHeader,
        start: &Chunk,
        end: &Chunk,
        visit: Visit<'_>,
    ) -> Result<()> {
        let mut visit = visit;
        let mut state = VisitState { visit: &mut visit, panic: None };
        let data = &mut state as *mut VisitState<'_, '_> as *mut c_void;
        let mut start = *start;
        let mut end = *end;
        unsafe {
            (self.for_each_in_range_fn)(map, &mut start, &mut end, visit_trampoline, data)
        };
        state.rethrow();
        Ok(())
    }

    fn capacity(&self, map: &mut HeapMapHeader) -> Result<CapacityInfo> {
        Ok(unsafe { (self.capacity_fn)(map) })
    }

    fn clear(&self, map: &mut HeapMapHeader) -> Result<()> {
        unsafe { (self.clear_fn)(map) };
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> AllocationRecord {
        AllocationRecord {
            chunk: Chunk { address: 0x10, size: 1 },
            backtrace: [0; crate::layout::MAX_BACKTRACE_FRAMES],
        }
    }

    #[test]
    fn trampoline_maps_bool_to_c_contract() {
        let mut record = sample_record();
        let mut seen = 0usize;
        let mut continue_visit = |_: &AllocationRecord| {
            seen += 1;
            true
        };
        let mut visit: Visit<'_> = &mut continue_visit;
        let mut state = VisitState { visit: &mut visit, panic: None };
        let data = &mut state as *mut VisitState<'_, '_> as *mut c_void;
        assert_eq!(unsafe { visit_trampoline(&mut record, data) }, 0);
        assert!(state.panic.is_none());
        assert_eq!(seen, 1);

        let mut stop_visit = |_: &AllocationRecord| false;
        let mut visit: Visit<'_> = &mut stop_visit;
        let mut state = VisitState { visit: &mut visit, panic: None };
        let data = &mut state as *mut VisitState<'_, '_> as *mut c_void;
        assert_eq!(unsafe { visit_trampoline(&mut record, data) }, -1);
        assert!(state.panic.is_none());
    }

    #[test]
    fn trampoline_parks_visitor_panics_for_rethrow() {
        let mut record = sample_record();
        let mut panicking_visit = |_: &AllocationRecord| -> bool { panic!("visitor failed") };
        let mut visit: Visit<'_> = &mut panicking_visit;
        let mut state = VisitState { visit: &mut visit, panic: None };
        let data = &mut state as *mut VisitState<'_, '_> as *mut c_void;
        let previous_hook = std::panic::take_hook();
        std::panic::set_hook(Box::new(|_| {}));
        let code = unsafe { visit_trampoline(&mut record, data) };
        std::panic::set_hook(previous_hook);

        // The C side sees a plain stop; the payload survives for the caller to rethrow
        assert_eq!(code, -1);
        let payload = state.panic.take().expect("panic payload parked");
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"visitor failed"));
    }
}
