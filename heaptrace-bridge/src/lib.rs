pub mod layout;
pub mod native;
pub mod bridge;

pub use bridge::{HeapTraceBridge, TraceErrCode, TraceStatus};
pub use heaptrace_runtime::{Error, Result};
pub use layout::{AllocationRecord, CapacityInfo, Chunk, HeapMapHeader, MAX_BACKTRACE_FRAMES};
pub use native::{HeapMapRoutines, MalloctraceLibrary};
