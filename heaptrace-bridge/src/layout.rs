//! Binary layout of the structures the instrumentation library keeps inside the target,
//! assumed stable across library versions: all fields packed, little-endian, 8-byte
//! pointers.

use std::collections::BTreeMap;
use std::mem::size_of;

use heaptrace_runtime::codec::{ScalarKind, Value};
use heaptrace_runtime::error::{Error, Result};
use heaptrace_runtime::variable_model::{FieldDesc, StructType, TypeDesc};

/// Number of program-counter values captured per allocation
pub const MAX_BACKTRACE_FRAMES: usize = 4;

/// Module the instrumentation lives in, injected into the target via LD_PRELOAD
pub const MALLOCTRACE_LIBRARY: &str = "libmalloctrace.so";

/// Target-side global holding the pointer to the heap map header
pub const HEAP_MAP_SYMBOL: &str = "MALLOCTRACE_HEAP_MAP";
/// Target-side u8 flag gating whether allocations are recorded
pub const ACTIVE_SYMBOL: &str = "MALLOCTRACE_ACTIVE";
/// Target-side i8 holding the library's last initialization error
pub const ERR_CODE_SYMBOL: &str = "MALLOCTRACE_ERR_CODE";

/// One allocated chunk: its address and requested size
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub address: u64,
    pub size: u64,
}

/// One ledger entry: the chunk plus the backtrace captured at allocation time
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AllocationRecord {
    pub chunk: Chunk,
    pub backtrace: [u64; MAX_BACKTRACE_FRAMES],
}

/// The heap map header: entries occupy `[base, head)` contiguously and `head` marks the
/// first unused byte. `base <= head <= base + size` is enforced by the library and
/// trusted here.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapMapHeader {
    pub base: u64,
    pub size: u64,
    pub head: u64,
}

/// Returned by value from the native capacity routine
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CapacityInfo {
    pub free_bytes: u64,
    pub free_entries: u64,
    pub total_bytes: u64,
    pub total_entries: u64,
}

const _: () = assert!(size_of::<Chunk>() == 16);
const _: () = assert!(size_of::<AllocationRecord>() == 16 + 8 * MAX_BACKTRACE_FRAMES);
const _: () = assert!(size_of::<HeapMapHeader>() == 24);
const _: () = assert!(size_of::<CapacityInfo>() == 32);

/// Type description of the heap map header for the variable model
pub fn heap_map_header_type() -> TypeDesc {
    let fields = vec![
        FieldDesc::new("base", TypeDesc::pointer(TypeDesc::Scalar(ScalarKind::Opaque))),
        FieldDesc::new("size", TypeDesc::Scalar(ScalarKind::UInt64)),
        FieldDesc::new("head", TypeDesc::pointer(TypeDesc::Scalar(ScalarKind::Opaque))),
    ];
    // Field names are statically unique
    TypeDesc::Struct(StructType::new(fields).expect("header layout is well formed"))
}

/// Type description of one chunk
pub fn chunk_type() -> TypeDesc {
    let fields = vec![
        FieldDesc::new("address", TypeDesc::pointer(TypeDesc::Scalar(ScalarKind::Opaque))),
        FieldDesc::new("size", TypeDesc::Scalar(ScalarKind::UInt64)),
    ];
    TypeDesc::Struct(StructType::new(fields).expect("chunk layout is well formed"))
}

/// Type description of one allocation record
pub fn allocation_record_type() -> TypeDesc {
    let fields = vec![
        FieldDesc::new("chunk", chunk_type()),
        FieldDesc::new(
            "backtrace",
            TypeDesc::array(
                TypeDesc::pointer(TypeDesc::Scalar(ScalarKind::Opaque)),
                MAX_BACKTRACE_FRAMES,
            ),
        ),
    ];
    TypeDesc::Struct(StructType::new(fields).expect("record layout is well formed"))
}

impl HeapMapHeader {
    /// Extracts a typed header from a struct value read through the variable model
    pub fn from_value(value: &Value) -> Result<HeapMapHeader> {
        let field = |name: &str| -> Result<u64> {
            value
                .field(name)
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::InvalidLayout(format!("heap map header missing `{name}`")))
        };
        Ok(HeapMapHeader {
            base: field("base")?,
            size: field("size")?,
            head: field("head")?,
        })
    }

    /// Renders the header as a struct value naming all three fields, `head` last
    pub fn to_value(&self) -> Value {
        let mut fields = BTreeMap::new();
        fields.insert("base".to_string(), Value::Address(self.base));
        fields.insert("size".to_string(), Value::UInt64(self.size));
        fields.insert("head".to_string(), Value::Address(self.head));
        Value::Struct(fields)
    }

    /// Distance from `base` to `head`, the part of the payload holding live entries
    pub fn used_bytes(&self) -> Result<u64> {
        self.head.checked_sub(self.base).ok_or_else(|| {
            Error::InvalidLayout(format!(
                "heap map head {:#x} lies below base {:#x}",
                self.head, self.base
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_value_round_trip() {
        let header = HeapMapHeader { base: 0x1000, size: 0x40, head: 0x1030 };
        let value = header.to_value();
        assert_eq!(HeapMapHeader::from_value(&value).unwrap(), header);
        assert_eq!(header.used_bytes().unwrap(), 0x30);
    }

    #[test]
    fn header_below_base_is_rejected() {
        let header = HeapMapHeader { base: 0x1000, size: 0x40, head: 0xfff };
        assert!(header.used_bytes().is_err());
    }

    #[test]
    fn missing_field_is_invalid() {
        let value = Value::struct_of([("base", Value::Address(0x1000))]);
        assert!(HeapMapHeader::from_value(&value).is_err());
    }
}
