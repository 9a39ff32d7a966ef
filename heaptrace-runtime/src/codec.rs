use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// Closed set of scalar shapes a remote variable can carry. All scalars are
/// little-endian regardless of the controller's own byte order.
///
/// `Opaque` is the shape of composite containers (structs, arrays) whose bytes are never
/// converted directly; invoking the codec on it is always an error rather than a silent
/// zero-width read.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ScalarKind {
    UInt8,
    Int8,
    UInt64,
    Int64,
    /// Pointer-width unsigned value holding a target address
    Address,
    Opaque,
}

impl ScalarKind {
    /// Encoded width in bytes
    pub fn width(self) -> usize {
        match self {
            ScalarKind::UInt8 | ScalarKind::Int8 => 1,
            ScalarKind::UInt64 | ScalarKind::Int64 | ScalarKind::Address => 8,
            ScalarKind::Opaque => 0,
        }
    }

    /// Encodes `value` into exactly `width()` little-endian bytes
    pub fn encode(self, value: &Value) -> Result<Vec<u8>> {
        match (self, value) {
            (ScalarKind::UInt8, Value::UInt8(v)) => Ok(v.to_le_bytes().to_vec()),
            (ScalarKind::Int8, Value::Int8(v)) => Ok(v.to_le_bytes().to_vec()),
            (ScalarKind::UInt64, Value::UInt64(v)) => Ok(v.to_le_bytes().to_vec()),
            (ScalarKind::Int64, Value::Int64(v)) => Ok(v.to_le_bytes().to_vec()),
            (ScalarKind::Address, Value::Address(v)) => Ok(v.to_le_bytes().to_vec()),
            (ScalarKind::Opaque, _) => Err(Error::InvalidLayout(
                "opaque values cannot be encoded".to_string(),
            )),
            (kind, value) => Err(Error::InvalidLayout(format!(
                "cannot encode {} as {kind:?}",
                value.kind_name()
            ))),
        }
    }

    /// Decodes exactly `width()` little-endian bytes into a value of this kind
    pub fn decode(self, bytes: &[u8]) -> Result<Value> {
        if self == ScalarKind::Opaque {
            return Err(Error::InvalidLayout(
                "opaque values cannot be decoded".to_string(),
            ));
        }
        if bytes.len() != self.width() {
            return Err(Error::InvalidLayout(format!(
                "{self:?} expects {} bytes, got {}",
                self.width(),
                bytes.len()
            )));
        }
        match self {
            ScalarKind::UInt8 => Ok(Value::UInt8(bytes[0])),
            ScalarKind::Int8 => Ok(Value::Int8(bytes[0] as i8)),
            ScalarKind::UInt64 => Ok(Value::UInt64(u64::from_le_bytes(fixed_8(bytes)))),
            ScalarKind::Int64 => Ok(Value::Int64(i64::from_le_bytes(fixed_8(bytes)))),
            ScalarKind::Address => Ok(Value::Address(u64::from_le_bytes(fixed_8(bytes)))),
            ScalarKind::Opaque => unreachable!(),
        }
    }
}

fn fixed_8(bytes: &[u8]) -> [u8; 8] {
    let mut buffer = [0u8; 8];
    buffer.copy_from_slice(bytes);
    buffer
}

/// A language-native view of remote data: scalars for leaf variables, a name→value
/// mapping for structs and an ordered sequence for arrays.
///
/// A `Struct` value passed to a variable `set` may name only a subset of the declared
/// fields; unnamed fields are left untouched in the target.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    UInt8(u8),
    Int8(i8),
    UInt64(u64),
    Int64(i64),
    Address(u64),
    Struct(BTreeMap<String, Value>),
    Array(Vec<Value>),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::UInt8(_) => "u8",
            Value::Int8(_) => "i8",
            Value::UInt64(_) => "u64",
            Value::Int64(_) => "i64",
            Value::Address(_) => "address",
            Value::Struct(_) => "struct",
            Value::Array(_) => "array",
        }
    }

    /// Widens any unsigned scalar (including addresses) to u64
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt8(v) => Some(*v as u64),
            Value::UInt64(v) => Some(*v),
            Value::Address(v) => Some(*v),
            _ => None,
        }
    }

    /// Sign-extends any signed scalar to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int8(v) => Some(*v as i64),
            Value::Int64(v) => Some(*v),
            _ => None,
        }
    }

    /// Looks up a struct field by name
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Struct(fields) => fields.get(name),
            _ => None,
        }
    }

    /// Builds a struct value from name/value pairs
    pub fn struct_of<const N: usize>(fields: [(&str, Value); N]) -> Value {
        Value::Struct(
            fields
                .into_iter()
                .map(|(name, value)| (name.to_string(), value))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trips() {
        let cases = [
            (ScalarKind::UInt8, Value::UInt8(0)),
            (ScalarKind::UInt8, Value::UInt8(0xff)),
            (ScalarKind::Int8, Value::Int8(-1)),
            (ScalarKind::Int8, Value::Int8(i8::MIN)),
            (ScalarKind::UInt64, Value::UInt64(u64::MAX)),
            (ScalarKind::Int64, Value::Int64(i64::MIN)),
            (ScalarKind::Int64, Value::Int64(-42)),
            (ScalarKind::Address, Value::Address(0xdead_beef_0000)),
        ];
        for (kind, value) in cases {
            let bytes = kind.encode(&value).unwrap();
            assert_eq!(bytes.len(), kind.width());
            assert_eq!(kind.decode(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn encoding_is_little_endian() {
        let bytes = ScalarKind::UInt64.encode(&Value::UInt64(0x0102_0304)).unwrap();
        assert_eq!(bytes, vec![0x04, 0x03, 0x02, 0x01, 0, 0, 0, 0]);
    }

    #[test]
    fn opaque_refuses_both_directions() {
        assert!(matches!(
            ScalarKind::Opaque.encode(&Value::UInt8(0)),
            Err(Error::InvalidLayout(_))
        ));
        assert!(matches!(
            ScalarKind::Opaque.decode(&[]),
            Err(Error::InvalidLayout(_))
        ));
    }

    #[test]
    fn mismatched_value_kind_is_rejected() {
        assert!(matches!(
            ScalarKind::UInt8.encode(&Value::UInt64(1)),
            Err(Error::InvalidLayout(_))
        ));
        assert!(matches!(
            ScalarKind::Address.encode(&Value::UInt64(1)),
            Err(Error::InvalidLayout(_))
        ));
    }

    #[test]
    fn truncated_input_is_rejected() {
        assert!(matches!(
            ScalarKind::UInt64.decode(&[0u8; 4]),
            Err(Error::InvalidLayout(_))
        ));
    }
}
