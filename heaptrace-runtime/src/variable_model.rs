use std::collections::BTreeSet;
use std::sync::Arc;

use crate::codec::{ScalarKind, Value};
use crate::error::{Error, Result};
use crate::memory_access::TargetMemory;

/// Description of a remote type: what a variable of this shape looks like in target
/// memory. Descriptions carry no address and no target handle; they are blueprints that
/// `RemoteVariable::new` instantiates, deep-copying so that no two variables ever share
/// live layout state.
#[derive(Debug, Clone)]
pub enum TypeDesc {
    Scalar(ScalarKind),
    Pointer(PointerType),
    Struct(StructType),
    Array(ArrayType),
}

impl TypeDesc {
    /// A pointer to a value of the given type
    pub fn pointer(pointee: TypeDesc) -> TypeDesc {
        TypeDesc::Pointer(PointerType { pointee: Box::new(pointee) })
    }

    /// A fixed-length sequence of identically-typed elements
    pub fn array(element: TypeDesc, length: usize) -> TypeDesc {
        TypeDesc::Array(ArrayType { element: Box::new(element), length })
    }
}

#[derive(Debug, Clone)]
pub struct PointerType {
    pub pointee: Box<TypeDesc>,
}

#[derive(Debug, Clone)]
pub struct ArrayType {
    pub element: Box<TypeDesc>,
    pub length: usize,
}

/// An ordered sequence of named fields. Fields without an explicit offset pack directly
/// after the previous field; the layout is taken as the native structure's author wrote
/// it, with no alignment inference.
#[derive(Debug, Clone)]
pub struct StructType {
    fields: Vec<FieldDesc>,
}

impl StructType {
    /// Validates field-name uniqueness up front
    pub fn new(fields: Vec<FieldDesc>) -> Result<StructType> {
        let mut seen: BTreeSet<&str> = BTreeSet::new();
        for field in &fields {
            if !seen.insert(field.name.as_str()) {
                return Err(Error::InvalidLayout(format!(
                    "duplicate struct field `{}`",
                    field.name
                )));
            }
        }
        Ok(StructType { fields })
    }

    pub fn fields(&self) -> &[FieldDesc] {
        &self.fields
    }
}

#[derive(Debug, Clone)]
pub struct FieldDesc {
    pub name: String,
    pub ty: TypeDesc,
    pub offset: Option<u64>,
}

impl FieldDesc {
    pub fn new(name: &str, ty: TypeDesc) -> FieldDesc {
        FieldDesc { name: name.to_string(), ty, offset: None }
    }

    pub fn at_offset(name: &str, ty: TypeDesc, offset: u64) -> FieldDesc {
        FieldDesc { name: name.to_string(), ty, offset: Some(offset) }
    }
}

/// Instantiated variable tree. Each node owns its address slot; composite nodes own one
/// child node per field/element so sibling variables never alias.
#[derive(Debug)]
enum VarNode {
    Scalar {
        kind: ScalarKind,
        address: Option<u64>,
    },
    Pointer {
        pointee: Box<VarNode>,
        address: Option<u64>,
    },
    Struct {
        fields: Vec<FieldSlot>,
        address: Option<u64>,
        total_size: Option<u64>,
    },
    Array {
        elements: Vec<VarNode>,
        address: Option<u64>,
    },
}

#[derive(Debug)]
struct FieldSlot {
    name: String,
    offset: Option<u64>,
    node: VarNode,
}

impl VarNode {
    fn from_desc(desc: &TypeDesc) -> VarNode {
        match desc {
            TypeDesc::Scalar(kind) => VarNode::Scalar { kind: *kind, address: None },
            TypeDesc::Pointer(pointer) => VarNode::Pointer {
                pointee: Box::new(VarNode::from_desc(&pointer.pointee)),
                address: None,
            },
            TypeDesc::Struct(layout) => VarNode::Struct {
                fields: layout
                    .fields()
                    .iter()
                    .map(|field| FieldSlot {
                        name: field.name.clone(),
                        offset: field.offset,
                        node: VarNode::from_desc(&field.ty),
                    })
                    .collect(),
                address: None,
                total_size: None,
            },
            TypeDesc::Array(array) => VarNode::Array {
                elements: (0..array.length)
                    .map(|_| VarNode::from_desc(&array.element))
                    .collect(),
                address: None,
            },
        }
    }

    fn address(&self) -> Result<u64> {
        let address = match self {
            VarNode::Scalar { address, .. }
            | VarNode::Pointer { address, .. }
            | VarNode::Struct { address, .. }
            | VarNode::Array { address, .. } => *address,
        };
        address.ok_or(Error::UnresolvedAddress)
    }

    /// Assigns this node's address and recomputes every child's. A field with an explicit
    /// offset lands at `base + offset`; otherwise it packs after the previous field.
    fn assign_address(&mut self, new_address: u64) -> Result<()> {
        match self {
            VarNode::Scalar { address, .. } | VarNode::Pointer { address, .. } => {
                *address = Some(new_address);
            }
            VarNode::Struct { fields, address, total_size } => {
                *address = Some(new_address);
                let mut next_address = new_address;
                for field in fields.iter_mut() {
                    let field_address = match field.offset {
                        Some(offset) => new_address + offset,
                        None => next_address,
                    };
                    field.node.assign_address(field_address)?;
                    next_address = field_address + field.node.size()?;
                }
                *total_size = Some(next_address - new_address);
            }
            VarNode::Array { elements, address } => {
                *address = Some(new_address);
                let mut element_address = new_address;
                for element in elements.iter_mut() {
                    element.assign_address(element_address)?;
                    element_address += element.size()?;
                }
            }
        }
        Ok(())
    }

    fn size(&self) -> Result<u64> {
        match self {
            VarNode::Scalar { kind, .. } => Ok(kind.width() as u64),
            VarNode::Pointer { .. } => Ok(ScalarKind::Address.width() as u64),
            // Struct size is the distance from the struct's own address to the end of its
            // last field, which is only known once addresses are assigned
            VarNode::Struct { total_size, .. } => total_size.ok_or(Error::UnresolvedAddress),
            VarNode::Array { elements, .. } => match elements.first() {
                Some(element) => Ok(element.size()? * elements.len() as u64),
                None => Ok(0),
            },
        }
    }

    fn get<M: TargetMemory + ?Sized>(&self, memory: &M) -> Result<Value> {
        match self {
            VarNode::Scalar { kind, .. } => memory.read_scalar(*kind, self.address()?),
            VarNode::Pointer { .. } => memory.read_scalar(ScalarKind::Address, self.address()?),
            VarNode::Struct { fields, .. } => {
                self.address()?;
                let mut value = std::collections::BTreeMap::new();
                for field in fields {
                    value.insert(field.name.clone(), field.node.get(memory)?);
                }
                Ok(Value::Struct(value))
            }
            VarNode::Array { elements, .. } => {
                self.address()?;
                let mut value = Vec::with_capacity(elements.len());
                for element in elements {
                    value.push(element.get(memory)?);
                }
                Ok(Value::Array(value))
            }
        }
    }

    fn set<M: TargetMemory + ?Sized>(&self, memory: &M, value: &Value) -> Result<()> {
        match self {
            VarNode::Scalar { kind, .. } => memory.write_scalar(*kind, self.address()?, value),
            VarNode::Pointer { .. } => {
                memory.write_scalar(ScalarKind::Address, self.address()?, value)
            }
            VarNode::Struct { fields, .. } => {
                self.address()?;
                let Value::Struct(named) = value else {
                    return Err(Error::InvalidLayout(format!(
                        "expected a struct value, got {}",
                        value.kind_name()
                    )));
                };
                for name in named.keys() {
                    if !fields.iter().any(|field| &field.name == name) {
                        return Err(Error::InvalidLayout(format!("unknown struct field `{name}`")));
                    }
                }
                // Only the named fields are written, in declaration order; the rest of the
                // struct's bytes stay untouched in the target
                for field in fields {
                    if let Some(field_value) = named.get(&field.name) {
                        field.node.set(memory, field_value)?;
                    }
                }
                Ok(())
            }
            VarNode::Array { elements, .. } => {
                self.address()?;
                let Value::Array(items) = value else {
                    return Err(Error::InvalidLayout(format!(
                        "expected an array value, got {}",
                        value.kind_name()
                    )));
                };
                if items.len() != elements.len() {
                    return Err(Error::InvalidLayout(format!(
                        "array length mismatch: variable has {} elements, value has {}",
                        elements.len(),
                        items.len()
                    )));
                }
                for (element, item) in elements.iter().zip(items) {
                    element.set(memory, item)?;
                }
                Ok(())
            }
        }
    }

    fn field_node(&self, name: &str) -> Result<&VarNode> {
        let VarNode::Struct { fields, .. } = self else {
            return Err(Error::InvalidLayout("not a struct variable".to_string()));
        };
        fields
            .iter()
            .find(|field| field.name == name)
            .map(|field| &field.node)
            .ok_or_else(|| Error::InvalidLayout(format!("unknown struct field `{name}`")))
    }

    fn element_node(&self, index: usize) -> Result<&VarNode> {
        let VarNode::Array { elements, .. } = self else {
            return Err(Error::InvalidLayout("not an array variable".to_string()));
        };
        elements.get(index).ok_or_else(|| {
            Error::InvalidLayout(format!(
                "array index {index} out of range (length {})",
                elements.len()
            ))
        })
    }
}

/// A typed variable located at an address inside the target. Every `get`/`set`
/// round-trips to the target through the memory accessor; values are never cached.
pub struct RemoteVariable<M: TargetMemory> {
    memory: Arc<M>,
    node: VarNode,
}

impl<M: TargetMemory> RemoteVariable<M> {
    /// Instantiates a variable of the described type with no address yet
    pub fn new(memory: Arc<M>, desc: &TypeDesc) -> RemoteVariable<M> {
        RemoteVariable { memory, node: VarNode::from_desc(desc) }
    }

    /// Instantiates a variable of the described type located at `address`
    pub fn with_address(memory: Arc<M>, desc: &TypeDesc, address: u64) -> Result<RemoteVariable<M>> {
        let mut variable = RemoteVariable::new(memory, desc);
        variable.assign_address(address)?;
        Ok(variable)
    }

    pub fn memory(&self) -> &Arc<M> {
        &self.memory
    }

    /// The variable's current absolute address in the target
    pub fn address(&self) -> Result<u64> {
        self.node.address()
    }

    /// (Re)assigns the address, recomputing the address of every child field/element
    pub fn assign_address(&mut self, address: u64) -> Result<()> {
        self.node.assign_address(address)
    }

    /// Size in bytes. For structs this is only defined once an address is assigned.
    pub fn size(&self) -> Result<u64> {
        self.node.size()
    }

    pub fn get(&self) -> Result<Value> {
        self.node.get(self.memory.as_ref())
    }

    pub fn set(&self, value: &Value) -> Result<()> {
        self.node.set(self.memory.as_ref(), value)
    }

    /// Reads a single struct field
    pub fn get_field(&self, name: &str) -> Result<Value> {
        self.node.field_node(name)?.get(self.memory.as_ref())
    }

    /// Writes a single struct field, leaving all others untouched
    pub fn set_field(&self, name: &str, value: &Value) -> Result<()> {
        self.node.field_node(name)?.set(self.memory.as_ref(), value)
    }

    /// Reads one array element; indexes outside `[0, length)` are rejected
    pub fn get_index(&self, index: usize) -> Result<Value> {
        self.node.element_node(index)?.get(self.memory.as_ref())
    }

    /// Writes one array element
    pub fn set_index(&self, index: usize, value: &Value) -> Result<()> {
        self.node.element_node(index)?.set(self.memory.as_ref(), value)
    }

    /// Reads the stored pointer value and re-points the owned pointee at it, returning a
    /// live view into the target. Repeated calls re-point the same pointee instance; the
    /// view is never a copy, so reads and writes through it hit the target's memory at
    /// the dereferenced address.
    pub fn dereference(&mut self) -> Result<Pointee<'_, M>> {
        let own_address = self.node.address()?;
        let VarNode::Pointer { pointee, .. } = &mut self.node else {
            return Err(Error::InvalidLayout("not a pointer variable".to_string()));
        };
        let stored = self.memory.read_scalar(ScalarKind::Address, own_address)?;
        let Value::Address(target_address) = stored else {
            // read_scalar(Address, ..) always yields Value::Address
            unreachable!();
        };
        pointee.assign_address(target_address)?;
        Ok(Pointee { memory: self.memory.as_ref(), node: pointee })
    }
}

/// Live view over a pointer variable's pointee, borrowed from the owning variable
pub struct Pointee<'a, M: TargetMemory> {
    memory: &'a M,
    node: &'a mut VarNode,
}

impl<M: TargetMemory> Pointee<'_, M> {
    pub fn address(&self) -> Result<u64> {
        self.node.address()
    }

    pub fn size(&self) -> Result<u64> {
        self.node.size()
    }

    pub fn get(&self) -> Result<Value> {
        self.node.get(self.memory)
    }

    pub fn set(&self, value: &Value) -> Result<()> {
        self.node.set(self.memory, value)
    }

    pub fn get_field(&self, name: &str) -> Result<Value> {
        self.node.field_node(name)?.get(self.memory)
    }

    pub fn set_field(&self, name: &str, value: &Value) -> Result<()> {
        self.node.field_node(name)?.set(self.memory, value)
    }
}
