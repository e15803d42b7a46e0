//! Typed, versioned sample buffers.
//!
//! A [`Buffer`] is identified by `(name, type_tag, version)` and holds an
//! ordered list of named fields. Its backing store *is* its packed wire image
//! (header, field descriptors, then field data), so packing and unpacking
//! happen in place and a transport can send the storage directly.
//!
//! # Lifecycle
//!
//! 1. A stage declares fields with [`Buffer::add_field`] at pipeline-build time.
//! 2. The owning channel calls [`Buffer::allocate`] once the transport's
//!    [`AllocationPolicy`] is known.
//! 3. [`Buffer::resize`] may relocate the storage; stages that cache anything
//!    derived from the storage register a hook with [`Buffer::on_relocate`],
//!    which fires exactly once per relocation. Field access always goes
//!    through a [`FieldHandle`], which is resolved on every access.

pub mod element;
pub mod wire;

pub use element::{Complex, Complex32, Complex64, Element, ElementType};
pub use wire::{WireDescriptor, WireHeader, DESCRIPTOR_LEN, HEADER_LEN};

use crate::error::{Result, RuntimeError};
use std::fmt;

/// Which allocator backs a transport's wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocator {
    /// Ordinary process heap
    Heap,
    /// Fixed-size shared-memory segment
    SharedMemory,
}

/// Allocation policy a transport imposes on the Buffers it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationPolicy {
    /// Whether the destination buffer may grow after allocation
    pub growable: bool,
    /// Allocator backing the wire format
    pub allocator: Allocator,
    /// Upper bound on a packed message, if the transport has one
    pub max_bytes: Option<usize>,
}

impl AllocationPolicy {
    pub const fn heap() -> Self {
        Self {
            growable: true,
            allocator: Allocator::Heap,
            max_bytes: None,
        }
    }

    pub const fn fixed(max_bytes: usize) -> Self {
        Self {
            growable: false,
            allocator: Allocator::SharedMemory,
            max_bytes: Some(max_bytes),
        }
    }
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self::heap()
    }
}

/// Index into a Buffer's field table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldHandle(pub usize);

impl FieldHandle {
    #[inline]
    pub fn index(self) -> usize {
        self.0
    }
}

/// Identity of a Buffer type, compared when a channel is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BufferSignature {
    pub name: String,
    pub type_tag: u32,
    pub version: u16,
}

impl BufferSignature {
    /// Source and destination must agree on tag and version; names may differ.
    pub fn compatible_with(&self, other: &BufferSignature) -> bool {
        self.type_tag == other.type_tag && self.version == other.version
    }
}

impl fmt::Display for BufferSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(tag={:#x}, v{})", self.name, self.type_tag, self.version)
    }
}

#[derive(Debug, Clone)]
struct Field {
    name: String,
    element: ElementType,
    count: usize,
    /// Offset relative to the start of the data region
    offset: usize,
}

impl Field {
    fn byte_len(&self) -> usize {
        self.element.size_bytes() * self.count
    }
}

/// Callback fired whenever the storage moves.
pub type RelocateHook = Box<dyn FnMut(&Buffer) + Send>;

/// Self-describing container of typed samples plus a small header.
pub struct Buffer {
    name: String,
    type_tag: u32,
    version: u16,
    fields: Vec<Field>,
    variable_size: bool,
    storage: Vec<u8>,
    capacity: usize,
    policy: Option<AllocationPolicy>,
    sequence: u64,
    relocations: u64,
    on_relocate: Option<RelocateHook>,
}

impl Buffer {
    /// Create an empty, unallocated buffer description.
    pub fn new(name: impl Into<String>, type_tag: u32, version: u16) -> Self {
        Self {
            name: name.into(),
            type_tag,
            version,
            fields: Vec::new(),
            variable_size: false,
            storage: Vec::new(),
            capacity: 0,
            policy: None,
            sequence: 0,
            relocations: 0,
            on_relocate: None,
        }
    }

    /// Mark this buffer as variable-size (header-then-payload framing).
    pub fn with_variable_size(mut self, variable: bool) -> Self {
        self.variable_size = variable;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_tag(&self) -> u32 {
        self.type_tag
    }

    pub fn version(&self) -> u16 {
        self.version
    }

    pub fn signature(&self) -> BufferSignature {
        BufferSignature {
            name: self.name.clone(),
            type_tag: self.type_tag,
            version: self.version,
        }
    }

    pub fn is_variable_size(&self) -> bool {
        self.variable_size
    }

    pub fn is_allocated(&self) -> bool {
        self.policy.is_some()
    }

    pub fn policy(&self) -> Option<AllocationPolicy> {
        self.policy
    }

    /// Sequence number carried in the last packed or unpacked header.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn set_sequence(&mut self, sequence: u64) {
        self.sequence = sequence;
    }

    /// Number of times the storage has moved (including the initial allocation).
    pub fn relocations(&self) -> u64 {
        self.relocations
    }

    /// Upper bound on the packed size without a growable transport.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Declare a field. Only legal before `allocate()`.
    pub fn add_field(
        &mut self,
        name: impl Into<String>,
        element: ElementType,
        count: usize,
    ) -> Result<FieldHandle> {
        let name = name.into();
        if self.is_allocated() {
            return Err(RuntimeError::InvalidState(format!(
                "cannot add field '{}' to allocated buffer '{}'",
                name, self.name
            )));
        }
        if self.fields.iter().any(|f| f.name == name) {
            return Err(RuntimeError::InvalidField(format!(
                "duplicate field '{}' in buffer '{}'",
                name, self.name
            )));
        }
        if self.fields.len() >= u16::MAX as usize {
            return Err(RuntimeError::InvalidField(format!(
                "too many fields in buffer '{}'",
                self.name
            )));
        }
        let offset = self.data_len();
        self.fields.push(Field {
            name,
            element,
            count,
            offset,
        });
        Ok(FieldHandle(self.fields.len() - 1))
    }

    /// Look up a field by name.
    pub fn field_handle(&self, name: &str) -> Option<FieldHandle> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .map(FieldHandle)
    }

    /// Element count of a field.
    pub fn field_len(&self, handle: FieldHandle) -> Result<usize> {
        Ok(self.field_desc(handle)?.count)
    }

    pub fn field_type(&self, handle: FieldHandle) -> Result<ElementType> {
        Ok(self.field_desc(handle)?.element)
    }

    fn field_desc(&self, handle: FieldHandle) -> Result<&Field> {
        self.fields.get(handle.index()).ok_or_else(|| {
            RuntimeError::InvalidField(format!(
                "no field #{} in buffer '{}'",
                handle.index(),
                self.name
            ))
        })
    }

    fn descriptors_len(&self) -> usize {
        self.fields.len() * DESCRIPTOR_LEN
    }

    /// Bytes of field data.
    pub fn data_len(&self) -> usize {
        self.fields.iter().map(Field::byte_len).sum()
    }

    /// Bytes following the header on the wire.
    pub fn payload_len(&self) -> usize {
        self.descriptors_len() + self.data_len()
    }

    /// Full packed message size.
    pub fn packed_len(&self) -> usize {
        HEADER_LEN + self.payload_len()
    }

    fn data_start(&self) -> usize {
        HEADER_LEN + self.descriptors_len()
    }

    /// Materialize storage once all fields are declared. Fails if called twice.
    pub fn allocate(&mut self, policy: AllocationPolicy) -> Result<()> {
        if self.is_allocated() {
            return Err(RuntimeError::AlreadyAllocated(self.name.clone()));
        }
        let packed = self.packed_len();
        let capacity = match policy.max_bytes {
            Some(max) if packed > max => {
                return Err(RuntimeError::CapacityExceeded {
                    requested: packed,
                    capacity: max,
                });
            }
            Some(max) if !policy.growable => max,
            _ => packed,
        };
        let mut storage = Vec::with_capacity(capacity);
        storage.resize(packed, 0);
        self.storage = storage;
        self.capacity = capacity;
        self.policy = Some(policy);
        self.write_descriptors();
        self.relocated();
        tracing::debug!(
            "Allocated buffer {} ({} bytes, {:?})",
            self.signature(),
            packed,
            policy.allocator
        );
        Ok(())
    }

    /// Grow or shrink the backing store to `total_bytes` of wire image.
    ///
    /// Fails with `CapacityExceeded` past the capacity of a non-growable transport.
    pub fn resize(&mut self, total_bytes: usize) -> Result<()> {
        let policy = self
            .policy
            .ok_or_else(|| RuntimeError::NotInitialized(self.name.clone()))?;
        if total_bytes > self.capacity {
            if !policy.growable {
                return Err(RuntimeError::CapacityExceeded {
                    requested: total_bytes,
                    capacity: self.capacity,
                });
            }
            self.capacity = total_bytes;
        }
        let before = self.storage.as_ptr();
        self.storage.resize(total_bytes, 0);
        if self.storage.as_ptr() != before {
            self.relocated();
        }
        Ok(())
    }

    /// Change the element count of a field on a variable-size buffer.
    ///
    /// The first `min(old, new)` elements of every field survive.
    pub fn set_field_count(&mut self, handle: FieldHandle, count: usize) -> Result<()> {
        let current = self.field_desc(handle)?.count;
        if current == count {
            return Ok(());
        }
        if !self.is_allocated() {
            self.fields[handle.index()].count = count;
            self.recompute_offsets();
            return Ok(());
        }
        if !self.variable_size {
            return Err(RuntimeError::InvalidState(format!(
                "buffer '{}' is fixed-size",
                self.name
            )));
        }

        let old_fields = self.fields.clone();
        let old_start = self.data_start();
        self.fields[handle.index()].count = count;
        self.recompute_offsets();
        let new_len = self.packed_len();

        let policy = self.policy.unwrap_or_default();
        if new_len > self.capacity && !policy.growable {
            self.fields = old_fields;
            return Err(RuntimeError::CapacityExceeded {
                requested: new_len,
                capacity: self.capacity,
            });
        }

        let mut storage = Vec::with_capacity(new_len.max(self.capacity));
        storage.resize(new_len, 0);
        let new_start = self.data_start();
        for (old, new) in old_fields.iter().zip(&self.fields) {
            let keep = old.byte_len().min(new.byte_len());
            let src = old_start + old.offset;
            let dst = new_start + new.offset;
            storage[dst..dst + keep].copy_from_slice(&self.storage[src..src + keep]);
        }
        self.capacity = self.capacity.max(new_len);
        self.storage = storage;
        self.write_descriptors();
        self.relocated();
        Ok(())
    }

    fn recompute_offsets(&mut self) {
        let mut offset = 0;
        for field in &mut self.fields {
            field.offset = offset;
            offset += field.byte_len();
        }
    }

    /// Register the hook fired after every relocation of the storage.
    pub fn on_relocate(&mut self, hook: RelocateHook) {
        self.on_relocate = Some(hook);
    }

    fn relocated(&mut self) {
        self.relocations += 1;
        if let Some(mut hook) = self.on_relocate.take() {
            hook(self);
            self.on_relocate = Some(hook);
        }
    }

    fn field_range(&self, handle: FieldHandle) -> Result<std::ops::Range<usize>> {
        if !self.is_allocated() {
            return Err(RuntimeError::NotInitialized(self.name.clone()));
        }
        let field = self.field_desc(handle)?;
        let start = self.data_start() + field.offset;
        Ok(start..start + field.byte_len())
    }

    /// Raw bytes of one field.
    pub fn field_bytes(&self, handle: FieldHandle) -> Result<&[u8]> {
        let range = self.field_range(handle)?;
        Ok(&self.storage[range])
    }

    /// Mutable raw bytes of one field.
    pub fn field_bytes_mut(&mut self, handle: FieldHandle) -> Result<&mut [u8]> {
        let range = self.field_range(handle)?;
        Ok(&mut self.storage[range])
    }

    fn check_type<T: Element>(&self, handle: FieldHandle) -> Result<()> {
        let field = self.field_desc(handle)?;
        if field.element != T::TYPE {
            return Err(RuntimeError::InvalidField(format!(
                "field '{}' holds {}, not {}",
                field.name,
                field.element.display_name(),
                T::TYPE.display_name()
            )));
        }
        Ok(())
    }

    /// Byte range of element `index` within a field of `T`.
    fn element_range<T: Element>(index: usize) -> Result<std::ops::Range<usize>> {
        let size = T::TYPE.size_bytes();
        let end = index
            .checked_add(1)
            .and_then(|n| n.checked_mul(size))
            .ok_or(RuntimeError::CapacityExceeded {
                requested: index,
                capacity: usize::MAX / size,
            })?;
        Ok(end - size..end)
    }

    /// Read element `index` of a field.
    pub fn get<T: Element>(&self, handle: FieldHandle, index: usize) -> Result<T> {
        self.check_type::<T>(handle)?;
        let range = Self::element_range::<T>(index)?;
        let raw = self.field_bytes(handle)?.get(range).ok_or_else(|| {
            RuntimeError::InvalidField(format!("index {} out of range", index))
        })?;
        Ok(element::decode_one(raw))
    }

    /// Write element `index` of a field.
    pub fn set<T: Element>(&mut self, handle: FieldHandle, index: usize, value: T) -> Result<()> {
        self.check_type::<T>(handle)?;
        let range = Self::element_range::<T>(index)?;
        let raw = self
            .field_bytes_mut(handle)?
            .get_mut(range)
            .ok_or_else(|| RuntimeError::InvalidField(format!("index {} out of range", index)))?;
        element::encode_into(std::slice::from_ref(&value), raw);
        Ok(())
    }

    /// Copy a whole field out.
    pub fn read_field<T: Element>(&self, handle: FieldHandle) -> Result<Vec<T>> {
        self.check_type::<T>(handle)?;
        Ok(element::decode_from(self.field_bytes(handle)?))
    }

    /// Overwrite the leading elements of a field from `values`.
    pub fn write_field<T: Element>(&mut self, handle: FieldHandle, values: &[T]) -> Result<()> {
        self.check_type::<T>(handle)?;
        let size = T::TYPE.size_bytes();
        let bytes = self.field_bytes_mut(handle)?;
        let len = std::mem::size_of_val(values);
        if len > bytes.len() {
            return Err(RuntimeError::InvalidField(format!(
                "{} elements do not fit in field of {}",
                values.len(),
                bytes.len() / size
            )));
        }
        element::encode_into(values, &mut bytes[..len]);
        Ok(())
    }

    /// Zero every field.
    pub fn clear_data(&mut self) {
        if self.is_allocated() {
            let start = self.data_start();
            self.storage[start..].fill(0);
        }
    }

    fn write_descriptors(&mut self) {
        let mut at = HEADER_LEN;
        for i in 0..self.fields.len() {
            let descriptor = WireDescriptor {
                element: self.fields[i].element,
                count: self.fields[i].count as u32,
            };
            descriptor.encode(&mut self.storage[at..at + DESCRIPTOR_LEN]);
            at += DESCRIPTOR_LEN;
        }
    }

    fn header(&self) -> WireHeader {
        WireHeader {
            type_tag: self.type_tag,
            version: self.version,
            field_count: self.fields.len() as u16,
            sequence: self.sequence,
            payload_len: self.payload_len() as u64,
        }
    }

    /// Serialize header and descriptors in place and return the wire image.
    pub fn pack(&mut self) -> Result<&[u8]> {
        if !self.is_allocated() {
            return Err(RuntimeError::NotInitialized(self.name.clone()));
        }
        let len = self.packed_len();
        if self.storage.len() < len {
            self.resize(len)?;
        }
        let header = self.header();
        header.encode(&mut self.storage[..HEADER_LEN]);
        self.write_descriptors();
        Ok(&self.storage[..len])
    }

    /// Whole backing store, for transports receiving into it.
    pub(crate) fn wire_mut(&mut self) -> &mut [u8] {
        &mut self.storage
    }

    /// Whole backing store.
    pub fn wire(&self) -> &[u8] {
        &self.storage
    }

    /// Deserialize in place after a receive, validating identity and layout.
    pub fn unpack(&mut self) -> Result<()> {
        if !self.is_allocated() {
            return Err(RuntimeError::NotInitialized(self.name.clone()));
        }
        let header = WireHeader::decode(&self.storage)?;
        if header.type_tag != self.type_tag || header.version != self.version {
            return Err(RuntimeError::HandshakeMismatch(format!(
                "received tag {:#x} v{} into {}",
                header.type_tag,
                header.version,
                self.signature()
            )));
        }
        if header.field_count as usize != self.fields.len() {
            return Err(RuntimeError::HandshakeMismatch(format!(
                "received {} fields into {} with {}",
                header.field_count,
                self.signature(),
                self.fields.len()
            )));
        }
        if self.storage.len() < header.message_len() {
            return Err(RuntimeError::transport(format!(
                "truncated message: {} of {} bytes",
                self.storage.len(),
                header.message_len()
            )));
        }

        let mut counts = Vec::with_capacity(self.fields.len());
        for (i, field) in self.fields.iter().enumerate() {
            let at = HEADER_LEN + i * DESCRIPTOR_LEN;
            let descriptor = WireDescriptor::decode(&self.storage[at..at + DESCRIPTOR_LEN])?;
            if descriptor.element != field.element {
                return Err(RuntimeError::HandshakeMismatch(format!(
                    "field '{}' is {} on the wire, {} locally",
                    field.name,
                    descriptor.element.display_name(),
                    field.element.display_name()
                )));
            }
            let count = descriptor.count as usize;
            if count != field.count && !self.variable_size {
                return Err(RuntimeError::HandshakeMismatch(format!(
                    "field '{}' has {} elements on the wire, {} locally",
                    field.name, descriptor.count, field.count
                )));
            }
            counts.push(count);
        }
        let declared: usize = self.descriptors_len()
            + self
                .fields
                .iter()
                .zip(&counts)
                .map(|(field, &count)| field.element.size_bytes() * count)
                .sum::<usize>();
        if declared != header.payload_len as usize {
            return Err(RuntimeError::HandshakeMismatch(format!(
                "declared payload {} bytes, layout needs {}",
                header.payload_len, declared
            )));
        }

        if self.fields.iter().zip(&counts).any(|(f, &c)| f.count != c) {
            for (field, count) in self.fields.iter_mut().zip(counts) {
                field.count = count;
            }
            self.recompute_offsets();
        }
        self.sequence = header.sequence;
        Ok(())
    }

    /// Unallocated copy with the same identity and field list.
    pub fn clone_layout(&self) -> Buffer {
        Buffer {
            name: self.name.clone(),
            type_tag: self.type_tag,
            version: self.version,
            fields: self.fields.clone(),
            variable_size: self.variable_size,
            storage: Vec::new(),
            capacity: 0,
            policy: None,
            sequence: 0,
            relocations: 0,
            on_relocate: None,
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("signature", &self.signature())
            .field("fields", &self.fields.len())
            .field("variable_size", &self.variable_size)
            .field("allocated", &self.is_allocated())
            .field("packed_len", &self.packed_len())
            .field("sequence", &self.sequence)
            .finish()
    }
}
