//! Packed wire layout of a Buffer.
//!
//! ```text
//! [ header (24 bytes) ][ field descriptors (8 bytes each) ][ field data ]
//!
//! header:      type_tag u32 | version u16 | field_count u16 | sequence u64 | payload_len u64
//! descriptor:  element code u8 | 3 bytes zero | count u32
//! ```
//!
//! `payload_len` counts everything after the header, so a receiver of a
//! variable-size message reads the header, grows the Buffer, then reads
//! exactly `payload_len` more bytes. All integers are little-endian.

use crate::buffer::element::ElementType;
use crate::error::{Result, RuntimeError};
use bytemuck::{Pod, Zeroable};

/// Size of the fixed message header
pub const HEADER_LEN: usize = 24;

/// Size of one field descriptor
pub const DESCRIPTOR_LEN: usize = 8;

/// Header exactly as laid out on the wire, integers little-endian.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawHeader {
    type_tag: u32,
    version: u16,
    field_count: u16,
    sequence: u64,
    payload_len: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct RawDescriptor {
    element: u8,
    reserved: [u8; 3],
    count: u32,
}

/// Decoded message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireHeader {
    pub type_tag: u32,
    pub version: u16,
    pub field_count: u16,
    pub sequence: u64,
    pub payload_len: u64,
}

impl WireHeader {
    pub fn encode(&self, out: &mut [u8]) {
        let raw = RawHeader {
            type_tag: self.type_tag.to_le(),
            version: self.version.to_le(),
            field_count: self.field_count.to_le(),
            sequence: self.sequence.to_le(),
            payload_len: self.payload_len.to_le(),
        };
        out[..HEADER_LEN].copy_from_slice(bytemuck::bytes_of(&raw));
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(RuntimeError::transport(format!(
                "short header: {} of {} bytes",
                bytes.len(),
                HEADER_LEN
            )));
        }
        let raw: RawHeader = bytemuck::pod_read_unaligned(&bytes[..HEADER_LEN]);
        Ok(Self {
            type_tag: u32::from_le(raw.type_tag),
            version: u16::from_le(raw.version),
            field_count: u16::from_le(raw.field_count),
            sequence: u64::from_le(raw.sequence),
            payload_len: u64::from_le(raw.payload_len),
        })
    }

    /// Total message length including the header
    pub fn message_len(&self) -> usize {
        HEADER_LEN + self.payload_len as usize
    }
}

/// Decoded field descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireDescriptor {
    pub element: ElementType,
    pub count: u32,
}

impl WireDescriptor {
    pub fn encode(&self, out: &mut [u8]) {
        let raw = RawDescriptor {
            element: self.element.code(),
            reserved: [0; 3],
            count: self.count.to_le(),
        };
        out[..DESCRIPTOR_LEN].copy_from_slice(bytemuck::bytes_of(&raw));
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DESCRIPTOR_LEN {
            return Err(RuntimeError::transport(format!(
                "short field descriptor: {} bytes",
                bytes.len()
            )));
        }
        let raw: RawDescriptor = bytemuck::pod_read_unaligned(&bytes[..DESCRIPTOR_LEN]);
        let element = ElementType::from_code(raw.element).ok_or_else(|| {
            RuntimeError::HandshakeMismatch(format!("unknown element code {}", raw.element))
        })?;
        Ok(Self {
            element,
            count: u32::from_le(raw.count),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode() {
        let header = WireHeader {
            type_tag: 0xBEEF,
            version: 3,
            field_count: 2,
            sequence: 42,
            payload_len: 1000,
        };
        let mut raw = [0u8; HEADER_LEN];
        header.encode(&mut raw);
        assert_eq!(WireHeader::decode(&raw).unwrap(), header);
        assert_eq!(header.message_len(), 1024);
        assert_eq!(&raw[..4], &[0xEF, 0xBE, 0, 0]);
        assert_eq!(raw[8], 42);
    }

    #[test]
    fn test_raw_layouts_have_no_padding() {
        assert_eq!(std::mem::size_of::<RawHeader>(), HEADER_LEN);
        assert_eq!(std::mem::size_of::<RawDescriptor>(), DESCRIPTOR_LEN);
    }

    #[test]
    fn test_descriptor_layout() {
        let mut raw = [0xFFu8; DESCRIPTOR_LEN];
        WireDescriptor {
            element: ElementType::I16,
            count: 0x0102,
        }
        .encode(&mut raw);
        assert_eq!(raw, [4, 0, 0, 0, 2, 1, 0, 0]);
    }

    #[test]
    fn test_short_header_rejected() {
        assert!(WireHeader::decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_descriptor_unknown_code() {
        let raw = [99u8, 0, 0, 0, 1, 0, 0, 0];
        assert!(matches!(
            WireDescriptor::decode(&raw),
            Err(RuntimeError::HandshakeMismatch(_))
        ));
    }
}
