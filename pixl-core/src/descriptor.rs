use crate::{
    scalar::ElementType,
    shape::{self, Dimension},
};
use serde::{Deserialize, Serialize};

/// Synchronization state between host and device memory.
///
/// At most one of the two is ever set.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct BufferFlags {
    pub host_dirty: bool,
    pub device_dirty: bool,
}

impl BufferFlags {
    const HOST_DIRTY: u64 = 1;
    const DEVICE_DIRTY: u64 = 2;

    /// Packs the flags into the bit layout used by compiled pipelines.
    pub fn bits(&self) -> u64 {
        let mut bits = 0;
        if self.host_dirty {
            bits |= Self::HOST_DIRTY;
        }
        if self.device_dirty {
            bits |= Self::DEVICE_DIRTY;
        }
        bits
    }
    pub fn from_bits(bits: u64) -> Self {
        Self {
            host_dirty: bits & Self::HOST_DIRTY != 0,
            device_dirty: bits & Self::DEVICE_DIRTY != 0,
        }
    }
}

/// Flat description of a buffer, handed to device interfaces and compiled
/// pipelines.
///
/// Carries no ownership. The host pointer is stored as an address, 0 meaning
/// no host memory, and `device` is an opaque handle, 0 meaning no device
/// allocation.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct BufferDescriptor {
    pub dims: Vec<Dimension>,
    pub element_type: ElementType,
    pub host: u64,
    pub device: u64,
    pub flags: BufferFlags,
}

impl BufferDescriptor {
    pub fn rank(&self) -> usize {
        self.dims.len()
    }
    pub fn host_ptr(&self) -> *mut u8 {
        self.host as usize as *mut u8
    }
    pub fn set_host_ptr(&mut self, ptr: *mut u8) {
        self.host = ptr as usize as u64;
    }
    pub fn number_of_elements(&self) -> usize {
        shape::number_of_elements(&self.dims)
    }
    /// Bytes between the lowest and one past the highest addressed element.
    pub fn size_in_bytes(&self) -> usize {
        let span = shape::end_offset(&self.dims) - shape::begin_offset(&self.dims);
        span as usize * self.element_type.bytes()
    }
    /// Byte offset of `pos` relative to the element at the min coordinate.
    pub fn byte_offset_of(&self, pos: &[i32]) -> isize {
        shape::offset_of(&self.dims, pos) * self.element_type.bytes() as isize
    }
    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }
    pub fn from_bytes(bytes: &[u8]) -> bincode::Result<Self> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::{TypeCode, ElementType};

    #[test]
    fn flag_bits() {
        for bits in 0..3 {
            assert_eq!(BufferFlags::from_bits(bits).bits(), bits);
        }
        assert!(BufferFlags::from_bits(2).device_dirty);
    }

    #[test]
    fn descriptor_bytes() {
        let desc = BufferDescriptor {
            dims: vec![Dimension::new(-2, 5, 3), Dimension::new(7, 3, -1)],
            element_type: ElementType::new(TypeCode::UInt, 8, 3),
            host: 0xdead_beef,
            device: u64::MAX,
            flags: BufferFlags {
                host_dirty: false,
                device_dirty: true,
            },
        };
        let bytes = desc.to_bytes().unwrap();
        assert_eq!(BufferDescriptor::from_bytes(&bytes).unwrap(), desc);
        assert_eq!(desc.rank(), 2);
        assert_eq!(desc.size_in_bytes(), 15 * 3);
    }
}
