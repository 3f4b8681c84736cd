use super::{error::*, DeviceInterface};
use crate::{descriptor::BufferDescriptor, result::Result, shape};
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::trace;

pub(super) struct EmulatedOptions {
    pub(super) name: String,
    pub(super) memory_limit: Option<usize>,
    pub(super) crop: bool,
}

impl Default for EmulatedOptions {
    fn default() -> Self {
        Self {
            name: "emulated".to_string(),
            memory_limit: None,
            crop: true,
        }
    }
}

struct Allocation {
    bytes: Vec<u8>,
    native: bool,
}

/// Where a handle points: the allocation it lives in and the byte offset of
/// the element at its min coordinate.
#[derive(Clone, Copy)]
struct Region {
    root: u64,
    offset: isize,
    crop: bool,
}

#[derive(Default)]
struct State {
    next_handle: u64,
    allocations: HashMap<u64, Allocation>,
    regions: HashMap<u64, Region>,
    bytes_in_use: usize,
}

impl State {
    fn region(&self, handle: u64) -> Result<Region, InvalidDeviceHandle> {
        self.regions
            .get(&handle)
            .copied()
            .ok_or(InvalidDeviceHandle { handle })
    }
    fn next_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
    fn alloc(&mut self, limit: Option<usize>, len: usize, native: bool) -> Result<u64> {
        if let Some(limit) = limit {
            let available = limit.saturating_sub(self.bytes_in_use);
            if len > available {
                return Err(OutOfDeviceMemory {
                    requested: len,
                    available,
                }
                .into());
            }
        }
        let handle = self.next_handle();
        self.allocations.insert(
            handle,
            Allocation {
                bytes: vec![0; len],
                native,
            },
        );
        self.bytes_in_use += len;
        Ok(handle)
    }
    fn free(&mut self, handle: u64) -> Result<()> {
        let allocation = self
            .allocations
            .remove(&handle)
            .ok_or(InvalidDeviceHandle { handle })?;
        self.bytes_in_use -= allocation.bytes.len();
        self.regions.retain(|_, region| region.root != handle);
        Ok(())
    }
}

/// A device backed by host memory.
///
/// Every primitive of [`DeviceInterface`] is implemented, so buffers can be
/// moved to and from it, cropped and sliced on it, and wrapped around native
/// handles from [`.alloc_native()`](Self::alloc_native). Device memory is
/// separate from host memory and is only reachable through copies and
/// [`.read_element()`](Self::read_element) /
/// [`.write_element()`](Self::write_element).
pub struct EmulatedDevice {
    options: EmulatedOptions,
    state: Mutex<State>,
}

impl EmulatedDevice {
    pub(super) fn new(options: EmulatedOptions) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            options,
            state: Mutex::default(),
        }))
    }
    /// Allocates `len` bytes that are not owned by any buffer.
    ///
    /// The handle can be attached with `device_wrap_native` and is freed
    /// with [`.free_native()`](Self::free_native).
    pub fn alloc_native(&self, len: usize) -> Result<u64> {
        let mut state = self.state.lock();
        let handle = state.alloc(self.options.memory_limit, len, true)?;
        state.regions.insert(
            handle,
            Region {
                root: handle,
                offset: 0,
                crop: false,
            },
        );
        trace!(handle, len, "alloc_native");
        Ok(handle)
    }
    pub fn free_native(&self, handle: u64) -> Result<()> {
        let mut state = self.state.lock();
        match state.allocations.get(&handle) {
            Some(allocation) if allocation.native => (),
            _ => return Err(InvalidDeviceHandle { handle }.into()),
        }
        trace!(handle, "free_native");
        state.free(handle)
    }
    /// Number of live allocations, crops excluded.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().allocations.len()
    }
    /// Whether `handle` refers to live device memory.
    pub fn is_live(&self, handle: u64) -> bool {
        self.state.lock().regions.contains_key(&handle)
    }
    pub fn bytes_in_use(&self) -> usize {
        self.state.lock().bytes_in_use
    }
    /// Reads the bytes of the element at `pos` directly from device memory.
    pub fn read_element(&self, buf: &BufferDescriptor, pos: &[i32]) -> Result<Vec<u8>> {
        assert!(
            shape::contains(&buf.dims, pos),
            "Coordinate {pos:?} out of bounds!"
        );
        let state = self.state.lock();
        let region = state.region(buf.device)?;
        let bytes = &state.allocations[&region.root].bytes;
        let start = (region.offset + buf.byte_offset_of(pos)) as usize;
        Ok(bytes[start..start + buf.element_type.bytes()].to_vec())
    }
    /// Writes `value` into the element at `pos` directly in device memory,
    /// the way a kernel would.
    pub fn write_element(&self, buf: &BufferDescriptor, pos: &[i32], value: &[u8]) -> Result<()> {
        assert!(
            shape::contains(&buf.dims, pos),
            "Coordinate {pos:?} out of bounds!"
        );
        assert_eq!(value.len(), buf.element_type.bytes());
        let mut state = self.state.lock();
        let region = state.region(buf.device)?;
        let bytes = &mut state
            .allocations
            .get_mut(&region.root)
            .ok_or(InvalidDeviceHandle { handle: region.root })?
            .bytes;
        let start = (region.offset + buf.byte_offset_of(pos)) as usize;
        bytes[start..start + value.len()].copy_from_slice(value);
        Ok(())
    }
    fn insert_crop(&self, src: &BufferDescriptor, offset: isize, dst: &mut BufferDescriptor) -> Result<()> {
        let mut state = self.state.lock();
        let region = state.region(src.device)?;
        let handle = state.next_handle();
        state.regions.insert(
            handle,
            Region {
                root: region.root,
                offset: region.offset + offset,
                crop: true,
            },
        );
        dst.device = handle;
        Ok(())
    }
}

impl DeviceInterface for EmulatedDevice {
    fn name(&self) -> &str {
        &self.options.name
    }
    fn device_malloc(&self, buf: &mut BufferDescriptor) -> Result<()> {
        let len = buf.size_in_bytes();
        let begin = shape::begin_offset(&buf.dims) * buf.element_type.bytes() as isize;
        let mut state = self.state.lock();
        let handle = state.alloc(self.options.memory_limit, len, false)?;
        state.regions.insert(
            handle,
            Region {
                root: handle,
                offset: -begin,
                crop: false,
            },
        );
        trace!(handle, len, "device_malloc");
        buf.device = handle;
        Ok(())
    }
    fn device_free(&self, buf: &mut BufferDescriptor) -> Result<()> {
        let mut state = self.state.lock();
        let region = state.region(buf.device)?;
        if region.crop || region.root != buf.device {
            return Err(InvalidDeviceHandle { handle: buf.device }.into());
        }
        trace!(handle = buf.device, "device_free");
        state.free(buf.device)?;
        buf.device = 0;
        Ok(())
    }
    fn copy_to_host(&self, buf: &mut BufferDescriptor) -> Result<()> {
        if buf.host == 0 {
            return Err(HostIsNull.into());
        }
        let state = self.state.lock();
        let region = state.region(buf.device)?;
        let src = &state.allocations[&region.root].bytes;
        let width = buf.element_type.bytes();
        let host = buf.host_ptr();
        shape::for_each_offset(&buf.dims, |offset| {
            let offset = offset * width as isize;
            let start = (region.offset + offset) as usize;
            let src = &src[start..start + width];
            unsafe {
                std::ptr::copy_nonoverlapping(src.as_ptr(), host.offset(offset), width);
            }
        });
        trace!(handle = buf.device, "copy_to_host");
        Ok(())
    }
    fn copy_to_device(&self, buf: &mut BufferDescriptor) -> Result<()> {
        if buf.host == 0 {
            return Err(HostIsNull.into());
        }
        let mut state = self.state.lock();
        let region = state.region(buf.device)?;
        let dst = &mut state
            .allocations
            .get_mut(&region.root)
            .ok_or(InvalidDeviceHandle { handle: region.root })?
            .bytes;
        let width = buf.element_type.bytes();
        let host = buf.host_ptr() as *const u8;
        shape::for_each_offset(&buf.dims, |offset| {
            let offset = offset * width as isize;
            let start = (region.offset + offset) as usize;
            let dst = &mut dst[start..start + width];
            unsafe {
                std::ptr::copy_nonoverlapping(host.offset(offset), dst.as_mut_ptr(), width);
            }
        });
        trace!(handle = buf.device, "copy_to_device");
        Ok(())
    }
    fn device_sync(&self, buf: &BufferDescriptor) -> Result<()> {
        self.state.lock().region(buf.device)?;
        Ok(())
    }
    fn device_crop(&self, src: &BufferDescriptor, dst: &mut BufferDescriptor) -> Result<()> {
        if !self.options.crop {
            return Err(self.unsupported("device_crop"));
        }
        assert_eq!(src.rank(), dst.rank());
        let offset: isize = src
            .dims
            .iter()
            .zip(dst.dims.iter())
            .map(|(s, d)| (d.min as isize - s.min as isize) * s.stride as isize)
            .sum();
        self.insert_crop(src, offset * src.element_type.bytes() as isize, dst)
    }
    fn device_slice(
        &self,
        src: &BufferDescriptor,
        dim: usize,
        pos: i32,
        dst: &mut BufferDescriptor,
    ) -> Result<()> {
        if !self.options.crop {
            return Err(self.unsupported("device_slice"));
        }
        let d = &src.dims[dim];
        let offset = (pos as isize - d.min as isize) * d.stride as isize;
        self.insert_crop(src, offset * src.element_type.bytes() as isize, dst)
    }
    fn device_release_crop(&self, buf: &mut BufferDescriptor) -> Result<()> {
        let mut state = self.state.lock();
        let region = state.region(buf.device)?;
        if !region.crop {
            return Err(InvalidDeviceHandle { handle: buf.device }.into());
        }
        state.regions.remove(&buf.device);
        buf.device = 0;
        Ok(())
    }
    fn wrap_native(&self, buf: &mut BufferDescriptor, handle: u64) -> Result<()> {
        let state = self.state.lock();
        match state.allocations.get(&handle) {
            Some(allocation) if allocation.native => (),
            _ => return Err(InvalidDeviceHandle { handle }.into()),
        }
        buf.device = handle;
        Ok(())
    }
    fn detach_native(&self, buf: &mut BufferDescriptor) -> Result<()> {
        self.state.lock().region(buf.device)?;
        buf.device = 0;
        Ok(())
    }
}

impl fmt::Debug for EmulatedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EmulatedDevice")
            .field("name", &self.options.name)
            .field("allocations", &state.allocations.len())
            .field("bytes_in_use", &state.bytes_in_use)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        descriptor::BufferFlags,
        scalar::ElementType,
        shape::{dense_dims, Dimension},
    };

    fn desc(extents: &[i32]) -> BufferDescriptor {
        BufferDescriptor {
            dims: dense_dims(extents).collect(),
            element_type: ElementType::of::<u16>(),
            host: 0,
            device: 0,
            flags: BufferFlags::default(),
        }
    }

    #[test]
    fn malloc_free() {
        let device = EmulatedDevice::new(EmulatedOptions::default()).unwrap();
        let mut buf = desc(&[4, 3]);
        device.device_malloc(&mut buf).unwrap();
        assert_ne!(buf.device, 0);
        assert_eq!(device.bytes_in_use(), 24);
        device.device_free(&mut buf).unwrap();
        assert_eq!(buf.device, 0);
        assert_eq!(device.live_allocations(), 0);
    }

    #[test]
    fn memory_limit() {
        let device = EmulatedDevice::new(EmulatedOptions {
            memory_limit: Some(16),
            ..Default::default()
        })
        .unwrap();
        let mut buf = desc(&[4, 3]);
        let e = device.device_malloc(&mut buf).unwrap_err();
        assert!(e.downcast_ref::<OutOfDeviceMemory>().is_some());
        assert_eq!(buf.device, 0);
    }

    #[test]
    fn crop_aliases_root() {
        let device = EmulatedDevice::new(EmulatedOptions::default()).unwrap();
        let mut buf = desc(&[4, 3]);
        device.device_malloc(&mut buf).unwrap();
        device.write_element(&buf, &[2, 1], &[7, 0]).unwrap();
        let mut crop = buf.clone();
        crop.dims[0] = Dimension::new(2, 2, 1);
        crop.dims[1] = Dimension::new(1, 2, 4);
        device.device_crop(&buf, &mut crop).unwrap();
        assert_eq!(device.read_element(&crop, &[2, 1]).unwrap(), [7, 0]);
        assert!(device.device_free(&mut crop.clone()).is_err());
        device.device_release_crop(&mut crop).unwrap();
        device.device_free(&mut buf).unwrap();
    }

    #[test]
    fn crop_unsupported() {
        let device = EmulatedDevice::new(EmulatedOptions {
            crop: false,
            ..Default::default()
        })
        .unwrap();
        let mut buf = desc(&[4]);
        device.device_malloc(&mut buf).unwrap();
        let mut crop = buf.clone();
        let e = device.device_crop(&buf, &mut crop).unwrap_err();
        assert!(e.downcast_ref::<DeviceOperationUnsupported>().is_some());
    }
}
