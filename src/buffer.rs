use crate::{
    descriptor::{BufferDescriptor, BufferFlags},
    device::{error::*, Device, DeviceOwnership},
    result::Result,
    scalar::{ElementType, Scalar},
    shape::{self, dense_dims, Dimension},
};
use smallvec::SmallVec;
use std::{ptr::null_mut, sync::Arc};
use tracing::{debug, warn};

mod alloc;
mod copy;
mod device_ref;
mod iter;
mod typed;
mod view;

pub use alloc::{HostAllocator, SystemAllocator, HOST_ALIGNMENT};
use alloc::{HostAllocation, SYSTEM_ALLOCATOR};
use device_ref::{DeviceRef, OwnershipKind};
pub use iter::{Coords, ElementFn};
pub use typed::{Buffer, ScalarBuffer};

pub mod error {
    use super::HOST_ALIGNMENT;
    use std::alloc::Layout;

    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Out of host memory allocating {bytes} bytes!")]
    pub struct OutOfHostMemory {
        pub bytes: usize,
    }

    impl OutOfHostMemory {
        pub fn layout(&self) -> Layout {
            Layout::from_size_align(self.bytes.max(1), HOST_ALIGNMENT)
                .unwrap_or_else(|_| Layout::new::<u8>())
        }
    }
}
use error::OutOfHostMemory;

pub(crate) type Dims = SmallVec<[Dimension; 4]>;

/// A type erased N-dimensional view of host and / or device memory.
///
/// The shape belongs to the view alone, so reshaping operations such as
/// [`.crop()`](Self::crop) or [`.transpose()`](Self::transpose) never
/// affect other views. Host and device memory are shared, reference counted,
/// between every view that aliases them, and released when the last such view
/// is dropped.
///
/// [`Buffer`] and [`ScalarBuffer`] dereference to this.
#[derive(Clone)]
pub struct RawBuffer {
    dims: Dims,
    element_type: ElementType,
    host: *mut u8,
    flags: BufferFlags,
    device_ref: Option<Arc<DeviceRef>>,
    host_alloc: Option<Arc<HostAllocation>>,
}

unsafe impl Send for RawBuffer {}
unsafe impl Sync for RawBuffer {}

impl RawBuffer {
    /// A buffer with shape `dims` and no memory.
    pub fn with_dims(element_type: ElementType, dims: impl IntoIterator<Item = Dimension>) -> Self {
        let dims: Dims = dims.into_iter().collect();
        for dim in dims.iter() {
            assert!(dim.extent >= 0, "Negative extent in {dim:?}!");
        }
        Self {
            dims,
            element_type,
            host: null_mut(),
            flags: BufferFlags::default(),
            device_ref: None,
            host_alloc: None,
        }
    }
    /// A dense, zeroed buffer with the given extents, first axis fastest.
    pub fn new(element_type: ElementType, extents: &[i32]) -> Self {
        let mut buffer = Self::with_dims(element_type, dense_dims(extents));
        buffer.allocate();
        buffer
    }
    /// Wraps foreign memory without taking ownership of it.
    ///
    /// # Safety
    /// `host` must be valid for reads and writes of every element addressed
    /// by `dims` for as long as this buffer or any view of it is alive.
    pub unsafe fn from_raw_parts(
        element_type: ElementType,
        host: *mut u8,
        dims: impl IntoIterator<Item = Dimension>,
    ) -> Self {
        let mut buffer = Self::with_dims(element_type, dims);
        buffer.host = host;
        buffer
    }
    pub(crate) fn from_vec<T: Scalar>(vec: Vec<T>, extents: &[i32]) -> Self {
        let mut buffer = Self::with_dims(T::element_type(), dense_dims(extents));
        assert_eq!(
            vec.len(),
            buffer.number_of_elements(),
            "Vec length does not match extents {extents:?}!"
        );
        if !vec.is_empty() {
            let alloc = HostAllocation::from_vec(vec);
            buffer.host = alloc.as_ptr();
            buffer.host_alloc.replace(Arc::new(alloc));
        }
        buffer
    }
    /// A rank 0 buffer holding one element.
    pub fn make_scalar(element_type: ElementType) -> Self {
        Self::new(element_type, &[])
    }
    /// A `width x height x channels` buffer with channels innermost.
    pub fn make_interleaved(
        element_type: ElementType,
        width: i32,
        height: i32,
        channels: i32,
    ) -> Self {
        let mut buffer = Self::new(element_type, &[channels, width, height]);
        buffer.transpose(0, 1);
        buffer.transpose(1, 2);
        buffer
    }
    /// Wraps a flat descriptor.
    ///
    /// A non zero `desc.device` is attached to `device` with the given
    /// ownership, and released accordingly when the last view of it is
    /// dropped.
    ///
    /// # Safety
    /// `desc.host`, if not null, must be valid for every element addressed by
    /// `desc.dims` for as long as the buffer or any view of it is alive, and
    /// `desc.device` must be a live handle of `device`.
    pub unsafe fn from_descriptor(
        desc: &BufferDescriptor,
        device: Option<Device>,
        ownership: DeviceOwnership,
    ) -> Self {
        assert!(
            !(desc.flags.host_dirty && desc.flags.device_dirty),
            "Descriptor is both host and device dirty!"
        );
        let mut buffer = unsafe {
            Self::from_raw_parts(desc.element_type, desc.host_ptr(), desc.dims.iter().copied())
        };
        buffer.flags = desc.flags;
        if desc.device != 0 {
            let device = device.unwrap_or_else(|| {
                panic!("Device handle {:#x} requires a device interface!", desc.device)
            });
            let kind = match ownership {
                DeviceOwnership::Allocated => OwnershipKind::Allocated,
                DeviceOwnership::WrappedNative => OwnershipKind::WrappedNative,
                DeviceOwnership::Unmanaged => OwnershipKind::Unmanaged,
                DeviceOwnership::AllocatedDeviceAndHost => OwnershipKind::AllocatedDeviceAndHost,
                DeviceOwnership::Cropped => {
                    panic!("Cannot wrap a cropped device handle without its parent buffer!")
                }
            };
            buffer.device_ref = Some(Arc::new(DeviceRef::new(device, desc.clone(), kind)));
        }
        buffer
    }
    pub fn element_type(&self) -> ElementType {
        self.element_type
    }
    /// The rank.
    pub fn dimensions(&self) -> usize {
        self.dims.len()
    }
    pub fn dim(&self, i: usize) -> Dimension {
        self.dims[i]
    }
    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }
    pub fn number_of_elements(&self) -> usize {
        shape::number_of_elements(&self.dims)
    }
    /// Offset in elements of the lowest addressed element from the element
    /// at the min coordinate.
    pub fn begin(&self) -> isize {
        shape::begin_offset(&self.dims)
    }
    /// One past the offset in elements of the highest addressed element.
    pub fn end(&self) -> isize {
        shape::end_offset(&self.dims)
    }
    /// Bytes spanned in memory, gaps included.
    pub fn size_in_bytes(&self) -> usize {
        (self.end() - self.begin()) as usize * self.element_type.bytes()
    }
    fn extent_or_one(&self, i: usize) -> i32 {
        self.dims.get(i).map_or(1, |dim| dim.extent)
    }
    pub fn width(&self) -> i32 {
        self.extent_or_one(0)
    }
    pub fn height(&self) -> i32 {
        self.extent_or_one(1)
    }
    pub fn channels(&self) -> i32 {
        self.extent_or_one(2)
    }
    pub fn left(&self) -> i32 {
        self.dims[0].min
    }
    pub fn right(&self) -> i32 {
        self.dims[0].max()
    }
    pub fn top(&self) -> i32 {
        self.dims[1].min
    }
    pub fn bottom(&self) -> i32 {
        self.dims[1].max()
    }
    /// Whether `pos` is inside the buffer. Missing trailing coordinates are
    /// taken to be at their min.
    pub fn contains(&self, pos: &[i32]) -> bool {
        shape::contains(&self.dims, pos)
    }
    /// A buffer with neither host nor device memory, used to query the
    /// required shape.
    pub fn is_bounds_query(&self) -> bool {
        self.host.is_null() && self.device_ref.is_none()
    }
    pub fn host_ptr(&self) -> *mut u8 {
        self.host
    }
    /// Whether this view shares ownership of its host memory.
    pub fn owns_host_memory(&self) -> bool {
        self.host_alloc.is_some()
    }
    /// Panics if the buffer spans more bytes than can be addressed.
    pub fn check_overflow(&self) {
        let span = self.dims.iter().try_fold(1i64, |span, dim| {
            let extent = i64::from(dim.extent.max(1) - 1);
            let step = extent.checked_mul(i64::from(dim.stride).abs())?;
            span.checked_add(step)
        });
        let bytes = span.and_then(|span| span.checked_mul(self.element_type.bytes() as i64));
        assert!(
            bytes.map_or(false, |bytes| bytes <= isize::MAX as i64),
            "Buffer with dims {:?} spans too many bytes!",
            self.dims
        );
    }
    /// Allocates zeroed host memory with the global allocator.
    ///
    /// Releases any memory previously referenced by this view.
    pub fn allocate(&mut self) {
        let allocator = SYSTEM_ALLOCATOR.clone();
        if let Err(e) = self.allocate_with(allocator) {
            std::alloc::handle_alloc_error(e.layout());
        }
    }
    /// Like [`.allocate()`](Self::allocate), with a custom allocator.
    ///
    /// On error the buffer is unchanged.
    pub fn allocate_with(
        &mut self,
        allocator: Arc<dyn HostAllocator>,
    ) -> Result<(), OutOfHostMemory> {
        self.check_overflow();
        let alloc = if self.number_of_elements() > 0 {
            let len = self.size_in_bytes();
            let alloc = HostAllocation::new(allocator, len).ok_or(OutOfHostMemory { bytes: len })?;
            Some(Arc::new(alloc))
        } else {
            None
        };
        self.deallocate();
        if let Some(alloc) = alloc {
            let begin = self.begin() * self.element_type.bytes() as isize;
            self.host = alloc.as_ptr().wrapping_offset(-begin);
            self.host_alloc.replace(alloc);
        }
        Ok(())
    }
    /// Drops this view's references to host and device memory.
    pub fn deallocate(&mut self) {
        self.host_alloc = None;
        self.host = null_mut();
        self.device_deallocate();
    }
    pub fn host_dirty(&self) -> bool {
        self.flags.host_dirty
    }
    pub fn device_dirty(&self) -> bool {
        self.flags.device_dirty
    }
    pub fn set_host_dirty(&mut self, host_dirty: bool) {
        assert!(
            !(host_dirty && self.flags.device_dirty),
            "Cannot set host dirty when device is already dirty. Call copy_to_host() before accessing the buffer from host."
        );
        self.flags.host_dirty = host_dirty;
    }
    pub fn set_device_dirty(&mut self, device_dirty: bool) {
        assert!(
            !(device_dirty && self.flags.host_dirty),
            "Cannot set device dirty when host is already dirty. Call copy_to_device() before accessing the buffer from device."
        );
        self.flags.device_dirty = device_dirty;
    }
    /// The flat descriptor of this view.
    pub fn descriptor(&self) -> BufferDescriptor {
        BufferDescriptor {
            dims: self.dims.to_vec(),
            element_type: self.element_type,
            host: self.host as usize as u64,
            device: self.device_handle(),
            flags: self.flags,
        }
    }
    pub fn has_device_allocation(&self) -> bool {
        self.device_ref.is_some()
    }
    /// The device the allocation lives on, if any.
    pub fn device(&self) -> Option<&Device> {
        self.device_ref.as_ref().map(|x| x.device())
    }
    /// The device handle, 0 if there is none.
    pub fn device_handle(&self) -> u64 {
        self.device_ref.as_ref().map_or(0, |x| x.handle())
    }
    pub fn device_ownership(&self) -> Option<DeviceOwnership> {
        self.device_ref.as_ref().map(|x| x.ownership())
    }
    fn check_device(&self, device: &Device) -> Result<()> {
        match self.device() {
            Some(attached) if attached != device => Err(DeviceInterfaceMismatch {
                attached: attached.name().to_string(),
                requested: device.name().to_string(),
            }
            .into()),
            _ => Ok(()),
        }
    }
    fn attach_device(
        &mut self,
        device: &Device,
        desc: BufferDescriptor,
        kind: OwnershipKind,
    ) -> Result<()> {
        if desc.device == 0 {
            return Err(InvalidDeviceHandle { handle: 0 }.into());
        }
        self.device_ref = Some(Arc::new(DeviceRef::new(device.clone(), desc, kind)));
        Ok(())
    }
    fn disarm_device_ref(&mut self) {
        if let Some(device_ref) = self.device_ref.take().and_then(Arc::into_inner) {
            device_ref.disarm();
        }
    }
    /// Releasing a crop leaves the data in the allocation it was cropped
    /// from, so only the last reference to a root allocation is checked.
    fn check_implicit_device_free(&self) {
        if let Some(device_ref) = self.device_ref.as_ref() {
            assert!(
                !(Arc::strong_count(device_ref) == 1
                    && !device_ref.ownership().is_cropped()
                    && self.host_alloc.is_some()
                    && self.flags.device_dirty),
                "Implicitly freeing a dirty device allocation while a host allocation still lives. \
                 Call device_free() explicitly if you want to drop dirty device-side data. \
                 Call copy_to_host() explicitly if you want the data copied to the host allocation \
                 before the device allocation is freed."
            );
        }
    }
    fn check_sole_device_ref(&self, device_ref: &Arc<DeviceRef>) {
        assert_eq!(
            Arc::strong_count(device_ref),
            1,
            "Multiple buffers share this device allocation. Releasing it would create dangling references."
        );
    }
    /// Allocates device memory on `device` for this shape.
    ///
    /// Does nothing if the buffer already has an allocation on `device`.
    pub fn device_malloc(&mut self, device: &Device) -> Result<()> {
        if self.device_ref.is_some() {
            return self.check_device(device);
        }
        self.check_overflow();
        let mut desc = self.descriptor();
        debug!(device = %device.name(), dims = ?self.dims, "device_malloc");
        device.interface().device_malloc(&mut desc)?;
        self.attach_device(device, desc, OwnershipKind::Allocated)
    }
    /// Drops this view's reference to its device allocation.
    ///
    /// Panics if this would free a dirty device allocation while host memory
    /// is still owned.
    pub fn device_deallocate(&mut self) {
        self.check_implicit_device_free();
        self.device_ref = None;
    }
    /// Frees the device allocation, discarding any data on the device that
    /// was not copied to the host.
    ///
    /// Panics unless this is the only reference to an allocation made with
    /// [`.device_malloc()`](Self::device_malloc).
    pub fn device_free(&mut self) -> Result<()> {
        let Some(device_ref) = self.device_ref.as_ref() else {
            return Ok(());
        };
        assert_eq!(
            device_ref.ownership(),
            DeviceOwnership::Allocated,
            "Can't call device_free on an unmanaged or wrapped native device handle. \
             Free the source allocation or call device_detach_native instead."
        );
        self.check_sole_device_ref(device_ref);
        let mut desc = self.descriptor();
        debug!(device = %device_ref.device().name(), handle = desc.device, "device_free");
        device_ref.device().interface().device_free(&mut desc)?;
        self.disarm_device_ref();
        self.flags.device_dirty = false;
        Ok(())
    }
    /// Copies device data to the host if the device is dirty.
    pub fn copy_to_host(&mut self) -> Result<()> {
        if !self.flags.device_dirty {
            return Ok(());
        }
        let device_ref = self.device_ref.as_ref().ok_or(NoDeviceAllocation)?;
        if self.host.is_null() {
            return Err(HostIsNull.into());
        }
        let mut desc = self.descriptor();
        debug!(device = %device_ref.device().name(), handle = desc.device, "copy_to_host");
        device_ref.device().interface().copy_to_host(&mut desc)?;
        self.flags.device_dirty = false;
        Ok(())
    }
    /// Copies host data to `device`, allocating there first if needed.
    ///
    /// Copies if the host is dirty or the allocation is new.
    pub fn copy_to_device(&mut self, device: &Device) -> Result<()> {
        self.check_device(device)?;
        let fresh = self.device_ref.is_none();
        if fresh {
            self.device_malloc(device)?;
        }
        if !(self.flags.host_dirty || (fresh && !self.host.is_null())) {
            return Ok(());
        }
        let result = if self.host.is_null() {
            Err(HostIsNull.into())
        } else {
            let mut desc = self.descriptor();
            debug!(device = %device.name(), handle = desc.device, "copy_to_device");
            device.interface().copy_to_device(&mut desc)
        };
        match result {
            Ok(()) => {
                self.flags.host_dirty = false;
                Ok(())
            }
            Err(e) => {
                if fresh {
                    self.device_ref = None;
                }
                Err(e)
            }
        }
    }
    /// Waits for outstanding device work on this buffer.
    pub fn device_sync(&self) -> Result<()> {
        if let Some(device_ref) = self.device_ref.as_ref() {
            let desc = self.descriptor();
            debug!(device = %device_ref.device().name(), handle = desc.device, "device_sync");
            device_ref.device().interface().device_sync(&desc)?;
        }
        Ok(())
    }
    /// Attaches a native handle, which is detached rather than freed when
    /// released.
    pub fn device_wrap_native(&mut self, device: &Device, handle: u64) -> Result<()> {
        assert!(
            self.device_ref.is_none(),
            "Cannot wrap a native handle, the buffer already has a device allocation!"
        );
        let mut desc = self.descriptor();
        debug!(device = %device.name(), handle, "wrap_native");
        device.interface().wrap_native(&mut desc, handle)?;
        self.attach_device(device, desc, OwnershipKind::WrappedNative)
    }
    /// Detaches a handle attached with
    /// [`.device_wrap_native()`](Self::device_wrap_native).
    pub fn device_detach_native(&mut self) -> Result<()> {
        let Some(device_ref) = self.device_ref.as_ref() else {
            return Ok(());
        };
        assert_eq!(
            device_ref.ownership(),
            DeviceOwnership::WrappedNative,
            "Only call device_detach_native on buffers wrapping a native device handle via device_wrap_native."
        );
        self.check_sole_device_ref(device_ref);
        let mut desc = self.descriptor();
        debug!(device = %device_ref.device().name(), handle = desc.device, "detach_native");
        device_ref.device().interface().detach_native(&mut desc)?;
        self.disarm_device_ref();
        Ok(())
    }
    /// Allocates host and device memory together on `device`, replacing any
    /// host memory referenced by this view.
    pub fn device_and_host_malloc(&mut self, device: &Device) -> Result<()> {
        assert!(
            self.device_ref.is_none(),
            "Cannot call device_and_host_malloc, the buffer already has a device allocation!"
        );
        self.check_overflow();
        let mut desc = self.descriptor();
        desc.host = 0;
        debug!(device = %device.name(), dims = ?self.dims, "device_and_host_malloc");
        device.interface().device_and_host_malloc(&mut desc)?;
        if desc.device == 0 {
            if let Err(e) = device.interface().device_and_host_free(&mut desc) {
                warn!(device = %device.name(), "device_and_host_free after null handle failed: {e}");
            }
            return Err(InvalidDeviceHandle { handle: 0 }.into());
        }
        let host = desc.host_ptr();
        self.attach_device(device, desc, OwnershipKind::AllocatedDeviceAndHost)?;
        self.host_alloc = None;
        self.host = host;
        self.flags = BufferFlags::default();
        Ok(())
    }
    /// Frees memory allocated with
    /// [`.device_and_host_malloc()`](Self::device_and_host_malloc).
    pub fn device_and_host_free(&mut self) -> Result<()> {
        let Some(device_ref) = self.device_ref.as_ref() else {
            return Ok(());
        };
        assert_eq!(
            device_ref.ownership(),
            DeviceOwnership::AllocatedDeviceAndHost,
            "Can only call device_and_host_free on buffers allocated with device_and_host_malloc."
        );
        self.check_sole_device_ref(device_ref);
        let mut desc = self.descriptor();
        debug!(device = %device_ref.device().name(), handle = desc.device, "device_and_host_free");
        device_ref.device().interface().device_and_host_free(&mut desc)?;
        self.disarm_device_ref();
        self.host = null_mut();
        self.flags = BufferFlags::default();
        Ok(())
    }
    /// Asserts that host memory may be read.
    pub(crate) fn check_host_readable(&self) {
        assert!(
            !self.flags.device_dirty,
            "Cannot access the host while the device is dirty. Call copy_to_host() first."
        );
        assert!(
            !self.host.is_null() || self.number_of_elements() == 0,
            "Cannot access the host memory of an unallocated buffer!"
        );
    }
    /// Pointer to the element at `pos`, which must be inside the buffer.
    pub(crate) fn address_of(&self, pos: &[i32]) -> *mut u8 {
        assert!(
            pos.len() <= self.dims.len(),
            "{} coordinates given for a buffer of rank {}!",
            pos.len(),
            self.dims.len()
        );
        assert!(
            self.contains(pos),
            "Coordinate {pos:?} out of bounds of {:?}!",
            self.dims
        );
        let offset = shape::offset_of(&self.dims, pos) * self.element_type.bytes() as isize;
        self.host.wrapping_offset(offset)
    }
    /// A view sharing host memory only.
    pub(crate) fn host_view(&self) -> Self {
        Self {
            dims: self.dims.clone(),
            element_type: self.element_type,
            host: self.host,
            flags: self.flags,
            device_ref: None,
            host_alloc: self.host_alloc.clone(),
        }
    }
}

impl Drop for RawBuffer {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.check_implicit_device_free();
        }
    }
}

impl std::fmt::Debug for RawBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawBuffer")
            .field("element_type", &self.element_type)
            .field("dims", &self.dims)
            .field("host", &self.host)
            .field("host_bytes", &self.host_alloc.as_ref().map(|x| x.len()))
            .field("device", &self.device_handle())
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceInterface;
    use std::{
        alloc::Layout,
        ptr::NonNull,
        sync::atomic::{AtomicUsize, Ordering},
    };

    #[derive(Debug)]
    struct Exhausted;

    impl HostAllocator for Exhausted {
        fn allocate(&self, _: Layout) -> Option<NonNull<u8>> {
            None
        }
        unsafe fn deallocate(&self, _: NonNull<u8>, _: Layout) {
            unreachable!()
        }
    }

    #[test]
    fn allocate_with_failure_leaves_buffer() {
        let mut b = RawBuffer::new(ElementType::of::<f32>(), &[4, 4]);
        let host = b.host_ptr();
        let e = b.allocate_with(Arc::new(Exhausted)).unwrap_err();
        assert_eq!(e.bytes, 64);
        assert_eq!(b.host_ptr(), host);
        assert!(b.owns_host_memory());
    }

    #[test]
    fn negative_stride_allocation() {
        let mut b = RawBuffer::with_dims(
            ElementType::of::<u16>(),
            [Dimension::new(0, 4, -1), Dimension::new(0, 2, 4)],
        );
        b.allocate();
        assert_eq!(b.begin(), -3);
        assert_eq!(b.size_in_bytes(), 16);
        assert_eq!(b.address_of(&[3, 0]) as usize % HOST_ALIGNMENT, 0);
    }

    #[test]
    fn bounds_query() {
        let b = RawBuffer::with_dims(ElementType::of::<u8>(), dense_dims(&[3, 2]));
        assert!(b.is_bounds_query());
        assert_eq!((b.width(), b.height(), b.channels()), (3, 2, 1));
        assert_eq!((b.left(), b.right(), b.top(), b.bottom()), (0, 2, 0, 1));
        assert!(!RawBuffer::make_scalar(ElementType::of::<u8>()).is_bounds_query());
    }

    #[test]
    #[should_panic(expected = "device is already dirty")]
    fn host_dirty_while_device_dirty() {
        let mut b = RawBuffer::new(ElementType::of::<u8>(), &[2]);
        b.set_device_dirty(true);
        b.set_host_dirty(true);
    }

    #[test]
    #[should_panic(expected = "spans too many bytes")]
    fn overflow() {
        let b = RawBuffer::with_dims(
            ElementType::of::<f64>(),
            [Dimension::new(0, i32::MAX, 1), Dimension::new(0, i32::MAX, i32::MAX)],
        );
        b.check_overflow();
    }

    #[test]
    fn from_vec_dense() {
        let b = RawBuffer::from_vec(vec![1u8, 2, 3, 4, 5, 6], &[3, 2]);
        assert!(b.owns_host_memory());
        assert_eq!(unsafe { *b.address_of(&[1, 1]) }, 5);
    }

    #[test]
    fn copy_to_host_without_device() {
        let mut b = RawBuffer::new(ElementType::of::<u8>(), &[2]);
        b.copy_to_host().unwrap();
        b.set_device_dirty(true);
        let e = b.copy_to_host().unwrap_err();
        assert!(e.downcast_ref::<NoDeviceAllocation>().is_some());
        b.set_device_dirty(false);
    }

    #[derive(Debug, Default)]
    struct NullHandle {
        frees: AtomicUsize,
    }

    impl DeviceInterface for NullHandle {
        fn name(&self) -> &str {
            "null_handle"
        }
        fn device_malloc(&self, buf: &mut BufferDescriptor) -> Result<()> {
            buf.device = 0;
            Ok(())
        }
        fn device_free(&self, buf: &mut BufferDescriptor) -> Result<()> {
            self.frees.fetch_add(1, Ordering::SeqCst);
            buf.device = 0;
            Ok(())
        }
        fn copy_to_host(&self, _: &mut BufferDescriptor) -> Result<()> {
            unreachable!()
        }
        fn copy_to_device(&self, _: &mut BufferDescriptor) -> Result<()> {
            unreachable!()
        }
    }

    #[test]
    fn device_and_host_malloc_null_handle_frees() {
        let interface = Arc::new(NullHandle::default());
        let device = Device::from_interface(interface.clone());
        let mut b = RawBuffer::new(ElementType::of::<u32>(), &[8, 2]);
        let host = b.host_ptr();
        let e = b.device_and_host_malloc(&device).unwrap_err();
        assert!(e.downcast_ref::<InvalidDeviceHandle>().is_some());
        assert_eq!(interface.frees.load(Ordering::SeqCst), 1);
        assert!(b.device().is_none());
        assert_eq!(b.host_ptr(), host);
        assert!(b.owns_host_memory());
    }
}
