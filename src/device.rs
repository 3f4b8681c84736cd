use crate::{descriptor::BufferDescriptor, result::Result, shape};
use serde::{Deserialize, Serialize};
use std::{
    alloc::Layout,
    fmt::{self, Debug},
    ptr::NonNull,
    sync::Arc,
};

#[cfg(feature = "emulated")]
mod emulated_engine;
#[cfg(feature = "emulated")]
pub use emulated_engine::EmulatedDevice;

pub mod error {
    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Out of device memory: requested {requested} bytes with {available} available!")]
    pub struct OutOfDeviceMemory {
        pub requested: usize,
        pub available: usize,
    }

    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("Invalid device handle {handle:#x}!")]
    pub struct InvalidDeviceHandle {
        pub handle: u64,
    }

    #[derive(Clone, Debug, thiserror::Error)]
    #[error("{device} does not support {op}!")]
    pub struct DeviceOperationUnsupported {
        pub device: String,
        pub op: &'static str,
    }

    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("The buffer has no host memory!")]
    pub struct HostIsNull;

    #[derive(Clone, Copy, Debug, thiserror::Error)]
    #[error("The buffer has no device allocation!")]
    pub struct NoDeviceAllocation;

    #[derive(Clone, Debug, thiserror::Error)]
    #[error("The buffer is attached to {attached}, not {requested}!")]
    pub struct DeviceInterfaceMismatch {
        pub attached: String,
        pub requested: String,
    }
}
use error::*;

#[cfg(feature = "emulated")]
pub mod builder {
    use super::*;
    use emulated_engine::EmulatedOptions;

    /// Configures an [`EmulatedDevice`].
    pub struct DeviceBuilder {
        pub(super) options: EmulatedOptions,
    }

    impl DeviceBuilder {
        pub fn name(self, name: impl Into<String>) -> Self {
            let mut this = self;
            this.options.name = name.into();
            this
        }
        /// Allocations that would exceed `bytes` in total fail with
        /// [`OutOfDeviceMemory`](super::error::OutOfDeviceMemory).
        pub fn memory_limit(self, bytes: usize) -> Self {
            let mut this = self;
            this.options.memory_limit = Some(bytes);
            this
        }
        /// Whether the device supports cropping and slicing allocations.
        pub fn crop(self, crop: bool) -> Self {
            let mut this = self;
            this.options.crop = crop;
            this
        }
        pub fn build(self) -> Result<Device> {
            let engine = EmulatedDevice::new(self.options)?;
            Ok(Device {
                inner: DeviceInner::Emulated(engine),
            })
        }
    }
}
#[cfg(feature = "emulated")]
use builder::DeviceBuilder;

/// How the device allocation of a buffer is released when the last reference
/// to it goes away.
#[derive(
    Clone, Copy, Eq, PartialEq, Hash, Debug, derive_more::IsVariant, Serialize, Deserialize,
)]
pub enum DeviceOwnership {
    /// Freed with [`DeviceInterface::device_free`].
    Allocated,
    /// Detached with [`DeviceInterface::detach_native`]. The memory belongs to
    /// someone else.
    WrappedNative,
    /// Never released.
    Unmanaged,
    /// Freed with [`DeviceInterface::device_and_host_free`].
    AllocatedDeviceAndHost,
    /// Released with [`DeviceInterface::device_release_crop`], after which the
    /// buffer it was cropped or sliced from is released.
    Cropped,
}

/// Device memory primitives supplied by a backend.
///
/// All methods operate on the flat [`BufferDescriptor`] of a buffer.
/// Implementations move data and set or clear `device` (and `host`, for the
/// combined allocation calls). The dirty flags are maintained by the caller.
///
/// Methods are blocking. Any asynchronous work must be complete, or ordered
/// before subsequent calls, when they return.
pub trait DeviceInterface: Send + Sync + Debug {
    fn name(&self) -> &str;
    /// Allocates device memory for the shape of `buf` and stores the handle
    /// in `buf.device`.
    fn device_malloc(&self, buf: &mut BufferDescriptor) -> Result<()>;
    /// Frees the allocation `buf.device` and sets it to 0.
    fn device_free(&self, buf: &mut BufferDescriptor) -> Result<()>;
    /// Copies every element of `buf` from device memory into `buf.host`.
    fn copy_to_host(&self, buf: &mut BufferDescriptor) -> Result<()>;
    /// Copies every element of `buf` from `buf.host` into device memory.
    fn copy_to_device(&self, buf: &mut BufferDescriptor) -> Result<()>;
    /// Waits for outstanding work on `buf`.
    fn device_sync(&self, buf: &BufferDescriptor) -> Result<()> {
        let _ = buf;
        Ok(())
    }
    /// Creates a handle for `dst`, which has the shape of a crop of `src`,
    /// aliasing the memory of `src`.
    fn device_crop(&self, src: &BufferDescriptor, dst: &mut BufferDescriptor) -> Result<()> {
        let _ = (src, dst);
        Err(self.unsupported("device_crop"))
    }
    /// Like [`.device_crop()`](Self::device_crop), where `dst` is `src`
    /// sliced at `pos` along `dim`.
    fn device_slice(
        &self,
        src: &BufferDescriptor,
        dim: usize,
        pos: i32,
        dst: &mut BufferDescriptor,
    ) -> Result<()> {
        let _ = (src, dim, pos, dst);
        Err(self.unsupported("device_slice"))
    }
    /// Releases a handle created by [`.device_crop()`](Self::device_crop) or
    /// [`.device_slice()`](Self::device_slice).
    fn device_release_crop(&self, buf: &mut BufferDescriptor) -> Result<()> {
        let _ = buf;
        Err(self.unsupported("device_release_crop"))
    }
    /// Attaches a native handle to `buf` without taking ownership of it.
    fn wrap_native(&self, buf: &mut BufferDescriptor, handle: u64) -> Result<()> {
        let _ = (buf, handle);
        Err(self.unsupported("wrap_native"))
    }
    /// Detaches a native handle from `buf` without releasing it.
    fn detach_native(&self, buf: &mut BufferDescriptor) -> Result<()> {
        let _ = buf;
        Err(self.unsupported("detach_native"))
    }
    /// Allocates host and device memory together.
    ///
    /// The default allocates host memory separately and then calls
    /// [`.device_malloc()`](Self::device_malloc).
    fn device_and_host_malloc(&self, buf: &mut BufferDescriptor) -> Result<()> {
        let layout = host_layout(buf);
        let base = if layout.size() > 0 {
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            NonNull::new(ptr).ok_or(crate::buffer::error::OutOfHostMemory {
                bytes: layout.size(),
            })?
        } else {
            NonNull::dangling()
        };
        let begin = shape::begin_offset(&buf.dims) * buf.element_type.bytes() as isize;
        buf.set_host_ptr(base.as_ptr().wrapping_offset(-begin));
        if let Err(e) = self.device_malloc(buf) {
            if layout.size() > 0 {
                unsafe {
                    std::alloc::dealloc(base.as_ptr(), layout);
                }
            }
            buf.host = 0;
            return Err(e);
        }
        Ok(())
    }
    /// Frees memory allocated with
    /// [`.device_and_host_malloc()`](Self::device_and_host_malloc).
    fn device_and_host_free(&self, buf: &mut BufferDescriptor) -> Result<()> {
        self.device_free(buf)?;
        let layout = host_layout(buf);
        if layout.size() > 0 && buf.host != 0 {
            let begin = shape::begin_offset(&buf.dims) * buf.element_type.bytes() as isize;
            let base = buf.host_ptr().wrapping_offset(begin);
            unsafe {
                std::alloc::dealloc(base, layout);
            }
        }
        buf.host = 0;
        Ok(())
    }
    #[doc(hidden)]
    fn unsupported(&self, op: &'static str) -> anyhow::Error {
        DeviceOperationUnsupported {
            device: self.name().to_string(),
            op,
        }
        .into()
    }
}

fn host_layout(buf: &BufferDescriptor) -> Layout {
    let size = buf.size_in_bytes();
    let size = (size + crate::buffer::HOST_ALIGNMENT - 1) / crate::buffer::HOST_ALIGNMENT
        * crate::buffer::HOST_ALIGNMENT;
    Layout::from_size_align(size, crate::buffer::HOST_ALIGNMENT).unwrap_or_else(|_| {
        panic!("Buffer of {size} bytes is too large to allocate!");
    })
}

/// A handle to a device interface.
///
/// Cheap to clone. Two devices are equal if they share the same interface.
#[derive(Clone)]
pub struct Device {
    inner: DeviceInner,
}

impl Device {
    /// Wraps a custom backend.
    pub fn new(interface: impl DeviceInterface + 'static) -> Self {
        Self::from_interface(Arc::new(interface))
    }
    pub fn from_interface(interface: Arc<dyn DeviceInterface>) -> Self {
        Self {
            inner: DeviceInner::Interface(interface),
        }
    }
    /// A builder for an [`EmulatedDevice`].
    #[cfg(feature = "emulated")]
    pub fn builder() -> DeviceBuilder {
        DeviceBuilder {
            options: Default::default(),
        }
    }
    pub fn interface(&self) -> &dyn DeviceInterface {
        match &self.inner {
            #[cfg(feature = "emulated")]
            DeviceInner::Emulated(engine) => engine.as_ref(),
            DeviceInner::Interface(interface) => interface.as_ref(),
        }
    }
    pub fn name(&self) -> &str {
        self.interface().name()
    }
    #[cfg(feature = "emulated")]
    pub fn as_emulated(&self) -> Option<&Arc<EmulatedDevice>> {
        match &self.inner {
            DeviceInner::Emulated(engine) => Some(engine),
            DeviceInner::Interface(_) => None,
        }
    }
    fn addr(&self) -> *const () {
        self.interface() as *const dyn DeviceInterface as *const ()
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for Device {}

impl Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Device")
            .field(&self.name())
            .field(&self.addr())
            .finish()
    }
}

#[cfg(feature = "emulated")]
impl From<Arc<EmulatedDevice>> for Device {
    fn from(engine: Arc<EmulatedDevice>) -> Self {
        Self {
            inner: DeviceInner::Emulated(engine),
        }
    }
}

#[derive(Clone)]
enum DeviceInner {
    #[cfg(feature = "emulated")]
    Emulated(Arc<EmulatedDevice>),
    Interface(Arc<dyn DeviceInterface>),
}
