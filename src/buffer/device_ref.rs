use super::RawBuffer;
use crate::{
    descriptor::BufferDescriptor,
    device::{Device, DeviceOwnership},
    result::Result,
};
use tracing::{debug, warn};

pub(super) enum OwnershipKind {
    Allocated,
    WrappedNative,
    Unmanaged,
    AllocatedDeviceAndHost,
    /// Keeps the buffer the crop was taken from, and with it the parent
    /// allocation, alive.
    Cropped(Box<RawBuffer>),
}

impl OwnershipKind {
    fn ownership(&self) -> DeviceOwnership {
        match self {
            Self::Allocated => DeviceOwnership::Allocated,
            Self::WrappedNative => DeviceOwnership::WrappedNative,
            Self::Unmanaged => DeviceOwnership::Unmanaged,
            Self::AllocatedDeviceAndHost => DeviceOwnership::AllocatedDeviceAndHost,
            Self::Cropped(_) => DeviceOwnership::Cropped,
        }
    }
}

/// Shared owner of a device handle.
///
/// Every view aliasing the handle holds the same `Arc<DeviceRef>`. When the
/// last one is dropped the handle is released according to its ownership.
pub(super) struct DeviceRef {
    device: Device,
    desc: BufferDescriptor,
    kind: OwnershipKind,
    released: bool,
}

impl DeviceRef {
    pub(super) fn new(device: Device, desc: BufferDescriptor, kind: OwnershipKind) -> Self {
        Self {
            device,
            desc,
            kind,
            released: false,
        }
    }
    pub(super) fn device(&self) -> &Device {
        &self.device
    }
    pub(super) fn handle(&self) -> u64 {
        self.desc.device
    }
    pub(super) fn ownership(&self) -> DeviceOwnership {
        self.kind.ownership()
    }
    /// The buffer this was cropped from, if any.
    pub(super) fn cropped_from(&self) -> Option<&RawBuffer> {
        match &self.kind {
            OwnershipKind::Cropped(parent) => Some(parent),
            _ => None,
        }
    }
    /// Marks the handle as already released, so that dropping does nothing.
    pub(super) fn disarm(mut self) {
        self.released = true;
    }
    fn release(&mut self) -> Result<()> {
        let interface = self.device.interface();
        let desc = &mut self.desc;
        debug!(
            device = %self.device.name(),
            handle = desc.device,
            ownership = ?self.kind.ownership(),
            "release device allocation"
        );
        match &self.kind {
            OwnershipKind::Allocated => interface.device_free(desc),
            OwnershipKind::WrappedNative => interface.detach_native(desc),
            OwnershipKind::Unmanaged => Ok(()),
            OwnershipKind::AllocatedDeviceAndHost => interface.device_and_host_free(desc),
            OwnershipKind::Cropped(_) => interface.device_release_crop(desc),
        }
    }
}

impl Drop for DeviceRef {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.release() {
            warn!(
                device = %self.device.name(),
                handle = self.desc.device,
                error = %e,
                "failed to release device allocation"
            );
        }
        // A cropped parent is dropped after this, releasing the ancestors in
        // order.
    }
}
