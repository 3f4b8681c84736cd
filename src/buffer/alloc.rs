use once_cell::sync::Lazy;
use std::{alloc::Layout, fmt::Debug, ptr::NonNull, sync::Arc};
use tracing::trace;

/// Alignment in bytes of host allocations made by buffers.
pub const HOST_ALIGNMENT: usize = 128;

/// Source of host memory for buffers.
pub trait HostAllocator: Send + Sync + Debug {
    /// Returns `None` if the memory could not be allocated.
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>>;
    /// # Safety
    /// `ptr` must have been returned by [`.allocate()`](Self::allocate) on
    /// this allocator with the same `layout`, and not yet deallocated.
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Allocates with the global allocator.
#[derive(Clone, Copy, Default, Debug)]
pub struct SystemAllocator;

impl HostAllocator for SystemAllocator {
    fn allocate(&self, layout: Layout) -> Option<NonNull<u8>> {
        NonNull::new(unsafe { std::alloc::alloc(layout) })
    }
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe {
            std::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }
}

pub(super) static SYSTEM_ALLOCATOR: Lazy<Arc<dyn HostAllocator>> =
    Lazy::new(|| Arc::new(SystemAllocator));

type DeallocateFn = Box<dyn FnOnce(NonNull<u8>) + Send + Sync>;

/// Shared owner of host memory.
///
/// Buffers hold it behind an `Arc`, so the memory is released by whichever
/// view drops the last reference.
pub(super) struct HostAllocation {
    ptr: NonNull<u8>,
    len: usize,
    deallocate: Option<DeallocateFn>,
}

unsafe impl Send for HostAllocation {}
unsafe impl Sync for HostAllocation {}

impl HostAllocation {
    /// Allocates `len` zeroed bytes.
    pub(super) fn new(allocator: Arc<dyn HostAllocator>, len: usize) -> Option<Self> {
        let layout = Layout::from_size_align(len.max(1), HOST_ALIGNMENT).ok()?;
        let layout = layout.pad_to_align();
        let ptr = allocator.allocate(layout)?;
        unsafe {
            ptr.as_ptr().write_bytes(0, layout.size());
        }
        trace!(ptr = ?ptr, len = layout.size(), "host allocate");
        Some(Self {
            ptr,
            len: layout.size(),
            deallocate: Some(Box::new(move |ptr| unsafe {
                allocator.deallocate(ptr, layout);
            })),
        })
    }
    /// Takes ownership of the memory of `vec`.
    pub(super) fn from_vec<T: Send + Sync + 'static>(vec: Vec<T>) -> Self {
        let mut vec = std::mem::ManuallyDrop::new(vec);
        let (len, cap) = (vec.len(), vec.capacity());
        let ptr = NonNull::new(vec.as_mut_ptr() as *mut u8).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len: len * std::mem::size_of::<T>(),
            deallocate: Some(Box::new(move |ptr| unsafe {
                drop(Vec::from_raw_parts(ptr.as_ptr() as *mut T, len, cap));
            })),
        }
    }
    pub(super) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
    pub(super) fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        if let Some(deallocate) = self.deallocate.take() {
            trace!(ptr = ?self.ptr, len = self.len, "host deallocate");
            deallocate(self.ptr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_and_zeroed() {
        let alloc = HostAllocation::new(SYSTEM_ALLOCATOR.clone(), 300).unwrap();
        assert_eq!(alloc.as_ptr() as usize % HOST_ALIGNMENT, 0);
        assert_eq!(alloc.len(), 384);
        let bytes = unsafe { std::slice::from_raw_parts(alloc.as_ptr(), alloc.len()) };
        assert!(bytes.iter().all(|x| *x == 0));
    }

    #[test]
    fn from_vec_keeps_data() {
        let alloc = HostAllocation::from_vec(vec![1u32, 2, 3]);
        assert_eq!(alloc.len(), 12);
        let values = unsafe { std::slice::from_raw_parts(alloc.as_ptr() as *const u32, 3) };
        assert_eq!(values, [1, 2, 3]);
    }
}
