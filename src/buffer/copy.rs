use super::RawBuffer;
use crate::scalar::ElementType;
use dry::macro_for;
use smallvec::SmallVec;
use std::mem::size_of;

impl RawBuffer {
    /// An allocated buffer with the shape of `src`, with dense strides nested
    /// in the same order as those of `src`.
    pub fn make_with_shape_of(src: &RawBuffer) -> Self {
        Self::make_with_shape_and_type_of(src, src.element_type)
    }
    pub(super) fn make_with_shape_and_type_of(src: &RawBuffer, element_type: ElementType) -> Self {
        let mut dims = src.dims.clone();
        let mut order: SmallVec<[usize; 4]> = (0..dims.len()).collect();
        order.sort_by_key(|&i| dims[i].stride.unsigned_abs());
        let mut stride = 1;
        for i in order {
            dims[i].stride = stride;
            stride *= dims[i].extent;
        }
        let mut buffer = Self::with_dims(element_type, dims);
        buffer.allocate();
        buffer
    }
    /// A dense copy of the host data, with its own allocation.
    pub fn copy(&self) -> Self {
        let mut dst = Self::make_with_shape_of(self);
        dst.copy_from(self);
        dst
    }
    /// Copies the elements of `src` where it overlaps this buffer.
    ///
    /// Both buffers must have the same rank and element size, and neither may
    /// be device dirty.
    pub fn copy_from(&mut self, src: &RawBuffer) {
        assert!(
            !src.device_dirty(),
            "Cannot copy from a buffer that is device dirty. Call copy_to_host() first."
        );
        assert!(
            !self.device_dirty(),
            "Cannot copy into a buffer that is device dirty. Call copy_to_host() first."
        );
        assert_eq!(
            src.dimensions(),
            self.dimensions(),
            "Cannot copy between buffers of different rank!"
        );
        assert_eq!(
            src.element_type.bytes(),
            self.element_type.bytes(),
            "Cannot copy {} elements into {} elements!",
            src.element_type,
            self.element_type
        );
        let mut src = src.host_view();
        let mut dst = self.host_view();
        for i in 0..dst.dimensions() {
            let (a, b) = (dst.dims[i], src.dims[i]);
            let min = a.min.max(b.min);
            let max = a.max().min(b.max());
            if max < min {
                return;
            }
            dst.crop_host(i, min, max - min + 1);
            src.crop_host(i, min, max - min + 1);
        }
        copy_elements(&dst, &src);
        self.set_host_dirty(true);
    }
    /// A copy with channels innermost, for a 3 dimensional buffer.
    pub fn copy_to_interleaved(&self) -> Self {
        assert_eq!(self.dimensions(), 3, "Only 3 dimensional buffers can be interleaved!");
        let mut dst = Self::make_interleaved(
            self.element_type,
            self.width(),
            self.height(),
            self.channels(),
        );
        dst.set_min(&[self.dims[0].min, self.dims[1].min, self.dims[2].min]);
        dst.copy_from(self);
        dst
    }
    /// A copy with the first dimension innermost and the last outermost.
    pub fn copy_to_planar(&self) -> Self {
        let extents: SmallVec<[i32; 4]> = self.dims.iter().map(|dim| dim.extent).collect();
        let mins: SmallVec<[i32; 4]> = self.dims.iter().map(|dim| dim.min).collect();
        let mut dst = Self::new(self.element_type, &extents);
        dst.set_min(&mins);
        dst.copy_from(self);
        dst
    }
}

/// Copies element by element, dispatched on the element width.
fn copy_elements(dst: &RawBuffer, src: &RawBuffer) {
    let width = dst.element_type.bytes();
    macro_for!($T in [u8, u16, u32, u64] {
        if width == size_of::<$T>() {
            RawBuffer::for_each_value_raw([dst, src], |[d, s]| unsafe {
                (d as *mut $T).write_unaligned((s as *const $T).read_unaligned());
            });
            return;
        }
    });
    RawBuffer::for_each_value_raw([dst, src], |[d, s]| unsafe {
        std::ptr::copy(s as *const u8, d, width);
    });
}
