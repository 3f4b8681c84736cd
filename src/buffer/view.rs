use super::{DeviceRef, OwnershipKind, RawBuffer};
use crate::{descriptor::BufferDescriptor, device::DeviceInterface, result::Result, shape::Dimension};
use std::{ptr::null_mut, sync::Arc};
use tracing::{debug, warn};

impl RawBuffer {
    fn check_dim(&self, d: usize) {
        assert!(
            d < self.dims.len(),
            "Dimension {d} out of range for a buffer of rank {}!",
            self.dims.len()
        );
    }
    pub(super) fn crop_host(&mut self, d: usize, min: i32, extent: i32) {
        self.check_dim(d);
        let dim = self.dims[d];
        assert!(
            extent >= 0 && min >= dim.min && min as i64 + extent as i64 <= dim.min as i64 + dim.extent as i64,
            "Crop [{min}, {}] of dimension {d} is outside of [{}, {}]!",
            min as i64 + extent as i64 - 1,
            dim.min,
            dim.max()
        );
        let shift = (min - dim.min) as isize;
        if !self.host.is_null() {
            let offset = shift * dim.stride as isize * self.element_type.bytes() as isize;
            self.host = self.host.wrapping_offset(offset);
        }
        self.dims[d].min = min;
        self.dims[d].extent = extent;
    }
    fn slice_host(&mut self, d: usize, pos: i32) {
        self.check_dim(d);
        let dim = self.dims[d];
        assert!(
            dim.contains(pos),
            "Slice at {pos} of dimension {d} is outside of [{}, {}]!",
            dim.min,
            dim.max()
        );
        let shift = (pos - dim.min) as isize;
        if !self.host.is_null() {
            let offset = shift * dim.stride as isize * self.element_type.bytes() as isize;
            self.host = self.host.wrapping_offset(offset);
        }
        self.dims.remove(d);
    }
    /// Attaches a device handle for `result`, created by `op` from this
    /// buffer's handle, keeping the root of the crop chain alive.
    ///
    /// On failure `result` is left without a device allocation.
    fn complete_device_crop(
        &self,
        result: &mut RawBuffer,
        op: &str,
        f: impl FnOnce(&dyn DeviceInterface, &BufferDescriptor, &mut BufferDescriptor) -> Result<()>,
    ) {
        let Some(device_ref) = self.device_ref.as_ref() else {
            return;
        };
        let device = device_ref.device();
        let src = self.descriptor();
        let mut dst = result.descriptor();
        match f(device.interface(), &src, &mut dst) {
            Ok(()) if dst.device != 0 => {
                debug!(device = %device.name(), parent = src.device, handle = dst.device, "{op}");
                let mut parent = match device_ref.cropped_from() {
                    Some(parent) => parent.clone(),
                    None => self.clone(),
                };
                parent.host_alloc = None;
                parent.host = null_mut();
                parent.flags = Default::default();
                let kind = OwnershipKind::Cropped(Box::new(parent));
                result.device_ref = Some(Arc::new(DeviceRef::new(device.clone(), dst, kind)));
            }
            Ok(()) => {
                warn!(device = %device.name(), "{op} returned no handle, continuing without a device allocation");
            }
            Err(e) => {
                warn!(device = %device.name(), error = %e, "{op} failed, continuing without a device allocation");
            }
        }
    }
    /// Replaces this view with `result`, made from it by a device crop or
    /// slice.
    ///
    /// If the crop attached no handle, this view's reference is released
    /// without the dirty check, as `result` already reports the device data
    /// as missing.
    fn replace_with_crop(&mut self, result: RawBuffer) {
        if result.device_ref.is_none() {
            if let Some(device_ref) = self.device_ref.take() {
                if self.flags.device_dirty && Arc::strong_count(&device_ref) == 1 {
                    warn!(
                        device = %device_ref.device().name(),
                        handle = device_ref.handle(),
                        "releasing a dirty device allocation after a failed crop"
                    );
                }
            }
        }
        *self = result;
    }
    /// Like [`.crop()`](Self::crop), returning a new view.
    pub fn cropped(&self, d: usize, min: i32, extent: i32) -> Self {
        let mut result = self.clone();
        result.device_ref = None;
        result.crop_host(d, min, extent);
        self.complete_device_crop(&mut result, "device_crop", |interface, src, dst| {
            interface.device_crop(src, dst)
        });
        result
    }
    /// Restricts dimension `d` to `[min, min + extent)`, which must be inside
    /// the current bounds.
    ///
    /// A device allocation is cropped as well, keeping the allocation it was
    /// cropped from alive. If the device cannot crop, this view continues
    /// without a device allocation.
    pub fn crop(&mut self, d: usize, min: i32, extent: i32) {
        if self.device_ref.is_some() {
            let result = self.cropped(d, min, extent);
            self.replace_with_crop(result);
        } else {
            self.crop_host(d, min, extent);
        }
    }
    /// Like [`.crop_rect()`](Self::crop_rect), returning a new view.
    pub fn cropped_rect(&self, rect: &[(i32, i32)]) -> Self {
        assert!(
            rect.len() <= self.dims.len(),
            "Crop of {} dimensions of a buffer of rank {}!",
            rect.len(),
            self.dims.len()
        );
        let mut result = self.clone();
        result.device_ref = None;
        for (d, &(min, extent)) in rect.iter().enumerate() {
            result.crop_host(d, min, extent);
        }
        self.complete_device_crop(&mut result, "device_crop", |interface, src, dst| {
            interface.device_crop(src, dst)
        });
        result
    }
    /// Crops the leading dimensions to the `(min, extent)` pairs of `rect`.
    pub fn crop_rect(&mut self, rect: &[(i32, i32)]) {
        if self.device_ref.is_some() {
            let result = self.cropped_rect(rect);
            self.replace_with_crop(result);
        } else {
            assert!(
                rect.len() <= self.dims.len(),
                "Crop of {} dimensions of a buffer of rank {}!",
                rect.len(),
                self.dims.len()
            );
            for (d, &(min, extent)) in rect.iter().enumerate() {
                self.crop_host(d, min, extent);
            }
        }
    }
    /// Like [`.slice()`](Self::slice), returning a new view.
    pub fn sliced(&self, d: usize, pos: i32) -> Self {
        let mut result = self.clone();
        result.device_ref = None;
        result.slice_host(d, pos);
        self.complete_device_crop(&mut result, "device_slice", |interface, src, dst| {
            interface.device_slice(src, d, pos, dst)
        });
        result
    }
    /// Removes dimension `d`, fixing its coordinate at `pos`.
    pub fn slice(&mut self, d: usize, pos: i32) {
        if self.device_ref.is_some() {
            let result = self.sliced(d, pos);
            self.replace_with_crop(result);
        } else {
            self.slice_host(d, pos);
        }
    }
    /// Swaps dimensions `d1` and `d2`.
    pub fn transpose(&mut self, d1: usize, d2: usize) {
        self.check_dim(d1);
        self.check_dim(d2);
        self.dims.swap(d1, d2);
    }
    pub fn transposed(&self, d1: usize, d2: usize) -> Self {
        let mut result = self.clone();
        result.transpose(d1, d2);
        result
    }
    /// Reorders all dimensions, dimension `i` moving to position `order[i]`.
    pub fn permute(&mut self, order: &[usize]) {
        assert_eq!(
            order.len(),
            self.dims.len(),
            "Permutation {order:?} does not match rank {}!",
            self.dims.len()
        );
        let mut seen = vec![false; order.len()];
        for &i in order {
            assert!(
                i < order.len() && !std::mem::replace(&mut seen[i], true),
                "{order:?} is not a permutation!"
            );
        }
        let mut sorted = order.to_vec();
        for i in 1..sorted.len() {
            let mut j = i;
            while j > 0 && sorted[j - 1] > sorted[j] {
                sorted.swap(j - 1, j);
                self.transpose(j, j - 1);
                j -= 1;
            }
        }
    }
    pub fn permuted(&self, order: &[usize]) -> Self {
        let mut result = self.clone();
        result.permute(order);
        result
    }
    /// Shifts the coordinates of dimension `d` by `delta`.
    ///
    /// The device allocation, if any, is dropped from this view.
    pub fn translate(&mut self, d: usize, delta: i32) {
        self.check_dim(d);
        self.device_deallocate();
        self.dims[d].min += delta;
    }
    pub fn translated(&self, d: usize, delta: i32) -> Self {
        let mut result = self.clone();
        result.translate(d, delta);
        result
    }
    /// Shifts the leading dimensions by `deltas`.
    pub fn translate_all(&mut self, deltas: &[i32]) {
        assert!(
            deltas.len() <= self.dims.len(),
            "{} deltas for a buffer of rank {}!",
            deltas.len(),
            self.dims.len()
        );
        self.device_deallocate();
        for (dim, delta) in self.dims.iter_mut().zip(deltas) {
            dim.min += delta;
        }
    }
    /// Moves the min coordinate of the leading dimensions to `mins`.
    pub fn set_min(&mut self, mins: &[i32]) {
        assert!(
            mins.len() <= self.dims.len(),
            "{} mins for a buffer of rank {}!",
            mins.len(),
            self.dims.len()
        );
        self.device_deallocate();
        for (dim, min) in self.dims.iter_mut().zip(mins) {
            dim.min = *min;
        }
    }
    /// Appends a dimension of extent 1, strided past the current last one.
    pub fn add_dimension(&mut self) {
        let stride = match self.dims.last() {
            Some(dim) => dim.extent * dim.stride,
            None => 1,
        };
        self.add_dimension_with_stride(stride);
    }
    pub fn add_dimension_with_stride(&mut self, stride: i32) {
        self.dims.push(Dimension::new(0, 1, stride));
    }
    /// Inserts a dimension of extent 1 at `d`, whose only coordinate is `pos`.
    pub fn embed(&mut self, d: usize, pos: i32) {
        assert!(
            d <= self.dims.len(),
            "Cannot embed at {d} in a buffer of rank {}!",
            self.dims.len()
        );
        self.add_dimension();
        let last = self.dims.len() - 1;
        self.dims[last].min = pos;
        for i in (d + 1..=last).rev() {
            self.transpose(i, i - 1);
        }
    }
    pub fn embedded(&self, d: usize, pos: i32) -> Self {
        let mut result = self.clone();
        result.embed(d, pos);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scalar::ElementType;
    use proptest::prelude::*;

    fn buffer(extents: &[i32]) -> RawBuffer {
        RawBuffer::new(ElementType::of::<f32>(), extents)
    }

    #[test]
    fn crop_shifts_host() {
        let b = buffer(&[10, 8]);
        let c = b.cropped(1, 2, 3);
        assert_eq!(c.dim(1), Dimension::new(2, 3, 10));
        assert_eq!(c.dim(0), b.dim(0));
        assert_eq!(c.host_ptr() as usize - b.host_ptr() as usize, 2 * 10 * 4);
        assert_eq!(c.address_of(&[0, 2]), b.address_of(&[0, 2]));
    }

    #[test]
    #[should_panic(expected = "outside of")]
    fn crop_outward() {
        let b = buffer(&[10, 8]);
        b.cropped(0, -1, 4);
    }

    #[test]
    fn slice_drops_dim() {
        let b = buffer(&[4, 5, 3]);
        let s = b.sliced(1, 2);
        assert_eq!(s.dimensions(), 2);
        assert_eq!(s.dims(), &[b.dim(0), b.dim(2)]);
        assert_eq!(s.address_of(&[1, 2]), b.address_of(&[1, 2, 2]));
    }

    #[test]
    fn permute_moves_dims() {
        let b = buffer(&[2, 3, 4]);
        let p = b.permuted(&[2, 0, 1]);
        assert_eq!(p.dims(), &[b.dim(1), b.dim(2), b.dim(0)]);
        let q = b.permuted(&[0, 1, 2]);
        assert_eq!(q.dims(), b.dims());
    }

    #[test]
    fn embed_inserts_dim() {
        let b = buffer(&[4, 5]);
        let e = b.embedded(1, 7);
        assert_eq!(e.dimensions(), 3);
        assert_eq!(e.dim(0), b.dim(0));
        assert_eq!(e.dim(1), Dimension::new(7, 1, 20));
        assert_eq!(e.dim(2), b.dim(1));
        assert_eq!(e.address_of(&[3, 7, 4]), b.address_of(&[3, 4]));
    }

    #[test]
    fn add_dimension_to_scalar() {
        let mut b = RawBuffer::make_scalar(ElementType::of::<u8>());
        b.add_dimension();
        assert_eq!(b.dims(), &[Dimension::new(0, 1, 1)]);
    }

    #[test]
    fn translate_round_trip() {
        let b = buffer(&[6, 6]);
        let mut c = b.cropped(0, 2, 3).translated(0, -2);
        assert_eq!(c.dim(0).min, 0);
        assert_eq!(c.address_of(&[0, 1]), b.address_of(&[2, 1]));
        c.translate(0, 2);
        assert_eq!(c.address_of(&[2, 1]), b.address_of(&[2, 1]));
    }

    #[test]
    fn crop_rect_leading_dims() {
        let b = buffer(&[10, 8, 3]);
        let c = b.cropped_rect(&[(2, 5), (1, 4)]);
        assert_eq!(c.dim(0), Dimension::new(2, 5, 1));
        assert_eq!(c.dim(1), Dimension::new(1, 4, 10));
        assert_eq!(c.dim(2), b.dim(2));
        assert_eq!(c.address_of(&[2, 1, 2]), b.address_of(&[2, 1, 2]));
        let mut d = b.clone();
        d.crop_rect(&[(2, 5), (1, 4)]);
        assert_eq!(d.dims(), c.dims());
        assert_eq!(d.host_ptr(), c.host_ptr());
    }

    #[test]
    #[should_panic(expected = "Crop of 3 dimensions of a buffer of rank 2")]
    fn crop_rect_above_rank() {
        let mut b = buffer(&[4, 4]);
        b.crop_rect(&[(0, 1), (0, 1), (0, 1)]);
    }

    #[test]
    fn translate_all_leading_dims() {
        let b = buffer(&[4, 3, 2]);
        let mut t = b.clone();
        t.translate_all(&[5, -1]);
        assert_eq!(t.dim(0).min, 5);
        assert_eq!(t.dim(1).min, -1);
        assert_eq!(t.dim(2), b.dim(2));
        assert_eq!(t.address_of(&[8, 1, 1]), b.address_of(&[3, 2, 1]));
    }

    #[test]
    fn set_min_leading_dims() {
        let b = buffer(&[4, 3]).cropped(0, 1, 2);
        let mut m = b.clone();
        m.set_min(&[10]);
        assert_eq!(m.dim(0), Dimension::new(10, 2, 1));
        assert_eq!(m.dim(1), b.dim(1));
        assert_eq!(m.address_of(&[11, 2]), b.address_of(&[2, 2]));
    }

    #[test]
    #[should_panic(expected = "3 mins for a buffer of rank 2")]
    fn set_min_above_rank() {
        let mut b = buffer(&[4, 4]);
        b.set_min(&[0, 0, 0]);
    }

    proptest! {
        #[test]
        fn crop_translate_round_trip(
            width in 1..12i32,
            height in 1..12i32,
            x in 0..12i32,
            w in 0..12i32,
            delta in -20..20i32,
        ) {
            let x = x % width;
            let w = w % (width - x + 1);
            let b = buffer(&[width, height]);
            let c = b.cropped(0, x, w);
            prop_assert_eq!(c.dim(0).min, x);
            prop_assert_eq!(c.dim(0).extent, w);
            prop_assert_eq!(c.dim(1), b.dim(1));
            let back = c.translated(0, delta).translated(0, -delta);
            prop_assert_eq!(back.dims(), c.dims());
            for i in x..x + w {
                prop_assert_eq!(back.address_of(&[i, height - 1]), b.address_of(&[i, height - 1]));
            }
        }
    }
}
