use super::{iter::for_each_coordinate, RawBuffer};
use crate::{
    descriptor::BufferDescriptor,
    device::{Device, DeviceOwnership},
    scalar::{ElementType, Scalar, ScalarElem},
    shape::Dimension,
};
use derive_more::{Deref, DerefMut};
use dry::macro_for;
use std::{
    fmt::{self, Debug},
    marker::PhantomData,
    mem::size_of,
    ops::Index,
};

/// An N-dimensional buffer of `T`.
///
/// Dereferences to [`RawBuffer`] for shape queries, in place reshaping and
/// device transfers.
///
/// Element access goes through raw pointers into memory that other views may
/// share. Writing through one view while another is read is a data race, and
/// must be serialized by the caller.
#[derive(Clone, Deref, DerefMut)]
pub struct Buffer<T: Scalar> {
    #[deref]
    #[deref_mut]
    raw: RawBuffer,
    _m: PhantomData<T>,
}

/// A buffer whose element type is only known at runtime.
#[derive(Clone, Deref, DerefMut)]
pub struct ScalarBuffer {
    #[deref]
    #[deref_mut]
    raw: RawBuffer,
}

macro_rules! impl_views {
    ($({$($g:tt)*})? $B:ty) => {
        impl$(<$($g)*>)? $B {
            pub fn cropped(&self, d: usize, min: i32, extent: i32) -> Self {
                self.with_raw(self.raw.cropped(d, min, extent))
            }
            pub fn cropped_rect(&self, rect: &[(i32, i32)]) -> Self {
                self.with_raw(self.raw.cropped_rect(rect))
            }
            pub fn sliced(&self, d: usize, pos: i32) -> Self {
                self.with_raw(self.raw.sliced(d, pos))
            }
            pub fn transposed(&self, d1: usize, d2: usize) -> Self {
                self.with_raw(self.raw.transposed(d1, d2))
            }
            pub fn permuted(&self, order: &[usize]) -> Self {
                self.with_raw(self.raw.permuted(order))
            }
            pub fn translated(&self, d: usize, delta: i32) -> Self {
                self.with_raw(self.raw.translated(d, delta))
            }
            pub fn embedded(&self, d: usize, pos: i32) -> Self {
                self.with_raw(self.raw.embedded(d, pos))
            }
            /// A dense copy with its own allocation.
            pub fn copy(&self) -> Self {
                self.with_raw(self.raw.copy())
            }
            pub fn copy_to_interleaved(&self) -> Self {
                self.with_raw(self.raw.copy_to_interleaved())
            }
            pub fn copy_to_planar(&self) -> Self {
                self.with_raw(self.raw.copy_to_planar())
            }
            pub fn as_raw(&self) -> &RawBuffer {
                &self.raw
            }
            pub fn into_raw(self) -> RawBuffer {
                self.raw
            }
        }
    };
}

impl_views!({T: Scalar} Buffer<T>);
impl_views!(ScalarBuffer);

impl<T: Scalar> Buffer<T> {
    fn from_raw(raw: RawBuffer) -> Self {
        assert_eq!(
            raw.element_type(),
            T::element_type(),
            "Type mismatch, expected {} found {}!",
            T::element_type(),
            raw.element_type()
        );
        Self {
            raw,
            _m: PhantomData,
        }
    }
    fn with_raw(&self, raw: RawBuffer) -> Self {
        Self::from_raw(raw)
    }
    /// A dense, zeroed buffer, first dimension fastest.
    pub fn new(extents: &[i32]) -> Self {
        Self::from_raw(RawBuffer::new(T::element_type(), extents))
    }
    /// A buffer with shape `dims` and no memory.
    pub fn with_dims(dims: impl IntoIterator<Item = Dimension>) -> Self {
        Self::from_raw(RawBuffer::with_dims(T::element_type(), dims))
    }
    /// Takes ownership of `vec`, laid out densely with `extents`.
    pub fn from_vec(vec: Vec<T>, extents: &[i32]) -> Self {
        Self::from_raw(RawBuffer::from_vec(vec, extents))
    }
    /// Wraps foreign memory without taking ownership of it.
    ///
    /// # Safety
    /// See [`RawBuffer::from_raw_parts`]. `host` must also be aligned for `T`.
    pub unsafe fn from_raw_parts(host: *mut T, dims: impl IntoIterator<Item = Dimension>) -> Self {
        Self::from_raw(unsafe { RawBuffer::from_raw_parts(T::element_type(), host as *mut u8, dims) })
    }
    /// A rank 0 buffer holding one element.
    pub fn make_scalar() -> Self {
        Self::from_raw(RawBuffer::make_scalar(T::element_type()))
    }
    /// A `width x height x channels` buffer with channels innermost.
    pub fn make_interleaved(width: i32, height: i32, channels: i32) -> Self {
        Self::from_raw(RawBuffer::make_interleaved(
            T::element_type(),
            width,
            height,
            channels,
        ))
    }
    /// An allocated buffer with the shape and nesting order of `src`, which
    /// may have a different element type.
    pub fn make_with_shape_of(src: &RawBuffer) -> Self {
        Self::from_raw(RawBuffer::make_with_shape_and_type_of(src, T::element_type()))
    }
    fn ptr(&self, pos: &[i32]) -> *mut T {
        self.raw.address_of(pos) as *mut T
    }
    /// The element at `pos`. Missing trailing coordinates are at their min.
    pub fn get(&self, pos: &[i32]) -> T {
        self.raw.check_host_readable();
        unsafe { self.ptr(pos).read() }
    }
    /// Writes the element at `pos` and marks the host dirty.
    pub fn set(&mut self, pos: &[i32], value: T) {
        self.update(pos, |x| *x = value);
    }
    /// Modifies the element at `pos` in place and marks the host dirty.
    pub fn update(&mut self, pos: &[i32], f: impl FnOnce(&mut T)) {
        self.raw.check_host_readable();
        self.raw.set_host_dirty(true);
        let ptr = self.ptr(pos);
        unsafe {
            let mut value = ptr.read();
            f(&mut value);
            ptr.write(value);
        }
    }
    /// Calls `f` with each element, in an unspecified order, and marks the
    /// host dirty.
    pub fn for_each_value(&mut self, mut f: impl FnMut(&mut T)) {
        RawBuffer::for_each_value_raw([&self.raw], |[p]| unsafe {
            let p = p as *mut T;
            let mut value = p.read();
            f(&mut value);
            p.write(value);
        });
        self.raw.set_host_dirty(true);
    }
    /// Like [`.for_each_value()`](Self::for_each_value), also passing the
    /// element of `other` at the same coordinate.
    pub fn for_each_value_with<U: Scalar>(
        &mut self,
        other: &Buffer<U>,
        mut f: impl FnMut(&mut T, U),
    ) {
        RawBuffer::for_each_value_raw([&self.raw, &other.raw], |[p, q]| unsafe {
            let u = (q as *const U).read();
            let p = p as *mut T;
            let mut value = p.read();
            f(&mut value, u);
            p.write(value);
        });
        self.raw.set_host_dirty(true);
    }
    pub fn for_each_value_with2<U: Scalar, V: Scalar>(
        &mut self,
        a: &Buffer<U>,
        b: &Buffer<V>,
        mut f: impl FnMut(&mut T, U, V),
    ) {
        RawBuffer::for_each_value_raw([&self.raw, &a.raw, &b.raw], |[p, q, r]| unsafe {
            let u = (q as *const U).read();
            let v = (r as *const V).read();
            let p = p as *mut T;
            let mut value = p.read();
            f(&mut value, u, v);
            p.write(value);
        });
        self.raw.set_host_dirty(true);
    }
    /// Sets every element to `value`.
    pub fn fill(&mut self, value: T) {
        self.for_each_value(|x| *x = value);
    }
    /// Sets every element to `f(pos)`.
    pub fn fill_with(&mut self, mut f: impl FnMut(&[i32]) -> T) {
        self.raw.check_host_readable();
        self.raw.set_host_dirty(true);
        let raw = &self.raw;
        for_each_coordinate(raw.dims(), |pos| unsafe {
            (raw.address_of(pos) as *mut T).write(f(pos));
        });
    }
    /// Whether every element equals `value`.
    pub fn all_equal(&self, value: T) -> bool {
        let mut all_equal = true;
        RawBuffer::for_each_value_raw([&self.raw], |[p]| {
            all_equal &= unsafe { (p as *const T).read() } == value;
        });
        all_equal
    }
    /// The elements, first dimension fastest.
    pub fn to_vec(&self) -> Vec<T> {
        self.raw.check_host_readable();
        let mut vec = Vec::with_capacity(self.raw.number_of_elements());
        for_each_coordinate(self.raw.dims(), |pos| vec.push(self.get(pos)));
        vec
    }
    /// An erased view sharing the same memory.
    pub fn as_scalar_buffer(&self) -> ScalarBuffer {
        ScalarBuffer {
            raw: self.raw.clone(),
        }
    }
}

impl<T: Scalar, const N: usize> Index<[i32; N]> for Buffer<T> {
    type Output = T;
    fn index(&self, pos: [i32; N]) -> &T {
        self.raw.check_host_readable();
        unsafe { &*self.ptr(&pos) }
    }
}

impl<T: Scalar> From<Buffer<T>> for ScalarBuffer {
    fn from(buffer: Buffer<T>) -> Self {
        Self { raw: buffer.raw }
    }
}

impl<T: Scalar> TryFrom<ScalarBuffer> for Buffer<T> {
    type Error = ScalarBuffer;
    fn try_from(buffer: ScalarBuffer) -> Result<Self, ScalarBuffer> {
        buffer.try_into_typed()
    }
}

impl<T: Scalar> Debug for Buffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("scalar_type", &T::scalar_type())
            .field("dims", &self.raw.dims())
            .field("host_dirty", &self.raw.host_dirty())
            .field("device_dirty", &self.raw.device_dirty())
            .finish()
    }
}

impl ScalarBuffer {
    fn with_raw(&self, raw: RawBuffer) -> Self {
        Self { raw }
    }
    pub fn new(element_type: ElementType, extents: &[i32]) -> Self {
        Self {
            raw: RawBuffer::new(element_type, extents),
        }
    }
    pub fn with_dims(element_type: ElementType, dims: impl IntoIterator<Item = Dimension>) -> Self {
        Self {
            raw: RawBuffer::with_dims(element_type, dims),
        }
    }
    pub fn make_scalar(element_type: ElementType) -> Self {
        Self {
            raw: RawBuffer::make_scalar(element_type),
        }
    }
    pub fn make_interleaved(element_type: ElementType, width: i32, height: i32, channels: i32) -> Self {
        Self {
            raw: RawBuffer::make_interleaved(element_type, width, height, channels),
        }
    }
    pub fn make_with_shape_of(src: &RawBuffer) -> Self {
        Self {
            raw: RawBuffer::make_with_shape_of(src),
        }
    }
    /// Wraps a flat descriptor.
    ///
    /// # Safety
    /// See [`RawBuffer::from_descriptor`].
    pub unsafe fn from_descriptor(
        desc: &BufferDescriptor,
        device: Option<Device>,
        ownership: DeviceOwnership,
    ) -> Self {
        Self {
            raw: unsafe { RawBuffer::from_descriptor(desc, device, ownership) },
        }
    }
    fn scalar_type_or_panic(&self) -> crate::scalar::ScalarType {
        self.raw.element_type().scalar_type().unwrap_or_else(|| {
            panic!(
                "Element type {} has no scalar representation!",
                self.raw.element_type()
            )
        })
    }
    fn check_elem(&self, elem: ScalarElem) {
        assert_eq!(
            elem.scalar_type(),
            self.scalar_type_or_panic(),
            "Type mismatch, expected {} found {}!",
            self.raw.element_type(),
            elem.scalar_type().element_type()
        );
    }
    /// The element at `pos`. Missing trailing coordinates are at their min.
    pub fn get_elem(&self, pos: &[i32]) -> ScalarElem {
        let scalar_type = self.scalar_type_or_panic();
        self.raw.check_host_readable();
        let ptr = self.raw.address_of(pos);
        let mut bits = 0u64;
        macro_for!($T in [u8, u16, u32, u64] {
            if scalar_type.size() == size_of::<$T>() {
                bits = unsafe { (ptr as *const $T).read_unaligned() } as u64;
            }
        });
        ScalarElem::from_bits_u64(scalar_type, bits)
    }
    /// Writes the element at `pos` and marks the host dirty.
    pub fn set_elem(&mut self, pos: &[i32], elem: ScalarElem) {
        self.check_elem(elem);
        self.raw.check_host_readable();
        self.raw.set_host_dirty(true);
        let ptr = self.raw.address_of(pos);
        let bits = elem.to_bits_u64();
        macro_for!($T in [u8, u16, u32, u64] {
            if elem.scalar_type().size() == size_of::<$T>() {
                unsafe { (ptr as *mut $T).write_unaligned(bits as $T) };
            }
        });
    }
    /// Sets every element to `elem`, which must have the buffer's type.
    pub fn fill(&mut self, elem: ScalarElem) {
        self.check_elem(elem);
        let bits = elem.to_bits_u64();
        macro_for!($T in [u8, u16, u32, u64] {
            if elem.scalar_type().size() == size_of::<$T>() {
                RawBuffer::for_each_value_raw([&self.raw], |[p]| unsafe {
                    (p as *mut $T).write_unaligned(bits as $T);
                });
            }
        });
        self.raw.set_host_dirty(true);
    }
    pub fn all_equal(&self, elem: ScalarElem) -> bool {
        self.check_elem(elem);
        let bits = elem.to_bits_u64();
        let mut all_equal = true;
        macro_for!($T in [u8, u16, u32, u64] {
            if elem.scalar_type().size() == size_of::<$T>() {
                RawBuffer::for_each_value_raw([&self.raw], |[p]| {
                    all_equal &= unsafe { (p as *const $T).read_unaligned() } == bits as $T;
                });
            }
        });
        all_equal
    }
    /// Converts to a typed buffer.
    ///
    /// Panics if the element type is not `T`.
    pub fn into_typed<T: Scalar>(self) -> Buffer<T> {
        Buffer::from_raw(self.raw)
    }
    /// Converts to a typed buffer, or returns `self` if the element type is
    /// not `T`.
    pub fn try_into_typed<T: Scalar>(self) -> Result<Buffer<T>, Self> {
        if self.raw.element_type() == T::element_type() {
            Ok(Buffer::from_raw(self.raw))
        } else {
            Err(self)
        }
    }
}

impl Debug for ScalarBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScalarBuffer")
            .field("element_type", &self.raw.element_type())
            .field("dims", &self.raw.dims())
            .field("host_dirty", &self.raw.host_dirty())
            .field("device_dirty", &self.raw.device_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::f16;

    #[test]
    fn get_set() {
        let mut b = Buffer::<i32>::new(&[4, 3]);
        b.set(&[2, 1], 7);
        assert_eq!(b.get(&[2, 1]), 7);
        assert_eq!(b[[2, 1]], 7);
        assert!(b.host_dirty());
        assert_eq!(b.get(&[2]), 0);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn get_out_of_bounds() {
        let b = Buffer::<u8>::new(&[4, 3]);
        b.get(&[4, 0]);
    }

    #[test]
    #[should_panic(expected = "while the device is dirty")]
    fn get_while_device_dirty() {
        let mut b = Buffer::<u8>::new(&[2]);
        b.set_device_dirty(true);
        b.get(&[0]);
    }

    #[test]
    #[should_panic(expected = "while the device is dirty")]
    fn for_each_value_while_device_dirty() {
        let mut b = Buffer::<i16>::new(&[3, 2]);
        b.set_device_dirty(true);
        b.for_each_value(|x| *x += 1);
    }

    #[test]
    fn fill_all_equal() {
        let mut b = Buffer::<f16>::new(&[5, 2, 3]).transposed(0, 2);
        b.fill(f16::from_f32(1.5));
        assert!(b.all_equal(f16::from_f32(1.5)));
        b.set(&[0, 1, 4], f16::ZERO);
        assert!(!b.all_equal(f16::from_f32(1.5)));
    }

    #[test]
    fn fill_with_coordinates() {
        let mut b = Buffer::<u32>::new(&[3, 2]);
        b.fill_with(|pos| (pos[0] + 10 * pos[1]) as u32);
        assert_eq!(b.to_vec(), [0, 1, 2, 10, 11, 12]);
    }

    #[test]
    fn for_each_value_with_other() {
        let a = Buffer::from_vec(vec![1u8, 2, 3, 4], &[2, 2]);
        let mut b = Buffer::<f32>::new(&[2, 2]).transposed(0, 1);
        b.for_each_value_with(&a.transposed(0, 1), |x, y| *x = y as f32 * 2.);
        assert_eq!(b.get(&[1, 0]), 6.);
        assert_eq!(b.get(&[0, 1]), 4.);
    }

    #[test]
    #[should_panic(expected = "cannot be traversed together")]
    fn for_each_value_with_mismatched_extents() {
        let a = Buffer::<u8>::new(&[3, 2]);
        let mut b = Buffer::<u8>::new(&[2, 2]);
        b.for_each_value_with(&a, |x, y| *x = y);
    }

    #[test]
    #[should_panic(expected = "cannot be traversed together")]
    fn for_each_value_with_mismatched_rank() {
        let a = Buffer::<u8>::new(&[4]);
        let mut b = Buffer::<u8>::new(&[4, 1]);
        b.for_each_value_with(&a, |x, y| *x = y);
    }

    #[test]
    fn erasure_round_trip() {
        let mut b = Buffer::<u16>::new(&[3]);
        b.set(&[1], 9);
        let s = ScalarBuffer::from(b);
        assert_eq!(s.get_elem(&[1]), ScalarElem::U16(9));
        let s = s.try_into_typed::<i16>().unwrap_err();
        let b = s.into_typed::<u16>();
        assert_eq!(b.get(&[1]), 9);
    }

    #[test]
    #[should_panic(expected = "Type mismatch")]
    fn into_typed_mismatch() {
        ScalarBuffer::new(ElementType::of::<f32>(), &[2]).into_typed::<f64>();
    }

    #[test]
    fn scalar_fill() {
        let mut s = ScalarBuffer::new(ElementType::of::<i64>(), &[2, 2]);
        s.fill(ScalarElem::I64(-3));
        assert!(s.all_equal(ScalarElem::I64(-3)));
        s.set_elem(&[0, 0], ScalarElem::I64(5));
        assert_eq!(s.get_elem(&[0, 0]), ScalarElem::I64(5));
        assert!(!s.all_equal(ScalarElem::I64(-3)));
    }
}
