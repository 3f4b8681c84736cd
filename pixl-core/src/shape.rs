use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// One axis of a buffer.
///
/// Coordinates along the axis run over `min ..= max`, and moving one step
/// along it moves `stride` elements in memory. Strides may be negative.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Default, Serialize, Deserialize)]
#[repr(C)]
pub struct Dimension {
    pub min: i32,
    pub extent: i32,
    pub stride: i32,
}

impl Dimension {
    pub const fn new(min: i32, extent: i32, stride: i32) -> Self {
        Self {
            min,
            extent,
            stride,
        }
    }
    pub fn min(&self) -> i32 {
        self.min
    }
    pub fn extent(&self) -> i32 {
        self.extent
    }
    pub fn stride(&self) -> i32 {
        self.stride
    }
    /// The last valid coordinate, `min + extent - 1`.
    pub fn max(&self) -> i32 {
        self.min + self.extent - 1
    }
    /// Iterates the coordinates of the axis.
    pub fn iter(&self) -> RangeInclusive<i32> {
        self.min..=self.max()
    }
    pub fn contains(&self, x: i32) -> bool {
        x >= self.min && x <= self.max()
    }
}

impl IntoIterator for Dimension {
    type Item = i32;
    type IntoIter = RangeInclusive<i32>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl IntoIterator for &Dimension {
    type Item = i32;
    type IntoIter = RangeInclusive<i32>;
    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Dense, first axis fastest, dimensions for `extents`, all with min 0.
///
/// **Panics**
/// - If an extent is negative.
/// - If a stride does not fit in an `i32`.
pub fn dense_dims(extents: &[i32]) -> impl Iterator<Item = Dimension> + '_ {
    let mut stride = Some(1i32);
    extents.iter().map(move |&extent| {
        assert!(extent >= 0, "negative extent {extent}");
        let Some(dim_stride) = stride else {
            panic!("dense strides of extents {extents:?} overflow i32");
        };
        stride = dim_stride.checked_mul(extent);
        Dimension::new(0, extent, dim_stride)
    })
}

/// Total number of elements covered by `dims`.
pub fn number_of_elements(dims: &[Dimension]) -> usize {
    dims.iter().map(|dim| dim.extent.max(0) as usize).product()
}

/// Offset in elements of the lowest addressed element, relative to the
/// element at the min coordinate.
pub fn begin_offset(dims: &[Dimension]) -> isize {
    if number_of_elements(dims) == 0 {
        return 0;
    }
    dims.iter()
        .filter(|dim| dim.stride < 0)
        .map(|dim| (dim.extent as isize - 1) * dim.stride as isize)
        .sum()
}

/// One past the offset in elements of the highest addressed element.
pub fn end_offset(dims: &[Dimension]) -> isize {
    if number_of_elements(dims) == 0 {
        return 0;
    }
    dims.iter()
        .filter(|dim| dim.stride > 0)
        .map(|dim| (dim.extent as isize - 1) * dim.stride as isize)
        .sum::<isize>()
        + 1
}

/// Offset in elements of `pos`, relative to the element at the min coordinate.
///
/// Missing trailing coordinates are taken to be at their min.
pub fn offset_of(dims: &[Dimension], pos: &[i32]) -> isize {
    pos.iter()
        .zip(dims)
        .map(|(&x, dim)| (x as isize - dim.min as isize) * dim.stride as isize)
        .sum()
}

/// Whether every coordinate in `pos` lies inside its axis.
pub fn contains(dims: &[Dimension], pos: &[i32]) -> bool {
    pos.len() <= dims.len() && pos.iter().zip(dims).all(|(&x, dim)| dim.contains(x))
}

/// Calls `f` with the element offset of every coordinate of `dims`.
///
/// The first axis varies fastest. Visits one offset for rank 0 and none when
/// any extent is 0.
pub fn for_each_offset(dims: &[Dimension], mut f: impl FnMut(isize)) {
    if number_of_elements(dims) == 0 {
        return;
    }
    fn visit(dims: &[Dimension], base: isize, f: &mut impl FnMut(isize)) {
        if let Some((dim, rest)) = dims.split_last() {
            let stride = dim.stride as isize;
            for i in 0..dim.extent as isize {
                visit(rest, base + i * stride, f);
            }
        } else {
            f(base);
        }
    }
    visit(dims, 0, &mut f);
}
