use super::RawBuffer;
use crate::shape::Dimension;
use smallvec::SmallVec;
use std::array;

/// Marker for callables taking the full coordinate as `&[i32]`.
pub struct Coords;

/// A callable visited with coordinates by `for_each_element`.
///
/// Implemented for `FnMut(&[i32])`, which receives the full coordinate, and
/// for `FnMut(i32, ..)` with 1 to 6 arguments, which iterates only that many
/// leading dimensions. The remaining dimensions stay at their min. Closure
/// argument types must be annotated, ie `|x: i32, y: i32| ..`.
pub trait ElementFn<Marker> {
    /// Number of leading dimensions visited, `None` for all.
    fn arity(&self) -> Option<usize>;
    fn call(&mut self, pos: &[i32]);
}

impl<F: FnMut(&[i32])> ElementFn<Coords> for F {
    fn arity(&self) -> Option<usize> {
        None
    }
    fn call(&mut self, pos: &[i32]) {
        self(pos)
    }
}

macro_rules! impl_element_fn {
    (@i32 $i:literal) => {
        i32
    };
    ($($n:literal => ($($i:literal),+)),+ $(,)?) => {
        $(
            impl<F> ElementFn<[i32; $n]> for F
            where
                F: FnMut($(impl_element_fn!(@i32 $i)),+),
            {
                fn arity(&self) -> Option<usize> {
                    Some($n)
                }
                fn call(&mut self, pos: &[i32]) {
                    self($(pos[$i]),+)
                }
            }
        )+
    };
}

impl_element_fn!(
    1 => (0),
    2 => (0, 1),
    3 => (0, 1, 2),
    4 => (0, 1, 2, 3),
    5 => (0, 1, 2, 3, 4),
    6 => (0, 1, 2, 3, 4, 5),
);

/// Calls `f` with every coordinate of `dims`, first dimension fastest.
pub(crate) fn for_each_coordinate(dims: &[Dimension], mut f: impl FnMut(&[i32])) {
    if dims.iter().any(|dim| dim.extent <= 0) {
        return;
    }
    let mut pos: SmallVec<[i32; 8]> = dims.iter().map(|dim| dim.min).collect();
    loop {
        f(&pos);
        let mut i = 0;
        loop {
            if i == dims.len() {
                return;
            }
            pos[i] += 1;
            if pos[i] <= dims[i].max() {
                break;
            }
            pos[i] = dims[i].min;
            i += 1;
        }
    }
}

/// One loop of a traversal, strides in bytes per buffer.
#[derive(Clone, Copy, Debug)]
struct Task<const N: usize> {
    extent: usize,
    strides: [isize; N],
}

/// Sorts by ascending stride of the first buffer and fuses loops that are
/// contiguous in every buffer.
fn plan<const N: usize>(buffers: &[&RawBuffer; N]) -> SmallVec<[Task<N>; 4]> {
    let rank = buffers[0].dims.len();
    let mut tasks: SmallVec<[Task<N>; 4]> = (0..rank)
        .map(|i| Task {
            extent: buffers[0].dims[i].extent as usize,
            strides: array::from_fn(|k| {
                let buffer = buffers[k];
                buffer.dims[i].stride as isize * buffer.element_type.bytes() as isize
            }),
        })
        .filter(|task| task.extent > 1)
        .collect();
    for i in 1..tasks.len() {
        let mut j = i;
        while j > 0 && tasks[j].strides[0].unsigned_abs() < tasks[j - 1].strides[0].unsigned_abs() {
            tasks.swap(j, j - 1);
            j -= 1;
        }
    }
    let mut i = 1;
    while i < tasks.len() {
        let (inner, outer) = (tasks[i - 1], tasks[i]);
        let contiguous =
            (0..N).all(|k| inner.strides[k] * inner.extent as isize == outer.strides[k]);
        if contiguous {
            tasks[i - 1].extent *= outer.extent;
            tasks.remove(i);
        } else {
            i += 1;
        }
    }
    tasks
}

fn visit<const N: usize>(tasks: &[Task<N>], ptrs: [*mut u8; N], f: &mut impl FnMut([*mut u8; N])) {
    match tasks.split_last() {
        None => f(ptrs),
        Some((task, [])) => {
            let mut ptrs = ptrs;
            for _ in 0..task.extent {
                f(ptrs);
                for (ptr, stride) in ptrs.iter_mut().zip(task.strides) {
                    *ptr = ptr.wrapping_offset(stride);
                }
            }
        }
        Some((task, rest)) => {
            for i in 0..task.extent as isize {
                let ptrs = array::from_fn(|k| ptrs[k].wrapping_offset(i * task.strides[k]));
                visit(rest, ptrs, f);
            }
        }
    }
}

impl RawBuffer {
    /// Visits every coordinate.
    ///
    /// See [`ElementFn`] for the accepted callables.
    pub fn for_each_element<M>(&self, mut f: impl ElementFn<M>) {
        let rank = self.dims.len();
        let n = f.arity().unwrap_or(rank);
        assert!(
            n <= rank,
            "Callable takes {n} coordinates, but the buffer has rank {rank}!"
        );
        for_each_coordinate(&self.dims[..n], |pos| f.call(pos));
    }
    /// Calls `f` with pointers to the elements at each coordinate of
    /// `buffers`, which must have the same mins and extents.
    ///
    /// Loops are reordered and fused so that the innermost loop has the
    /// smallest stride, so the order of visits is unspecified.
    pub(crate) fn for_each_value_raw<const N: usize>(
        buffers: [&RawBuffer; N],
        mut f: impl FnMut([*mut u8; N]),
    ) {
        let first = buffers[0];
        for buffer in buffers.iter() {
            assert_eq!(
                buffer.dims.len(),
                first.dims.len(),
                "Buffers of rank {} and {} cannot be traversed together!",
                first.dims.len(),
                buffer.dims.len()
            );
            for (a, b) in first.dims.iter().zip(buffer.dims.iter()) {
                assert!(
                    a.min == b.min && a.extent == b.extent,
                    "Buffers with dims {:?} and {:?} cannot be traversed together!",
                    first.dims,
                    buffer.dims
                );
            }
            buffer.check_host_readable();
        }
        if first.number_of_elements() == 0 {
            return;
        }
        let tasks = plan(&buffers);
        let ptrs = array::from_fn(|k| buffers[k].host);
        visit(&tasks, ptrs, &mut f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{scalar::ElementType, shape::dense_dims};
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn dense_fuses_to_one_loop() {
        let a = RawBuffer::new(ElementType::of::<u16>(), &[4, 3, 2]);
        let tasks = plan(&[&a]);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].extent, 24);
        assert_eq!(tasks[0].strides, [2]);
    }

    #[test]
    fn transposed_sorts_by_stride() {
        let a = RawBuffer::new(ElementType::of::<u8>(), &[4, 3]).transposed(0, 1);
        let tasks = plan(&[&a]);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].extent, 12);
    }

    #[test]
    fn crop_does_not_fuse() {
        let a = RawBuffer::new(ElementType::of::<u8>(), &[4, 3]).cropped(0, 1, 2);
        let tasks = plan(&[&a]);
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn fewer_arguments_fix_trailing_dims() {
        let a = RawBuffer::with_dims(ElementType::of::<u8>(), dense_dims(&[3, 2, 5]));
        let mut visited = Vec::new();
        a.for_each_element(|x: i32, y: i32| visited.push((x, y)));
        assert_eq!(visited.len(), 6);
        assert_eq!(visited[0], (0, 0));
        assert_eq!(visited[1], (1, 0));
    }

    #[test]
    #[should_panic(expected = "Callable takes 3 coordinates, but the buffer has rank 2")]
    fn arity_above_rank() {
        let a = RawBuffer::new(ElementType::of::<u8>(), &[2, 2]);
        a.for_each_element(|_: i32, _: i32, _: i32| {});
    }

    #[test]
    fn scalar_visited_once() {
        let a = RawBuffer::make_scalar(ElementType::of::<u8>());
        let mut count = 0;
        a.for_each_element(|pos: &[i32]| {
            assert!(pos.is_empty());
            count += 1;
        });
        assert_eq!(count, 1);
    }

    proptest! {
        #[test]
        fn for_each_element_covers_shape(
            extents in proptest::collection::vec(0..4i32, 0..=6),
            mins in proptest::collection::vec(-3..3i32, 6),
        ) {
            let dims: Vec<_> = dense_dims(&extents)
                .zip(mins.iter())
                .map(|(dim, min)| Dimension { min: *min, ..dim })
                .collect();
            let a = RawBuffer::with_dims(ElementType::of::<u8>(), dims.iter().copied());
            let mut visited = HashSet::new();
            let mut count = 0;
            a.for_each_element(|pos: &[i32]| {
                assert!(a.contains(pos));
                visited.insert(pos.to_vec());
                count += 1;
            });
            prop_assert_eq!(count, a.number_of_elements());
            prop_assert_eq!(visited.len(), count);
        }
    }
}
