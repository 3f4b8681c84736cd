/*!
N-dimensional strided buffers over host and device memory.

A [`Buffer`](buffer::Buffer) is a view: a shape of [`Dimension`](shape::Dimension)s,
each with a min coordinate, an extent and a stride, over memory that may be
shared with other views. Cropping, slicing, transposing and embedding change
only the view, so they are cheap and never copy.

Memory lives on the host, on a device, or both. Each buffer tracks whether the
host or the device copy was written last, and moves data with
[`.copy_to_device()`](buffer::RawBuffer::copy_to_device) and
[`.copy_to_host()`](buffer::RawBuffer::copy_to_host). Devices implement
[`DeviceInterface`](device::DeviceInterface) over a flat
[`BufferDescriptor`](descriptor::BufferDescriptor).

```
use pixl::buffer::Buffer;

let mut image = Buffer::<u8>::make_interleaved(64, 48, 3);
image.fill(7);
let mut red = image.sliced(2, 0);
red.fill(255);
assert_eq!(image.get(&[10, 10, 0]), 255);
assert_eq!(image.get(&[10, 10, 1]), 7);
```

# Devices
With the default `emulated` feature, [`Device::builder()`](device::Device::builder)
creates a device backed by host memory, used for testing device transfers.
*/
#![forbid(unsafe_op_in_unsafe_fn)]

pub extern crate anyhow;
pub use pixl_core;

#[doc(inline)]
pub use pixl_core::{descriptor, scalar, shape};

pub mod result {
    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
}

pub mod buffer;
pub mod device;
