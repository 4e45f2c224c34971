// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Strided copies between host memory and wire images

use std::ptr;

use crate::invoice::{Dim, InvoiceEntry};

fn outer_dims(entry: &InvoiceEntry) -> (Dim, Dim, Dim) {
    let dims = entry.dims();
    let one = Dim::new(1, 0);
    (
        dims[0],
        dims.get(1).copied().unwrap_or(one),
        dims.get(2).copied().unwrap_or(one),
    )
}

/// Gather one entry's strided region into the contiguous `out` slice, in
/// wire order (first dimension fastest). Unit-stride inner rows move as
/// single block copies.
///
/// # Safety
///
/// `base` and the entry's dimension pattern must satisfy the validity
/// contract stated on the invoice append methods, and `out` must hold
/// exactly `entry.byte_size()` bytes.
pub(super) unsafe fn gather(entry: &InvoiceEntry, base: *mut u8, out: &mut [u8]) {
    let width = entry.element_type().byte_width();
    let (d0, d1, d2) = outer_dims(entry);
    let row = d0.len * width;
    let mut cursor = 0usize;
    for i2 in 0..d2.len {
        for i1 in 0..d1.len {
            let row_off = i2 as isize * d2.stride + i1 as isize * d1.stride;
            if d0.stride == 1 {
                let src = base.offset(row_off * width as isize);
                ptr::copy_nonoverlapping(src, out[cursor..].as_mut_ptr(), row);
                cursor += row;
            } else {
                for i0 in 0..d0.len {
                    let off = row_off + i0 as isize * d0.stride;
                    let src = base.offset(off * width as isize);
                    ptr::copy_nonoverlapping(src, out[cursor..].as_mut_ptr(), width);
                    cursor += width;
                }
            }
        }
    }
}

/// Scatter a contiguous wire image back into one entry's strided region.
/// Exact inverse of [`gather`].
///
/// # Safety
///
/// Same contract as [`gather`], with `input` holding exactly
/// `entry.byte_size()` bytes.
pub(super) unsafe fn scatter(entry: &InvoiceEntry, base: *mut u8, input: &[u8]) {
    let width = entry.element_type().byte_width();
    let (d0, d1, d2) = outer_dims(entry);
    let row = d0.len * width;
    let mut cursor = 0usize;
    for i2 in 0..d2.len {
        for i1 in 0..d1.len {
            let row_off = i2 as isize * d2.stride + i1 as isize * d1.stride;
            if d0.stride == 1 {
                let dst = base.offset(row_off * width as isize);
                ptr::copy_nonoverlapping(input[cursor..].as_ptr(), dst, row);
                cursor += row;
            } else {
                for i0 in 0..d0.len {
                    let off = row_off + i0 as isize * d0.stride;
                    let dst = base.offset(off * width as isize);
                    ptr::copy_nonoverlapping(input[cursor..].as_ptr(), dst, width);
                    cursor += width;
                }
            }
        }
    }
}
