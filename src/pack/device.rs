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

//! Device-resident entry handling
//!
//! Device entries are first made contiguous on the device by the bridge's
//! gather kernel, then crossed over the host/device line: the direct path
//! hands the contiguous block straight to the wire image, the staged path
//! bounces it through the packer's pinned staging buffer for transports
//! that need host-addressable memory. Unpacking runs the same two paths in
//! reverse, ending in a device-side scatter.

use crate::device::DeviceBridge;
use crate::error::CourierResult;
use crate::invoice::InvoiceEntry;
use crate::pack::staging::StagingBuffer;

/// Byte offset of every element of `entry`, in wire order.
fn wire_offsets(entry: &InvoiceEntry, width: usize) -> Vec<isize> {
    let dims = entry.dims();
    let len = |i: usize| dims.get(i).map_or(1, |d| d.len);
    let mut offsets = Vec::with_capacity(entry.element_count());
    for i2 in 0..len(2) {
        for i1 in 0..len(1) {
            for i0 in 0..len(0) {
                offsets.push(entry.element_offset([i0, i1, i2]) * width as isize);
            }
        }
    }
    offsets
}

/// Run `f` against a transient device-contiguous region of `bytes`.
fn with_scratch(
    bridge: &dyn DeviceBridge,
    bytes: usize,
    f: impl FnOnce(u64) -> CourierResult<()>,
) -> CourierResult<()> {
    let scratch = bridge.alloc(bytes)?;
    let result = f(scratch);
    let freed = bridge.free(scratch);
    result.and(freed)
}

/// Gather one device entry into `out`. `staging` carries the pinned bounce
/// buffer for the staged path; `None` selects the direct path.
pub(super) fn gather_entry(
    bridge: &dyn DeviceBridge,
    staging: Option<&mut StagingBuffer>,
    entry: &InvoiceEntry,
    base: u64,
    out: &mut [u8],
) -> CourierResult<()> {
    let width = entry.element_type().byte_width();
    let offsets = wire_offsets(entry, width);
    with_scratch(bridge, out.len(), |scratch| {
        // SAFETY: the offsets address exactly the elements the caller
        // described when appending the entry, and scratch spans out.len().
        unsafe { bridge.gather(base, &offsets, width, scratch)? };
        match staging {
            None => unsafe { bridge.download(scratch, out) },
            Some(buffer) => {
                let bounce = buffer.slice_mut(out.len())?;
                // SAFETY: bounce and scratch both span out.len() bytes.
                unsafe { bridge.download(scratch, bounce)? };
                out.copy_from_slice(bounce);
                Ok(())
            }
        }
    })
}

/// Scatter one device entry back out of `input`. Inverse of
/// [`gather_entry`], with the same staging policy.
pub(super) fn scatter_entry(
    bridge: &dyn DeviceBridge,
    staging: Option<&mut StagingBuffer>,
    entry: &InvoiceEntry,
    base: u64,
    input: &[u8],
) -> CourierResult<()> {
    let width = entry.element_type().byte_width();
    let offsets = wire_offsets(entry, width);
    with_scratch(bridge, input.len(), |scratch| {
        match staging {
            // SAFETY: scratch spans input.len() bytes.
            None => unsafe { bridge.upload(input, scratch)? },
            Some(buffer) => {
                let bounce = buffer.slice_mut(input.len())?;
                bounce.copy_from_slice(input);
                // SAFETY: as above, through the pinned bounce region.
                unsafe { bridge.upload(bounce, scratch)? };
            }
        }
        // SAFETY: the offsets address exactly the elements the caller
        // described when appending the entry.
        unsafe { bridge.scatter(scratch, base, &offsets, width) }
    })
}
