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

//! Accelerator memory boundary
//!
//! The packing layer is agnostic to where device memory actually lives; it
//! addresses it through raw `u64` device addresses and a [`DeviceBridge`]
//! that knows how to move bytes across the host/device line. A CUDA or HIP
//! backend implements the trait against the vendor runtime; the built-in
//! [`sim::SimBridge`] backs device addresses with ordinary host memory so
//! the device paths run (and are tested) on machines without accelerators.

pub mod sim;

pub use sim::SimBridge;

use crate::error::CourierResult;

/// Bridges device memory with the messaging layer.
///
/// Device memory is addressed by raw `u64` addresses as handed out by
/// [`alloc`](DeviceBridge::alloc); address arithmetic (base plus byte
/// offset) is valid within one allocation.
pub trait DeviceBridge: Send + Sync {
    /// Number of devices visible to this process.
    fn device_count(&self) -> usize;

    /// Make `device` the active device for subsequent allocations and
    /// copies. Ranks typically bind `node_local_rank % device_count`.
    fn bind(&self, device: usize) -> CourierResult<()>;

    /// Allocate `bytes` of device memory on the bound device.
    fn alloc(&self, bytes: usize) -> CourierResult<u64>;

    /// Release an allocation returned by [`alloc`](DeviceBridge::alloc).
    fn free(&self, addr: u64) -> CourierResult<()>;

    /// Copy `src` into device memory at `dst`.
    ///
    /// # Safety
    /// `dst` must lie within a live allocation with at least `src.len()`
    /// bytes remaining.
    unsafe fn upload(&self, src: &[u8], dst: u64) -> CourierResult<()>;

    /// Copy `dst.len()` bytes of device memory at `src` into `dst`.
    ///
    /// # Safety
    /// `src` must lie within a live allocation with at least `dst.len()`
    /// bytes remaining.
    unsafe fn download(&self, src: u64, dst: &mut [u8]) -> CourierResult<()>;

    /// Gather `offsets.len()` elements of `width` bytes, the i-th read at
    /// `base + offsets[i]`, into contiguous device memory at `dst`.
    ///
    /// The default implementation bounces each element through the host;
    /// accelerator backends should override with a device-side kernel.
    ///
    /// # Safety
    /// Every addressed element and the destination range must lie within
    /// live allocations.
    unsafe fn gather(
        &self,
        base: u64,
        offsets: &[isize],
        width: usize,
        dst: u64,
    ) -> CourierResult<()> {
        let mut elem = vec![0u8; width];
        for (i, off) in offsets.iter().enumerate() {
            self.download(offset_addr(base, *off), &mut elem)?;
            self.upload(&elem, offset_addr(dst, (i * width) as isize))?;
        }
        Ok(())
    }

    /// Scatter contiguous device memory at `src` back out, the i-th
    /// element of `width` bytes written at `base + offsets[i]`. Inverse of
    /// [`gather`](DeviceBridge::gather).
    ///
    /// # Safety
    /// Every addressed element and the source range must lie within live
    /// allocations.
    unsafe fn scatter(
        &self,
        src: u64,
        base: u64,
        offsets: &[isize],
        width: usize,
    ) -> CourierResult<()> {
        let mut elem = vec![0u8; width];
        for (i, off) in offsets.iter().enumerate() {
            self.download(offset_addr(src, (i * width) as isize), &mut elem)?;
            self.upload(&elem, offset_addr(base, *off))?;
        }
        Ok(())
    }

    /// Allocate page-locked host memory suitable for staged transfers.
    fn alloc_pinned(&self, bytes: usize) -> CourierResult<*mut u8>;

    /// Release pinned host memory returned by
    /// [`alloc_pinned`](DeviceBridge::alloc_pinned).
    ///
    /// # Safety
    /// `ptr` must come from `alloc_pinned` with the same `bytes`.
    unsafe fn free_pinned(&self, ptr: *mut u8, bytes: usize) -> CourierResult<()>;
}

/// Apply a signed byte offset to a device address.
pub(crate) fn offset_addr(addr: u64, off: isize) -> u64 {
    (addr as i64 + off as i64) as u64
}
