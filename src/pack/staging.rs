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

//! Pinned bounce region for staged device transfers

use std::sync::Arc;

use log::trace;

use crate::context::MemoryPool;
use crate::error::CourierResult;
use crate::util::fmt_bytes;

/// Host region bridging device memory and host-addressable transports.
///
/// Drawn from the context's memory pool, which hands out pinned memory
/// whenever a device bridge is configured. Grows to the largest invoice it
/// has served and never shrinks; the backing allocation is released when
/// the owning packer is dropped. Not thread-safe, matching the
/// one-control-thread-per-rank issuance model.
pub(crate) struct StagingBuffer {
    pool: Arc<dyn MemoryPool>,
    ptr: *mut u8,
    capacity: usize,
}

impl StagingBuffer {
    pub fn new(pool: Arc<dyn MemoryPool>) -> Self {
        Self {
            pool,
            ptr: std::ptr::null_mut(),
            capacity: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Grow the buffer to hold at least `bytes`. Existing content is not
    /// preserved; staged data never outlives one pack or unpack call.
    pub fn ensure(&mut self, bytes: usize) -> CourierResult<()> {
        if bytes <= self.capacity {
            return Ok(());
        }
        let fresh = self.pool.allocate(bytes)?;
        self.release();
        trace!(
            "staging buffer grown to {}",
            fmt_bytes(bytes)
        );
        self.ptr = fresh;
        self.capacity = bytes;
        Ok(())
    }

    /// A writable view of the first `len` bytes, growing first if needed.
    pub fn slice_mut(&mut self, len: usize) -> CourierResult<&mut [u8]> {
        self.ensure(len)?;
        // SAFETY: ptr covers `capacity >= len` bytes allocated above and
        // the exclusive borrow of self prevents aliasing views.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr, len) })
    }

    fn release(&mut self) {
        if !self.ptr.is_null() {
            self.pool.deallocate(self.ptr, self.capacity);
            self.ptr = std::ptr::null_mut();
            self.capacity = 0;
        }
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        self.release();
    }
}
