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

//! Host-backed device simulation
//!
//! Backs device addresses with ordinary host allocations so the device
//! packing and staging paths run on machines without accelerators. The
//! simulated address of an allocation is its host address, which keeps
//! device-pointer arithmetic meaningful.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::ptr;
use std::sync::Mutex;

use log::debug;

use crate::device::{offset_addr, DeviceBridge};
use crate::error::{Code, CourierError, CourierResult};

const SIM_ALIGN: usize = 64;

/// Device bridge backed by host memory.
pub struct SimBridge {
    device_count: usize,
    bound: Mutex<Option<usize>>,
    // base address -> allocation length
    blocks: Mutex<HashMap<u64, usize>>,
}

impl SimBridge {
    pub fn new(device_count: usize) -> Self {
        Self {
            device_count,
            bound: Mutex::new(None),
            blocks: Mutex::new(HashMap::new()),
        }
    }

    /// Currently bound simulated device, if any.
    pub fn get_bound_device(&self) -> Option<usize> {
        *self.bound.lock().unwrap()
    }

    fn layout_for(bytes: usize) -> CourierResult<Layout> {
        Layout::from_size_align(bytes.max(1), SIM_ALIGN).map_err(|_| CourierError::OutOfMemory)
    }

    /// Reject addresses outside every live simulated allocation.
    fn check_range(&self, addr: u64, len: usize) -> CourierResult<()> {
        let blocks = self.blocks.lock().unwrap();
        let contained = blocks
            .iter()
            .any(|(base, size)| addr >= *base && addr + len as u64 <= *base + *size as u64);
        if contained {
            Ok(())
        } else {
            Err(CourierError::Device(format!(
                "address {:#x} (+{} bytes) is not inside a live device allocation",
                addr, len
            )))
        }
    }
}

impl Default for SimBridge {
    fn default() -> Self {
        Self::new(1)
    }
}

impl DeviceBridge for SimBridge {
    fn device_count(&self) -> usize {
        self.device_count
    }

    fn bind(&self, device: usize) -> CourierResult<()> {
        if device >= self.device_count {
            return Err(CourierError::new(
                Code::DeviceError,
                format!(
                    "cannot bind device {} with {} device(s) visible",
                    device, self.device_count
                ),
            ));
        }
        *self.bound.lock().unwrap() = Some(device);
        debug!("sim bridge bound device {}", device);
        Ok(())
    }

    fn alloc(&self, bytes: usize) -> CourierResult<u64> {
        let layout = Self::layout_for(bytes)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(CourierError::OutOfMemory);
        }
        let addr = ptr as u64;
        self.blocks.lock().unwrap().insert(addr, bytes.max(1));
        Ok(addr)
    }

    fn free(&self, addr: u64) -> CourierResult<()> {
        let bytes = self.blocks.lock().unwrap().remove(&addr).ok_or_else(|| {
            CourierError::Device(format!("free of unknown device address {:#x}", addr))
        })?;
        let layout = Self::layout_for(bytes)?;
        unsafe { dealloc(addr as *mut u8, layout) };
        Ok(())
    }

    unsafe fn upload(&self, src: &[u8], dst: u64) -> CourierResult<()> {
        self.check_range(dst, src.len())?;
        ptr::copy_nonoverlapping(src.as_ptr(), dst as *mut u8, src.len());
        Ok(())
    }

    unsafe fn download(&self, src: u64, dst: &mut [u8]) -> CourierResult<()> {
        self.check_range(src, dst.len())?;
        ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len());
        Ok(())
    }

    unsafe fn gather(
        &self,
        base: u64,
        offsets: &[isize],
        width: usize,
        dst: u64,
    ) -> CourierResult<()> {
        self.check_range(dst, offsets.len() * width)?;
        for (i, off) in offsets.iter().enumerate() {
            let src = offset_addr(base, *off);
            self.check_range(src, width)?;
            ptr::copy_nonoverlapping(
                src as *const u8,
                offset_addr(dst, (i * width) as isize) as *mut u8,
                width,
            );
        }
        Ok(())
    }

    unsafe fn scatter(
        &self,
        src: u64,
        base: u64,
        offsets: &[isize],
        width: usize,
    ) -> CourierResult<()> {
        self.check_range(src, offsets.len() * width)?;
        for (i, off) in offsets.iter().enumerate() {
            let dst = offset_addr(base, *off);
            self.check_range(dst, width)?;
            ptr::copy_nonoverlapping(
                offset_addr(src, (i * width) as isize) as *const u8,
                dst as *mut u8,
                width,
            );
        }
        Ok(())
    }

    fn alloc_pinned(&self, bytes: usize) -> CourierResult<*mut u8> {
        let layout = Self::layout_for(bytes)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            Err(CourierError::OutOfMemory)
        } else {
            Ok(ptr)
        }
    }

    unsafe fn free_pinned(&self, ptr: *mut u8, bytes: usize) -> CourierResult<()> {
        let layout = Self::layout_for(bytes)?;
        dealloc(ptr, layout);
        Ok(())
    }
}

impl Drop for SimBridge {
    fn drop(&mut self) {
        let blocks = self.blocks.lock().unwrap();
        for (addr, bytes) in blocks.iter() {
            debug!(
                "sim bridge dropping leaked device allocation {:#x} ({} bytes)",
                addr, bytes
            );
            if let Ok(layout) = Self::layout_for(*bytes) {
                unsafe { dealloc(*addr as *mut u8, layout) };
            }
        }
    }
}
