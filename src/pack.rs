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

//! Packing and unpacking between user memory and wire buffers
//!
//! A [`Packer`] turns an invoice plus the memory it references into a
//! contiguous [`WireBuffer`] and back. Host entries are strided copies;
//! device entries go through the bridge's gather/scatter kernels and cross
//! the host/device line either directly or via a pinned staging buffer,
//! depending on the context's direct-device-transport policy. The invoice
//! itself stays transport- and memory-space-agnostic, so packing a given
//! layout from host and from device memory produces byte-identical wire
//! images, and `unpack(pack(x))` reproduces `x` exactly.

mod device;
mod host;
mod staging;

use std::sync::Arc;

use log::trace;

use crate::context::CourierContext;
use crate::device::DeviceBridge;
use crate::error::{Code, CourierError, CourierResult};
use crate::invoice::{Invoice, MemLoc};
use crate::util::fmt_bytes;

use staging::StagingBuffer;

/// Contiguous serialized image of one invoice.
#[derive(Debug)]
pub struct WireBuffer {
    bytes: Vec<u8>,
}

impl WireBuffer {
    pub(crate) fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Serializes invoices into wire buffers and scatters them back out.
///
/// Owns the pinned staging buffer used by the staged device path. Not
/// thread-safe; each engine owns its own packer on the rank's control
/// thread.
pub struct Packer {
    bridge: Option<Arc<dyn DeviceBridge>>,
    direct: bool,
    staging: Option<StagingBuffer>,
}

impl Packer {
    /// Build a packer following the context's device policy. When the
    /// staged path applies and the context carries a pool capacity, the
    /// staging buffer is pre-sized here.
    pub fn new(ctx: &CourierContext) -> CourierResult<Self> {
        let bridge = ctx.get_device_bridge();
        let direct = ctx.direct_device_transport();
        let staging = match &bridge {
            Some(_) if !direct => {
                let mut buffer = StagingBuffer::new(ctx.get_memory_pool());
                if ctx.get_pool_capacity() > 0 {
                    buffer.ensure(ctx.get_pool_capacity())?;
                }
                Some(buffer)
            }
            _ => None,
        };
        Ok(Self {
            bridge,
            direct,
            staging,
        })
    }

    /// True when device entries skip the pinned bounce.
    pub fn is_direct(&self) -> bool {
        self.direct
    }

    /// Gather every entry of `invoice` into one contiguous buffer, in
    /// entry order. An empty invoice packs to an empty buffer.
    pub fn pack(&mut self, invoice: &Invoice) -> CourierResult<WireBuffer> {
        invoice.validate()?;
        self.prepare_staging(invoice)?;
        let mut bytes = vec![0u8; invoice.byte_size()];
        let mut cursor = 0usize;
        for entry in invoice.entries() {
            let len = entry.byte_size();
            let out = &mut bytes[cursor..cursor + len];
            match entry.loc() {
                // SAFETY: the caller guaranteed the entry's region valid
                // for reads when appending it.
                MemLoc::Host(base) => unsafe { host::gather(entry, base, out) },
                MemLoc::Device(base) => {
                    let bridge = self.require_bridge()?;
                    device::gather_entry(bridge.as_ref(), self.staging.as_mut(), entry, base, out)?;
                }
            }
            cursor += len;
        }
        trace!(
            "packed {} entr(ies) into {}",
            invoice.entry_count(),
            fmt_bytes(bytes.len())
        );
        Ok(WireBuffer::from_bytes(bytes))
    }

    /// Scatter a wire image back into the regions `invoice` describes.
    /// Exact inverse of [`pack`](Packer::pack) over the same layout.
    pub fn unpack(&mut self, bytes: &[u8], invoice: &Invoice) -> CourierResult<()> {
        invoice.validate()?;
        if bytes.len() != invoice.byte_size() {
            return Err(CourierError::new(
                Code::Invalid,
                format!(
                    "wire image is {} bytes where the layout holds {}",
                    bytes.len(),
                    invoice.byte_size()
                ),
            ));
        }
        self.prepare_staging(invoice)?;
        let mut cursor = 0usize;
        for entry in invoice.entries() {
            let len = entry.byte_size();
            let input = &bytes[cursor..cursor + len];
            match entry.loc() {
                // SAFETY: the caller guaranteed the entry's region valid
                // for writes when appending it.
                MemLoc::Host(base) => unsafe { host::scatter(entry, base, input) },
                MemLoc::Device(base) => {
                    let bridge = self.require_bridge()?;
                    device::scatter_entry(
                        bridge.as_ref(),
                        self.staging.as_mut(),
                        entry,
                        base,
                        input,
                    )?;
                }
            }
            cursor += len;
        }
        trace!(
            "unpacked {} into {} entr(ies)",
            fmt_bytes(bytes.len()),
            invoice.entry_count()
        );
        Ok(())
    }

    /// Grow the staging buffer to the whole invoice up front, so the
    /// per-entry bounce never reallocates mid-message.
    fn prepare_staging(&mut self, invoice: &Invoice) -> CourierResult<()> {
        if invoice.has_device_entries() {
            if let Some(buffer) = self.staging.as_mut() {
                buffer.ensure(invoice.byte_size())?;
            }
        }
        Ok(())
    }

    fn require_bridge(&self) -> CourierResult<Arc<dyn DeviceBridge>> {
        self.bridge.clone().ok_or_else(|| {
            CourierError::new(
                Code::DeviceError,
                "invoice has device entries but the context has no device bridge",
            )
        })
    }
}
