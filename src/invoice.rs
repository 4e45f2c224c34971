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

//! Data-layout descriptors for messages
//!
//! An [`Invoice`] describes the memory regions that make up one logical
//! message: an ordered list of typed entries, each covering a scalar or an
//! up-to-3-dimensional strided region of host or device memory. Invoices
//! borrow user memory, they never own it. The same invoice drives both
//! packing (gather into a contiguous wire buffer) and unpacking (scatter
//! back out), so a send-side and a receive-side invoice with equal shapes
//! produce byte-identical wire images.

use crate::error::{Code, CourierError, CourierResult};

/// Maximum number of dimensions a single entry may carry.
pub const MAX_DIMS: usize = 3;

/// Element types understood by the packing layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    /// Unsigned 8-bit integer, also used for raw bytes
    UInt8,
    /// Signed 16-bit integer
    Int16,
    /// Signed 32-bit integer
    Int32,
    /// Signed 64-bit integer
    Int64,
    /// 4-byte floating point value
    Float32,
    /// 8-byte floating point value
    Float64,
}

impl ElementType {
    /// Width of a single element in bytes.
    pub fn byte_width(&self) -> usize {
        match self {
            ElementType::UInt8 => 1,
            ElementType::Int16 => 2,
            ElementType::Int32 => 4,
            ElementType::Int64 => 8,
            ElementType::Float32 => 4,
            ElementType::Float64 => 8,
        }
    }
}

/// Where an entry's data lives.
///
/// `Host` carries a raw pointer into caller-owned memory. `Device` carries
/// an opaque allocation handle understood by the active
/// [`DeviceBridge`](crate::device::DeviceBridge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemLoc {
    Host(*mut u8),
    Device(u64),
}

impl MemLoc {
    pub fn is_device(&self) -> bool {
        matches!(self, MemLoc::Device(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, MemLoc::Host(p) if p.is_null())
    }
}

/// One dimension of a strided region: `len` elements, consecutive elements
/// `stride` elements apart in user memory. A stride of zero addresses the
/// same element repeatedly; negative strides walk backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dim {
    pub len: usize,
    pub stride: isize,
}

impl Dim {
    pub fn new(len: usize, stride: isize) -> Self {
        Self { len, stride }
    }

    /// Contiguous run of `len` elements.
    pub fn contiguous(len: usize) -> Self {
        Self { len, stride: 1 }
    }
}

/// One typed region described by an invoice.
#[derive(Debug, Clone)]
pub struct InvoiceEntry {
    ty: ElementType,
    loc: MemLoc,
    dims: Vec<Dim>,
}

impl InvoiceEntry {
    pub fn element_type(&self) -> ElementType {
        self.ty
    }

    pub fn loc(&self) -> MemLoc {
        self.loc
    }

    pub fn dims(&self) -> &[Dim] {
        &self.dims
    }

    /// Total number of elements in this entry.
    pub fn element_count(&self) -> usize {
        self.dims.iter().map(|d| d.len).product()
    }

    /// Serialized size of this entry in bytes.
    pub fn byte_size(&self) -> usize {
        self.element_count() * self.ty.byte_width()
    }

    /// Element offset (in elements, signed) of the logical index
    /// `(i0, i1, i2)` relative to the entry base. Missing trailing
    /// dimensions are treated as index zero.
    pub(crate) fn element_offset(&self, idx: [usize; MAX_DIMS]) -> isize {
        let mut off = 0isize;
        for (d, i) in self.dims.iter().zip(idx.iter()) {
            off += d.stride * (*i as isize);
        }
        off
    }
}

/// Ordered list of typed, strided regions making up one message.
///
/// The wire image is the concatenation of the entries in append order;
/// within an entry, the first dimension varies fastest. An invoice with no
/// entries is valid and serializes to zero bytes, which is how pure
/// synchronization messages are expressed.
#[derive(Debug, Default, Clone)]
pub struct Invoice {
    entries: Vec<InvoiceEntry>,
}

impl Invoice {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a single element at `loc`.
    ///
    /// # Safety
    ///
    /// `loc` must reference memory valid for reads and writes of one
    /// element of `ty` for as long as this invoice is packed or unpacked.
    pub unsafe fn append_scalar(&mut self, ty: ElementType, loc: MemLoc) -> CourierResult<()> {
        self.append_block(ty, loc, &[Dim::contiguous(1)])
    }

    /// Append a contiguous run of `len` elements starting at `loc`.
    ///
    /// # Safety
    ///
    /// `loc` must reference memory valid for reads and writes of `len`
    /// elements of `ty` for as long as this invoice is packed or unpacked.
    pub unsafe fn append_vector(
        &mut self,
        ty: ElementType,
        loc: MemLoc,
        len: usize,
    ) -> CourierResult<()> {
        self.append_block(ty, loc, &[Dim::contiguous(len)])
    }

    /// Append `len` elements spaced `stride` elements apart.
    ///
    /// # Safety
    ///
    /// Every element addressed by the stride pattern must be valid for
    /// reads and writes for as long as this invoice is packed or unpacked.
    pub unsafe fn append_strided(
        &mut self,
        ty: ElementType,
        loc: MemLoc,
        len: usize,
        stride: isize,
    ) -> CourierResult<()> {
        self.append_block(ty, loc, &[Dim::new(len, stride)])
    }

    /// Append a multi-dimensional region. `dims[0]` is the fastest-varying
    /// dimension on the wire.
    ///
    /// # Safety
    ///
    /// Every element addressed by the dimension pattern must be valid for
    /// reads and writes for as long as this invoice is packed or unpacked.
    pub unsafe fn append_block(
        &mut self,
        ty: ElementType,
        loc: MemLoc,
        dims: &[Dim],
    ) -> CourierResult<()> {
        if dims.is_empty() || dims.len() > MAX_DIMS {
            return Err(CourierError::new(
                Code::Invalid,
                format!("entry must have 1 to {} dimensions, got {}", MAX_DIMS, dims.len()),
            ));
        }
        if let Some(d) = dims.iter().find(|d| d.len == 0) {
            return Err(CourierError::new(
                Code::Invalid,
                format!("dimension length must be positive, got {:?}", d),
            ));
        }
        if loc.is_null() {
            return Err(CourierError::new(Code::Invalid, "entry base is null"));
        }
        self.entries.push(InvoiceEntry {
            ty,
            loc,
            dims: dims.to_vec(),
        });
        Ok(())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[InvoiceEntry] {
        &self.entries
    }

    /// Serialized size of the whole invoice in bytes, independent of the
    /// transport and of where the entries live.
    pub fn byte_size(&self) -> usize {
        self.entries.iter().map(|e| e.byte_size()).sum()
    }

    /// True if any entry lives in device memory.
    pub fn has_device_entries(&self) -> bool {
        self.entries.iter().any(|e| e.loc.is_device())
    }

    /// Drop all entries. User memory is untouched.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Re-point entry `index` at a new base without changing its shape.
    /// Used when the same communication pattern is replayed against
    /// reallocated field storage.
    ///
    /// # Safety
    ///
    /// `loc` must satisfy the same validity contract the entry was
    /// appended with.
    pub unsafe fn refresh_base(&mut self, index: usize, loc: MemLoc) -> CourierResult<()> {
        let entry = self.entries.get_mut(index).ok_or_else(|| {
            CourierError::new(
                Code::Invalid,
                format!("no entry at index {} to refresh", index),
            )
        })?;
        if loc.is_null() {
            return Err(CourierError::new(Code::Invalid, "refreshed base is null"));
        }
        entry.loc = loc;
        Ok(())
    }

    /// Check the invoice is safe to hand to the packing layer. Shape
    /// violations are rejected at append, so this only re-checks the
    /// conditions that can go stale afterwards.
    pub fn validate(&self) -> CourierResult<()> {
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.loc.is_null() {
                return Err(CourierError::new(
                    Code::Invalid,
                    format!("entry {} has a null base", i),
                ));
            }
        }
        Ok(())
    }
}
