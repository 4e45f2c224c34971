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

//! Collective operations
//!
//! Broadcast runs a binomial tree rooted at the caller-named rank;
//! all-reduce runs recursive doubling with a fixup step for worlds that
//! are not a power of two; barrier is an all-reduce of a one-byte token
//! with a no-op combiner. All of them are blocking and must be entered by
//! every rank of the world in the same order, with invoices describing
//! the same element types and counts on every rank. Collective traffic
//! rides on reserved negative tags so it never collides with user
//! point-to-point tags, which are non-negative.

use log::debug;

use crate::context::CourierContext;
use crate::error::{Code, CourierError, CourierResult};
use crate::invoice::{ElementType, Invoice};
use crate::net::{check_peer, Completion};
use crate::pack::Packer;

/// Element-wise combiner applied by [`CollectiveEngine::all_reduce`].
///
/// Integer sum and product wrap on overflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Prod,
    Min,
    Max,
}

const BCAST_TAG: i32 = -1;
const ALLREDUCE_TAG: i32 = -2;
const BARRIER_TAG: i32 = -3;

/// Map ranks so the collective can be written as if `root` were rank 0.
#[inline]
fn transform_rank(rank: i32, root: i32, world: i32, forward: bool) -> i32 {
    if forward {
        (rank + world - root) % world
    } else {
        (rank + root) % world
    }
}

#[inline]
fn ceil_log2(n: i32) -> i32 {
    if n <= 1 {
        0
    } else {
        (32 - (n - 1).leading_zeros()) as i32
    }
}

#[inline]
fn floor_log2(n: i32) -> i32 {
    if n <= 0 {
        0
    } else {
        (31 - n.leading_zeros()) as i32
    }
}

impl ReduceOp {
    /// Combine `other` into `acc`, both raw images of `ty` elements.
    fn combine(self, ty: ElementType, acc: &mut [u8], other: &[u8]) {
        macro_rules! fold_int {
            ($ty:ty) => {{
                let width = std::mem::size_of::<$ty>();
                for (a, b) in acc.chunks_exact_mut(width).zip(other.chunks_exact(width)) {
                    let x = <$ty>::from_ne_bytes(a.try_into().unwrap());
                    let y = <$ty>::from_ne_bytes(b.try_into().unwrap());
                    let r = match self {
                        ReduceOp::Sum => x.wrapping_add(y),
                        ReduceOp::Prod => x.wrapping_mul(y),
                        ReduceOp::Min => x.min(y),
                        ReduceOp::Max => x.max(y),
                    };
                    a.copy_from_slice(&r.to_ne_bytes());
                }
            }};
        }
        macro_rules! fold_float {
            ($ty:ty) => {{
                let width = std::mem::size_of::<$ty>();
                for (a, b) in acc.chunks_exact_mut(width).zip(other.chunks_exact(width)) {
                    let x = <$ty>::from_ne_bytes(a.try_into().unwrap());
                    let y = <$ty>::from_ne_bytes(b.try_into().unwrap());
                    let r = match self {
                        ReduceOp::Sum => x + y,
                        ReduceOp::Prod => x * y,
                        ReduceOp::Min => x.min(y),
                        ReduceOp::Max => x.max(y),
                    };
                    a.copy_from_slice(&r.to_ne_bytes());
                }
            }};
        }
        match ty {
            ElementType::UInt8 => fold_int!(u8),
            ElementType::Int16 => fold_int!(i16),
            ElementType::Int32 => fold_int!(i32),
            ElementType::Int64 => fold_int!(i64),
            ElementType::Float32 => fold_float!(f32),
            ElementType::Float64 => fold_float!(f64),
        }
    }
}

/// Combine two wire images entry by entry. `segments` carries the element
/// type and byte length of each invoice entry in wire order.
fn combine_wire(segments: &[(ElementType, usize)], op: ReduceOp, acc: &mut [u8], other: &[u8]) {
    let mut off = 0;
    for &(ty, len) in segments {
        op.combine(ty, &mut acc[off..off + len], &other[off..off + len]);
        off += len;
    }
}

/// Blocking collectives over the context's transport.
pub struct CollectiveEngine<'a> {
    ctx: &'a CourierContext,
    packer: Packer,
}

impl<'a> CollectiveEngine<'a> {
    pub fn new(ctx: &'a CourierContext) -> CourierResult<Self> {
        let packer = Packer::new(ctx)?;
        Ok(Self { ctx, packer })
    }

    /// Replicate `root`'s invoice contents into every other rank's
    /// invoice. The invoice must describe the same element types and
    /// counts on all ranks; bases may differ.
    pub fn broadcast(&mut self, invoice: &Invoice, root: i32) -> CourierResult<()> {
        let world = self.ctx.get_world_size();
        check_peer(root, world)?;
        invoice.validate()?;
        if world == 1 {
            return Ok(());
        }

        let rank = self.ctx.get_rank();
        let size = invoice.byte_size();
        let rounds = ceil_log2(world);
        let t = transform_rank(rank, root, world, true);
        debug!(
            "rank {} broadcast of {} bytes from root {} over {} round(s)",
            rank, size, root, rounds
        );

        let mut wire = if rank == root {
            self.packer.pack(invoice)?.into_bytes()
        } else {
            Vec::new()
        };

        // Highest round first: parents forward as soon as they hold the
        // payload, receivers turn into parents in later rounds.
        for i in (0..rounds).rev() {
            let power = 1_i32 << i;
            let rcpt = t + power;
            if t % (1 << (i + 1)) == 0 && rcpt < world {
                let dest = transform_rank(rcpt, root, world, false);
                self.send_bytes(dest, BCAST_TAG, wire.clone())?;
            } else if t % power == 0 && t % (1 << (i + 1)) != 0 {
                let src = transform_rank(t - power, root, world, false);
                wire = self.recv_bytes(src, BCAST_TAG, size)?;
            }
        }

        if rank != root {
            self.packer.unpack(&wire, invoice)?;
        }
        Ok(())
    }

    /// Reduce every rank's invoice contents element-wise under `op` and
    /// leave the result in the invoice on every rank.
    pub fn all_reduce(&mut self, invoice: &Invoice, op: ReduceOp) -> CourierResult<()> {
        invoice.validate()?;
        let segments: Vec<(ElementType, usize)> = invoice
            .entries()
            .iter()
            .map(|e| (e.element_type(), e.byte_size()))
            .collect();
        debug!(
            "rank {} all-reduce {:?} over {} bytes",
            self.ctx.get_rank(),
            op,
            invoice.byte_size()
        );
        let wire = self.packer.pack(invoice)?.into_bytes();
        let combined = self.exchange_reduced(
            wire,
            |acc, other| combine_wire(&segments, op, acc, other),
            ALLREDUCE_TAG,
        )?;
        self.packer.unpack(&combined, invoice)
    }

    /// Block until every rank of the world has entered.
    pub fn barrier(&mut self) -> CourierResult<()> {
        debug!("rank {} entering barrier", self.ctx.get_rank());
        self.exchange_reduced(vec![1u8], |_, _| {}, BARRIER_TAG)?;
        Ok(())
    }

    /// Recursive-doubling exchange. Ranks above the nearest power of two
    /// fold their contribution into a partner below it first and collect
    /// the finished result from that partner at the end.
    fn exchange_reduced<F>(
        &self,
        mut wire: Vec<u8>,
        combine: F,
        tag: i32,
    ) -> CourierResult<Vec<u8>>
    where
        F: Fn(&mut [u8], &[u8]),
    {
        let rank = self.ctx.get_rank();
        let world = self.ctx.get_world_size();
        let rounds = floor_log2(world);
        let npot = 1_i32 << rounds;
        let size = wire.len();

        if world > npot {
            if rank < npot && rank + npot < world {
                let other = self.recv_bytes(rank + npot, tag, size)?;
                combine(&mut wire, &other);
            } else if rank >= npot {
                self.send_bytes(rank - npot, tag, wire.clone())?;
            }
        }

        if rank < npot {
            for i in 0..rounds {
                let peer = rank ^ (1_i32 << i);
                // Higher rank of the pair sends first so the two sides
                // never both block on a receive.
                let other = if peer < rank {
                    self.send_bytes(peer, tag, wire.clone())?;
                    self.recv_bytes(peer, tag, size)?
                } else {
                    let other = self.recv_bytes(peer, tag, size)?;
                    self.send_bytes(peer, tag, wire.clone())?;
                    other
                };
                combine(&mut wire, &other);
            }
        }

        if world > npot {
            if rank < npot && rank + npot < world {
                self.send_bytes(rank + npot, tag, wire.clone())?;
            } else if rank >= npot {
                wire = self.recv_bytes(rank - npot, tag, size)?;
            }
        }

        Ok(wire)
    }

    fn send_bytes(&self, dest: i32, tag: i32, bytes: Vec<u8>) -> CourierResult<()> {
        let transport = self.ctx.get_transport();
        let ticket = transport.post_send(dest, tag, bytes)?;
        match transport.wait_complete(ticket)? {
            Completion::Sent => Ok(()),
            Completion::Received(_) => Err(CourierError::new(
                Code::ExecutionError,
                "send ticket completed with a payload",
            )),
        }
    }

    fn recv_bytes(&self, src: i32, tag: i32, len: usize) -> CourierResult<Vec<u8>> {
        let transport = self.ctx.get_transport();
        let ticket = transport.post_recv(src, tag, len)?;
        match transport.wait_complete(ticket)? {
            Completion::Received(bytes) => Ok(bytes),
            Completion::Sent => Err(CourierError::new(
                Code::ExecutionError,
                "receive ticket completed without a payload",
            )),
        }
    }
}
