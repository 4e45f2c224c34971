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

//! Point-to-point engine
//!
//! Posts asynchronous sends and receives keyed to an invoice and tracks
//! each one through a [`TransportHandle`]. Sends pack at post time on the
//! calling thread; receives are sized from the invoice and unpacked
//! automatically into its layout the moment the completing `test` or
//! `wait` observes the payload. Handles move `Posted -> Completed ->
//! Cleared`, one handle per post. Misuse of a handle, such as clearing
//! it twice or clearing it while incomplete, is a programmer error
//! reported with its rank, peer, and tag, then fatal; continuing would
//! leave the communication state corrupted.

use std::time::Duration;

use log::{error, trace};

use crate::context::CourierContext;
use crate::error::CourierResult;
use crate::invoice::Invoice;
use crate::net::Completion;
use crate::net::TicketId;
use crate::pack::Packer;
use crate::util::fmt_bytes;

/// Where a handle is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Posted to the transport, not yet observed complete
    Posted,
    /// Observed complete (and unpacked, for receives); awaiting clear
    Completed,
    /// Cleared; terminal
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Send,
    Receive,
}

/// One in-flight send or receive.
///
/// Receive handles carry a copy of the destination layout taken at post
/// time, so a later `refresh` of the posting invoice does not affect
/// transfers already in flight.
pub struct TransportHandle {
    ticket: TicketId,
    peer: i32,
    tag: i32,
    direction: Direction,
    state: HandleState,
    layout: Option<Invoice>,
}

impl TransportHandle {
    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn peer(&self) -> i32 {
        self.peer
    }

    pub fn tag(&self) -> i32 {
        self.tag
    }

    pub fn is_send(&self) -> bool {
        self.direction == Direction::Send
    }
}

/// Asynchronous sends and receives over the context's transport.
pub struct P2pEngine<'a> {
    ctx: &'a CourierContext,
    packer: Packer,
}

impl<'a> P2pEngine<'a> {
    pub fn new(ctx: &'a CourierContext) -> CourierResult<Self> {
        let packer = Packer::new(ctx)?;
        Ok(Self { ctx, packer })
    }

    /// Pack `invoice` and hand the buffer to the transport. Returns
    /// immediately with a `Posted` handle.
    pub fn send(
        &mut self,
        invoice: &Invoice,
        dest: i32,
        tag: i32,
    ) -> CourierResult<TransportHandle> {
        let wire = self.packer.pack(invoice)?;
        trace!(
            "rank {} posting send of {} to rank {} tag {}",
            self.ctx.get_rank(),
            fmt_bytes(wire.len()),
            dest,
            tag
        );
        let ticket = self
            .ctx
            .get_transport()
            .post_send(dest, tag, wire.into_bytes())?;
        Ok(TransportHandle {
            ticket,
            peer: dest,
            tag,
            direction: Direction::Send,
            state: HandleState::Posted,
            layout: None,
        })
    }

    /// Post a receive sized from `invoice.byte_size()`. The invoice must
    /// already describe the exact layout the arriving bytes will be
    /// unpacked into.
    pub fn post_receive(
        &mut self,
        invoice: &Invoice,
        src: i32,
        tag: i32,
    ) -> CourierResult<TransportHandle> {
        invoice.validate()?;
        let len = invoice.byte_size();
        trace!(
            "rank {} posting receive of {} from rank {} tag {}",
            self.ctx.get_rank(),
            fmt_bytes(len),
            src,
            tag
        );
        let ticket = self.ctx.get_transport().post_recv(src, tag, len)?;
        Ok(TransportHandle {
            ticket,
            peer: src,
            tag,
            direction: Direction::Receive,
            state: HandleState::Posted,
            layout: Some(invoice.clone()),
        })
    }

    /// Non-blocking completion check. A receive that completes here is
    /// unpacked into its layout before `true` is returned. May be called
    /// any number of times; keeps returning `true` once complete.
    pub fn test(&mut self, handle: &mut TransportHandle) -> CourierResult<bool> {
        match handle.state {
            HandleState::Cleared => self.fatal_usage("test of a cleared handle", handle),
            HandleState::Completed => Ok(true),
            HandleState::Posted => {
                match self.ctx.get_transport().try_complete(handle.ticket) {
                    Ok(None) => Ok(false),
                    Ok(Some(completion)) => {
                        self.finish(handle, completion)?;
                        Ok(true)
                    }
                    Err(e) => {
                        handle.state = HandleState::Completed;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Block until the transfer completes, then unpack it if it is a
    /// receive.
    pub fn wait(&mut self, handle: &mut TransportHandle) -> CourierResult<()> {
        match handle.state {
            HandleState::Cleared => self.fatal_usage("wait on a cleared handle", handle),
            HandleState::Completed => Ok(()),
            HandleState::Posted => match self.ctx.get_transport().wait_complete(handle.ticket) {
                Ok(completion) => self.finish(handle, completion),
                Err(e) => {
                    handle.state = HandleState::Completed;
                    Err(e)
                }
            },
        }
    }

    /// Like [`wait`](P2pEngine::wait) but gives up after `timeout`,
    /// returning `false` with the handle still posted. The layer itself
    /// imposes no bound; this is the caller-side one.
    pub fn wait_timeout(
        &mut self,
        handle: &mut TransportHandle,
        timeout: Duration,
    ) -> CourierResult<bool> {
        match handle.state {
            HandleState::Cleared => self.fatal_usage("wait on a cleared handle", handle),
            HandleState::Completed => Ok(true),
            HandleState::Posted => {
                match self
                    .ctx
                    .get_transport()
                    .wait_complete_timeout(handle.ticket, timeout)
                {
                    Ok(None) => Ok(false),
                    Ok(Some(completion)) => {
                        self.finish(handle, completion)?;
                        Ok(true)
                    }
                    Err(e) => {
                        handle.state = HandleState::Completed;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Release the handle's resources. Exactly one clear per handle,
    /// only after completion; anything else is fatal.
    pub fn clear(&mut self, handle: &mut TransportHandle) {
        match handle.state {
            HandleState::Posted => self.fatal_usage("clear of an incomplete handle", handle),
            HandleState::Cleared => self.fatal_usage("handle cleared twice", handle),
            HandleState::Completed => {
                handle.layout = None;
                handle.state = HandleState::Cleared;
                trace!(
                    "rank {} cleared handle for rank {} tag {}",
                    self.ctx.get_rank(),
                    handle.peer,
                    handle.tag
                );
            }
        }
    }

    fn finish(
        &mut self,
        handle: &mut TransportHandle,
        completion: Completion,
    ) -> CourierResult<()> {
        // Mark completed before unpacking so a failed unpack still
        // leaves the handle clearable.
        handle.state = HandleState::Completed;
        match completion {
            Completion::Sent => {
                trace!(
                    "rank {} send to rank {} tag {} complete",
                    self.ctx.get_rank(),
                    handle.peer,
                    handle.tag
                );
                Ok(())
            }
            Completion::Received(bytes) => {
                trace!(
                    "rank {} receive of {} from rank {} tag {} complete",
                    self.ctx.get_rank(),
                    fmt_bytes(bytes.len()),
                    handle.peer,
                    handle.tag
                );
                match &handle.layout {
                    Some(layout) => self.packer.unpack(&bytes, layout),
                    None => Err(crate::error::CourierError::new(
                        crate::error::Code::ExecutionError,
                        "send ticket completed with a payload",
                    )),
                }
            }
        }
    }

    fn fatal_usage(&self, what: &str, handle: &TransportHandle) -> ! {
        error!(
            "rank {}: {} (peer {}, tag {})",
            self.ctx.get_rank(),
            what,
            handle.peer,
            handle.tag
        );
        panic!("{}", what);
    }
}
