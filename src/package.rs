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

//! Precomputed halo-exchange patterns
//!
//! A [`Package`] pins down the neighbour topology of one exchange phase:
//! per neighbour, one invoice describing what to send and one describing
//! where received data lands. Built once, it is replayed every step of a
//! run through [`Package::exchange`]; when the buffers move between steps
//! the bases are refreshed in place without rebuilding the pattern.
//!
//! Every rank of the world must build its packages in the same order, so
//! the tag drawn from the context sequence matches across ranks. Links to
//! the same peer must appear in the same relative order on both sides;
//! within one tag the transport matches them by posting order.

use log::info;

use crate::context::CourierContext;
use crate::error::{Code, CourierError, CourierResult};
use crate::invoice::{Invoice, MemLoc};
use crate::net::check_peer;
use crate::p2p::P2pEngine;

/// Keeps exchange traffic clear of application point-to-point tags,
/// which are expected to stay below this.
const EXCHANGE_TAG_BASE: i32 = 1 << 20;

/// One neighbour of the exchange: what goes out and where arrivals land.
#[derive(Debug)]
pub struct HaloLink {
    peer: i32,
    send: Invoice,
    recv: Invoice,
}

impl HaloLink {
    pub fn new(peer: i32, send: Invoice, recv: Invoice) -> Self {
        Self { peer, send, recv }
    }

    pub fn peer(&self) -> i32 {
        self.peer
    }

    pub fn send(&self) -> &Invoice {
        &self.send
    }

    pub fn recv(&self) -> &Invoice {
        &self.recv
    }
}

/// Replacement bases for one link, entry by entry, used by
/// [`Package::refresh`].
pub struct LinkBases {
    pub send: Vec<MemLoc>,
    pub recv: Vec<MemLoc>,
}

/// A reusable exchange pattern over a fixed neighbour topology.
#[derive(Debug)]
pub struct Package {
    links: Vec<HaloLink>,
    tag: i32,
    rank: i32,
}

impl Package {
    /// Validate the topology and claim a tag for it from the context
    /// sequence. A link whose peer is this rank itself is legal and
    /// models a periodic boundary folding back onto the same rank.
    pub fn build(ctx: &CourierContext, links: Vec<HaloLink>) -> CourierResult<Self> {
        let world = ctx.get_world_size();
        for link in &links {
            check_peer(link.peer, world)?;
            link.send.validate()?;
            link.recv.validate()?;
        }
        let tag = EXCHANGE_TAG_BASE + ctx.get_next_sequence();
        let rank = ctx.get_rank();
        info!(
            "rank {} built exchange package tag {} with {} link(s)",
            rank,
            tag,
            links.len()
        );
        Ok(Self { links, tag, rank })
    }

    /// Point every link at new buffers without rebuilding the topology.
    /// `bases` holds one entry per link, in link order.
    ///
    /// # Safety
    ///
    /// Every location must satisfy the validity contract of the invoice
    /// entry it replaces.
    pub unsafe fn refresh(&mut self, bases: &[LinkBases]) -> CourierResult<()> {
        if bases.len() != self.links.len() {
            return Err(CourierError::new(
                Code::Invalid,
                format!(
                    "refresh carries {} base set(s) for {} link(s)",
                    bases.len(),
                    self.links.len()
                ),
            ));
        }
        for (link, link_bases) in self.links.iter_mut().zip(bases) {
            if link_bases.send.len() != link.send.entry_count()
                || link_bases.recv.len() != link.recv.entry_count()
            {
                return Err(CourierError::new(
                    Code::Invalid,
                    format!(
                        "refresh for peer {} carries {} send and {} recv base(s) \
                         for invoices of {} and {} entries",
                        link.peer,
                        link_bases.send.len(),
                        link_bases.recv.len(),
                        link.send.entry_count(),
                        link.recv.entry_count()
                    ),
                ));
            }
            for (i, &loc) in link_bases.send.iter().enumerate() {
                link.send.refresh_base(i, loc)?;
            }
            for (i, &loc) in link_bases.recv.iter().enumerate() {
                link.recv.refresh_base(i, loc)?;
            }
        }
        Ok(())
    }

    /// Run one full exchange: receives post first in link order, then
    /// sends, then everything is waited and cleared. Returns when all
    /// arrivals are unpacked into their recv invoices and all sends are
    /// on the wire. On error the exchange is abandoned with transfers
    /// possibly in flight; the caller is expected to tear the context
    /// down rather than retry.
    pub fn exchange(&mut self, p2p: &mut P2pEngine) -> CourierResult<()> {
        let mut recv_handles = Vec::with_capacity(self.links.len());
        for link in &self.links {
            recv_handles.push(p2p.post_receive(&link.recv, link.peer, self.tag)?);
        }
        let mut send_handles = Vec::with_capacity(self.links.len());
        for link in &self.links {
            send_handles.push(p2p.send(&link.send, link.peer, self.tag)?);
        }
        for handle in &mut recv_handles {
            p2p.wait(handle)?;
        }
        for handle in &mut send_handles {
            p2p.wait(handle)?;
        }
        for handle in recv_handles.iter_mut().chain(send_handles.iter_mut()) {
            p2p.clear(handle);
        }
        Ok(())
    }

    pub fn links(&self) -> &[HaloLink] {
        &self.links
    }

    pub fn tag(&self) -> i32 {
        self.tag
    }

    pub fn rank(&self) -> i32 {
        self.rank
    }
}
