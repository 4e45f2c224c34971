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

//! In-process fabric
//!
//! All ranks live in one process and exchange messages through shared
//! mailboxes. A world of one is the self-loop configuration used by
//! sequential runs; larger worlds back multi-rank tests and single-node
//! tools, with one thread standing in for each rank.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace};

use crate::error::{Code, CourierError, CourierResult};
use crate::net::mailbox::Mailbox;
use crate::net::{check_peer, Completion, TicketId, Transport, TransportKind};

enum LoopbackTicket {
    Sent,
    Recv { src: i32, tag: i32, len: usize },
}

/// One rank's endpoint on the in-process fabric.
pub struct LoopbackTransport {
    rank: i32,
    world_size: i32,
    mailboxes: Vec<Arc<Mailbox>>,
    tickets: Mutex<HashMap<TicketId, LoopbackTicket>>,
    next_ticket: AtomicU64,
}

/// Factory for fully-connected in-process worlds.
pub struct LoopbackFabric;

impl LoopbackFabric {
    /// Create a world of `world_size` ranks. Element `r` of the returned
    /// vector is rank `r`'s endpoint.
    pub fn create(world_size: i32) -> CourierResult<Vec<LoopbackTransport>> {
        if world_size < 1 {
            return Err(CourierError::new(
                Code::Invalid,
                format!("loopback world size must be at least 1, got {}", world_size),
            ));
        }
        let mailboxes: Vec<Arc<Mailbox>> = (0..world_size).map(|_| Arc::new(Mailbox::new())).collect();
        debug!("loopback fabric created with {} rank(s)", world_size);
        Ok((0..world_size)
            .map(|rank| LoopbackTransport {
                rank,
                world_size,
                mailboxes: mailboxes.clone(),
                tickets: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(1),
            })
            .collect())
    }
}

impl LoopbackTransport {
    fn register(&self, ticket: LoopbackTicket) -> TicketId {
        let id = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.tickets.lock().unwrap().insert(id, ticket);
        id
    }

    fn lookup_recv(&self, ticket: TicketId) -> CourierResult<Option<(i32, i32, usize)>> {
        let tickets = self.tickets.lock().unwrap();
        match tickets.get(&ticket) {
            Some(LoopbackTicket::Sent) => Ok(None),
            Some(LoopbackTicket::Recv { src, tag, len }) => Ok(Some((*src, *tag, *len))),
            None => Err(CourierError::new(
                Code::Invalid,
                format!("unknown transport ticket {}", ticket),
            )),
        }
    }

    fn consume(&self, ticket: TicketId) {
        self.tickets.lock().unwrap().remove(&ticket);
    }

    fn check_length(
        &self,
        ticket: TicketId,
        expected: usize,
        data: Vec<u8>,
    ) -> CourierResult<Completion> {
        self.consume(ticket);
        if data.len() != expected {
            return Err(CourierError::new(
                Code::Invalid,
                format!(
                    "rank {} received {} bytes where the posted layout holds {}",
                    self.rank,
                    data.len(),
                    expected
                ),
            ));
        }
        Ok(Completion::Received(data))
    }
}

impl Transport for LoopbackTransport {
    fn get_kind(&self) -> TransportKind {
        TransportKind::Loopback
    }

    fn get_rank(&self) -> i32 {
        self.rank
    }

    fn get_world_size(&self) -> i32 {
        self.world_size
    }

    fn get_node_local_rank(&self) -> i32 {
        // every loopback rank shares the process, hence the node
        self.rank
    }

    fn supports_device_buffers(&self) -> bool {
        // device allocations stay addressable across in-process ranks
        true
    }

    fn post_send(&self, dest: i32, tag: i32, data: Vec<u8>) -> CourierResult<TicketId> {
        check_peer(dest, self.world_size)?;
        trace!(
            "loopback rank {} send {} bytes to {} tag {}",
            self.rank,
            data.len(),
            dest,
            tag
        );
        self.mailboxes[dest as usize].deliver(self.rank, tag, data)?;
        Ok(self.register(LoopbackTicket::Sent))
    }

    fn post_recv(&self, src: i32, tag: i32, len: usize) -> CourierResult<TicketId> {
        check_peer(src, self.world_size)?;
        trace!(
            "loopback rank {} post receive of {} bytes from {} tag {}",
            self.rank,
            len,
            src,
            tag
        );
        Ok(self.register(LoopbackTicket::Recv { src, tag, len }))
    }

    fn try_complete(&self, ticket: TicketId) -> CourierResult<Option<Completion>> {
        match self.lookup_recv(ticket)? {
            None => {
                self.consume(ticket);
                Ok(Some(Completion::Sent))
            }
            Some((src, tag, len)) => {
                match self.mailboxes[self.rank as usize].try_take(src, tag) {
                    Ok(Some(data)) => self.check_length(ticket, len, data).map(Some),
                    Ok(None) => Ok(None),
                    Err(e) => {
                        self.consume(ticket);
                        Err(e)
                    }
                }
            }
        }
    }

    fn wait_complete(&self, ticket: TicketId) -> CourierResult<Completion> {
        match self.lookup_recv(ticket)? {
            None => {
                self.consume(ticket);
                Ok(Completion::Sent)
            }
            Some((src, tag, len)) => {
                match self.mailboxes[self.rank as usize].take_blocking(src, tag) {
                    Ok(data) => self.check_length(ticket, len, data),
                    Err(e) => {
                        self.consume(ticket);
                        Err(e)
                    }
                }
            }
        }
    }

    fn wait_complete_timeout(
        &self,
        ticket: TicketId,
        timeout: Duration,
    ) -> CourierResult<Option<Completion>> {
        match self.lookup_recv(ticket)? {
            None => {
                self.consume(ticket);
                Ok(Some(Completion::Sent))
            }
            Some((src, tag, len)) => {
                match self.mailboxes[self.rank as usize].take_timeout(src, tag, timeout) {
                    Ok(Some(data)) => self.check_length(ticket, len, data).map(Some),
                    Ok(None) => Ok(None),
                    Err(e) => {
                        self.consume(ticket);
                        Err(e)
                    }
                }
            }
        }
    }

    fn finalize(&self) -> CourierResult<()> {
        debug!("loopback rank {} shutting down", self.rank);
        self.mailboxes[self.rank as usize].close();
        Ok(())
    }
}
