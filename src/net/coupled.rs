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

//! Coupled-model sub-partition
//!
//! When the solver runs inside a larger coupled simulation, only a subset
//! of the global ranks belongs to it; the rest drive the external model.
//! This wrapper presents that subset as a dense world of its own: local
//! ranks `0..n` map onto the member list, and peers outside the subset
//! are unreachable through it.

use std::fmt;
use std::time::Duration;

use log::debug;

use crate::error::{Code, CourierError, CourierResult};
use crate::net::{check_peer, Completion, TicketId, Transport, TransportKind};

/// Sub-partition view over another transport.
pub struct CoupledTransport {
    inner: Box<dyn Transport>,
    // global ranks of the members, index = local rank
    members: Vec<i32>,
    local_rank: i32,
}

impl CoupledTransport {
    /// Wrap `inner`, restricting it to `members` (global ranks, one entry
    /// per local rank in order). The wrapping process must itself be a
    /// member. On a bad member list `inner` is finalized before the error
    /// is returned, leaving no half-initialized fabric behind.
    pub fn wrap(inner: Box<dyn Transport>, members: Vec<i32>) -> CourierResult<Self> {
        match Self::local_rank_in(inner.as_ref(), &members) {
            Ok(local_rank) => {
                debug!(
                    "coupled partition: global rank {} is local rank {}/{}",
                    inner.get_rank(),
                    local_rank,
                    members.len()
                );
                Ok(Self {
                    inner,
                    members,
                    local_rank,
                })
            }
            Err(e) => {
                inner.finalize().ok();
                Err(e)
            }
        }
    }

    fn local_rank_in(inner: &dyn Transport, members: &[i32]) -> CourierResult<i32> {
        if members.is_empty() {
            return Err(CourierError::new(
                Code::Invalid,
                "coupled partition has no members",
            ));
        }
        let world = inner.get_world_size();
        for m in members {
            check_peer(*m, world)?;
        }
        let mut sorted = members.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        if sorted.len() != members.len() {
            return Err(CourierError::new(
                Code::Invalid,
                "coupled partition lists a rank twice",
            ));
        }
        let global_rank = inner.get_rank();
        members
            .iter()
            .position(|m| *m == global_rank)
            .map(|p| p as i32)
            .ok_or_else(|| {
                CourierError::new(
                    Code::Invalid,
                    format!(
                        "rank {} is not a member of the coupled partition {:?}",
                        global_rank, members
                    ),
                )
            })
    }

    fn to_global(&self, local: i32) -> CourierResult<i32> {
        check_peer(local, self.members.len() as i32)?;
        Ok(self.members[local as usize])
    }
}

impl fmt::Debug for CoupledTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoupledTransport")
            .field("members", &self.members)
            .field("local_rank", &self.local_rank)
            .finish_non_exhaustive()
    }
}

impl Transport for CoupledTransport {
    fn get_kind(&self) -> TransportKind {
        TransportKind::Coupled
    }

    fn get_rank(&self) -> i32 {
        self.local_rank
    }

    fn get_world_size(&self) -> i32 {
        self.members.len() as i32
    }

    fn get_node_local_rank(&self) -> i32 {
        self.inner.get_node_local_rank()
    }

    fn supports_device_buffers(&self) -> bool {
        self.inner.supports_device_buffers()
    }

    fn post_send(&self, dest: i32, tag: i32, data: Vec<u8>) -> CourierResult<TicketId> {
        let global = self.to_global(dest)?;
        self.inner.post_send(global, tag, data)
    }

    fn post_recv(&self, src: i32, tag: i32, len: usize) -> CourierResult<TicketId> {
        let global = self.to_global(src)?;
        self.inner.post_recv(global, tag, len)
    }

    fn try_complete(&self, ticket: TicketId) -> CourierResult<Option<Completion>> {
        self.inner.try_complete(ticket)
    }

    fn wait_complete(&self, ticket: TicketId) -> CourierResult<Completion> {
        self.inner.wait_complete(ticket)
    }

    fn wait_complete_timeout(
        &self,
        ticket: TicketId,
        timeout: Duration,
    ) -> CourierResult<Option<Completion>> {
        self.inner.wait_complete_timeout(ticket, timeout)
    }

    fn finalize(&self) -> CourierResult<()> {
        self.inner.finalize()
    }
}
