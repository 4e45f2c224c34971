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

//! Transport backends
//!
//! Everything above this module sees byte-level, tag-addressed messaging
//! through the [`Transport`] trait; the concrete backend is selected once
//! at context initialization. Backends only move contiguous byte buffers;
//! layout, typing, and device staging are handled by the packing layer.

pub mod coupled;
pub mod loopback;
pub(crate) mod mailbox;
pub mod socket;

#[cfg(feature = "mpi")]
pub mod mpi;

pub use coupled::CoupledTransport;
pub use loopback::LoopbackFabric;
pub use socket::{SocketConfig, SocketTransport};

use std::time::Duration;

use crate::error::CourierResult;

/// Which fabric a context was initialized on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// In-process fabric; also the single-rank self-loop configuration
    Loopback,
    /// TCP mesh across processes
    Socket,
    /// Sub-partition of a fabric shared with an externally coupled model
    Coupled,
    /// Socket fabric with device buffers fed straight to the wire path
    GpuDirect,
    /// MPI-backed fabric
    #[cfg(feature = "mpi")]
    Mpi,
}

/// Identifies one posted transfer inside a transport.
pub type TicketId = u64;

/// Outcome of a completed ticket.
#[derive(Debug)]
pub enum Completion {
    Sent,
    Received(Vec<u8>),
}

/// Byte-level messaging boundary implemented by each backend.
///
/// Posting is non-blocking; completion is observed through the ticket
/// returned at post time. Within one `(sender, receiver, tag)` triple
/// messages complete in posting order. Tickets are consumed by the call
/// that reports their completion.
pub trait Transport: Send + Sync {
    fn get_kind(&self) -> TransportKind;

    fn get_rank(&self) -> i32;

    fn get_world_size(&self) -> i32;

    /// Rank of this process among the ranks sharing its node, used for
    /// device binding.
    fn get_node_local_rank(&self) -> i32;

    /// Post a non-blocking send of `data` to `dest` under `tag`. The
    /// transport owns the bytes until the ticket completes.
    fn post_send(&self, dest: i32, tag: i32, data: Vec<u8>) -> CourierResult<TicketId>;

    /// Post a non-blocking receive of exactly `len` bytes from `src`
    /// under `tag`.
    fn post_recv(&self, src: i32, tag: i32, len: usize) -> CourierResult<TicketId>;

    /// Completion check without blocking. Returns `None` while the
    /// transfer is still in flight.
    fn try_complete(&self, ticket: TicketId) -> CourierResult<Option<Completion>>;

    /// Block until the ticket completes.
    fn wait_complete(&self, ticket: TicketId) -> CourierResult<Completion>;

    /// Block until the ticket completes or `timeout` elapses; `None` on
    /// timeout, with the ticket still live.
    fn wait_complete_timeout(
        &self,
        ticket: TicketId,
        timeout: Duration,
    ) -> CourierResult<Option<Completion>>;

    /// True when the backend can consume device-resident buffers without
    /// host staging. The context downgrades the direct-device policy to
    /// pinned staging when the selected backend lacks this.
    fn supports_device_buffers(&self) -> bool {
        false
    }

    /// Tear the backend down. Called exactly once, by context
    /// finalization.
    fn finalize(&self) -> CourierResult<()>;
}

pub(crate) fn check_peer(peer: i32, world_size: i32) -> CourierResult<()> {
    use crate::error::{Code, CourierError};
    if peer < 0 || peer >= world_size {
        return Err(CourierError::new(
            Code::Invalid,
            format!("peer rank {} outside world of size {}", peer, world_size),
        ));
    }
    Ok(())
}

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use crate::error::{Code, CourierError};

enum TicketState {
    Pending,
    Done(Completion),
    Failed(String),
}

/// Completion bookkeeping for backends whose transfers finish on service
/// threads. The posting thread issues a ticket, the service thread
/// completes or fails it, and whoever polls consumes it.
pub(crate) struct TicketTable {
    inner: Mutex<HashMap<TicketId, TicketState>>,
    done: Condvar,
    next: AtomicU64,
}

impl TicketTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            done: Condvar::new(),
            next: AtomicU64::new(1),
        }
    }

    /// Allocate a ticket id without registering state. Used by backends
    /// that track the transfer elsewhere but share this id space.
    pub fn reserve(&self) -> TicketId {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a ticket in the `Pending` state.
    pub fn issue(&self) -> TicketId {
        let id = self.reserve();
        self.inner.lock().unwrap().insert(id, TicketState::Pending);
        id
    }

    pub fn complete(&self, id: TicketId, completion: Completion) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(id, TicketState::Done(completion));
        self.done.notify_all();
    }

    pub fn fail(&self, id: TicketId, message: String) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(id, TicketState::Failed(message));
        self.done.notify_all();
    }

    /// Fail every outstanding ticket, waking blocked waiters. Used at
    /// teardown.
    pub fn fail_all(&self, message: &str) {
        let mut inner = self.inner.lock().unwrap();
        for state in inner.values_mut() {
            if matches!(state, TicketState::Pending) {
                *state = TicketState::Failed(message.to_string());
            }
        }
        self.done.notify_all();
    }

    pub fn knows(&self, id: TicketId) -> bool {
        self.inner.lock().unwrap().contains_key(&id)
    }

    pub fn try_take(&self, id: TicketId) -> CourierResult<Option<Completion>> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_locked(&mut inner, id)
    }

    pub fn wait_take(&self, id: TicketId) -> CourierResult<Completion> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(completion) = Self::take_locked(&mut inner, id)? {
                return Ok(completion);
            }
            inner = self.done.wait(inner).unwrap();
        }
    }

    pub fn wait_take_timeout(
        &self,
        id: TicketId,
        timeout: Duration,
    ) -> CourierResult<Option<Completion>> {
        use std::time::Instant;
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(completion) = Self::take_locked(&mut inner, id)? {
                return Ok(Some(completion));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, res) = self.done.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
            if res.timed_out() {
                return Self::take_locked(&mut inner, id);
            }
        }
    }

    fn take_locked(
        inner: &mut HashMap<TicketId, TicketState>,
        id: TicketId,
    ) -> CourierResult<Option<Completion>> {
        match inner.remove(&id) {
            Some(TicketState::Pending) => {
                inner.insert(id, TicketState::Pending);
                Ok(None)
            }
            Some(TicketState::Done(completion)) => Ok(Some(completion)),
            Some(TicketState::Failed(message)) => Err(CourierError::Communication(message)),
            None => Err(CourierError::new(
                Code::Invalid,
                format!("unknown transport ticket {}", id),
            )),
        }
    }
}
