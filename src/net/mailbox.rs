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

//! Message matching for transports that demultiplex their own arrivals
//!
//! Arrived payloads queue per `(source, tag)` key in delivery order, which
//! is what gives receives posted against the same key their FIFO guarantee.

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Code, CourierError, CourierResult};

#[derive(Default)]
struct MailboxInner {
    queues: HashMap<(i32, i32), VecDeque<Vec<u8>>>,
    closed_peers: Vec<i32>,
    closed: bool,
}

/// Per-rank store of arrived-but-unmatched messages.
pub(crate) struct Mailbox {
    inner: Mutex<MailboxInner>,
    arrival: Condvar,
}

impl Mailbox {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MailboxInner::default()),
            arrival: Condvar::new(),
        }
    }

    /// Queue a payload from `src` under `tag`. Fails once the owning rank
    /// has shut down.
    pub fn deliver(&self, src: i32, tag: i32, data: Vec<u8>) -> CourierResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.closed {
            return Err(CourierError::Communication(format!(
                "delivery from rank {} after receiver shut down",
                src
            )));
        }
        inner.queues.entry((src, tag)).or_default().push_back(data);
        self.arrival.notify_all();
        Ok(())
    }

    /// Take the oldest payload for `(src, tag)` if one has arrived.
    pub fn try_take(&self, src: i32, tag: i32) -> CourierResult<Option<Vec<u8>>> {
        let mut inner = self.inner.lock().unwrap();
        Self::take_locked(&mut inner, src, tag)
    }

    /// Block until a payload for `(src, tag)` arrives and take it.
    pub fn take_blocking(&self, src: i32, tag: i32) -> CourierResult<Vec<u8>> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(data) = Self::take_locked(&mut inner, src, tag)? {
                return Ok(data);
            }
            inner = self.arrival.wait(inner).unwrap();
        }
    }

    /// Like [`take_blocking`](Mailbox::take_blocking) but gives up after
    /// `timeout`, returning `None`.
    pub fn take_timeout(
        &self,
        src: i32,
        tag: i32,
        timeout: Duration,
    ) -> CourierResult<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(data) = Self::take_locked(&mut inner, src, tag)? {
                return Ok(Some(data));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, res) = self.arrival.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
            if res.timed_out() {
                if let Some(data) = Self::take_locked(&mut inner, src, tag)? {
                    return Ok(Some(data));
                }
                return Ok(None);
            }
        }
    }

    fn take_locked(
        inner: &mut MailboxInner,
        src: i32,
        tag: i32,
    ) -> CourierResult<Option<Vec<u8>>> {
        if let Some(queue) = inner.queues.get_mut(&(src, tag)) {
            if let Some(data) = queue.pop_front() {
                return Ok(Some(data));
            }
        }
        if inner.closed {
            return Err(CourierError::new(
                Code::ExecutionError,
                format!("receive from rank {} abandoned, transport shut down", src),
            ));
        }
        if inner.closed_peers.contains(&src) {
            return Err(CourierError::Communication(format!(
                "rank {} closed its connection with receives outstanding",
                src
            )));
        }
        Ok(None)
    }

    /// Record that `src` will deliver nothing further. Pending receives
    /// keyed on `src` fail once its queue drains.
    pub fn close_peer(&self, src: i32) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.closed_peers.contains(&src) {
            inner.closed_peers.push(src);
        }
        self.arrival.notify_all();
    }

    /// Shut the mailbox down, waking every blocked waiter with an error.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.arrival.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }
}
