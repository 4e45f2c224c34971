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

//! MPI-backed transport (feature `mpi`)
//!
//! Runs over a system MPI through rsmpi. Posted operations are serviced
//! by two dedicated threads issuing blocking MPI calls in posting order,
//! which keeps the non-blocking posting surface while leaning on MPI's
//! own per-`(source, tag)` ordering. Requires `MPI_THREAD_MULTIPLE`.
//!
//! The node-local rank comes from the launcher environment
//! (`OMPI_COMM_WORLD_LOCAL_RANK`, `MV2_COMM_WORLD_LOCAL_RANK`, or
//! `SLURM_LOCALID`); without any of those every rank reports zero.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use mpi::topology::Communicator;
use mpi::traits::*;
use mpi::Threading;

use crate::error::{Code, CourierError, CourierResult};
use crate::net::{check_peer, Completion, TicketId, TicketTable, Transport, TransportKind};

const LOCAL_RANK_VARS: [&str; 3] = [
    "OMPI_COMM_WORLD_LOCAL_RANK",
    "MV2_COMM_WORLD_LOCAL_RANK",
    "SLURM_LOCALID",
];

enum MpiJob {
    Send {
        dest: i32,
        tag: i32,
        data: Vec<u8>,
        ticket: TicketId,
    },
    Recv {
        src: i32,
        tag: i32,
        len: usize,
        ticket: TicketId,
    },
    Stop,
}

/// Transport over an MPI world.
pub struct MpiTransport {
    // Universe drop finalizes MPI; it must outlive the service threads.
    _universe: mpi::environment::Universe,
    rank: i32,
    world_size: i32,
    node_local_rank: i32,
    tickets: Arc<TicketTable>,
    send_queue: Mutex<Option<mpsc::Sender<MpiJob>>>,
    recv_queue: Mutex<Option<mpsc::Sender<MpiJob>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

// SAFETY: the Universe is only dropped after both service threads have
// been joined, and all communicator use after construction happens on
// those threads over duplicated communicators.
unsafe impl Send for MpiTransport {}
unsafe impl Sync for MpiTransport {}

impl MpiTransport {
    pub fn init() -> CourierResult<Self> {
        let (universe, threading) = mpi::initialize_with_threading(Threading::Multiple)
            .ok_or_else(|| {
                CourierError::new(Code::ExecutionError, "MPI is already initialized")
            })?;
        if threading < Threading::Multiple {
            return Err(CourierError::new(
                Code::ExecutionError,
                format!(
                    "MPI library granted {:?}, MPI_THREAD_MULTIPLE is required",
                    threading
                ),
            ));
        }
        let world = universe.world();
        let rank = world.rank();
        let world_size = world.size();
        let node_local_rank = Self::node_local_rank_from_env();

        let tickets = Arc::new(TicketTable::new());

        let send_comm = world.duplicate();
        let recv_comm = world.duplicate();
        let (send_tx, send_rx) = mpsc::channel::<MpiJob>();
        let (recv_tx, recv_rx) = mpsc::channel::<MpiJob>();

        let send_tickets = tickets.clone();
        let send_thread = thread::Builder::new()
            .name("courier-mpi-tx".to_string())
            .spawn(move || {
                while let Ok(job) = send_rx.recv() {
                    match job {
                        MpiJob::Send {
                            dest,
                            tag,
                            data,
                            ticket,
                        } => {
                            send_comm
                                .process_at_rank(dest)
                                .send_with_tag(&data[..], tag);
                            send_tickets.complete(ticket, Completion::Sent);
                        }
                        MpiJob::Stop => break,
                        MpiJob::Recv { .. } => unreachable!("receive routed to send service"),
                    }
                }
            })
            .map_err(CourierError::Io)?;

        let recv_tickets = tickets.clone();
        let recv_thread = thread::Builder::new()
            .name("courier-mpi-rx".to_string())
            .spawn(move || {
                while let Ok(job) = recv_rx.recv() {
                    match job {
                        MpiJob::Recv {
                            src,
                            tag,
                            len,
                            ticket,
                        } => {
                            let (data, _status) = recv_comm
                                .process_at_rank(src)
                                .receive_vec_with_tag::<u8>(tag);
                            if data.len() != len {
                                recv_tickets.fail(
                                    ticket,
                                    format!(
                                        "received {} bytes where the posted layout holds {}",
                                        data.len(),
                                        len
                                    ),
                                );
                            } else {
                                recv_tickets.complete(ticket, Completion::Received(data));
                            }
                        }
                        MpiJob::Stop => break,
                        MpiJob::Send { .. } => unreachable!("send routed to receive service"),
                    }
                }
            })
            .map_err(CourierError::Io)?;

        info!("mpi transport up: rank {}/{}", rank, world_size);
        Ok(Self {
            _universe: universe,
            rank,
            world_size,
            node_local_rank,
            tickets,
            send_queue: Mutex::new(Some(send_tx)),
            recv_queue: Mutex::new(Some(recv_tx)),
            threads: Mutex::new(vec![send_thread, recv_thread]),
        })
    }

    fn node_local_rank_from_env() -> i32 {
        for var in LOCAL_RANK_VARS {
            if let Ok(value) = std::env::var(var) {
                if let Ok(parsed) = value.parse() {
                    return parsed;
                }
            }
        }
        warn!("no launcher local-rank variable found, assuming node-local rank 0");
        0
    }

    fn enqueue(&self, queue: &Mutex<Option<mpsc::Sender<MpiJob>>>, job: MpiJob) -> CourierResult<()> {
        let guard = queue.lock().unwrap();
        let sender = guard.as_ref().ok_or_else(|| {
            CourierError::new(Code::ExecutionError, "operation posted after finalize")
        })?;
        sender
            .send(job)
            .map_err(|_| CourierError::Communication("MPI service thread is down".to_string()))
    }
}

impl Transport for MpiTransport {
    fn get_kind(&self) -> TransportKind {
        TransportKind::Mpi
    }

    fn get_rank(&self) -> i32 {
        self.rank
    }

    fn get_world_size(&self) -> i32 {
        self.world_size
    }

    fn get_node_local_rank(&self) -> i32 {
        self.node_local_rank
    }

    fn post_send(&self, dest: i32, tag: i32, data: Vec<u8>) -> CourierResult<TicketId> {
        check_peer(dest, self.world_size)?;
        let ticket = self.tickets.issue();
        self.enqueue(
            &self.send_queue,
            MpiJob::Send {
                dest,
                tag,
                data,
                ticket,
            },
        )?;
        Ok(ticket)
    }

    fn post_recv(&self, src: i32, tag: i32, len: usize) -> CourierResult<TicketId> {
        check_peer(src, self.world_size)?;
        let ticket = self.tickets.issue();
        self.enqueue(
            &self.recv_queue,
            MpiJob::Recv {
                src,
                tag,
                len,
                ticket,
            },
        )?;
        Ok(ticket)
    }

    fn try_complete(&self, ticket: TicketId) -> CourierResult<Option<Completion>> {
        self.tickets.try_take(ticket)
    }

    fn wait_complete(&self, ticket: TicketId) -> CourierResult<Completion> {
        self.tickets.wait_take(ticket)
    }

    fn wait_complete_timeout(
        &self,
        ticket: TicketId,
        timeout: Duration,
    ) -> CourierResult<Option<Completion>> {
        self.tickets.wait_take_timeout(ticket, timeout)
    }

    fn finalize(&self) -> CourierResult<()> {
        debug!("mpi transport rank {} shutting down", self.rank);
        if let Some(sender) = self.send_queue.lock().unwrap().take() {
            sender.send(MpiJob::Stop).ok();
        }
        if let Some(sender) = self.recv_queue.lock().unwrap().take() {
            sender.send(MpiJob::Stop).ok();
        }
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            if handle.join().is_err() {
                warn!("rank {} MPI service thread panicked during shutdown", self.rank);
            }
        }
        self.tickets.fail_all("transport shut down");
        Ok(())
    }
}
