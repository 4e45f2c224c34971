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

//! TCP mesh transport
//!
//! Every pair of ranks shares one TCP connection: the higher rank dials
//! the lower rank's listener, so the mesh comes up without a rendezvous
//! service. Messages travel as `[src][tag][len]` framed payloads; one
//! reader thread per peer demultiplexes arrivals into the mailbox, and a
//! single writer thread drains posted sends in order, which preserves the
//! per-`(sender, receiver, tag)` FIFO guarantee.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::error::{Code, CourierError, CourierResult};
use crate::net::mailbox::Mailbox;
use crate::net::{check_peer, Completion, TicketId, TicketTable, Transport, TransportKind};

const FRAME_HEADER_BYTES: usize = 16;
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);
const CONNECT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for the TCP mesh.
///
/// `addresses[r]` is where rank `r` listens; all ranks must agree on the
/// list. Ranks sharing a host name count as one node for device binding.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    rank: i32,
    addresses: Vec<String>,
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl SocketConfig {
    pub fn new(rank: i32, addresses: Vec<String>) -> Self {
        Self {
            rank,
            addresses,
            connect_timeout: Duration::from_secs(120),
            io_timeout: Duration::from_secs(300),
        }
    }

    /// Build from `COURIER_RANK` and `COURIER_PEERS` (comma-separated
    /// `host:port` list in rank order), as set by a launcher.
    pub fn from_env() -> CourierResult<Self> {
        let rank: i32 = std::env::var("COURIER_RANK")
            .map_err(|_| CourierError::new(Code::Invalid, "COURIER_RANK not set"))?
            .parse()
            .map_err(|_| CourierError::new(Code::Invalid, "COURIER_RANK is not an integer"))?;
        let peers = std::env::var("COURIER_PEERS")
            .map_err(|_| CourierError::new(Code::Invalid, "COURIER_PEERS not set"))?;
        let addresses: Vec<String> = peers
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        Ok(Self::new(rank, addresses))
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn get_rank(&self) -> i32 {
        self.rank
    }

    pub fn get_world_size(&self) -> i32 {
        self.addresses.len() as i32
    }

    fn validate(&self) -> CourierResult<()> {
        let world = self.addresses.len() as i32;
        if world < 1 {
            return Err(CourierError::new(Code::Invalid, "empty peer address list"));
        }
        if self.rank < 0 || self.rank >= world {
            return Err(CourierError::new(
                Code::Invalid,
                format!("rank {} outside address list of length {}", self.rank, world),
            ));
        }
        Ok(())
    }

    fn host_of(address: &str) -> &str {
        address.rsplit_once(':').map(|(h, _)| h).unwrap_or(address)
    }

    /// Position of `rank` among the ranks whose address shares its host.
    fn node_local_rank(&self) -> i32 {
        let my_host = Self::host_of(&self.addresses[self.rank as usize]);
        self.addresses[..self.rank as usize]
            .iter()
            .filter(|a| Self::host_of(a) == my_host)
            .count() as i32
    }
}

struct SendJob {
    dest: i32,
    tag: i32,
    data: Vec<u8>,
    ticket: TicketId,
}

/// TCP mesh endpoint for one rank.
pub struct SocketTransport {
    rank: i32,
    world_size: i32,
    node_local_rank: i32,
    mailbox: Arc<Mailbox>,
    tickets: Arc<TicketTable>,
    pending_recvs: Mutex<HashMap<TicketId, (i32, i32, usize)>>,
    send_queue: Mutex<Option<mpsc::Sender<SendJob>>>,
    writers: Arc<Vec<Option<Mutex<TcpStream>>>>,
    shutting_down: Arc<AtomicBool>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl SocketTransport {
    /// Bring up the full mesh. Blocks until a connection to every peer is
    /// established or the connect timeout expires.
    pub fn connect(config: SocketConfig) -> CourierResult<Self> {
        config.validate()?;
        let rank = config.rank;
        let world_size = config.get_world_size();
        let mailbox = Arc::new(Mailbox::new());
        let shutting_down = Arc::new(AtomicBool::new(false));

        let listener = TcpListener::bind(&config.addresses[rank as usize]).map_err(|e| {
            CourierError::Network(format!(
                "rank {} cannot listen on {}: {}",
                rank, config.addresses[rank as usize], e
            ))
        })?;

        let mut streams: Vec<Option<TcpStream>> = (0..world_size).map(|_| None).collect();

        // Dial every lower rank; they are already listening or soon will be.
        for peer in 0..rank {
            let stream = Self::dial(&config, peer)?;
            streams[peer as usize] = Some(stream);
        }
        // Accept one connection from every higher rank; the hello frame
        // carries the dialer's rank.
        for _ in (rank + 1)..world_size {
            let (mut stream, addr) = listener.accept().map_err(|e| {
                CourierError::Network(format!("rank {} accept failed: {}", rank, e))
            })?;
            let mut hello = [0u8; 4];
            stream.read_exact(&mut hello).map_err(|e| {
                CourierError::Network(format!("rank {} handshake read from {}: {}", rank, addr, e))
            })?;
            let peer = i32::from_le_bytes(hello);
            check_peer(peer, world_size)?;
            if streams[peer as usize].is_some() {
                return Err(CourierError::Network(format!(
                    "rank {} observed a duplicate connection from rank {}",
                    rank, peer
                )));
            }
            streams[peer as usize] = Some(stream);
        }

        let mut threads = Vec::new();
        let mut writers: Vec<Option<Mutex<TcpStream>>> = Vec::with_capacity(world_size as usize);
        for (peer, slot) in streams.into_iter().enumerate() {
            match slot {
                None => writers.push(None),
                Some(stream) => {
                    stream.set_nodelay(true).ok();
                    stream
                        .set_write_timeout(Some(config.io_timeout))
                        .map_err(CourierError::Io)?;
                    let reader = stream.try_clone().map_err(CourierError::Io)?;
                    threads.push(Self::spawn_reader(
                        rank,
                        peer as i32,
                        reader,
                        mailbox.clone(),
                        shutting_down.clone(),
                    )?);
                    writers.push(Some(Mutex::new(stream)));
                }
            }
        }
        let writers = Arc::new(writers);

        let tickets = Arc::new(TicketTable::new());
        let (send_tx, send_rx) = mpsc::channel::<SendJob>();
        threads.push(Self::spawn_sender(
            rank,
            send_rx,
            writers.clone(),
            tickets.clone(),
        )?);

        info!(
            "socket transport up: rank {}/{} listening on {}",
            rank, world_size, config.addresses[rank as usize]
        );

        Ok(Self {
            rank,
            world_size,
            node_local_rank: config.node_local_rank(),
            mailbox,
            tickets,
            pending_recvs: Mutex::new(HashMap::new()),
            send_queue: Mutex::new(Some(send_tx)),
            writers,
            shutting_down,
            threads: Mutex::new(threads),
        })
    }

    fn dial(config: &SocketConfig, peer: i32) -> CourierResult<TcpStream> {
        let address = &config.addresses[peer as usize];
        let addr = address
            .to_socket_addrs()
            .map_err(|e| CourierError::Network(format!("cannot resolve {}: {}", address, e)))?
            .next()
            .ok_or_else(|| {
                CourierError::Network(format!("{} resolved to no addresses", address))
            })?;

        let deadline = Instant::now() + config.connect_timeout;
        loop {
            match TcpStream::connect_timeout(&addr, CONNECT_ATTEMPT_TIMEOUT) {
                Ok(mut stream) => {
                    stream
                        .write_all(&config.rank.to_le_bytes())
                        .map_err(|e| {
                            CourierError::Network(format!(
                                "handshake write to rank {}: {}",
                                peer, e
                            ))
                        })?;
                    return Ok(stream);
                }
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(CourierError::Network(format!(
                            "rank {} could not reach rank {} at {} within {:?}: {}",
                            config.rank, peer, address, config.connect_timeout, e
                        )));
                    }
                    trace!(
                        "rank {} waiting for rank {} at {} ({})",
                        config.rank,
                        peer,
                        address,
                        e
                    );
                    thread::sleep(CONNECT_RETRY_DELAY);
                }
            }
        }
    }

    fn spawn_reader(
        rank: i32,
        peer: i32,
        mut stream: TcpStream,
        mailbox: Arc<Mailbox>,
        shutting_down: Arc<AtomicBool>,
    ) -> CourierResult<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name(format!("courier-rx-{}", peer))
            .spawn(move || {
                let mut header = [0u8; FRAME_HEADER_BYTES];
                loop {
                    match stream.read_exact(&mut header) {
                        Ok(()) => {}
                        Err(e) => {
                            if !shutting_down.load(Ordering::SeqCst) {
                                warn!(
                                    "rank {} lost connection to rank {}: {}",
                                    rank, peer, e
                                );
                                mailbox.close_peer(peer);
                            }
                            return;
                        }
                    }
                    let src = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
                    let tag = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);
                    let len = u64::from_le_bytes([
                        header[8], header[9], header[10], header[11], header[12], header[13],
                        header[14], header[15],
                    ]) as usize;
                    let mut data = vec![0u8; len];
                    if let Err(e) = stream.read_exact(&mut data) {
                        if !shutting_down.load(Ordering::SeqCst) {
                            warn!(
                                "rank {} truncated frame from rank {}: {}",
                                rank, peer, e
                            );
                            mailbox.close_peer(peer);
                        }
                        return;
                    }
                    trace!("rank {} got {} bytes from {} tag {}", rank, len, src, tag);
                    if mailbox.deliver(src, tag, data).is_err() {
                        return;
                    }
                }
            })
            .map_err(CourierError::Io)
    }

    fn spawn_sender(
        rank: i32,
        jobs: mpsc::Receiver<SendJob>,
        writers: Arc<Vec<Option<Mutex<TcpStream>>>>,
        tickets: Arc<TicketTable>,
    ) -> CourierResult<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("courier-tx".to_string())
            .spawn(move || {
                while let Ok(job) = jobs.recv() {
                    let outcome = Self::write_frame(rank, &writers, &job);
                    match outcome {
                        Ok(()) => tickets.complete(job.ticket, Completion::Sent),
                        Err(e) => tickets.fail(job.ticket, e.to_string()),
                    }
                }
            })
            .map_err(CourierError::Io)
    }

    fn write_frame(
        rank: i32,
        writers: &[Option<Mutex<TcpStream>>],
        job: &SendJob,
    ) -> CourierResult<()> {
        let slot = writers
            .get(job.dest as usize)
            .and_then(|s| s.as_ref())
            .ok_or_else(|| {
                CourierError::Network(format!("no connection to rank {}", job.dest))
            })?;
        let mut stream = slot.lock().unwrap();
        let mut header = [0u8; FRAME_HEADER_BYTES];
        header[0..4].copy_from_slice(&rank.to_le_bytes());
        header[4..8].copy_from_slice(&job.tag.to_le_bytes());
        header[8..16].copy_from_slice(&(job.data.len() as u64).to_le_bytes());
        stream
            .write_all(&header)
            .and_then(|_| stream.write_all(&job.data))
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::WouldBlock {
                    CourierError::Network(format!("send to rank {} timed out", job.dest))
                } else {
                    CourierError::Network(format!("send to rank {} failed: {}", job.dest, e))
                }
            })?;
        trace!(
            "rank {} sent {} bytes to {} tag {}",
            rank,
            job.data.len(),
            job.dest,
            job.tag
        );
        Ok(())
    }

    fn recv_params(&self, ticket: TicketId) -> CourierResult<Option<(i32, i32, usize)>> {
        let pending = self.pending_recvs.lock().unwrap();
        if let Some(params) = pending.get(&ticket) {
            return Ok(Some(*params));
        }
        drop(pending);
        if self.tickets.knows(ticket) {
            Ok(None)
        } else {
            Err(CourierError::new(
                Code::Invalid,
                format!("unknown transport ticket {}", ticket),
            ))
        }
    }

    fn finish_recv(
        &self,
        ticket: TicketId,
        expected: usize,
        taken: CourierResult<Vec<u8>>,
    ) -> CourierResult<Completion> {
        self.pending_recvs.lock().unwrap().remove(&ticket);
        let data = taken?;
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

impl Transport for SocketTransport {
    fn get_kind(&self) -> TransportKind {
        TransportKind::Socket
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
        if dest == self.rank {
            self.mailbox.deliver(self.rank, tag, data)?;
            let ticket = self.tickets.issue();
            self.tickets.complete(ticket, Completion::Sent);
            return Ok(ticket);
        }
        let queue = self.send_queue.lock().unwrap();
        let sender = queue.as_ref().ok_or_else(|| {
            CourierError::new(Code::ExecutionError, "send posted after finalize")
        })?;
        let ticket = self.tickets.issue();
        sender
            .send(SendJob {
                dest,
                tag,
                data,
                ticket,
            })
            .map_err(|_| CourierError::Network("send service is down".to_string()))?;
        Ok(ticket)
    }

    fn post_recv(&self, src: i32, tag: i32, len: usize) -> CourierResult<TicketId> {
        check_peer(src, self.world_size)?;
        let ticket = self.tickets.reserve();
        self.pending_recvs
            .lock()
            .unwrap()
            .insert(ticket, (src, tag, len));
        Ok(ticket)
    }

    fn try_complete(&self, ticket: TicketId) -> CourierResult<Option<Completion>> {
        match self.recv_params(ticket)? {
            Some((src, tag, len)) => match self.mailbox.try_take(src, tag) {
                Ok(Some(data)) => self.finish_recv(ticket, len, Ok(data)).map(Some),
                Ok(None) => Ok(None),
                Err(e) => self.finish_recv(ticket, len, Err(e)).map(Some),
            },
            None => self.tickets.try_take(ticket),
        }
    }

    fn wait_complete(&self, ticket: TicketId) -> CourierResult<Completion> {
        match self.recv_params(ticket)? {
            Some((src, tag, len)) => {
                let taken = self.mailbox.take_blocking(src, tag);
                self.finish_recv(ticket, len, taken)
            }
            None => self.tickets.wait_take(ticket),
        }
    }

    fn wait_complete_timeout(
        &self,
        ticket: TicketId,
        timeout: Duration,
    ) -> CourierResult<Option<Completion>> {
        match self.recv_params(ticket)? {
            Some((src, tag, len)) => match self.mailbox.take_timeout(src, tag, timeout) {
                Ok(Some(data)) => self.finish_recv(ticket, len, Ok(data)).map(Some),
                Ok(None) => Ok(None),
                Err(e) => self.finish_recv(ticket, len, Err(e)).map(Some),
            },
            None => self.tickets.wait_take_timeout(ticket, timeout),
        }
    }

    fn finalize(&self) -> CourierResult<()> {
        debug!("socket transport rank {} shutting down", self.rank);
        self.shutting_down.store(true, Ordering::SeqCst);
        // Dropping the queue ends the sender thread after it drains.
        self.send_queue.lock().unwrap().take();
        for slot in self.writers.iter().flatten() {
            let stream = slot.lock().unwrap();
            stream.shutdown(Shutdown::Both).ok();
        }
        self.mailbox.close();
        self.tickets.fail_all("transport shut down");
        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            if handle.join().is_err() {
                warn!("rank {} service thread panicked during shutdown", self.rank);
            }
        }
        Ok(())
    }
}
