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

//! Courier context and configuration
//!
//! The [`CourierContext`] is the explicitly-lifecycled home of everything
//! process-wide: the selected transport, the device binding, and the
//! memory pool. It is initialized exactly once at startup and finalized
//! exactly once at shutdown; every engine borrows it and none own it. A
//! context must exist before any other component is constructed, which
//! the constructors enforce by taking `&CourierContext`.

use std::sync::{Arc, Mutex};

use log::{info, warn};

use crate::device::DeviceBridge;
use crate::error::{Code, CourierError, CourierResult};
use crate::net::coupled::CoupledTransport;
use crate::net::loopback::LoopbackFabric;
use crate::net::socket::{SocketConfig, SocketTransport};
use crate::net::{Transport, TransportKind};

/// Memory pool trait for custom host-side allocation.
pub trait MemoryPool: Send + Sync {
    fn allocate(&self, size: usize) -> CourierResult<*mut u8>;
    fn deallocate(&self, ptr: *mut u8, size: usize);
}

/// Default memory pool backed by the system allocator.
pub struct DefaultMemoryPool;

impl MemoryPool for DefaultMemoryPool {
    fn allocate(&self, size: usize) -> CourierResult<*mut u8> {
        use std::alloc::{alloc_zeroed, Layout};
        let layout =
            Layout::from_size_align(size.max(1), 8).map_err(|_| CourierError::OutOfMemory)?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            Err(CourierError::OutOfMemory)
        } else {
            Ok(ptr)
        }
    }

    fn deallocate(&self, ptr: *mut u8, size: usize) {
        use std::alloc::{dealloc, Layout};
        if let Ok(layout) = Layout::from_size_align(size.max(1), 8) {
            unsafe { dealloc(ptr, layout) };
        }
    }
}

/// Memory pool that hands out pinned host memory through the device
/// bridge. Installed automatically when a context carries a bridge, so
/// staged transfers always land in page-locked memory.
pub struct PinnedPool {
    bridge: Arc<dyn DeviceBridge>,
}

impl PinnedPool {
    pub fn new(bridge: Arc<dyn DeviceBridge>) -> Self {
        Self { bridge }
    }
}

impl MemoryPool for PinnedPool {
    fn allocate(&self, size: usize) -> CourierResult<*mut u8> {
        self.bridge.alloc_pinned(size)
    }

    fn deallocate(&self, ptr: *mut u8, size: usize) {
        // SAFETY: ptr/size pair came from alloc_pinned above.
        if let Err(e) = unsafe { self.bridge.free_pinned(ptr, size) } {
            warn!("releasing pinned memory failed: {}", e);
        }
    }
}

/// Startup configuration consumed once by [`CourierContext::initialize`].
#[derive(Clone)]
pub struct ContextConfig {
    transport: TransportKind,
    socket: Option<SocketConfig>,
    coupled_members: Vec<i32>,
    direct_device: bool,
    bridge: Option<Arc<dyn DeviceBridge>>,
    pool_capacity: usize,
}

impl std::fmt::Debug for ContextConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextConfig")
            .field("transport", &self.transport)
            .field("socket", &self.socket)
            .field("coupled_members", &self.coupled_members)
            .field("direct_device", &self.direct_device)
            .field("pool_capacity", &self.pool_capacity)
            .finish_non_exhaustive()
    }
}

impl ContextConfig {
    fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            socket: None,
            coupled_members: Vec::new(),
            direct_device: false,
            bridge: None,
            pool_capacity: 0,
        }
    }

    /// In-process fabric, for [`CourierContext::initialize_loopback_with`].
    pub fn loopback() -> Self {
        Self::new(TransportKind::Loopback)
    }

    /// TCP mesh across processes.
    pub fn socket(config: SocketConfig) -> Self {
        let mut cfg = Self::new(TransportKind::Socket);
        cfg.socket = Some(config);
        cfg
    }

    /// TCP mesh with the direct device path requested.
    pub fn gpu_direct(config: SocketConfig) -> Self {
        let mut cfg = Self::new(TransportKind::GpuDirect);
        cfg.socket = Some(config);
        cfg.direct_device = true;
        cfg
    }

    /// Sub-partition of a TCP mesh shared with an externally coupled
    /// model. `members` lists the global ranks belonging to this solver,
    /// in local-rank order.
    pub fn coupled(config: SocketConfig, members: Vec<i32>) -> Self {
        let mut cfg = Self::new(TransportKind::Coupled);
        cfg.socket = Some(config);
        cfg.coupled_members = members;
        cfg
    }

    /// MPI world brought up through the system MPI launcher.
    #[cfg(feature = "mpi")]
    pub fn mpi() -> Self {
        Self::new(TransportKind::Mpi)
    }

    /// Request that device buffers be fed to the transport without host
    /// staging. Downgraded to the staged path when the selected backend
    /// cannot address device memory.
    pub fn with_direct_device(mut self, direct: bool) -> Self {
        self.direct_device = direct;
        self
    }

    /// Attach the accelerator bridge; without one, device-resident
    /// invoice entries are rejected at pack time.
    pub fn with_device_bridge(mut self, bridge: Arc<dyn DeviceBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Pre-size the packer's staging pool to `bytes` at initialization
    /// instead of growing it on first use.
    pub fn with_pool_capacity(mut self, bytes: usize) -> Self {
        self.pool_capacity = bytes;
        self
    }

    pub fn get_transport(&self) -> TransportKind {
        self.transport
    }

    fn require_socket(&self) -> CourierResult<SocketConfig> {
        self.socket.clone().ok_or_else(|| {
            CourierError::new(
                Code::Invalid,
                format!("{:?} transport needs a socket address list", self.transport),
            )
        })
    }

    /// Build a configuration from `COURIER_*` environment variables, as
    /// a launcher would set them: `COURIER_TRANSPORT` selects the kind
    /// (`loopback`, `socket`, `gpu-direct`, `coupled`, `mpi`), socket
    /// worlds read `COURIER_RANK`/`COURIER_PEERS`, coupled worlds add
    /// `COURIER_COUPLED_MEMBERS`, and `COURIER_DIRECT_DEVICE` /
    /// `COURIER_POOL_CAPACITY` tune the device policy.
    pub fn from_env() -> CourierResult<Self> {
        let kind = std::env::var("COURIER_TRANSPORT").unwrap_or_else(|_| "loopback".to_string());
        let mut config = match kind.to_ascii_lowercase().as_str() {
            "loopback" => Self::loopback(),
            "socket" => Self::socket(SocketConfig::from_env()?),
            "gpu-direct" | "gpudirect" => Self::gpu_direct(SocketConfig::from_env()?),
            "coupled" => {
                let members = std::env::var("COURIER_COUPLED_MEMBERS")
                    .map_err(|_| {
                        CourierError::new(Code::Invalid, "COURIER_COUPLED_MEMBERS not set")
                    })?
                    .split(',')
                    .map(|s| {
                        s.trim().parse::<i32>().map_err(|_| {
                            CourierError::new(
                                Code::Invalid,
                                format!("bad rank '{}' in COURIER_COUPLED_MEMBERS", s),
                            )
                        })
                    })
                    .collect::<CourierResult<Vec<i32>>>()?;
                Self::coupled(SocketConfig::from_env()?, members)
            }
            #[cfg(feature = "mpi")]
            "mpi" => Self::mpi(),
            other => {
                return Err(CourierError::new(
                    Code::Invalid,
                    format!("unknown transport kind '{}' in COURIER_TRANSPORT", other),
                ))
            }
        };
        if let Ok(value) = std::env::var("COURIER_DIRECT_DEVICE") {
            config.direct_device = matches!(value.as_str(), "1" | "true" | "yes");
        }
        if let Ok(value) = std::env::var("COURIER_POOL_CAPACITY") {
            config.pool_capacity = value.parse().map_err(|_| {
                CourierError::new(Code::Invalid, "COURIER_POOL_CAPACITY is not a byte count")
            })?;
        }
        Ok(config)
    }
}

/// The entry point to courier operations.
///
/// Holds the transport selected at startup, the device binding derived
/// from the node-local rank, and the memory pool. One context is active
/// per process rank; the loopback constructors return one context per
/// simulated rank instead, each playing one rank of an in-process world.
pub struct CourierContext {
    kind: TransportKind,
    transport: Arc<dyn Transport>,
    bridge: Option<Arc<dyn DeviceBridge>>,
    bound_device: Option<usize>,
    direct_device: bool,
    memory_pool: Arc<dyn MemoryPool>,
    pool_capacity: usize,
    sequence_no: Mutex<i32>,
    finalized: bool,
}

impl std::fmt::Debug for CourierContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CourierContext")
            .field("kind", &self.kind)
            .field("bound_device", &self.bound_device)
            .field("direct_device", &self.direct_device)
            .field("pool_capacity", &self.pool_capacity)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl CourierContext {
    /// Bring up the configured transport and bind this rank's device.
    /// Fails without partial state: on any error the transport is torn
    /// down before returning.
    pub fn initialize(config: ContextConfig) -> CourierResult<Self> {
        let transport: Arc<dyn Transport> = match config.transport {
            TransportKind::Loopback => {
                return Err(CourierError::new(
                    Code::Invalid,
                    "loopback worlds are created through initialize_loopback",
                ))
            }
            TransportKind::Socket | TransportKind::GpuDirect => {
                Arc::new(SocketTransport::connect(config.require_socket()?)?)
            }
            TransportKind::Coupled => {
                let inner = Box::new(SocketTransport::connect(config.require_socket()?)?);
                Arc::new(CoupledTransport::wrap(inner, config.coupled_members.clone())?)
            }
            #[cfg(feature = "mpi")]
            TransportKind::Mpi => Arc::new(crate::net::mpi::MpiTransport::init()?),
        };
        Self::finish(config.transport, transport, &config)
    }

    /// Create an in-process world of `world_size` ranks. Element `r` of
    /// the returned vector is rank `r`'s context; tests and single-node
    /// runs drive one thread per element. A world of one is the
    /// self-loop configuration.
    pub fn initialize_loopback(world_size: i32) -> CourierResult<Vec<Self>> {
        Self::initialize_loopback_with(world_size, ContextConfig::loopback())
    }

    /// Like [`initialize_loopback`](CourierContext::initialize_loopback)
    /// but honoring the config's device bridge, direct-device flag, and
    /// pool capacity. All ranks share the one bridge instance.
    pub fn initialize_loopback_with(
        world_size: i32,
        config: ContextConfig,
    ) -> CourierResult<Vec<Self>> {
        if config.transport != TransportKind::Loopback {
            return Err(CourierError::new(
                Code::Invalid,
                format!(
                    "initialize_loopback called with a {:?} configuration",
                    config.transport
                ),
            ));
        }
        LoopbackFabric::create(world_size)?
            .into_iter()
            .map(|endpoint| {
                Self::finish(TransportKind::Loopback, Arc::new(endpoint), &config)
            })
            .collect()
    }

    fn finish(
        kind: TransportKind,
        transport: Arc<dyn Transport>,
        config: &ContextConfig,
    ) -> CourierResult<Self> {
        let bound_device = match &config.bridge {
            None => None,
            Some(bridge) => match Self::bind_device(transport.as_ref(), bridge.as_ref()) {
                Ok(device) => Some(device),
                Err(e) => {
                    transport.finalize().ok();
                    return Err(e);
                }
            },
        };

        let direct_requested = config.direct_device || kind == TransportKind::GpuDirect;
        let direct_device = direct_requested && transport.supports_device_buffers();
        if direct_requested && !direct_device {
            warn!(
                "direct device transport unavailable on {:?}, staging through pinned memory",
                kind
            );
        }

        let memory_pool: Arc<dyn MemoryPool> = match &config.bridge {
            Some(bridge) => Arc::new(PinnedPool::new(bridge.clone())),
            None => Arc::new(DefaultMemoryPool),
        };

        info!(
            "courier context up: {:?} rank {}/{}",
            kind,
            transport.get_rank(),
            transport.get_world_size()
        );
        Ok(Self {
            kind,
            transport,
            bridge: config.bridge.clone(),
            bound_device,
            direct_device,
            memory_pool,
            pool_capacity: config.pool_capacity,
            sequence_no: Mutex::new(0),
            finalized: false,
        })
    }

    fn bind_device(transport: &dyn Transport, bridge: &dyn DeviceBridge) -> CourierResult<usize> {
        let count = bridge.device_count();
        if count == 0 {
            return Err(CourierError::new(
                Code::DeviceError,
                "device bridge reports no visible devices",
            ));
        }
        // Oversubscription (more ranks than devices) wraps around and is
        // the launcher's concern, not this layer's.
        let device = (transport.get_node_local_rank() as usize) % count;
        bridge.bind(device)?;
        info!(
            "rank {} bound to device {} of {}",
            transport.get_rank(),
            device,
            count
        );
        Ok(device)
    }

    pub fn get_transport_kind(&self) -> TransportKind {
        self.kind
    }

    pub fn get_transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Returns the local rank.
    pub fn get_rank(&self) -> i32 {
        self.transport.get_rank()
    }

    /// Returns the world size.
    pub fn get_world_size(&self) -> i32 {
        self.transport.get_world_size()
    }

    /// Rank of this process among the ranks sharing its node.
    pub fn get_node_local_rank(&self) -> i32 {
        self.transport.get_node_local_rank()
    }

    /// Returns the other ranks in the world, optionally including this
    /// one.
    pub fn get_neighbours(&self, include_self: bool) -> Vec<i32> {
        let rank = self.get_rank();
        (0..self.get_world_size())
            .filter(|r| include_self || *r != rank)
            .collect()
    }

    pub fn get_device_bridge(&self) -> Option<Arc<dyn DeviceBridge>> {
        self.bridge.clone()
    }

    /// Number of devices visible to this rank; zero without a bridge.
    pub fn get_device_count(&self) -> usize {
        self.bridge.as_ref().map_or(0, |b| b.device_count())
    }

    /// Device this rank was bound to at initialization, when a bridge is
    /// configured.
    pub fn get_bound_device(&self) -> Option<usize> {
        self.bound_device
    }

    /// True when device buffers are handed to the transport without the
    /// pinned staging bounce.
    pub fn direct_device_transport(&self) -> bool {
        self.direct_device
    }

    pub fn get_memory_pool(&self) -> Arc<dyn MemoryPool> {
        self.memory_pool.clone()
    }

    pub fn set_memory_pool(&mut self, pool: Arc<dyn MemoryPool>) {
        self.memory_pool = pool;
    }

    pub(crate) fn get_pool_capacity(&self) -> usize {
        self.pool_capacity
    }

    /// Returns the next sequence number. Ranks that make the same
    /// sequence of calls observe the same values, which is what package
    /// tags rely on.
    pub fn get_next_sequence(&self) -> i32 {
        let mut seq = self.sequence_no.lock().unwrap();
        *seq += 1;
        *seq
    }

    /// Tear down the transport and device resources. Exactly one call;
    /// a second call is an error.
    pub fn finalize(&mut self) -> CourierResult<()> {
        if self.finalized {
            return Err(CourierError::new(
                Code::ExecutionError,
                "courier context finalized twice",
            ));
        }
        self.transport.finalize()?;
        self.finalized = true;
        info!("courier context on rank {} shut down", self.get_rank());
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }
}

impl Drop for CourierContext {
    fn drop(&mut self) {
        if !self.finalized {
            warn!(
                "courier context on rank {} dropped without finalize",
                self.get_rank()
            );
        }
    }
}
