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

//! Courier: messaging and packing for distributed structured-grid solvers
//!
//! Courier moves typed, strided field data between the ranks of a
//! distributed simulation. Applications describe their buffers with
//! [`Invoice`] layouts, exchange them through asynchronous point-to-point
//! transfers or precomputed halo [`Package`]s, and reduce them with the
//! collective engine. Device-resident buffers ride the same paths through
//! a [`device::DeviceBridge`], either staged through pinned host memory
//! or handed to the transport directly.

pub mod collective;
pub mod context;
pub mod device;
pub mod error;
pub mod invoice;
pub mod net;
pub mod p2p;
pub mod pack;
pub mod package;
pub mod util;

// Re-export commonly used types
pub use crate::collective::{CollectiveEngine, ReduceOp};
pub use crate::context::{ContextConfig, CourierContext, DefaultMemoryPool, MemoryPool};
pub use crate::error::{Code, CourierError, CourierResult};
pub use crate::invoice::{Dim, ElementType, Invoice, MemLoc};
pub use crate::net::TransportKind;
pub use crate::p2p::{HandleState, P2pEngine, TransportHandle};
pub use crate::pack::{Packer, WireBuffer};
pub use crate::package::{HaloLink, LinkBases, Package};

/// The main entry point and version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
