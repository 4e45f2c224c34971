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

//! Tests for the TCP mesh transport
//!
//! Each test brings up a two-rank mesh on 127.0.0.1 with its own port
//! pair, so the tests can run in parallel without fighting over binds.

use std::thread;
use std::time::Duration;

use courier::context::{ContextConfig, CourierContext};
use courier::invoice::{ElementType, Invoice, MemLoc};
use courier::net::{Completion, SocketConfig, SocketTransport, Transport, TransportKind};
use courier::p2p::P2pEngine;

fn mesh_config(rank: i32, base_port: u16) -> SocketConfig {
    let addresses = vec![
        format!("127.0.0.1:{}", base_port),
        format!("127.0.0.1:{}", base_port + 1),
    ];
    SocketConfig::new(rank, addresses).with_connect_timeout(Duration::from_secs(15))
}

// =========================================================================
// Raw transport
// =========================================================================

mod transport_tests {
    use super::*;

    #[test]
    fn test_two_rank_byte_exchange() {
        let mut threads = Vec::new();
        for rank in 0..2 {
            threads.push(thread::spawn(move || {
                let transport = SocketTransport::connect(mesh_config(rank, 47710)).unwrap();
                assert_eq!(transport.get_kind(), TransportKind::Socket);
                assert_eq!(transport.get_rank(), rank);
                assert_eq!(transport.get_world_size(), 2);
                // TCP cannot consume device buffers
                assert!(!transport.supports_device_buffers());

                if rank == 0 {
                    let ticket = transport
                        .post_send(1, 5, b"hello courier".to_vec())
                        .unwrap();
                    match transport.wait_complete(ticket).unwrap() {
                        Completion::Sent => {}
                        other => panic!("send completed as {:?}", other),
                    }
                } else {
                    let ticket = transport.post_recv(0, 5, 13).unwrap();
                    match transport.wait_complete(ticket).unwrap() {
                        Completion::Received(bytes) => {
                            assert_eq!(bytes.as_slice(), b"hello courier")
                        }
                        other => panic!("receive completed as {:?}", other),
                    }
                }
                transport.finalize().unwrap();
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        println!("✓ bytes crossed the TCP mesh");
    }

    #[test]
    fn test_same_tag_fifo_over_tcp() {
        let mut threads = Vec::new();
        for rank in 0..2 {
            threads.push(thread::spawn(move || {
                let transport = SocketTransport::connect(mesh_config(rank, 47730)).unwrap();
                if rank == 0 {
                    let mut tickets = Vec::new();
                    for seq in 1u32..=3 {
                        tickets.push(
                            transport.post_send(1, 2, seq.to_le_bytes().to_vec()).unwrap(),
                        );
                    }
                    for ticket in tickets {
                        transport.wait_complete(ticket).unwrap();
                    }
                } else {
                    for seq in 1u32..=3 {
                        let ticket = transport.post_recv(0, 2, 4).unwrap();
                        match transport.wait_complete(ticket).unwrap() {
                            Completion::Received(bytes) => {
                                let got = u32::from_le_bytes(bytes.try_into().unwrap());
                                assert_eq!(got, seq, "messages reordered");
                            }
                            other => panic!("receive completed as {:?}", other),
                        }
                    }
                }
                transport.finalize().unwrap();
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        println!("✓ same-tag messages stayed in order over TCP");
    }

    #[test]
    fn test_node_local_ranks_on_shared_host() {
        let mut threads = Vec::new();
        for rank in 0..2 {
            threads.push(thread::spawn(move || {
                let transport = SocketTransport::connect(mesh_config(rank, 47740)).unwrap();
                // both ranks live on 127.0.0.1, one node
                assert_eq!(transport.get_node_local_rank(), rank);
                transport.finalize().unwrap();
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
    }
}

// =========================================================================
// Full stack over TCP
// =========================================================================

mod context_tests {
    use super::*;

    #[test]
    fn test_p2p_engine_over_socket_context() {
        let mut threads = Vec::new();
        for rank in 0..2 {
            threads.push(thread::spawn(move || {
                let mut ctx =
                    CourierContext::initialize(ContextConfig::socket(mesh_config(rank, 47720)))
                        .unwrap();
                assert_eq!(ctx.get_transport_kind(), TransportKind::Socket);
                {
                    let mut p2p = P2pEngine::new(&ctx).unwrap();
                    let mut data = if rank == 0 {
                        [2.5f64, -0.5, 8.0]
                    } else {
                        [0.0f64; 3]
                    };
                    let mut invoice = Invoice::new();
                    unsafe {
                        invoice
                            .append_vector(
                                ElementType::Float64,
                                MemLoc::Host(data.as_mut_ptr() as *mut u8),
                                3,
                            )
                            .unwrap();
                    }
                    if rank == 0 {
                        let mut handle = p2p.send(&invoice, 1, 11).unwrap();
                        p2p.wait(&mut handle).unwrap();
                        p2p.clear(&mut handle);
                    } else {
                        let mut handle = p2p.post_receive(&invoice, 0, 11).unwrap();
                        p2p.wait(&mut handle).unwrap();
                        p2p.clear(&mut handle);
                        assert_eq!(data, [2.5, -0.5, 8.0]);
                    }
                }
                ctx.finalize().unwrap();
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        println!("✓ invoices crossed a socket-backed context");
    }
}
