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

//! Tests for the coupled-model sub-partition transport

use std::thread;

use courier::error::Code;
use courier::net::{
    Completion, CoupledTransport, LoopbackFabric, Transport, TransportKind,
};

// =========================================================================
// Rank translation
// =========================================================================

mod partition_tests {
    use super::*;

    #[test]
    fn test_odd_ranks_form_their_own_world() {
        // global ranks 1 and 3 are the solver; 0 and 2 drive the coupled
        // external model and never see solver traffic
        let endpoints = LoopbackFabric::create(4).unwrap();
        let mut threads = Vec::new();
        for (global, endpoint) in endpoints.into_iter().enumerate() {
            threads.push(thread::spawn(move || {
                let global = global as i32;
                if global % 2 == 1 {
                    let coupled =
                        CoupledTransport::wrap(Box::new(endpoint), vec![1, 3]).unwrap();
                    assert_eq!(coupled.get_kind(), TransportKind::Coupled);
                    assert_eq!(coupled.get_world_size(), 2);
                    let local = coupled.get_rank();
                    assert_eq!(local, (global - 1) / 2);
                    // node-local rank stays global: device binding cares
                    // about the physical node, not the partition
                    assert_eq!(coupled.get_node_local_rank(), global);

                    if local == 0 {
                        let ticket = coupled.post_send(1, 6, vec![0xAB, 0xCD]).unwrap();
                        match coupled.wait_complete(ticket).unwrap() {
                            Completion::Sent => {}
                            other => panic!("send completed as {:?}", other),
                        }
                    } else {
                        let ticket = coupled.post_recv(0, 6, 2).unwrap();
                        match coupled.wait_complete(ticket).unwrap() {
                            Completion::Received(bytes) => assert_eq!(bytes, vec![0xAB, 0xCD]),
                            other => panic!("receive completed as {:?}", other),
                        }
                    }
                    coupled.finalize().unwrap();
                } else {
                    endpoint.finalize().unwrap();
                }
            }));
        }
        for t in threads {
            t.join().unwrap();
        }
        println!("✓ local ranks 0 and 1 exchanged over global ranks 1 and 3");
    }

    #[test]
    fn test_peers_outside_partition_are_unreachable() {
        let endpoint = LoopbackFabric::create(1).unwrap().pop().unwrap();
        let coupled = CoupledTransport::wrap(Box::new(endpoint), vec![0]).unwrap();
        assert_eq!(coupled.get_world_size(), 1);

        let err = coupled.post_send(1, 0, vec![1]).unwrap_err();
        assert_eq!(err.code(), Code::Invalid);
        let err = coupled.post_recv(-1, 0, 1).unwrap_err();
        assert_eq!(err.code(), Code::Invalid);

        coupled.finalize().unwrap();
    }
}

// =========================================================================
// Member list validation
// =========================================================================

mod wrap_tests {
    use super::*;

    #[test]
    fn test_wrap_rejects_empty_member_list() {
        let endpoint = LoopbackFabric::create(1).unwrap().pop().unwrap();
        let err = CoupledTransport::wrap(Box::new(endpoint), vec![]).unwrap_err();
        assert_eq!(err.code(), Code::Invalid);
    }

    #[test]
    fn test_wrap_rejects_duplicate_member() {
        let mut endpoints = LoopbackFabric::create(2).unwrap();
        let endpoint = endpoints.remove(0);
        let err = CoupledTransport::wrap(Box::new(endpoint), vec![0, 0]).unwrap_err();
        assert_eq!(err.code(), Code::Invalid);
    }

    #[test]
    fn test_wrap_rejects_member_outside_world() {
        let mut endpoints = LoopbackFabric::create(2).unwrap();
        let endpoint = endpoints.remove(0);
        let err = CoupledTransport::wrap(Box::new(endpoint), vec![0, 5]).unwrap_err();
        assert_eq!(err.code(), Code::Invalid);
    }

    #[test]
    fn test_wrap_rejects_non_member_process() {
        let mut endpoints = LoopbackFabric::create(2).unwrap();
        // rank 0 tries to join a partition listing only rank 1
        let endpoint = endpoints.remove(0);
        let err = CoupledTransport::wrap(Box::new(endpoint), vec![1]).unwrap_err();
        assert_eq!(err.code(), Code::Invalid);
    }
}
