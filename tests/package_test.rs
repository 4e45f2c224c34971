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

//! Tests for precomputed halo-exchange packages
//!
//! The recurring setup is a 1D domain of six cells per rank: four
//! interior cells flanked by one ghost cell on each side.

use std::sync::Arc;
use std::thread;

use courier::context::CourierContext;
use courier::error::Code;
use courier::invoice::{ElementType, Invoice, MemLoc};
use courier::p2p::P2pEngine;
use courier::package::{HaloLink, LinkBases, Package};

fn run_world<F>(world: i32, body: F)
where
    F: Fn(CourierContext) + Send + Sync + 'static,
{
    courier::util::logging::init_logging();
    let body = Arc::new(body);
    let mut threads = Vec::new();
    for ctx in CourierContext::initialize_loopback(world).unwrap() {
        let body = body.clone();
        threads.push(thread::spawn(move || body(ctx)));
    }
    for t in threads {
        t.join().unwrap();
    }
}

unsafe fn cell_invoice(buf: &mut [f64], index: usize) -> Invoice {
    let mut invoice = Invoice::new();
    invoice
        .append_scalar(
            ElementType::Float64,
            MemLoc::Host(buf.as_mut_ptr().add(index) as *mut u8),
        )
        .unwrap();
    invoice
}

// =========================================================================
// Exchange
// =========================================================================

mod exchange_tests {
    use super::*;

    #[test]
    fn test_two_rank_halo_exchange() {
        run_world(2, |mut ctx| {
            let rank = ctx.get_rank();
            let neighbour = 1 - rank;
            {
                let mut p2p = P2pEngine::new(&ctx).unwrap();

                // interior cells 1..=4 hold (rank+1)*100 + index
                let mut buf = [0.0f64; 6];
                for i in 1..=4 {
                    buf[i] = ((rank + 1) * 100 + i as i32) as f64;
                }
                // rank 0 owns the left half: it sends its rightmost
                // interior cell and receives into its right ghost
                let (send_cell, ghost_cell) = if rank == 0 { (4, 5) } else { (1, 0) };
                let link = unsafe {
                    HaloLink::new(
                        neighbour,
                        cell_invoice(&mut buf, send_cell),
                        cell_invoice(&mut buf, ghost_cell),
                    )
                };

                let mut package = Package::build(&ctx, vec![link]).unwrap();
                assert_eq!(package.rank(), rank);
                assert_eq!(package.links().len(), 1);

                package.exchange(&mut p2p).unwrap();

                let expected = if rank == 0 { 201.0 } else { 104.0 };
                assert_eq!(buf[ghost_cell], expected, "rank {}", rank);
                // interior stays untouched
                assert_eq!(buf[send_cell], ((rank + 1) * 100 + send_cell as i32) as f64);
            }
            ctx.finalize().unwrap();
            if rank == 0 {
                println!("✓ ghost cells carry the neighbour's edge values");
            }
        });
    }

    #[test]
    fn test_package_replays_without_rebuilding() {
        run_world(2, |mut ctx| {
            let rank = ctx.get_rank();
            let neighbour = 1 - rank;
            {
                let mut p2p = P2pEngine::new(&ctx).unwrap();
                let mut buf = [0.0f64; 6];
                let (send_cell, ghost_cell) = if rank == 0 { (4, 5) } else { (1, 0) };
                let link = unsafe {
                    HaloLink::new(
                        neighbour,
                        cell_invoice(&mut buf, send_cell),
                        cell_invoice(&mut buf, ghost_cell),
                    )
                };
                let mut package = Package::build(&ctx, vec![link]).unwrap();
                let tag = package.tag();

                // one package, a hundred timesteps
                for step in 0..100 {
                    buf[send_cell] = ((rank + 1) * 1000 + step) as f64;
                    package.exchange(&mut p2p).unwrap();
                    let expected = ((neighbour + 1) * 1000 + step) as f64;
                    assert_eq!(buf[ghost_cell], expected, "rank {} step {}", rank, step);
                }
                assert_eq!(package.tag(), tag);
                assert_eq!(package.links().len(), 1);
            }
            ctx.finalize().unwrap();
            if rank == 0 {
                println!("✓ 100 exchanges through one package");
            }
        });
    }

    #[test]
    fn test_periodic_boundary_with_self_links() {
        // a one-rank ring: both ghosts wrap around to the opposite edge
        let mut ctx = CourierContext::initialize_loopback(1)
            .unwrap()
            .pop()
            .unwrap();
        {
            let mut p2p = P2pEngine::new(&ctx).unwrap();
            let mut buf = [0.0f64; 6];
            for i in 1..=4 {
                buf[i] = i as f64;
            }
            let links = unsafe {
                vec![
                    // right edge wraps into the left ghost
                    HaloLink::new(0, cell_invoice(&mut buf, 4), cell_invoice(&mut buf, 0)),
                    // left edge wraps into the right ghost
                    HaloLink::new(0, cell_invoice(&mut buf, 1), cell_invoice(&mut buf, 5)),
                ]
            };
            let mut package = Package::build(&ctx, links).unwrap();
            package.exchange(&mut p2p).unwrap();
            assert_eq!(buf, [4.0, 1.0, 2.0, 3.0, 4.0, 1.0]);
        }
        ctx.finalize().unwrap();
        println!("✓ periodic wrap via self-links");
    }
}

// =========================================================================
// Rebinding to new buffers
// =========================================================================

mod refresh_tests {
    use super::*;

    #[test]
    fn test_refresh_repoints_every_link() {
        let mut ctx = CourierContext::initialize_loopback(1)
            .unwrap()
            .pop()
            .unwrap();
        {
            let mut p2p = P2pEngine::new(&ctx).unwrap();
            let mut a = [5.0f64, 0.0];
            let link = unsafe {
                HaloLink::new(0, cell_invoice(&mut a, 0), cell_invoice(&mut a, 1))
            };
            let mut package = Package::build(&ctx, vec![link]).unwrap();
            package.exchange(&mut p2p).unwrap();
            assert_eq!(a, [5.0, 5.0]);

            // double-buffered solvers swap fields between steps
            let mut b = [9.0f64, 0.0];
            let bases = [LinkBases {
                send: vec![MemLoc::Host(b.as_mut_ptr() as *mut u8)],
                recv: vec![MemLoc::Host(unsafe { b.as_mut_ptr().add(1) } as *mut u8)],
            }];
            unsafe { package.refresh(&bases).unwrap() };
            package.exchange(&mut p2p).unwrap();
            assert_eq!(b, [9.0, 9.0]);
            assert_eq!(a, [5.0, 5.0], "old buffer must stay untouched");
        }
        ctx.finalize().unwrap();
        println!("✓ refresh redirected the exchange to the new buffer");
    }

    #[test]
    fn test_refresh_rejects_wrong_shapes() {
        let mut ctx = CourierContext::initialize_loopback(1)
            .unwrap()
            .pop()
            .unwrap();
        {
            let mut buf = [1.0f64, 2.0];
            let link = unsafe {
                HaloLink::new(0, cell_invoice(&mut buf, 0), cell_invoice(&mut buf, 1))
            };
            let mut package = Package::build(&ctx, vec![link]).unwrap();

            // wrong link count
            let err = unsafe { package.refresh(&[]).unwrap_err() };
            assert_eq!(err.code(), Code::Invalid);

            // wrong entry count within a link
            let bases = [LinkBases {
                send: vec![],
                recv: vec![MemLoc::Host(buf.as_mut_ptr() as *mut u8)],
            }];
            let err = unsafe { package.refresh(&bases).unwrap_err() };
            assert_eq!(err.code(), Code::Invalid);
        }
        ctx.finalize().unwrap();
    }
}

// =========================================================================
// Construction
// =========================================================================

mod build_tests {
    use super::*;

    #[test]
    fn test_build_rejects_unknown_peer() {
        let mut ctx = CourierContext::initialize_loopback(1)
            .unwrap()
            .pop()
            .unwrap();
        {
            let mut buf = [0.0f64; 2];
            let link = unsafe {
                HaloLink::new(3, cell_invoice(&mut buf, 0), cell_invoice(&mut buf, 1))
            };
            let err = Package::build(&ctx, vec![link]).unwrap_err();
            assert_eq!(err.code(), Code::Invalid);
        }
        ctx.finalize().unwrap();
    }

    #[test]
    fn test_ranks_agree_on_package_tags() {
        let mut ctxs = CourierContext::initialize_loopback(2).unwrap();
        let mut threads = Vec::new();
        for ctx in ctxs.drain(..) {
            threads.push(thread::spawn(move || {
                let mut ctx = ctx;
                let rank = ctx.get_rank();
                let neighbour = 1 - rank;
                let tags = {
                    let mut buf = [0.0f64; 6];
                    let (send_cell, ghost_cell) = if rank == 0 { (4, 5) } else { (1, 0) };
                    // both ranks build their packages in the same order
                    let first = Package::build(&ctx, vec![unsafe {
                        HaloLink::new(
                            neighbour,
                            cell_invoice(&mut buf, send_cell),
                            cell_invoice(&mut buf, ghost_cell),
                        )
                    }])
                    .unwrap();
                    let second = Package::build(&ctx, vec![unsafe {
                        HaloLink::new(
                            neighbour,
                            cell_invoice(&mut buf, send_cell),
                            cell_invoice(&mut buf, ghost_cell),
                        )
                    }])
                    .unwrap();
                    (first.tag(), second.tag())
                };
                ctx.finalize().unwrap();
                tags
            }));
        }
        let tags: Vec<(i32, i32)> = threads.into_iter().map(|t| t.join().unwrap()).collect();
        assert_eq!(tags[0], tags[1], "ranks drew different exchange tags");
        assert_ne!(tags[0].0, tags[0].1, "packages must not share a tag");
        println!("✓ package tags agree across ranks: {:?}", tags[0]);
    }
}
