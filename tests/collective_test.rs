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

//! Tests for broadcast, all-reduce, and barrier over loopback worlds

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;

use courier::collective::{CollectiveEngine, ReduceOp};
use courier::context::CourierContext;
use courier::invoice::{ElementType, Invoice, MemLoc};

/// Run `body` once per rank of a loopback world, each on its own thread.
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

// =========================================================================
// Broadcast
// =========================================================================

mod broadcast_tests {
    use super::*;

    #[test]
    fn test_broadcast_from_nonzero_root() {
        run_world(4, |mut ctx| {
            let rank = ctx.get_rank();
            {
                let mut coll = CollectiveEngine::new(&ctx).unwrap();

                let mut data = if rank == 2 {
                    [10i32, 20, 30, 40]
                } else {
                    [0i32; 4]
                };
                let mut invoice = Invoice::new();
                unsafe {
                    invoice
                        .append_vector(
                            ElementType::Int32,
                            MemLoc::Host(data.as_mut_ptr() as *mut u8),
                            4,
                        )
                        .unwrap();
                }
                coll.broadcast(&invoice, 2).unwrap();
                assert_eq!(data, [10, 20, 30, 40], "rank {}", rank);

                // a second broadcast straight after, from a different root
                let mut field = if rank == 0 { [3.5f64, -1.25] } else { [0.0; 2] };
                let mut second = Invoice::new();
                unsafe {
                    second
                        .append_vector(
                            ElementType::Float64,
                            MemLoc::Host(field.as_mut_ptr() as *mut u8),
                            2,
                        )
                        .unwrap();
                }
                coll.broadcast(&second, 0).unwrap();
                assert_eq!(field, [3.5, -1.25], "rank {}", rank);
            }
            ctx.finalize().unwrap();
            if rank == 0 {
                println!("✓ both broadcasts replicated the root's data");
            }
        });
    }

    #[test]
    fn test_broadcast_shape_mismatch_errors_on_receiver() {
        run_world(2, |mut ctx| {
            let rank = ctx.get_rank();
            {
                let mut coll = CollectiveEngine::new(&ctx).unwrap();
                // rank 1 posts half the root's element count
                let mut data = [0.0f64; 4];
                let len = if rank == 0 { 4 } else { 2 };
                if rank == 0 {
                    data = [1.0, 2.0, 3.0, 4.0];
                }
                let mut invoice = Invoice::new();
                unsafe {
                    invoice
                        .append_vector(
                            ElementType::Float64,
                            MemLoc::Host(data.as_mut_ptr() as *mut u8),
                            len,
                        )
                        .unwrap();
                }
                let result = coll.broadcast(&invoice, 0);
                if rank == 0 {
                    result.unwrap();
                } else {
                    assert!(result.is_err(), "mismatched layout must not unpack");
                }
            }
            ctx.finalize().unwrap();
        });
    }
}

// =========================================================================
// All-reduce
// =========================================================================

mod all_reduce_tests {
    use super::*;

    #[test]
    fn test_sum_across_four_ranks() {
        run_world(4, |mut ctx| {
            let rank = ctx.get_rank();
            {
                let mut coll = CollectiveEngine::new(&ctx).unwrap();
                let r = (rank + 1) as f64;
                let mut data = [r, 10.0 * r, 100.0 * r];
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
                coll.all_reduce(&invoice, ReduceOp::Sum).unwrap();
                // 1 + 2 + 3 + 4 and its scaled copies
                assert_eq!(data, [10.0, 100.0, 1000.0], "rank {}", rank);
            }
            ctx.finalize().unwrap();
            if rank == 0 {
                println!("✓ every rank holds the global sum");
            }
        });
    }

    #[test]
    fn test_min_and_max() {
        run_world(4, |mut ctx| {
            let rank = ctx.get_rank();
            {
                let mut coll = CollectiveEngine::new(&ctx).unwrap();

                let mut lows = [rank * 2, 100 - rank];
                let mut invoice = Invoice::new();
                unsafe {
                    invoice
                        .append_vector(
                            ElementType::Int32,
                            MemLoc::Host(lows.as_mut_ptr() as *mut u8),
                            2,
                        )
                        .unwrap();
                }
                coll.all_reduce(&invoice, ReduceOp::Min).unwrap();
                assert_eq!(lows, [0, 97], "rank {}", rank);

                let mut highs = [rank * 2, 100 - rank];
                let mut second = Invoice::new();
                unsafe {
                    second
                        .append_vector(
                            ElementType::Int32,
                            MemLoc::Host(highs.as_mut_ptr() as *mut u8),
                            2,
                        )
                        .unwrap();
                }
                coll.all_reduce(&second, ReduceOp::Max).unwrap();
                assert_eq!(highs, [6, 100], "rank {}", rank);
            }
            ctx.finalize().unwrap();
        });
    }

    #[test]
    fn test_product() {
        run_world(4, |mut ctx| {
            let rank = ctx.get_rank();
            {
                let mut coll = CollectiveEngine::new(&ctx).unwrap();
                let mut value = (rank + 1) as i64;
                let mut invoice = Invoice::new();
                unsafe {
                    invoice
                        .append_scalar(
                            ElementType::Int64,
                            MemLoc::Host(&mut value as *mut i64 as *mut u8),
                        )
                        .unwrap();
                }
                coll.all_reduce(&invoice, ReduceOp::Prod).unwrap();
                assert_eq!(value, 24, "rank {}", rank);
            }
            ctx.finalize().unwrap();
        });
    }

    #[test]
    fn test_sum_in_non_power_of_two_world() {
        run_world(3, |mut ctx| {
            let rank = ctx.get_rank();
            {
                let mut coll = CollectiveEngine::new(&ctx).unwrap();
                let mut value = (rank + 1) as f64;
                let mut invoice = Invoice::new();
                unsafe {
                    invoice
                        .append_scalar(
                            ElementType::Float64,
                            MemLoc::Host(&mut value as *mut f64 as *mut u8),
                        )
                        .unwrap();
                }
                coll.all_reduce(&invoice, ReduceOp::Sum).unwrap();
                assert_eq!(value, 6.0, "rank {}", rank);
            }
            ctx.finalize().unwrap();
            if rank == 0 {
                println!("✓ three-rank sum folded the extra rank in");
            }
        });
    }
}

// =========================================================================
// Barrier
// =========================================================================

mod barrier_tests {
    use super::*;

    #[test]
    fn test_barrier_waits_for_every_rank() {
        let arrived = Arc::new(AtomicI32::new(0));
        let counter = arrived.clone();
        run_world(4, move |mut ctx| {
            {
                let mut coll = CollectiveEngine::new(&ctx).unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                coll.barrier().unwrap();
                // nobody passes the barrier before everyone arrives
                assert_eq!(counter.load(Ordering::SeqCst), 4);
            }
            ctx.finalize().unwrap();
        });
        assert_eq!(arrived.load(Ordering::SeqCst), 4);
        println!("✓ barrier released only after all ranks arrived");
    }
}

// =========================================================================
// Degenerate world
// =========================================================================

mod single_rank_tests {
    use super::*;

    #[test]
    fn test_world_of_one_is_identity() {
        let mut ctx = CourierContext::initialize_loopback(1)
            .unwrap()
            .pop()
            .unwrap();
        {
            let mut coll = CollectiveEngine::new(&ctx).unwrap();
            let mut data = [7.0f64, 8.0];
            let mut invoice = Invoice::new();
            unsafe {
                invoice
                    .append_vector(
                        ElementType::Float64,
                        MemLoc::Host(data.as_mut_ptr() as *mut u8),
                        2,
                    )
                    .unwrap();
            }
            coll.broadcast(&invoice, 0).unwrap();
            assert_eq!(data, [7.0, 8.0]);

            coll.all_reduce(&invoice, ReduceOp::Sum).unwrap();
            assert_eq!(data, [7.0, 8.0]);

            coll.barrier().unwrap();
        }
        ctx.finalize().unwrap();
    }
}
