//! Basic MPI transport test
//!
//! Runs standalone as a single-rank world, or under a launcher:
//!     mpirun -n 4 cargo test --features mpi --test mpi_transport_test

#[cfg(feature = "mpi")]
#[test]
fn test_mpi_ring_exchange() {
    use courier::net::mpi::MpiTransport;
    use courier::net::{Completion, Transport};

    let transport = MpiTransport::init().unwrap();
    let rank = transport.get_rank();
    let size = transport.get_world_size();

    println!("Process {}/{}: MPI transport up", rank, size);

    // pass a payload around the ring; a world of one sends to itself
    let next = (rank + 1) % size;
    let prev = (rank + size - 1) % size;

    let send = transport.post_send(next, 1, vec![rank as u8; 8]).unwrap();
    let recv = transport.post_recv(prev, 1, 8).unwrap();

    match transport.wait_complete(recv).unwrap() {
        Completion::Received(bytes) => assert_eq!(bytes, vec![prev as u8; 8]),
        other => panic!("receive completed as {:?}", other),
    }
    match transport.wait_complete(send).unwrap() {
        Completion::Sent => {}
        other => panic!("send completed as {:?}", other),
    }

    transport.finalize().unwrap();

    if rank == 0 {
        println!("All {} processes exchanged around the ring", size);
    }
}
