//! Rendezvous layer: the out-of-band bootstrap transport.
//!
//! The RDMA core consumes exactly two primitives from this module, both
//! backed by plain TCP between the roster's addresses: a whole-cluster
//! [`Roster::barrier`] and a blocking pairwise [`Roster::send_recv`] used to
//! swap fixed-size metadata records. Transport errors during rendezvous are
//! fatal; there is nothing to fall back to before the cluster exists.

mod barrier;
mod exchange;
mod roster;

pub use roster::Roster;

use std::net::{SocketAddrV4, TcpStream};
use std::thread;
use std::time::Duration;

/// Connect to a peer that may not be listening yet.
pub(crate) fn connect_with_retry(addr: SocketAddrV4) -> TcpStream {
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => return stream,
            Err(_) => thread::sleep(Duration::from_millis(100)),
        }
    }
}
