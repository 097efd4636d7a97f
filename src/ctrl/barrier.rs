use std::io::prelude::*;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use super::roster::Roster;
use crate::utils::die;

/// Whole-cluster rendezvous.
///
/// Rank 0 listens on the roster's base port; every other rank connects to
/// it. Once rank 0 holds all `size - 1` connections, it releases each of
/// them with one byte. A rank released from barrier `k` can only find the
/// listener of barrier `k + 1` after rank 0 has opened it, so back-to-back
/// barriers on the same port do not bleed into each other.
pub(crate) fn wait(roster: &Roster) {
    let port = roster.base_port();
    if roster.rank() == 0 {
        let inaddr_any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        let listener = match TcpListener::bind(inaddr_any) {
            Ok(listener) => listener,
            Err(e) => die!("barrier: cannot listen on port {}: {}", port, e),
        };

        let mut streams = Vec::with_capacity(roster.size() - 1);
        for _ in 1..roster.size() {
            match listener.accept() {
                Ok((stream, _)) => streams.push(stream),
                Err(e) => die!("barrier: accept failed: {}", e),
            }
        }

        for mut stream in streams {
            if let Err(e) = stream.write_all(&[0]) {
                die!("barrier: release failed: {}", e);
            }
        }
    } else {
        let server_addr = SocketAddrV4::new(roster.peer_ip(0), port);
        let mut stream = super::connect_with_retry(server_addr);

        let mut buf = [0u8; 1];
        if let Err(e) = stream.read_exact(&mut buf) {
            die!("barrier: release never arrived: {}", e);
        }
    }
}
