use std::io::prelude::*;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};

use super::roster::Roster;
use crate::utils::die;

/// Blocking symmetric exchange with one counterpart rank.
///
/// The lower rank connects and the higher rank listens, on a port derived
/// from the pair so that exchanges between different pairs never cross.
/// Both buffers are fixed-size: the connector writes then reads, the
/// listener reads then writes.
pub(crate) fn send_recv(roster: &Roster, with: usize, send: &[u8], recv: &mut [u8]) {
    let me = roster.rank();
    if me == with {
        die!("exchange: rank {} cannot exchange with itself", me);
    }

    let port = pair_port(roster, me, with);
    if me < with {
        let server_addr = SocketAddrV4::new(roster.peer_ip(with), port);
        let mut stream = super::connect_with_retry(server_addr);
        if let Err(e) = stream.write_all(send).and_then(|_| stream.read_exact(recv)) {
            die!("exchange: with rank {} failed: {}", with, e);
        }
    } else {
        let inaddr_any = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        let listener = match TcpListener::bind(inaddr_any) {
            Ok(listener) => listener,
            Err(e) => die!("exchange: cannot listen on port {}: {}", port, e),
        };
        let mut stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) => die!("exchange: accept failed: {}", e),
        };
        if let Err(e) = stream.read_exact(recv).and_then(|_| stream.write_all(send)) {
            die!("exchange: with rank {} failed: {}", with, e);
        }
    }
}

/// Pairwise port, identical from both ends.
fn pair_port(roster: &Roster, a: usize, b: usize) -> u16 {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let offset = (lo * roster.size() + hi) % 40_000;
    roster.base_port() + 1 + offset as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_ports_are_symmetric_and_distinct() {
        let roster = Roster::with_rank(
            vec![
                Ipv4Addr::new(10, 0, 0, 1),
                Ipv4Addr::new(10, 0, 0, 2),
                Ipv4Addr::new(10, 0, 0, 3),
            ],
            0,
        );
        assert_eq!(pair_port(&roster, 0, 1), pair_port(&roster, 1, 0));
        assert_ne!(pair_port(&roster, 0, 1), pair_port(&roster, 0, 2));
        assert_ne!(pair_port(&roster, 0, 2), pair_port(&roster, 1, 2));
        // None of them collides with the barrier port.
        assert_ne!(pair_port(&roster, 0, 1), roster.base_port());
    }
}
