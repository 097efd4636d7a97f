//! Multi-rank end-to-end scenarios.
//!
//! Every test here drives real NICs and expects to be launched once per
//! rank, with the environment describing the cluster:
//!
//! ```text
//! RDMESH_PEERS=10.0.2.1,10.0.2.2,10.0.2.3   # rank order
//! RDMESH_RANK=0                             # this process
//! RDMESH_DEVICE=mlx5_0                      # optional
//! RDMESH_BASE_PORT=18515                    # optional
//! ```
//!
//! A cluster is a process singleton, so run exactly one scenario per
//! invocation:
//!
//! ```text
//! cargo test --test scenarios ring_write -- --ignored
//! ```

use std::env;
use std::net::Ipv4Addr;
use std::sync::Arc;

use rdmesh::ctrl::Roster;
use rdmesh::{Cluster, Context, Permission, RemotePtr, Volatile, Wc};

const MEM_WORDS: usize = 128 * 1024;

fn roster_from_env() -> Roster {
    let peers: Vec<Ipv4Addr> = env::var("RDMESH_PEERS")
        .expect("RDMESH_PEERS not set")
        .split(',')
        .map(|ip| ip.trim().parse().expect("bad peer address"))
        .collect();
    let rank: usize = env::var("RDMESH_RANK")
        .expect("RDMESH_RANK not set")
        .parse()
        .expect("bad rank");
    let mut roster = Roster::with_rank(peers, rank);
    if let Ok(port) = env::var("RDMESH_BASE_PORT") {
        roster.set_base_port(port.parse().expect("bad base port"));
    }
    roster
}

/// One registered arena of `MEM_WORDS` zeroed 8-byte words (so any offset
/// used by the scenarios is atomically addressable), plus the cluster over
/// it.
fn bring_up() -> (Cluster, Box<[u64]>) {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut buf = vec![0u64; MEM_WORDS].into_boxed_slice();
    let roster = roster_from_env();
    let device = env::var("RDMESH_DEVICE").ok();

    let ctx: Arc<Context> = Context::open(device.as_deref()).expect("cannot open device");
    let slot = ctx.reg_mr(
        buf.as_mut_ptr() as *mut u8,
        buf.len() * 8,
        Permission::default(),
    );
    assert_eq!(slot, 0);

    (Cluster::new(ctx, roster), buf)
}

#[test]
#[ignore = "requires an RDMA cluster launcher"]
fn ring_write() {
    let (cluster, mut buf) = bring_up();
    cluster.establish(1, 0);
    assert_eq!(cluster.verbose(), 0);

    let id = cluster.whoami();
    let n = cluster.size();
    let next = (id + 1) % n;
    let prev = (id + n - 1) % n;

    let base = buf.as_mut_ptr() as *mut u8;
    let msg = format!("hello from {}", id);
    // Stage the message in the local arena past the landing offset.
    unsafe {
        std::ptr::copy_nonoverlapping(msg.as_ptr(), base.add(512), msg.len());
    }

    let peer = cluster.peer(next);
    let (dst, dst_len) = peer.remote_mr(0);
    assert!(dst_len >= 1024);
    let rc = peer.rc(0);
    rc.post_write(dst + 64, unsafe { base.add(512) }, msg.len(), true, 1)
        .unwrap();
    rc.poll_send_cq(1);
    cluster.sync();

    let expected = format!("hello from {}", prev);
    let landed = unsafe { std::slice::from_raw_parts(base.add(64), expected.len()) };
    assert_eq!(landed, expected.as_bytes());
    cluster.sync();
}

#[test]
#[ignore = "requires an RDMA cluster launcher"]
fn cas_ordering() {
    const CLIENT: usize = 0;
    const SERVER: usize = 1;
    const BATCH: usize = 64;

    let (cluster, mut buf) = bring_up();
    cluster.establish(1, 0);
    assert_eq!(cluster.size(), 2, "cas_ordering runs on exactly 2 ranks");

    let n_tests: usize = env::var("RDMESH_CAS_BATCHES")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);

    if cluster.whoami() == CLIENT {
        let svr = cluster.peer(SERVER);
        let (dst, _len) = svr.remote_mr(0);
        let rc = svr.rc(0);

        let local = buf.as_mut_ptr();
        let mut cur: u64 = 0;
        let mut check: u64 = 0;

        // Two staging halves: post into one while verifying the other.
        for i in 0..=n_tests {
            if i < n_tests {
                let offset = (i % 2) * BATCH;
                for j in 0..BATCH {
                    unsafe { *local.add(offset + j) = cur };
                    cur += 1;
                    rc.post_atomic_cas(
                        dst,
                        unsafe { local.add(offset + j) },
                        cur,
                        j + 1 == BATCH,
                        j as u64,
                    )
                    .unwrap();
                }
            }
            if i > 0 {
                rc.poll_send_cq(1);
                let offset = (1 - (i % 2)) * BATCH;
                for j in 0..BATCH {
                    let fetched = unsafe { *local.add(offset + j) };
                    assert_eq!(
                        fetched, check,
                        "CAS order violated at batch {} slot {}",
                        i - 1,
                        j
                    );
                    check += 1;
                }
            }
        }
    }

    cluster.sync();
}

#[test]
#[ignore = "requires an RDMA cluster launcher"]
fn field_faa_isolation() {
    const HOST: usize = 2;
    const ROUNDS: u64 = 100_000;

    let (cluster, mut buf) = bring_up();
    cluster.establish(1, 0);
    assert_eq!(cluster.size(), 3, "field_faa_isolation runs on 3 ranks");

    let id = cluster.whoami();
    if id != HOST {
        let host = cluster.peer(HOST);
        let (word, _len) = host.remote_mr(0);
        let rc = host.rc(0);
        let fetch = buf.as_mut_ptr();

        // Rank 0 owns bits [0, 15], rank 1 owns bits [16, 31].
        let (hi, lo): (u32, u32) = if id == 0 { (15, 0) } else { (31, 16) };
        for i in 0..ROUNDS {
            rc.post_field_atomic_faa(word, fetch, 1, hi, lo, true, i).unwrap();
            rc.poll_send_cq(1);
        }
    }

    cluster.sync();
    if id == HOST {
        let word = unsafe { *(buf.as_ptr() as *const u64) };
        let per_field = ROUNDS % (1 << 16);
        assert_eq!(word & 0xFFFF, per_field, "low field corrupted");
        assert_eq!((word >> 16) & 0xFFFF, per_field, "high field corrupted");
        assert_eq!(word >> 32, 0, "carries leaked past the field boundary");
    }
    cluster.sync();
}

#[test]
#[ignore = "requires an RDMA cluster launcher"]
fn remote_pointer_cache() {
    const WRITER: usize = 0;
    const READER: usize = 1;

    let (cluster, mut buf) = bring_up();
    cluster.establish(1, 0);
    assert_eq!(cluster.size(), 2, "remote_pointer_cache runs on 2 ranks");

    let word = buf.as_mut_ptr();
    if cluster.whoami() == WRITER {
        unsafe { *word = 0xA };
        cluster.sync(); // value A published
        cluster.sync(); // reader has cached A
        unsafe { std::ptr::write_volatile(word, 0xB) };
        cluster.sync(); // value B published
        cluster.sync(); // reader done
    } else {
        let peer = cluster.peer(WRITER);
        let (remote, _len) = peer.remote_mr(0);
        let rc = peer.rc(0);
        // Stage past the writer-visible word.
        let staging = unsafe { (word as *mut u8).add(1024) };

        cluster.sync(); // value A published
        let mut p: RemotePtr<u64> = RemotePtr::new(rc, remote, staging);
        assert_eq!(*p.get(), 0xA);
        // A second dereference is served locally: no completion appears.
        assert_eq!(*p.get(), 0xA);
        let mut wc = [Wc::default(); 4];
        assert_eq!(rc.poll_send_cq_once(&mut wc), 0);
        cluster.sync(); // reader has cached A
        cluster.sync(); // value B published

        // Still cached until explicitly invalidated.
        assert_eq!(*p.get(), 0xA);
        p.invalidate();
        assert_eq!(*p.get(), 0xB);

        // A volatile view reaches the wire on every dereference.
        let mut v: RemotePtr<Volatile<u64>> = p.reinterpret_at(0);
        assert_eq!(v.get().0, 0xB);
        assert_eq!(v.get().0, 0xB);
        cluster.sync(); // reader done
    }
}

#[test]
#[ignore = "requires an RDMA cluster launcher"]
fn bringup_idempotence() {
    let (cluster, _buf) = bring_up();
    cluster.establish(2, 0);
    // The second establish must be a silent no-op regardless of arguments.
    cluster.establish(8, 0);

    assert_eq!(cluster.verbose(), 0);
    for rank in 0..cluster.size() {
        if rank == cluster.whoami() {
            continue;
        }
        assert_eq!(cluster.peer(rank).num_rc(), 2);
        assert_eq!(cluster.peer(rank).num_xrc(), 0);
    }
    cluster.sync();
}

#[test]
#[ignore = "requires an RDMA cluster launcher"]
fn xrc_fan_in() {
    const SENDER: usize = 0;
    const RECEIVER: usize = 1;
    const LANES: usize = 4;
    const MSG_LEN: usize = 64;

    let (cluster, mut buf) = bring_up();
    cluster.establish(0, LANES);
    assert_eq!(cluster.size(), 2, "xrc_fan_in runs on 2 ranks");

    let base = buf.as_mut_ptr() as *mut u8;
    if cluster.whoami() == SENDER {
        cluster.sync(); // receiver has pre-posted
        let peer = cluster.peer(RECEIVER);
        for lane in 0..LANES {
            let src = unsafe { base.add(lane * MSG_LEN) };
            unsafe { std::ptr::write_bytes(src, 0x40 + lane as u8, MSG_LEN) };
            // All lanes converge on the receiver's slot-0 SRQ.
            peer.xrc(lane).post_send(src, MSG_LEN, 0, true, lane as u64).unwrap();
        }
        for lane in 0..LANES {
            cluster.peer(RECEIVER).xrc(lane).poll_send_cq(1);
        }
        cluster.sync();
    } else {
        let sink = cluster.peer(SENDER).xrc(0);
        for lane in 0..LANES {
            let dst = unsafe { base.add(lane * MSG_LEN) };
            sink.post_recv(dst, MSG_LEN, lane as u64).unwrap();
        }
        cluster.sync(); // pre-posted

        let mut wc = [Wc::default(); LANES];
        sink.poll_recv_cq_into(&mut wc);

        // Arrival order across the four senders is unspecified; each landed
        // buffer must hold exactly one sender's pattern.
        let mut seen = [false; LANES];
        for entry in &wc {
            let slot = entry.wr_id() as usize;
            let landed = unsafe { std::slice::from_raw_parts(base.add(slot * MSG_LEN), MSG_LEN) };
            let tag = landed[0];
            assert!((0x40..0x40 + LANES as u8).contains(&tag), "garbage pattern");
            assert!(landed.iter().all(|&b| b == tag), "torn message");
            let lane = (tag - 0x40) as usize;
            assert!(!seen[lane], "duplicate message from lane {}", lane);
            seen[lane] = true;
        }
        assert!(seen.iter().all(|&s| s), "missing messages");
        cluster.sync();
    }
}
