//! The process-wide membership singleton.

use std::sync::atomic::{compiler_fence, AtomicBool, Ordering};
use std::sync::Arc;

use crate::ctrl::Roster;
use crate::rdma::context::Context;
use crate::rdma::peer::Peer;
use crate::rdma::Consts;
use crate::utils::die;

/// Construction sentinel: at most one cluster per process.
static CLUSTER_BUILT: AtomicBool = AtomicBool::new(false);

/// The whole RDMA cluster: every peer except self, plus the rendezvous layer
/// that bootstraps them.
///
/// There is at most one `Cluster` per process; constructing a second one is
/// a configuration fault. Bring-up is once-only: concurrent or repeated
/// [`establish`](Self::establish) calls after the first return silently, so
/// racing initialization threads converge on a single bring-up.
pub struct Cluster {
    ctx: Arc<Context>,
    roster: Roster,
    rank: usize,
    size: usize,
    peers: Vec<Option<Peer>>,
    connected: AtomicBool,
}

impl Cluster {
    /// Build the cluster over an opened device and a rendezvous roster.
    /// Peers are created now; connections wait until `establish`.
    pub fn new(ctx: Arc<Context>, roster: Roster) -> Self {
        if CLUSTER_BUILT
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            die!("a Cluster already exists in this process");
        }

        let rank = roster.rank();
        let size = roster.size();
        if size > Consts::MAX_PEERS {
            die!("cluster size {} exceeds {} peers", size, Consts::MAX_PEERS);
        }

        ctx.add_dep();
        let peers = (0..size)
            .map(|r| {
                if r == rank {
                    None
                } else {
                    Some(Peer::new(Arc::clone(&ctx), rank, r))
                }
            })
            .collect();

        Self {
            ctx,
            roster,
            rank,
            size,
            peers,
            connected: AtomicBool::new(false),
        }
    }

    /// Rank of this node.
    #[inline]
    pub fn whoami(&self) -> usize {
        self.rank
    }

    /// Number of nodes in the cluster.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// The rendezvous roster backing this cluster.
    #[inline]
    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// The peer with the given rank. Asking for the own rank is a usage
    /// fault.
    #[inline]
    pub fn peer(&self, rank: usize) -> &Peer {
        match self.peers[rank].as_ref() {
            Some(peer) => peer,
            None => die!("node {}: rank {} is myself", self.rank, rank),
        }
    }

    /// Synchronize all nodes and establish `num_rc` RC plus `num_xrc` XRC
    /// connections with every peer.
    ///
    /// Once-only: after the first call wins the flag, later calls (with any
    /// arguments) return without touching anything.
    pub fn establish(&self, num_rc: usize, num_xrc: usize) {
        if !self.begin_establish(num_rc.max(num_xrc)) {
            return;
        }
        for rank in 0..self.size {
            if let Some(peer) = &self.peers[rank] {
                peer.establish(&self.roster, num_rc, num_xrc);
            }
        }
        self.finish_establish();
    }

    /// RC-only bring-up honoring a CQ-sharing policy (see
    /// [`Peer`] for the policy shape). Once-only like `establish`.
    pub fn establish_with_cq_policy(&self, num_rc: usize, share_cq_with: &[i32]) {
        if !self.begin_establish(num_rc) {
            return;
        }
        for rank in 0..self.size {
            if let Some(peer) = &self.peers[rank] {
                peer.establish_with_cq_policy(&self.roster, num_rc, share_cq_with);
            }
        }
        self.finish_establish();
    }

    /// Win the once-only flag and barrier so every node has constructed its
    /// local side before anyone exchanges.
    fn begin_establish(&self, max_conns: usize) -> bool {
        if self
            .connected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if max_conns > Consts::MAX_CONNECTIONS {
            die!(
                "node {}: {} connections exceed the {} per-peer limit",
                self.rank,
                max_conns,
                Consts::MAX_CONNECTIONS
            );
        }
        self.roster.barrier();
        true
    }

    /// Barrier so every node is Ready-to-Send before any data-plane
    /// traffic.
    fn finish_establish(&self) {
        self.roster.barrier();
        log::debug!("node {}: cluster established", self.rank);
    }

    /// Cluster-wide barrier. The compiler fence keeps the caller's memory
    /// operations from being reordered around the rendezvous.
    pub fn sync(&self) {
        self.roster.barrier();
        compiler_fence(Ordering::SeqCst);
    }

    /// Ask every peer's every connection to report its state. Purely local;
    /// returns 0 iff every queue pair is Ready-to-Send.
    pub fn verbose(&self) -> i32 {
        log::info!("node {}: *** health dump ***", self.rank);
        for peer in self.peers.iter().flatten() {
            let ret = peer.verbose();
            if ret != 0 {
                log::error!("node {}: health dump halted, issue detected", self.rank);
                return ret;
            }
        }
        0
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        // Peers drop first by field order, then the context dependency.
        self.peers.clear();
        self.ctx.del_dep();
    }
}
