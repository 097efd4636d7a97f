//! Per-remote-node connection aggregates.

use std::sync::{Arc, OnceLock};

use crate::ctrl::Roster;
use crate::rdma::context::Context;
use crate::rdma::exchange::OobExchange;
use crate::rdma::mr::{self, MrRecord};
use crate::rdma::rc::RcConn;
use crate::rdma::types::{RKey, SrqNum};
use crate::rdma::xrc::XrcConn;
use crate::rdma::Consts;
use crate::utils::die;

/// Everything learned about the remote node during the out-of-band exchange:
/// its memory regions and the SRQ numbers of its XRC slots.
///
/// Published exactly once per peer and shared read-only with the peer's
/// connections, so the fast path resolves remote keys without reaching back
/// into the peer.
pub(crate) struct RemoteInfo {
    num_mr: usize,
    mrs: [MrRecord; Consts::MAX_MRS],
    num_xrc: usize,
    xrc_srq_nums: [SrqNum; Consts::MAX_CONNECTIONS],
}

impl RemoteInfo {
    #[inline]
    pub(crate) fn match_rkey(&self, addr: u64, len: u64) -> Option<RKey> {
        mr::match_rkey(self.mrs[..self.num_mr].iter(), addr, len)
    }

    #[inline]
    pub(crate) fn mr(&self, id: usize, who: &str) -> MrRecord {
        if id >= self.num_mr {
            die!("{}: remote MR {} out of range ({} registered)", who, id, self.num_mr);
        }
        self.mrs[id]
    }

    #[inline]
    pub(crate) fn xrc_srq_num(&self, id: usize, who: &str) -> SrqNum {
        if id >= self.num_xrc {
            die!("{}: remote XRC slot {} out of range ({} slots)", who, id, self.num_xrc);
        }
        self.xrc_srq_nums[id]
    }
}

struct Links {
    rcs: Vec<RcConn>,
    xrcs: Vec<XrcConn>,
}

/// A remote node this node holds RDMA connections with.
///
/// Peers are created at cluster construction; their connections are
/// instantiated lazily when the cluster establishes.
pub struct Peer {
    ctx: Arc<Context>,
    local_rank: usize,
    rank: usize,
    remote: Arc<OnceLock<RemoteInfo>>,
    links: OnceLock<Links>,
}

/// Check a CQ-sharing policy: each slot may use its own CQs (`-1` or the
/// slot's own index) or those of an already-created lesser slot.
pub(crate) fn validate_cq_policy(policy: &[i32]) -> Result<(), String> {
    for (i, &p) in policy.iter().enumerate() {
        let own = p == -1 || p == i as i32;
        let earlier = p >= 0 && (p as usize) < i;
        if !own && !earlier {
            return Err(format!("share_cq_with[{}] = {} is invalid", i, p));
        }
    }
    Ok(())
}

impl Peer {
    pub(crate) fn new(ctx: Arc<Context>, local_rank: usize, rank: usize) -> Self {
        ctx.add_dep();
        Self {
            ctx,
            local_rank,
            rank,
            remote: Arc::new(OnceLock::new()),
            links: OnceLock::new(),
        }
    }

    /// Rank of the remote node.
    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Base address and length of the peer's registered region `id`.
    pub fn remote_mr(&self, id: usize) -> (u64, usize) {
        let rec = self.remote_info().mr(id, &self.who());
        (rec.base, rec.length as usize)
    }

    /// Resolve the remote key covering `[addr, addr + len)` in the peer's
    /// registered regions. Same first-match scan as the local table; a miss
    /// is an address fault.
    pub fn match_remote_rkey(&self, addr: u64, len: usize) -> RKey {
        match self.remote_info().match_rkey(addr, len as u64) {
            Some(key) => key,
            None => die!("{}: cannot match remote mr for {:#x}+{}", self.who(), addr, len),
        }
    }

    /// The RC connection in slot `id`.
    #[inline]
    pub fn rc(&self, id: usize) -> &RcConn {
        &self.links().rcs[id]
    }

    /// The XRC connection in slot `id`.
    #[inline]
    pub fn xrc(&self, id: usize) -> &XrcConn {
        &self.links().xrcs[id]
    }

    /// Number of established RC connections.
    #[inline]
    pub fn num_rc(&self) -> usize {
        self.links().rcs.len()
    }

    /// Number of established XRC connections.
    #[inline]
    pub fn num_xrc(&self) -> usize {
        self.links().xrcs.len()
    }

    fn who(&self) -> String {
        format!("node {} peer {}", self.local_rank, self.rank)
    }

    fn remote_info(&self) -> &RemoteInfo {
        match self.remote.get() {
            Some(info) => info,
            None => die!("{}: not yet established", self.who()),
        }
    }

    fn links(&self) -> &Links {
        match self.links.get() {
            Some(links) => links,
            None => die!("{}: not yet established", self.who()),
        }
    }

    /// Build this node's ends, swap one metadata record with the counterpart
    /// rank, and drive every connection to Ready-to-Send.
    pub(crate) fn establish(&self, roster: &Roster, num_rc: usize, num_xrc: usize) {
        self.establish_inner(roster, num_rc, None, num_xrc);
    }

    /// RC-only variant honoring a CQ-sharing policy.
    pub(crate) fn establish_with_cq_policy(
        &self,
        roster: &Roster,
        num_rc: usize,
        share_cq_with: &[i32],
    ) {
        if share_cq_with.len() != num_rc {
            die!(
                "{}: CQ-sharing policy has {} entries for {} connections",
                self.who(),
                share_cq_with.len(),
                num_rc
            );
        }
        if let Err(why) = validate_cq_policy(share_cq_with) {
            die!("{}: {}", self.who(), why);
        }
        self.establish_inner(roster, num_rc, Some(share_cq_with), 0);
    }

    fn establish_inner(
        &self,
        roster: &Roster,
        num_rc: usize,
        share_cq_with: Option<&[i32]>,
        num_xrc: usize,
    ) {
        let who = self.who();
        if self.links.get().is_some() {
            die!("{}: established twice", who);
        }

        // Instantiate the local ends.
        let mut rcs: Vec<RcConn> = Vec::with_capacity(num_rc);
        for i in 0..num_rc {
            let share = share_cq_with.map_or(-1, |p| p[i]);
            let conn = if share >= 0 && (share as usize) < i {
                let donor = &rcs[share as usize];
                RcConn::with_cqs(
                    Arc::clone(&self.ctx),
                    Arc::clone(&self.remote),
                    self.local_rank,
                    self.rank,
                    i,
                    donor.send_cq().clone(),
                    donor.recv_cq().clone(),
                )
            } else {
                RcConn::new(
                    Arc::clone(&self.ctx),
                    Arc::clone(&self.remote),
                    self.local_rank,
                    self.rank,
                    i,
                )
            };
            match conn {
                Ok(conn) => rcs.push(conn),
                Err(e) => die!("{}: cannot create rc {}: {}", who, i, e),
            }
        }

        let mut xrcs: Vec<XrcConn> = Vec::with_capacity(num_xrc);
        for i in 0..num_xrc {
            match XrcConn::new(
                Arc::clone(&self.ctx),
                Arc::clone(&self.remote),
                self.local_rank,
                self.rank,
                i,
            ) {
                Ok(conn) => xrcs.push(conn),
                Err(e) => die!("{}: cannot create xrc {}: {}", who, i, e),
            }
        }

        // Fill the local record.
        let mut xchg = OobExchange::zeroed();
        xchg.gid = self.ctx.gid();
        xchg.lid = self.ctx.lid();
        xchg.num_mr = self.ctx.mr_count() as i32;
        for i in 0..self.ctx.mr_count() {
            xchg.mr[i] = self.ctx.mr_record(i);
        }
        xchg.num_rc = num_rc as i32;
        for rc in &rcs {
            rc.fill_exchange(&mut xchg);
        }
        xchg.num_xrc = num_xrc as i32;
        for xrc in &xrcs {
            xrc.fill_exchange(&mut xchg);
        }
        xchg.log_summary(&who);

        // Symmetric swap with the counterpart rank.
        let mut remote_xchg = OobExchange::zeroed();
        roster.send_recv(self.rank, xchg.as_bytes(), remote_xchg.as_bytes_mut());

        if remote_xchg.num_rc as usize != num_rc || remote_xchg.num_xrc as usize != num_xrc {
            die!(
                "{}: connection count mismatch (local {}/{}, remote {}/{})",
                who,
                num_rc,
                num_xrc,
                remote_xchg.num_rc,
                remote_xchg.num_xrc
            );
        }
        if remote_xchg.num_mr as usize > Consts::MAX_MRS {
            die!("{}: remote advertises {} MRs", who, remote_xchg.num_mr);
        }

        self.remote
            .set(RemoteInfo {
                num_mr: remote_xchg.num_mr as usize,
                mrs: remote_xchg.mr,
                num_xrc: remote_xchg.num_xrc as usize,
                xrc_srq_nums: remote_xchg.xrc_srq_num,
            })
            .unwrap_or_else(|_| die!("{}: remote info published twice", who));

        // Drive every end to Ready-to-Send against the matching slot.
        for (i, rc) in rcs.iter().enumerate() {
            rc.establish(remote_xchg.gid, remote_xchg.lid, remote_xchg.rc_qp_num[i]);
        }
        for (i, xrc) in xrcs.iter().enumerate() {
            xrc.establish(
                remote_xchg.gid,
                remote_xchg.lid,
                remote_xchg.xrc_ini_qp_num[i],
                remote_xchg.xrc_tgt_qp_num[i],
            );
        }

        if self.links.set(Links { rcs, xrcs }).is_err() {
            die!("{}: established twice", who);
        }
    }

    /// Log the state of every connection. Returns 0 iff all are
    /// Ready-to-Send. A peer with no connections yet has nothing to report.
    pub(crate) fn verbose(&self) -> i32 {
        let Some(links) = self.links.get() else {
            return 0;
        };
        for rc in &links.rcs {
            let ret = rc.verbose();
            if ret != 0 {
                return ret;
            }
        }
        for xrc in &links.xrcs {
            let ret = xrc.verbose();
            if ret != 0 {
                return ret;
            }
        }
        0
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.ctx.del_dep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cq_policy_accepts_own_and_earlier_slots() {
        assert!(validate_cq_policy(&[]).is_ok());
        assert!(validate_cq_policy(&[-1, 1, 0, -1]).is_ok());
        assert!(validate_cq_policy(&[0, 0, 0]).is_ok());
    }

    #[test]
    fn cq_policy_rejects_forward_and_garbage_references() {
        // Slot 0 cannot reference slot 1, which does not exist yet.
        assert!(validate_cq_policy(&[1]).is_err());
        assert!(validate_cq_policy(&[-1, 2]).is_err());
        assert!(validate_cq_policy(&[-2]).is_err());
    }
}
