//! Extended reliable connections.
//!
//! XRC wiring is asymmetric. Each end owns an **initiator** queue pair (its
//! own send side), a **target** queue pair (the counterpart of some remote
//! initiator), and an SRQ bound to the XRC domain that is the addressable
//! receive endpoint. A sender picks the consuming thread on the remote node
//! per work request through the remote SRQ number, so one initiator QP per
//! thread reaches every thread of the remote node.

use std::io;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::{Arc, OnceLock};

use crate::bindings::*;
use crate::rdma::context::{Context, GID_INDEX, PORT_NUM};
use crate::rdma::cq::{Cq, Wc};
use crate::rdma::exchange::OobExchange;
use crate::rdma::gid::Gid;
use crate::rdma::peer::RemoteInfo;
use crate::rdma::rc::{
    check_atomic_alignment, qp_caps, qp_state, qp_state_str, MAX_RD_ATOMIC, MIN_RNR_TIMER,
    RETRY_CNT, TIMEOUT,
};
use crate::rdma::types::{Lid, Qpn, RKey, SrqNum, WrId};
use crate::rdma::wr;
use crate::rdma::Consts;
use crate::utils::die;
use crate::utils::interop::from_c_ret;

/// Depth of the placeholder CQ attached to queue ends that never produce
/// completions (the initiator's recv side and the target's send side).
const PLACEHOLDER_CQ_DEPTH: i32 = 4;

/// An RDMA extended reliable connection.
///
/// Single-writer on the fast path, like [`RcConn`](crate::rdma::rc::RcConn).
/// The local SRQ belongs to this end's owning thread; only that thread posts
/// receives to it.
pub struct XrcConn {
    ctx: Arc<Context>,
    remote: Arc<OnceLock<RemoteInfo>>,
    id: usize,
    who: String,

    ini_qp: NonNull<ibv_qp>,
    tgt_qp: NonNull<ibv_qp>,
    srq: NonNull<ibv_srq>,
    srq_num: SrqNum,

    send_cq: Cq,
    recv_cq: Cq,
    placeholder_cq: Cq,
}

// SAFETY: verbs handles may be driven from any single thread at a time; the
// single-writer discipline is the caller's contract.
unsafe impl Send for XrcConn {}
unsafe impl Sync for XrcConn {}

impl XrcConn {
    pub(crate) fn new(
        ctx: Arc<Context>,
        remote: Arc<OnceLock<RemoteInfo>>,
        local_rank: usize,
        peer_rank: usize,
        id: usize,
    ) -> io::Result<Self> {
        let send_cq = Cq::new(&ctx, Consts::MAX_QUEUE_DEPTH)?;
        let recv_cq = Cq::new(&ctx, Consts::MAX_QUEUE_DEPTH)?;
        let placeholder_cq = Cq::new(&ctx, PLACEHOLDER_CQ_DEPTH)?;

        let (srq, srq_num) = create_xrc_srq(&ctx, &recv_cq)?;
        let ini_qp = match create_ini_qp(&ctx, &send_cq, &placeholder_cq) {
            Ok(qp) => qp,
            Err(e) => {
                // SAFETY: created above, not yet owned by `self`.
                unsafe { ibv_destroy_srq(srq.as_ptr()) };
                return Err(e);
            }
        };
        let tgt_qp = match create_tgt_qp(&ctx, &placeholder_cq, &recv_cq, srq) {
            Ok(qp) => qp,
            Err(e) => {
                // SAFETY: created above, not yet owned by `self`.
                unsafe {
                    ibv_destroy_qp(ini_qp.as_ptr());
                    ibv_destroy_srq(srq.as_ptr());
                }
                return Err(e);
            }
        };

        ctx.add_dep();
        Ok(Self {
            who: format!("node {} peer {} xrc {}", local_rank, peer_rank, id),
            ctx,
            remote,
            id,
            ini_qp,
            tgt_qp,
            srq,
            srq_num,
            send_cq,
            recv_cq,
            placeholder_cq,
        })
    }

    /// Stable slot of this connection within its peer.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// The initiator queue pair number.
    #[inline]
    pub fn ini_qp_num(&self) -> Qpn {
        // SAFETY: the QP is alive as long as `self`.
        unsafe { (*self.ini_qp.as_ptr()).qp_num }
    }

    /// The target queue pair number.
    #[inline]
    pub fn tgt_qp_num(&self) -> Qpn {
        // SAFETY: the QP is alive as long as `self`.
        unsafe { (*self.tgt_qp.as_ptr()).qp_num }
    }

    /// The number addressing this end's SRQ from the wire.
    #[inline]
    pub fn srq_num(&self) -> SrqNum {
        self.srq_num
    }

    pub(crate) fn fill_exchange(&self, xchg: &mut OobExchange) {
        xchg.xrc_ini_qp_num[self.id] = self.ini_qp_num();
        xchg.xrc_tgt_qp_num[self.id] = self.tgt_qp_num();
        xchg.xrc_srq_num[self.id] = self.srq_num;
    }

    /// Drive both queue pairs to Ready-to-Send. The initiator connects to
    /// the remote target and the target to the remote initiator; the target
    /// side must be reachable before any remote initiator fires.
    pub(crate) fn establish(&self, gid: Gid, lid: Lid, remote_ini_qpn: Qpn, remote_tgt_qpn: Qpn) {
        self.modify_to_init(self.ini_qp);
        self.modify_to_init(self.tgt_qp);
        self.modify_to_rtr(self.ini_qp, gid, lid, remote_tgt_qpn);
        self.modify_to_rtr(self.tgt_qp, gid, lid, remote_ini_qpn);
        self.modify_to_rts(self.ini_qp);
        self.modify_to_rts(self.tgt_qp);
        log::debug!(
            "{}: established, remote ini {} tgt {}",
            self.who,
            remote_ini_qpn,
            remote_tgt_qpn
        );
    }

    fn modify_to_init(&self, qp: NonNull<ibv_qp>) {
        // SAFETY: POD attribute block for FFI.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.port_num = PORT_NUM;
        attr.pkey_index = 0;
        attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_REMOTE_READ
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_ATOMIC)
            .0;

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT
            | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
        // SAFETY: FFI.
        if unsafe { ibv_modify_qp(qp.as_ptr(), &mut attr, mask.0 as i32) } != 0 {
            die!("{}: failed to modify QP to INIT", self.who);
        }
    }

    fn modify_to_rtr(&self, qp: NonNull<ibv_qp>, gid: Gid, lid: Lid, dest_qpn: Qpn) {
        // SAFETY: POD attribute block for FFI.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = ibv_mtu::IBV_MTU_4096;
        attr.dest_qp_num = dest_qpn;
        attr.rq_psn = Consts::INIT_PSN;
        attr.max_dest_rd_atomic = MAX_RD_ATOMIC;
        attr.min_rnr_timer = MIN_RNR_TIMER;

        attr.ah_attr.dlid = lid;
        attr.ah_attr.sl = 0;
        attr.ah_attr.src_path_bits = 0;
        attr.ah_attr.port_num = PORT_NUM;
        attr.ah_attr.is_global = 1;
        attr.ah_attr.grh.dgid = gid.into();
        attr.ah_attr.grh.flow_label = 0;
        attr.ah_attr.grh.hop_limit = 1;
        attr.ah_attr.grh.sgid_index = GID_INDEX;
        attr.ah_attr.grh.traffic_class = 0;

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        // SAFETY: FFI.
        if unsafe { ibv_modify_qp(qp.as_ptr(), &mut attr, mask.0 as i32) } != 0 {
            die!("{}: failed to modify QP to RTR", self.who);
        }
    }

    fn modify_to_rts(&self, qp: NonNull<ibv_qp>) {
        // SAFETY: POD attribute block for FFI.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.sq_psn = Consts::INIT_PSN;
        attr.timeout = TIMEOUT;
        attr.retry_cnt = RETRY_CNT;
        attr.rnr_retry = RETRY_CNT;
        attr.max_rd_atomic = MAX_RD_ATOMIC;

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        // SAFETY: FFI.
        if unsafe { ibv_modify_qp(qp.as_ptr(), &mut attr, mask.0 as i32) } != 0 {
            die!("{}: failed to modify QP to RTS", self.who);
        }
    }

    fn remote(&self) -> &RemoteInfo {
        match self.remote.get() {
            Some(info) => info,
            None => die!("{}: connection not yet established", self.who),
        }
    }

    fn match_remote_rkey(&self, addr: u64, len: usize) -> RKey {
        match self.remote().match_rkey(addr, len as u64) {
            Some(key) => key,
            None => die!("{}: cannot match remote mr for {:#x}+{}", self.who, addr, len),
        }
    }

    /// The remote SRQ number every one-sided request must carry: the one of
    /// the counterpart XRC slot. Required by the transport even though the
    /// operation consumes no receive.
    fn counterpart_srq_num(&self) -> SrqNum {
        self.remote().xrc_srq_num(self.id, &self.who)
    }

    #[inline]
    fn post(&self, w: &mut ibv_send_wr) -> io::Result<()> {
        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; the work request and its SG list outlive the call.
        from_c_ret(unsafe { ibv_post_send(self.ini_qp.as_ptr(), w, &mut bad_wr) })
    }

    #[inline]
    fn post_exp(&self, w: &mut ibv_exp_send_wr) -> io::Result<()> {
        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; the work request and its SG list outlive the call.
        from_c_ret(unsafe { ibv_exp_post_send(self.ini_qp.as_ptr(), w, &mut bad_wr) })
    }

    /// Post a one-sided READ through the initiator queue pair.
    pub fn post_read(
        &self,
        dst: *mut u8,
        src: u64,
        len: usize,
        signaled: bool,
        wr_id: WrId,
    ) -> io::Result<()> {
        let mut sge = wr::sge(dst as u64, len as u32, self.ctx.match_lkey(dst as u64, len));

        // SAFETY: POD work request for FFI.
        let mut w = unsafe { mem::zeroed::<ibv_send_wr>() };
        w.wr_id = wr_id;
        w.sg_list = &mut sge;
        w.num_sge = 1;
        w.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
        if signaled {
            w.send_flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        // SAFETY: writing Copy fields of the zeroed work request unions.
        unsafe {
            w.wr.rdma.remote_addr = src;
            w.wr.rdma.rkey = self.match_remote_rkey(src, len);
            w.qp_type.xrc.remote_srqn = self.counterpart_srq_num();
        }
        self.post(&mut w)
    }

    /// Post a one-sided WRITE through the initiator queue pair.
    pub fn post_write(
        &self,
        dst: u64,
        src: *const u8,
        len: usize,
        signaled: bool,
        wr_id: WrId,
    ) -> io::Result<()> {
        let mut sge = wr::sge(src as u64, len as u32, self.ctx.match_lkey(src as u64, len));

        // SAFETY: POD work request for FFI.
        let mut w = unsafe { mem::zeroed::<ibv_send_wr>() };
        w.wr_id = wr_id;
        w.sg_list = &mut sge;
        w.num_sge = 1;
        w.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
        if signaled {
            w.send_flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        // SAFETY: writing Copy fields of the zeroed work request unions.
        unsafe {
            w.wr.rdma.remote_addr = dst;
            w.wr.rdma.rkey = self.match_remote_rkey(dst, len);
            w.qp_type.xrc.remote_srqn = self.counterpart_srq_num();
        }
        self.post(&mut w)
    }

    /// Post a two-sided SEND towards the SRQ of the remote node's XRC slot
    /// `remote_id`; that slot's owning thread will consume it.
    pub fn post_send(
        &self,
        src: *const u8,
        len: usize,
        remote_id: usize,
        signaled: bool,
        wr_id: WrId,
    ) -> io::Result<()> {
        let mut sge = wr::sge(src as u64, len as u32, self.ctx.match_lkey(src as u64, len));

        // SAFETY: POD work request for FFI.
        let mut w = unsafe { mem::zeroed::<ibv_send_wr>() };
        w.wr_id = wr_id;
        w.sg_list = &mut sge;
        w.num_sge = 1;
        w.opcode = ibv_wr_opcode::IBV_WR_SEND;
        if signaled {
            w.send_flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        // SAFETY: writing a Copy field of the zeroed work request union.
        unsafe {
            w.qp_type.xrc.remote_srqn = self.remote().xrc_srq_num(remote_id, &self.who);
        }
        self.post(&mut w)
    }

    /// Post a receive buffer to this end's SRQ.
    pub fn post_recv(&self, dst: *mut u8, len: usize, wr_id: WrId) -> io::Result<()> {
        let mut sge = wr::sge(dst as u64, len as u32, self.ctx.match_lkey(dst as u64, len));

        // SAFETY: POD work request for FFI.
        let mut w = unsafe { mem::zeroed::<ibv_recv_wr>() };
        w.wr_id = wr_id;
        w.sg_list = &mut sge;
        w.num_sge = 1;

        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_post_srq_recv(self.srq.as_ptr(), &mut w, &mut bad_wr) })
    }

    /// Post a 64-bit compare-and-swap against `dst`. See
    /// [`RcConn::post_atomic_cas`](crate::rdma::rc::RcConn::post_atomic_cas).
    pub fn post_atomic_cas(
        &self,
        dst: u64,
        compare: *mut u64,
        swap: u64,
        signaled: bool,
        wr_id: WrId,
    ) -> io::Result<()> {
        check_atomic_alignment(dst, &self.who);
        let len = mem::size_of::<u64>();
        let mut sge = wr::sge(
            compare as u64,
            len as u32,
            self.ctx.match_lkey(compare as u64, len),
        );

        // SAFETY: POD work request for FFI.
        let mut w = unsafe { mem::zeroed::<ibv_send_wr>() };
        w.wr_id = wr_id;
        w.sg_list = &mut sge;
        w.num_sge = 1;
        w.opcode = ibv_wr_opcode::IBV_WR_ATOMIC_CMP_AND_SWP;
        if signaled {
            w.send_flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        // SAFETY: writing Copy fields of the zeroed work request unions; the
        // caller hands an initialized 8-byte expected value.
        unsafe {
            w.wr.atomic.remote_addr = dst;
            w.wr.atomic.rkey = self.match_remote_rkey(dst, len);
            w.wr.atomic.compare_add = *compare;
            w.wr.atomic.swap = swap;
            w.qp_type.xrc.remote_srqn = self.counterpart_srq_num();
        }
        self.post(&mut w)
    }

    /// Post a 64-bit fetch-and-add against `dst`.
    pub fn post_atomic_faa(
        &self,
        dst: u64,
        fetch: *mut u64,
        add: u64,
        signaled: bool,
        wr_id: WrId,
    ) -> io::Result<()> {
        check_atomic_alignment(dst, &self.who);
        let len = mem::size_of::<u64>();
        let mut sge = wr::sge(
            fetch as u64,
            len as u32,
            self.ctx.match_lkey(fetch as u64, len),
        );

        // SAFETY: POD work request for FFI.
        let mut w = unsafe { mem::zeroed::<ibv_send_wr>() };
        w.wr_id = wr_id;
        w.sg_list = &mut sge;
        w.num_sge = 1;
        w.opcode = ibv_wr_opcode::IBV_WR_ATOMIC_FETCH_AND_ADD;
        if signaled {
            w.send_flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        // SAFETY: writing Copy fields of the zeroed work request unions.
        unsafe {
            w.wr.atomic.remote_addr = dst;
            w.wr.atomic.rkey = self.match_remote_rkey(dst, len);
            w.wr.atomic.compare_add = add;
            w.qp_type.xrc.remote_srqn = self.counterpart_srq_num();
        }
        self.post(&mut w)
    }

    /// Post a masked compare-and-swap. See
    /// [`RcConn::post_masked_atomic_cas`](crate::rdma::rc::RcConn::post_masked_atomic_cas).
    pub fn post_masked_atomic_cas(
        &self,
        dst: u64,
        compare: *mut u64,
        compare_mask: u64,
        swap: u64,
        swap_mask: u64,
        signaled: bool,
        wr_id: WrId,
    ) -> io::Result<()> {
        check_atomic_alignment(dst, &self.who);
        let len = mem::size_of::<u64>();
        let mut sge = wr::sge(
            compare as u64,
            len as u32,
            self.ctx.match_lkey(compare as u64, len),
        );

        // SAFETY: the caller hands an initialized 8-byte expected value.
        let compare_val = unsafe { *compare };
        let mut w = wr::masked_cas_wr(
            wr_id,
            dst,
            self.match_remote_rkey(dst, len),
            compare_val,
            compare_mask,
            swap,
            swap_mask,
            signaled,
        );
        w.sg_list = &mut sge;
        w.qp_type.xrc_remote_srq_num = self.counterpart_srq_num();
        self.post_exp(&mut w)
    }

    /// Post a fetch-and-add restricted to the bit field `[lo_bit, hi_bit]`.
    pub fn post_field_atomic_faa(
        &self,
        dst: u64,
        fetch: *mut u64,
        add: u64,
        hi_bit: u32,
        lo_bit: u32,
        signaled: bool,
        wr_id: WrId,
    ) -> io::Result<()> {
        let (add_val, boundary) = wr::field_add_operands(add, hi_bit, lo_bit);
        self.post_masked_atomic_faa(dst, fetch, add_val, boundary, signaled, wr_id)
    }

    /// Post a fetch-and-add against an arbitrary field-boundary bitmap.
    pub fn post_masked_atomic_faa(
        &self,
        dst: u64,
        fetch: *mut u64,
        add: u64,
        boundary: u64,
        signaled: bool,
        wr_id: WrId,
    ) -> io::Result<()> {
        check_atomic_alignment(dst, &self.who);
        let len = mem::size_of::<u64>();
        let mut sge = wr::sge(
            fetch as u64,
            len as u32,
            self.ctx.match_lkey(fetch as u64, len),
        );

        let mut w = wr::masked_faa_wr(
            wr_id,
            dst,
            self.match_remote_rkey(dst, len),
            add,
            boundary,
            signaled,
        );
        w.sg_list = &mut sge;
        w.qp_type.xrc_remote_srq_num = self.counterpart_srq_num();
        self.post_exp(&mut w)
    }

    /// Block until exactly `n` send completions have been drained.
    pub fn poll_send_cq(&self, n: usize) -> usize {
        self.send_cq.poll_count_blocking(n, &self.who)
    }

    /// Block until `wc` is completely filled from the send CQ.
    pub fn poll_send_cq_into(&self, wc: &mut [Wc]) -> usize {
        self.send_cq.poll_into_blocking(wc, &self.who);
        wc.len()
    }

    /// Drain whatever send completions are currently available.
    pub fn poll_send_cq_once(&self, wc: &mut [Wc]) -> usize {
        self.send_cq.poll_once(wc, &self.who)
    }

    /// Block until exactly `n` recv completions have been drained.
    pub fn poll_recv_cq(&self, n: usize) -> usize {
        self.recv_cq.poll_count_blocking(n, &self.who)
    }

    /// Block until `wc` is completely filled from the recv CQ.
    pub fn poll_recv_cq_into(&self, wc: &mut [Wc]) -> usize {
        self.recv_cq.poll_into_blocking(wc, &self.who);
        wc.len()
    }

    /// Drain whatever recv completions are currently available.
    pub fn poll_recv_cq_once(&self, wc: &mut [Wc]) -> usize {
        self.recv_cq.poll_once(wc, &self.who)
    }

    /// Log the state of both queue pairs. Returns 0 iff both are
    /// Ready-to-Send.
    pub fn verbose(&self) -> i32 {
        let ini = qp_state(self.ini_qp.as_ptr(), &self.who);
        let tgt = qp_state(self.tgt_qp.as_ptr(), &self.who);
        log::info!(
            "{}: ini {}, tgt {}",
            self.who,
            qp_state_str(ini),
            qp_state_str(tgt)
        );
        if ini == ibv_qp_state::IBV_QPS_RTS && tgt == ibv_qp_state::IBV_QPS_RTS {
            0
        } else {
            -1
        }
    }
}

impl Drop for XrcConn {
    fn drop(&mut self) {
        // SAFETY: created exactly once, destroyed exactly once; QPs go
        // before the SRQ they feed, CQs drop afterwards by field order.
        unsafe {
            ibv_destroy_qp(self.ini_qp.as_ptr());
            ibv_destroy_qp(self.tgt_qp.as_ptr());
            ibv_destroy_srq(self.srq.as_ptr());
        }
        self.ctx.del_dep();
    }
}

fn create_xrc_srq(ctx: &Arc<Context>, cq: &Cq) -> io::Result<(NonNull<ibv_srq>, SrqNum)> {
    // SAFETY: POD attribute block for FFI.
    let mut attr = unsafe { mem::zeroed::<ibv_srq_init_attr_ex>() };
    attr.attr.max_wr = Consts::MAX_QUEUE_DEPTH as u32;
    attr.attr.max_sge = Consts::MAX_SGE as u32;
    // With a zero limit, no SRQ-limit-reached events are generated.
    attr.attr.srq_limit = 0;
    attr.comp_mask =
        SRQ_INIT_ATTR_TYPE | SRQ_INIT_ATTR_PD | SRQ_INIT_ATTR_XRCD | SRQ_INIT_ATTR_CQ;
    attr.srq_type = ibv_srq_type::IBV_SRQT_XRC;
    attr.pd = ctx.pd();
    attr.xrcd = ctx.xrcd();
    attr.cq = cq.as_raw();

    // SAFETY: FFI.
    let srq = unsafe { ibv_create_srq_ex(ctx.as_raw(), &mut attr) };
    let srq = NonNull::new(srq).ok_or_else(io::Error::last_os_error)?;

    let mut num = 0;
    // SAFETY: FFI.
    let ret = unsafe { ibv_get_srq_num(srq.as_ptr(), &mut num) };
    if ret != 0 {
        // SAFETY: created above, not yet owned.
        unsafe { ibv_destroy_srq(srq.as_ptr()) };
        return Err(io::Error::from_raw_os_error(ret));
    }
    Ok((srq, num))
}

fn create_ini_qp(ctx: &Arc<Context>, send_cq: &Cq, recv_cq: &Cq) -> io::Result<NonNull<ibv_qp>> {
    // SAFETY: POD attribute block for FFI.
    let mut attr = unsafe { mem::zeroed::<ibv_qp_init_attr_ex>() };
    attr.qp_type = ibv_qp_type::IBV_QPT_XRC_SEND;
    attr.sq_sig_all = 0;
    attr.send_cq = send_cq.as_raw();
    attr.recv_cq = recv_cq.as_raw();
    attr.cap = qp_caps();
    attr.comp_mask = QP_INIT_ATTR_PD;
    attr.pd = ctx.pd();

    // SAFETY: FFI.
    let qp = unsafe { ibv_create_qp_ex(ctx.as_raw(), &mut attr) };
    NonNull::new(qp).ok_or_else(io::Error::last_os_error)
}

fn create_tgt_qp(
    ctx: &Arc<Context>,
    send_cq: &Cq,
    recv_cq: &Cq,
    srq: NonNull<ibv_srq>,
) -> io::Result<NonNull<ibv_qp>> {
    // SAFETY: POD attribute block for FFI.
    let mut attr = unsafe { mem::zeroed::<ibv_qp_init_attr_ex>() };
    attr.qp_type = ibv_qp_type::IBV_QPT_XRC_RECV;
    attr.sq_sig_all = 0;
    attr.send_cq = send_cq.as_raw();
    attr.recv_cq = recv_cq.as_raw();
    attr.srq = srq.as_ptr();
    attr.cap = qp_caps();
    attr.comp_mask = QP_INIT_ATTR_XRCD;
    attr.xrcd = ctx.xrcd();

    // SAFETY: FFI.
    let qp = unsafe { ibv_create_qp_ex(ctx.as_raw(), &mut attr) };
    NonNull::new(qp).ok_or_else(io::Error::last_os_error)
}
