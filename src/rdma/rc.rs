//! Reliable connections: one RC queue pair plus its completion queues.

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
use crate::rdma::types::{Lid, Qpn, RKey, WrId};
use crate::rdma::wr;
use crate::rdma::Consts;
use crate::utils::die;
use crate::utils::interop::from_c_ret;

/// One read in a batch post.
pub struct ReadSpec {
    /// Local destination; must fall in a registered region.
    pub dst: *mut u8,
    /// Remote source address.
    pub src: u64,
    /// Bytes to read.
    pub len: usize,
}

/// One write in a batch post.
pub struct WriteSpec {
    /// Remote destination address.
    pub dst: u64,
    /// Local source; must fall in a registered region.
    pub src: *const u8,
    /// Bytes to write.
    pub len: usize,
}

/// One masked fetch-and-add in a batch post.
pub struct MaskedFaaSpec {
    /// Remote 8-byte word, 8-byte aligned.
    pub dst: u64,
    /// Local destination of the fetched previous value.
    pub fetch: *mut u64,
    /// Value to add.
    pub add: u64,
    /// Field boundary bitmap.
    pub boundary: u64,
}

/// An RDMA reliable connection.
///
/// The fast path is single-writer: exactly one thread may post and poll on
/// one connection at a time; sharing one connection between threads requires
/// external mutual exclusion. Different connections on the same context run
/// in parallel without contention.
pub struct RcConn {
    ctx: Arc<Context>,
    remote: Arc<OnceLock<RemoteInfo>>,
    id: usize,
    who: String,

    qp: NonNull<ibv_qp>,
    send_cq: Cq,
    recv_cq: Cq,
}

// SAFETY: the verbs QP handle may be driven from any single thread at a
// time; the single-writer discipline is the caller's contract.
unsafe impl Send for RcConn {}
unsafe impl Sync for RcConn {}

/// Maximum outstanding RDMA reads/atomics per QP, both directions.
pub(crate) const MAX_RD_ATOMIC: u8 = 16;
/// Minimum receiver-not-ready timer code (~640 us).
pub(crate) const MIN_RNR_TIMER: u8 = 12;
/// Local ACK timeout code (~67 ms).
pub(crate) const TIMEOUT: u8 = 14;
/// Transport and RNR retry budgets.
pub(crate) const RETRY_CNT: u8 = 7;

impl RcConn {
    /// Create a connection with its own send and recv CQs.
    pub(crate) fn new(
        ctx: Arc<Context>,
        remote: Arc<OnceLock<RemoteInfo>>,
        local_rank: usize,
        peer_rank: usize,
        id: usize,
    ) -> io::Result<Self> {
        let send_cq = Cq::new(&ctx, Consts::MAX_QUEUE_DEPTH)?;
        let recv_cq = Cq::new(&ctx, Consts::MAX_QUEUE_DEPTH)?;
        Self::with_cqs(ctx, remote, local_rank, peer_rank, id, send_cq, recv_cq)
    }

    /// Create a connection on externally supplied completion queues, letting
    /// several connections of one peer aggregate completions.
    pub(crate) fn with_cqs(
        ctx: Arc<Context>,
        remote: Arc<OnceLock<RemoteInfo>>,
        local_rank: usize,
        peer_rank: usize,
        id: usize,
        send_cq: Cq,
        recv_cq: Cq,
    ) -> io::Result<Self> {
        let qp = create_rc_qp(&ctx, &send_cq, &recv_cq)?;
        ctx.add_dep();
        Ok(Self {
            who: format!("node {} peer {} rc {}", local_rank, peer_rank, id),
            ctx,
            remote,
            id,
            qp,
            send_cq,
            recv_cq,
        })
    }

    /// Stable slot of this connection within its peer.
    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// The local queue pair number.
    #[inline]
    pub fn qp_num(&self) -> Qpn {
        // SAFETY: the QP is alive as long as `self`.
        unsafe { (*self.qp.as_ptr()).qp_num }
    }

    /// The send completion queue.
    #[inline]
    pub fn send_cq(&self) -> &Cq {
        &self.send_cq
    }

    /// The recv completion queue.
    #[inline]
    pub fn recv_cq(&self) -> &Cq {
        &self.recv_cq
    }

    pub(crate) fn fill_exchange(&self, xchg: &mut OobExchange) {
        xchg.rc_qp_num[self.id] = self.qp_num();
    }

    /// Drive the queue pair to Ready-to-Send against the remote endpoint.
    /// Any transition failure is fatal.
    pub(crate) fn establish(&self, gid: Gid, lid: Lid, qpn: Qpn) {
        self.modify_to_init();
        self.modify_to_rtr(gid, lid, qpn);
        self.modify_to_rts();
        log::debug!("{}: established, dest qpn {}", self.who, qpn);
    }

    fn modify_to_init(&self) {
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
        if unsafe { ibv_modify_qp(self.qp.as_ptr(), &mut attr, mask.0 as i32) } != 0 {
            die!("{}: failed to modify QP to INIT", self.who);
        }
    }

    fn modify_to_rtr(&self, gid: Gid, lid: Lid, qpn: Qpn) {
        // SAFETY: POD attribute block for FFI.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = ibv_mtu::IBV_MTU_4096;
        attr.dest_qp_num = qpn;
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
        if unsafe { ibv_modify_qp(self.qp.as_ptr(), &mut attr, mask.0 as i32) } != 0 {
            die!("{}: failed to modify QP to RTR", self.who);
        }
    }

    fn modify_to_rts(&self) {
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
        if unsafe { ibv_modify_qp(self.qp.as_ptr(), &mut attr, mask.0 as i32) } != 0 {
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

    #[inline]
    fn post(&self, w: &mut ibv_send_wr) -> io::Result<()> {
        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; the work request and its SG list outlive the call.
        from_c_ret(unsafe { ibv_post_send(self.qp.as_ptr(), w, &mut bad_wr) })
    }

    #[inline]
    fn post_exp(&self, w: &mut ibv_exp_send_wr) -> io::Result<()> {
        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI; the work request and its SG list outlive the call.
        from_c_ret(unsafe { ibv_exp_post_send(self.qp.as_ptr(), w, &mut bad_wr) })
    }

    /// Post a one-sided READ: async memcpy from `src` (remote) to `dst`
    /// (local).
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
        // SAFETY: writing Copy fields of the zeroed work request union.
        unsafe {
            w.wr.rdma.remote_addr = src;
            w.wr.rdma.rkey = self.match_remote_rkey(src, len);
        }
        self.post(&mut w)
    }

    /// Post a one-sided WRITE: async memcpy from `src` (local) to `dst`
    /// (remote).
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
        // SAFETY: writing Copy fields of the zeroed work request union.
        unsafe {
            w.wr.rdma.remote_addr = dst;
            w.wr.rdma.rkey = self.match_remote_rkey(dst, len);
        }
        self.post(&mut w)
    }

    /// Post a two-sided SEND towards the peer's receive queue.
    pub fn post_send(
        &self,
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
        w.opcode = ibv_wr_opcode::IBV_WR_SEND;
        if signaled {
            w.send_flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
        }
        self.post(&mut w)
    }

    /// Post a receive buffer for a peer SEND.
    pub fn post_recv(&self, dst: *mut u8, len: usize, wr_id: WrId) -> io::Result<()> {
        let mut sge = wr::sge(dst as u64, len as u32, self.ctx.match_lkey(dst as u64, len));

        // SAFETY: POD work request for FFI.
        let mut w = unsafe { mem::zeroed::<ibv_recv_wr>() };
        w.wr_id = wr_id;
        w.sg_list = &mut sge;
        w.num_sge = 1;

        let mut bad_wr = ptr::null_mut();
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_post_recv(self.qp.as_ptr(), &mut w, &mut bad_wr) })
    }

    /// Post a 64-bit compare-and-swap against `dst`.
    ///
    /// `*compare` is read as the expected value; the NIC then overwrites it
    /// with the fetched previous remote value.
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
        // SAFETY: writing Copy fields of the zeroed work request union; the
        // caller hands an initialized 8-byte expected value.
        unsafe {
            w.wr.atomic.remote_addr = dst;
            w.wr.atomic.rkey = self.match_remote_rkey(dst, len);
            w.wr.atomic.compare_add = *compare;
            w.wr.atomic.swap = swap;
        }
        self.post(&mut w)
    }

    /// Post a 64-bit fetch-and-add against `dst`. The fetched previous value
    /// lands in `*fetch`.
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
        // SAFETY: writing Copy fields of the zeroed work request union.
        unsafe {
            w.wr.atomic.remote_addr = dst;
            w.wr.atomic.rkey = self.match_remote_rkey(dst, len);
            w.wr.atomic.compare_add = add;
        }
        self.post(&mut w)
    }

    /// Post a masked compare-and-swap: compare equality is restricted to the
    /// bits of `compare_mask`, and the swap writes only the bits of
    /// `swap_mask`.
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
        self.post_exp(&mut w)
    }

    /// Post a fetch-and-add restricted to the bit field `[lo_bit, hi_bit]`:
    /// the add value is applied inside the field and carries stop at
    /// `hi_bit`.
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
        self.post_exp(&mut w)
    }

    /// Post a WAIT verb: the send queue stalls until `cqe_count` entries
    /// have landed in `cq`.
    pub fn post_wait(&self, cq: &Cq, cqe_count: i32, signaled: bool) -> io::Result<()> {
        let mut w = wr::cqe_wait_wr(cq.as_raw(), cqe_count, signaled);
        self.post_exp(&mut w)
    }

    /// Post up to [`Consts::MAX_POST_WR`] linked READs. Only the last one is
    /// signaled; work request IDs count up from `wr_id_start`.
    pub fn post_batch_read(&self, ops: &[ReadSpec], wr_id_start: WrId) -> io::Result<()> {
        let count = ops.len();
        if count == 0 || count > Consts::MAX_POST_WR {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        // SAFETY: POD arrays for FFI.
        let mut sges = unsafe { mem::zeroed::<[ibv_sge; Consts::MAX_POST_WR]>() };
        let mut wrs = unsafe { mem::zeroed::<[ibv_send_wr; Consts::MAX_POST_WR]>() };
        for (i, op) in ops.iter().enumerate() {
            sges[i] = wr::sge(
                op.dst as u64,
                op.len as u32,
                self.ctx.match_lkey(op.dst as u64, op.len),
            );
            wrs[i].wr_id = wr_id_start + i as WrId;
            wrs[i].sg_list = &mut sges[i];
            wrs[i].num_sge = 1;
            wrs[i].opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
            // SAFETY: writing Copy fields of a zeroed work request union.
            unsafe {
                wrs[i].wr.rdma.remote_addr = op.src;
                wrs[i].wr.rdma.rkey = self.match_remote_rkey(op.src, op.len);
            }
        }
        link_and_signal_last(&mut wrs[..count]);
        self.post(&mut wrs[0])
    }

    /// Post up to [`Consts::MAX_POST_WR`] linked WRITEs. Only the last one
    /// is signaled; work request IDs count up from `wr_id_start`.
    pub fn post_batch_write(&self, ops: &[WriteSpec], wr_id_start: WrId) -> io::Result<()> {
        let count = ops.len();
        if count == 0 || count > Consts::MAX_POST_WR {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        // SAFETY: POD arrays for FFI.
        let mut sges = unsafe { mem::zeroed::<[ibv_sge; Consts::MAX_POST_WR]>() };
        let mut wrs = unsafe { mem::zeroed::<[ibv_send_wr; Consts::MAX_POST_WR]>() };
        for (i, op) in ops.iter().enumerate() {
            sges[i] = wr::sge(
                op.src as u64,
                op.len as u32,
                self.ctx.match_lkey(op.src as u64, op.len),
            );
            wrs[i].wr_id = wr_id_start + i as WrId;
            wrs[i].sg_list = &mut sges[i];
            wrs[i].num_sge = 1;
            wrs[i].opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
            // SAFETY: writing Copy fields of a zeroed work request union.
            unsafe {
                wrs[i].wr.rdma.remote_addr = op.dst;
                wrs[i].wr.rdma.rkey = self.match_remote_rkey(op.dst, op.len);
            }
        }
        link_and_signal_last(&mut wrs[..count]);
        self.post(&mut wrs[0])
    }

    /// Post up to [`Consts::MAX_POST_WR`] linked masked fetch-and-adds.
    /// Only the last one is signaled; work request IDs count up from
    /// `wr_id_start`.
    pub fn post_batch_masked_atomic_faa(
        &self,
        ops: &[MaskedFaaSpec],
        wr_id_start: WrId,
    ) -> io::Result<()> {
        let count = ops.len();
        if count == 0 || count > Consts::MAX_POST_WR {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }

        let len = mem::size_of::<u64>();
        // SAFETY: POD array for FFI.
        let mut sges = unsafe { mem::zeroed::<[ibv_sge; Consts::MAX_POST_WR]>() };
        let mut wrs: [ibv_exp_send_wr; Consts::MAX_POST_WR] =
            std::array::from_fn(|_| ibv_exp_send_wr::default());
        for (i, op) in ops.iter().enumerate() {
            check_atomic_alignment(op.fetch as u64, &self.who);
            check_atomic_alignment(op.dst, &self.who);
            sges[i] = wr::sge(
                op.fetch as u64,
                len as u32,
                self.ctx.match_lkey(op.fetch as u64, len),
            );
            wrs[i] = wr::masked_faa_wr(
                wr_id_start + i as WrId,
                op.dst,
                self.match_remote_rkey(op.dst, len),
                op.add,
                op.boundary,
                i + 1 == count,
            );
            wrs[i].sg_list = &mut sges[i];
        }
        for i in 0..count - 1 {
            wrs[i].next = &mut wrs[i + 1];
        }
        self.post_exp(&mut wrs[0])
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

    /// Log the queue pair state. Returns 0 iff Ready-to-Send.
    pub fn verbose(&self) -> i32 {
        let state = qp_state(self.qp.as_ptr(), &self.who);
        log::info!("{}: {}", self.who, qp_state_str(state));
        if state == ibv_qp_state::IBV_QPS_RTS {
            0
        } else {
            -1
        }
    }
}

impl Drop for RcConn {
    fn drop(&mut self) {
        // SAFETY: created exactly once, destroyed exactly once; the CQs are
        // dropped afterwards by field order.
        unsafe { ibv_destroy_qp(self.qp.as_ptr()) };
        self.ctx.del_dep();
    }
}

#[inline]
pub(crate) fn check_atomic_alignment(addr: u64, who: &str) {
    if addr & 0x7 != 0 {
        die!("{}: atomic on non-aligned address {:#x}", who, addr);
    }
}

/// Link a chain of work requests and signal only the last.
pub(crate) fn link_and_signal_last(wrs: &mut [ibv_send_wr]) {
    let count = wrs.len();
    for i in 0..count - 1 {
        wrs[i].next = &mut wrs[i + 1];
    }
    wrs[count - 1].send_flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
}

/// Default queue capacities for every connection.
pub(crate) fn qp_caps() -> ibv_qp_cap {
    ibv_qp_cap {
        max_send_wr: Consts::MAX_QUEUE_DEPTH as u32,
        max_recv_wr: Consts::MAX_QUEUE_DEPTH as u32,
        max_send_sge: Consts::MAX_SGE as u32,
        max_recv_sge: Consts::MAX_SGE as u32,
        max_inline_data: 0,
    }
}

/// Query the current state of a queue pair.
pub(crate) fn qp_state(qp: *mut ibv_qp, who: &str) -> u32 {
    // SAFETY: POD attribute blocks for FFI.
    let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
    let mut init_attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
    // SAFETY: FFI.
    let ret = unsafe {
        ibv_query_qp(
            qp,
            &mut attr,
            ibv_qp_attr_mask::IBV_QP_STATE.0 as i32,
            &mut init_attr,
        )
    };
    if ret != 0 {
        die!("{}: failed to perform ibv_query_qp", who);
    }
    attr.qp_state
}

pub(crate) fn qp_state_str(state: u32) -> &'static str {
    match state {
        ibv_qp_state::IBV_QPS_RESET => "reset",
        ibv_qp_state::IBV_QPS_INIT => "init",
        ibv_qp_state::IBV_QPS_RTR => "rtr",
        ibv_qp_state::IBV_QPS_RTS => "rts ok",
        ibv_qp_state::IBV_QPS_SQD => "sqd",
        ibv_qp_state::IBV_QPS_SQE => "sqe",
        ibv_qp_state::IBV_QPS_ERR => "error",
        _ => "?state",
    }
}

/// Create an RC queue pair, preferring the vendor path that sizes the
/// extended atomic argument; stock providers get the standard path.
fn create_rc_qp(ctx: &Arc<Context>, send_cq: &Cq, recv_cq: &Cq) -> io::Result<NonNull<ibv_qp>> {
    let mut attr = ibv_exp_qp_init_attr::default();
    attr.qp_type = ibv_qp_type::IBV_QPT_RC;
    attr.sq_sig_all = 0;
    attr.send_cq = send_cq.as_raw();
    attr.recv_cq = recv_cq.as_raw();
    attr.pd = ctx.pd();
    attr.comp_mask = IBV_EXP_QP_INIT_ATTR_PD | IBV_EXP_QP_INIT_ATTR_ATOMICS_ARG;
    attr.max_atomic_arg = mem::size_of::<u64>() as u32;
    attr.cap = qp_caps();

    if ctx.caps().ext_atomics {
        // SAFETY: FFI.
        let qp = unsafe { ibv_exp_create_qp(ctx.as_raw(), &mut attr) };
        if let Some(qp) = NonNull::new(qp) {
            return Ok(qp);
        }
        log::warn!("extended QP creation failed, falling back to the standard path");
    }

    // SAFETY: POD attribute block for FFI.
    let mut attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
    attr.qp_type = ibv_qp_type::IBV_QPT_RC;
    attr.sq_sig_all = 0;
    attr.send_cq = send_cq.as_raw();
    attr.recv_cq = recv_cq.as_raw();
    attr.cap = qp_caps();

    // SAFETY: FFI.
    let qp = unsafe { ibv_create_qp(ctx.pd(), &mut attr) };
    NonNull::new(qp).ok_or_else(io::Error::last_os_error)
}
