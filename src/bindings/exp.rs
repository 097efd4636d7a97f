//! Vendor extended-verbs surface.
//!
//! Masked atomics and extended atomic argument sizing are not part of the
//! upstream verbs ABI; they are provided by the vendor's extended-verbs
//! distribution through a second function table placed in memory just before
//! the provider's extended context. The declarations below mirror that ABI.
//! Every wrapper degrades to `ENOSYS` when the running provider does not
//! carry the extension, so the crate stays usable (minus masked atomics) on
//! stock providers; the device probe reports the deficiency at open time.
//!
//! Layout caveat: `verbs_context_exp` grows downwards in the vendor headers
//! (new entries are prepended). The reserve block below absorbs entries this
//! crate does not call; it must be kept in sync with the provider generation
//! being targeted.

use std::mem;
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;

use libc::ENOSYS;
use memoffset::offset_of;

use super::{
    ibv_ah, ibv_context, ibv_cq, ibv_pd, ibv_qp, ibv_qp_cap, ibv_sge, ibv_srq, ibv_xrcd,
    verbs_get_ctx,
};

// ---------------------------------------------------------------------------
// Work request opcodes and flags.
// ---------------------------------------------------------------------------

pub mod ibv_exp_wr_opcode {
    pub type Type = u32;

    pub const IBV_EXP_WR_RDMA_WRITE: Type = 0;
    pub const IBV_EXP_WR_RDMA_WRITE_WITH_IMM: Type = 1;
    pub const IBV_EXP_WR_SEND: Type = 2;
    pub const IBV_EXP_WR_SEND_WITH_IMM: Type = 3;
    pub const IBV_EXP_WR_RDMA_READ: Type = 4;
    pub const IBV_EXP_WR_ATOMIC_CMP_AND_SWP: Type = 5;
    pub const IBV_EXP_WR_ATOMIC_FETCH_AND_ADD: Type = 6;

    pub const IBV_EXP_WR_SEND_ENABLE: Type = 0x20;
    pub const IBV_EXP_WR_RECV_ENABLE: Type = 0x21;
    pub const IBV_EXP_WR_CQE_WAIT: Type = 0x22;
    pub const IBV_EXP_WR_EXT_MASKED_ATOMIC_CMP_AND_SWP: Type = 0x23;
    pub const IBV_EXP_WR_EXT_MASKED_ATOMIC_FETCH_AND_ADD: Type = 0x24;
}

pub const IBV_EXP_SEND_FENCE: u64 = 1 << 0;
pub const IBV_EXP_SEND_SIGNALED: u64 = 1 << 1;
pub const IBV_EXP_SEND_SOLICITED: u64 = 1 << 2;
pub const IBV_EXP_SEND_INLINE: u64 = 1 << 3;
pub const IBV_EXP_SEND_WAIT_EN_LAST: u64 = 1 << 27;
pub const IBV_EXP_SEND_EXT_ATOMIC_INLINE: u64 = 1 << 28;

// ---------------------------------------------------------------------------
// Extended send work request.
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Clone, Copy)]
pub union imm_data_invalidated_rkey_union_t {
    pub imm_data: u32,
    pub invalidated_rkey: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct exp_rdma_t {
    pub remote_addr: u64,
    pub rkey: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct exp_atomic_t {
    pub remote_addr: u64,
    pub compare_add: u64,
    pub swap: u64,
    pub rkey: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct exp_ud_t {
    pub ah: *mut ibv_ah,
    pub remote_qpn: u32,
    pub remote_qkey: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union exp_wr_t {
    pub rdma: exp_rdma_t,
    pub atomic: exp_atomic_t,
    pub ud: exp_ud_t,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct exp_xrc_t {
    pub remote_srq_num: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union qp_type_xrc_remote_srq_num_union_t {
    pub xrc: exp_xrc_t,
    pub xrc_remote_srq_num: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct cqe_wait_t {
    pub cq: *mut ibv_cq,
    pub cq_count: i32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct wqe_enable_t {
    pub qp: *mut ibv_qp,
    pub wqe_count: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union exp_task_t {
    pub rdma: exp_rdma_t,
    pub atomic: exp_atomic_t,
    pub cqe_wait: cqe_wait_t,
    pub wqe_enable: wqe_enable_t,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct exp_dc_t {
    pub ah: *mut ibv_ah,
    pub dct_access_key: u64,
    pub dct_number: u32,
}

/// Masked compare-and-swap inline operands.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ibv_exp_cmp_swap {
    pub compare_mask: u64,
    pub compare_val: u64,
    pub swap_mask: u64,
    pub swap_val: u64,
}

/// Masked fetch-and-add inline operands. Set bits of `field_boundary` mark
/// the left boundaries of independent add fields; carries never cross a
/// boundary.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ibv_exp_fetch_add {
    pub add_val: u64,
    pub field_boundary: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union inline_data_op_t {
    pub cmp_swap: ibv_exp_cmp_swap,
    pub fetch_add: ibv_exp_fetch_add,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct inline_data_t {
    pub op: inline_data_op_t,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union wr_data_t {
    pub inline_data: inline_data_t,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct masked_atomics_t {
    pub log_arg_sz: u32,
    pub remote_addr: u64,
    pub rkey: u32,
    pub wr_data: wr_data_t,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union ext_op_t {
    pub masked_atomics: masked_atomics_t,
    /// Sizing arm standing in for the UMR member of the vendor union.
    pub _umr_sizing: [u64; 8],
}

#[repr(C)]
pub struct ibv_exp_send_wr {
    pub wr_id: u64,
    pub next: *mut Self,
    pub sg_list: *mut ibv_sge,
    pub num_sge: c_int,
    pub exp_opcode: ibv_exp_wr_opcode::Type,
    pub reserved: c_int,
    pub ex: imm_data_invalidated_rkey_union_t,
    pub wr: exp_wr_t,
    pub qp_type: qp_type_xrc_remote_srq_num_union_t,
    pub task: exp_task_t,
    /// Sizing arm standing in for the calc member of the vendor structure.
    pub op: [u32; 3],
    pub dc: exp_dc_t,
    /// Sizing arm standing in for the bind-mw/TSO member of the vendor
    /// structure.
    pub bind_mw_tso: [u64; 6],
    pub exp_send_flags: u64,
    pub comp_mask: u32,
    pub ext_op: ext_op_t,
}

impl Default for ibv_exp_send_wr {
    fn default() -> Self {
        // SAFETY: POD type; all-zero is the vendor-documented initial state.
        unsafe { mem::zeroed() }
    }
}

// ---------------------------------------------------------------------------
// Extended queue pair creation.
// ---------------------------------------------------------------------------

pub const IBV_EXP_QP_INIT_ATTR_PD: u32 = 1 << 0;
pub const IBV_EXP_QP_INIT_ATTR_XRCD: u32 = 1 << 1;
pub const IBV_EXP_QP_INIT_ATTR_CREATE_FLAGS: u32 = 1 << 2;
pub const IBV_EXP_QP_INIT_ATTR_INL_RECV: u32 = 1 << 3;
pub const IBV_EXP_QP_INIT_ATTR_QPG: u32 = 1 << 4;
pub const IBV_EXP_QP_INIT_ATTR_ATOMICS_ARG: u32 = 1 << 5;

#[repr(C)]
pub struct ibv_exp_qp_init_attr {
    pub qp_context: *mut c_void,
    pub send_cq: *mut ibv_cq,
    pub recv_cq: *mut ibv_cq,
    pub srq: *mut ibv_srq,
    pub cap: ibv_qp_cap,
    pub qp_type: u32,
    pub sq_sig_all: c_int,
    pub comp_mask: u32,
    pub pd: *mut ibv_pd,
    pub xrcd: *mut ibv_xrcd,
    pub exp_create_flags: u32,
    pub max_inl_recv: u32,
    /// Sizing arm standing in for the QP-group member of the vendor
    /// structure.
    pub qpg: [u64; 2],
    pub max_atomic_arg: u32,
    pub max_inl_send_klms: u32,
    pub rx_hash_conf: *mut c_void,
    pub port_num: u32,
    pub peer_direct_attrs: *mut c_void,
}

impl Default for ibv_exp_qp_init_attr {
    fn default() -> Self {
        // SAFETY: POD type.
        unsafe { mem::zeroed() }
    }
}

// ---------------------------------------------------------------------------
// Extended device attributes.
// ---------------------------------------------------------------------------

pub const IBV_EXP_DEVICE_ATTR_EXP_CAP_FLAGS: u32 = 1 << 3;
pub const IBV_EXP_DEVICE_ATTR_EXT_ATOMIC_ARGS: u32 = 1 << 8;
pub const IBV_EXP_DEVICE_ATTR_MASKED_ATOMICS: u32 = 1 << 17;

pub const IBV_EXP_DEVICE_EXT_ATOMICS: u64 = 1 << 34;
pub const IBV_EXP_DEVICE_EXT_MASKED_ATOMICS: u64 = 1 << 36;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ibv_exp_ext_atomics_params {
    pub log_atomic_arg_sizes: u64,
    pub max_fa_bit_boundary: u32,
    pub log_max_atomic_inline: u32,
}

#[repr(C)]
pub struct ibv_exp_device_attr {
    pub fw_ver: [c_char; 64],
    pub node_guid: u64,
    pub sys_image_guid: u64,
    pub max_mr_size: u64,
    pub page_size_cap: u64,
    pub vendor_id: c_int,
    pub vendor_part_id: c_int,
    pub hw_ver: c_int,
    pub max_qp: c_int,
    pub max_qp_wr: c_int,
    pub reserved_device_cap_flags: c_int,
    pub max_sge: c_int,
    pub max_sge_rd: c_int,
    pub max_cq: c_int,
    pub max_cqe: c_int,
    pub max_mr: c_int,
    pub max_pd: c_int,
    pub max_qp_rd_atom: c_int,
    pub max_ee_rd_atom: c_int,
    pub max_res_rd_atom: c_int,
    pub max_qp_init_rd_atom: c_int,
    pub max_ee_init_rd_atom: c_int,
    pub exp_atomic_cap: u32,
    pub max_ee: c_int,
    pub max_rdd: c_int,
    pub max_mw: c_int,
    pub max_raw_ipv6_qp: c_int,
    pub max_raw_ethy_qp: c_int,
    pub max_mcast_grp: c_int,
    pub max_mcast_qp_attach: c_int,
    pub max_total_mcast_qp_attach: c_int,
    pub max_ah: c_int,
    pub max_fmr: c_int,
    pub max_map_per_fmr: c_int,
    pub max_srq: c_int,
    pub max_srq_wr: c_int,
    pub max_srq_sge: c_int,
    pub max_pkeys: u16,
    pub local_ca_ack_delay: u8,
    pub phys_port_cnt: u8,
    pub comp_mask: u32,
    pub calc_cap: [u64; 4],
    pub timestamp_mask: u64,
    pub hca_core_clock: u64,
    pub exp_device_cap_flags: u64,
    pub max_dc_req_rd_atom: c_int,
    pub max_dc_res_rd_atom: c_int,
    pub inline_recv_sz: c_int,
    pub max_rss_tbl_sz: u32,
    pub ext_atom: ibv_exp_ext_atomics_params,
    /// Remainder of the vendor structure (UMR, ODP, DCT, WQ, MP-RQ, TSO,
    /// pacing and EC capability blocks). Oversized on purpose so the
    /// provider may write past the fields this crate reads.
    pub reserved: [u64; 64],
}

impl Default for ibv_exp_device_attr {
    fn default() -> Self {
        // SAFETY: POD type.
        unsafe { mem::zeroed() }
    }
}

// ---------------------------------------------------------------------------
// Extended provider function table.
// ---------------------------------------------------------------------------

/// Bit in the legacy extended context's `has_comp_mask` advertising the
/// vendor extension table.
const VERBS_CONTEXT_EXP: u64 = 1 << 62;

/// Tail of the legacy extended context: the two words the vendor places
/// immediately before the exposed `ibv_context`.
#[repr(C)]
struct verbs_context_exp_tail {
    has_comp_mask: u64,
    sz: usize,
}

type OpaqueOp = Option<unsafe extern "C" fn()>;

/// The vendor extension table. It lives immediately before the provider's
/// actual extended context and grows downwards; newer entries are prepended
/// and absorbed by the reserve block here.
#[repr(C)]
pub struct verbs_context_exp {
    _newer_ops: [OpaqueOp; 28],
    pub drv_exp_post_send: Option<
        unsafe extern "C" fn(
            qp: *mut ibv_qp,
            wr: *mut ibv_exp_send_wr,
            bad_wr: *mut *mut ibv_exp_send_wr,
        ) -> c_int,
    >,
    pub exp_create_cq: OpaqueOp,
    pub drv_exp_modify_qp: OpaqueOp,
    pub lib_exp_modify_qp: OpaqueOp,
    pub drv_exp_create_qp: OpaqueOp,
    pub lib_exp_create_qp: Option<
        unsafe extern "C" fn(
            context: *mut ibv_context,
            qp_init_attr: *mut ibv_exp_qp_init_attr,
        ) -> *mut ibv_qp,
    >,
    pub drv_exp_query_device: OpaqueOp,
    pub lib_exp_query_device: Option<
        unsafe extern "C" fn(context: *mut ibv_context, attr: *mut ibv_exp_device_attr) -> c_int,
    >,
    pub sz: usize,
}

/// Locate the vendor extension table for a context, or null when the running
/// provider does not advertise one.
#[inline]
unsafe fn verbs_get_exp_ctx(ctx: *const ibv_context) -> *mut verbs_context_exp {
    if verbs_get_ctx(ctx).is_null() {
        return ptr::null_mut();
    }
    let tail = (ctx as *const u8).sub(mem::size_of::<verbs_context_exp_tail>())
        as *const verbs_context_exp_tail;
    if (*tail).has_comp_mask & VERBS_CONTEXT_EXP == 0 {
        return ptr::null_mut();
    }
    let actual_ex_ctx = (ctx as usize) - ((*tail).sz - mem::size_of::<ibv_context>());
    (actual_ex_ctx - mem::size_of::<verbs_context_exp>()) as *mut verbs_context_exp
}

macro_rules! verbs_get_exp_ctx_op {
    ($ctx:expr, $op:ident) => {{
        let vctx = verbs_get_exp_ctx($ctx);
        if vctx.is_null()
            || (*vctx).sz < mem::size_of::<verbs_context_exp>() - offset_of!(verbs_context_exp, $op)
            || (*vctx).$op.is_none()
        {
            ptr::null_mut()
        } else {
            vctx
        }
    }};
}

/// Post a chain of extended work requests to a send queue.
/// Returns `ENOSYS` when the provider carries no extension table.
#[inline]
pub unsafe fn ibv_exp_post_send(
    qp: *mut ibv_qp,
    wr: *mut ibv_exp_send_wr,
    bad_wr: *mut *mut ibv_exp_send_wr,
) -> c_int {
    let vctx = verbs_get_exp_ctx_op!((*qp).context, drv_exp_post_send);
    if vctx.is_null() {
        ENOSYS
    } else {
        (*vctx).drv_exp_post_send.unwrap()(qp, wr, bad_wr)
    }
}

/// Create a queue pair with vendor-extended initialization attributes.
/// Falls back to the plain creation path when only the PD attribute is set.
#[inline]
pub unsafe fn ibv_exp_create_qp(
    context: *mut ibv_context,
    qp_init_attr: *mut ibv_exp_qp_init_attr,
) -> *mut ibv_qp {
    if (*qp_init_attr).comp_mask == IBV_EXP_QP_INIT_ATTR_PD {
        return super::ibv_create_qp(
            (*qp_init_attr).pd,
            qp_init_attr as *mut super::ibv_qp_init_attr,
        );
    }

    let vctx = verbs_get_exp_ctx_op!(context, lib_exp_create_qp);
    if vctx.is_null() {
        *libc::__errno_location() = ENOSYS;
        ptr::null_mut()
    } else {
        (*vctx).lib_exp_create_qp.unwrap()(context, qp_init_attr)
    }
}

/// Query vendor-extended device attributes.
#[inline]
pub unsafe fn ibv_exp_query_device(
    context: *mut ibv_context,
    attr: *mut ibv_exp_device_attr,
) -> c_int {
    let vctx = verbs_get_exp_ctx_op!(context, lib_exp_query_device);
    if vctx.is_null() {
        ENOSYS
    } else {
        (*vctx).lib_exp_query_device.unwrap()(context, attr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_atomic_operands_have_wire_sizes() {
        assert_eq!(mem::size_of::<ibv_exp_cmp_swap>(), 32);
        assert_eq!(mem::size_of::<ibv_exp_fetch_add>(), 16);
        assert_eq!(mem::size_of::<inline_data_op_t>(), 32);
    }

    #[test]
    fn ext_op_union_is_umr_sized() {
        assert_eq!(mem::size_of::<ext_op_t>(), 64);
    }
}
