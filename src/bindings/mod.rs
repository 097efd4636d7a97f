//! Supplemental verbs bindings.
//!
//! Base types and the exported verb entry points come from [`rdma_sys`].
//! This module adds what the crate needs beyond that:
//!
//! - the entry points `libibverbs` ships only as inline functions, resolved
//!   here through the provider function tables (`ibv_poll_cq`,
//!   `ibv_post_send`, `ibv_post_recv`, `ibv_post_srq_recv`, `ibv_open_xrcd`,
//!   `ibv_close_xrcd`, `ibv_get_srq_num`, `ibv_create_qp_ex`,
//!   `ibv_create_srq_ex`);
//! - the vendor extended-verbs surface for masked atomics and extended
//!   atomic argument sizing (see the `exp` items re-exported below).
//!
//! Locally defined items shadow any same-named re-exports from `rdma_sys`,
//! so the rest of the crate can `use crate::bindings::*` uniformly.

#![allow(non_snake_case)]
#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]
#![allow(clippy::missing_safety_doc)]

mod exp;

pub use exp::*;
pub use rdma_sys::*;

use std::os::raw::c_int;
use std::ptr;

use libc::{c_void, ENOSYS};
use memoffset::offset_of;

/// `((uint8_t *)NULL) - 1`: the marker `libibverbs` stores in
/// `ibv_context::abi_compat` when the context carries an extended ABI tail.
pub(crate) const VERBS_ABI_IS_EXTENDED: *mut c_void = usize::MAX as *mut c_void;

// `comp_mask` bits of the extended initialization attribute blocks,
// mirroring `verbs.h`.
pub const QP_INIT_ATTR_PD: u32 = 1 << 0;
pub const QP_INIT_ATTR_XRCD: u32 = 1 << 1;
pub const SRQ_INIT_ATTR_TYPE: u32 = 1 << 0;
pub const SRQ_INIT_ATTR_PD: u32 = 1 << 1;
pub const SRQ_INIT_ATTR_XRCD: u32 = 1 << 2;
pub const SRQ_INIT_ATTR_CQ: u32 = 1 << 3;
pub const XRCD_INIT_ATTR_FD: u32 = 1 << 0;
pub const XRCD_INIT_ATTR_OFLAGS: u32 = 1 << 1;

/// Recover the `verbs_context` that embeds the given `ibv_context`.
#[inline]
pub(crate) unsafe fn verbs_get_ctx(ctx: *const ibv_context) -> *mut verbs_context {
    if ctx.is_null() || (*ctx).abi_compat != VERBS_ABI_IS_EXTENDED {
        ptr::null_mut()
    } else {
        (ctx as *const u8).sub(offset_of!(verbs_context, context)) as *mut verbs_context
    }
}

macro_rules! verbs_get_ctx_op {
    ($ctx:expr, $op:ident) => {{
        let vctx = verbs_get_ctx($ctx);
        if vctx.is_null()
            || (*vctx).sz
                < ::std::mem::size_of::<verbs_context>()
                    - memoffset::offset_of!(verbs_context, $op)
            || (*vctx).$op.is_none()
        {
            ::std::ptr::null_mut()
        } else {
            vctx
        }
    }};
}

extern "C" {
    fn ___ibv_query_port(
        context: *mut ibv_context,
        port_num: u8,
        port_attr: *mut ibv_port_attr,
    ) -> c_int;
}

/// Query the attributes of a port, including the extended fields that the
/// compat entry point leaves untouched.
#[inline]
pub unsafe fn ibv_query_port(
    context: *mut ibv_context,
    port_num: u8,
    port_attr: *mut ibv_port_attr,
) -> c_int {
    ___ibv_query_port(context, port_num, port_attr)
}

/// Poll a CQ for work completions. Returns the number of completions
/// drained, or a negative value on error.
#[inline]
pub unsafe fn ibv_poll_cq(cq: *mut ibv_cq, num_entries: c_int, wc: *mut ibv_wc) -> c_int {
    (*(*cq).context).ops.poll_cq.unwrap()(cq, num_entries, wc)
}

/// Post a chain of work requests to a send queue.
#[inline]
pub unsafe fn ibv_post_send(
    qp: *mut ibv_qp,
    wr: *mut ibv_send_wr,
    bad_wr: *mut *mut ibv_send_wr,
) -> c_int {
    (*(*qp).context).ops.post_send.unwrap()(qp, wr, bad_wr)
}

/// Post a chain of work requests to a receive queue.
#[inline]
pub unsafe fn ibv_post_recv(
    qp: *mut ibv_qp,
    wr: *mut ibv_recv_wr,
    bad_wr: *mut *mut ibv_recv_wr,
) -> c_int {
    (*(*qp).context).ops.post_recv.unwrap()(qp, wr, bad_wr)
}

/// Post a chain of work requests to a shared receive queue.
#[inline]
pub unsafe fn ibv_post_srq_recv(
    srq: *mut ibv_srq,
    wr: *mut ibv_recv_wr,
    bad_wr: *mut *mut ibv_recv_wr,
) -> c_int {
    (*(*srq).context).ops.post_srq_recv.unwrap()(srq, wr, bad_wr)
}

/// Open an XRC domain.
#[inline]
pub unsafe fn ibv_open_xrcd(
    context: *mut ibv_context,
    xrcd_init_attr: *mut ibv_xrcd_init_attr,
) -> *mut ibv_xrcd {
    let vctx = verbs_get_ctx_op!(context, open_xrcd);
    if vctx.is_null() {
        *libc::__errno_location() = ENOSYS;
        ptr::null_mut()
    } else {
        (*vctx).open_xrcd.unwrap()(context, xrcd_init_attr)
    }
}

/// Close an XRC domain.
#[inline]
pub unsafe fn ibv_close_xrcd(xrcd: *mut ibv_xrcd) -> c_int {
    let vctx = verbs_get_ctx_op!((*xrcd).context, close_xrcd);
    if vctx.is_null() {
        ENOSYS
    } else {
        (*vctx).close_xrcd.unwrap()(xrcd)
    }
}

/// Retrieve the wire-addressable number of an SRQ.
#[inline]
pub unsafe fn ibv_get_srq_num(srq: *mut ibv_srq, srq_num: *mut u32) -> c_int {
    let vctx = verbs_get_ctx_op!((*srq).context, get_srq_num);
    if vctx.is_null() {
        ENOSYS
    } else {
        (*vctx).get_srq_num.unwrap()(srq, srq_num)
    }
}

/// Create a queue pair with extended initialization attributes.
#[inline]
pub unsafe fn ibv_create_qp_ex(
    context: *mut ibv_context,
    qp_init_attr_ex: *mut ibv_qp_init_attr_ex,
) -> *mut ibv_qp {
    let mask = (*qp_init_attr_ex).comp_mask;
    if mask == QP_INIT_ATTR_PD {
        return ibv_create_qp(
            (*qp_init_attr_ex).pd,
            qp_init_attr_ex as *mut ibv_qp_init_attr,
        );
    }

    let vctx = verbs_get_ctx_op!(context, create_qp_ex);
    if vctx.is_null() {
        *libc::__errno_location() = ENOSYS;
        ptr::null_mut()
    } else {
        (*vctx).create_qp_ex.unwrap()(context, qp_init_attr_ex)
    }
}

/// Create a shared receive queue with extended initialization attributes.
#[inline]
pub unsafe fn ibv_create_srq_ex(
    context: *mut ibv_context,
    srq_init_attr_ex: *mut ibv_srq_init_attr_ex,
) -> *mut ibv_srq {
    let vctx = verbs_get_ctx_op!(context, create_srq_ex);
    if vctx.is_null() {
        *libc::__errno_location() = ENOSYS;
        ptr::null_mut()
    } else {
        (*vctx).create_srq_ex.unwrap()(context, srq_init_attr_ex)
    }
}
