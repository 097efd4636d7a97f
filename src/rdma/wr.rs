//! Work request construction helpers shared by the RC and XRC fast paths.
//!
//! The standard verbs are built inline at the post sites; what lives here is
//! the encoding of the vendor extended atomics, which both connection types
//! share, plus the bit-field arithmetic behind field-granular fetch-and-add.

use crate::bindings::*;
use crate::rdma::types::{LKey, RKey, WrId};

/// `log2(sizeof(u64))`, the argument size selector for 8-byte extended
/// atomics.
pub(crate) const LOG_ATOMIC_ARG_SIZE_8: u32 = 3;

/// Fill a scatter-gather entry.
#[inline]
pub(crate) fn sge(addr: u64, len: u32, lkey: LKey) -> ibv_sge {
    ibv_sge {
        addr,
        length: len,
        lkey,
    }
}

/// Operands of a field-granular fetch-and-add over the bit range
/// `[lo_bit, hi_bit]`: the add value is shifted into the field and the field
/// boundary bit stops carries from leaking past `hi_bit`.
#[inline]
pub(crate) fn field_add_operands(add: u64, hi_bit: u32, lo_bit: u32) -> (u64, u64) {
    (add << lo_bit, 1u64 << hi_bit)
}

/// Build a masked compare-and-swap work request. `sg_list` is left for the
/// caller to attach, since the entry must outlive the post call.
pub(crate) fn masked_cas_wr(
    wr_id: WrId,
    remote_addr: u64,
    rkey: RKey,
    compare: u64,
    compare_mask: u64,
    swap: u64,
    swap_mask: u64,
    signaled: bool,
) -> ibv_exp_send_wr {
    let mut wr = ibv_exp_send_wr::default();
    wr.wr_id = wr_id;
    wr.num_sge = 1;
    wr.exp_opcode = ibv_exp_wr_opcode::IBV_EXP_WR_EXT_MASKED_ATOMIC_CMP_AND_SWP;
    wr.exp_send_flags = IBV_EXP_SEND_EXT_ATOMIC_INLINE;
    if signaled {
        wr.exp_send_flags |= IBV_EXP_SEND_SIGNALED;
    }
    wr.ext_op.masked_atomics = masked_atomics_t {
        log_arg_sz: LOG_ATOMIC_ARG_SIZE_8,
        remote_addr,
        rkey,
        wr_data: wr_data_t {
            inline_data: inline_data_t {
                op: inline_data_op_t {
                    cmp_swap: ibv_exp_cmp_swap {
                        compare_mask,
                        compare_val: compare,
                        swap_mask,
                        swap_val: swap,
                    },
                },
            },
        },
    };
    wr
}

/// Build a masked fetch-and-add work request against the given field
/// boundary bitmap.
pub(crate) fn masked_faa_wr(
    wr_id: WrId,
    remote_addr: u64,
    rkey: RKey,
    add: u64,
    boundary: u64,
    signaled: bool,
) -> ibv_exp_send_wr {
    let mut wr = ibv_exp_send_wr::default();
    wr.wr_id = wr_id;
    wr.num_sge = 1;
    wr.exp_opcode = ibv_exp_wr_opcode::IBV_EXP_WR_EXT_MASKED_ATOMIC_FETCH_AND_ADD;
    wr.exp_send_flags = IBV_EXP_SEND_EXT_ATOMIC_INLINE;
    if signaled {
        wr.exp_send_flags |= IBV_EXP_SEND_SIGNALED;
    }
    wr.ext_op.masked_atomics = masked_atomics_t {
        log_arg_sz: LOG_ATOMIC_ARG_SIZE_8,
        remote_addr,
        rkey,
        wr_data: wr_data_t {
            inline_data: inline_data_t {
                op: inline_data_op_t {
                    fetch_add: ibv_exp_fetch_add {
                        add_val: add,
                        field_boundary: boundary,
                    },
                },
            },
        },
    };
    wr
}

/// Build a WAIT work request: the send queue stalls until `cqe_count`
/// completions have landed in `cq`.
pub(crate) fn cqe_wait_wr(cq: *mut ibv_cq, cqe_count: i32, signaled: bool) -> ibv_exp_send_wr {
    let mut wr = ibv_exp_send_wr::default();
    wr.exp_opcode = ibv_exp_wr_opcode::IBV_EXP_WR_CQE_WAIT;
    wr.exp_send_flags = IBV_EXP_SEND_WAIT_EN_LAST;
    if signaled {
        wr.exp_send_flags |= IBV_EXP_SEND_SIGNALED;
    }
    wr.task.cqe_wait = cqe_wait_t { cq, cq_count: cqe_count };
    wr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_operands_shift_into_place() {
        // Adding 1 to the [16, 31] field: the operand lands at bit 16 and
        // the boundary caps the field at bit 31.
        assert_eq!(field_add_operands(1, 31, 16), (1 << 16, 1 << 31));
        // The whole word: plain FAA with the boundary at the top bit.
        assert_eq!(field_add_operands(5, 63, 0), (5, 1 << 63));
    }

    #[test]
    fn masked_cas_encodes_inline_operands() {
        let wr = masked_cas_wr(7, 0x1000, 42, 0xAA, 0xFF, 0xBB, 0xF0, true);
        assert_eq!(wr.wr_id, 7);
        assert_eq!(
            wr.exp_opcode,
            ibv_exp_wr_opcode::IBV_EXP_WR_EXT_MASKED_ATOMIC_CMP_AND_SWP
        );
        assert_eq!(
            wr.exp_send_flags,
            IBV_EXP_SEND_EXT_ATOMIC_INLINE | IBV_EXP_SEND_SIGNALED
        );
        // SAFETY: reading the arm just written.
        let (atomics, cs) = unsafe {
            (
                wr.ext_op.masked_atomics,
                wr.ext_op.masked_atomics.wr_data.inline_data.op.cmp_swap,
            )
        };
        assert_eq!(atomics.log_arg_sz, LOG_ATOMIC_ARG_SIZE_8);
        assert_eq!(atomics.remote_addr, 0x1000);
        assert_eq!(atomics.rkey, 42);
        assert_eq!((cs.compare_val, cs.compare_mask), (0xAA, 0xFF));
        assert_eq!((cs.swap_val, cs.swap_mask), (0xBB, 0xF0));
    }

    #[test]
    fn masked_faa_is_unsignaled_unless_asked() {
        let wr = masked_faa_wr(0, 0x2000, 9, 3, 1 << 15, false);
        assert_eq!(wr.exp_send_flags, IBV_EXP_SEND_EXT_ATOMIC_INLINE);
        // SAFETY: reading the arm just written.
        let fa = unsafe { wr.ext_op.masked_atomics.wr_data.inline_data.op.fetch_add };
        assert_eq!(fa.add_val, 3);
        assert_eq!(fa.field_boundary, 1 << 15);
    }
}
