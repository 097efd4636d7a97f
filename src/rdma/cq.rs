//! Completion queues and work completions.

use std::ptr::NonNull;
use std::sync::Arc;
use std::{fmt, io, mem, ptr};

use crate::bindings::*;
use crate::rdma::context::Context;
use crate::rdma::types::WrId;
use crate::utils::die;

/// Work completion entry, transparently wrapping an `ibv_wc`.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct Wc(pub ibv_wc);

// SAFETY: plain data.
unsafe impl Send for Wc {}
unsafe impl Sync for Wc {}

impl Wc {
    /// The work request ID this completion answers.
    #[inline]
    pub fn wr_id(&self) -> WrId {
        self.0.wr_id
    }

    /// The raw completion status; 0 is success.
    #[inline]
    pub fn status(&self) -> u32 {
        self.0.status
    }

    /// Whether the work request completed successfully.
    #[inline]
    pub fn is_success(&self) -> bool {
        self.0.status == ibv_wc_status::IBV_WC_SUCCESS
    }

    /// Number of bytes processed or transferred.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.0.byte_len as usize
    }
}

impl Default for Wc {
    fn default() -> Self {
        // SAFETY: plain data; zero is a valid (empty) entry.
        unsafe { mem::zeroed() }
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id())
            .field("status", &self.status())
            .finish()
    }
}

/// Short name of a completion status for diagnostics.
pub(crate) fn wc_status_str(status: u32) -> &'static str {
    match status {
        ibv_wc_status::IBV_WC_SUCCESS => "success",
        ibv_wc_status::IBV_WC_LOC_LEN_ERR => "local length error",
        ibv_wc_status::IBV_WC_LOC_QP_OP_ERR => "local QP operation error",
        ibv_wc_status::IBV_WC_LOC_PROT_ERR => "local protection error",
        ibv_wc_status::IBV_WC_WR_FLUSH_ERR => "WR flushed",
        ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => "remote invalid request",
        ibv_wc_status::IBV_WC_REM_ACCESS_ERR => "remote access error",
        ibv_wc_status::IBV_WC_REM_OP_ERR => "remote operation error",
        ibv_wc_status::IBV_WC_RETRY_EXC_ERR => "retry counter exceeded",
        ibv_wc_status::IBV_WC_RNR_RETRY_EXC_ERR => "RNR retry counter exceeded",
        _ => "error",
    }
}

struct CqInner {
    _ctx: Arc<Context>,
    cq: NonNull<ibv_cq>,
}

// SAFETY: verbs CQ handles may be polled from any thread; callers provide
// external mutual exclusion per connection.
unsafe impl Send for CqInner {}
unsafe impl Sync for CqInner {}

impl Drop for CqInner {
    fn drop(&mut self) {
        // SAFETY: created exactly once, destroyed exactly once.
        unsafe { ibv_destroy_cq(self.cq.as_ptr()) };
    }
}

/// Completion queue handle, shareable between connections under the
/// CQ-sharing policy.
#[derive(Clone)]
pub struct Cq {
    inner: Arc<CqInner>,
}

/// How many entries one `ibv_poll_cq` call may drain at a time.
const POLL_BATCH: usize = 32;

impl Cq {
    /// Create a completion queue of the given depth.
    pub(crate) fn new(ctx: &Arc<Context>, depth: i32) -> io::Result<Self> {
        // SAFETY: FFI.
        let cq = unsafe {
            ibv_create_cq(
                ctx.as_raw(),
                depth,
                ptr::null_mut(),
                ptr::null_mut(),
                0,
            )
        };
        let cq = NonNull::new(cq).ok_or_else(io::Error::last_os_error)?;
        Ok(Self {
            inner: Arc::new(CqInner {
                _ctx: Arc::clone(ctx),
                cq,
            }),
        })
    }

    /// The raw CQ handle.
    #[inline]
    pub fn as_raw(&self) -> *mut ibv_cq {
        self.inner.cq.as_ptr()
    }

    /// Drain one batch of at most `wc.len()` entries without blocking.
    /// Any failed completion is fatal.
    pub(crate) fn poll_once(&self, wc: &mut [Wc], who: &str) -> usize {
        // SAFETY: FFI; `Wc` is transparent over `ibv_wc`.
        let res = unsafe {
            ibv_poll_cq(self.as_raw(), wc.len() as i32, wc.as_mut_ptr().cast())
        };
        if res < 0 {
            die!("{}: ibv_poll_cq returned {}", who, res);
        }
        check_batch(&wc[..res as usize], who);
        res as usize
    }

    /// Busy-poll until `wc` is completely filled. Any failed completion is
    /// fatal.
    pub(crate) fn poll_into_blocking(&self, wc: &mut [Wc], who: &str) {
        let n = wc.len();
        let mut polled = 0;
        while polled < n {
            // SAFETY: FFI; the tail of `wc` holds at least `n - polled`
            // writable entries.
            let res = unsafe {
                ibv_poll_cq(
                    self.as_raw(),
                    (n - polled) as i32,
                    wc[polled..].as_mut_ptr().cast(),
                )
            };
            if res < 0 {
                die!("{}: ibv_poll_cq returned {}", who, res);
            }
            polled += res as usize;
        }
        check_batch(wc, who);
    }

    /// Busy-poll until exactly `n` completions have been drained and
    /// discarded, at most [`POLL_BATCH`] at a time. Any failed completion is
    /// fatal.
    pub(crate) fn poll_count_blocking(&self, n: usize, who: &str) -> usize {
        let mut wc = [Wc::default(); POLL_BATCH];
        let mut left = n;
        while left > 0 {
            let m = left.min(POLL_BATCH);
            self.poll_into_blocking(&mut wc[..m], who);
            left -= m;
        }
        n
    }
}

fn check_batch(wc: &[Wc], who: &str) {
    for entry in wc {
        if !entry.is_success() {
            die!(
                "{}: wc failure: {} (status {}, wr_id {})",
                who,
                wc_status_str(entry.status()),
                entry.status(),
                entry.wr_id()
            );
        }
    }
}
