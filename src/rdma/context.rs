//! Device context: the opened NIC, its protection and XRC domains, and the
//! table of registered memory regions.

use std::ffi::CStr;
use std::io::Error as IoError;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use thiserror::Error;

use crate::bindings::*;
use crate::rdma::gid::Gid;
use crate::rdma::mr::{self, MrRecord, Permission};
use crate::rdma::types::{LKey, Lid};
use crate::rdma::Consts;
use crate::utils::die;

/// Context construction errors. All of them are configuration faults; a
/// process that cannot open its device has nothing else to do.
#[derive(Debug, Error)]
pub enum ContextError {
    /// The NIC enumerator returned no devices at all.
    #[error("no RDMA device found")]
    NoDevice,

    /// A device name was given but no device carries it.
    #[error("cannot find device: {0}")]
    DeviceNotFound(String),

    /// A verbs call failed while bringing the context up.
    #[error("{0}: {1}")]
    Verbs(&'static str, #[source] IoError),
}

/// Capabilities probed from the device at open time.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceCaps {
    /// The device supports XRC transport.
    pub xrc: bool,
    /// The provider exposes vendor extended atomics.
    pub ext_atomics: bool,
    /// The provider exposes vendor masked atomics.
    pub masked_atomics: bool,
}

struct MrSlot {
    mr: NonNull<ibv_mr>,
    rec: MrRecord,
}

// SAFETY: the raw pointer is only dereferenced under the context's
// registration discipline.
unsafe impl Send for MrSlot {}
unsafe impl Sync for MrSlot {}

/// An opened RDMA device with its protection domain, XRC domain, and up to
/// [`Consts::MAX_MRS`] registered memory regions.
///
/// The context is shared (`Arc`) by the cluster, peers and connections. The
/// MR table is append-only: registration happens under a lock, and the hot
/// path reads the published slot count with acquire ordering and scans
/// without synchronization. A dependency counter tracks live children; the
/// context refuses to tear the device down while it is nonzero.
pub struct Context {
    ctx: NonNull<ibv_context>,
    pd: NonNull<ibv_pd>,
    xrcd: Option<NonNull<ibv_xrcd>>,
    port_attr: ibv_port_attr,
    gid: Gid,
    caps: DeviceCaps,

    nmrs: AtomicUsize,
    mrs: [OnceLock<MrSlot>; Consts::MAX_MRS],
    reg_lock: Mutex<()>,

    deps: AtomicU32,
}

// SAFETY: verbs handles are usable from any thread; mutation of the MR table
// is internally synchronized and the domains are read-only after open.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

/// Physical port used by every queue pair.
pub(crate) const PORT_NUM: u8 = 1;
/// GID table index used for the global route header.
pub(crate) const GID_INDEX: u8 = 1;

impl Context {
    /// Open an RDMA device and bring up its domains.
    ///
    /// With no name, the first device the enumerator returns is taken;
    /// otherwise the name must match exactly. Capability deficiencies are
    /// logged but do not fail the open.
    pub fn open(dev_name: Option<&str>) -> Result<Arc<Self>, ContextError> {
        let mut n_devices = 0;
        // SAFETY: FFI.
        let dev_list = unsafe { ibv_get_device_list(&mut n_devices) };
        if dev_list.is_null() || n_devices == 0 {
            return Err(ContextError::NoDevice);
        }

        let mut target = None;
        match dev_name {
            None => target = Some(0),
            Some(name) => {
                for i in 0..n_devices as usize {
                    // SAFETY: `dev_list` holds `n_devices` valid entries.
                    let dev = unsafe { *dev_list.add(i) };
                    // SAFETY: FFI; the returned pointer is a NUL-terminated
                    // string owned by the device list.
                    let dev_name_i = unsafe { CStr::from_ptr(ibv_get_device_name(dev)) };
                    if dev_name_i.to_bytes() == name.as_bytes() {
                        target = Some(i);
                        break;
                    }
                }
            }
        }
        let Some(target) = target else {
            // SAFETY: FFI.
            unsafe { ibv_free_device_list(dev_list) };
            return Err(ContextError::DeviceNotFound(dev_name.unwrap().to_owned()));
        };

        // SAFETY: FFI; `target` indexes into the live list.
        let ctx = unsafe { ibv_open_device(*dev_list.add(target)) };
        // SAFETY: FFI; the list is not needed once the device is open.
        unsafe { ibv_free_device_list(dev_list) };
        let ctx = NonNull::new(ctx)
            .ok_or_else(|| ContextError::Verbs("ibv_open_device", IoError::last_os_error()))?;

        let caps = Self::probe_caps(ctx.as_ptr());

        // Past this point, failures release the device before reporting.
        let fail = |what: &'static str, err: IoError| {
            // SAFETY: opened above; the context escapes only on success.
            unsafe { ibv_close_device(ctx.as_ptr()) };
            Err(ContextError::Verbs(what, err))
        };

        // SAFETY: POD out-parameters for FFI.
        let mut port_attr = unsafe { std::mem::zeroed::<ibv_port_attr>() };
        let ret = unsafe { ibv_query_port(ctx.as_ptr(), PORT_NUM, &mut port_attr) };
        if ret != 0 {
            return fail("ibv_query_port", IoError::from_raw_os_error(ret));
        }

        let mut gid = ibv_gid { raw: [0; 16] };
        // SAFETY: FFI.
        let ret = unsafe { ibv_query_gid(ctx.as_ptr(), PORT_NUM, GID_INDEX as i32, &mut gid) };
        if ret != 0 {
            return fail("ibv_query_gid", IoError::from_raw_os_error(ret));
        }

        // SAFETY: FFI.
        let pd = match NonNull::new(unsafe { ibv_alloc_pd(ctx.as_ptr()) }) {
            Some(pd) => pd,
            None => return fail("ibv_alloc_pd", IoError::last_os_error()),
        };

        let xrcd = if caps.xrc {
            let mut attr = ibv_xrcd_init_attr {
                comp_mask: XRCD_INIT_ATTR_FD | XRCD_INIT_ATTR_OFLAGS,
                fd: -1,
                oflags: libc::O_CREAT,
            };
            // SAFETY: FFI.
            let xrcd = unsafe { ibv_open_xrcd(ctx.as_ptr(), &mut attr) };
            let xrcd = NonNull::new(xrcd);
            if xrcd.is_none() {
                log::warn!("cannot open XRC domain; XRC connections are unavailable");
            }
            xrcd
        } else {
            None
        };

        Ok(Arc::new(Self {
            ctx,
            pd,
            xrcd,
            port_attr,
            gid: Gid::from(gid),
            caps,
            nmrs: AtomicUsize::new(0),
            mrs: Default::default(),
            reg_lock: Mutex::new(()),
            deps: AtomicU32::new(0),
        }))
    }

    /// Probe device and provider capabilities, logging what is missing.
    fn probe_caps(ctx: *mut ibv_context) -> DeviceCaps {
        let mut caps = DeviceCaps::default();

        // SAFETY: POD out-parameter for FFI.
        let mut dev_attr = unsafe { std::mem::zeroed::<ibv_device_attr>() };
        // SAFETY: FFI.
        if unsafe { ibv_query_device(ctx, &mut dev_attr) } == 0 {
            caps.xrc = dev_attr.device_cap_flags & ibv_device_cap_flags::IBV_DEVICE_XRC.0 != 0;
        }
        if !caps.xrc {
            log::warn!("device does not advertise XRC transport");
        }

        let mut exp_attr = ibv_exp_device_attr::default();
        exp_attr.comp_mask = IBV_EXP_DEVICE_ATTR_EXP_CAP_FLAGS
            | IBV_EXP_DEVICE_ATTR_EXT_ATOMIC_ARGS
            | IBV_EXP_DEVICE_ATTR_MASKED_ATOMICS;
        // SAFETY: FFI; degrades to ENOSYS on providers without the vendor
        // extension.
        if unsafe { ibv_exp_query_device(ctx, &mut exp_attr) } == 0 {
            caps.ext_atomics = exp_attr.exp_device_cap_flags & IBV_EXP_DEVICE_EXT_ATOMICS != 0;
            caps.masked_atomics =
                exp_attr.exp_device_cap_flags & IBV_EXP_DEVICE_EXT_MASKED_ATOMICS != 0;
        }
        if !caps.ext_atomics {
            log::warn!("provider does not expose extended atomics");
        }
        if !caps.masked_atomics {
            log::warn!("provider does not expose masked atomics");
        }

        caps
    }

    /// Register `[addr, addr + len)` with the protection domain.
    ///
    /// Returns the assigned slot in `0..Consts::MAX_MRS`, or `-1` when the
    /// table is full or the NIC rejects the registration. A registered
    /// region keeps its slot and keys for the lifetime of the context.
    pub fn reg_mr(&self, addr: *mut u8, len: usize, perm: Permission) -> i32 {
        let _guard = self.reg_lock.lock().unwrap();

        let n = self.nmrs.load(Ordering::Relaxed);
        if n >= Consts::MAX_MRS {
            return -1;
        }

        // SAFETY: FFI; the caller guarantees the range is mapped for the
        // registration's lifetime.
        let mr = unsafe {
            ibv_reg_mr(
                self.pd.as_ptr(),
                addr as *mut libc::c_void,
                len,
                i32::from(perm),
            )
        };
        let Some(mr) = NonNull::new(mr) else {
            log::error!("ibv_reg_mr failed: {}", IoError::last_os_error());
            return -1;
        };

        // SAFETY: the slot pointer stays valid until context teardown.
        let rec = unsafe {
            MrRecord {
                base: (*mr.as_ptr()).addr as u64,
                length: (*mr.as_ptr()).length as u64,
                lkey: (*mr.as_ptr()).lkey,
                rkey: (*mr.as_ptr()).rkey,
            }
        };
        self.mrs[n]
            .set(MrSlot { mr, rec })
            .unwrap_or_else(|_| unreachable!("slot {} filled twice", n));
        self.nmrs.store(n + 1, Ordering::Release);
        n as i32
    }

    /// Number of currently registered memory regions.
    #[inline]
    pub fn mr_count(&self) -> usize {
        self.nmrs.load(Ordering::Acquire)
    }

    /// Descriptor of the memory region in `slot`.
    ///
    /// # Panics
    ///
    /// Panics if `slot` has not been registered.
    #[inline]
    pub fn mr_record(&self, slot: usize) -> MrRecord {
        self.mrs[slot].get().expect("MR slot not registered").rec
    }

    /// Resolve the local key for `[addr, addr + len)`.
    ///
    /// First-match scan in registration order; no match is an address fault.
    #[inline]
    pub fn match_lkey(&self, addr: u64, len: usize) -> LKey {
        let n = self.mr_count();
        let records = self.mrs[..n].iter().map(|s| &s.get().unwrap().rec);
        match mr::match_lkey(records, addr, len as u64) {
            Some(key) => key,
            None => die!("cannot match local mr for {:#x}+{}", addr, len),
        }
    }

    /// The LID of the port every connection binds to.
    #[inline]
    pub fn lid(&self) -> Lid {
        self.port_attr.lid
    }

    /// The GID used in global route headers.
    #[inline]
    pub fn gid(&self) -> Gid {
        self.gid
    }

    /// Probed device capabilities.
    #[inline]
    pub fn caps(&self) -> DeviceCaps {
        self.caps
    }

    /// The raw device context. The ownership stays with this object; do not
    /// close it.
    #[inline]
    pub fn as_raw(&self) -> *mut ibv_context {
        self.ctx.as_ptr()
    }

    /// The raw protection domain.
    #[inline]
    pub(crate) fn pd(&self) -> *mut ibv_pd {
        self.pd.as_ptr()
    }

    /// The raw XRC domain; fatal when the device has none.
    #[inline]
    pub(crate) fn xrcd(&self) -> *mut ibv_xrcd {
        match self.xrcd {
            Some(xrcd) => xrcd.as_ptr(),
            None => die!("XRC domain unavailable on this device"),
        }
    }

    pub(crate) fn add_dep(&self) {
        self.deps.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn del_dep(&self) {
        self.deps.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if self.deps.load(Ordering::Acquire) != 0 {
            // Children still reference the device; releasing the domains
            // under them would tear the rug out. Leak instead.
            log::error!("destructing RDMA context with live dependents; leaking resources");
            return;
        }

        // Teardown order: MRs, XRC domain, PD, device.
        for slot in self.mrs.iter().filter_map(|s| s.get()) {
            // SAFETY: registered exactly once, deregistered exactly once.
            unsafe { ibv_dereg_mr(slot.mr.as_ptr()) };
        }
        if let Some(xrcd) = self.xrcd {
            // SAFETY: opened exactly once.
            unsafe { ibv_close_xrcd(xrcd.as_ptr()) };
        }
        // SAFETY: allocated exactly once.
        unsafe { ibv_dealloc_pd(self.pd.as_ptr()) };
        // SAFETY: opened exactly once.
        unsafe { ibv_close_device(self.ctx.as_ptr()) };
    }
}
