//! RDMA connectivity for tightly-coupled compute clusters.
//!
//! `rdmesh` wires every process of a cluster to every other with reliable
//! (RC) and extended reliable (XRC) connections, then exposes a thin typed
//! data plane on top: one-sided READ/WRITE, two-sided SEND/RECV, 64-bit and
//! masked/field atomics, and a remote-pointer abstraction with local-cache
//! and commit semantics.
//!
//! Bring-up follows a fixed shape: open a [`Context`], register a few large
//! memory arenas, build a [`Cluster`] over a rendezvous [`ctrl::Roster`],
//! and call [`Cluster::establish`]. Afterwards each [`Peer`] hands out its
//! connections for data-plane use:
//!
//! ```no_run
//! use rdmesh::{Cluster, Context, Permission};
//! use rdmesh::ctrl::Roster;
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut buf = vec![0u8; 1024];
//!
//! let roster = Roster::from_toml_file("cluster.toml")?;
//! let ctx = Context::open(roster.device())?;
//! ctx.reg_mr(buf.as_mut_ptr(), buf.len(), Permission::default());
//!
//! let cluster = Cluster::new(ctx, roster);
//! cluster.establish(1, 0);
//!
//! let next = (cluster.whoami() + 1) % cluster.size();
//! let (dst, _len) = cluster.peer(next).remote_mr(0);
//! let rc = cluster.peer(next).rc(0);
//! rc.post_write(dst + 64, buf.as_ptr(), 16, true, 0)?;
//! rc.poll_send_cq(1);
//! cluster.sync();
//! # Ok(())
//! # }
//! ```
//!
//! Failure policy: data-plane posts return the transport's accept/reject
//! code so callers can shed load, while state-machine and invariant
//! violations (including any non-success completion) log a per-rank
//! diagnostic and abort the process. Connections are single-writer on the
//! fast path; see the type-level documentation.

#[cfg(not(target_os = "linux"))]
compile_error!("`rdmesh` currently only supports Linux");

/// Supplemental verbs bindings.
mod bindings;

/// Shared util functions.
mod utils;

/// RDMA data-plane functionality.
/// Not publicly exposed; necessary items are `pub use`d below.
mod rdma;

pub use rdma::cluster::Cluster;
pub use rdma::context::{Context, ContextError, DeviceCaps};
pub use rdma::cq::{Cq, Wc};
pub use rdma::exchange::{OobExchange, OOB_EXCHANGE_BYTES};
pub use rdma::gid::Gid;
pub use rdma::mr::{MrRecord, Permission};
pub use rdma::peer::Peer;
pub use rdma::rc::{MaskedFaaSpec, RcConn, ReadSpec, WriteSpec};
pub use rdma::rptr::{RemoteObject, RemotePtr, RemoteWord, Volatile};
pub use rdma::xrc::XrcConn;
pub use rdma::Consts;

/// Type aliases for RDMA wire-level identifiers.
pub use rdma::types;

/// Rendezvous and bootstrap utilities.
pub mod ctrl;
