//! 16-byte global identifiers (GIDs).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bindings::ibv_gid;

/// A 16-byte RDMA global identifier.
///
/// Stored as raw bytes so that it can be embedded in fixed-layout exchange
/// records and shipped over out-of-band transports verbatim.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// Length of a GID in bytes.
    pub const LEN: usize = 16;

    /// View the GID as raw bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl From<ibv_gid> for Gid {
    #[inline]
    fn from(gid: ibv_gid) -> Self {
        // SAFETY: every union arm of `ibv_gid` is plain bytes.
        Self(unsafe { gid.raw })
    }
}

impl From<Gid> for ibv_gid {
    #[inline]
    fn from(gid: Gid) -> Self {
        ibv_gid { raw: gid.0 }
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_ibv_gid() {
        let gid = Gid([
            0xFE, 0x80, 0, 0, 0, 0, 0, 0, 0x02, 0x11, 0x22, 0xFF, 0xFE, 0x33, 0x44, 0x55,
        ]);
        let raw: ibv_gid = gid.into();
        assert_eq!(Gid::from(raw), gid);
    }

    #[test]
    fn debug_is_colon_separated_hex() {
        let gid = Gid([0; 16]);
        let s = format!("{:?}", gid);
        assert_eq!(s.split(':').count(), 16);
    }
}
