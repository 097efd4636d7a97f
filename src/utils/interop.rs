use std::io;

/// Converts a `libibverbs` return value into an [`io::Result`].
///
/// Post-style verbs return 0 on acceptance and an errno value on rejection;
/// the errno is preserved so callers can distinguish queue-full conditions
/// from hard faults.
#[inline]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(ret.abs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_ok() {
        assert!(from_c_ret(0).is_ok());
    }

    #[test]
    fn errno_is_preserved() {
        let err = from_c_ret(libc::ENOMEM).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
    }
}
