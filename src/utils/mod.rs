/// Provide interoperability with C return values.
pub(crate) mod interop;

use std::fmt;
use std::process;

/// Log a per-rank diagnostic and terminate the process.
///
/// Used for invariant violations that leave the connection unusable: failed
/// state transitions, unmatched memory regions, misaligned atomic targets,
/// non-success work completions, and rendezvous transport errors. Connection
/// re-establishment is unsupported, so there is nothing to unwind to.
pub(crate) fn fatal(why: fmt::Arguments<'_>) -> ! {
    log::error!("fatal: {}", why);
    eprintln!("fatal: {}", why);
    process::abort();
}

macro_rules! die {
    ($($arg:tt)*) => {
        crate::utils::fatal(format_args!($($arg)*))
    };
}
pub(crate) use die;
