//! Small helper macros shared across the backend implementations.
//!
//! Kept separate and defined first, mirroring mio's `src/macros.rs`: both
//! `syscall!` and the `cfg_log!` family are used before any other module is
//! declared in `lib.rs`.

/// Run a libc call that follows the `-1` on error / `errno` set convention
/// and turn it into an `io::Result`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// Emit a `log::trace!` when the `log` feature is enabled, otherwise compile
/// to nothing. Used on the cold paths (insert/delete, backend fallback,
/// fork recovery), never inside a CAS retry loop.
macro_rules! cfg_trace {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::trace!($($arg)*);
    };
}

/// As [`cfg_trace`] but at `warn` level, used for kernel-registration
/// failures per the §7 propagation policy.
macro_rules! cfg_warn {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::warn!($($arg)*);
    };
}

/// As [`cfg_trace`] but at `debug` level.
macro_rules! cfg_debug {
    ($($arg:tt)*) => {
        #[cfg(feature = "log")]
        log::debug!($($arg)*);
    };
}
