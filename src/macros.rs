#![allow(unused_macros)]

// Crate-local log macros. With the `tracing` feature they forward to
// `tracing` under the `rsmediakeys` target, otherwise they compile away.

macro_rules! trace {
    ($($t:tt)*) => {
        log!(trace, $($t)*)
    }
}

macro_rules! debug {
    ($($t:tt)*) => {
        log!(debug, $($t)*)
    }
}

macro_rules! info {
    ($($t:tt)*) => {
        log!(info, $($t)*)
    }
}

macro_rules! warn {
    ($($t:tt)*) => {
        log!(warn, $($t)*)
    }
}

macro_rules! error {
    ($($t:tt)*) => {
        log!(error, $($t)*)
    }
}

macro_rules! log {
    ($level: ident, $($t:tt)*) => {
        #[cfg(feature = "tracing")]
        { tracing::$level!(target: "rsmediakeys", $($t)*) }
        // Borrow the arguments so they don't trip unused warnings.
        #[cfg(not(feature = "tracing"))]
        { if false { let _ = format_args!($($t)*); } }
    }
}
