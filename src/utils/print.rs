//! Helper macros for logging (console printing).
//!
//! Every line is prefixed with the parenthesized ID of the emitting entity
//! (a replica ID, a router ID, or a name string), so interleaved output from
//! multiple module threads stays attributable.

/// Internal dispatcher shared by the per-level macros below; not meant to be
/// invoked directly.
#[macro_export]
macro_rules! pf_log {
    ($level:ident, $prefix:expr; $fmt_str:literal) => {
        log::$level!(concat!("({}) ", $fmt_str), $prefix)
    };

    ($level:ident, $prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {
        log::$level!(concat!("({}) ", $fmt_str), $prefix, $($fmt_arg)*)
    };
}

/// Log TRACE message with parenthesized prefix.
///
/// Example:
/// ```no_run
/// pf_trace!(id; "applied entry {}", idx);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($prefix:expr; $($rest:tt)*) => {
        $crate::pf_log!(trace, $prefix; $($rest)*)
    };
}

/// Log DEBUG message with parenthesized prefix.
#[macro_export]
macro_rules! pf_debug {
    ($prefix:expr; $($rest:tt)*) => {
        $crate::pf_log!(debug, $prefix; $($rest)*)
    };
}

/// Log INFO message with parenthesized prefix.
#[macro_export]
macro_rules! pf_info {
    ($prefix:expr; $($rest:tt)*) => {
        $crate::pf_log!(info, $prefix; $($rest)*)
    };
}

/// Log WARN message with parenthesized prefix.
#[macro_export]
macro_rules! pf_warn {
    ($prefix:expr; $($rest:tt)*) => {
        $crate::pf_log!(warn, $prefix; $($rest)*)
    };
}

/// Log ERROR message with parenthesized prefix.
#[macro_export]
macro_rules! pf_error {
    ($prefix:expr; $($rest:tt)*) => {
        $crate::pf_log!(error, $prefix; $($rest)*)
    };
}

/// Log an error string to logger and then return an `Err(OramShardError)`
/// containing the same string.
///
/// Example:
/// ```no_run
/// return logged_err!(id; "unexpected op {:?}", op);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($prefix:expr; $fmt_str:literal) => {{
        $crate::pf_error!($prefix; $fmt_str);
        Err($crate::utils::OramShardError(format!(
            concat!("({}) ", $fmt_str),
            $prefix
        )))
    }};

    ($prefix:expr; $fmt_str:literal, $($fmt_arg:tt)*) => {{
        $crate::pf_error!($prefix; $fmt_str, $($fmt_arg)*);
        Err($crate::utils::OramShardError(format!(
            concat!("({}) ", $fmt_str),
            $prefix,
            $($fmt_arg)*
        )))
    }};
}
