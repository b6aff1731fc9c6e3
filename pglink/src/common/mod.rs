//! Supporting utility type.
mod bytestr;
pub use bytestr::ByteStr;

/// Trace when `log` or `verbose` feature enabled.
macro_rules! trace {
    ($($tt:tt)*) => {{
        #[cfg(feature = "log")]
        log::trace!($($tt)*);
        #[cfg(feature = "verbose")]
        tracing::trace!($($tt)*);
        #[cfg(not(any(feature = "log", feature = "verbose")))]
        if false { let _ = format!($($tt)*); }
    }};
}

/// Warn when `log` or `verbose` feature enabled.
macro_rules! warning {
    ($($tt:tt)*) => {{
        #[cfg(feature = "log")]
        log::warn!($($tt)*);
        #[cfg(feature = "verbose")]
        tracing::warn!($($tt)*);
        #[cfg(not(any(feature = "log", feature = "verbose")))]
        if false { let _ = format!($($tt)*); }
    }};
}

/// Declare a zero sized error type with a fixed message.
macro_rules! unit_error {
    (
        $(#[$doc:meta])*
        $vis:vis struct $name:ident($msg:literal);
    ) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq)]
        $vis struct $name;

        impl std::error::Error for $name { }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str($msg)
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "\"{self}\"")
            }
        }
    };
}

pub(crate) use trace;
pub(crate) use unit_error;
pub(crate) use warning;
