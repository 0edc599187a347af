//! Logging interface, contingent on the hidden `__log` feature
//!
//! Only enable `__log` when debugging, and when you're certain that your
//! logger isn't using USB! Most of these log points run from the
//! dispatch context, which is usually the USB interrupt.

macro_rules! debug {
    ($($args:tt)*) => {
        #[cfg(feature = "__log")]
        ::__log::debug!($($args)*)
    };
}

macro_rules! trace {
    ($($args:tt)*) => {
        #[cfg(feature = "__log")]
        ::__log::trace!($($args)*)
    };
}

macro_rules! warn {
    ($($args:tt)*) => {
        #[cfg(feature = "__log")]
        ::__log::warn!($($args)*)
    };
}
