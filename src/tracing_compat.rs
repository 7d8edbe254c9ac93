//! Logging facade.
//!
//! With the `tracing-integration` feature the macros below are `tracing`'s own.
//! Without it they expand to a dead branch that borrows every field value, so
//! call sites never need a `cfg`.

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, error, info, trace, warn};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    #[doc(hidden)]
    #[macro_export]
    macro_rules! __flowbridge_noop_log {
        ($($arg:tt)*) => {
            if false {
                $crate::__flowbridge_noop_fields!($($arg)*);
            }
        };
    }

    #[doc(hidden)]
    #[macro_export]
    macro_rules! __flowbridge_noop_fields {
        () => {};
        ($key:ident = % $value:expr $(, $($rest:tt)*)?) => {
            let _ = &$value;
            $($crate::__flowbridge_noop_fields!($($rest)*);)?
        };
        ($key:ident = ? $value:expr $(, $($rest:tt)*)?) => {
            let _ = &$value;
            $($crate::__flowbridge_noop_fields!($($rest)*);)?
        };
        ($key:ident = $value:expr $(, $($rest:tt)*)?) => {
            let _ = &$value;
            $($crate::__flowbridge_noop_fields!($($rest)*);)?
        };
        (% $value:ident $(, $($rest:tt)*)?) => {
            let _ = &$value;
            $($crate::__flowbridge_noop_fields!($($rest)*);)?
        };
        (? $value:ident $(, $($rest:tt)*)?) => {
            let _ = &$value;
            $($crate::__flowbridge_noop_fields!($($rest)*);)?
        };
        ($value:ident $(, $($rest:tt)*)?) => {
            let _ = &$value;
            $($crate::__flowbridge_noop_fields!($($rest)*);)?
        };
        ($message:literal $(, $arg:expr)* $(,)?) => {
            $(let _ = &$arg;)*
        };
    }
}

#[cfg(not(feature = "tracing-integration"))]
pub use crate::__flowbridge_noop_log as debug;
#[cfg(not(feature = "tracing-integration"))]
pub use crate::__flowbridge_noop_log as error;
#[cfg(not(feature = "tracing-integration"))]
pub use crate::__flowbridge_noop_log as info;
#[cfg(not(feature = "tracing-integration"))]
pub use crate::__flowbridge_noop_log as trace;
#[cfg(not(feature = "tracing-integration"))]
pub use crate::__flowbridge_noop_log as warn;
