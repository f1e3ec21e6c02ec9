//! Contract violations.
//!
//! Out-of-range descriptor writes, recording into a closed command list,
//! binding a set whose layout differs from the pipeline's and similar caller
//! bugs are not recoverable. They are logged and then terminate through a
//! panic that carries the call site.

use std::fmt;

#[doc(hidden)]
#[cold]
#[inline(never)]
pub fn violation(file: &'static str, line: u32, message: fmt::Arguments<'_>) -> ! {
    tracing::error!(target: "prism::contract", "{file}:{line}: {message}");
    panic!("contract violation at {file}:{line}: {message}");
}

/// Terminate with a diagnostic naming the call site.
#[macro_export]
macro_rules! contract_violation {
    ($($arg:tt)+) => {
        $crate::contract::violation(file!(), line!(), format_args!($($arg)+))
    };
}

/// Check a caller-side precondition, terminating through
/// [`contract_violation!`] when it does not hold.
#[macro_export]
macro_rules! require {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::contract_violation!("requirement failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::contract_violation!($($arg)+);
        }
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn satisfied_requirement_is_silent() {
        let capacity = 4;
        require!(3 < capacity, "index out of range");
    }

    #[test]
    #[should_panic(expected = "contract violation")]
    fn failed_requirement_panics() {
        let capacity = 4;
        require!(4 < capacity, "index {} out of range {}", 4, capacity);
    }

    #[test]
    #[should_panic(expected = "requirement failed: false")]
    fn bare_requirement_names_condition() {
        require!(false);
    }
}
