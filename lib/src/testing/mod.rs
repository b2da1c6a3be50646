pub mod harness;

mod assertions;

pub use harness::{TestSuiteResult, run_single_test};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TestResult {
    Pass,
    Fail,
    Skipped,
}

impl TestResult {
    #[inline]
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass | Self::Skipped)
    }

    #[inline]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail)
    }
}

#[macro_export]
macro_rules! pass {
    () => {
        $crate::testing::TestResult::Pass
    };
}

#[macro_export]
macro_rules! fail {
    () => {
        $crate::testing::TestResult::Fail
    };
    ($msg:expr) => {{
        $crate::netlog_info!("TEST FAIL: {}", $msg);
        $crate::testing::TestResult::Fail
    }};
    ($fmt:expr, $($arg:tt)*) => {{
        $crate::netlog_info!(concat!("TEST FAIL: ", $fmt), $($arg)*);
        $crate::testing::TestResult::Fail
    }};
}

#[macro_export]
macro_rules! run_test {
    ($passed:expr, $total:expr, $test_fn:expr) => {{
        $total += 1;
        let result = $crate::testing::run_single_test(stringify!($test_fn), || $test_fn());
        if result.is_pass() {
            $passed += 1;
        }
        result
    }};

    ($test_fn:expr) => {{ $crate::testing::run_single_test(stringify!($test_fn), || $test_fn()) }};
}

#[macro_export]
macro_rules! define_test_suite {
    ($suite_name:ident, [$($test_fn:path),* $(,)?]) => {
        $crate::paste::paste! {
            pub fn [<run_ $suite_name _suite>]() -> $crate::testing::TestSuiteResult {
                let mut passed = 0u32;
                let mut total = 0u32;

                $(
                    $crate::run_test!(passed, total, $test_fn);
                )*

                $crate::testing::TestSuiteResult {
                    name: stringify!($suite_name),
                    total,
                    passed,
                    failed: total.saturating_sub(passed),
                }
            }

            #[cfg(test)]
            #[test]
            fn [<$suite_name _suite>]() {
                extern crate std;

                fn stdout_backend(level: $crate::log::LogLevel, args: core::fmt::Arguments<'_>) {
                    std::println!("[{:?}] {}", level, args);
                }
                $crate::netlog_register_backend(stdout_backend);

                let summary = [<run_ $suite_name _suite>]();
                std::assert_eq!(
                    summary.failed, 0,
                    "{}: {}/{} tests passed",
                    summary.name, summary.passed, summary.total
                );
            }
        }
    };
}
