//! Suite bookkeeping shared by every `define_test_suite!` expansion.

use super::TestResult;
use crate::netlog_info;

/// Aggregate outcome of one suite run.
#[derive(Clone, Copy, Debug)]
pub struct TestSuiteResult {
    pub name: &'static str,
    pub total: u32,
    pub passed: u32,
    pub failed: u32,
}

impl TestSuiteResult {
    #[inline]
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

/// Run one test function, logging its outcome.
pub fn run_single_test(name: &'static str, test: impl FnOnce() -> TestResult) -> TestResult {
    let result = test();
    match result {
        TestResult::Pass => netlog_info!("[ok]   {}", name),
        TestResult::Skipped => netlog_info!("[skip] {}", name),
        TestResult::Fail => netlog_info!("[FAIL] {}", name),
    }
    result
}
