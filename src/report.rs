//! Per-test outcomes and the end-of-suite summary.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Outcome class of one test.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    Passed,
    Failed,
    SetupError,
    Cancelled,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestStatus::Passed => write!(f, "passed"),
            TestStatus::Failed => write!(f, "failed"),
            TestStatus::SetupError => write!(f, "setup-error"),
            TestStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Everything recorded about one finished test.
#[derive(Clone, Debug, Serialize)]
pub struct TestResult {
    pub index: u64,
    pub status: TestStatus,
    pub exit_code: Option<i32>,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    /// Human rendering of the bound modification parameters.
    pub params: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl TestResult {
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Passed
    }
}

/// Growable, ordered store of test results.
#[derive(Debug, Default)]
pub struct Aggregator {
    results: Vec<TestResult>,
}

impl Aggregator {
    pub fn record(&mut self, result: TestResult) {
        self.results.push(result);
    }

    pub fn results(&self) -> &[TestResult] {
        &self.results
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn all_passed(&self) -> bool {
        self.results.iter().all(TestResult::passed)
    }

    pub fn summary(&self) -> Summary {
        let mut summary = Summary {
            total: self.results.len(),
            ..Summary::default()
        };
        for result in &self.results {
            match result.status {
                TestStatus::Passed => summary.passed += 1,
                TestStatus::Failed => summary.failed += 1,
                TestStatus::SetupError => summary.setup_errors += 1,
                TestStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }
}

/// Aggregate counts for the finished suite.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub setup_errors: usize,
    pub cancelled: usize,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} test(s): {} passed, {} failed, {} setup errors, {} cancelled",
            self.total, self.passed, self.failed, self.setup_errors, self.cancelled
        )
    }
}

/// Print the human summary, with parameter tuples for every failing test.
pub fn print_summary(aggregator: &Aggregator) {
    println!("{}", aggregator.summary());
    for result in aggregator.results() {
        if result.passed() {
            continue;
        }
        let exit = result
            .exit_code
            .map_or_else(|| "-".to_string(), |code| code.to_string());
        println!("  test {} [{}] exit={}", result.index, result.status, exit);
        println!("    params: {}", result.params);
        for note in &result.notes {
            println!("    note: {note}");
        }
    }
}
