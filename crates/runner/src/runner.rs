//! Run-level orchestration and result aggregation
//!
//! A `VisualRunner` owns the server connection and every open test, waits
//! out their pending checks at the end of the run, closes them (or aborts
//! the ones that already failed), closes the batches it touched, and folds
//! everything into one summary.

use crate::controller::GlobalState;
use crate::grid_check::{GridCheckSettings, GridTest};
use ocular_common::{BrowserInfo, Config, Error, Result, TestResults, TestStatus};
use ocular_grid::{DomSnapshot, ResourceStore};
use ocular_transport::ServerClient;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// One browser's outcome: results, an error, or both (typed failures carry
/// their results).
#[derive(Debug, Clone)]
pub struct TestResultContainer {
    pub results: Option<TestResults>,
    pub error: Option<Arc<Error>>,
    pub browser: Option<BrowserInfo>,
}

#[derive(Debug, Default)]
pub struct TestResultsSummary {
    pub containers: Vec<TestResultContainer>,
    pub passed: u32,
    pub unresolved: u32,
    pub failed: u32,
    pub exceptions: u32,
    pub matches: u32,
    pub mismatches: u32,
    pub missing: u32,
}

impl TestResultsSummary {
    fn add(&mut self, container: TestResultContainer) {
        if container.error.is_some() {
            self.exceptions += 1;
        }
        if let Some(results) = &container.results {
            match results.status {
                Some(TestStatus::Passed) => self.passed += 1,
                Some(TestStatus::Unresolved) => self.unresolved += 1,
                Some(TestStatus::Failed) => self.failed += 1,
                None => {}
            }
            self.matches += results.matches;
            self.mismatches += results.mismatches;
            self.missing += results.missing;
        }
        self.containers.push(container);
    }

    /// The first hard failure of the run, if any. Unresolved results count
    /// as failures only when `fail_on_diff` is set.
    pub fn first_error(&self, fail_on_diff: bool) -> Option<Error> {
        for container in &self.containers {
            if let Some(error) = &container.error {
                if matches!(error.as_ref(), Error::DiffsFound { .. }) && !fail_on_diff {
                    continue;
                }
                if let Some(results) = error.test_results() {
                    if let Some(typed) = Error::from_test_results(results) {
                        return Some(typed);
                    }
                }
                return Some(Error::Fatal(error.to_string()));
            }
        }
        None
    }
}

impl fmt::Display for TestResultsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "passed={} unresolved={} failed={} exceptions={} (matches={} mismatches={} missing={})",
            self.passed,
            self.unresolved,
            self.failed,
            self.exceptions,
            self.matches,
            self.mismatches,
            self.missing
        )
    }
}

pub struct VisualRunner {
    client: Arc<ServerClient>,
    config: Config,
    store: Arc<ResourceStore>,
    global: Arc<GlobalState>,
    tests: Vec<GridTest>,
}

impl VisualRunner {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let client = Arc::new(ServerClient::new(config.clone())?);
        Ok(Self {
            client,
            config,
            store: Arc::new(ResourceStore::new()),
            global: Arc::new(GlobalState::new()),
            tests: Vec::new(),
        })
    }

    pub fn global_state(&self) -> Arc<GlobalState> {
        Arc::clone(&self.global)
    }

    /// Open a new logical test across every configured browser. Returns a
    /// handle for check calls.
    pub async fn open_test(&mut self, app_name: &str, test_name: &str) -> Result<usize> {
        let mut test = GridTest::new(
            Arc::clone(&self.client),
            self.config.clone(),
            Arc::clone(&self.store),
            &self.global,
        )?;
        test.open(app_name, test_name).await?;
        self.tests.push(test);
        Ok(self.tests.len() - 1)
    }

    /// Queue one check for a previously opened test.
    pub fn check(
        &mut self,
        handle: usize,
        snapshot: DomSnapshot,
        settings: GridCheckSettings,
    ) -> Result<()> {
        let test = self
            .tests
            .get_mut(handle)
            .ok_or_else(|| Error::Internal(format!("unknown test handle {handle}")))?;
        test.check(snapshot, settings);
        Ok(())
    }

    /// Abort every open test, marking the run as user-aborted.
    pub async fn abort_all(&mut self) {
        for test in &mut self.tests {
            test.abort_all().await;
        }
    }

    /// Wait out every pending check, close (or abort) every test, close the
    /// batches this run touched, and aggregate. With `throw_err`, the first
    /// hard failure is raised after aggregation completes.
    pub async fn get_all_test_results(&mut self, throw_err: bool) -> Result<TestResultsSummary> {
        let mut summary = TestResultsSummary::default();

        for test in &mut self.tests {
            self.global.note_batch(&test.batch_id());
            let browsers = test.browsers();
            let outcomes = test.close_all(true).await;
            for (outcome, browser) in outcomes.into_iter().zip(browsers) {
                let container = match outcome {
                    Ok(results) => TestResultContainer {
                        results: Some(results),
                        error: None,
                        browser: Some(browser),
                    },
                    Err(error) => TestResultContainer {
                        results: error.test_results().cloned(),
                        error: Some(error),
                        browser: Some(browser),
                    },
                };
                summary.add(container);
            }
        }
        self.tests.clear();

        if !self.config.dont_close_batches {
            for batch_id in self.global.take_batches() {
                if let Err(error) = self.client.delete_batch_sessions(&batch_id).await {
                    warn!(%batch_id, %error, "failed to close batch");
                }
            }
        }
        self.global.reset();
        info!(%summary, "run finished");

        if throw_err {
            if let Some(error) = summary.first_error(self.config.fail_on_diff) {
                return Err(error);
            }
        }
        Ok(summary)
    }
}
