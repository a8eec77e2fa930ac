//! The bounded match retry loop
//!
//! A check call keeps re-capturing and re-matching until the server says
//! the output is as expected or the retry budget runs out. Intermediate
//! exchanges ask the server to ignore mismatches so failed tries never
//! pollute the session; only the final exchange is binding.

use async_trait::async_trait;
use ocular_common::{AppOutput, ImageMatchSettings, MatchResult, Result, TestResults};
use ocular_transport::{ImageMatchOptions, MatchWindowData, Trigger};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Pause between match attempts.
pub const MATCH_INTERVAL: Duration = Duration::from_millis(500);

/// Captures the application output (screenshot, DOM) for one attempt. The
/// previous attempt's output is offered as a diff base so capture layers
/// can skip unchanged regions.
#[async_trait]
pub trait CaptureProvider: Send + Sync {
    async fn capture_output(
        &self,
        settings: &CheckSettings,
        last_output: Option<&AppOutput>,
    ) -> Result<AppOutput>;
}

/// One match exchange against the running session.
#[async_trait]
pub trait MatchExchange: Send + Sync {
    async fn perform_match(&self, data: MatchWindowData) -> Result<MatchResult>;
    async fn perform_match_and_close(&self, data: MatchWindowData) -> Result<TestResults>;
}

/// Per-check inputs.
#[derive(Debug, Clone)]
pub struct CheckSettings {
    pub tag: String,
    /// Milliseconds; negative uses the configured default.
    pub retry_timeout_ms: i64,
    pub ignore_mismatch: bool,
    pub match_settings: ImageMatchSettings,
    pub source: Option<String>,
    pub render_id: Option<String>,
    pub user_inputs: Vec<Trigger>,
    pub update_baseline_if_new: bool,
    pub update_baseline_if_different: bool,
    pub remove_session_if_matching: bool,
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            tag: String::new(),
            retry_timeout_ms: -1,
            ignore_mismatch: false,
            match_settings: ImageMatchSettings::default(),
            source: None,
            render_id: None,
            user_inputs: Vec::new(),
            update_baseline_if_new: false,
            update_baseline_if_different: false,
            remove_session_if_matching: false,
        }
    }
}

pub struct MatchTask<'a> {
    exchange: &'a dyn MatchExchange,
    capture: &'a dyn CaptureProvider,
    default_retry_timeout: Duration,
}

impl<'a> MatchTask<'a> {
    pub fn new(
        exchange: &'a dyn MatchExchange,
        capture: &'a dyn CaptureProvider,
        default_retry_timeout: Duration,
    ) -> Self {
        Self {
            exchange,
            capture,
            default_retry_timeout,
        }
    }

    fn retry_timeout(&self, settings: &CheckSettings) -> Duration {
        if settings.retry_timeout_ms < 0 {
            self.default_retry_timeout
        } else {
            Duration::from_millis(settings.retry_timeout_ms as u64)
        }
    }

    fn build_data(
        &self,
        settings: &CheckSettings,
        output: &AppOutput,
        ignore_mismatch: bool,
        and_close: bool,
    ) -> MatchWindowData {
        MatchWindowData {
            user_inputs: settings.user_inputs.clone(),
            app_output: output.clone(),
            tag: settings.tag.clone(),
            ignore_mismatch,
            options: ImageMatchOptions {
                name: settings.tag.clone(),
                source: settings.source.clone(),
                render_id: settings.render_id.clone(),
                ignore_mismatch,
                image_match_settings: settings.match_settings.clone(),
                user_inputs: settings.user_inputs.clone(),
                ..ImageMatchOptions::default()
            },
            update_baseline_if_new: and_close.then_some(settings.update_baseline_if_new),
            update_baseline_if_different: and_close.then_some(settings.update_baseline_if_different),
            remove_session_if_matching: and_close.then_some(settings.remove_session_if_matching),
        }
    }

    /// Run the retry loop for an ordinary check. Returns the final match
    /// result together with the output of the last attempt; each re-capture
    /// sees the previous attempt's output as its diff base.
    pub async fn match_window(
        &self,
        settings: &CheckSettings,
        run_once_on_timeout: bool,
        last_output: Option<&AppOutput>,
    ) -> Result<(MatchResult, AppOutput)> {
        let timeout = self.retry_timeout(settings);

        if timeout.is_zero() || run_once_on_timeout {
            if run_once_on_timeout {
                tokio::time::sleep(timeout).await;
            }
            let output = self.capture.capture_output(settings, last_output).await?;
            let data = self.build_data(settings, &output, settings.ignore_mismatch, false);
            let result = self.exchange.perform_match(data).await?;
            return Ok((result, output));
        }

        let deadline = Instant::now() + timeout;
        let mut output = self.capture.capture_output(settings, last_output).await?;
        let data = self.build_data(settings, &output, true, false);
        let mut result = self.exchange.perform_match(data).await?;

        while !result.as_expected {
            tokio::time::sleep(MATCH_INTERVAL).await;
            if Instant::now() >= deadline {
                break;
            }
            output = self.capture.capture_output(settings, Some(&output)).await?;
            let data = self.build_data(settings, &output, true, false);
            result = self.exchange.perform_match(data).await?;
        }

        if !result.as_expected {
            debug!(tag = %settings.tag, "retry budget exhausted; binding attempt");
            output = self.capture.capture_output(settings, Some(&output)).await?;
            let data = self.build_data(settings, &output, settings.ignore_mismatch, false);
            result = self.exchange.perform_match(data).await?;
        }
        Ok((result, output))
    }

    /// Same loop, but the exchange finalizes the session on success. The
    /// success predicate is the absence of differences in the returned
    /// results.
    pub async fn match_window_and_close(
        &self,
        settings: &CheckSettings,
        run_once_on_timeout: bool,
        last_output: Option<&AppOutput>,
    ) -> Result<(TestResults, AppOutput)> {
        let timeout = self.retry_timeout(settings);

        if timeout.is_zero() || run_once_on_timeout {
            if run_once_on_timeout {
                tokio::time::sleep(timeout).await;
            }
            let output = self.capture.capture_output(settings, last_output).await?;
            let data = self.build_data(settings, &output, settings.ignore_mismatch, true);
            let results = self.exchange.perform_match_and_close(data).await?;
            return Ok((results, output));
        }

        let deadline = Instant::now() + timeout;
        let mut output = self.capture.capture_output(settings, last_output).await?;
        let data = self.build_data(settings, &output, true, true);
        let mut results = self.exchange.perform_match_and_close(data).await?;

        while results.is_different {
            tokio::time::sleep(MATCH_INTERVAL).await;
            if Instant::now() >= deadline {
                break;
            }
            output = self.capture.capture_output(settings, Some(&output)).await?;
            let data = self.build_data(settings, &output, true, true);
            results = self.exchange.perform_match_and_close(data).await?;
        }

        if results.is_different {
            output = self.capture.capture_output(settings, Some(&output)).await?;
            let data = self.build_data(settings, &output, settings.ignore_mismatch, true);
            results = self.exchange.perform_match_and_close(data).await?;
        }
        Ok((results, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct StaticCapture;

    #[async_trait]
    impl CaptureProvider for StaticCapture {
        async fn capture_output(
            &self,
            _settings: &CheckSettings,
            _last_output: Option<&AppOutput>,
        ) -> Result<AppOutput> {
            Ok(AppOutput::default())
        }
    }

    /// Records whether each capture was offered a diff base.
    struct BaseTrackingCapture {
        saw_base: Mutex<Vec<bool>>,
    }

    #[async_trait]
    impl CaptureProvider for BaseTrackingCapture {
        async fn capture_output(
            &self,
            _settings: &CheckSettings,
            last_output: Option<&AppOutput>,
        ) -> Result<AppOutput> {
            self.saw_base.lock().push(last_output.is_some());
            Ok(AppOutput::default())
        }
    }

    /// Answers `true` starting from the nth exchange.
    struct ScriptedExchange {
        calls: AtomicU32,
        succeed_from: u32,
        ignore_flags: Mutex<Vec<bool>>,
    }

    impl ScriptedExchange {
        fn new(succeed_from: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                succeed_from,
                ignore_flags: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MatchExchange for ScriptedExchange {
        async fn perform_match(&self, data: MatchWindowData) -> Result<MatchResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.ignore_flags.lock().push(data.ignore_mismatch);
            Ok(MatchResult {
                as_expected: call >= self.succeed_from,
                window_id: None,
            })
        }

        async fn perform_match_and_close(&self, data: MatchWindowData) -> Result<TestResults> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.ignore_flags.lock().push(data.ignore_mismatch);
            Ok(TestResults {
                is_different: call < self.succeed_from,
                ..TestResults::default()
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn first_success_stops_the_loop() {
        let exchange = ScriptedExchange::new(1);
        let task = MatchTask::new(&exchange, &StaticCapture, Duration::from_millis(2000));
        let settings = CheckSettings::default();

        let (result, _) = task.match_window(&settings, false, None).await.unwrap();
        assert!(result.as_expected);
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_mismatch_is_bounded_by_the_budget() {
        let exchange = ScriptedExchange::new(u32::MAX);
        let task = MatchTask::new(&exchange, &StaticCapture, Duration::from_millis(2000));
        let settings = CheckSettings::default();

        let (result, _) = task.match_window(&settings, false, None).await.unwrap();
        assert!(!result.as_expected);
        // ceil(2000 / 500) + 1 exchanges at most.
        assert!(exchange.calls() >= 1);
        assert!(exchange.calls() <= 5, "made {} exchanges", exchange.calls());

        // Every exchange but the last asked the server to ignore mismatch.
        let flags = exchange.ignore_flags.lock();
        assert!(flags[..flags.len() - 1].iter().all(|&ignored| ignored));
        assert!(!flags[flags.len() - 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn mid_loop_success_is_honored_without_final_exchange() {
        let exchange = ScriptedExchange::new(3);
        let task = MatchTask::new(&exchange, &StaticCapture, Duration::from_millis(5000));
        let settings = CheckSettings::default();

        let (result, _) = task.match_window(&settings, false, None).await.unwrap();
        assert!(result.as_expected);
        assert_eq!(exchange.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_timeout_is_a_single_honest_exchange() {
        let exchange = ScriptedExchange::new(u32::MAX);
        let task = MatchTask::new(&exchange, &StaticCapture, Duration::from_millis(2000));
        let settings = CheckSettings {
            retry_timeout_ms: 0,
            ..CheckSettings::default()
        };

        let (result, _) = task.match_window(&settings, false, None).await.unwrap();
        assert!(!result.as_expected);
        assert_eq!(exchange.calls(), 1);
        assert!(!exchange.ignore_flags.lock()[0]);
    }

    #[tokio::test(start_paused = true)]
    async fn run_once_waits_out_the_budget_then_matches_once() {
        let exchange = ScriptedExchange::new(1);
        let task = MatchTask::new(&exchange, &StaticCapture, Duration::from_millis(2000));
        let settings = CheckSettings::default();

        let started = Instant::now();
        let (result, _) = task.match_window(&settings, true, None).await.unwrap();
        assert!(result.as_expected);
        assert_eq!(exchange.calls(), 1);
        assert!(started.elapsed() >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn negative_timeout_uses_the_default() {
        let exchange = ScriptedExchange::new(u32::MAX);
        let task = MatchTask::new(&exchange, &StaticCapture, Duration::from_millis(600));
        let settings = CheckSettings {
            retry_timeout_ms: -1,
            ..CheckSettings::default()
        };

        let (_, _) = task.match_window(&settings, false, None).await.unwrap();
        // ceil(600 / 500) + 1 = 3.
        assert!(exchange.calls() <= 3, "made {} exchanges", exchange.calls());
    }

    #[tokio::test(start_paused = true)]
    async fn retries_carry_the_previous_output_as_diff_base() {
        let exchange = ScriptedExchange::new(3);
        let capture = BaseTrackingCapture {
            saw_base: Mutex::new(Vec::new()),
        };
        let task = MatchTask::new(&exchange, &capture, Duration::from_millis(5000));
        let settings = CheckSettings::default();

        task.match_window(&settings, false, None).await.unwrap();

        // The first capture has nothing to diff against; later ones do.
        let saw_base = capture.saw_base.lock();
        assert_eq!(*saw_base, vec![false, true, true]);
    }

    #[tokio::test(start_paused = true)]
    async fn and_close_retries_until_no_differences() {
        let exchange = ScriptedExchange::new(2);
        let task = MatchTask::new(&exchange, &StaticCapture, Duration::from_millis(2000));
        let settings = CheckSettings {
            update_baseline_if_new: true,
            ..CheckSettings::default()
        };

        let (results, _) = task.match_window_and_close(&settings, false, None).await.unwrap();
        assert!(!results.is_different);
        assert_eq!(exchange.calls(), 2);
    }
}
