//! Core types shared across the Ocular workspace

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal status of a test session as reported (or inferred) at close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestStatus {
    Passed,
    Unresolved,
    Failed,
}

/// A step (one check call) in a finished test, as reported by the server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StepInfo {
    pub name: Option<String>,
    pub is_different: bool,
    pub render_id: Option<String>,
}

/// Terminal outcome of a session. Created once at close/abort, immutable
/// thereafter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestResults {
    pub id: Option<String>,
    pub name: String,
    pub app_name: String,
    pub status: Option<TestStatus>,
    pub is_new: bool,
    pub is_different: bool,
    /// True when the session ended without ever starting a remote session
    /// (no viewport resolved, or zero checks). Never a server round-trip.
    #[serde(skip)]
    pub is_empty: bool,
    pub url: Option<String>,
    pub batch_id: Option<String>,
    pub matches: u32,
    pub mismatches: u32,
    pub missing: u32,
    pub steps_info: Vec<StepInfo>,
    pub duration_ms: Option<u64>,
}

impl TestResults {
    /// Empty results for a test that never started a remote session.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_empty: true,
            status: Some(TestStatus::Passed),
            ..Default::default()
        }
    }

    /// Backfill a missing status for outdated servers: no missing steps and
    /// no mismatches means the test passed, anything else is unresolved.
    pub fn classify(&mut self) {
        if self.status.is_none() {
            self.status = if self.missing == 0 && self.mismatches == 0 {
                Some(TestStatus::Passed)
            } else {
                Some(TestStatus::Unresolved)
            };
        }
    }

    pub fn is_passed(&self) -> bool {
        self.status == Some(TestStatus::Passed)
    }

    /// Review URL for human-readable error messages.
    pub fn review_url(&self) -> &str {
        self.url.as_deref().unwrap_or("<no URL>")
    }
}

/// Server-assigned handle for one test's remote execution context.
/// Immutable once created; destroyed server-side by stop session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningSession {
    pub id: String,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub baseline_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Outcome of one match-window exchange
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchResult {
    pub as_expected: bool,
    pub window_id: Option<String>,
}

/// Viewport or device size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RectangleSize {
    pub width: u32,
    pub height: u32,
}

impl RectangleSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// A point in screenshot coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub x: i32,
    pub y: i32,
}

/// A rectangular region in screenshot coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Shift by an image offset, clamping coordinates at zero.
    pub fn offset_by(&self, offset: Location) -> Region {
        Region {
            left: (self.left - offset.x).max(0),
            top: (self.top - offset.y).max(0),
            ..*self
        }
    }
}

/// How strictly a capture must match its baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchLevel {
    None,
    Layout,
    Content,
    Strict,
    Exact,
}

impl Default for MatchLevel {
    fn default() -> Self {
        MatchLevel::Strict
    }
}

/// A region that may drift within bounded offsets and still match
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FloatingRegion {
    #[serde(flatten)]
    pub region: Region,
    pub max_up_offset: u32,
    pub max_down_offset: u32,
    pub max_left_offset: u32,
    pub max_right_offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessibilityRegionType {
    IgnoreContrast,
    RegularText,
    LargeText,
    BoldText,
    GraphicalObject,
}

/// A region checked against accessibility guidelines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessibilityRegion {
    #[serde(flatten)]
    pub region: Region,
    #[serde(rename = "type")]
    pub region_type: AccessibilityRegionType,
}

/// Per-window match settings sent with every match exchange
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageMatchSettings {
    pub match_level: MatchLevel,
    pub ignore: Vec<Region>,
    pub layout: Vec<Region>,
    pub strict: Vec<Region>,
    pub content: Vec<Region>,
    pub floating: Vec<FloatingRegion>,
    pub accessibility: Vec<AccessibilityRegion>,
    pub use_dom: bool,
    pub enable_patterns: bool,
    pub ignore_displacements: bool,
    pub ignore_caret: bool,
}

/// One browser/viewport permutation of a logical test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserInfo {
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub platform: Option<String>,
}

impl BrowserInfo {
    pub fn new(name: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            width,
            height,
            platform: None,
        }
    }

    pub fn viewport(&self) -> RectangleSize {
        RectangleSize::new(self.width, self.height)
    }
}

/// Canonical browser family name, used to discriminate browser-dependent
/// resources (e.g. web fonts served per user agent).
pub fn sanitize_browser_name(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if lower == "ie" || lower == "ie10" || lower == "ie11" {
        "IE"
    } else if lower.contains("edgechromium") {
        "Edgechromium"
    } else if lower.contains("edge") {
        "Edge"
    } else if lower.contains("chrome") {
        "Chrome"
    } else if lower.contains("firefox") {
        "Firefox"
    } else if lower.contains("safari") {
        "Safari"
    } else {
        ""
    }
}

/// Batch grouping for related tests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchInfo {
    pub id: String,
    pub name: Option<String>,
    pub sequence_name: Option<String>,
    #[serde(default)]
    pub notify_on_completion: bool,
    /// True when the id was generated locally rather than supplied.
    #[serde(skip)]
    pub is_generated_id: bool,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl BatchInfo {
    pub fn new(name: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name,
            sequence_name: None,
            notify_on_completion: false,
            is_generated_id: true,
            started_at: chrono::Utc::now(),
        }
    }

    pub fn with_id(id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            id: id.into(),
            name,
            sequence_name: None,
            notify_on_completion: false,
            is_generated_id: false,
            started_at: chrono::Utc::now(),
        }
    }
}

impl Default for BatchInfo {
    fn default() -> Self {
        Self::new(None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionType {
    Sequential,
    Progression,
}

impl Default for SessionType {
    fn default() -> Self {
        SessionType::Sequential
    }
}

/// When mismatch failures are raised: at close (default) or synchronously
/// inside the check call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReports {
    OnClose,
    Immediate,
}

impl Default for FailureReports {
    fn default() -> Self {
        FailureReports::OnClose
    }
}

/// Application output captured for one check: a screenshot reference
/// (pre-uploaded URL or inline bytes) with optional DOM snapshot location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppOutput {
    pub title: String,
    pub screenshot_url: Option<String>,
    /// Inline image bytes; when present the transport switches the match
    /// request body to octet-stream framing.
    #[serde(skip)]
    pub screenshot_bytes: Option<Vec<u8>>,
    pub dom_url: Option<String>,
    pub location: Option<Location>,
}

/// Environment descriptor sent at session start
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppEnvironment {
    pub os: Option<String>,
    pub hosting_app: Option<String>,
    pub display_size: Option<RectangleSize>,
    pub inferred: Option<String>,
}

/// Start-session descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartInfo {
    pub agent_id: String,
    pub app_id_or_name: String,
    pub scenario_id_or_name: String,
    pub batch_info: BatchInfo,
    pub environment: AppEnvironment,
    pub default_match_settings: ImageMatchSettings,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub parent_branch_name: Option<String>,
    #[serde(default)]
    pub baseline_branch_name: Option<String>,
    #[serde(default)]
    pub baseline_env_name: Option<String>,
    #[serde(default)]
    pub save_diffs: bool,
    pub session_type: SessionType,
}
