//! Wire payloads for the baseline and rendering services

use ocular_common::{
    AppOutput, ImageMatchSettings, Location, Region, SessionStartInfo,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Body of the start-session call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    pub start_info: SessionStartInfo,
}

/// A recorded user-input trigger forwarded with match requests
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub trigger_type: String,
    pub control: Region,
    pub location: Location,
}

/// Options attached to one match exchange
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMatchOptions {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub render_id: Option<String>,
    pub ignore_mismatch: bool,
    pub ignore_match: bool,
    pub force_mismatch: bool,
    pub force_match: bool,
    pub image_match_settings: ImageMatchSettings,
    pub user_inputs: Vec<Trigger>,
}

/// One comparison request. Created fresh per check call; never reused.
///
/// The baseline-update fields are only populated on the match-and-close
/// variant, which finalizes the session in the same request.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchWindowData {
    pub user_inputs: Vec<Trigger>,
    pub app_output: AppOutput,
    pub tag: String,
    pub ignore_mismatch: bool,
    pub options: ImageMatchOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_baseline_if_new: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_baseline_if_different: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remove_session_if_matching: Option<bool>,
}

/// Rendering-service connection details returned by the baseline service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderingInfo {
    pub service_url: String,
    pub access_token: String,
    pub results_url: String,
    #[serde(default)]
    pub stitching_service_url: Option<String>,
}

/// Content hash reference for an uploaded resource, or the error status the
/// fetch ended with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_status_code: Option<u16>,
}

impl ResourceRef {
    pub fn sha256(hash: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            hash_format: Some("sha256".into()),
            hash: Some(hash.into()),
            content_type: Some(content_type.into()),
            error_status_code: None,
        }
    }

    pub fn error(status: u16) -> Self {
        Self {
            error_status_code: Some(status),
            ..Default::default()
        }
    }
}

/// A selector the rendering service must locate in the rendered DOM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectorSpec {
    #[serde(rename = "type")]
    pub selector_type: String,
    pub selector: String,
}

impl SelectorSpec {
    pub fn css(selector: impl Into<String>) -> Self {
        Self {
            selector_type: "css".into(),
            selector: selector.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderPlatform {
    pub name: String,
    #[serde(rename = "type")]
    pub platform_type: String,
}

impl Default for RenderPlatform {
    fn default() -> Self {
        Self {
            name: "linux".to_string(),
            platform_type: "web".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderBrowser {
    pub name: String,
}

/// Geometry for one render: viewport plus optional target selector/region
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderTarget {
    pub width: u32,
    pub height: u32,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<SelectorSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<Region>,
}

impl Default for RenderTarget {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            target: "full-page".to_string(),
            selector: None,
            region: None,
        }
    }
}

/// One (browser-config x page-snapshot) rendering job descriptor
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    pub webhook: String,
    pub url: String,
    pub platform: RenderPlatform,
    pub browser: RenderBrowser,
    pub render_info: RenderTarget,
    /// DOM resource hash; filled once the resource pipeline completes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<ResourceRef>,
    pub resources: HashMap<String, ResourceRef>,
    pub selectors_to_find_regions_for: Vec<SelectorSpec>,
    pub send_dom: bool,
    pub agent_id: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub options: HashMap<String, serde_json::Value>,
}

/// Render-job handle returned by the render submit call
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningRender {
    pub render_id: String,
    #[serde(default)]
    pub render_status: Option<RenderStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderStatus {
    Rendering,
    Rendered,
    Error,
    NeedMoreResources,
    InternalFailure,
}

/// Result of one render-status poll for one render id
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RenderStatusResult {
    pub status: Option<RenderStatus>,
    pub error: Option<String>,
    pub image_location: Option<String>,
    pub dom_location: Option<String>,
    /// Located regions per requested selector, in request order
    pub selector_regions: Option<Vec<Vec<Region>>>,
    pub image_position_in_active_frame: Option<Location>,
}

impl RenderStatusResult {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            Some(RenderStatus::Rendered) | Some(RenderStatus::Error) | Some(RenderStatus::InternalFailure)
        )
    }
}
