//! Render orchestration
//!
//! Bounds how many renders a test keeps in flight, submits jobs to the
//! rendering service, and polls their status on a tiered schedule until
//! they settle. Waiting cooperates with cancellation so a failed sibling
//! can stop work that has not started.

use ocular_common::{
    AccessibilityRegion, AccessibilityRegionType, Error, FloatingRegion, Location, Region, Result,
};
use ocular_transport::{
    retry::{schedule_delay, DELAY_BEFORE_POLLING},
    RenderRequest, RenderStatus, RenderStatusResult, ServerClient,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Overall bound on waiting for one render to settle.
const RENDER_STATUS_DEADLINE: Duration = Duration::from_secs(3600);

/// A submitted render. Holds its throat permit until dropped, so the
/// orchestrator's concurrency bound covers the full render lifetime.
pub struct RenderHandle {
    pub render_id: String,
    _permit: OwnedSemaphorePermit,
}

pub struct RenderOrchestrator {
    client: Arc<ServerClient>,
    throat: Arc<Semaphore>,
    queued: Arc<AtomicUsize>,
}

impl RenderOrchestrator {
    pub fn new(
        client: Arc<ServerClient>,
        concurrent_renders_per_test: usize,
        browser_count: usize,
        queued: Arc<AtomicUsize>,
    ) -> Self {
        let permits = concurrent_renders_per_test.max(1) * browser_count.max(1);
        Self {
            client,
            throat: Arc::new(Semaphore::new(permits)),
            queued,
        }
    }

    /// Submit one render job. Waits for a throat permit first (FIFO), so
    /// submission order is dispatch order. An error here means the
    /// rendering service rejected the job outright.
    pub async fn submit(&self, request: RenderRequest) -> Result<RenderHandle> {
        self.queued.fetch_add(1, Ordering::SeqCst);
        let permit = Arc::clone(&self.throat).acquire_owned().await;
        self.queued.fetch_sub(1, Ordering::SeqCst);
        let permit = permit.map_err(|_| Error::Render("render throat closed".into()))?;

        let renders = self
            .client
            .render(std::slice::from_ref(&request))
            .await
            .map_err(|e| Error::Render(e.to_string()))?;
        let running = renders
            .into_iter()
            .next()
            .ok_or_else(|| Error::Render("rendering service returned no job".into()))?;
        if running.render_status == Some(RenderStatus::NeedMoreResources) {
            // The mapping phase uploads everything beforehand; reaching this
            // means a resource upload was lost.
            return Err(Error::Render(format!(
                "render {} rejected for missing resources",
                running.render_id
            )));
        }
        debug!(render_id = %running.render_id, "render submitted");
        Ok(RenderHandle {
            render_id: running.render_id,
            _permit: permit,
        })
    }

    /// Poll until the render settles. Rendered resolves to the status
    /// payload (screenshot and DOM locations, selector regions); a render
    /// error stays local to this render. Cancellation is checked between
    /// polls.
    pub async fn wait_for_rendered(
        &self,
        handle: &RenderHandle,
        cancel: &CancellationToken,
    ) -> Result<RenderStatusResult> {
        let started = Instant::now();
        let mut attempt = 0usize;

        loop {
            let delay = schedule_delay(DELAY_BEFORE_POLLING, attempt);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Aborted),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;

            let mut statuses = self
                .client
                .render_status(std::slice::from_ref(&handle.render_id))
                .await
                .map_err(|e| Error::RenderStatus(e.to_string()))?;
            let status = if statuses.is_empty() {
                RenderStatusResult::default()
            } else {
                statuses.swap_remove(0)
            };

            match status.status {
                Some(RenderStatus::Rendered) => {
                    debug!(render_id = %handle.render_id, attempt, "rendered");
                    return Ok(status);
                }
                Some(RenderStatus::Error) | Some(RenderStatus::InternalFailure) => {
                    let reason = status
                        .error
                        .unwrap_or_else(|| "render failed without detail".to_string());
                    warn!(render_id = %handle.render_id, %reason, "render failed");
                    return Err(Error::RenderStatus(reason));
                }
                _ => {}
            }

            if started.elapsed() > RENDER_STATUS_DEADLINE {
                return Err(Error::Timeout {
                    ms: RENDER_STATUS_DEADLINE.as_millis() as u64,
                });
            }
        }
    }
}

/// Where a match region comes from: given literally at check time, or
/// located in the rendered page by selector (an index into the render
/// request's selector list).
#[derive(Debug, Clone, Copy)]
pub enum RegionSource {
    Literal(Region),
    Selector(usize),
}

#[derive(Debug, Clone, Copy)]
pub struct FloatingSource {
    pub source: RegionSource,
    pub max_up_offset: u32,
    pub max_down_offset: u32,
    pub max_left_offset: u32,
    pub max_right_offset: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AccessibilitySource {
    pub source: RegionSource,
    pub region_type: AccessibilityRegionType,
}

/// Region inputs for one check, per match category.
#[derive(Debug, Clone, Default)]
pub struct RegionRequests {
    pub ignore: Vec<RegionSource>,
    pub layout: Vec<RegionSource>,
    pub strict: Vec<RegionSource>,
    pub content: Vec<RegionSource>,
    pub floating: Vec<FloatingSource>,
    pub accessibility: Vec<AccessibilitySource>,
}

/// Concrete regions in screenshot coordinates, ready for match settings.
#[derive(Debug, Clone, Default)]
pub struct ResolvedRegions {
    pub ignore: Vec<Region>,
    pub layout: Vec<Region>,
    pub strict: Vec<Region>,
    pub content: Vec<Region>,
    pub floating: Vec<FloatingRegion>,
    pub accessibility: Vec<AccessibilityRegion>,
}

/// Turn region sources into concrete screenshot regions. Selector matches
/// come back in page coordinates; the image offset shifts them into
/// screenshot space, clamped at zero, and each category is sorted by
/// (top, left) for stable baselines.
pub fn resolve_regions(
    requests: &RegionRequests,
    selector_regions: &[Vec<Region>],
    image_offset: Location,
) -> ResolvedRegions {
    let expand = |source: &RegionSource| -> Vec<Region> {
        match source {
            RegionSource::Literal(region) => vec![*region],
            RegionSource::Selector(index) => selector_regions
                .get(*index)
                .map(|regions| {
                    regions
                        .iter()
                        .map(|region| region.offset_by(image_offset))
                        .collect()
                })
                .unwrap_or_default(),
        }
    };
    let expand_all = |sources: &[RegionSource]| -> Vec<Region> {
        let mut regions: Vec<Region> = sources.iter().flat_map(|s| expand(s)).collect();
        regions.sort_by_key(|r| (r.top, r.left));
        regions
    };

    let mut floating: Vec<FloatingRegion> = requests
        .floating
        .iter()
        .flat_map(|f| {
            expand(&f.source).into_iter().map(move |region| FloatingRegion {
                region,
                max_up_offset: f.max_up_offset,
                max_down_offset: f.max_down_offset,
                max_left_offset: f.max_left_offset,
                max_right_offset: f.max_right_offset,
            })
        })
        .collect();
    floating.sort_by_key(|f| (f.region.top, f.region.left));

    let mut accessibility: Vec<AccessibilityRegion> = requests
        .accessibility
        .iter()
        .flat_map(|a| {
            expand(&a.source).into_iter().map(move |region| AccessibilityRegion {
                region,
                region_type: a.region_type,
            })
        })
        .collect();
    accessibility.sort_by_key(|a| (a.region.top, a.region.left));

    ResolvedRegions {
        ignore: expand_all(&requests.ignore),
        layout: expand_all(&requests.layout),
        strict: expand_all(&requests.strict),
        content: expand_all(&requests.content),
        floating,
        accessibility,
    }
}
