//! Grid-backed checks
//!
//! One logical test fans out to a sibling session per configured browser.
//! Each check renders the captured snapshot remotely, waits for the render
//! to settle, then finalizes the match in submission order. A submission
//! failure is fatal for every sibling; a render failure stays local to its
//! browser.

use crate::controller::{GlobalState, TestController};
use crate::match_task::{CaptureProvider, CheckSettings};
use crate::session::{SessionCore, SessionState};
use crate::step_queue::{StepQueue, StepTicket};
use async_trait::async_trait;
use ocular_common::{
    sanitize_browser_name, AppOutput, BrowserInfo, Config, Error, Result, SessionType, TestResults,
};
use ocular_grid::fetch::FetchOptions;
use ocular_grid::render::{RegionRequests, RenderOrchestrator, ResolvedRegions};
use ocular_grid::{create_resource_mapping, DomSnapshot, ResourceFetcher, ResourceStore, ResourceUploader};
use ocular_transport::{
    RenderBrowser, RenderPlatform, RenderRequest, RenderTarget, SelectorSpec, ServerClient,
};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Check inputs specific to grid rendering: the snapshot to render plus
/// selector-located regions.
#[derive(Clone, Default)]
pub struct GridCheckSettings {
    pub base: CheckSettings,
    pub selectors: Vec<SelectorSpec>,
    pub regions: RegionRequests,
    pub send_dom: bool,
    pub fetch: FetchOptions,
}

struct BrowserSlot {
    info: BrowserInfo,
    session: Arc<Mutex<SessionCore>>,
    steps: Arc<StepQueue>,
}

/// A logical test running once per browser against the rendering grid.
pub struct GridTest {
    client: Arc<ServerClient>,
    config: Config,
    controller: Arc<TestController>,
    orchestrator: Arc<RenderOrchestrator>,
    fetcher: Arc<ResourceFetcher>,
    store: Arc<ResourceStore>,
    uploader: Arc<ResourceUploader>,
    slots: Vec<BrowserSlot>,
    pending: Vec<JoinHandle<()>>,
}

impl GridTest {
    pub fn new(
        client: Arc<ServerClient>,
        config: Config,
        store: Arc<ResourceStore>,
        global: &GlobalState,
    ) -> Result<Self> {
        let browsers = if config.browsers.is_empty() {
            vec![BrowserInfo::new("chrome", 1024, 768)]
        } else {
            config.browsers.clone()
        };
        let controller = Arc::new(TestController::new(browsers.len()));
        let orchestrator = Arc::new(RenderOrchestrator::new(
            Arc::clone(&client),
            config.concurrent_renders_per_test,
            browsers.len(),
            global.queued_renders(),
        ));
        let fetcher = Arc::new(ResourceFetcher::new(config.proxy.as_deref(), config.accept_invalid_certs)?);
        let uploader = Arc::new(ResourceUploader::new(
            Arc::clone(&client),
            Arc::clone(&store),
        ));
        let slots = browsers
            .into_iter()
            .map(|info| BrowserSlot {
                info,
                session: Arc::new(Mutex::new(SessionCore::new(
                    Arc::clone(&client),
                    config.clone(),
                ))),
                steps: Arc::new(StepQueue::new()),
            })
            .collect();
        Ok(Self {
            client,
            config,
            controller,
            orchestrator,
            fetcher,
            store,
            uploader,
            slots,
            pending: Vec::new(),
        })
    }

    pub fn controller(&self) -> Arc<TestController> {
        Arc::clone(&self.controller)
    }

    pub fn browser_count(&self) -> usize {
        self.slots.len()
    }

    pub fn batch_id(&self) -> String {
        self.config.batch.id.clone()
    }

    pub fn browsers(&self) -> Vec<BrowserInfo> {
        self.slots.iter().map(|slot| slot.info.clone()).collect()
    }

    /// Open a sibling session per browser, each with its own viewport.
    pub async fn open(&mut self, app_name: &str, test_name: &str) -> Result<()> {
        for slot in &self.slots {
            slot.session
                .lock()
                .await
                .open(
                    app_name,
                    test_name,
                    Some(slot.info.viewport()),
                    SessionType::Sequential,
                )
                .await?;
        }
        Ok(())
    }

    /// Queue one check against every browser. Returns once the work is
    /// scheduled; failures land in the controller, and close reports them.
    pub fn check(&mut self, snapshot: DomSnapshot, settings: GridCheckSettings) {
        let snapshot = Arc::new(snapshot);
        for (index, slot) in self.slots.iter().enumerate() {
            // Tickets must be claimed here, in call order, not inside the
            // spawned task.
            let ticket = slot.steps.begin_step();
            let task = BrowserCheck {
                index,
                browser: slot.info.clone(),
                session: Arc::clone(&slot.session),
                controller: Arc::clone(&self.controller),
                orchestrator: Arc::clone(&self.orchestrator),
                fetcher: Arc::clone(&self.fetcher),
                store: Arc::clone(&self.store),
                uploader: Arc::clone(&self.uploader),
                client: Arc::clone(&self.client),
                agent_id: self.config.agent_id.clone(),
                snapshot: Arc::clone(&snapshot),
                settings: settings.clone(),
            };
            self.pending.push(tokio::spawn(task.run(ticket)));
        }
    }

    /// Wait until every queued check has settled.
    pub async fn wait_for_checks(&mut self) {
        for task in self.pending.drain(..) {
            if let Err(join_error) = task.await {
                warn!(%join_error, "check task panicked");
            }
        }
    }

    /// Close every sibling. An index with a recorded error is aborted
    /// instead, and the error is returned in its place.
    pub async fn close_all(&mut self, throw_ex: bool) -> Vec<std::result::Result<TestResults, Arc<Error>>> {
        self.wait_for_checks().await;

        let mut outcomes = Vec::with_capacity(self.slots.len());
        for (index, slot) in self.slots.iter().enumerate() {
            let mut session = slot.session.lock().await;
            match self.controller.error_for(index) {
                Some(error) => {
                    if !self.controller.should_skip_abort(index) {
                        session.abort().await;
                    }
                    outcomes.push(Err(error));
                }
                None => {
                    let closed = session.close(throw_ex).await.map_err(Arc::new);
                    let outcome = closed.map(|mut results| {
                        // Results carry the renders that produced them.
                        let render_ids = self.controller.render_ids(index);
                        for (step, render_id) in results.steps_info.iter_mut().zip(render_ids) {
                            step.render_id = Some(render_id);
                        }
                        results
                    });
                    outcomes.push(outcome);
                }
            }
        }
        outcomes
    }

    /// Abort every sibling, once.
    pub async fn abort_all(&mut self) -> Vec<Option<TestResults>> {
        self.controller.set_aborted_by_user();
        self.wait_for_checks().await;
        let mut aborted = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            aborted.push(slot.session.lock().await.abort().await);
        }
        aborted
    }

    pub async fn is_open(&self) -> bool {
        for slot in &self.slots {
            if slot.session.lock().await.state() == SessionState::Open {
                return true;
            }
        }
        false
    }
}

struct BrowserCheck {
    index: usize,
    browser: BrowserInfo,
    session: Arc<Mutex<SessionCore>>,
    controller: Arc<TestController>,
    orchestrator: Arc<RenderOrchestrator>,
    fetcher: Arc<ResourceFetcher>,
    store: Arc<ResourceStore>,
    uploader: Arc<ResourceUploader>,
    client: Arc<ServerClient>,
    agent_id: String,
    snapshot: Arc<DomSnapshot>,
    settings: GridCheckSettings,
}

impl BrowserCheck {
    async fn run(self, mut ticket: StepTicket) {
        let cancel = self.controller.token(self.index);
        if cancel.is_cancelled() {
            return;
        }

        // The remote session must exist before anything renders on its
        // behalf.
        if let Err(error) = self.session.lock().await.ensure_running().await {
            self.controller.set_error(self.index, error);
            return;
        }

        // Unknown browsers get no browser-dependent id suffix.
        let browser_name =
            Some(sanitize_browser_name(&self.browser.name)).filter(|name| !name.is_empty());
        let mapping = match create_resource_mapping(
            &self.snapshot,
            browser_name,
            &self.fetcher,
            &self.store,
            &self.uploader,
            &self.settings.fetch,
        )
        .await
        {
            Ok(mapping) => mapping,
            Err(error) => {
                self.controller.set_error(self.index, error);
                return;
            }
        };

        if cancel.is_cancelled() {
            return;
        }

        let rendering_info = match self.client.render_info().await {
            Ok(info) => info,
            Err(error) => {
                // Without render info the remote session never saw a step;
                // aborting it would only add a second failure.
                self.controller.set_skip_abort(self.index);
                self.controller.set_fatal(error);
                return;
            }
        };
        let request = RenderRequest {
            webhook: rendering_info.results_url.clone(),
            url: self.snapshot.url.clone(),
            platform: RenderPlatform {
                name: self.browser.platform.clone().unwrap_or_else(|| "linux".to_string()),
                platform_type: "web".to_string(),
            },
            browser: RenderBrowser {
                name: self.browser.name.clone(),
            },
            render_info: RenderTarget {
                width: self.browser.width,
                height: self.browser.height,
                ..RenderTarget::default()
            },
            snapshot: Some(mapping.dom.clone()),
            resources: mapping.resources.clone(),
            selectors_to_find_regions_for: self.settings.selectors.clone(),
            send_dom: self.settings.send_dom,
            agent_id: self.agent_id.clone(),
            options: Default::default(),
        };

        // A rejected submission poisons the whole test: siblings would
        // submit the same job and fail the same way.
        let handle = match self.orchestrator.submit(request).await {
            Ok(handle) => handle,
            Err(error) => {
                warn!(index = self.index, %error, "render submission failed");
                self.controller.set_fatal(error);
                return;
            }
        };
        self.controller
            .add_render_id(self.index, handle.render_id.clone());

        if cancel.is_cancelled() {
            return;
        }

        let status = match self.orchestrator.wait_for_rendered(&handle, &cancel).await {
            Ok(status) => status,
            Err(Error::Aborted) => return,
            Err(error) => {
                self.controller.set_error(self.index, error);
                return;
            }
        };

        // Preserve check call order per browser, whatever order renders
        // finished in.
        ticket.wait_for_predecessor().await;
        if cancel.is_cancelled() {
            return;
        }

        let selector_regions = status.selector_regions.clone().unwrap_or_default();
        let offset = status.image_position_in_active_frame.unwrap_or_default();
        let resolved = ocular_grid::render::resolve_regions(&self.settings.regions, &selector_regions, offset);

        let mut settings = self.settings.base.clone();
        settings.render_id = Some(handle.render_id.clone());
        apply_regions(&mut settings, resolved);

        let capture = RenderedCapture {
            output: AppOutput {
                title: String::new(),
                screenshot_url: status.image_location.clone(),
                screenshot_bytes: None,
                dom_url: status.dom_location.clone(),
                location: status.image_position_in_active_frame,
            },
        };
        let checked = self.session.lock().await.check(settings, &capture).await;
        match checked {
            Ok(result) => {
                debug!(index = self.index, as_expected = result.as_expected, "step finalized")
            }
            Err(error) => self.controller.set_error(self.index, error),
        }
    }
}

fn apply_regions(settings: &mut CheckSettings, resolved: ResolvedRegions) {
    settings.match_settings.ignore = resolved.ignore;
    settings.match_settings.layout = resolved.layout;
    settings.match_settings.strict = resolved.strict;
    settings.match_settings.content = resolved.content;
    settings.match_settings.floating = resolved.floating;
    settings.match_settings.accessibility = resolved.accessibility;
}

/// Capture provider that replays a finished render's output.
struct RenderedCapture {
    output: AppOutput,
}

#[async_trait]
impl CaptureProvider for RenderedCapture {
    async fn capture_output(
        &self,
        _settings: &CheckSettings,
        _last_output: Option<&AppOutput>,
    ) -> Result<AppOutput> {
        Ok(self.output.clone())
    }
}
