//! Rendering collaborator: turns a URL and a [`CapturePlan`] into artifacts.
//!
//! [`ChromeRenderer`] drives one headless Chrome through chromiumoxide. The
//! browser is shared by every worker and relaunched when its CDP handler dies
//! or it keeps failing to open pages. Each job runs in its own browser context
//! (no cookies or storage shared between users) with the plan's device
//! emulation, and configured resource types are failed at the network layer.

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetTouchEmulationEnabledParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::fetch::{
    ContinueRequestParams, EnableParams, EventRequestPaused, FailRequestParams,
};
use chromiumoxide::cdp::browser_protocol::network::ErrorReason;
use chromiumoxide::cdp::browser_protocol::page::{CaptureScreenshotFormat, PrintToPdfParams};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use image::codecs::jpeg::JpegEncoder;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};

use crate::{
    format_bytes, format_duration, slice_offsets, CaptureConfig, CaptureError, CapturePlan,
    PageStrategy,
};

const PRE_SCROLL_STEP_PX: u32 = 1_200;
const PRE_SCROLL_PAUSE: Duration = Duration::from_millis(50);
const SLICE_SETTLE: Duration = Duration::from_millis(120);

/// Consecutive failures to open a page after which the browser is replaced.
const MAX_BROWSER_FAILURES: u32 = 3;

/// A4 in inches.
const A4_WIDTH_IN: f64 = 8.27;
const A4_HEIGHT_IN: f64 = 11.69;

const HIDE_OVERLAYS_CSS: &str = r#"
html, body { scroll-behavior: auto !important; }
[id*="cookie" i], [class*="cookie" i],
[id*="consent" i], [class*="consent" i],
#consent, .fc-consent-root, .qc-cmp2-container, .osano-cm-dialog,
.sp_choice_type_11, .cc-window, .cc-banner,
.ad-banner, .ads-banner, .advert, .advertisement, .ad-container {
    opacity: .0001 !important;
    pointer-events: none !important;
}
"#;

const CONTENT_HEIGHT_JS: &str = "Math.max(document.documentElement.scrollHeight, document.body ? document.body.scrollHeight : 0)";

/// One deliverable produced by a capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub filename: String,
    pub mime: String,
}

impl Artifact {
    pub fn png(bytes: Vec<u8>, filename: impl Into<String>) -> Self {
        Self {
            bytes,
            filename: filename.into(),
            mime: "image/png".to_string(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render `url` according to `plan`, returning artifacts in delivery order.
    async fn render(&self, url: &str, plan: &CapturePlan) -> Result<Vec<Artifact>, CaptureError>;
}

/// Chrome command line for the shared capture browser.
pub fn chrome_args() -> Vec<String> {
    let unique_id = format!("{}-{}", std::process::id(), uuid::Uuid::new_v4());

    vec![
        "--headless".to_string(),
        "--no-sandbox".to_string(),
        "--disable-setuid-sandbox".to_string(),
        "--disable-dev-shm-usage".to_string(),
        "--disable-gpu".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-extensions".to_string(),
        "--disable-default-apps".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--hide-scrollbars".to_string(),
        "--memory-pressure-off".to_string(),
        format!("--user-data-dir=/tmp/shotqueue-chrome-{unique_id}"),
    ]
}

fn browser_config(config: &CaptureConfig) -> Result<BrowserConfig, CaptureError> {
    let mut builder = BrowserConfig::builder().args(chrome_args());

    if let Some(chrome_path) = &config.chrome_path {
        builder = builder.chrome_executable(chrome_path);
    }

    builder
        .build()
        .map_err(|e| CaptureError::Configuration(format!("browser config: {e}")))
}

/// Whether a browser should be replaced before serving the next job.
pub fn needs_relaunch(handler_finished: bool, consecutive_failures: u32) -> bool {
    handler_finished || consecutive_failures >= MAX_BROWSER_FAILURES
}

/// Whether a paused request of `resource_type` (CDP name, e.g. `WebSocket`)
/// is on the block list.
pub fn is_blocked_resource(resource_type: &str, blocked: &[String]) -> bool {
    blocked
        .iter()
        .any(|kind| kind.trim().eq_ignore_ascii_case(resource_type))
}

/// One launched browser and the task polling its CDP handler.
struct ChromeSession {
    browser: Browser,
    handler: JoinHandle<()>,
    failure_count: u32,
}

impl ChromeSession {
    async fn launch(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let (browser, mut handler) = Browser::launch(browser_config(config)?)
            .await
            .map_err(|e| CaptureError::Browser(format!("launch failed: {e}")))?;

        // The CDP handler is a stream that must be polled for the browser to make progress.
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    error!("Browser handler error: {}", e);
                    break;
                }
            }
            info!("Browser handler stream ended");
        });

        Ok(Self {
            browser,
            handler,
            failure_count: 0,
        })
    }

    fn needs_relaunch(&self) -> bool {
        needs_relaunch(self.handler.is_finished(), self.failure_count)
    }

    /// Fresh incognito-style context and a blank page inside it.
    async fn open_isolated_page(&self) -> Result<(Page, BrowserContextId), CaptureError> {
        let context_id = self
            .browser
            .execute(CreateBrowserContextParams::default())
            .await?
            .result
            .browser_context_id;

        let mut target = CreateTargetParams::new("about:blank");
        target.browser_context_id = Some(context_id.clone());

        match self.browser.new_page(target).await {
            Ok(page) => Ok((page, context_id)),
            Err(e) => {
                self.dispose_context(context_id).await;
                Err(e.into())
            }
        }
    }

    async fn dispose_context(&self, context_id: BrowserContextId) {
        if let Err(e) = self
            .browser
            .execute(DisposeBrowserContextParams::new(context_id))
            .await
        {
            debug!("Browser context disposal failed: {}", e);
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.browser.close().await {
            warn!("Browser close failed: {}", e);
        }
        self.handler.abort();
    }
}

/// Aborts the wrapped task when dropped, so an interrupted capture cannot
/// leave it running.
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct ChromeRenderer {
    session: Mutex<ChromeSession>,
    config: CaptureConfig,
}

impl ChromeRenderer {
    pub async fn launch(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let session = ChromeSession::launch(config).await?;

        info!("Chrome renderer ready");
        Ok(Self {
            session: Mutex::new(session),
            config: config.clone(),
        })
    }

    pub async fn shutdown(&self) {
        info!("Shutting down Chrome renderer...");
        self.session.lock().await.close().await;
    }

    /// Open a page in a new context, relaunching the browser first when it is
    /// unhealthy.
    async fn open_page(&self) -> Result<(Page, BrowserContextId), CaptureError> {
        let mut session = self.session.lock().await;

        if session.needs_relaunch() {
            warn!(
                "Chrome unhealthy (handler finished: {}, failures: {}), relaunching",
                session.handler.is_finished(),
                session.failure_count
            );
            session.close().await;
            *session = ChromeSession::launch(&self.config).await?;
            info!("Chrome relaunched");
        }

        match session.open_isolated_page().await {
            Ok(opened) => {
                session.failure_count = 0;
                Ok(opened)
            }
            Err(e) => {
                session.failure_count += 1;
                Err(e)
            }
        }
    }

    async fn release_page(&self, page: Page, context_id: BrowserContextId) {
        if let Err(e) = page.close().await {
            debug!("Page close failed: {}", e);
        }
        self.session.lock().await.dispose_context(context_id).await;
    }

    /// Pause every request through the Fetch domain and fail the blocked
    /// resource types; the returned guard stops the interception task.
    async fn intercept_requests(&self, page: &Page) -> Result<Option<AbortOnDrop>, CaptureError> {
        if self.config.blocked_resource_types.is_empty() {
            return Ok(None);
        }

        let mut paused = page.event_listener::<EventRequestPaused>().await?;
        page.execute(EnableParams::default()).await?;

        let blocked = self.config.blocked_resource_types.clone();
        let page = page.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = paused.next().await {
                let resource_type = format!("{:?}", event.resource_type);
                let result = if is_blocked_resource(&resource_type, &blocked) {
                    debug!("Blocking {} request {}", resource_type, event.request.url);
                    page.execute(FailRequestParams::new(
                        event.request_id.clone(),
                        ErrorReason::BlockedByClient,
                    ))
                    .await
                    .map(|_| ())
                } else {
                    page.execute(ContinueRequestParams::new(event.request_id.clone()))
                        .await
                        .map(|_| ())
                };
                if let Err(e) = result {
                    debug!("Paused request not resolved: {}", e);
                }
            }
        });

        Ok(Some(AbortOnDrop(task)))
    }

    async fn capture(&self, page: &Page, url: &str, plan: &CapturePlan) -> Result<Vec<Artifact>, CaptureError> {
        let profile = plan.device.profile();

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(profile.width)
            .height(profile.height)
            .device_scale_factor(profile.device_scale_factor)
            .mobile(profile.mobile)
            .build()
            .map_err(CaptureError::Browser)?;
        page.execute(metrics).await?;
        page.execute(SetTouchEmulationEnabledParams::new(profile.mobile)).await?;
        page.execute(SetUserAgentOverrideParams::new(profile.user_agent)).await?;

        let navigation_timeout = self.config.navigation_timeout();
        match timeout(navigation_timeout, page.goto(url)).await {
            Ok(result) => {
                result?;
            }
            Err(_) => return Err(CaptureError::Timeout(navigation_timeout)),
        }

        if self.config.hide_common_overlays {
            self.hide_overlays(page).await;
        }
        self.pre_scroll(page).await;

        if let Some(delay) = plan.delay() {
            debug!("Waiting {} before capture", format_duration(delay));
            sleep(delay).await;
        }

        if plan.page_strategy == PageStrategy::Pdf {
            let pdf = page
                .pdf(PrintToPdfParams {
                    print_background: Some(true),
                    paper_width: Some(A4_WIDTH_IN),
                    paper_height: Some(A4_HEIGHT_IN),
                    margin_top: Some(0.0),
                    margin_bottom: Some(0.0),
                    margin_left: Some(0.0),
                    margin_right: Some(0.0),
                    ..Default::default()
                })
                .await?;

            return Ok(vec![Artifact {
                bytes: pdf,
                filename: "page.pdf".to_string(),
                mime: "application/pdf".to_string(),
            }]);
        }

        let content_height = content_height(page).await?;
        let strategy = plan
            .page_strategy
            .resolve(content_height, self.config.fullpage_max_height_px);
        debug!("Content height {}px, capturing as {:?}", content_height, strategy);

        let mut artifacts = Vec::new();
        match strategy {
            PageStrategy::Full => {
                let png = page
                    .screenshot(
                        ScreenshotParams::builder()
                            .format(CaptureScreenshotFormat::Png)
                            .full_page(true)
                            .build(),
                    )
                    .await?;
                artifacts.push(self.fit(png, "screenshot.png")?);
            }
            PageStrategy::Slice | PageStrategy::Undetermined | PageStrategy::Pdf => {
                let offsets = slice_offsets(
                    content_height,
                    profile.height,
                    self.config.slice_overlap_px,
                    self.config.max_parts,
                );

                for (index, offset) in offsets.iter().enumerate() {
                    page.evaluate(format!("window.scrollTo(0, {offset})")).await?;
                    sleep(SLICE_SETTLE).await;

                    let png = page
                        .screenshot(
                            ScreenshotParams::builder()
                                .format(CaptureScreenshotFormat::Png)
                                .build(),
                        )
                        .await?;
                    artifacts.push(self.fit(png, format!("screenshot_{:02}.png", index + 1))?);
                }
            }
        }

        Ok(artifacts)
    }

    async fn hide_overlays(&self, page: &Page) {
        let script = format!(
            "(() => {{ const s = document.createElement('style'); s.textContent = {}; document.head.appendChild(s); }})()",
            serde_json::Value::String(HIDE_OVERLAYS_CSS.to_string())
        );
        if let Err(e) = page.evaluate(script).await {
            debug!("Overlay CSS injection failed: {}", e);
        }
    }

    /// Scroll through the page once so lazy-loaded content is fetched.
    async fn pre_scroll(&self, page: &Page) {
        let total = match content_height(page).await {
            Ok(total) => total,
            Err(e) => {
                debug!("Pre-scroll skipped: {}", e);
                return;
            }
        };

        let mut y = 0u32;
        while y < total {
            if page.evaluate(format!("window.scrollTo(0, {y})")).await.is_err() {
                return;
            }
            sleep(PRE_SCROLL_PAUSE).await;
            y = y.saturating_add(PRE_SCROLL_STEP_PX);
        }
        sleep(PRE_SCROLL_PAUSE * 2).await;
        let _ = page.evaluate("window.scrollTo(0, 0)").await;
        sleep(PRE_SCROLL_PAUSE).await;
    }

    fn fit(&self, png: Vec<u8>, filename: impl Into<String>) -> Result<Artifact, CaptureError> {
        fit_image(
            png,
            filename.into(),
            self.config.max_image_bytes,
            self.config.jpeg_quality,
        )
    }
}

#[async_trait]
impl Renderer for ChromeRenderer {
    async fn render(&self, url: &str, plan: &CapturePlan) -> Result<Vec<Artifact>, CaptureError> {
        let started = Instant::now();

        let (page, context_id) = self.open_page().await?;

        let overall_timeout = self.config.overall_timeout();
        let result = timeout(overall_timeout, async {
            let _interceptor = self.intercept_requests(&page).await?;
            self.capture(&page, url, plan).await
        })
        .await;

        self.release_page(page, context_id).await;

        let artifacts = match result {
            Ok(artifacts) => artifacts?,
            Err(_) => return Err(CaptureError::Timeout(overall_timeout)),
        };

        let total_bytes: usize = artifacts.iter().map(|a| a.bytes.len()).sum();
        info!(
            "Rendered {} artifact(s), {} in {}",
            artifacts.len(),
            format_bytes(total_bytes),
            format_duration(started.elapsed())
        );
        Ok(artifacts)
    }
}

async fn content_height(page: &Page) -> Result<u32, CaptureError> {
    let height: f64 = page.evaluate(CONTENT_HEIGHT_JS).await?.into_value()?;
    Ok(height.max(0.0).min(f64::from(u32::MAX)) as u32)
}

/// Keep a PNG as is when it fits `max_bytes`, otherwise re-encode it as JPEG.
pub fn fit_image(
    png: Vec<u8>,
    filename: String,
    max_bytes: usize,
    jpeg_quality: u8,
) -> Result<Artifact, CaptureError> {
    if png.len() <= max_bytes {
        return Ok(Artifact::png(png, filename));
    }

    let rgb = image::load_from_memory(&png)?.to_rgb8();
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, jpeg_quality).encode(
        rgb.as_raw(),
        rgb.width(),
        rgb.height(),
        image::ColorType::Rgb8,
    )?;

    debug!(
        "Re-encoded {} as JPEG: {} -> {}",
        filename,
        format_bytes(png.len()),
        format_bytes(jpeg.len())
    );

    let stem = filename.strip_suffix(".png").unwrap_or(&filename);
    Ok(Artifact {
        filename: format!("{stem}.jpg"),
        bytes: jpeg,
        mime: "image/jpeg".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageOutputFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn sample_png() -> Vec<u8> {
        let image = RgbImage::from_fn(64, 64, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 128]));
        let mut png = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut png), ImageOutputFormat::Png)
            .unwrap();
        png
    }

    #[test]
    fn test_small_png_is_kept() {
        let png = sample_png();
        let artifact = fit_image(png.clone(), "screenshot.png".into(), png.len(), 80).unwrap();
        assert_eq!(artifact.mime, "image/png");
        assert_eq!(artifact.filename, "screenshot.png");
        assert_eq!(artifact.bytes, png);
    }

    #[test]
    fn test_oversized_png_becomes_jpeg() {
        let artifact = fit_image(sample_png(), "screenshot_03.png".into(), 10, 80).unwrap();
        assert_eq!(artifact.mime, "image/jpeg");
        assert_eq!(artifact.filename, "screenshot_03.jpg");
        assert_eq!(&artifact.bytes[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_corrupt_png_is_a_render_error() {
        let err = fit_image(vec![1, 2, 3], "x.png".into(), 0, 80).unwrap_err();
        assert!(matches!(err, CaptureError::Render(_)));
    }

    #[test]
    fn test_chrome_args_are_isolated() {
        let first = chrome_args();
        let second = chrome_args();
        assert!(first.contains(&"--headless".to_string()));
        assert!(first.contains(&"--disable-dev-shm-usage".to_string()));

        let data_dir = |args: &[String]| {
            args.iter()
                .find(|arg| arg.starts_with("--user-data-dir="))
                .cloned()
        };
        assert_ne!(data_dir(&first), data_dir(&second));
    }

    #[test]
    fn test_relaunch_decision() {
        assert!(!needs_relaunch(false, 0));
        assert!(!needs_relaunch(false, MAX_BROWSER_FAILURES - 1));
        assert!(needs_relaunch(false, MAX_BROWSER_FAILURES));
        assert!(needs_relaunch(true, 0));
    }

    #[test]
    fn test_blocked_resource_filter() {
        let blocked = CaptureConfig::default().blocked_resource_types;

        assert!(is_blocked_resource("Media", &blocked));
        assert!(is_blocked_resource("Font", &blocked));
        assert!(is_blocked_resource("WebSocket", &blocked));
        assert!(!is_blocked_resource("Document", &blocked));
        assert!(!is_blocked_resource("Image", &blocked));
        assert!(!is_blocked_resource("Media", &[]));
        assert!(is_blocked_resource("Image", &[" image ".to_string()]));
    }

    #[cfg(feature = "integration_benchmarks")]
    #[tokio::test]
    async fn test_chrome_renders_slices() {
        use crate::{CaptureFlags, CapturePlan};

        let renderer = ChromeRenderer::launch(&CaptureConfig::default()).await.unwrap();
        let plan = CapturePlan::from_flags(&CaptureFlags::parse("--slice"));
        let artifacts = renderer.render("https://example.com", &plan).await.unwrap();
        assert!(!artifacts.is_empty());
        assert_eq!(artifacts[0].filename, "screenshot_01.png");
        renderer.shutdown().await;
    }
}
