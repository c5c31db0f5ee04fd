//! Capture planning: raw request flags in, normalized rendering plan out.
//!
//! Everything here is pure. Flags are parsed once at enqueue time and stored
//! with the job; the plan is derived from them when a worker picks the job up.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Delay applied by `--slow` when no explicit `--delay=N` is given.
pub const SLOW_DELAY_MS: u64 = 7_000;

/// Raw flags captured from the request text.
///
/// Stored verbatim as the job's params. Every field defaults, so rows written
/// by older or newer builds still decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CaptureFlags {
    pub mobile: bool,
    pub desktop: bool,
    pub full: bool,
    pub slice: bool,
    pub pdf: bool,
    pub slow: bool,
    pub delay_ms: Option<u64>,
}

impl CaptureFlags {
    /// Parse flags out of free text such as `https://x.org --desktop --delay=3000`.
    ///
    /// Unknown tokens (the URL included) are ignored.
    pub fn parse(text: &str) -> Self {
        let mut flags = CaptureFlags::default();

        for token in text.split_whitespace() {
            match token {
                "--mobile" => flags.mobile = true,
                "--desktop" => flags.desktop = true,
                "--full" => flags.full = true,
                "--slice" => flags.slice = true,
                "--pdf" => flags.pdf = true,
                "--slow" => flags.slow = true,
                _ => {}
            }
        }
        flags.delay_ms = parse_delay(text);

        flags
    }

    /// Decode stored params; malformed input degrades to defaults.
    pub fn from_json(raw: &str) -> Self {
        match serde_json::from_str(raw) {
            Ok(flags) => flags,
            Err(e) => {
                tracing::warn!("Ignoring malformed capture params {:?}: {}", raw, e);
                CaptureFlags::default()
            }
        }
    }
}

/// Finds `--delay=N`, tolerating whitespace around `=`.
fn parse_delay(text: &str) -> Option<u64> {
    let mut rest = text;
    while let Some(index) = rest.find("--delay") {
        let after = rest[index + "--delay".len()..].trim_start();
        if let Some(value) = after.strip_prefix('=') {
            let value = value.trim_start();
            let digits: String = value.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(delay) = digits.parse() {
                return Some(delay);
            }
        }
        rest = &rest[index + "--delay".len()..];
    }
    None
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Mobile,
    Desktop,
}

/// Browser emulation settings for a [`Device`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceProfile {
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub mobile: bool,
    pub user_agent: &'static str,
}

impl Device {
    pub fn profile(self) -> DeviceProfile {
        match self {
            Device::Mobile => DeviceProfile {
                width: 430,
                height: 844,
                device_scale_factor: 4.0,
                mobile: true,
                user_agent: "Mozilla/5.0 (iPhone; CPU iPhone OS 16_0 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/16.0 Mobile/15E148 Safari/604.1",
            },
            Device::Desktop => DeviceProfile {
                width: 1920,
                height: 1080,
                device_scale_factor: 2.0,
                mobile: false,
                user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStrategy {
    Pdf,
    Slice,
    Full,
    /// Left to the renderer: full page when the content is short enough,
    /// slices otherwise.
    Undetermined,
}

impl PageStrategy {
    /// Resolve an undetermined strategy against the measured content height.
    pub fn resolve(self, content_height: u32, fullpage_max_height: u32) -> PageStrategy {
        match self {
            PageStrategy::Undetermined if content_height <= fullpage_max_height => {
                PageStrategy::Full
            }
            PageStrategy::Undetermined => PageStrategy::Slice,
            other => other,
        }
    }
}

/// Normalized rendering instructions for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturePlan {
    pub device: Device,
    pub page_strategy: PageStrategy,
    pub delay_ms: Option<u64>,
}

impl CapturePlan {
    pub fn from_flags(flags: &CaptureFlags) -> Self {
        let device = if flags.desktop {
            Device::Desktop
        } else {
            Device::Mobile
        };

        let page_strategy = if flags.pdf {
            PageStrategy::Pdf
        } else if flags.slice {
            PageStrategy::Slice
        } else if flags.full {
            PageStrategy::Full
        } else {
            PageStrategy::Undetermined
        };

        let delay_ms = match flags.delay_ms {
            Some(delay) => Some(delay),
            None if flags.slow => Some(SLOW_DELAY_MS),
            None => None,
        };

        Self {
            device,
            page_strategy,
            delay_ms,
        }
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay_ms.map(Duration::from_millis)
    }
}

/// Vertical scroll offsets of the slices covering a page.
///
/// Starts at 0 and advances by `viewport_height - overlap` while the offset is
/// still inside the content and fewer than `max_parts` slices were produced.
/// Always yields at least one offset (unless `max_parts` is 0).
pub fn slice_offsets(
    total_height: u32,
    viewport_height: u32,
    overlap: u32,
    max_parts: usize,
) -> Vec<u32> {
    let step = viewport_height.saturating_sub(overlap).max(1);
    let mut offsets = Vec::new();
    let mut offset = 0u32;

    while offsets.len() < max_parts && (offsets.is_empty() || offset < total_height) {
        offsets.push(offset);
        offset = match offset.checked_add(step) {
            Some(next) => next,
            None => break,
        };
    }

    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_device_is_mobile() {
        let plan = CapturePlan::from_flags(&CaptureFlags::parse("https://example.com"));
        assert_eq!(plan.device, Device::Mobile);
        assert_eq!(plan.page_strategy, PageStrategy::Undetermined);
        assert_eq!(plan.delay_ms, None);
    }

    #[test]
    fn test_desktop_wins_over_mobile() {
        let plan = CapturePlan::from_flags(&CaptureFlags::parse("--mobile --desktop"));
        assert_eq!(plan.device, Device::Desktop);
    }

    #[test]
    fn test_pdf_overrides_layout_flags() {
        let plan = CapturePlan::from_flags(&CaptureFlags::parse("https://a.io --pdf --full"));
        assert_eq!(plan.page_strategy, PageStrategy::Pdf);

        let plan = CapturePlan::from_flags(&CaptureFlags::parse("--slice --full"));
        assert_eq!(plan.page_strategy, PageStrategy::Slice);

        let plan = CapturePlan::from_flags(&CaptureFlags::parse("--full"));
        assert_eq!(plan.page_strategy, PageStrategy::Full);
    }

    #[test]
    fn test_delay_resolution() {
        let plan = CapturePlan::from_flags(&CaptureFlags::parse("--delay=3000"));
        assert_eq!(plan.delay_ms, Some(3000));

        let plan = CapturePlan::from_flags(&CaptureFlags::parse("--slow"));
        assert_eq!(plan.delay_ms, Some(SLOW_DELAY_MS));

        let plan = CapturePlan::from_flags(&CaptureFlags::parse("--slow --delay = 1500"));
        assert_eq!(plan.delay_ms, Some(1500));

        let plan = CapturePlan::from_flags(&CaptureFlags::parse("--delay=abc"));
        assert_eq!(plan.delay_ms, None);
    }

    #[test]
    fn test_flag_tokens_must_match_exactly() {
        let flags = CaptureFlags::parse("https://example.com/--fullscreen --pdfx");
        assert!(!flags.full);
        assert!(!flags.pdf);
    }

    #[test]
    fn test_malformed_params_degrade_to_defaults() {
        assert_eq!(CaptureFlags::from_json("{not json"), CaptureFlags::default());
        assert_eq!(CaptureFlags::from_json(""), CaptureFlags::default());

        let flags = CaptureFlags::from_json(r#"{"pdf": true, "legacy_field": 1}"#);
        assert!(flags.pdf);
    }

    #[test]
    fn test_resolve_undetermined_strategy() {
        assert_eq!(PageStrategy::Undetermined.resolve(9_000, 15_000), PageStrategy::Full);
        assert_eq!(PageStrategy::Undetermined.resolve(15_000, 15_000), PageStrategy::Full);
        assert_eq!(PageStrategy::Undetermined.resolve(15_001, 15_000), PageStrategy::Slice);
        assert_eq!(PageStrategy::Pdf.resolve(90_000, 15_000), PageStrategy::Pdf);
    }

    #[test]
    fn test_slice_offsets_with_overlap() {
        assert_eq!(slice_offsets(3000, 800, 80, 10), vec![0, 720, 1440, 2160, 2880]);
    }

    #[test]
    fn test_slice_offsets_truncated_at_max_parts() {
        let offsets = slice_offsets(100_000, 844, 80, 10);
        assert_eq!(offsets.len(), 10);
        assert_eq!(offsets[9], 9 * 764);
    }

    #[test]
    fn test_slice_offsets_short_page() {
        assert_eq!(slice_offsets(0, 844, 80, 10), vec![0]);
        assert_eq!(slice_offsets(500, 844, 80, 10), vec![0]);
        assert_eq!(slice_offsets(764, 844, 80, 10), vec![0]);
        assert_eq!(slice_offsets(765, 844, 80, 10), vec![0, 764]);
    }

    #[test]
    fn test_slice_offsets_overlap_larger_than_viewport() {
        assert_eq!(slice_offsets(3, 80, 100, 10), vec![0, 1, 2]);
    }
}
