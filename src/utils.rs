use std::net::IpAddr;
use std::time::Duration;
use url::{Host, Url};

use crate::CaptureError;

/// Parse a capture target, accepting only absolute `http`/`https` URLs with a host.
///
/// With `block_private_network`, literal loopback, private, link-local and
/// unspecified addresses are rejected as well. Host names are not resolved.
pub fn validate_url(input: &str, block_private_network: bool) -> Result<Url, CaptureError> {
    let parsed = Url::parse(input).map_err(|e| CaptureError::InvalidUrl(format!("{input}: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(CaptureError::InvalidUrl(format!(
                "unsupported scheme {scheme:?}, expected http or https"
            )))
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| CaptureError::InvalidUrl(format!("{input}: missing host")))?;

    if block_private_network {
        let ip = match host {
            Host::Ipv4(ip) => Some(IpAddr::V4(ip)),
            Host::Ipv6(ip) => Some(IpAddr::V6(ip)),
            Host::Domain(_) => None,
        };
        if let Some(ip) = ip {
            if is_private_address(ip) {
                return Err(CaptureError::InvalidUrl(format!(
                    "{ip} is not a public address"
                )));
            }
        }
    }

    Ok(parsed)
}

fn is_private_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.octets()[0] == 0
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // fc00::/7 unique local
                || (first & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (first & 0xffc0) == 0xfe80
        }
    }
}

const MASKED_PATH_CHARS: usize = 24;
const MASKED_FALLBACK_CHARS: usize = 28;

/// Reduce a URL to scheme, host and a truncated path for operator channels.
///
/// Query strings and fragments are always dropped.
pub fn mask_url(input: &str) -> String {
    match Url::parse(input) {
        Ok(parsed) if parsed.has_host() => {
            let mut masked = format!("{}://{}", parsed.scheme(), parsed.host_str().unwrap_or(""));
            if let Some(port) = parsed.port() {
                masked.push_str(&format!(":{port}"));
            }
            let path = parsed.path();
            if path.chars().count() > MASKED_PATH_CHARS {
                masked.extend(path.chars().take(MASKED_PATH_CHARS));
                masked.push_str("...");
            } else {
                masked.push_str(path);
            }
            masked
        }
        _ => format!("{}...", truncate_chars(input, MASKED_FALLBACK_CHARS)),
    }
}

/// Cut `text` to at most `max` characters without splitting a code point.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

pub fn sanitize_filename(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim()
        .to_string()
}

pub fn format_duration(duration: Duration) -> String {
    let total_seconds = duration.as_secs();
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    let millis = duration.subsec_millis();

    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else if seconds > 0 {
        format!("{}.{}s", seconds, millis / 100)
    } else {
        format!("{millis}ms")
    }
}

pub fn format_bytes(bytes: usize) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
