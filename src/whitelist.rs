// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

//! Whitelist URL matching.
//!
//! Destination checks for the locked-down exam browser: a target URL is
//! allowed when its host equals a whitelisted host, is a subdomain of one
//! (host-suffix match), the full URL extends a whitelisted prefix, or both
//! hosts belong to the trusted Google Forms family. The family exception
//! exists because a single whitelisted form entry point fans out across
//! `docs.google.com`, `www.google.com`, and the `forms.gle` shortener.

use crate::error::EngineError;

/// Trim and force a scheme. Fails with `Validation` on empty input.
pub fn normalize_url(raw: &str) -> Result<String, EngineError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(EngineError::validation("URL_REQUIRED", "URL is required"));
    }
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Ok(trimmed.to_string());
    }
    Ok(format!("https://{trimmed}"))
}

/// Lowercased authority of a URL (host, plus port if present). `None` when
/// there is nothing resembling a host.
pub fn host_of(url: &str) -> Option<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);

    let end = rest
        .find(['/', '?', '#'])
        .unwrap_or(rest.len());
    let host = rest[..end].trim().to_ascii_lowercase();

    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

/// Detected provider for a launch URL; drives client-side chrome, nothing
/// security-relevant.
pub fn detect_provider(launch_url: &str) -> String {
    match host_of(launch_url) {
        Some(host) if host.contains("docs.google.com") || host.contains("forms.google.com") => {
            "google_forms".to_string()
        }
        _ => "web".to_string(),
    }
}

/// Whether `raw_target` is allowed by the session whitelist.
pub fn is_whitelisted(raw_target: &str, whitelist: &[String]) -> bool {
    let target = match normalize_url(raw_target) {
        Ok(url) => url,
        Err(_) => return false,
    };
    let target_host = match host_of(&target) {
        Some(host) => host,
        None => return false,
    };

    whitelist.iter().any(|allowed_raw| {
        let allowed = match normalize_url(allowed_raw) {
            Ok(url) => url,
            Err(_) => return false,
        };
        let allowed_host = match host_of(&allowed) {
            Some(host) => host,
            None => return false,
        };

        target_host == allowed_host
            || target_host.ends_with(&format!(".{allowed_host}"))
            || target == allowed
            // Prefix matches only at a path boundary; a bare starts_with
            // would admit any host whose text extends the entry, e.g.
            // example.org.evil.com against example.org.
            || target.starts_with(&format!("{}/", allowed.trim_end_matches('/')))
            || is_same_trusted_host_family(&target_host, &allowed_host)
    })
}

/// Both hosts in the Google Forms family: `google.com` and subdomains,
/// `forms.gle` and subdomains.
fn is_same_trusted_host_family(target_host: &str, allowed_host: &str) -> bool {
    in_google_family(allowed_host) && in_google_family(target_host)
}

fn in_google_family(host: &str) -> bool {
    host == "google.com"
        || host == "www.google.com"
        || host.ends_with(".google.com")
        || host == "forms.gle"
        || host.ends_with(".forms.gle")
}
