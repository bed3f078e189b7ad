//! Netscape cookie-file loading.
//!
//! Some sources need session cookies. They are exported in the Netscape
//! `cookies.txt` format (tab-separated: domain, include-subdomains flag,
//! path, secure, expiry, name, value) and loaded into the jar shared by all
//! of a poll run's requests. Loading is best-effort.

use anyhow::{Context, Result};
use reqwest::cookie::Jar;
use std::path::Path;
use std::sync::Arc;
use tracing::{error, warn};
use url::Url;

/// Prefix some exporters put on HttpOnly cookie lines.
const HTTP_ONLY_PREFIX: &str = "#HttpOnly_";

/// Load a cookie file into a new jar.
///
/// Returns the jar and the number of cookies loaded. Malformed lines are
/// skipped with a warning.
pub fn load_cookie_file(path: &Path) -> Result<(Arc<Jar>, usize)> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("could not read cookie file {}", path.display()))?;
    let jar = Jar::default();
    let mut loaded = 0;

    for (lineno, raw) in content.lines().enumerate() {
        let line = match raw.strip_prefix(HTTP_ONLY_PREFIX) {
            Some(rest) => rest,
            None if raw.starts_with('#') => continue,
            None => raw,
        };
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 7 {
            warn!(file = %path.display(), line = lineno + 1, "skipping malformed cookie line");
            continue;
        }
        let (domain, _subdomains, cookie_path, secure, _expires, name, value) = (
            fields[0], fields[1], fields[2], fields[3], fields[4], fields[5], fields[6],
        );

        let host = domain.trim_start_matches('.');
        let scheme = if secure.eq_ignore_ascii_case("TRUE") {
            "https"
        } else {
            "http"
        };
        let url = match Url::parse(&format!("{}://{}{}", scheme, host, cookie_path)) {
            Ok(url) => url,
            Err(e) => {
                warn!(file = %path.display(), line = lineno + 1, error = %e, "skipping cookie with invalid domain");
                continue;
            }
        };

        let mut cookie = format!("{}={}; Path={}", name, value, cookie_path);
        if domain.starts_with('.') {
            cookie.push_str(&format!("; Domain={}", host));
        }
        if scheme == "https" {
            cookie.push_str("; Secure");
        }
        jar.add_cookie_str(&cookie, &url);
        loaded += 1;
    }

    Ok((Arc::new(jar), loaded))
}

/// Load the source's cookie file if one is configured. Failures are logged
/// and yield `None`.
pub fn load_source_cookies(path: Option<&str>) -> Option<Arc<Jar>> {
    let path = path.map(str::trim).filter(|p| !p.is_empty())?;
    match load_cookie_file(Path::new(path)) {
        Ok((jar, _)) => Some(jar),
        Err(e) => {
            error!(file = path, error = %e, "could not load cookies");
            None
        }
    }
}
