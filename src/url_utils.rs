//! Small URL helpers shared by the pipeline, the robots cache, and the rate limiter.
//!
//! The crawler purposefully does not lean on `url::Url::host_str` for the
//! same-host comparison used to bound child-request discovery: the host
//! here is defined textually (the authority between `://` and the next `/`
//! or `:`), matching how the rest of the pipeline reasons about hosts.

use url::Url;

/// Lower-cased authority portion of `url`, i.e. everything between `://`
/// and the next `/` or `:`. Returns `None` if `url` has no scheme separator.
pub fn host_of(url: &str) -> Option<String> {
    let after_scheme = url.split("://").nth(1)?;
    let end = after_scheme
        .find(['/', ':'])
        .unwrap_or(after_scheme.len());
    let host = &after_scheme[..end];
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

/// Scheme plus authority (host and, when present, port) of `url`, e.g.
/// `https://example.com:8443`. Unlike [`host_of`], this preserves the
/// scheme and port, so it's the right form to build a request URL against
/// the same origin — [`host_of`] stays truncated on purpose and is only
/// for cache keys and same-host comparisons.
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    match parsed.port() {
        Some(port) => Some(format!("{}://{}:{}", parsed.scheme(), host, port)),
        None => Some(format!("{}://{}", parsed.scheme(), host)),
    }
}

/// Whether `a` and `b` share the same host, per [`host_of`]'s definition.
pub fn same_host(a: &str, b: &str) -> bool {
    match (host_of(a), host_of(b)) {
        (Some(ha), Some(hb)) => ha == hb,
        _ => false,
    }
}

/// Whether `url` parses and uses an `http`/`https` scheme.
pub fn is_valid_http_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(_) => false,
    }
}

/// Resolve `href` against `base`, returning an absolute URL string.
/// Returns `None` if either URL fails to parse.
pub fn resolve(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    base.join(href).ok().map(|u| u.to_string())
}
