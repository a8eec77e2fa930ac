//! Dependency extraction for stylesheet and SVG resources
//!
//! Fetched CSS and SVG can pull in further resources (fonts, images,
//! imported sheets). Extraction is regex-based and deliberately permissive:
//! a URL we cannot resolve is skipped, never an error.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use tracing::trace;
use url::Url;

static CSS_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#).unwrap());
static CSS_IMPORT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"@import\s+['"]([^'"]+)['"]"#).unwrap());
static SVG_HREF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:xlink:)?href\s*=\s*['"]([^'"]+)['"]"#).unwrap());

/// Raw dependency URLs found in a stylesheet, still relative.
pub fn extract_css_urls(css: &str) -> Vec<String> {
    let mut urls: Vec<String> = CSS_URL
        .captures_iter(css)
        .map(|c| c[1].to_string())
        .collect();
    urls.extend(CSS_IMPORT.captures_iter(css).map(|c| c[1].to_string()));
    urls
}

/// Raw dependency URLs found in an SVG document, still relative.
pub fn extract_svg_urls(svg: &str) -> Vec<String> {
    let mut urls: Vec<String> = SVG_HREF
        .captures_iter(svg)
        .map(|c| c[1].to_string())
        .collect();
    // Inline styles inside SVG use css url() syntax.
    urls.extend(CSS_URL.captures_iter(svg).map(|c| c[1].to_string()));
    urls
}

/// Absolutized, deduplicated dependencies of a fetched resource. Resources
/// that are neither CSS nor SVG have none. Self-references are dropped so
/// recursive resolution cannot cycle.
pub fn resolve_dependencies(resource_url: &str, content_type: &str, body: &[u8]) -> Vec<String> {
    let raw = if is_css(content_type, resource_url) {
        extract_css_urls(&String::from_utf8_lossy(body))
    } else if is_svg(content_type, resource_url) {
        extract_svg_urls(&String::from_utf8_lossy(body))
    } else {
        return Vec::new();
    };

    let base = match Url::parse(resource_url) {
        Ok(base) => base,
        Err(_) => return Vec::new(),
    };

    let mut seen = HashSet::new();
    let mut resolved = Vec::new();
    for candidate in raw {
        if candidate.starts_with("data:") || candidate.starts_with('#') {
            continue;
        }
        let absolute = match base.join(&candidate) {
            Ok(url) => {
                let mut url = url;
                url.set_fragment(None);
                url.to_string()
            }
            Err(_) => {
                trace!(resource = resource_url, %candidate, "unresolvable dependency url");
                continue;
            }
        };
        if absolute == resource_url {
            continue;
        }
        if seen.insert(absolute.clone()) {
            resolved.push(absolute);
        }
    }
    resolved
}

fn is_css(content_type: &str, url: &str) -> bool {
    content_type.contains("text/css") || (content_type.is_empty() && url.ends_with(".css"))
}

fn is_svg(content_type: &str, url: &str) -> bool {
    content_type.contains("image/svg") || (content_type.is_empty() && url.ends_with(".svg"))
}
