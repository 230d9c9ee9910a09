//! URL canonicalization used for deduplication and lock keys.

use url::Url;

const TRACKING_PARAMS: &[&str] = &[
    "gclid", "fbclid", "ref", "ref_src", "mc_cid", "mc_eid", "msclkid", "igshid", "yclid", "_ga",
];

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

fn collapse_slashes(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut prev_slash = false;
    for ch in path.chars() {
        if ch == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        out.push(ch);
    }
    out
}

/// Normalize a URL so equivalent listing links compare equal.
///
/// - lowercases the host
/// - collapses duplicate path slashes and strips one trailing slash (root excepted)
/// - drops the fragment and tracking parameters
/// - sorts the remaining query parameters by key
///
/// Unparseable input comes back trimmed rather than failing.
pub fn canonicalize(input: &str) -> String {
    let trimmed = input.trim();
    let Ok(mut url) = Url::parse(trimmed) else {
        return trimmed.to_string();
    };

    url.set_fragment(None);

    if let Some(host) = url.host_str().map(str::to_string) {
        let lower = host.to_ascii_lowercase();
        if lower != host && url.set_host(Some(&lower)).is_err() {
            return trimmed.to_string();
        }
    }

    let mut path = collapse_slashes(url.path());
    if path.len() > 1 && path.ends_with('/') {
        path.pop();
    }
    url.set_path(&path);

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    params.sort_by(|a, b| a.0.cmp(&b.0));

    url.set_query(None);
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }

    url.to_string()
}

/// Last non-empty path segment of the canonical URL, minus an `.html`/`.htm` suffix.
pub fn external_id_from_url(input: &str) -> Option<String> {
    let url = Url::parse(&canonicalize(input)).ok()?;
    let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
    let segment = segment
        .strip_suffix(".html")
        .or_else(|| segment.strip_suffix(".htm"))
        .unwrap_or(segment);
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}

pub fn lock_key(adapter: &str, region: &str) -> String {
    format!("{}:{}", adapter.trim(), region.trim())
}
