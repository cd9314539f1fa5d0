//! Canonical request construction and URL encoding
//!
//! The canonical resource and canonical header block are the two request
//! derived inputs of the string to sign. Both are pure functions of the
//! request URL and headers so that a retried request signs identically.
//!
//! Ordering is asymmetric and must stay that way for wire compatibility:
//! - sub-resource entries of the canonical resource sort ascending
//! - canonical header lines sort descending

use hyper::header::HeaderMap;
use hyper::Uri;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Vendor header namespace included in signatures
pub const VENDOR_HEADER_PREFIX: &str = "x-iijgio-";

/// Compatibility header namespace included in signatures
pub const COMPAT_HEADER_PREFIX: &str = "x-amz-";

/// Prefix of user metadata headers written by this client
pub const USER_METADATA_PREFIX: &str = "x-iijgio-meta-";

/// Compatibility prefix of user metadata headers accepted on read
pub const COMPAT_USER_METADATA_PREFIX: &str = "x-amz-meta-";

/// Header carrying the service-side request id
pub const REQUEST_ID_HEADER: &str = "x-iijgio-request-id";

/// Query parameters that change request semantics and are signed.
pub const SUB_RESOURCES: &[&str] = &[
    "acl",
    "cors",
    "delete",
    "location",
    "partNumber",
    "policy",
    "space",
    "traffic",
    "uploadId",
    "uploads",
    "website",
];

/// Sub-resources written without `=value` in request URLs.
pub const VALUELESS_SUB_RESOURCES: &[&str] = &[
    "acl", "cors", "delete", "location", "policy", "space", "traffic", "uploads", "website",
];

pub fn is_sub_resource(name: &str) -> bool {
    SUB_RESOURCES.contains(&name)
}

pub fn is_valueless_sub_resource(name: &str) -> bool {
    VALUELESS_SUB_RESOURCES.contains(&name)
}

/// Path characters left as-is: unreserved plus `/` and the path sub-delimiters.
const PATH_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b',')
    .remove(b'/')
    .remove(b':')
    .remove(b';')
    .remove(b'=')
    .remove(b'@');

/// Query value characters left as-is. Separators such as `&`, `=` and `+` are encoded.
const QUERY_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/')
    .remove(b':')
    .remove(b'@')
    .remove(b'$');

/// Unreserved characters only.
const COMPONENT_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Percent-encode a URL path, preserving `/` and path sub-delimiters.
///
/// Returns `Cow::Borrowed` when nothing needs encoding.
pub fn encode_path(path: &str) -> Cow<'_, str> {
    utf8_percent_encode(path, PATH_SET).into()
}

/// Percent-encode a query parameter value (keeps `/` readable).
pub fn encode_query_value(value: &str) -> Cow<'_, str> {
    utf8_percent_encode(value, QUERY_SET).into()
}

/// Percent-encode everything but unreserved characters, `/` included.
pub fn encode_component(value: &str) -> Cow<'_, str> {
    utf8_percent_encode(value, COMPONENT_SET).into()
}

/// Decode `%XX` escapes. Malformed escapes are kept verbatim.
pub fn percent_decode(s: &str, plus_as_space: bool) -> String {
    if plus_as_space && s.contains('+') {
        let spaced = s.replace('+', " ");
        return percent_decode_str(&spaced).decode_utf8_lossy().into_owned();
    }
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Parse a raw query string into decoded keys with all of their values.
pub fn parse_query(query: &str) -> BTreeMap<String, Vec<String>> {
    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        params
            .entry(percent_decode(k, true))
            .or_default()
            .push(percent_decode(v, true));
    }
    params
}

/// Compute the canonical resource of a request URL.
///
/// The path is normalized to its encoded form; only sub-resource query
/// parameters are kept, each as `key` or `key=value`, sorted ascending.
pub fn canonical_resource(uri: &Uri) -> String {
    let raw_path = uri.path();
    let decoded = percent_decode(if raw_path.is_empty() { "/" } else { raw_path }, false);
    let mut resource = encode_path(&decoded).into_owned();

    let Some(query) = uri.query() else {
        return resource;
    };

    let mut entries: Vec<String> = parse_query(query)
        .into_iter()
        .filter(|(k, _)| is_sub_resource(k))
        .map(|(k, values)| {
            let value = values.join(",");
            if value.is_empty() {
                k
            } else {
                format!("{}={}", k, value)
            }
        })
        .collect();

    if !entries.is_empty() {
        entries.sort();
        resource.push('?');
        resource.push_str(&entries.join("&"));
    }
    resource
}

/// Compute the canonical header block of a request.
///
/// Selects vendor and compatibility namespaced headers, trims and joins
/// their values with `,`, and emits `name:value\n` lines sorted descending.
pub fn canonical_headers(headers: &HeaderMap) -> String {
    let mut lines: Vec<String> = headers
        .keys()
        .filter_map(|name| {
            let key = name.as_str().trim().to_ascii_lowercase();
            if !key.starts_with(VENDOR_HEADER_PREFIX) && !key.starts_with(COMPAT_HEADER_PREFIX) {
                return None;
            }
            let value = headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).trim().to_string())
                .collect::<Vec<_>>()
                .join(",");
            Some(format!("{}:{}\n", key, value))
        })
        .collect();

    lines.sort_by(|a, b| b.cmp(a));
    lines.concat()
}

/// Build a request URL.
///
/// Shape: `scheme://host/bucket[/key][?query]`. Query entries are sorted
/// by key; value-less sub-resources are written bare.
pub fn build_url(
    secure: bool,
    host: &str,
    bucket: &str,
    key: &str,
    query: &BTreeMap<String, String>,
) -> String {
    let scheme = if secure { "https" } else { "http" };
    let encoded_key = encode_path(key);

    let mut url = String::with_capacity(
        scheme.len() + 3 + host.len() + 2 + bucket.len() + encoded_key.len() + 64,
    );
    url.push_str(scheme);
    url.push_str("://");
    url.push_str(host.trim_end_matches('/'));
    url.push('/');
    url.push_str(bucket);
    if !key.is_empty() {
        url.push('/');
        url.push_str(&encoded_key);
    }

    let mut first = true;
    for (k, v) in query {
        url.push(if first { '?' } else { '&' });
        first = false;
        url.push_str(k);
        if !is_valueless_sub_resource(k) {
            url.push('=');
            url.push_str(&encode_query_value(v));
        }
    }
    url
}
