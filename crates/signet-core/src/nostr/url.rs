//! Relay URL helpers.

use url::Url;

/// Normalize a relay URL so that equal relays compare equal as strings.
///
/// Scheme-less input gets `wss://`, http(s) is mapped to ws(s), the host is
/// lowercased, default ports, fragments and trailing slashes are removed and
/// query parameters are sorted.
pub fn normalize_url(input: &str) -> Result<String, url::ParseError> {
    let trimmed = input.trim();
    let qualified = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("wss://{}", trimmed)
    };

    let mut url = Url::parse(&qualified)?;
    match url.scheme() {
        "http" => {
            let _ = url.set_scheme("ws");
        }
        "https" => {
            let _ = url.set_scheme("wss");
        }
        _ => {}
    }

    let host = url.host_str().ok_or(url::ParseError::EmptyHost)?.to_lowercase();
    let port = match (url.scheme(), url.port()) {
        ("ws", Some(80)) | ("wss", Some(443)) | (_, None) => String::new(),
        (_, Some(port)) => format!(":{}", port),
    };

    let mut path = String::with_capacity(url.path().len());
    for ch in url.path().chars() {
        if ch == '/' && path.ends_with('/') {
            continue;
        }
        path.push(ch);
    }
    while path.ends_with('/') {
        path.pop();
    }

    let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    pairs.sort();
    let query = if pairs.is_empty() {
        String::new()
    } else {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        format!("?{}", encoded)
    };

    Ok(format!("{}://{}{}{}{}", url.scheme(), host, port, path, query))
}

/// Display form of a relay URL: scheme and trailing slashes removed.
pub fn clean_url(url: &str) -> &str {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    without_scheme.trim_end_matches('/')
}

/// Percent-encode a string the way `encodeURIComponent` does, so bunker URIs
/// are byte-identical to the ones other clients build.
pub fn encode_uri_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len() * 3);
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'_'
            | b'.'
            | b'!'
            | b'~'
            | b'*'
            | b'\''
            | b'('
            | b')' => out.push(byte as char),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Translate a relay websocket URL to the HTTP URL used for NIP-11 discovery.
pub fn http_url(relay_url: &str) -> String {
    if let Some(rest) = relay_url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = relay_url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        relay_url.to_string()
    }
}
