// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Header parsing and construction helpers for the push surface.

/// Parse the `wait` preference from a `Prefer` header value.
///
/// Preferences are comma-separated; parameters after `;` are ignored. The
/// first parseable `wait` wins. Absent or unparseable yields -1 (hold the
/// connection open).
pub fn get_wait(prefer: Option<&str>) -> i64 {
    let Some(prefer) = prefer else {
        return -1;
    };
    for pref in prefer.split(',') {
        let pref = pref.split(';').next().unwrap_or(pref);
        let mut parts = pref.splitn(2, '=');
        let (Some(name), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        if name.trim() == "wait" {
            if let Ok(wait) = value.trim().parse::<i64>() {
                return wait;
            }
        }
    }
    -1
}

/// `Link` header advertising the push and receipt-subscribe resources for a
/// freshly created subscription. Tokens are base64url and need no escaping.
pub fn push_link_header(sub_token: &str) -> String {
    format!(
        "</p/{sub_token}>; rel=\"urn:ietf:params:push:message\",\
         </receipts/{sub_token}>; rel=\"urn:ietf:params:push:receipt:subscribe\""
    )
}

/// Extract the receipt token from a `Push-Receipt` URL. Accepts absolute
/// URLs or bare paths; the path must be `/r/{token}`.
pub fn receipt_token_from_url(raw: &str) -> Option<&str> {
    let path = match raw.find("://") {
        Some(idx) => {
            let after_scheme = &raw[idx + 3..];
            let slash = after_scheme.find('/')?;
            &after_scheme[slash..]
        }
        None => raw,
    };
    let path = path
        .split(|c| c == '?' || c == '#')
        .next()
        .unwrap_or(path);
    let token = path.strip_prefix("/r/")?;
    if token.is_empty() || token.contains('/') {
        return None;
    }
    Some(token)
}
