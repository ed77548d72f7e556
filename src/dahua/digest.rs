//! HTTP Digest authentication (RFC 2617, MD5) for the camera endpoints.
//!
//! Dahua firmware speaks MD5 digest with qop=auth. Exactly one challenge
//! per request is honored; a second 401 means the credential is wrong.

use std::collections::HashMap;

/// A parsed `WWW-Authenticate: Digest ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
}

/// Parse the challenge header value. Returns `None` for non-Digest schemes
/// or challenges missing realm/nonce.
pub fn parse_challenge(header: &str) -> Option<Challenge> {
    let rest = header.trim().strip_prefix("Digest")?.trim_start();
    let fields = parse_fields(rest);
    Some(Challenge {
        realm: fields.get("realm")?.clone(),
        nonce: fields.get("nonce")?.clone(),
        qop: fields.get("qop").cloned(),
        opaque: fields.get("opaque").cloned(),
    })
}

/// Split `k1="v1", k2=v2, ...` respecting quoted commas.
fn parse_fields(input: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut rest = input;
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else { break };
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = &rest[eq + 1..];

        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let Some(end) = stripped.find('"') else { break };
            value = stripped[..end].to_string();
            rest = stripped[end + 1..].trim_start_matches(',').trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest[end..].trim_start_matches(',').trim_start();
        }
        fields.insert(key, value);
    }
    fields
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Compute the `Authorization` header value answering `challenge` for one
/// request. `uri` is the request path including the query string, exactly
/// as it appears on the request line.
pub fn authorization(
    challenge: &Challenge,
    username: &str,
    password: &str,
    method: &str,
    uri: &str,
    cnonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", username, challenge.realm, password));
    let ha2 = md5_hex(&format!("{}:{}", method, uri));

    let nc = "00000001";
    let (response, qop_part) = match challenge.qop.as_deref() {
        Some(qop) if qop.split(',').any(|q| q.trim() == "auth") => {
            let response = md5_hex(&format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, challenge.nonce, nc, cnonce, ha2
            ));
            (
                response,
                format!(", qop=auth, nc={}, cnonce=\"{}\"", nc, cnonce),
            )
        }
        _ => {
            let response = md5_hex(&format!("{}:{}:{}", ha1, challenge.nonce, ha2));
            (response, String::new())
        }
    };

    let mut header = format!(
        "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"{}",
        username, challenge.realm, challenge.nonce, uri, response, qop_part
    );
    if let Some(ref opaque) = challenge.opaque {
        header.push_str(&format!(", opaque=\"{}\"", opaque));
    }
    header.push_str(", algorithm=MD5");
    header
}
