//! HTTP Digest Authentication (RFC 7616), hand-rolled because no repo in
//! the retrieval pack already depends on a digest-auth crate and pulling
//! one in for a single call site isn't worth the added dependency surface.
//!
//! Usage: send the request once; on a `401` with a `WWW-Authenticate:
//! Digest ...` challenge, build an `Authorization` header with
//! [`DigestChallenge::authorization_header`] and retry once.

use std::collections::HashMap;

use md5::{Digest, Md5};
use rand::Rng;

#[derive(Debug, Clone)]
pub struct DigestChallenge {
    realm: String,
    nonce: String,
    qop: Option<String>,
    opaque: Option<String>,
    algorithm: String,
}

impl DigestChallenge {
    /// Parse a `WWW-Authenticate: Digest ...` header value.
    pub fn parse(header_value: &str) -> Option<Self> {
        let rest = header_value.trim().strip_prefix("Digest")?.trim();
        let params = parse_header_params(rest);
        Some(Self {
            realm: params.get("realm")?.clone(),
            nonce: params.get("nonce")?.clone(),
            qop: params.get("qop").cloned(),
            opaque: params.get("opaque").cloned(),
            algorithm: params
                .get("algorithm")
                .cloned()
                .unwrap_or_else(|| "MD5".to_string()),
        })
    }

    /// Build the `Authorization: Digest ...` header value for one request.
    pub fn authorization_header(
        &self,
        username: &str,
        password: &str,
        method: &str,
        uri: &str,
    ) -> String {
        let ha1 = hex_md5(&format!("{username}:{}:{password}", self.realm));
        let ha2 = hex_md5(&format!("{method}:{uri}"));

        let nc = "00000001";
        let cnonce = hex_md5(&format!("{:x}", rand::thread_rng().gen::<u64>()))[..16].to_string();

        let (response, qop_part) = if let Some(qop) = self.qop.as_deref() {
            let qop = qop.split(',').next().unwrap_or("auth").trim();
            let response = hex_md5(&format!(
                "{ha1}:{}:{nc}:{cnonce}:{qop}:{ha2}",
                self.nonce
            ));
            (response, format!(", qop={qop}, nc={nc}, cnonce=\"{cnonce}\""))
        } else {
            (hex_md5(&format!("{ha1}:{}:{ha2}", self.nonce)), String::new())
        };

        let opaque_part = self
            .opaque
            .as_ref()
            .map(|o| format!(", opaque=\"{o}\""))
            .unwrap_or_default();

        format!(
            "Digest username=\"{username}\", realm=\"{}\", nonce=\"{}\", uri=\"{uri}\", \
             algorithm={}, response=\"{response}\"{qop_part}{opaque_part}",
            self.realm, self.nonce, self.algorithm
        )
    }
}

fn hex_md5(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parse `key=value, key="value", ...` pairs from a challenge header tail.
fn parse_header_params(rest: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    for part in rest.split(',') {
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim().to_string();
        let value = value.trim().trim_matches('"').to_string();
        params.insert(key, value);
    }
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_qop_challenge() {
        let header = r#"Digest realm="Gerrit Code Review", qop="auth", nonce="abc123", opaque="def456""#;
        let challenge = DigestChallenge::parse(header).expect("parse");
        assert_eq!(challenge.realm, "Gerrit Code Review");
        assert_eq!(challenge.nonce, "abc123");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
    }

    #[test]
    fn builds_authorization_header_with_qop() {
        let challenge = DigestChallenge {
            realm: "Gerrit Code Review".into(),
            nonce: "abc123".into(),
            qop: Some("auth".into()),
            opaque: Some("def456".into()),
            algorithm: "MD5".into(),
        };
        let header = challenge.authorization_header("bot", "secret", "GET", "/a/changes/");
        assert!(header.starts_with("Digest username=\"bot\""));
        assert!(header.contains("qop=auth"));
        assert!(header.contains("opaque=\"def456\""));
    }

    #[test]
    fn missing_nonce_fails_to_parse() {
        assert!(DigestChallenge::parse(r#"Digest realm="x""#).is_none());
    }
}
