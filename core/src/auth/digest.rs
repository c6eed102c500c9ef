/*
 * digest.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Carrucola, a network file-transfer engine.
 *
 * Carrucola is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Carrucola is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Carrucola.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Digest authentication (RFC 2617). MD5 and MD5-sess, qop=auth. auth-int
//! needs an entity-body digest we do not compute; when offered alongside
//! auth we use auth, when offered alone qop is dropped.

use md5::{Digest, Md5};

use super::{bytes_to_hex, AuthError, Authenticator, Challenge};
use crate::config::CredentialEntry;
use crate::protocol::http::Method;
use crate::uri::HttpUrl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Md5Sess,
}

impl DigestAlgorithm {
    fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("MD5") {
            Some(DigestAlgorithm::Md5)
        } else if s.eq_ignore_ascii_case("MD5-sess") {
            Some(DigestAlgorithm::Md5Sess)
        } else {
            None
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Md5 => "MD5",
            DigestAlgorithm::Md5Sess => "MD5-sess",
        }
    }
}

pub struct DigestAuth {
    challenge: Option<Challenge>,
    realm: String,
    nonce: String,
    opaque: Option<String>,
    algorithm: DigestAlgorithm,
    algorithm_given: bool,
    /// qop to emit: Some("auth") or None (dropped).
    qop: Option<&'static str>,
    /// Paths from the domain attribute limiting credential reuse.
    domain: Vec<String>,
    stale: bool,
    method: Method,
    uri: String,
    nonce_count: u32,
    error: Option<String>,
    responded: bool,
}

impl DigestAuth {
    pub fn new() -> Self {
        Self {
            challenge: None,
            realm: String::new(),
            nonce: String::new(),
            opaque: None,
            algorithm: DigestAlgorithm::Md5,
            algorithm_given: false,
            qop: None,
            domain: Vec::new(),
            stale: false,
            method: Method::Get,
            uri: "/".to_string(),
            nonce_count: 0,
            error: None,
            responded: false,
        }
    }

    /// True when the server marked the previous nonce stale: the credentials
    /// are still good and must not be re-prompted.
    pub fn stale(&self) -> bool {
        self.stale
    }

    /// Whether cached credentials may be replayed for this path, honoring
    /// the challenge's domain attribute. An empty domain covers everything.
    pub fn covers(&self, url: &HttpUrl) -> bool {
        if self.domain.is_empty() {
            return true;
        }
        self.domain.iter().any(|d| url.path.starts_with(d.as_str()))
    }
}

impl Default for DigestAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for DigestAuth {
    fn scheme_name(&self) -> &'static str {
        "Digest"
    }

    fn set_challenge(
        &mut self,
        challenge: &Challenge,
        url: &HttpUrl,
        method: Method,
    ) -> Result<(), AuthError> {
        if !challenge.scheme.eq_ignore_ascii_case("Digest") {
            return Err(AuthError::new(format!(
                "scheme mismatch: expected Digest, got {}",
                challenge.scheme
            )));
        }
        let realm = challenge
            .param("realm")
            .ok_or_else(|| AuthError::new("Digest challenge without realm"))?;
        let nonce = challenge
            .param("nonce")
            .ok_or_else(|| AuthError::new("Digest challenge without nonce"))?;

        let fresh_nonce = nonce != self.nonce;
        self.stale = challenge
            .param("stale")
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if fresh_nonce {
            // nc counts uses of one nonce. A stale retry keeps credentials
            // and the responded flag; a genuinely new challenge resets both.
            self.nonce_count = 0;
            if !self.stale {
                self.responded = false;
            }
        }
        self.realm = realm.to_string();
        self.nonce = nonce.to_string();
        self.opaque = challenge.param("opaque").map(str::to_string);
        self.algorithm_given = challenge.param("algorithm").is_some();
        self.algorithm = match challenge.param("algorithm") {
            Some(a) => DigestAlgorithm::parse(a)
                .ok_or_else(|| AuthError::new(format!("unsupported Digest algorithm {}", a)))?,
            None => DigestAlgorithm::Md5,
        };
        self.qop = match challenge.param("qop") {
            Some(offered) => {
                if offered.split(',').any(|q| q.trim().eq_ignore_ascii_case("auth")) {
                    Some("auth")
                } else {
                    // auth-int only: not supported, drop qop entirely.
                    None
                }
            }
            None => None,
        };
        self.domain = challenge
            .param("domain")
            .map(|d| {
                d.split_whitespace()
                    .map(|u| match HttpUrl::parse(u) {
                        Ok(parsed) => parsed.path,
                        Err(_) => u.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.method = method;
        self.uri = url.request_target();
        self.challenge = Some(challenge.clone());
        self.error = None;
        Ok(())
    }

    fn generate_response(&mut self, username: &str, password: &str) -> Option<String> {
        if self.nonce.is_empty() {
            self.error = Some("Digest response requested without a challenge".to_string());
            return None;
        }
        if username.is_empty() && password.is_empty() {
            self.error = Some("no credentials for Digest authentication".to_string());
            return None;
        }
        self.nonce_count += 1;
        let nc = format!("{:08x}", self.nonce_count);
        let cnonce = generate_cnonce();
        let response = compute_response(
            self.algorithm,
            username,
            &self.realm,
            password,
            &self.nonce,
            &nc,
            &cnonce,
            self.qop,
            self.method,
            &self.uri,
        );

        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            username, self.realm, self.nonce, self.uri, response
        );
        if self.algorithm_given {
            header.push_str(&format!(", algorithm={}", self.algorithm.as_str()));
        }
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        if let Some(qop) = self.qop {
            header.push_str(&format!(", qop={}, nc={}, cnonce=\"{}\"", qop, nc, cnonce));
        }
        self.responded = true;
        Some(header)
    }

    fn fill_cached_credentials(&mut self, entry: &CredentialEntry) {
        if let Some(blob) = &entry.challenge_blob {
            if let (Some(c), _) = super::challenge::parse(blob) {
                if c.scheme.eq_ignore_ascii_case("Digest") {
                    self.realm = c.param("realm").unwrap_or_default().to_string();
                    self.nonce = c.param("nonce").unwrap_or_default().to_string();
                    self.opaque = c.param("opaque").map(str::to_string);
                    self.challenge = Some(c);
                }
            }
        }
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    fn is_final_stage(&self) -> bool {
        // A stale nonce invites one more attempt with the same credentials;
        // anything else after a response is a terminal rejection.
        self.responded && !self.stale
    }

    fn challenge_continues(&self, challenge: &Challenge) -> bool {
        challenge
            .param("stale")
            .map(|s| s.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    fn failure(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn challenge_blob(&self) -> Option<String> {
        self.challenge.as_ref().map(super::basic::serialize_challenge)
    }
}

fn md5_hex(data: &str) -> String {
    bytes_to_hex(&Md5::digest(data.as_bytes()))
}

fn generate_cnonce() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes_to_hex(&bytes)
}

/// RFC 2617 §3.2.2 response computation. Pure so the RFC test vector can pin
/// every input including cnonce and nc.
#[allow(clippy::too_many_arguments)]
pub fn compute_response(
    algorithm: DigestAlgorithm,
    username: &str,
    realm: &str,
    password: &str,
    nonce: &str,
    nc: &str,
    cnonce: &str,
    qop: Option<&str>,
    method: Method,
    uri: &str,
) -> String {
    let mut ha1 = md5_hex(&format!("{}:{}:{}", username, realm, password));
    if algorithm == DigestAlgorithm::Md5Sess {
        ha1 = md5_hex(&format!("{}:{}:{}", ha1, nonce, cnonce));
    }
    let ha2 = md5_hex(&format!("{}:{}", method.as_str(), uri));
    match qop {
        Some(qop) => md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, nonce, nc, cnonce, qop, ha2
        )),
        None => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc2617_response_vector() {
        let response = compute_response(
            DigestAlgorithm::Md5,
            "Mufasa",
            "testrealm@host.com",
            "Circle Of Life",
            "dcd98b7102dd2f0e8b11d0f600bfb0c093",
            "00000001",
            "0a4f113b",
            Some("auth"),
            Method::Get,
            "/dir/index.html",
        );
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn requires_realm_and_nonce() {
        let mut auth = DigestAuth::new();
        let url = HttpUrl::parse("http://example.com/").unwrap();
        let (c, _) = super::super::challenge::parse("Digest realm=\"r\"");
        assert!(auth.set_challenge(&c.unwrap(), &url, Method::Get).is_err());
        let (c, _) = super::super::challenge::parse("Digest nonce=\"n\"");
        assert!(auth.set_challenge(&c.unwrap(), &url, Method::Get).is_err());
    }

    #[test]
    fn auth_int_only_drops_qop() {
        let mut auth = DigestAuth::new();
        let url = HttpUrl::parse("http://example.com/x").unwrap();
        let (c, _) =
            super::super::challenge::parse("Digest realm=\"r\", nonce=\"n\", qop=\"auth-int\"");
        auth.set_challenge(&c.unwrap(), &url, Method::Get).unwrap();
        let header = auth.generate_response("u", "p").unwrap();
        assert!(!header.contains("qop="));
        assert!(!header.contains("cnonce"));
    }

    #[test]
    fn auth_int_alongside_auth_uses_auth() {
        let mut auth = DigestAuth::new();
        let url = HttpUrl::parse("http://example.com/x").unwrap();
        let (c, _) = super::super::challenge::parse(
            "Digest realm=\"r\", nonce=\"n\", qop=\"auth,auth-int\"",
        );
        auth.set_challenge(&c.unwrap(), &url, Method::Get).unwrap();
        let header = auth.generate_response("u", "p").unwrap();
        assert!(header.contains("qop=auth,"));
        assert!(header.contains("nc=00000001"));
    }

    #[test]
    fn stale_nonce_keeps_credentials() {
        let mut auth = DigestAuth::new();
        let url = HttpUrl::parse("http://example.com/x").unwrap();
        let (c, _) = super::super::challenge::parse("Digest realm=\"r\", nonce=\"n1\"");
        auth.set_challenge(&c.unwrap(), &url, Method::Get).unwrap();
        auth.generate_response("u", "p").unwrap();
        assert!(auth.is_final_stage());

        let (c, _) =
            super::super::challenge::parse("Digest realm=\"r\", nonce=\"n2\", stale=true");
        auth.set_challenge(&c.unwrap(), &url, Method::Get).unwrap();
        assert!(auth.stale());
        assert!(!auth.is_final_stage());
    }

    #[test]
    fn domain_limits_reuse() {
        let mut auth = DigestAuth::new();
        let url = HttpUrl::parse("http://example.com/private/x").unwrap();
        let (c, _) = super::super::challenge::parse(
            "Digest realm=\"r\", nonce=\"n\", domain=\"/private http://example.com/also\"",
        );
        auth.set_challenge(&c.unwrap(), &url, Method::Get).unwrap();
        assert!(auth.covers(&HttpUrl::parse("http://example.com/private/y").unwrap()));
        assert!(auth.covers(&HttpUrl::parse("http://example.com/also/z").unwrap()));
        assert!(!auth.covers(&HttpUrl::parse("http://example.com/public").unwrap()));
    }
}
