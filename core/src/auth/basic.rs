/*
 * basic.rs
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

//! Basic authentication (RFC 2617 §2): base64(user:password).

use base64::Engine;

use super::{AuthError, Authenticator, Challenge};
use crate::config::CredentialEntry;
use crate::protocol::http::Method;
use crate::uri::HttpUrl;

pub struct BasicAuth {
    realm: String,
    raw_challenge: Option<String>,
    error: Option<String>,
    responded: bool,
}

impl BasicAuth {
    pub fn new() -> Self {
        Self {
            realm: String::new(),
            raw_challenge: None,
            error: None,
            responded: false,
        }
    }
}

impl Default for BasicAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator for BasicAuth {
    fn scheme_name(&self) -> &'static str {
        "Basic"
    }

    fn set_challenge(
        &mut self,
        challenge: &Challenge,
        _url: &HttpUrl,
        _method: Method,
    ) -> Result<(), AuthError> {
        if !challenge.scheme.eq_ignore_ascii_case("Basic") {
            return Err(AuthError::new(format!(
                "scheme mismatch: expected Basic, got {}",
                challenge.scheme
            )));
        }
        self.realm = challenge.param("realm").unwrap_or_default().to_string();
        self.raw_challenge = Some(serialize_challenge(challenge));
        self.error = None;
        self.responded = false;
        Ok(())
    }

    fn generate_response(&mut self, username: &str, password: &str) -> Option<String> {
        if username.is_empty() && password.is_empty() {
            self.error = Some("no credentials for Basic authentication".to_string());
            return None;
        }
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{}:{}", username, password));
        self.responded = true;
        Some(format!("Basic {}", token))
    }

    fn fill_cached_credentials(&mut self, entry: &CredentialEntry) {
        if let Some(blob) = &entry.challenge_blob {
            if let (Some(c), _) = super::challenge::parse(blob) {
                self.realm = c.param("realm").unwrap_or_default().to_string();
            }
        }
    }

    fn realm(&self) -> &str {
        &self.realm
    }

    fn is_final_stage(&self) -> bool {
        // Basic is single-round: once a response went out, another 401 means
        // the credentials are wrong.
        self.responded
    }

    fn failure(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn challenge_blob(&self) -> Option<String> {
        self.raw_challenge.clone()
    }
}

/// Re-serialize a challenge for the credential cache.
pub(crate) fn serialize_challenge(challenge: &Challenge) -> String {
    let mut out = challenge.scheme.clone();
    for (i, (k, v)) in challenge.params.iter().enumerate() {
        out.push_str(if i == 0 { " " } else { ", " });
        out.push_str(k);
        out.push_str("=\"");
        out.push_str(&v.replace('\\', "\\\\").replace('"', "\\\""));
        out.push('"');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc2617_example() {
        // RFC 2617 §2: user Aladdin, password "open sesame".
        let mut auth = BasicAuth::new();
        let (c, _) = super::super::challenge::parse("Basic realm=\"WallyWorld\"");
        let url = HttpUrl::parse("http://example.com/").unwrap();
        auth.set_challenge(&c.unwrap(), &url, Method::Get).unwrap();
        assert_eq!(auth.realm(), "WallyWorld");
        let response = auth.generate_response("Aladdin", "open sesame").unwrap();
        assert_eq!(response, "Basic QWxhZGRpbjpvcGVuIHNlc2FtZQ==");
    }

    #[test]
    fn scheme_mismatch_rejected() {
        let mut auth = BasicAuth::new();
        let (c, _) = super::super::challenge::parse("Digest realm=\"r\", nonce=\"n\"");
        let url = HttpUrl::parse("http://example.com/").unwrap();
        assert!(auth.set_challenge(&c.unwrap(), &url, Method::Get).is_err());
    }

    #[test]
    fn challenge_blob_roundtrip() {
        let (c, _) = super::super::challenge::parse("Basic realm=\"a \\\"b\\\"\"");
        let blob = serialize_challenge(&c.unwrap());
        let (again, _) = super::super::challenge::parse(&blob);
        assert_eq!(again.unwrap().param("realm"), Some("a \"b\""));
    }
}
