/*
 * negotiate.rs
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

//! Negotiate (SPNEGO) authentication. Credential acquisition and token
//! generation belong to the platform security layer, reached through the
//! injected `ContextProvider`; this module handles the HTTP side: service
//! principal name construction, base64 token framing, and multi-round state.

use base64::Engine;

use super::{AuthError, Authenticator, Challenge};
use crate::config::CredentialEntry;
use crate::protocol::http::Method;
use crate::uri::HttpUrl;

/// Platform security context. `step` is called once per round with the
/// token the server sent (None on the first round) and returns the next
/// token to transmit. SPNEGO is preferred when the platform offers a choice
/// of mechanisms.
pub trait ContextProvider: Send {
    fn step(&mut self, spn: &str, input: Option<&[u8]>) -> Result<Vec<u8>, String>;
}

pub struct NegotiateAuth {
    provider: Box<dyn ContextProvider>,
    spn: String,
    server_token: Option<Vec<u8>>,
    rounds: u32,
    error: Option<String>,
}

impl NegotiateAuth {
    pub fn new(provider: Box<dyn ContextProvider>) -> Self {
        Self {
            provider,
            spn: String::new(),
            server_token: None,
            rounds: 0,
            error: None,
        }
    }
}

impl Authenticator for NegotiateAuth {
    fn scheme_name(&self) -> &'static str {
        "Negotiate"
    }

    fn set_challenge(
        &mut self,
        challenge: &Challenge,
        url: &HttpUrl,
        _method: Method,
    ) -> Result<(), AuthError> {
        if !challenge.scheme.eq_ignore_ascii_case("Negotiate") {
            return Err(AuthError::new(format!(
                "scheme mismatch: expected Negotiate, got {}",
                challenge.scheme
            )));
        }
        self.spn = format!("HTTP@{}", url.host);
        self.server_token = match challenge.token() {
            Some(token) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(token)
                    .map_err(|_| AuthError::new("Negotiate token is not valid base64"))?,
            ),
            None => None,
        };
        self.error = None;
        Ok(())
    }

    fn generate_response(&mut self, _username: &str, _password: &str) -> Option<String> {
        match self
            .provider
            .step(&self.spn, self.server_token.as_deref())
        {
            Ok(token) => {
                self.rounds += 1;
                Some(format!(
                    "Negotiate {}",
                    base64::engine::general_purpose::STANDARD.encode(token)
                ))
            }
            Err(e) => {
                self.error = Some(format!("security context for {} failed: {}", self.spn, e));
                None
            }
        }
    }

    fn fill_cached_credentials(&mut self, _entry: &CredentialEntry) {
        // The platform holds the credentials; nothing to fill.
    }

    fn realm(&self) -> &str {
        ""
    }

    fn needs_credentials(&self) -> bool {
        false
    }

    fn is_final_stage(&self) -> bool {
        // A context is established after the first exchange unless the
        // server keeps sending continuation tokens.
        self.rounds > 0 && self.server_token.is_none()
    }

    fn challenge_continues(&self, challenge: &Challenge) -> bool {
        challenge.token().is_some()
    }

    fn failure(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Echoes a fixed token; records the SPN it was asked for.
    struct StubProvider {
        seen_spn: std::sync::Arc<std::sync::Mutex<String>>,
    }

    impl ContextProvider for StubProvider {
        fn step(&mut self, spn: &str, input: Option<&[u8]>) -> Result<Vec<u8>, String> {
            *self.seen_spn.lock().unwrap() = spn.to_string();
            match input {
                None => Ok(b"token-1".to_vec()),
                Some(_) => Ok(b"token-2".to_vec()),
            }
        }
    }

    #[test]
    fn spn_and_token_framing() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
        let mut auth = NegotiateAuth::new(Box::new(StubProvider {
            seen_spn: seen.clone(),
        }));
        let url = HttpUrl::parse("http://intranet.example.com/share").unwrap();
        let (c, _) = super::super::challenge::parse("Negotiate");
        auth.set_challenge(&c.unwrap(), &url, Method::Get).unwrap();
        assert!(!auth.needs_credentials());

        let header = auth.generate_response("", "").unwrap();
        assert_eq!(*seen.lock().unwrap(), "HTTP@intranet.example.com");
        assert_eq!(
            header,
            format!(
                "Negotiate {}",
                base64::engine::general_purpose::STANDARD.encode(b"token-1")
            )
        );
        assert!(auth.is_final_stage());
    }

    #[test]
    fn continuation_round() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(String::new()));
        let mut auth = NegotiateAuth::new(Box::new(StubProvider { seen_spn: seen }));
        let url = HttpUrl::parse("http://example.com/").unwrap();
        let (c, _) = super::super::challenge::parse("Negotiate");
        auth.set_challenge(&c.unwrap(), &url, Method::Get).unwrap();
        auth.generate_response("", "").unwrap();

        let continuation = format!(
            "Negotiate {}",
            base64::engine::general_purpose::STANDARD.encode(b"server-cont")
        );
        let (c, _) = super::super::challenge::parse(&continuation);
        auth.set_challenge(&c.unwrap(), &url, Method::Get).unwrap();
        assert!(!auth.is_final_stage());
        let header = auth.generate_response("", "").unwrap();
        assert!(header.starts_with("Negotiate "));
        assert!(auth.failure().is_none());
    }
}
