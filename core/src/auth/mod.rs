/*
 * mod.rs
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

//! HTTP authentication: Basic, Digest, NTLM, Negotiate. The scheme set is
//! closed, so the per-scheme state machines hang off one tagged enum that is
//! matched exhaustively at the dispatch points (`choose_best`,
//! `AuthContext::new_from_offer`).

pub mod basic;
pub mod challenge;
pub mod digest;
pub mod negotiate;
pub mod ntlm;

pub use basic::BasicAuth;
pub use challenge::{split_offers, Challenge};
pub use digest::DigestAuth;
pub use negotiate::{ContextProvider, NegotiateAuth};
pub use ntlm::NtlmAuth;

use crate::config::{ConfigMap, CredentialEntry, KEY_ENABLE_NTLMV2};
use crate::protocol::http::Method;
use crate::uri::HttpUrl;

#[derive(Debug)]
pub struct AuthError {
    pub message: String,
}

impl AuthError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AuthError {}

/// Supported schemes, in ascending order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthScheme {
    Basic,
    Ntlm,
    Digest,
    Negotiate,
}

impl AuthScheme {
    pub fn name(&self) -> &'static str {
        match self {
            AuthScheme::Basic => "Basic",
            AuthScheme::Ntlm => "NTLM",
            AuthScheme::Digest => "Digest",
            AuthScheme::Negotiate => "Negotiate",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        if name.eq_ignore_ascii_case("Basic") {
            Some(AuthScheme::Basic)
        } else if name.eq_ignore_ascii_case("NTLM") {
            Some(AuthScheme::Ntlm)
        } else if name.eq_ignore_ascii_case("Digest") {
            Some(AuthScheme::Digest)
        } else if name.eq_ignore_ascii_case("Negotiate") {
            Some(AuthScheme::Negotiate)
        } else {
            None
        }
    }
}

/// Pick the strongest recognized offer: Negotiate > Digest > NTLM > Basic.
/// Unknown schemes are ignored; None when nothing is recognized.
pub fn choose_best(offers: &[Challenge]) -> Option<&Challenge> {
    choose_best_index(offers).map(|i| &offers[i])
}

/// Index variant of `choose_best`, for callers that drop failed offers from
/// the list and re-choose.
pub fn choose_best_index(offers: &[Challenge]) -> Option<usize> {
    let mut best: Option<(AuthScheme, usize)> = None;
    for (i, offer) in offers.iter().enumerate() {
        let Some(scheme) = AuthScheme::from_name(&offer.scheme) else {
            continue;
        };
        match best {
            Some((s, _)) if s >= scheme => {}
            _ => best = Some((scheme, i)),
        }
    }
    best.map(|(_, i)| i)
}

/// Common surface of the per-scheme state machines. Failures set an internal
/// flag with a human-readable message rather than returning rich errors; the
/// engine consults `failure` and falls back to the next-best offer.
pub trait Authenticator {
    fn scheme_name(&self) -> &'static str;

    /// Store a fresh challenge, resetting state when it is structurally
    /// different from the previous one. Errors when the challenge's scheme
    /// token does not match this variant.
    fn set_challenge(
        &mut self,
        challenge: &Challenge,
        url: &HttpUrl,
        method: Method,
    ) -> Result<(), AuthError>;

    /// Compute the Authorization/Proxy-Authorization header value, scheme
    /// token included. None means failure; see `failure` for the message.
    fn generate_response(&mut self, username: &str, password: &str) -> Option<String>;

    /// Remember credentials previously committed for this protection space.
    fn fill_cached_credentials(&mut self, entry: &CredentialEntry);

    /// Server-declared realm, or empty for schemes without one.
    fn realm(&self) -> &str;

    /// Whether a username/password must be obtained before
    /// `generate_response`. Negotiate and the first NTLM round need none.
    fn needs_credentials(&self) -> bool {
        true
    }

    /// NTLM must keep the connection alive across its handshake.
    fn forces_keep_alive(&self) -> bool {
        false
    }

    /// When true, another 401/407 for this scheme is a terminal failure
    /// rather than the next round of a handshake.
    fn is_final_stage(&self) -> bool;

    /// Whether a fresh challenge continues the handshake past the final
    /// stage instead of rejecting it (a continuation token, a stale nonce).
    fn challenge_continues(&self, _challenge: &Challenge) -> bool {
        false
    }

    fn failure(&self) -> Option<&str>;

    /// Serialized challenge for pre-emptive reuse on later requests, when
    /// the scheme supports replay (Basic, Digest).
    fn challenge_blob(&self) -> Option<String> {
        None
    }
}

/// Tagged dispatch over the closed scheme set.
pub enum AuthContext {
    Basic(BasicAuth),
    Digest(DigestAuth),
    Ntlm(NtlmAuth),
    Negotiate(NegotiateAuth),
}

impl AuthContext {
    /// Build the state machine for an offer. Negotiate requires a platform
    /// security context provider; without one the offer is not usable.
    pub fn new_from_offer(
        offer: &Challenge,
        config: &ConfigMap,
        provider: Option<Box<dyn ContextProvider>>,
    ) -> Option<AuthContext> {
        match AuthScheme::from_name(&offer.scheme)? {
            AuthScheme::Basic => Some(AuthContext::Basic(BasicAuth::new())),
            AuthScheme::Digest => Some(AuthContext::Digest(DigestAuth::new())),
            AuthScheme::Ntlm => Some(AuthContext::Ntlm(NtlmAuth::new(
                config.get_bool(KEY_ENABLE_NTLMV2, false),
            ))),
            AuthScheme::Negotiate => provider.map(|p| AuthContext::Negotiate(NegotiateAuth::new(p))),
        }
    }

    pub fn scheme(&self) -> AuthScheme {
        match self {
            AuthContext::Basic(_) => AuthScheme::Basic,
            AuthContext::Digest(_) => AuthScheme::Digest,
            AuthContext::Ntlm(_) => AuthScheme::Ntlm,
            AuthContext::Negotiate(_) => AuthScheme::Negotiate,
        }
    }

    fn inner(&self) -> &dyn Authenticator {
        match self {
            AuthContext::Basic(a) => a,
            AuthContext::Digest(a) => a,
            AuthContext::Ntlm(a) => a,
            AuthContext::Negotiate(a) => a,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Authenticator {
        match self {
            AuthContext::Basic(a) => a,
            AuthContext::Digest(a) => a,
            AuthContext::Ntlm(a) => a,
            AuthContext::Negotiate(a) => a,
        }
    }
}

impl Authenticator for AuthContext {
    fn scheme_name(&self) -> &'static str {
        self.inner().scheme_name()
    }

    fn set_challenge(
        &mut self,
        challenge: &Challenge,
        url: &HttpUrl,
        method: Method,
    ) -> Result<(), AuthError> {
        self.inner_mut().set_challenge(challenge, url, method)
    }

    fn generate_response(&mut self, username: &str, password: &str) -> Option<String> {
        self.inner_mut().generate_response(username, password)
    }

    fn fill_cached_credentials(&mut self, entry: &CredentialEntry) {
        self.inner_mut().fill_cached_credentials(entry)
    }

    fn realm(&self) -> &str {
        self.inner().realm()
    }

    fn needs_credentials(&self) -> bool {
        self.inner().needs_credentials()
    }

    fn forces_keep_alive(&self) -> bool {
        self.inner().forces_keep_alive()
    }

    fn is_final_stage(&self) -> bool {
        self.inner().is_final_stage()
    }

    fn challenge_continues(&self, challenge: &Challenge) -> bool {
        self.inner().challenge_continues(challenge)
    }

    fn failure(&self) -> Option<&str> {
        self.inner().failure()
    }

    fn challenge_blob(&self) -> Option<String> {
        self.inner().challenge_blob()
    }
}

use hmac::Mac;
type HmacMd5 = hmac::Hmac<md5::Md5>;

pub(crate) fn hmac_md5(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacMd5::new_from_slice(key).expect("HMAC key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

pub(crate) fn bytes_to_hex(b: &[u8]) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut s = String::with_capacity(b.len() * 2);
    for &x in b {
        s.push(HEX[(x >> 4) as usize] as char);
        s.push(HEX[(x & 15) as usize] as char);
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offer(scheme: &str) -> Challenge {
        Challenge {
            scheme: scheme.to_string(),
            params: Vec::new(),
            raw: scheme.to_string(),
        }
    }

    #[test]
    fn choose_best_precedence() {
        let offers = vec![offer("Basic"), offer("Digest")];
        assert_eq!(choose_best(&offers).unwrap().scheme, "Digest");
        let offers = vec![offer("Digest"), offer("Basic")];
        assert_eq!(choose_best(&offers).unwrap().scheme, "Digest");
        let offers = vec![offer("NTLM"), offer("Negotiate"), offer("Digest")];
        assert_eq!(choose_best(&offers).unwrap().scheme, "Negotiate");
    }

    #[test]
    fn choose_best_is_idempotent() {
        let offers = vec![offer("Basic"), offer("Digest"), offer("Basic")];
        let first = choose_best(&offers).unwrap().scheme.clone();
        let second = choose_best(&offers).unwrap().scheme.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn choose_best_ignores_unknown() {
        let offers = vec![offer("Bearer"), offer("Hoba")];
        assert!(choose_best(&offers).is_none());
        let offers = vec![offer("Bearer"), offer("Basic")];
        assert_eq!(choose_best(&offers).unwrap().scheme, "Basic");
    }

    #[test]
    fn hex_lowercase() {
        assert_eq!(bytes_to_hex(&[0x00, 0xab, 0xff]), "00abff");
    }
}
