/*
 * ntlm.rs
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

//! NTLM authentication: the three-message handshake (negotiate, challenge,
//! authenticate) over base64 header tokens. The first negotiate goes out
//! with the classic v1 flag set; if the server rejects it, one retry with
//! the NTLM2 flag follows. The authenticate message carries NTLMv1
//! (DES/MD4) or NTLMv2 (HMAC-MD5) responses depending on configuration.

use base64::Engine;
use des::cipher::generic_array::GenericArray;
use des::cipher::{BlockEncrypt, KeyInit};
use des::Des;
use md4::{Digest as Md4Digest, Md4};

use super::{hmac_md5, AuthError, Authenticator, Challenge};
use crate::config::CredentialEntry;
use crate::protocol::http::Method;
use crate::uri::HttpUrl;

const SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

const FLAG_NEGOTIATE_UNICODE: u32 = 0x0000_0001;
const FLAG_NEGOTIATE_OEM: u32 = 0x0000_0002;
const FLAG_REQUEST_TARGET: u32 = 0x0000_0004;
const FLAG_NEGOTIATE_NTLM: u32 = 0x0000_0200;
const FLAG_NEGOTIATE_ALWAYS_SIGN: u32 = 0x0000_8000;
const FLAG_NEGOTIATE_NTLM2_KEY: u32 = 0x0008_0000;
const FLAG_NEGOTIATE_TARGET_INFO: u32 = 0x0080_0000;

/// Seconds between 1601-01-01 and 1970-01-01, for FILETIME conversion.
const EPOCH_OFFSET_SECS: u64 = 11_644_473_600;

/// Handshake progress. The v1/v2 distinction on the negotiate message is an
/// explicit state so the retry policy is auditable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtlmState {
    Init,
    SentV1,
    SentV2,
    Authenticated,
    Failed,
}

/// Parsed Type-2 challenge message.
struct ServerChallenge {
    nonce: [u8; 8],
    flags: u32,
    target_name: String,
    target_info: Vec<u8>,
}

pub struct NtlmAuth {
    state: NtlmState,
    v2_enabled: bool,
    challenge: Option<ServerChallenge>,
    error: Option<String>,
}

impl NtlmAuth {
    pub fn new(v2_enabled: bool) -> Self {
        Self {
            state: NtlmState::Init,
            v2_enabled,
            challenge: None,
            error: None,
        }
    }

    pub fn state(&self) -> NtlmState {
        self.state
    }

    fn fail(&mut self, msg: impl Into<String>) -> Option<String> {
        self.state = NtlmState::Failed;
        self.error = Some(msg.into());
        None
    }
}

impl Authenticator for NtlmAuth {
    fn scheme_name(&self) -> &'static str {
        "NTLM"
    }

    fn set_challenge(
        &mut self,
        challenge: &Challenge,
        _url: &HttpUrl,
        _method: Method,
    ) -> Result<(), AuthError> {
        if !challenge.scheme.eq_ignore_ascii_case("NTLM") {
            return Err(AuthError::new(format!(
                "scheme mismatch: expected NTLM, got {}",
                challenge.scheme
            )));
        }
        match challenge.token() {
            None => {
                // Bare NTLM offer: either the opening round, or the server
                // rejecting our negotiate. A rejection mid-handshake restarts
                // rather than errors; the generate step picks the flag set.
                if self.challenge.take().is_some() {
                    self.state = NtlmState::Init;
                }
                self.error = None;
                Ok(())
            }
            Some(token) => {
                let data = base64::engine::general_purpose::STANDARD
                    .decode(token)
                    .map_err(|_| AuthError::new("NTLM challenge is not valid base64"))?;
                let parsed = parse_type2(&data)
                    .map_err(|e| AuthError::new(format!("bad NTLM Type-2 message: {}", e)))?;
                self.challenge = Some(parsed);
                self.error = None;
                Ok(())
            }
        }
    }

    fn generate_response(&mut self, username: &str, password: &str) -> Option<String> {
        if self.challenge.is_none() {
            return match self.state {
                NtlmState::Init => {
                    self.state = NtlmState::SentV1;
                    Some(encode(&build_type1(false)))
                }
                // First negotiate rejected: retry once with the NTLM2 flag.
                NtlmState::SentV1 => {
                    self.state = NtlmState::SentV2;
                    Some(encode(&build_type1(true)))
                }
                _ => self.fail("NTLM negotiate rejected"),
            };
        }
        if matches!(self.state, NtlmState::Authenticated | NtlmState::Failed) {
            return self.fail("NTLM authentication rejected");
        }
        if username.is_empty() && password.is_empty() {
            return self.fail("no credentials for NTLM authentication");
        }
        let (domain, user) = split_domain(username);
        let server = self.challenge.as_ref().unwrap();
        let domain = if domain.is_empty() {
            server.target_name.clone()
        } else {
            domain.to_string()
        };
        let msg = if self.v2_enabled {
            let mut client_nonce = [0u8; 8];
            rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut client_nonce);
            build_type3_v2(user, &domain, password, server, &client_nonce, now_filetime())
        } else {
            build_type3_v1(user, &domain, password, server)
        };
        self.state = NtlmState::Authenticated;
        Some(encode(&msg))
    }

    fn fill_cached_credentials(&mut self, _entry: &CredentialEntry) {
        // NTLM tokens are connection-bound; nothing to replay.
    }

    fn realm(&self) -> &str {
        ""
    }

    fn needs_credentials(&self) -> bool {
        // The negotiate rounds carry no credential material.
        self.challenge.is_some()
    }

    fn forces_keep_alive(&self) -> bool {
        true
    }

    fn is_final_stage(&self) -> bool {
        matches!(self.state, NtlmState::Authenticated | NtlmState::Failed)
    }

    fn challenge_continues(&self, challenge: &Challenge) -> bool {
        // A Type-2 token continues the handshake; a bare re-offer does not.
        challenge.token().is_some()
    }

    fn failure(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

fn encode(msg: &[u8]) -> String {
    format!(
        "NTLM {}",
        base64::engine::general_purpose::STANDARD.encode(msg)
    )
}

/// `DOMAIN\user` → (DOMAIN, user); no backslash → ("", user).
fn split_domain(username: &str) -> (&str, &str) {
    match username.find('\\') {
        Some(i) => (&username[..i], &username[i + 1..]),
        None => ("", username),
    }
}

fn utf16le(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect()
}

fn read_buffer<'a>(data: &'a [u8], at: usize) -> Option<&'a [u8]> {
    if at + 8 > data.len() {
        return None;
    }
    let len = u16::from_le_bytes([data[at], data[at + 1]]) as usize;
    let offset = u32::from_le_bytes([data[at + 4], data[at + 5], data[at + 6], data[at + 7]])
        as usize;
    if len == 0 || offset + len > data.len() {
        return None;
    }
    Some(&data[offset..offset + len])
}

fn push_buffer(header: &mut Vec<u8>, len: usize, offset: usize) {
    header.extend_from_slice(&(len as u16).to_le_bytes());
    header.extend_from_slice(&(len as u16).to_le_bytes());
    header.extend_from_slice(&(offset as u32).to_le_bytes());
}

fn parse_type2(data: &[u8]) -> Result<ServerChallenge, String> {
    if data.len() < 32 {
        return Err("message too short".to_string());
    }
    if &data[0..8] != SIGNATURE {
        return Err("bad signature".to_string());
    }
    let msg_type = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    if msg_type != 2 {
        return Err(format!("expected Type-2, got type {}", msg_type));
    }
    let flags = u32::from_le_bytes([data[20], data[21], data[22], data[23]]);
    let mut nonce = [0u8; 8];
    nonce.copy_from_slice(&data[24..32]);
    let target_name = match read_buffer(data, 12) {
        Some(raw) if flags & FLAG_NEGOTIATE_UNICODE != 0 => decode_utf16le(raw),
        Some(raw) => String::from_utf8_lossy(raw).into_owned(),
        None => String::new(),
    };
    let target_info = if flags & FLAG_NEGOTIATE_TARGET_INFO != 0 {
        read_buffer(data, 40).map(<[u8]>::to_vec).unwrap_or_default()
    } else {
        Vec::new()
    };
    Ok(ServerChallenge {
        nonce,
        flags,
        target_name,
        target_info,
    })
}

fn decode_utf16le(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Type-1 negotiate message with empty domain and workstation fields.
fn build_type1(ntlm2: bool) -> Vec<u8> {
    let mut flags = FLAG_NEGOTIATE_UNICODE
        | FLAG_NEGOTIATE_OEM
        | FLAG_REQUEST_TARGET
        | FLAG_NEGOTIATE_NTLM
        | FLAG_NEGOTIATE_ALWAYS_SIGN;
    if ntlm2 {
        flags |= FLAG_NEGOTIATE_NTLM2_KEY;
    }
    let mut msg = Vec::with_capacity(32);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&1u32.to_le_bytes());
    msg.extend_from_slice(&flags.to_le_bytes());
    push_buffer(&mut msg, 0, 32);
    push_buffer(&mut msg, 0, 32);
    msg
}

/// Type-3 authenticate message around precomputed LM/NTLM responses.
fn build_type3(
    user: &str,
    domain: &str,
    unicode: bool,
    lm_response: &[u8],
    nt_response: &[u8],
    ntlm2: bool,
) -> Vec<u8> {
    let domain_bytes = if unicode {
        utf16le(domain)
    } else {
        domain.as_bytes().to_vec()
    };
    let user_bytes = if unicode {
        utf16le(user)
    } else {
        user.as_bytes().to_vec()
    };
    let workstation: Vec<u8> = Vec::new();

    const HEADER_LEN: usize = 64;
    let domain_off = HEADER_LEN;
    let user_off = domain_off + domain_bytes.len();
    let ws_off = user_off + user_bytes.len();
    let lm_off = ws_off + workstation.len();
    let nt_off = lm_off + lm_response.len();
    let end = nt_off + nt_response.len();

    let mut flags = FLAG_NEGOTIATE_NTLM | FLAG_NEGOTIATE_ALWAYS_SIGN;
    flags |= if unicode {
        FLAG_NEGOTIATE_UNICODE
    } else {
        FLAG_NEGOTIATE_OEM
    };
    if ntlm2 {
        flags |= FLAG_NEGOTIATE_NTLM2_KEY;
    }

    let mut msg = Vec::with_capacity(end);
    msg.extend_from_slice(SIGNATURE);
    msg.extend_from_slice(&3u32.to_le_bytes());
    push_buffer(&mut msg, lm_response.len(), lm_off);
    push_buffer(&mut msg, nt_response.len(), nt_off);
    push_buffer(&mut msg, domain_bytes.len(), domain_off);
    push_buffer(&mut msg, user_bytes.len(), user_off);
    push_buffer(&mut msg, workstation.len(), ws_off);
    push_buffer(&mut msg, 0, end); // session key, unused
    msg.extend_from_slice(&flags.to_le_bytes());
    msg.extend_from_slice(&domain_bytes);
    msg.extend_from_slice(&user_bytes);
    msg.extend_from_slice(&workstation);
    msg.extend_from_slice(lm_response);
    msg.extend_from_slice(nt_response);
    msg
}

fn build_type3_v1(user: &str, domain: &str, password: &str, server: &ServerChallenge) -> Vec<u8> {
    let lm = des_response(&lm_hash(password), &server.nonce);
    let nt = des_response(&ntlm_hash(password), &server.nonce);
    build_type3(
        user,
        domain,
        server.flags & FLAG_NEGOTIATE_UNICODE != 0,
        &lm,
        &nt,
        false,
    )
}

fn build_type3_v2(
    user: &str,
    domain: &str,
    password: &str,
    server: &ServerChallenge,
    client_nonce: &[u8; 8],
    timestamp: u64,
) -> Vec<u8> {
    let v2_hash = ntlmv2_hash(user, domain, password);
    let blob = build_blob(timestamp, client_nonce, &server.target_info);
    let nt = ntlmv2_response(&v2_hash, &server.nonce, &blob);
    let lm = lmv2_response(&v2_hash, &server.nonce, client_nonce);
    build_type3(
        user,
        domain,
        server.flags & FLAG_NEGOTIATE_UNICODE != 0,
        &lm,
        &nt,
        true,
    )
}

/// NTLM hash: MD4 over the UTF-16LE password.
pub(crate) fn ntlm_hash(password: &str) -> [u8; 16] {
    let digest = Md4::digest(utf16le(password));
    digest.into()
}

/// LM hash: DES over "KGS!@#$%" keyed by the upper-cased password halves.
pub(crate) fn lm_hash(password: &str) -> [u8; 16] {
    const MAGIC: [u8; 8] = *b"KGS!@#$%";
    let upper = password.to_ascii_uppercase();
    let mut padded = [0u8; 14];
    let take = upper.len().min(14);
    padded[..take].copy_from_slice(&upper.as_bytes()[..take]);
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&des_encrypt(&padded[..7], &MAGIC));
    out[8..].copy_from_slice(&des_encrypt(&padded[7..14], &MAGIC));
    out
}

/// Classic 24-byte challenge response: the 16-byte hash zero-padded to 21
/// bytes yields three DES keys, each encrypting the server nonce.
pub(crate) fn des_response(hash: &[u8; 16], nonce: &[u8; 8]) -> [u8; 24] {
    let mut padded = [0u8; 21];
    padded[..16].copy_from_slice(hash);
    let mut out = [0u8; 24];
    out[..8].copy_from_slice(&des_encrypt(&padded[..7], nonce));
    out[8..16].copy_from_slice(&des_encrypt(&padded[7..14], nonce));
    out[16..].copy_from_slice(&des_encrypt(&padded[14..21], nonce));
    out
}

/// Spread a 56-bit key over 8 bytes, one parity bit per byte.
fn setup_des_key(k: &[u8]) -> [u8; 8] {
    [
        k[0],
        (k[0] << 7) | (k[1] >> 1),
        (k[1] << 6) | (k[2] >> 2),
        (k[2] << 5) | (k[3] >> 3),
        (k[3] << 4) | (k[4] >> 4),
        (k[4] << 3) | (k[5] >> 5),
        (k[5] << 2) | (k[6] >> 6),
        k[6] << 1,
    ]
}

fn des_encrypt(key56: &[u8], data: &[u8; 8]) -> [u8; 8] {
    let key = setup_des_key(key56);
    let cipher = Des::new(GenericArray::from_slice(&key));
    let mut block = GenericArray::clone_from_slice(data);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// NTLMv2 hash: HMAC-MD5 over UTF-16LE(upper(user) + domain), keyed by the
/// NTLM hash.
pub(crate) fn ntlmv2_hash(user: &str, domain: &str, password: &str) -> [u8; 16] {
    let key = ntlm_hash(password);
    let ident = utf16le(&format!("{}{}", user.to_uppercase(), domain));
    let mac = hmac_md5(&key, &ident);
    let mut out = [0u8; 16];
    out.copy_from_slice(&mac);
    out
}

/// The v2 blob: signature, FILETIME timestamp, client nonce, target info.
pub(crate) fn build_blob(timestamp: u64, client_nonce: &[u8; 8], target_info: &[u8]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(32 + target_info.len());
    blob.extend_from_slice(&[0x01, 0x01, 0x00, 0x00]);
    blob.extend_from_slice(&[0x00; 4]);
    blob.extend_from_slice(&timestamp.to_le_bytes());
    blob.extend_from_slice(client_nonce);
    blob.extend_from_slice(&[0x00; 4]);
    blob.extend_from_slice(target_info);
    blob.extend_from_slice(&[0x00; 4]);
    blob
}

pub(crate) fn ntlmv2_response(v2_hash: &[u8; 16], nonce: &[u8; 8], blob: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + blob.len());
    data.extend_from_slice(nonce);
    data.extend_from_slice(blob);
    let mut out = hmac_md5(v2_hash, &data);
    out.extend_from_slice(blob);
    out
}

pub(crate) fn lmv2_response(v2_hash: &[u8; 16], nonce: &[u8; 8], client_nonce: &[u8; 8]) -> [u8; 24] {
    let mut data = [0u8; 16];
    data[..8].copy_from_slice(nonce);
    data[8..].copy_from_slice(client_nonce);
    let mac = hmac_md5(v2_hash, &data);
    let mut out = [0u8; 24];
    out[..16].copy_from_slice(&mac);
    out[16..].copy_from_slice(client_nonce);
    out
}

fn now_filetime() -> u64 {
    let unix = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    (unix + EPOCH_OFFSET_SECS) * 10_000_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::bytes_to_hex;

    // Reference values from the classic protocol write-ups: password
    // "SecREt01", server nonce 0123456789abcdef, user "user", domain
    // "DOMAIN", client nonce ffffff0011223344.
    const NONCE: [u8; 8] = [0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef];
    const CLIENT_NONCE: [u8; 8] = [0xff, 0xff, 0xff, 0x00, 0x11, 0x22, 0x33, 0x44];

    #[test]
    fn ntlm_hash_vector() {
        assert_eq!(
            bytes_to_hex(&ntlm_hash("SecREt01")),
            "cd06ca7c7e10c99b1d33b7485a2ed808"
        );
    }

    #[test]
    fn lm_hash_vector() {
        assert_eq!(
            bytes_to_hex(&lm_hash("SecREt01")),
            "ff3750bcc2b22412c2265b23734e0dac"
        );
    }

    #[test]
    fn ntlmv1_responses() {
        let nt = des_response(&ntlm_hash("SecREt01"), &NONCE);
        assert_eq!(
            bytes_to_hex(&nt),
            "25a98c1c31e81847466b29b2df4680f39958fb8c213a9cc6"
        );
        let lm = des_response(&lm_hash("SecREt01"), &NONCE);
        assert_eq!(
            bytes_to_hex(&lm),
            "c337cd5cbd44fc9782a667af6d427c6de67c20c2d3e77c56"
        );
    }

    #[test]
    fn ntlmv2_hash_vector() {
        assert_eq!(
            bytes_to_hex(&ntlmv2_hash("user", "DOMAIN", "SecREt01")),
            "04b8e0ba74289cc540826bab1dee63ae"
        );
    }

    #[test]
    fn lmv2_response_vector() {
        let v2 = ntlmv2_hash("user", "DOMAIN", "SecREt01");
        assert_eq!(
            bytes_to_hex(&lmv2_response(&v2, &NONCE, &CLIENT_NONCE)),
            "d6e6152ea25d03b7c6ba6629c2d6aaf0ffffff0011223344"
        );
    }

    #[test]
    fn type1_layout() {
        let msg = build_type1(false);
        assert_eq!(msg.len(), 32);
        assert_eq!(&msg[0..8], SIGNATURE);
        assert_eq!(u32::from_le_bytes([msg[8], msg[9], msg[10], msg[11]]), 1);
        let flags = u32::from_le_bytes([msg[12], msg[13], msg[14], msg[15]]);
        assert_eq!(flags & FLAG_NEGOTIATE_NTLM2_KEY, 0);
        let v2 = build_type1(true);
        let flags = u32::from_le_bytes([v2[12], v2[13], v2[14], v2[15]]);
        assert_ne!(flags & FLAG_NEGOTIATE_NTLM2_KEY, 0);
    }

    #[test]
    fn type2_roundtrip_into_type3() {
        // Minimal unicode Type-2 with target name "DOMAIN".
        let name = utf16le("DOMAIN");
        let mut t2 = Vec::new();
        t2.extend_from_slice(SIGNATURE);
        t2.extend_from_slice(&2u32.to_le_bytes());
        push_buffer(&mut t2, name.len(), 48);
        t2.extend_from_slice(&(FLAG_NEGOTIATE_UNICODE | FLAG_REQUEST_TARGET).to_le_bytes());
        t2.extend_from_slice(&NONCE);
        t2.extend_from_slice(&[0u8; 8]); // context
        t2.extend_from_slice(&[0u8; 8]); // target info buffer (empty)
        t2.extend_from_slice(&name);

        let server = parse_type2(&t2).unwrap();
        assert_eq!(server.nonce, NONCE);
        assert_eq!(server.target_name, "DOMAIN");

        let t3 = build_type3_v1("user", "DOMAIN", "SecREt01", &server);
        assert_eq!(&t3[0..8], SIGNATURE);
        assert_eq!(u32::from_le_bytes([t3[8], t3[9], t3[10], t3[11]]), 3);
        // The NT response sits where its security buffer points.
        let nt = read_buffer(&t3, 20).unwrap();
        assert_eq!(
            bytes_to_hex(nt),
            "25a98c1c31e81847466b29b2df4680f39958fb8c213a9cc6"
        );
    }

    #[test]
    fn state_machine_v1_retry_then_final() {
        let mut auth = NtlmAuth::new(false);
        let url = HttpUrl::parse("http://example.com/").unwrap();
        let (bare, _) = super::super::challenge::parse("NTLM");
        auth.set_challenge(&bare.clone().unwrap(), &url, Method::Get)
            .unwrap();
        assert!(!auth.needs_credentials());
        auth.generate_response("", "").unwrap();
        assert_eq!(auth.state(), NtlmState::SentV1);

        // Server rejects with another bare offer: upgraded negotiate.
        auth.set_challenge(&bare.unwrap(), &url, Method::Get).unwrap();
        let retry = auth.generate_response("", "").unwrap();
        assert_eq!(auth.state(), NtlmState::SentV2);
        assert!(retry.starts_with("NTLM "));
        assert!(!auth.is_final_stage());
    }

    #[test]
    fn blob_embeds_timestamp_nonce_and_target_info() {
        let info = [0x02u8, 0x00, 0x04, 0x00, 0x41, 0x00, 0x42, 0x00];
        let blob = build_blob(0x0102030405060708, &CLIENT_NONCE, &info);
        assert_eq!(&blob[0..4], &[1, 1, 0, 0]);
        assert_eq!(&blob[8..16], &0x0102030405060708u64.to_le_bytes());
        assert_eq!(&blob[16..24], &CLIENT_NONCE);
        assert_eq!(&blob[28..36], &info);
    }
}
