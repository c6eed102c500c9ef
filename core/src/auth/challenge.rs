/*
 * challenge.rs
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

//! WWW-Authenticate / Proxy-Authenticate challenge parsing. One header value
//! may concatenate several scheme offers (`Digest ..., Basic ...`); `parse`
//! consumes one offer and returns the unparsed remainder, `split_offers`
//! applies it repeatedly.

/// One authentication offer: scheme token plus ordered key/value parameters.
/// `raw` keeps the consumed text verbatim for schemes whose challenge data is
/// a bare token rather than a parameter list (NTLM, Negotiate).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub scheme: String,
    pub params: Vec<(String, String)>,
    pub raw: String,
}

impl Challenge {
    /// Case-insensitive parameter lookup; first occurrence wins.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// The challenge text after the scheme token, for token-style schemes.
    pub fn token(&self) -> Option<&str> {
        let rest = self.raw[self.scheme.len()..].trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}

fn consumed(input: &str, from: usize, to: usize) -> String {
    input[from..to.min(input.len())]
        .trim_end_matches([' ', '\t', ','])
        .to_string()
}

fn is_token_byte(b: u8) -> bool {
    !matches!(b, b' ' | b'\t' | b',' | b'=' | b'"') && b > 0x20 && b != 0x7f
}

fn skip_separators(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && matches!(bytes[i], b' ' | b'\t' | b',') {
        i += 1;
    }
    i
}

fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && matches!(bytes[i], b' ' | b'\t') {
        i += 1;
    }
    i
}

fn read_token(bytes: &[u8], mut i: usize) -> (usize, usize) {
    let start = i;
    while i < bytes.len() && is_token_byte(bytes[i]) {
        i += 1;
    }
    (start, i)
}

/// Parse a quoted string starting at the opening quote. Returns the unescaped
/// content and the index after the closing quote, or None when unterminated.
fn read_quoted(bytes: &[u8], mut i: usize) -> Option<(String, usize)> {
    debug_assert_eq!(bytes[i], b'"');
    i += 1;
    let mut out = String::new();
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() => {
                out.push(bytes[i + 1] as char);
                i += 2;
            }
            b'"' => return Some((out, i + 1)),
            b => {
                out.push(b as char);
                i += 1;
            }
        }
    }
    None
}

/// Parse one challenge from the front of `input`. Returns the challenge (or
/// None when no valid offer starts here) and the unparsed remainder holding
/// any further offers.
///
/// A scheme token must be followed by whitespace or end-of-input to count as
/// a challenge start: `"Basic,"` is not recognized as Basic. A completely
/// bare token (`NTLM`) is a valid parameterless offer.
pub fn parse(input: &str) -> (Option<Challenge>, &str) {
    let bytes = input.as_bytes();
    let start = skip_separators(bytes, 0);
    let (tok_start, tok_end) = read_token(bytes, start);
    if tok_start == tok_end {
        return (None, "");
    }
    let scheme = input[tok_start..tok_end].to_string();

    if tok_end >= bytes.len() {
        // Degenerate bare-scheme challenge (e.g. a server sending just NTLM).
        let raw = consumed(input, tok_start, tok_end);
        return (
            Some(Challenge {
                scheme,
                params: Vec::new(),
                raw,
            }),
            "",
        );
    }
    match bytes[tok_end] {
        b' ' | b'\t' => {}
        // Scheme token not followed by a space is not a challenge start.
        b',' => return (None, &input[tok_end + 1..]),
        _ => return (None, ""),
    }

    let mut params = Vec::new();
    let mut i = skip_ws(bytes, tok_end);
    loop {
        i = skip_separators(bytes, i);
        if i >= bytes.len() {
            break;
        }
        let (k_start, k_end) = read_token(bytes, i);
        if k_start == k_end {
            // Stray punctuation; nothing more to make of this offer.
            break;
        }
        let after_key = skip_ws(bytes, k_end);
        if after_key >= bytes.len() {
            // Trailing key with no value is dropped.
            i = after_key;
            break;
        }
        if bytes[after_key] != b'=' {
            if matches!(bytes[k_end], b' ' | b'\t') {
                // Bare token followed by whitespace: start of the next offer.
                let raw = consumed(input, tok_start, k_start);
                return (
                    Some(Challenge {
                        scheme,
                        params,
                        raw,
                    }),
                    &input[k_start..],
                );
            }
            // Valueless key mid-list; drop it and continue after.
            i = after_key;
            continue;
        }
        let v = skip_ws(bytes, after_key + 1);
        let key = input[k_start..k_end].to_string();
        if v < bytes.len() && bytes[v] == b'"' {
            match read_quoted(bytes, v) {
                Some((value, next)) => {
                    params.push((key, value));
                    i = next;
                }
                None => {
                    // Unterminated quote invalidates this key only; there is
                    // nothing parseable after it.
                    let raw = consumed(input, tok_start, input.len());
                    return (
                        Some(Challenge {
                            scheme,
                            params,
                            raw,
                        }),
                        "",
                    );
                }
            }
        } else {
            let (v_start, v_end) = read_token(bytes, v);
            params.push((key, input[v_start..v_end].to_string()));
            i = v_end;
        }
    }
    let raw = consumed(input, tok_start, i);
    (
        Some(Challenge {
            scheme,
            params,
            raw,
        }),
        &input[i.min(input.len())..],
    )
}

/// Split a header value carrying several concatenated scheme offers into one
/// `Challenge` per scheme.
pub fn split_offers(header: &str) -> Vec<Challenge> {
    let mut offers = Vec::new();
    let mut rest = header;
    loop {
        let (challenge, remainder) = parse(rest);
        if let Some(c) = challenge {
            offers.push(c);
        }
        if remainder.is_empty() {
            break;
        }
        rest = remainder;
    }
    offers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_with_quoted_params() {
        let (c, rest) = parse(
            "Digest realm=\"testrealm@host.com\", qop=\"auth,auth-int\", \
             nonce=\"dcd98b7102dd2f0e8b11d0f600bfb0c093\", opaque=\"5ccc069c403ebaf9f0171e9517f40e41\"",
        );
        let c = c.unwrap();
        assert_eq!(c.scheme, "Digest");
        assert_eq!(c.param("realm"), Some("testrealm@host.com"));
        assert_eq!(c.param("qop"), Some("auth,auth-int"));
        assert_eq!(c.param("nonce"), Some("dcd98b7102dd2f0e8b11d0f600bfb0c093"));
        assert_eq!(rest, "");
    }

    #[test]
    fn bare_token_values() {
        let (c, _) = parse("Digest realm=test, stale=true, algorithm=MD5");
        let c = c.unwrap();
        assert_eq!(c.param("realm"), Some("test"));
        assert_eq!(c.param("stale"), Some("true"));
        assert_eq!(c.param("algorithm"), Some("MD5"));
    }

    #[test]
    fn bare_scheme_is_valid() {
        let (c, rest) = parse("NTLM");
        let c = c.unwrap();
        assert_eq!(c.scheme, "NTLM");
        assert!(c.params.is_empty());
        assert_eq!(c.token(), None);
        assert_eq!(rest, "");
    }

    #[test]
    fn token_style_challenge_keeps_raw_data() {
        let (c, _) = parse("NTLM TlRMTVNTUAACAAAABgAGADgAAAA=");
        let c = c.unwrap();
        assert_eq!(c.scheme, "NTLM");
        assert_eq!(c.token(), Some("TlRMTVNTUAACAAAABgAGADgAAAA="));
    }

    #[test]
    fn scheme_followed_by_comma_is_not_a_challenge() {
        let (c, _) = parse("Basic,");
        assert!(c.is_none());
    }

    #[test]
    fn split_two_offers() {
        let offers = split_offers("Digest realm=\"r1\", nonce=\"n1\", Basic realm=\"r2\"");
        assert_eq!(offers.len(), 2);
        assert_eq!(offers[0].scheme, "Digest");
        assert_eq!(offers[0].param("realm"), Some("r1"));
        assert_eq!(offers[0].param("nonce"), Some("n1"));
        assert_eq!(offers[1].scheme, "Basic");
        assert_eq!(offers[1].param("realm"), Some("r2"));
    }

    #[test]
    fn split_three_offers_each_reparseable() {
        let offers = split_offers(
            "Digest realm=\"r1\", nonce=\"n1\", NTLM flags=1, Basic realm=\"r2\"",
        );
        assert_eq!(offers.len(), 3);
        assert_eq!(offers[0].scheme, "Digest");
        assert_eq!(offers[1].scheme, "NTLM");
        assert_eq!(offers[1].param("flags"), Some("1"));
        assert_eq!(offers[2].scheme, "Basic");
        assert_eq!(offers[2].param("realm"), Some("r2"));
    }

    #[test]
    fn bare_scheme_before_comma_is_skipped() {
        // A scheme token must be followed by a space to open an offer, so a
        // bare offer joined to the next one by a comma is dropped in favor
        // of the later parseable one.
        let offers = split_offers("Negotiate, Basic realm=\"apps\"");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].scheme, "Basic");
    }

    #[test]
    fn quoted_escapes() {
        let (c, _) = parse("Basic realm=\"a \\\"quoted\\\" realm\"");
        assert_eq!(c.unwrap().param("realm"), Some("a \"quoted\" realm"));
    }

    #[test]
    fn unterminated_quote_keeps_previous_keys() {
        let (c, rest) = parse("Digest realm=\"r\", nonce=\"broken");
        let c = c.unwrap();
        assert_eq!(c.param("realm"), Some("r"));
        assert_eq!(c.param("nonce"), None);
        assert_eq!(rest, "");
    }

    #[test]
    fn trailing_valueless_key_dropped() {
        let (c, _) = parse("Digest realm=\"r\", stale");
        let c = c.unwrap();
        assert_eq!(c.params.len(), 1);
        assert_eq!(c.param("realm"), Some("r"));
    }
}
