/*
 * uri.rs
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

//! http/https/webdav/webdavs URLs: parse, format, resolve relative references.
//! The canonical form (userinfo and fragment stripped) keys the disk cache and
//! credential protection spaces.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::fmt;

/// Bytes that must be escaped when a path or query is emitted on the request
/// line. Everything else is sent as given; we do not re-normalize what the
/// caller escaped already.
const REQUEST_TARGET: &AsciiSet = &CONTROLS.add(b' ').add(b'"').add(b'<').add(b'>').add(b'`');

/// Userinfo in authority: encode @ and friends so one @ separates userinfo
/// from host.
const USERINFO: &AsciiSet = &CONTROLS
    .add(b'@')
    .add(b':')
    .add(b'%')
    .add(b'/')
    .add(b'?')
    .add(b'#')
    .add(b'[')
    .add(b']');

/// Malformed URL or unresolvable reference.
#[derive(Debug)]
pub struct UrlError {
    pub message: String,
}

impl UrlError {
    fn new(msg: impl Into<String>) -> Self {
        Self { message: msg.into() }
    }
}

impl fmt::Display for UrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for UrlError {}

/// A parsed http(s)/webdav(s) URL. webdav maps onto http for the wire; the
/// scheme is kept so redirects and cache keys stay faithful to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpUrl {
    pub scheme: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
    pub fragment: Option<String>,
}

impl HttpUrl {
    /// Parse an absolute URL. Scheme must be one of http, https, webdav, webdavs.
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        let input = input.trim();
        let scheme_end = input
            .find("://")
            .ok_or_else(|| UrlError::new(format!("not an absolute URL: {}", input)))?;
        let scheme = input[..scheme_end].to_ascii_lowercase();
        if !matches!(scheme.as_str(), "http" | "https" | "webdav" | "webdavs") {
            return Err(UrlError::new(format!("unsupported scheme: {}", scheme)));
        }
        let rest = &input[scheme_end + 3..];

        let (authority, rest) = match rest.find(['/', '?', '#']) {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };

        let (userinfo, hostport) = match authority.rfind('@') {
            Some(i) => (Some(&authority[..i]), &authority[i + 1..]),
            None => (None, authority),
        };
        let (user, password) = match userinfo {
            Some(ui) => match ui.find(':') {
                Some(i) => (
                    Some(percent_decode(&ui[..i])),
                    Some(percent_decode(&ui[i + 1..])),
                ),
                None => (Some(percent_decode(ui)), None),
            },
            None => (None, None),
        };

        let (host, port) = match hostport.rfind(':') {
            // An IPv6 literal ends with ']'; a colon after that is a port.
            Some(i) if !hostport[i + 1..].contains(']') => {
                let port: u16 = hostport[i + 1..]
                    .parse()
                    .map_err(|_| UrlError::new(format!("invalid port in {}", hostport)))?;
                (hostport[..i].to_ascii_lowercase(), port)
            }
            _ => (hostport.to_ascii_lowercase(), default_port(&scheme)),
        };
        if host.is_empty() {
            return Err(UrlError::new("empty host"));
        }

        let (path_query, fragment) = match rest.find('#') {
            Some(i) => (&rest[..i], Some(rest[i + 1..].to_string())),
            None => (rest, None),
        };
        let (path, query) = match path_query.find('?') {
            Some(i) => (
                path_query[..i].to_string(),
                Some(path_query[i + 1..].to_string()),
            ),
            None => (path_query.to_string(), None),
        };
        let path = if path.is_empty() { "/".to_string() } else { path };

        Ok(Self {
            scheme,
            user,
            password,
            host,
            port,
            path,
            query,
            fragment,
        })
    }

    pub fn is_secure(&self) -> bool {
        matches!(self.scheme.as_str(), "https" | "webdavs")
    }

    pub fn is_default_port(&self) -> bool {
        self.port == default_port(&self.scheme)
    }

    /// Value for the Host header: host, plus the port when non-default.
    pub fn host_header(&self) -> String {
        if self.is_default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Origin-form request target: path plus query, minimally escaped.
    pub fn request_target(&self) -> String {
        let path = utf8_percent_encode(&self.path, REQUEST_TARGET).to_string();
        match &self.query {
            Some(q) => format!("{}?{}", path, utf8_percent_encode(q, REQUEST_TARGET)),
            None => path,
        }
    }

    /// Absolute-form request target, used on the request line through a proxy.
    pub fn absolute_target(&self) -> String {
        format!(
            "{}://{}{}",
            self.wire_scheme(),
            self.host_header(),
            self.request_target()
        )
    }

    /// Wire scheme: webdav(s) travels as http(s).
    pub fn wire_scheme(&self) -> &'static str {
        if self.is_secure() {
            "https"
        } else {
            "http"
        }
    }

    /// Canonical form: userinfo and fragment stripped, default port elided.
    /// This string keys the disk cache.
    pub fn canonical(&self) -> String {
        format!(
            "{}://{}{}",
            self.scheme,
            self.host_header(),
            self.request_target()
        )
    }

    /// Protection-space root (scheme://host:port), used with the realm to key
    /// cached credentials.
    pub fn root(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }

    /// Resolve a Location header value against this URL. Handles absolute
    /// URLs, scheme-relative (//host/...), absolute paths, and relative paths
    /// with dot-segment removal.
    pub fn resolve(&self, reference: &str) -> Result<HttpUrl, UrlError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(UrlError::new("empty redirect location"));
        }
        if reference.contains("://") {
            return HttpUrl::parse(reference);
        }
        if let Some(rest) = reference.strip_prefix("//") {
            return HttpUrl::parse(&format!("{}://{}", self.scheme, rest));
        }

        let mut out = self.clone();
        let (path_query, fragment) = match reference.find('#') {
            Some(i) => (&reference[..i], Some(reference[i + 1..].to_string())),
            None => (reference, None),
        };
        out.fragment = fragment;
        let (raw_path, query) = match path_query.find('?') {
            Some(i) => (&path_query[..i], Some(path_query[i + 1..].to_string())),
            None => (path_query, None),
        };
        out.query = query;

        if raw_path.is_empty() {
            // Query/fragment-only reference keeps the path.
            return Ok(out);
        }
        if raw_path.starts_with('/') {
            out.path = remove_dot_segments(raw_path);
        } else {
            let base = match self.path.rfind('/') {
                Some(i) => &self.path[..=i],
                None => "/",
            };
            out.path = remove_dot_segments(&format!("{}{}", base, raw_path));
        }
        Ok(out)
    }
}

impl fmt::Display for HttpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}", utf8_percent_encode(user, USERINFO))?;
            if let Some(pw) = &self.password {
                write!(f, ":{}", utf8_percent_encode(pw, USERINFO))?;
            }
            write!(f, "@")?;
        }
        write!(f, "{}{}", self.host_header(), self.request_target())?;
        if let Some(frag) = &self.fragment {
            write!(f, "#{}", frag)?;
        }
        Ok(())
    }
}

fn default_port(scheme: &str) -> u16 {
    match scheme {
        "https" | "webdavs" => 443,
        _ => 80,
    }
}

fn percent_decode(s: &str) -> String {
    percent_encoding::percent_decode_str(s)
        .decode_utf8_lossy()
        .into_owned()
}

/// RFC 3986 §5.2.4.
fn remove_dot_segments(path: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "." => {}
            ".." => {
                out.pop();
            }
            s => out.push(s),
        }
    }
    let mut joined = out.join("/");
    if path.ends_with("/.") || path.ends_with("/..") {
        joined.push('/');
    }
    if !joined.starts_with('/') {
        joined.insert(0, '/');
    }
    joined
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_url() {
        let u = HttpUrl::parse("https://alice:pw@example.com:8443/a/b?x=1#frag").unwrap();
        assert_eq!(u.scheme, "https");
        assert_eq!(u.user.as_deref(), Some("alice"));
        assert_eq!(u.password.as_deref(), Some("pw"));
        assert_eq!(u.host, "example.com");
        assert_eq!(u.port, 8443);
        assert_eq!(u.path, "/a/b");
        assert_eq!(u.query.as_deref(), Some("x=1"));
        assert_eq!(u.fragment.as_deref(), Some("frag"));
    }

    #[test]
    fn canonical_strips_userinfo_and_fragment() {
        let u = HttpUrl::parse("http://alice:pw@example.com/a?x=1#frag").unwrap();
        assert_eq!(u.canonical(), "http://example.com/a?x=1");
    }

    #[test]
    fn default_ports() {
        let u = HttpUrl::parse("http://example.com/").unwrap();
        assert_eq!(u.port, 80);
        assert_eq!(u.host_header(), "example.com");
        let u = HttpUrl::parse("https://example.com/").unwrap();
        assert_eq!(u.port, 443);
        let u = HttpUrl::parse("http://example.com:8080/").unwrap();
        assert_eq!(u.host_header(), "example.com:8080");
    }

    #[test]
    fn empty_path_becomes_root() {
        let u = HttpUrl::parse("http://example.com").unwrap();
        assert_eq!(u.path, "/");
        assert_eq!(u.request_target(), "/");
    }

    #[test]
    fn resolve_relative() {
        let base = HttpUrl::parse("http://example.com/a/b/c").unwrap();
        assert_eq!(base.resolve("d").unwrap().path, "/a/b/d");
        assert_eq!(base.resolve("../d").unwrap().path, "/a/d");
        assert_eq!(base.resolve("/d").unwrap().path, "/d");
        assert_eq!(
            base.resolve("http://other.example/x").unwrap().host,
            "other.example"
        );
        assert_eq!(base.resolve("//other.example/x").unwrap().scheme, "http");
    }

    #[test]
    fn resolve_drops_stale_query() {
        let base = HttpUrl::parse("http://example.com/a?q=old").unwrap();
        let r = base.resolve("/b").unwrap();
        assert_eq!(r.path, "/b");
        assert_eq!(r.query, None);
    }

    #[test]
    fn webdav_wire_scheme() {
        let u = HttpUrl::parse("webdavs://example.com/dav/").unwrap();
        assert!(u.is_secure());
        assert_eq!(u.wire_scheme(), "https");
        assert_eq!(u.port, 443);
    }
}
