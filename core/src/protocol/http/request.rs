/*
 * request.rs
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

//! One logical transfer request. The engine mutates it across redirect and
//! authentication rounds, so it also carries the per-operation bookkeeping
//! (previous response code, visited URLs) that outlives a single round trip.

use std::collections::HashMap;

use crate::uri::HttpUrl;

/// HTTP and WebDAV request methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Options,
    Propfind,
    Proppatch,
    Mkcol,
    Copy,
    Move,
    Lock,
    Unlock,
    Search,
    Report,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Options => "OPTIONS",
            Method::Propfind => "PROPFIND",
            Method::Proppatch => "PROPPATCH",
            Method::Mkcol => "MKCOL",
            Method::Copy => "COPY",
            Method::Move => "MOVE",
            Method::Lock => "LOCK",
            Method::Unlock => "UNLOCK",
            Method::Search => "SEARCH",
            Method::Report => "REPORT",
        }
    }

    /// Methods whose responses are eligible for the disk cache.
    pub fn is_cacheable(&self) -> bool {
        matches!(self, Method::Get)
    }

    /// Whether a request body is expected for this verb.
    pub fn carries_body(&self) -> bool {
        matches!(
            self,
            Method::Post
                | Method::Put
                | Method::Propfind
                | Method::Proppatch
                | Method::Lock
                | Method::Search
                | Method::Report
        )
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How the disk cache participates in this request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Ignore any cached entry and fetch from the network.
    Reload,
    /// Revalidate the entry when it carries a validator, else fetch fresh.
    Refresh,
    /// Use the entry while fresh, revalidate once stale.
    #[default]
    Verify,
    /// Use the entry unconditionally; never touch the network.
    CacheOnly,
    /// Use the entry unconditionally when present.
    Cache,
}

/// One logical request. Lives for the whole operation, across however many
/// physical round trips redirects and 401/407 handling take.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: HttpUrl,
    pub proxy_url: Option<HttpUrl>,
    pub keep_alive: bool,
    /// Keep-alive timeout hint for the Connection header, seconds.
    pub keep_alive_timeout: u32,
    /// Resume offset; a Range header goes out when non-zero.
    pub range_offset: u64,
    /// Optional last byte position for the range, inclusive as on the wire.
    pub range_end: Option<u64>,
    pub cache_policy: CachePolicy,
    /// Arbitrary string metadata from the host job (extra headers, flags).
    pub metadata: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    /// Status of the current round; 0 before the first response.
    pub response_code: u16,
    /// Status of the previous round, for auth-retry detection.
    pub prev_response_code: u16,
    /// Canonical URLs seen in this operation, for the redirect-cycle guard.
    pub(crate) visited: Vec<String>,
}

impl Request {
    pub fn new(method: Method, url: HttpUrl) -> Self {
        Self {
            method,
            url,
            proxy_url: None,
            keep_alive: true,
            keep_alive_timeout: 60,
            range_offset: 0,
            range_end: None,
            cache_policy: CachePolicy::default(),
            metadata: HashMap::new(),
            body: None,
            response_code: 0,
            prev_response_code: 0,
            visited: Vec::new(),
        }
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(|s| s.as_str())
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn body(&mut self, data: Vec<u8>) -> &mut Self {
        self.body = Some(data);
        self
    }

    /// Record a response code, shifting the previous one down for the
    /// auth-retry bookkeeping.
    pub(crate) fn note_response_code(&mut self, code: u16) {
        self.prev_response_code = self.response_code;
        self.response_code = code;
    }

    /// Count one visit to a canonical URL; returns how many times it has
    /// been seen in this operation.
    pub(crate) fn note_visit(&mut self, canonical: &str) -> usize {
        self.visited.push(canonical.to_string());
        self.visited.iter().filter(|u| *u == canonical).count()
    }
}
