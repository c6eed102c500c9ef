/*
 * engine.rs
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

//! The request engine: composes request heads, drives the read loop over an
//! injected byte stream, and implements the retry/redirect/authentication
//! policy around the tokenizer, decode pipeline, and disk cache. One engine
//! owns one connection; a logical request may take several rounds on it.

use std::io;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::auth::{
    choose_best_index, split_offers, AuthContext, Authenticator, ContextProvider,
};
use crate::cache::{
    format_http_date, response_cache_info, CacheEntry, CacheEntryHeader, CacheEntryMeta,
    CachePlan, CacheStore,
};
use crate::config::{
    ConfigMap, CredentialCache, CredentialEntry, KEY_ACCEPT, KEY_ERROR_PAGE, KEY_USER_AGENT,
    KEY_USE_CACHE,
};
use crate::uri::HttpUrl;

use super::decode::{BodyFraming, Dechunker, DecodePipeline};
use super::error::{error_for_status, ErrorKind, TransferError};
use super::handler::TransferHandler;
use super::headers::{tokenize, Tokenized, RESPONSE_FIELDS};
use super::request::{CachePolicy, Method, Request};
use super::response::Response;

/// Seeing one exact URL more than this often in one operation is a cycle.
const MAX_SAME_URL_VISITS: usize = 5;
/// Cap on 100/102 responses discarded per round trip.
const MAX_INFORMATIONAL_RESPONSES: u32 = 5;
const MAX_HEADER_BYTES: usize = 128 * 1024;
const READ_CHUNK: usize = 8192;
const DEFAULT_USER_AGENT: &str = concat!("carrucola/", env!("CARGO_PKG_VERSION"));

/// Result of `run` for one logical request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Finished; all events went to the handler.
    Complete,
    /// The request now points at a different origin. Reconnect there, call
    /// `reset_stream`, and run again; the redirect guard carries over.
    Redirect(HttpUrl),
    /// The connection went stale or closed mid-negotiation. Reconnect to
    /// the same origin, call `reset_stream`, and run again; authentication
    /// progress is preserved.
    NeedsRetry,
}

enum Round {
    Complete,
    Redirect(HttpUrl),
    AuthRetry,
    RetryWithoutRange,
    Stale,
}

pub struct RequestEngine<S> {
    stream: S,
    read_buf: BytesMut,
    config: ConfigMap,
    credentials: CredentialCache,
    cache: Option<CacheStore>,
    auth: Option<AuthContext>,
    proxy_auth: Option<AuthContext>,
    pending_auth_header: Option<String>,
    pending_proxy_auth_header: Option<String>,
    used_www_credentials: Option<(String, String)>,
    used_proxy_credentials: Option<(String, String)>,
    negotiate_provider: Option<Box<dyn Fn() -> Box<dyn ContextProvider> + Send>>,
    /// The stream came from a keep-alive pool; its first failure is retried.
    reused: bool,
    /// The connection is still usable for another round.
    alive: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> RequestEngine<S> {
    pub fn new(stream: S, config: ConfigMap) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            config,
            credentials: CredentialCache::new(),
            cache: None,
            auth: None,
            proxy_auth: None,
            pending_auth_header: None,
            pending_proxy_auth_header: None,
            used_www_credentials: None,
            used_proxy_credentials: None,
            negotiate_provider: None,
            reused: false,
            alive: true,
        }
    }

    pub fn with_cache(mut self, cache: CacheStore) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialCache) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    pub fn credentials_mut(&mut self) -> &mut CredentialCache {
        &mut self.credentials
    }

    /// Install the platform security layer used for Negotiate. Without one,
    /// Negotiate offers are skipped.
    pub fn set_negotiate_provider(
        &mut self,
        factory: Box<dyn Fn() -> Box<dyn ContextProvider> + Send>,
    ) {
        self.negotiate_provider = Some(factory);
    }

    /// Mark the stream as coming from a keep-alive pool: its first failure
    /// is reported as `Outcome::NeedsRetry` instead of an error.
    pub fn set_connection_reused(&mut self, reused: bool) {
        self.reused = reused;
    }

    /// Swap in a fresh connection after `NeedsRetry` or a cross-origin
    /// redirect, keeping authentication and redirect state.
    pub fn reset_stream(&mut self, stream: S) {
        self.stream = stream;
        self.read_buf.clear();
        self.reused = false;
        self.alive = true;
    }

    pub fn into_stream(self) -> S {
        self.stream
    }

    /// Drive one logical request to completion, following same-origin
    /// redirects and authentication retries internally. Terminal failures
    /// are reported through `handler.error` and returned.
    pub async fn run(
        &mut self,
        request: &mut Request,
        handler: &mut dyn TransferHandler,
    ) -> Result<Outcome, TransferError> {
        let mut range_retried = false;
        loop {
            let round = match self.round(request, handler, &mut range_retried).await {
                Ok(r) => r,
                Err(e) => {
                    handler.error(e.kind, &e.message);
                    return Err(e);
                }
            };
            match round {
                Round::Complete => return Ok(Outcome::Complete),
                Round::Stale => return Ok(Outcome::NeedsRetry),
                Round::AuthRetry | Round::RetryWithoutRange => {
                    if !self.alive {
                        return Ok(Outcome::NeedsRetry);
                    }
                }
                Round::Redirect(target) => {
                    let visits = request.note_visit(&target.canonical());
                    if visits > MAX_SAME_URL_VISITS {
                        let e = TransferError::new(
                            ErrorKind::CyclicRedirect,
                            format!(
                                "{} was redirected to more than {} times",
                                target.canonical(),
                                MAX_SAME_URL_VISITS
                            ),
                        );
                        handler.error(e.kind, &e.message);
                        return Err(e);
                    }
                    handler.redirection(&target);
                    if matches!(request.response_code, 301 | 302 | 303)
                        && request.method != Method::Head
                    {
                        request.method = Method::Get;
                        request.body = None;
                    }
                    let same_origin = target.scheme == request.url.scheme
                        && target.host == request.url.host
                        && target.port == request.url.port;
                    request.url = target;
                    if !(same_origin && self.alive) {
                        return Ok(Outcome::Redirect(request.url.clone()));
                    }
                }
            }
        }
    }

    /// Batch ("multi-get") mode: all GET heads go out back-to-back, then the
    /// responses are consumed strictly in request order. No redirect or
    /// authentication retries happen inside a batch; per-request failures go
    /// to the handler and the batch moves on while the framing holds.
    pub async fn run_batch(
        &mut self,
        requests: &mut [Request],
        handler: &mut dyn TransferHandler,
    ) -> Result<(), TransferError> {
        if requests.iter().any(|r| r.method != Method::Get) {
            return Err(TransferError::new(
                ErrorKind::UnsupportedAction,
                "batch mode only supports GET",
            ));
        }
        let mut heads = String::new();
        for request in requests.iter_mut() {
            let head = self.compose_head(request, None);
            heads.push_str(&head);
        }
        self.send_request(&heads, None).await?;

        for request in requests.iter_mut() {
            let (response, mut hbuf) = self.read_response().await?;
            let status_len = status_line_len(&hbuf);
            let header_lines = cache_header_lines(&hbuf[status_len..]);
            let tok = tokenize(&mut hbuf, status_len, RESPONSE_FIELDS);
            let keep_alive = compute_keep_alive(&response, &hbuf, &tok);
            self.alive = keep_alive;
            request.note_response_code(response.code);
            if response.is_success() {
                self.deliver_body(
                    request,
                    handler,
                    &response,
                    &hbuf,
                    &tok,
                    keep_alive,
                    header_lines,
                    unix_now(),
                )
                .await?;
            } else {
                self.drain_body(request.method, &response, &hbuf, &tok, keep_alive)
                    .await?;
                let e = error_for_status(response.code, request.method, &request.url.canonical());
                handler.error(e.kind, &e.message);
            }
        }
        Ok(())
    }

    async fn round(
        &mut self,
        request: &mut Request,
        handler: &mut dyn TransferHandler,
        range_retried: &mut bool,
    ) -> Result<Round, TransferError> {
        let now = unix_now();

        let mut validator: Option<CacheEntry> = None;
        if self.cache.is_some()
            && self.config.get_bool(KEY_USE_CACHE, true)
            && request.method.is_cacheable()
        {
            let store = self.cache.as_ref().unwrap();
            let entry = store.open(&request.url);
            match store.plan(request.cache_policy, entry.as_ref(), now) {
                CachePlan::UseCached => {
                    let mut entry = entry.unwrap();
                    store.mark_used(&mut entry);
                    return self.serve_payload(&mut entry, handler);
                }
                CachePlan::ValidateCached => validator = entry,
                CachePlan::IgnoreCache => {}
            }
        }
        if request.cache_policy == CachePolicy::CacheOnly {
            return Err(TransferError::new(
                ErrorKind::DoesNotExist,
                format!("{} is not in the cache", request.url.canonical()),
            ));
        }

        self.preemptive_auth(request);

        let head = self.compose_head(request, validator.as_ref());
        if let Err(e) = self.send_request(&head, request.body.as_deref()).await {
            if self.reused {
                self.reused = false;
                self.alive = false;
                return Ok(Round::Stale);
            }
            return Err(e);
        }

        let (response, mut hbuf) = match self.read_response().await {
            Ok(r) => r,
            Err(e) => {
                // A dead keep-alive connection shows up here as EOF or
                // garbage; give the caller one reconnect before failing.
                if self.reused {
                    self.reused = false;
                    self.alive = false;
                    return Ok(Round::Stale);
                }
                return Err(e);
            }
        };
        self.reused = false;

        let status_len = status_line_len(&hbuf);
        let header_lines = cache_header_lines(&hbuf[status_len..]);
        let tok = tokenize(&mut hbuf, status_len, RESPONSE_FIELDS);
        let keep_alive = compute_keep_alive(&response, &hbuf, &tok);
        self.alive = keep_alive;
        request.note_response_code(response.code);

        match response.code {
            401 | 407 => {
                self.drain_body(request.method, &response, &hbuf, &tok, keep_alive)
                    .await?;
                self.handle_auth(request, &hbuf, &tok, response.code)?;
                Ok(Round::AuthRetry)
            }
            code if response.is_redirect() => {
                self.drain_body(request.method, &response, &hbuf, &tok, keep_alive)
                    .await?;
                let location = tok.first(&hbuf, "location").ok_or_else(|| {
                    error_for_status(code, request.method, &request.url.canonical())
                })?;
                let mut target = request.url.resolve(location).map_err(|e| {
                    TransferError::new(
                        ErrorKind::MalformedResponse,
                        format!("bad redirect location: {}", e),
                    )
                })?;
                // Servers routinely drop the fragment; put the original back.
                if target.fragment.is_none() {
                    target.fragment = request.url.fragment.clone();
                }
                Ok(Round::Redirect(target))
            }
            304 => {
                if let Some(mut entry) = validator.take() {
                    let cc = tok.all(&hbuf, "cache-control");
                    let pragma = tok.all(&hbuf, "pragma");
                    let info = response_cache_info(
                        now,
                        &cc,
                        &pragma,
                        tok.first(&hbuf, "expires"),
                        tok.first(&hbuf, "last-modified"),
                        tok.first(&hbuf, "etag"),
                    );
                    let store = self.cache.as_ref().unwrap();
                    store.revalidated(
                        &mut entry,
                        info.explicit_expiry.then_some(info.expire),
                        now,
                    );
                    self.commit_credentials(request);
                    self.serve_payload(&mut entry, handler)
                } else {
                    // The caller sent its own validators; nothing to deliver.
                    handler.data(&[]);
                    Ok(Round::Complete)
                }
            }
            416 if request.range_offset > 0 && !*range_retried => {
                *range_retried = true;
                request.range_offset = 0;
                request.range_end = None;
                self.drain_body(request.method, &response, &hbuf, &tok, keep_alive)
                    .await?;
                Ok(Round::RetryWithoutRange)
            }
            _ if response.is_success() => {
                self.commit_credentials(request);
                self.deliver_body(
                    request,
                    handler,
                    &response,
                    &hbuf,
                    &tok,
                    keep_alive,
                    header_lines,
                    now,
                )
                .await?;
                Ok(Round::Complete)
            }
            code => {
                let prefer_body = request
                    .metadata(KEY_ERROR_PAGE)
                    .map(|v| v == "true" || v == "1")
                    .unwrap_or_else(|| self.config.get_bool(KEY_ERROR_PAGE, false));
                if prefer_body {
                    self.deliver_body(
                        request,
                        handler,
                        &response,
                        &hbuf,
                        &tok,
                        keep_alive,
                        Vec::new(),
                        now,
                    )
                    .await?;
                    Ok(Round::Complete)
                } else {
                    self.drain_body(request.method, &response, &hbuf, &tok, keep_alive)
                        .await?;
                    Err(error_for_status(code, request.method, &request.url.canonical()))
                }
            }
        }
    }

    /// Compose the request head. Consumes any pending authentication
    /// headers produced by the previous round.
    fn compose_head(&mut self, request: &Request, validator: Option<&CacheEntry>) -> String {
        let url = &request.url;
        let via_proxy = request.proxy_url.is_some() && !url.is_secure();
        let target = if via_proxy {
            url.absolute_target()
        } else {
            url.request_target()
        };
        let mut head = format!("{} {} HTTP/1.1\r\n", request.method.as_str(), target);
        head.push_str(&format!("Host: {}\r\n", url.host_header()));

        let agent = request
            .metadata(KEY_USER_AGENT)
            .or_else(|| self.config.get(KEY_USER_AGENT))
            .unwrap_or(DEFAULT_USER_AGENT);
        head.push_str(&format!("User-Agent: {}\r\n", agent));
        let accept = request
            .metadata(KEY_ACCEPT)
            .or_else(|| self.config.get(KEY_ACCEPT))
            .unwrap_or("*/*");
        head.push_str(&format!("Accept: {}\r\n", accept));
        head.push_str("Accept-Encoding: gzip, deflate\r\n");

        let force_keep_alive = self
            .auth
            .as_ref()
            .map(|a| a.forces_keep_alive())
            .unwrap_or(false)
            || self
                .proxy_auth
                .as_ref()
                .map(|a| a.forces_keep_alive())
                .unwrap_or(false);
        let keep_alive = request.keep_alive || force_keep_alive;
        let connection_header = if via_proxy { "Proxy-Connection" } else { "Connection" };
        if keep_alive {
            head.push_str(&format!("{}: keep-alive\r\n", connection_header));
            if request.keep_alive_timeout > 0 {
                head.push_str(&format!("Keep-Alive: {}\r\n", request.keep_alive_timeout));
            }
        } else {
            head.push_str(&format!("{}: close\r\n", connection_header));
        }

        if request.range_offset > 0 || request.range_end.is_some() {
            match request.range_end {
                Some(end) => head.push_str(&format!(
                    "Range: bytes={}-{}\r\n",
                    request.range_offset, end
                )),
                None => head.push_str(&format!("Range: bytes={}-\r\n", request.range_offset)),
            }
        }

        if let Some(entry) = validator {
            if !entry.meta.etag.is_empty() {
                head.push_str(&format!("If-None-Match: {}\r\n", entry.meta.etag));
            }
            if entry.header.last_modified > 0 {
                head.push_str(&format!(
                    "If-Modified-Since: {}\r\n",
                    format_http_date(entry.header.last_modified)
                ));
            }
        }

        if let Some(value) = self.pending_auth_header.take() {
            head.push_str(&format!("Authorization: {}\r\n", value));
        }
        if let Some(value) = self.pending_proxy_auth_header.take() {
            head.push_str(&format!("Proxy-Authorization: {}\r\n", value));
        }

        if let Some(extra) = request.metadata("customHTTPHeader") {
            for line in extra.lines() {
                let line = line.trim();
                if !line.is_empty() {
                    head.push_str(line);
                    head.push_str("\r\n");
                }
            }
        }

        if let Some(body) = &request.body {
            head.push_str(&format!("Content-Length: {}\r\n", body.len()));
            if let Some(ct) = request.metadata("contentType") {
                head.push_str(&format!("Content-Type: {}\r\n", ct));
            }
        }
        head.push_str("\r\n");
        head
    }

    /// Build a pre-emptive Authorization header from cached credentials for
    /// this protection space, before the server has to ask.
    fn preemptive_auth(&mut self, request: &Request) {
        if self.auth.is_some() || self.pending_auth_header.is_some() {
            return;
        }
        let root = request.url.root();
        let Some(entry) = self.credentials.lookup_any(&root).cloned() else {
            return;
        };
        let Some(blob) = entry.challenge_blob.clone() else {
            return;
        };
        let offers = split_offers(&blob);
        let Some(offer) = offers.first() else {
            return;
        };
        let Some(mut ctx) = AuthContext::new_from_offer(offer, &self.config, None) else {
            return;
        };
        if ctx.set_challenge(offer, &request.url, request.method).is_err() {
            return;
        }
        if let AuthContext::Digest(digest) = &ctx {
            if !digest.covers(&request.url) {
                return;
            }
        }
        ctx.fill_cached_credentials(&entry);
        if let Some(value) = ctx.generate_response(&entry.username, &entry.password) {
            self.pending_auth_header = Some(value);
            self.used_www_credentials = Some((entry.username, entry.password));
            self.auth = Some(ctx);
        }
    }

    /// React to a 401/407: pick the strongest usable offer, advance or
    /// restart its state machine, and queue the header for the next round.
    /// Access denied surfaces only when the chosen scheme is at its final
    /// stage or no offer is usable.
    fn handle_auth(
        &mut self,
        request: &mut Request,
        hbuf: &[u8],
        tok: &Tokenized,
        code: u16,
    ) -> Result<(), TransferError> {
        let proxy = code == 407;
        let header = if proxy { "proxy-authenticate" } else { "www-authenticate" };
        let joined = tok.joined(hbuf, header).unwrap_or_default();
        let mut offers = split_offers(&joined);
        let target_url = if proxy {
            request.proxy_url.clone().unwrap_or_else(|| request.url.clone())
        } else {
            request.url.clone()
        };

        loop {
            let Some(best) = choose_best_index(&offers) else {
                return Err(TransferError::new(
                    ErrorKind::AccessDenied,
                    format!("access to {} was denied", request.url.canonical()),
                ));
            };
            let offer = offers[best].clone();

            let slot = if proxy { &mut self.proxy_auth } else { &mut self.auth };
            let existing = slot.take();
            let mut ctx = match existing {
                Some(ctx) if ctx.scheme_name().eq_ignore_ascii_case(&offer.scheme) => {
                    // A repeated challenge after the final stage is a
                    // rejection, unless it continues the handshake (a
                    // continuation token, a stale nonce).
                    if request.prev_response_code == code
                        && ctx.is_final_stage()
                        && !ctx.challenge_continues(&offer)
                    {
                        return Err(TransferError::new(
                            ErrorKind::AccessDenied,
                            format!("access to {} was denied", request.url.canonical()),
                        ));
                    }
                    ctx
                }
                _ => {
                    let provider = if offer.scheme.eq_ignore_ascii_case("Negotiate") {
                        self.negotiate_provider.as_ref().map(|f| f())
                    } else {
                        None
                    };
                    match AuthContext::new_from_offer(&offer, &self.config, provider) {
                        Some(ctx) => ctx,
                        None => {
                            offers.remove(best);
                            continue;
                        }
                    }
                }
            };

            if let Err(e) = ctx.set_challenge(&offer, &target_url, request.method) {
                eprintln!("[auth] rejected {} challenge: {}", offer.scheme, e);
                offers.remove(best);
                continue;
            }

            let mut username = String::new();
            let mut password = String::new();
            if ctx.needs_credentials() {
                let found = {
                    if let Some(user) = &target_url.user {
                        Some((user.clone(), target_url.password.clone().unwrap_or_default()))
                    } else {
                        let root = target_url.root();
                        let cached = self
                            .credentials
                            .lookup(&root, ctx.realm())
                            .or_else(|| self.credentials.lookup_any(&root))
                            .cloned();
                        match cached {
                            Some(entry) => {
                                ctx.fill_cached_credentials(&entry);
                                Some((entry.username, entry.password))
                            }
                            None => match request.metadata("username") {
                                Some(u) => Some((
                                    u.to_string(),
                                    request.metadata("password").unwrap_or_default().to_string(),
                                )),
                                None => None,
                            },
                        }
                    }
                };
                match found {
                    Some((u, p)) => {
                        username = u;
                        password = p;
                    }
                    None => {
                        eprintln!("[auth] no credentials for {} {}", offer.scheme, ctx.realm());
                        offers.remove(best);
                        continue;
                    }
                }
            }

            match ctx.generate_response(&username, &password) {
                Some(value) => {
                    if proxy {
                        self.pending_proxy_auth_header = Some(value);
                        self.used_proxy_credentials = Some((username, password));
                        self.proxy_auth = Some(ctx);
                    } else {
                        self.pending_auth_header = Some(value);
                        self.used_www_credentials = Some((username, password));
                        self.auth = Some(ctx);
                    }
                    return Ok(());
                }
                None => {
                    eprintln!(
                        "[auth] {} failed: {}",
                        offer.scheme,
                        ctx.failure().unwrap_or("unknown failure")
                    );
                    offers.remove(best);
                }
            }
        }
    }

    /// After a successful round whose status changed, commit the credentials
    /// that got us here, once.
    fn commit_credentials(&mut self, request: &Request) {
        if request.response_code == request.prev_response_code {
            return;
        }
        if let (Some(ctx), Some((user, password))) =
            (self.auth.as_ref(), self.used_www_credentials.as_ref())
        {
            let root = request.url.root();
            let realm = ctx.realm().to_string();
            if !self.credentials.contains(&root, &realm) {
                self.credentials.store(
                    &root,
                    &realm,
                    CredentialEntry {
                        username: user.clone(),
                        password: password.clone(),
                        challenge_blob: ctx.challenge_blob(),
                    },
                );
            }
        }
        if let (Some(ctx), Some((user, password)), Some(proxy)) = (
            self.proxy_auth.as_ref(),
            self.used_proxy_credentials.as_ref(),
            request.proxy_url.as_ref(),
        ) {
            let root = proxy.root();
            let realm = ctx.realm().to_string();
            if !self.credentials.contains(&root, &realm) {
                self.credentials.store(
                    &root,
                    &realm,
                    CredentialEntry {
                        username: user.clone(),
                        password: password.clone(),
                        challenge_blob: ctx.challenge_blob(),
                    },
                );
            }
        }
    }

    fn serve_payload(
        &self,
        entry: &mut CacheEntry,
        handler: &mut dyn TransferHandler,
    ) -> Result<Round, TransferError> {
        handler.mime_type(&entry.meta.mime_type);
        handler.total_size(entry.header.bytes_cached.max(0) as u64);
        let mut processed = 0u64;
        let mut buf = [0u8; 16 * 1024];
        loop {
            match entry.read_payload(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    handler.data(&buf[..n]);
                    processed += n as u64;
                    handler.processed_size(processed);
                }
                Err(e) => {
                    // Cache trouble is never surfaced; end the body early.
                    eprintln!("[cache] read failed: {}", e);
                    break;
                }
            }
        }
        handler.data(&[]);
        Ok(Round::Complete)
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver_body(
        &mut self,
        request: &Request,
        handler: &mut dyn TransferHandler,
        response: &Response,
        hbuf: &[u8],
        tok: &Tokenized,
        keep_alive: bool,
        header_lines: Vec<String>,
        now: i64,
    ) -> Result<(), TransferError> {
        let advertised = tok
            .first(hbuf, "content-type")
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_ascii_lowercase())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        let encodings = tok.all(hbuf, "content-encoding");
        let mut pipeline = DecodePipeline::new(&encodings, tok.first(hbuf, "content-md5"));
        let mime = pipeline
            .corrected_mime_type()
            .map(str::to_string)
            .unwrap_or(advertised);
        handler.mime_type(&mime);

        let framing = framing_for(request.method, response.code, hbuf, tok, keep_alive);
        if let BodyFraming::ContentLength(total) = framing {
            handler.total_size(total);
        }

        let mut writer = None;
        let mut commit_header = None;
        if response.code == 200
            && request.method.is_cacheable()
            && self.config.get_bool(KEY_USE_CACHE, true)
        {
            if let Some(store) = &self.cache {
                let cc = tok.all(hbuf, "cache-control");
                let pragma = tok.all(hbuf, "pragma");
                let info = response_cache_info(
                    now,
                    &cc,
                    &pragma,
                    tok.first(hbuf, "expires"),
                    tok.first(hbuf, "last-modified"),
                    tok.first(hbuf, "etag"),
                );
                if info.cacheable {
                    let meta = CacheEntryMeta {
                        url: request.url.canonical(),
                        etag: info.etag.clone(),
                        mime_type: mime.clone(),
                        header_lines,
                    };
                    writer = Some(store.begin_write(&request.url, meta));
                    commit_header =
                        Some(CacheEntryHeader::new(now, info.last_modified, info.expire));
                }
            }
        }

        let mut processed = 0u64;
        {
            let mut sink = |chunk: &[u8]| -> io::Result<()> {
                if chunk.is_empty() {
                    return Ok(());
                }
                handler.data(chunk);
                if let Some(w) = writer.as_mut() {
                    w.write(chunk);
                }
                processed += chunk.len() as u64;
                handler.processed_size(processed);
                Ok(())
            };
            let mut on_raw = |raw: &[u8]| pipeline.push(raw, &mut sink);
            self.consume_body(framing, &mut on_raw).await?;
            pipeline.finish(&mut sink).map_err(TransferError::from)?;
        }
        handler.data(&[]);

        if let (Some(w), Some(h)) = (writer, commit_header) {
            if let Some(store) = &self.cache {
                store.commit_write(w, h);
            }
        }
        Ok(())
    }

    async fn drain_body(
        &mut self,
        method: Method,
        response: &Response,
        hbuf: &[u8],
        tok: &Tokenized,
        keep_alive: bool,
    ) -> Result<(), TransferError> {
        let framing = framing_for(method, response.code, hbuf, tok, keep_alive);
        self.consume_body(framing, &mut |_| Ok(())).await
    }

    /// Read the body per its framing, handing raw (dechunked but still
    /// content-encoded) bytes to `on_raw`.
    async fn consume_body(
        &mut self,
        framing: BodyFraming,
        on_raw: &mut dyn FnMut(&[u8]) -> io::Result<()>,
    ) -> Result<(), TransferError> {
        match framing {
            BodyFraming::None => Ok(()),
            BodyFraming::ContentLength(total) => {
                let mut remaining = total;
                while remaining > 0 {
                    if self.read_buf.is_empty() && self.fill_read_buf().await? == 0 {
                        // Some servers report the compressed size; treat the
                        // early close as end-of-data rather than an error.
                        eprintln!(
                            "[http] body ended {} bytes short of Content-Length",
                            remaining
                        );
                        self.alive = false;
                        break;
                    }
                    let take = (remaining as usize).min(self.read_buf.len());
                    if take > 0 {
                        let chunk = self.read_buf.split_to(take);
                        on_raw(&chunk).map_err(TransferError::from)?;
                        remaining -= take as u64;
                    }
                }
                Ok(())
            }
            BodyFraming::Chunked => {
                let mut dechunker = Dechunker::new();
                loop {
                    dechunker
                        .decode(&mut self.read_buf, on_raw)
                        .map_err(TransferError::from)?;
                    if dechunker.is_done() {
                        break;
                    }
                    if self.fill_read_buf().await? == 0 {
                        eprintln!("[http] connection closed inside a chunked body");
                        self.alive = false;
                        break;
                    }
                }
                Ok(())
            }
            BodyFraming::UntilClose => {
                loop {
                    if !self.read_buf.is_empty() {
                        let chunk = self.read_buf.split_to(self.read_buf.len());
                        on_raw(&chunk).map_err(TransferError::from)?;
                    }
                    if self.fill_read_buf().await? == 0 {
                        break;
                    }
                }
                self.alive = false;
                Ok(())
            }
        }
    }

    async fn send_request(&mut self, head: &str, body: Option<&[u8]>) -> Result<(), TransferError> {
        self.stream.write_all(head.as_bytes()).await?;
        if let Some(body) = body {
            self.stream.write_all(body).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    /// Read status line plus headers, transparently discarding up to
    /// `MAX_INFORMATIONAL_RESPONSES` interim 1xx responses.
    async fn read_response(&mut self) -> Result<(Response, Vec<u8>), TransferError> {
        let mut informational = 0u32;
        loop {
            let hbuf = self.read_header_block().await?;
            let status_len = status_line_len(&hbuf);
            match Response::parse_status_line(&hbuf[..status_len]) {
                Some(r) if r.is_informational() => {
                    informational += 1;
                    if informational > MAX_INFORMATIONAL_RESPONSES {
                        return Err(TransferError::new(
                            ErrorKind::MalformedResponse,
                            "server keeps sending informational responses",
                        ));
                    }
                }
                Some(r) => return Ok((r, hbuf)),
                None => {
                    return Err(TransferError::new(
                        ErrorKind::MalformedResponse,
                        "unparseable status line",
                    ))
                }
            }
        }
    }

    async fn read_header_block(&mut self) -> Result<Vec<u8>, TransferError> {
        loop {
            if let Some(end) = find_header_end(&self.read_buf) {
                return Ok(self.read_buf.split_to(end).to_vec());
            }
            if self.read_buf.len() > MAX_HEADER_BYTES {
                return Err(TransferError::new(
                    ErrorKind::MalformedResponse,
                    "response header block too large",
                ));
            }
            if self.fill_read_buf().await? == 0 {
                return Err(TransferError::new(
                    ErrorKind::ConnectionBroken,
                    "connection closed while reading response headers",
                ));
            }
        }
    }

    async fn fill_read_buf(&mut self) -> io::Result<usize> {
        let mut tmp = [0u8; READ_CHUNK];
        let n = self.stream.read(&mut tmp).await?;
        if n > 0 {
            self.read_buf.extend_from_slice(&tmp[..n]);
        }
        Ok(n)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn status_line_len(hbuf: &[u8]) -> usize {
    hbuf.iter()
        .position(|&b| b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(hbuf.len())
}

/// Offset just past the blank line ending the header block, if present.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            if i + 1 < buf.len() && buf[i + 1] == b'\n' {
                return Some(i + 2);
            }
            if i + 2 < buf.len() && buf[i + 1] == b'\r' && buf[i + 2] == b'\n' {
                return Some(i + 3);
            }
        }
        i += 1;
    }
    None
}

/// Raw header lines for the cache's text block. Taken before tokenization,
/// which rearranges the buffer in place.
fn cache_header_lines(raw: &[u8]) -> Vec<String> {
    let mut lines = Vec::new();
    for line in raw.split(|&b| b == b'\n') {
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };
        if line.is_empty() {
            break;
        }
        lines.push(String::from_utf8_lossy(line).into_owned());
    }
    lines
}

fn compute_keep_alive(response: &Response, hbuf: &[u8], tok: &Tokenized) -> bool {
    let mut keep_alive = response.http11;
    for value in tok
        .all(hbuf, "connection")
        .iter()
        .chain(tok.all(hbuf, "proxy-connection").iter())
    {
        if value.eq_ignore_ascii_case("close") {
            keep_alive = false;
        } else if value.eq_ignore_ascii_case("keep-alive") {
            keep_alive = true;
        }
    }
    keep_alive
}

fn framing_for(
    method: Method,
    code: u16,
    hbuf: &[u8],
    tok: &Tokenized,
    keep_alive: bool,
) -> BodyFraming {
    if method == Method::Head || code == 204 || code == 304 || (100..200).contains(&code) {
        return BodyFraming::None;
    }
    if tok
        .all(hbuf, "transfer-encoding")
        .iter()
        .any(|v| v.eq_ignore_ascii_case("chunked"))
    {
        return BodyFraming::Chunked;
    }
    if let Some(length) = tok
        .first(hbuf, "content-length")
        .and_then(|v| v.trim().parse::<u64>().ok())
    {
        return if length == 0 {
            BodyFraming::None
        } else {
            BodyFraming::ContentLength(length)
        };
    }
    // Without a length, read-until-close is only legal when the connection
    // closes; a keep-alive response without one has no body.
    if keep_alive {
        BodyFraming::None
    } else {
        BodyFraming::UntilClose
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok_of(buf: &mut Vec<u8>) -> Tokenized {
        let start = status_line_len(buf);
        tokenize(buf, start, RESPONSE_FIELDS)
    }

    #[test]
    fn header_end_detection() {
        assert_eq!(find_header_end(b"HTTP/1.1 200 OK\r\n\r\nBODY"), Some(19));
        assert_eq!(find_header_end(b"a\nb\n\nrest"), Some(5));
        assert_eq!(find_header_end(b"a\r\nb\r\n"), None);
    }

    #[test]
    fn framing_rules() {
        let mut hbuf = b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n".to_vec();
        let tok = tok_of(&mut hbuf);
        assert_eq!(
            framing_for(Method::Get, 200, &hbuf, &tok, true),
            BodyFraming::ContentLength(10)
        );
        assert_eq!(
            framing_for(Method::Head, 200, &hbuf, &tok, true),
            BodyFraming::None
        );
        assert_eq!(
            framing_for(Method::Get, 304, &hbuf, &tok, true),
            BodyFraming::None
        );

        let mut hbuf = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        let tok = tok_of(&mut hbuf);
        assert_eq!(
            framing_for(Method::Get, 200, &hbuf, &tok, true),
            BodyFraming::Chunked
        );

        let mut hbuf = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        let tok = tok_of(&mut hbuf);
        assert_eq!(
            framing_for(Method::Get, 200, &hbuf, &tok, false),
            BodyFraming::UntilClose
        );
        assert_eq!(
            framing_for(Method::Get, 200, &hbuf, &tok, true),
            BodyFraming::None
        );
    }

    #[test]
    fn keep_alive_rules() {
        let r11 = Response::parse_status_line(b"HTTP/1.1 200 OK").unwrap();
        let r10 = Response::parse_status_line(b"HTTP/1.0 200 OK").unwrap();

        let mut hbuf = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        let tok = tok_of(&mut hbuf);
        assert!(compute_keep_alive(&r11, &hbuf, &tok));
        assert!(!compute_keep_alive(&r10, &hbuf, &tok));

        let mut hbuf = b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n".to_vec();
        let tok = tok_of(&mut hbuf);
        assert!(!compute_keep_alive(&r11, &hbuf, &tok));

        let mut hbuf = b"HTTP/1.0 200 OK\r\nConnection: keep-alive\r\n\r\n".to_vec();
        let tok = tok_of(&mut hbuf);
        assert!(compute_keep_alive(&r10, &hbuf, &tok));
    }

    #[test]
    fn cache_lines_stop_at_blank() {
        let lines = cache_header_lines(b"A: 1\r\nB: 2\r\n\r\nPAYLOAD");
        assert_eq!(lines, vec!["A: 1".to_string(), "B: 2".to_string()]);
    }
}
