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

//! Disk cache for GET responses. One file per canonical URL, named by the
//! URL's SHA-1 hex digest (hash collisions are accepted as improbable).
//! Writes go through a temp file renamed into place on commit; every I/O
//! failure here is logged and swallowed, the transfer simply proceeds
//! uncached. An external cleaner process is notified about created and
//! revalidated files for its LRU/size bookkeeping.

pub mod cleaner;
pub mod entry;

pub use cleaner::{CleanerNotify, NoopNotifier, CLEANER_CMD_CREATE, CLEANER_CMD_UPDATE};
pub use entry::{CacheEntryHeader, CacheEntryMeta, BINARY_HEADER_LEN, CACHE_VERSION};

use std::fs;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::TimeZone;
use sha1::{Digest, Sha1};

use crate::protocol::http::CachePolicy;
use crate::uri::HttpUrl;

/// Default ceiling for one cached entry, bytes.
const DEFAULT_MAX_ENTRY_SIZE: i64 = 8 * 1024 * 1024;

/// Expiry window granted on a 304 that carried no fresh expiry information,
/// seconds. Such servers are misbehaving; a short window limits the damage.
const DEFAULT_REVALIDATE_WINDOW: i64 = 60;

/// What to do with the cache for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePlan {
    IgnoreCache,
    UseCached,
    ValidateCached,
}

/// An open cache entry, positioned at the start of the payload.
pub struct CacheEntry {
    pub header: CacheEntryHeader,
    pub meta: CacheEntryMeta,
    path: PathBuf,
    file: fs::File,
}

impl CacheEntry {
    pub fn read_payload(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// In-progress cache write. Nothing is persisted until the first non-empty
/// payload chunk; dropping the writer without commit discards the temp file.
pub struct CacheWriter {
    tmp_path: PathBuf,
    final_path: PathBuf,
    meta: CacheEntryMeta,
    file: Option<fs::File>,
    bytes: i64,
    max_size: i64,
    aborted: bool,
}

impl CacheWriter {
    /// Append decoded payload bytes. Errors abort the write silently; an
    /// entry growing past the size ceiling is abandoned.
    pub fn write(&mut self, data: &[u8]) {
        if self.aborted || data.is_empty() {
            return;
        }
        if self.file.is_none() {
            match self.open_and_write_meta() {
                Ok(file) => self.file = Some(file),
                Err(e) => {
                    eprintln!("[cache] cannot create {}: {}", self.tmp_path.display(), e);
                    self.abort();
                    return;
                }
            }
        }
        self.bytes += data.len() as i64;
        if self.bytes > self.max_size {
            self.abort();
            return;
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(data) {
                eprintln!("[cache] write to {} failed: {}", self.tmp_path.display(), e);
                self.abort();
            }
        }
    }

    fn open_and_write_meta(&self) -> io::Result<fs::File> {
        let mut file = fs::File::create(&self.tmp_path)?;
        // Placeholder for the binary header; the real one lands on commit.
        file.write_all(&[0u8; BINARY_HEADER_LEN])?;
        self.meta.write_to(&mut file)?;
        Ok(file)
    }

    fn abort(&mut self) {
        self.aborted = true;
        self.file = None;
        let _ = fs::remove_file(&self.tmp_path);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn bytes_written(&self) -> i64 {
        self.bytes
    }
}

impl Drop for CacheWriter {
    fn drop(&mut self) {
        // Not committed (cancellation or error path): discard.
        if self.file.is_some() {
            self.abort();
        }
    }
}

pub struct CacheStore {
    dir: PathBuf,
    /// Ceiling on entry age regardless of server expiry, seconds.
    max_age: i64,
    max_entry_size: i64,
    notifier: Box<dyn CleanerNotify>,
}

impl CacheStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        max_age: i64,
        notifier: Box<dyn CleanerNotify>,
    ) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_age,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            notifier,
        })
    }

    pub fn set_max_entry_size(&mut self, bytes: i64) {
        self.max_entry_size = bytes;
    }

    /// Cache file basename: lowercase hex SHA-1 of the canonical URL.
    pub fn file_name_for(url: &HttpUrl) -> String {
        let digest = Sha1::digest(url.canonical().as_bytes());
        crate::auth::bytes_to_hex(&digest)
    }

    fn path_for(&self, url: &HttpUrl) -> PathBuf {
        self.dir.join(Self::file_name_for(url))
    }

    /// Open the entry for a URL, if present and structurally valid. Entries
    /// from an older format version are discarded on sight.
    pub fn open(&self, url: &HttpUrl) -> Option<CacheEntry> {
        let path = self.path_for(url);
        let file = fs::File::open(&path).ok()?;
        match Self::read_entry(file, &path) {
            Ok(entry) => Some(entry),
            Err(e) => {
                eprintln!("[cache] discarding {}: {}", path.display(), e);
                let _ = fs::remove_file(&path);
                None
            }
        }
    }

    fn read_entry(file: fs::File, path: &Path) -> io::Result<CacheEntry> {
        let mut reader = BufReader::new(file);
        let mut raw = [0u8; BINARY_HEADER_LEN];
        reader.read_exact(&mut raw)?;
        let header = CacheEntryHeader::decode(&raw)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad binary header"))?;
        if !header.is_current_version() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "stale cache format version",
            ));
        }
        let (meta, text_len) = CacheEntryMeta::read_from(&mut reader)?;
        let mut file = reader.into_inner();
        file.seek(SeekFrom::Start((BINARY_HEADER_LEN + text_len) as u64))?;
        Ok(CacheEntry {
            header,
            meta,
            path: path.to_path_buf(),
            file,
        })
    }

    /// Decide how the cache participates, given the request policy and the
    /// entry (when one exists).
    pub fn plan(&self, policy: CachePolicy, entry: Option<&CacheEntry>, now: i64) -> CachePlan {
        match policy {
            CachePolicy::Reload => CachePlan::IgnoreCache,
            CachePolicy::Cache | CachePolicy::CacheOnly => match entry {
                Some(_) => CachePlan::UseCached,
                None => CachePlan::IgnoreCache,
            },
            CachePolicy::Refresh => match entry {
                Some(e) if !e.meta.etag.is_empty() || e.header.last_modified > 0 => {
                    CachePlan::ValidateCached
                }
                _ => CachePlan::IgnoreCache,
            },
            CachePolicy::Verify => match entry {
                Some(e) => {
                    if now < e.header.expire && now < e.header.served + self.max_age {
                        CachePlan::UseCached
                    } else {
                        CachePlan::ValidateCached
                    }
                }
                None => CachePlan::IgnoreCache,
            },
        }
    }

    /// Start writing a fresh entry. None when the temp file cannot even be
    /// named (cache dir gone); later failures abort the writer silently.
    pub fn begin_write(&self, url: &HttpUrl, meta: CacheEntryMeta) -> CacheWriter {
        let final_path = self.path_for(url);
        let tmp_path = final_path.with_extension("new");
        CacheWriter {
            tmp_path,
            final_path,
            meta,
            file: None,
            bytes: 0,
            max_size: self.max_entry_size,
            aborted: false,
        }
    }

    /// Finish a write: final binary header, atomic rename, cleaner ping.
    pub fn commit_write(&self, mut writer: CacheWriter, mut header: CacheEntryHeader) {
        let Some(mut file) = writer.file.take() else {
            // Nothing was ever written (empty body or aborted).
            return;
        };
        header.bytes_cached = writer.bytes as i32;
        let result = (|| -> io::Result<()> {
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&header.encode())?;
            file.flush()?;
            drop(file);
            fs::rename(&writer.tmp_path, &writer.final_path)
        })();
        match result {
            Ok(()) => {
                let name = writer
                    .final_path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                self.notifier.notify(&header, CLEANER_CMD_CREATE, &name);
            }
            Err(e) => {
                eprintln!("[cache] commit of {} failed: {}", writer.final_path.display(), e);
                let _ = fs::remove_file(&writer.tmp_path);
            }
        }
    }

    /// A 304 confirmed the entry: bump its use count and push the expiry
    /// out, from the fresh response when it said anything, else by a short
    /// default window.
    pub fn revalidated(&self, entry: &mut CacheEntry, new_expire: Option<i64>, now: i64) {
        entry.header.use_count += 1;
        entry.header.served = now;
        entry.header.expire = new_expire.unwrap_or(now + DEFAULT_REVALIDATE_WINDOW);
        self.rewrite_header(entry);
        self.notifier
            .notify(&entry.header, CLEANER_CMD_UPDATE, &entry.file_name());
    }

    /// Count one cache read.
    pub fn mark_used(&self, entry: &mut CacheEntry) {
        entry.header.use_count += 1;
        self.rewrite_header(entry);
    }

    fn rewrite_header(&self, entry: &CacheEntry) {
        let result = (|| -> io::Result<()> {
            let mut file = fs::OpenOptions::new().write(true).open(&entry.path)?;
            file.write_all(&entry.header.encode())
        })();
        if let Err(e) = result {
            eprintln!("[cache] header update of {} failed: {}", entry.path.display(), e);
        }
    }

    /// Drop the entry for a URL (revalidation said it changed).
    pub fn remove(&self, url: &HttpUrl) {
        let _ = fs::remove_file(self.path_for(url));
    }
}

/// Parse an RFC 7231 HTTP date to unix seconds.
pub fn parse_http_date(s: &str) -> Option<i64> {
    chrono::DateTime::parse_from_rfc2822(s.trim())
        .ok()
        .map(|d| d.timestamp())
}

/// Format unix seconds as an RFC 7231 HTTP date (IMF-fixdate).
pub fn format_http_date(secs: i64) -> String {
    match chrono::Utc.timestamp_opt(secs, 0) {
        chrono::LocalResult::Single(t) => t.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        _ => String::new(),
    }
}

/// Cacheability and expiry derived from one response's headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseCacheInfo {
    pub cacheable: bool,
    pub expire: i64,
    pub last_modified: i64,
    pub etag: String,
    /// True when an explicit expiry (max-age or Expires) was present.
    pub explicit_expiry: bool,
}

/// Evaluate Cache-Control/Pragma/Expires for a response served at `now`.
/// Heuristic expiry (a tenth of the Last-Modified age) applies when the
/// server gave a validator but no expiry.
pub fn response_cache_info(
    now: i64,
    cache_control: &[&str],
    pragma: &[&str],
    expires: Option<&str>,
    last_modified: Option<&str>,
    etag: Option<&str>,
) -> ResponseCacheInfo {
    let mut cacheable = true;
    let mut max_age: Option<i64> = None;
    for directive in cache_control {
        let directive = directive.trim();
        if directive.eq_ignore_ascii_case("no-cache") || directive.eq_ignore_ascii_case("no-store")
        {
            cacheable = false;
        } else if let Some(v) = directive
            .strip_prefix("max-age=")
            .or_else(|| directive.strip_prefix("Max-Age="))
        {
            max_age = v.trim().trim_matches('"').parse().ok();
        }
    }
    if pragma.iter().any(|p| p.trim().eq_ignore_ascii_case("no-cache")) {
        cacheable = false;
    }

    let last_modified = last_modified.and_then(parse_http_date).unwrap_or(0);
    let mut explicit_expiry = true;
    let expire = if let Some(age) = max_age {
        now + age.max(0)
    } else if let Some(exp) = expires.and_then(parse_http_date) {
        exp
    } else {
        explicit_expiry = false;
        if last_modified > 0 && last_modified < now {
            now + (now - last_modified) / 10
        } else {
            now
        }
    };

    ResponseCacheInfo {
        cacheable,
        expire,
        last_modified,
        etag: etag.unwrap_or_default().to_string(),
        explicit_expiry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> HttpUrl {
        HttpUrl::parse(s).unwrap()
    }

    fn store(dir: &Path) -> CacheStore {
        CacheStore::new(dir, 14 * 24 * 3600, Box::new(NoopNotifier)).unwrap()
    }

    fn write_entry(s: &CacheStore, u: &HttpUrl, payload: &[u8], expire: i64) {
        let meta = CacheEntryMeta {
            url: u.canonical(),
            etag: "\"tag\"".to_string(),
            mime_type: "text/plain".to_string(),
            header_lines: vec!["content-type: text/plain".to_string()],
        };
        let mut w = s.begin_write(u, meta);
        w.write(payload);
        let mut h = CacheEntryHeader::new(1000, 500, expire);
        h.bytes_cached = payload.len() as i32;
        s.commit_write(w, h);
    }

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let u = url("http://example.com/file.txt");
        write_entry(&s, &u, b"hello cache", 2000);

        let mut entry = s.open(&u).unwrap();
        assert_eq!(entry.meta.url, "http://example.com/file.txt");
        assert_eq!(entry.meta.mime_type, "text/plain");
        assert_eq!(entry.header.bytes_cached, 11);
        let mut payload = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = entry.read_payload(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            payload.extend_from_slice(&buf[..n]);
        }
        assert_eq!(payload, b"hello cache");
    }

    #[test]
    fn file_name_is_sha1_of_canonical_url() {
        let u = url("http://alice@example.com/a#frag");
        let plain = url("http://example.com/a");
        // Userinfo and fragment are stripped before hashing.
        assert_eq!(CacheStore::file_name_for(&u), CacheStore::file_name_for(&plain));
        assert_eq!(CacheStore::file_name_for(&u).len(), 40);
    }

    #[test]
    fn empty_body_is_not_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let u = url("http://example.com/empty");
        let w = s.begin_write(&u, CacheEntryMeta::default());
        s.commit_write(w, CacheEntryHeader::new(0, 0, 0));
        assert!(s.open(&u).is_none());
    }

    #[test]
    fn oversize_write_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = store(dir.path());
        s.set_max_entry_size(8);
        let u = url("http://example.com/big");
        let mut w = s.begin_write(&u, CacheEntryMeta::default());
        w.write(b"0123456789");
        assert!(w.is_aborted());
        s.commit_write(w, CacheEntryHeader::new(0, 0, 0));
        assert!(s.open(&u).is_none());
    }

    #[test]
    fn plan_freshness_is_monotonic_around_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let u = url("http://example.com/fresh");
        write_entry(&s, &u, b"x", 5000);
        let entry = s.open(&u).unwrap();
        for now in [1001, 2500, 4999] {
            assert_eq!(
                s.plan(CachePolicy::Verify, Some(&entry), now),
                CachePlan::UseCached
            );
        }
        for now in [5000, 5001, 99999] {
            assert_eq!(
                s.plan(CachePolicy::Verify, Some(&entry), now),
                CachePlan::ValidateCached
            );
        }
    }

    #[test]
    fn plan_policies() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let u = url("http://example.com/p");
        write_entry(&s, &u, b"x", 5000);
        let entry = s.open(&u).unwrap();

        assert_eq!(
            s.plan(CachePolicy::Reload, Some(&entry), 0),
            CachePlan::IgnoreCache
        );
        assert_eq!(
            s.plan(CachePolicy::Cache, Some(&entry), 999_999),
            CachePlan::UseCached
        );
        assert_eq!(
            s.plan(CachePolicy::CacheOnly, None, 0),
            CachePlan::IgnoreCache
        );
        // Refresh validates because the entry has a validator.
        assert_eq!(
            s.plan(CachePolicy::Refresh, Some(&entry), 0),
            CachePlan::ValidateCached
        );
    }

    #[test]
    fn refresh_without_validator_ignores_cache() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let u = url("http://example.com/nv");
        let meta = CacheEntryMeta {
            url: u.canonical(),
            etag: String::new(),
            mime_type: "text/plain".to_string(),
            header_lines: Vec::new(),
        };
        let mut w = s.begin_write(&u, meta);
        w.write(b"x");
        s.commit_write(w, CacheEntryHeader::new(1000, 0, 2000));
        let entry = s.open(&u).unwrap();
        assert_eq!(
            s.plan(CachePolicy::Refresh, Some(&entry), 0),
            CachePlan::IgnoreCache
        );
    }

    #[test]
    fn revalidation_bumps_use_count_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let s = store(dir.path());
        let u = url("http://example.com/reval");
        write_entry(&s, &u, b"x", 2000);
        let mut entry = s.open(&u).unwrap();
        assert_eq!(entry.header.use_count, 1);

        s.revalidated(&mut entry, None, 10_000);
        let reread = s.open(&u).unwrap();
        assert_eq!(reread.header.use_count, 2);
        assert_eq!(reread.header.expire, 10_000 + 60);

        let mut entry = reread;
        s.revalidated(&mut entry, Some(20_000), 10_000);
        let reread = s.open(&u).unwrap();
        assert_eq!(reread.header.expire, 20_000);
        // Payload is untouched by header rewrites.
        let mut buf = [0u8; 8];
        let mut entry = reread;
        let n = entry.read_payload(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"x");
    }

    #[test]
    fn http_date_roundtrip() {
        let t = parse_http_date("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(t, 784111777);
        assert_eq!(format_http_date(t), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn cache_info_max_age_wins() {
        let info = response_cache_info(
            1000,
            &["public", "max-age=300"],
            &[],
            Some("Sun, 06 Nov 1994 08:49:37 GMT"),
            None,
            Some("\"e\""),
        );
        assert!(info.cacheable);
        assert!(info.explicit_expiry);
        assert_eq!(info.expire, 1300);
        assert_eq!(info.etag, "\"e\"");
    }

    #[test]
    fn cache_info_no_store() {
        let info = response_cache_info(1000, &["no-store"], &[], None, None, None);
        assert!(!info.cacheable);
        let info = response_cache_info(1000, &[], &["no-cache"], None, None, None);
        assert!(!info.cacheable);
    }

    #[test]
    fn cache_info_heuristic_expiry() {
        // Served now=2000, modified at 1000: a tenth of the age.
        let lm = format_http_date(1000);
        let info = response_cache_info(2000, &[], &[], None, Some(&lm), None);
        assert!(info.cacheable);
        assert!(!info.explicit_expiry);
        assert_eq!(info.expire, 2100);
        assert_eq!(info.last_modified, 1000);
    }
}
