/*
 * entry.rs
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

//! On-disk cache entry formats: a fixed 36-byte little-endian binary header,
//! then a newline-terminated text block (canonical URL, etag, MIME type,
//! response header lines, blank line), then the raw payload bytes. The same
//! binary header prefixes cache-cleaner notification messages.

use std::io::{self, BufRead, Write};

/// Format version bytes; bumped when the layout changes.
pub const CACHE_VERSION: [u8; 2] = *b"A\n";

pub const BINARY_HEADER_LEN: usize = 36;

/// The fixed binary header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryHeader {
    pub version: [u8; 2],
    pub compressed: bool,
    pub use_count: i32,
    /// Unix seconds the entry was served/written.
    pub served: i64,
    /// Unix seconds from the Last-Modified header, 0 when absent.
    pub last_modified: i64,
    /// Unix seconds after which the entry must be revalidated.
    pub expire: i64,
    pub bytes_cached: i32,
}

impl CacheEntryHeader {
    pub fn new(served: i64, last_modified: i64, expire: i64) -> Self {
        Self {
            version: CACHE_VERSION,
            compressed: false,
            use_count: 1,
            served,
            last_modified,
            expire,
            bytes_cached: 0,
        }
    }

    pub fn is_current_version(&self) -> bool {
        self.version == CACHE_VERSION
    }

    pub fn encode(&self) -> [u8; BINARY_HEADER_LEN] {
        let mut out = [0u8; BINARY_HEADER_LEN];
        out[0..2].copy_from_slice(&self.version);
        out[2] = self.compressed as u8;
        // out[3] reserved
        out[4..8].copy_from_slice(&self.use_count.to_le_bytes());
        out[8..16].copy_from_slice(&self.served.to_le_bytes());
        out[16..24].copy_from_slice(&self.last_modified.to_le_bytes());
        out[24..32].copy_from_slice(&self.expire.to_le_bytes());
        out[32..36].copy_from_slice(&self.bytes_cached.to_le_bytes());
        out
    }

    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < BINARY_HEADER_LEN {
            return None;
        }
        let mut i64_at = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&data[at..at + 8]);
            i64::from_le_bytes(b)
        };
        Some(Self {
            version: [data[0], data[1]],
            compressed: data[2] != 0,
            use_count: i32::from_le_bytes([data[4], data[5], data[6], data[7]]),
            served: i64_at(8),
            last_modified: i64_at(16),
            expire: i64_at(24),
            bytes_cached: i32::from_le_bytes([data[32], data[33], data[34], data[35]]),
        })
    }
}

/// The text block following the binary header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CacheEntryMeta {
    pub url: String,
    /// Empty when the response had no ETag.
    pub etag: String,
    pub mime_type: String,
    /// Response header lines, stored verbatim.
    pub header_lines: Vec<String>,
}

impl CacheEntryMeta {
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        writeln!(w, "{}", self.url)?;
        writeln!(w, "{}", self.etag)?;
        writeln!(w, "{}", self.mime_type)?;
        for line in &self.header_lines {
            writeln!(w, "{}", line)?;
        }
        writeln!(w)
    }

    /// Read the text block; returns the meta and how many bytes it occupied,
    /// so the caller can seek straight to the payload.
    pub fn read_from(r: &mut impl BufRead) -> io::Result<(Self, usize)> {
        let mut consumed = 0usize;
        let mut read_line = |r: &mut dyn BufRead| -> io::Result<Option<String>> {
            let mut raw = Vec::new();
            let n = r.read_until(b'\n', &mut raw)?;
            if n == 0 {
                return Ok(None);
            }
            consumed += n;
            if raw.last() == Some(&b'\n') {
                raw.pop();
            }
            String::from_utf8(raw)
                .map(Some)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "cache meta is not UTF-8"))
        };

        let bad = || io::Error::new(io::ErrorKind::InvalidData, "truncated cache meta");
        let url = read_line(r)?.ok_or_else(bad)?;
        let etag = read_line(r)?.ok_or_else(bad)?;
        let mime_type = read_line(r)?.ok_or_else(bad)?;
        let mut header_lines = Vec::new();
        loop {
            match read_line(r)? {
                None => return Err(bad()),
                Some(line) if line.is_empty() => break,
                Some(line) => header_lines.push(line),
            }
        }
        Ok((
            Self {
                url,
                etag,
                mime_type,
                header_lines,
            },
            consumed,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_header_roundtrip() {
        let mut h = CacheEntryHeader::new(1_700_000_000, 1_690_000_000, 1_700_086_400);
        h.use_count = 7;
        h.bytes_cached = 123_456;
        let encoded = h.encode();
        assert_eq!(encoded.len(), BINARY_HEADER_LEN);
        let decoded = CacheEntryHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, h);
        assert!(decoded.is_current_version());
    }

    #[test]
    fn binary_header_layout() {
        let mut h = CacheEntryHeader::new(0, 0, 0);
        h.use_count = 1;
        let encoded = h.encode();
        assert_eq!(&encoded[0..2], &CACHE_VERSION);
        assert_eq!(encoded[2], 0); // compression flag
        assert_eq!(&encoded[4..8], &1i32.to_le_bytes());
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(CacheEntryHeader::decode(&[0u8; 35]).is_none());
    }

    #[test]
    fn stale_version_detected() {
        let mut h = CacheEntryHeader::new(0, 0, 0);
        h.version = *b"9\n";
        let decoded = CacheEntryHeader::decode(&h.encode()).unwrap();
        assert!(!decoded.is_current_version());
    }

    #[test]
    fn meta_roundtrip() {
        let meta = CacheEntryMeta {
            url: "http://example.com/a?x=1".to_string(),
            etag: "\"v2\"".to_string(),
            mime_type: "text/html".to_string(),
            header_lines: vec![
                "content-type: text/html".to_string(),
                "cache-control: max-age=60".to_string(),
            ],
        };
        let mut out = Vec::new();
        meta.write_to(&mut out).unwrap();
        out.extend_from_slice(b"PAYLOAD");

        let mut reader = io::BufReader::new(&out[..]);
        let (read, consumed) = CacheEntryMeta::read_from(&mut reader).unwrap();
        assert_eq!(read, meta);
        assert_eq!(&out[consumed..], b"PAYLOAD");
    }

    #[test]
    fn meta_roundtrip_empty_etag_and_headers() {
        let meta = CacheEntryMeta {
            url: "http://example.com/".to_string(),
            etag: String::new(),
            mime_type: "application/octet-stream".to_string(),
            header_lines: Vec::new(),
        };
        let mut out = Vec::new();
        meta.write_to(&mut out).unwrap();
        let mut reader = io::BufReader::new(&out[..]);
        let (read, _) = CacheEntryMeta::read_from(&mut reader).unwrap();
        assert_eq!(read, meta);
    }
}
