/*
 * decode.rs
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

//! Response body decoding: chunked transfer framing, content decompression
//! (gzip, deflate), and Content-MD5 verification. The dechunker is a push
//! state machine fed from the read buffer, re-entrant at chunk boundaries;
//! the content decoders chain behind it in reverse of the order the server
//! applied them.

use std::io::{self, Write};

use bytes::{Buf, BytesMut};
use md5::{Digest, Md5};

use base64::Engine;

/// How the body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    ContentLength(u64),
    Chunked,
    /// Only legal for non-keep-alive responses without a length.
    UntilClose,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data,
    /// CRLF after a chunk's data.
    DataEnd,
    Trailer,
    Done,
}

/// Chunked transfer decoder. Feed bytes via `decode`; data pieces go to the
/// callback as they complete. Partial lines stay in the buffer for the next
/// call.
pub struct Dechunker {
    state: ChunkState,
    remaining: u64,
}

impl Dechunker {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            remaining: 0,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    fn find_crlf(buf: &[u8]) -> Option<usize> {
        let mut i = 0;
        while i + 1 < buf.len() {
            if buf[i] == b'\r' && buf[i + 1] == b'\n' {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// Consume as much as possible from `buf`. Returns after the terminal
    /// chunk's trailer or when more input is needed.
    pub fn decode(
        &mut self,
        buf: &mut BytesMut,
        out: &mut dyn FnMut(&[u8]) -> io::Result<()>,
    ) -> io::Result<()> {
        loop {
            match self.state {
                ChunkState::Size => {
                    let line_end = match Self::find_crlf(buf) {
                        Some(n) => n,
                        None => return Ok(()),
                    };
                    let line = buf.split_to(line_end + 2);
                    let line_str = std::str::from_utf8(&line[..line_end])
                        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size"))?;
                    // Chunk extensions after ';' are ignored.
                    let hex_part = line_str.split(';').next().unwrap_or(line_str).trim();
                    if hex_part.is_empty() {
                        continue;
                    }
                    self.remaining = u64::from_str_radix(hex_part, 16).map_err(|_| {
                        io::Error::new(io::ErrorKind::InvalidData, "invalid chunk size")
                    })?;
                    self.state = if self.remaining == 0 {
                        ChunkState::Trailer
                    } else {
                        ChunkState::Data
                    };
                }
                ChunkState::Data => {
                    let to_read = (self.remaining as usize).min(buf.len());
                    if to_read > 0 {
                        let chunk = buf.split_to(to_read);
                        out(&chunk)?;
                        self.remaining -= to_read as u64;
                    }
                    if self.remaining == 0 {
                        self.state = ChunkState::DataEnd;
                    } else {
                        return Ok(());
                    }
                }
                ChunkState::DataEnd => {
                    if buf.len() < 2 {
                        return Ok(());
                    }
                    buf.advance(2);
                    self.state = ChunkState::Size;
                }
                ChunkState::Trailer => {
                    let line_end = match Self::find_crlf(buf) {
                        Some(n) => n,
                        None => return Ok(()),
                    };
                    buf.advance(line_end + 2);
                    if line_end == 0 {
                        self.state = ChunkState::Done;
                        return Ok(());
                    }
                    // Trailer fields are consumed and dropped.
                }
                ChunkState::Done => return Ok(()),
            }
        }
    }
}

impl Default for Dechunker {
    fn default() -> Self {
        Self::new()
    }
}

/// One Content-Encoding coding, as the server named it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentCoding {
    Gzip,
    Deflate,
    Identity,
    Unsupported(String),
}

impl ContentCoding {
    pub fn from_name(name: &str) -> Self {
        let name = name.trim();
        if name.eq_ignore_ascii_case("gzip") || name.eq_ignore_ascii_case("x-gzip") {
            ContentCoding::Gzip
        } else if name.eq_ignore_ascii_case("deflate") || name.eq_ignore_ascii_case("x-deflate") {
            ContentCoding::Deflate
        } else if name.eq_ignore_ascii_case("identity") || name.eq_ignore_ascii_case("8bit") {
            ContentCoding::Identity
        } else {
            ContentCoding::Unsupported(name.to_string())
        }
    }
}

/// MIME type describing the still-compressed payload of a coding we cannot
/// decode, so the caller at least knows what it received.
fn mime_for_coding(name: &str) -> &'static str {
    if name.eq_ignore_ascii_case("bzip2") || name.eq_ignore_ascii_case("x-bzip2") {
        "application/x-bzip"
    } else if name.eq_ignore_ascii_case("br") {
        "application/x-brotli"
    } else if name.eq_ignore_ascii_case("compress") || name.eq_ignore_ascii_case("x-compress") {
        "application/x-compress"
    } else if name.eq_ignore_ascii_case("zstd") {
        "application/zstd"
    } else {
        "application/octet-stream"
    }
}

enum Inflater {
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
    Zlib(flate2::write::ZlibDecoder<Vec<u8>>),
    Raw(flate2::write::DeflateDecoder<Vec<u8>>),
    /// deflate before enough bytes arrived to tell zlib-wrapped from raw.
    DeflatePending(Vec<u8>),
}

/// One decompression stage.
struct Decoder {
    inner: Option<Inflater>,
}

impl Decoder {
    fn gzip() -> Self {
        Self {
            inner: Some(Inflater::Gzip(flate2::write::GzDecoder::new(Vec::new()))),
        }
    }

    fn deflate() -> Self {
        Self {
            inner: Some(Inflater::DeflatePending(Vec::new())),
        }
    }

    fn push(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(Inflater::DeflatePending(pending)) = self.inner.as_mut() {
            // Some servers send raw deflate where zlib-wrapped is meant.
            // A zlib header has 8 in the CMF low nibble and passes the %31
            // checksum; two bytes are needed to tell.
            pending.extend_from_slice(data);
            if pending.len() < 2 {
                return Ok(Vec::new());
            }
            let zlib = pending[0] & 0x0f == 8
                && ((pending[0] as u16) << 8 | pending[1] as u16) % 31 == 0;
            let buffered = std::mem::take(pending);
            self.inner = Some(if zlib {
                Inflater::Zlib(flate2::write::ZlibDecoder::new(Vec::new()))
            } else {
                Inflater::Raw(flate2::write::DeflateDecoder::new(Vec::new()))
            });
            return self.push_inner(&buffered);
        }
        self.push_inner(data)
    }

    fn push_inner(&mut self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self.inner.as_mut() {
            Some(Inflater::Gzip(d)) => {
                d.write_all(data)?;
                Ok(std::mem::take(d.get_mut()))
            }
            Some(Inflater::Zlib(d)) => {
                d.write_all(data)?;
                Ok(std::mem::take(d.get_mut()))
            }
            Some(Inflater::Raw(d)) => {
                d.write_all(data)?;
                Ok(std::mem::take(d.get_mut()))
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Flush whatever remains. Truncated streams are tolerated: servers that
    /// report the compressed size as Content-Length cut gzip tails short.
    fn finish(&mut self) -> Vec<u8> {
        let result = match self.inner.take() {
            Some(Inflater::Gzip(d)) => d.finish(),
            Some(Inflater::Zlib(d)) => d.finish(),
            Some(Inflater::Raw(d)) => d.finish(),
            // A deflate body too short to classify goes out as-is.
            Some(Inflater::DeflatePending(pending)) => Ok(pending),
            None => Ok(Vec::new()),
        };
        match result {
            Ok(out) => out,
            Err(e) => {
                eprintln!("[http] truncated compressed stream: {}", e);
                Vec::new()
            }
        }
    }
}

/// Running Content-MD5 check over the dechunked, still content-encoded
/// bytes (RFC 2616 §14.15). A mismatch is logged, never fatal.
struct Md5Check {
    expected: String,
    digest: Md5,
}

fn feed_chain(
    decoders: &mut [Decoder],
    data: &[u8],
    sink: &mut dyn FnMut(&[u8]) -> io::Result<()>,
) -> io::Result<()> {
    match decoders.split_first_mut() {
        None => sink(data),
        Some((first, rest)) => {
            let out = first.push(data)?;
            if out.is_empty() {
                Ok(())
            } else {
                feed_chain(rest, &out, sink)
            }
        }
    }
}

/// The content decode pipeline for one response: decompressors in reverse
/// of the applied order, with the MD5 verifier tapping the input side.
pub struct DecodePipeline {
    decoders: Vec<Decoder>,
    md5: Option<Md5Check>,
    corrected_mime: Option<&'static str>,
}

impl DecodePipeline {
    /// Build from the Content-Encoding values (in header order, i.e. the
    /// order the server applied them) and an optional Content-MD5 value.
    /// Any unsupported coding disables decoding entirely: the payload is
    /// passed through raw and the MIME type corrected to the outermost
    /// coding's compressed format.
    pub fn new(content_encodings: &[&str], content_md5: Option<&str>) -> Self {
        let codings: Vec<ContentCoding> = content_encodings
            .iter()
            .map(|n| ContentCoding::from_name(n))
            .collect();
        let unsupported = codings.iter().rev().find_map(|c| match c {
            ContentCoding::Unsupported(name) => Some(name.as_str()),
            _ => None,
        });
        let (decoders, corrected_mime) = match unsupported {
            Some(name) => {
                eprintln!("[http] unsupported content-encoding {}, passing through", name);
                (Vec::new(), Some(mime_for_coding(name)))
            }
            None => {
                let mut decoders = Vec::new();
                // Decode in reverse order of application.
                for coding in codings.iter().rev() {
                    match coding {
                        ContentCoding::Gzip => decoders.push(Decoder::gzip()),
                        ContentCoding::Deflate => decoders.push(Decoder::deflate()),
                        ContentCoding::Identity => {}
                        ContentCoding::Unsupported(_) => unreachable!(),
                    }
                }
                (decoders, None)
            }
        };
        Self {
            decoders,
            md5: content_md5.map(|expected| Md5Check {
                expected: expected.trim().to_string(),
                digest: Md5::new(),
            }),
            corrected_mime,
        }
    }

    /// When decoding was disabled, the MIME type to report instead of the
    /// server's advertised one.
    pub fn corrected_mime_type(&self) -> Option<&'static str> {
        self.corrected_mime
    }

    /// Push dechunked bytes through the decoder chain into `sink`.
    pub fn push(
        &mut self,
        data: &[u8],
        sink: &mut dyn FnMut(&[u8]) -> io::Result<()>,
    ) -> io::Result<()> {
        if let Some(check) = self.md5.as_mut() {
            check.digest.update(data);
        }
        feed_chain(&mut self.decoders, data, sink)
    }

    /// Flush decoder tails and verify Content-MD5.
    pub fn finish(&mut self, sink: &mut dyn FnMut(&[u8]) -> io::Result<()>) -> io::Result<()> {
        for i in 0..self.decoders.len() {
            let out = self.decoders[i].finish();
            if !out.is_empty() {
                let (_, rest) = self.decoders.split_at_mut(i + 1);
                feed_chain(rest, &out, sink)?;
            }
        }
        if let Some(check) = self.md5.take() {
            let computed =
                base64::engine::general_purpose::STANDARD.encode(check.digest.finalize());
            if computed != check.expected {
                eprintln!(
                    "[http] Content-MD5 mismatch: header {}, computed {}",
                    check.expected, computed
                );
            }
        }
        Ok(())
    }
}
