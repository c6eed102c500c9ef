/*
 * headers.rs
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

//! Raw-header tokenizer: splits a status-line-plus-headers buffer into byte
//! spans per known field. Folded continuation lines are joined in place with
//! a single space (the continuation content is shifted left over the line
//! break), so a value is always one contiguous span. The buffer is mutated
//! destructively; callers must not reuse it for anything but the extracted
//! spans and the payload that follows `header_end`.

/// One known response field and whether it takes a comma-separated list.
pub struct FieldSpec {
    pub name: &'static str,
    pub multi_valued: bool,
}

const fn field(name: &'static str, multi_valued: bool) -> FieldSpec {
    FieldSpec { name, multi_valued }
}

/// Fields the engine and cache extract. Unknown fields are skipped without
/// allocation.
pub const RESPONSE_FIELDS: &[FieldSpec] = &[
    field("accept-ranges", false),
    field("age", false),
    field("cache-control", true),
    field("connection", true),
    field("content-disposition", false),
    field("content-encoding", true),
    field("content-language", true),
    field("content-length", false),
    field("content-md5", false),
    field("content-range", false),
    field("content-type", false),
    field("date", false),
    field("etag", false),
    field("expires", false),
    field("keep-alive", false),
    field("last-modified", false),
    field("location", false),
    field("pragma", true),
    field("proxy-authenticate", true),
    field("proxy-connection", true),
    field("set-cookie", true),
    field("transfer-encoding", true),
    field("upgrade", true),
    field("vary", true),
    field("www-authenticate", true),
];

/// Result of tokenizing: spans into the (mutated) buffer, one list per known
/// field, plus the offset of the first payload byte.
pub struct Tokenized {
    fields: &'static [FieldSpec],
    spans: Vec<Vec<(usize, usize)>>,
    pub header_end: usize,
}

impl Tokenized {
    fn field_index(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn has(&self, name: &str) -> bool {
        self.field_index(name)
            .map(|i| !self.spans[i].is_empty())
            .unwrap_or(false)
    }

    /// First value span for a field, as UTF-8 text.
    pub fn first<'b>(&self, buf: &'b [u8], name: &str) -> Option<&'b str> {
        let i = self.field_index(name)?;
        let &(s, e) = self.spans[i].first()?;
        std::str::from_utf8(&buf[s..e]).ok()
    }

    /// All value spans for a field, in order.
    pub fn all<'b>(&self, buf: &'b [u8], name: &str) -> Vec<&'b str> {
        match self.field_index(name) {
            Some(i) => self.spans[i]
                .iter()
                .filter_map(|&(s, e)| std::str::from_utf8(&buf[s..e]).ok())
                .collect(),
            None => Vec::new(),
        }
    }

    /// All values of a field re-joined with ", ". Used to hand a header that
    /// was comma-split back to a parser that does its own splitting (the
    /// authentication challenge parser).
    pub fn joined(&self, buf: &[u8], name: &str) -> Option<String> {
        let values = self.all(buf, name);
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }
}

fn find_byte(buf: &[u8], from: usize, to: usize, byte: u8) -> Option<usize> {
    buf[from..to].iter().position(|&b| b == byte).map(|i| from + i)
}

fn trim_span(buf: &[u8], mut start: usize, mut end: usize) -> (usize, usize) {
    while start < end && matches!(buf[start], b' ' | b'\t') {
        start += 1;
    }
    while end > start && matches!(buf[end - 1], b' ' | b'\t') {
        end -= 1;
    }
    (start, end)
}

/// Split a value span on top-level commas, honoring quoted strings, pushing
/// one trimmed span per piece.
fn split_commas(buf: &[u8], start: usize, end: usize, out: &mut Vec<(usize, usize)>) {
    let mut in_quotes = false;
    let mut piece_start = start;
    let mut i = start;
    while i < end {
        match buf[i] {
            b'\\' if in_quotes && i + 1 < end => i += 1,
            b'"' => in_quotes = !in_quotes,
            b',' if !in_quotes => {
                let (s, e) = trim_span(buf, piece_start, i);
                if s < e {
                    out.push((s, e));
                }
                piece_start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    let (s, e) = trim_span(buf, piece_start, end);
    if s < e {
        out.push((s, e));
    }
}

/// Tokenize the header block starting at `start` (the byte after the status
/// line). Returns spans for each known field and the offset just past the
/// terminating blank line, where the payload begins. Both CRLF and bare LF
/// line endings are accepted. Lines without a colon are skipped whole.
pub fn tokenize(buf: &mut [u8], start: usize, fields: &'static [FieldSpec]) -> Tokenized {
    let mut spans: Vec<Vec<(usize, usize)>> = fields.iter().map(|_| Vec::new()).collect();
    let mut header_end = buf.len();
    // Field and span index owning the previous line, for fold handling.
    let mut last: Option<(usize, usize)> = None;

    let mut i = start;
    while i < buf.len() {
        let nl = match find_byte(buf, i, buf.len(), b'\n') {
            Some(n) => n,
            None => {
                header_end = buf.len();
                break;
            }
        };
        let content_end = if nl > i && buf[nl - 1] == b'\r' { nl - 1 } else { nl };
        let next = nl + 1;

        if content_end == i {
            // Blank line terminates the header block.
            header_end = next;
            break;
        }

        if matches!(buf[i], b' ' | b'\t') {
            // Continuation of the previous field's value: shift the content
            // left over the line break and join with exactly one space.
            if let Some((f, s)) = last {
                let (sp_start, sp_end) = spans[f][s];
                let (j, ce) = trim_span(buf, i, content_end);
                if j < ce {
                    buf[sp_end] = b' ';
                    buf.copy_within(j..ce, sp_end + 1);
                    spans[f][s] = (sp_start, sp_end + 1 + (ce - j));
                }
            }
            i = next;
            continue;
        }

        let colon = match find_byte(buf, i, content_end, b':') {
            Some(c) => c,
            None => {
                // Malformed field: skip the whole line, do not abort.
                last = None;
                i = next;
                continue;
            }
        };
        let (name_start, name_end) = trim_span(buf, i, colon);
        let name = &buf[name_start..name_end];
        let field_idx = fields.iter().position(|f| {
            f.name.len() == name.len()
                && f.name
                    .as_bytes()
                    .iter()
                    .zip(name)
                    .all(|(a, b)| a.eq_ignore_ascii_case(b))
        });
        let Some(f) = field_idx else {
            last = None;
            i = next;
            continue;
        };

        let (v_start, v_end) = trim_span(buf, colon + 1, content_end);
        if fields[f].multi_valued {
            split_commas(buf, v_start, v_end, &mut spans[f]);
            if spans[f].is_empty() {
                last = None;
            } else {
                last = Some((f, spans[f].len() - 1));
            }
        } else {
            // A repeated single-valued field line replaces the earlier one;
            // folded values never come through here (handled above).
            spans[f].clear();
            spans[f].push((v_start, v_end));
            last = Some((f, 0));
        }
        i = next;
    }

    Tokenized {
        fields,
        spans,
        header_end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    fn skip_status_line(buf: &[u8]) -> usize {
        buf.iter().position(|&b| b == b'\n').unwrap() + 1
    }

    #[test]
    fn folded_value_is_one_span_with_single_space() {
        let mut buf = block(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html;\r\n\t charset=utf-8\r\nETag: \"x\"\r\n\r\n",
        );
        let start = skip_status_line(&buf);
        let t = tokenize(&mut buf, start, RESPONSE_FIELDS);
        assert_eq!(
            t.first(&buf, "content-type"),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(t.first(&buf, "etag"), Some("\"x\""));
    }

    #[test]
    fn multiline_fold_joins_each_line() {
        let mut buf = block(
            "HTTP/1.1 200 OK\r\nContent-Disposition: attachment;\r\n filename=\r\n \"a.txt\"\r\n\r\n",
        );
        let start = skip_status_line(&buf);
        let t = tokenize(&mut buf, start, RESPONSE_FIELDS);
        assert_eq!(
            t.first(&buf, "content-disposition"),
            Some("attachment; filename= \"a.txt\"")
        );
    }

    #[test]
    fn multi_valued_splits_on_top_level_commas() {
        let mut buf = block("HTTP/1.1 200 OK\r\nCache-Control: no-cache, max-age=0\r\n\r\n");
        let start = skip_status_line(&buf);
        let t = tokenize(&mut buf, start, RESPONSE_FIELDS);
        assert_eq!(t.all(&buf, "cache-control"), vec!["no-cache", "max-age=0"]);
    }

    #[test]
    fn quoted_commas_are_not_split_points() {
        let mut buf = block(
            "HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Digest realm=\"a,b\", nonce=\"n\"\r\n\r\n",
        );
        let start = skip_status_line(&buf);
        let t = tokenize(&mut buf, start, RESPONSE_FIELDS);
        let values = t.all(&buf, "www-authenticate");
        assert_eq!(values, vec!["Digest realm=\"a,b\"", "nonce=\"n\""]);
        assert_eq!(
            t.joined(&buf, "www-authenticate").unwrap(),
            "Digest realm=\"a,b\", nonce=\"n\""
        );
    }

    #[test]
    fn repeated_lines_accumulate_for_multi_fields() {
        let mut buf = block(
            "HTTP/1.1 200 OK\r\nSet-Cookie: a=1\r\nSet-Cookie: b=2\r\n\r\n",
        );
        let start = skip_status_line(&buf);
        let t = tokenize(&mut buf, start, RESPONSE_FIELDS);
        assert_eq!(t.all(&buf, "set-cookie"), vec!["a=1", "b=2"]);
    }

    #[test]
    fn repeated_single_valued_line_replaces() {
        let mut buf = block(
            "HTTP/1.1 200 OK\r\nContent-Length: 10\r\nContent-Length: 20\r\n\r\n",
        );
        let start = skip_status_line(&buf);
        let t = tokenize(&mut buf, start, RESPONSE_FIELDS);
        assert_eq!(t.all(&buf, "content-length"), vec!["20"]);
    }

    #[test]
    fn unknown_and_malformed_lines_skipped() {
        let mut buf = block(
            "HTTP/1.1 200 OK\r\nX-Custom: whatever\r\nthis line has no colon\r\nETag: \"e\"\r\n\r\n",
        );
        let start = skip_status_line(&buf);
        let t = tokenize(&mut buf, start, RESPONSE_FIELDS);
        assert_eq!(t.first(&buf, "etag"), Some("\"e\""));
        assert!(!t.has("content-type"));
    }

    #[test]
    fn header_end_points_at_payload() {
        let mut buf = block("HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\nBODY");
        let start = skip_status_line(&buf);
        let t = tokenize(&mut buf, start, RESPONSE_FIELDS);
        assert_eq!(&buf[t.header_end..], b"BODY");
    }

    #[test]
    fn bare_lf_line_endings() {
        let mut buf = block("HTTP/1.1 200 OK\nContent-Type: text/plain\n\nrest");
        let start = skip_status_line(&buf);
        let t = tokenize(&mut buf, start, RESPONSE_FIELDS);
        assert_eq!(t.first(&buf, "content-type"), Some("text/plain"));
        assert_eq!(&buf[t.header_end..], b"rest");
    }

    #[test]
    fn continuation_after_unknown_field_is_dropped() {
        let mut buf = block(
            "HTTP/1.1 200 OK\r\nX-Unknown: a\r\n b\r\nETag: \"e\"\r\n\r\n",
        );
        let start = skip_status_line(&buf);
        let t = tokenize(&mut buf, start, RESPONSE_FIELDS);
        assert_eq!(t.first(&buf, "etag"), Some("\"e\""));
    }
}
