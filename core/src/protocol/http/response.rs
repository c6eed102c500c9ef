/*
 * response.rs
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

//! Response status line.

/// Parsed status line of one physical response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub reason: Option<String>,
    /// False for an HTTP/1.0 peer, which defaults to close.
    pub http11: bool,
}

impl Response {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            reason: None,
            http11: true,
        }
    }

    /// Parse `HTTP/1.x NNN reason`. None when the line is not a status line.
    pub fn parse_status_line(line: &[u8]) -> Option<Self> {
        let line = std::str::from_utf8(line).ok()?;
        let line = line.trim_end();
        let mut parts = line.splitn(3, ' ');
        let version = parts.next()?;
        if !version.starts_with("HTTP/1.") {
            return None;
        }
        let code: u16 = parts.next()?.parse().ok()?;
        if !(100..=599).contains(&code) {
            return None;
        }
        Some(Self {
            code,
            reason: parts.next().map(|s| s.to_string()),
            http11: version != "HTTP/1.0",
        })
    }

    pub fn is_informational(&self) -> bool {
        (100..200).contains(&self.code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.code, 301 | 302 | 303 | 307 | 308)
    }

    pub fn is_auth_required(&self) -> bool {
        self.code == 401 || self.code == 407
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_with_reason() {
        let r = Response::parse_status_line(b"HTTP/1.1 404 Not Found\r\n").unwrap();
        assert_eq!(r.code, 404);
        assert_eq!(r.reason.as_deref(), Some("Not Found"));
        assert!(r.http11);
    }

    #[test]
    fn parse_without_reason() {
        let r = Response::parse_status_line(b"HTTP/1.0 200").unwrap();
        assert_eq!(r.code, 200);
        assert_eq!(r.reason, None);
        assert!(!r.http11);
    }

    #[test]
    fn reject_garbage() {
        assert!(Response::parse_status_line(b"<html>").is_none());
        assert!(Response::parse_status_line(b"HTTP/1.1 abc").is_none());
        assert!(Response::parse_status_line(b"HTTP/1.1 999 nope").is_none());
    }
}
