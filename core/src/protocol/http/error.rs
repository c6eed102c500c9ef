/*
 * error.rs
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

//! Transfer errors surfaced to the host. HTTP semantic failures map to
//! distinct kinds with method-specific message text; transport and protocol
//! failures collapse onto the broken-connection kinds.

use std::fmt;

use super::request::Method;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The peer vanished or the stream failed mid-exchange.
    ConnectionBroken,
    /// A read or write exceeded the request's timeout.
    Timeout,
    /// The response could not be parsed as HTTP.
    MalformedResponse,
    /// Authentication failed at the final stage, or 403.
    AccessDenied,
    /// The same URL was redirected to more than the allowed number of times.
    CyclicRedirect,
    /// 404 and friends.
    DoesNotExist,
    /// The server does not support what the method asked for.
    UnsupportedAction,
    CouldNotRead,
    CouldNotWrite,
    CouldNotMkdir,
    CouldNotDelete,
    CouldNotRename,
    InternalServer,
}

#[derive(Debug)]
pub struct TransferError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TransferError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TransferError {}

impl From<std::io::Error> for TransferError {
    fn from(e: std::io::Error) -> Self {
        let kind = match e.kind() {
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::InvalidData => ErrorKind::MalformedResponse,
            _ => ErrorKind::ConnectionBroken,
        };
        TransferError::new(kind, e.to_string())
    }
}

/// Map an HTTP error status to a TransferError, with bespoke messages for
/// the mutating WebDAV verbs and a generic mapping for the rest.
pub fn error_for_status(code: u16, method: Method, url: &str) -> TransferError {
    match (code, method) {
        (401 | 407, _) => TransferError::new(
            ErrorKind::AccessDenied,
            format!("access to {} was denied", url),
        ),
        (403, _) => TransferError::new(
            ErrorKind::AccessDenied,
            format!("access to {} is forbidden", url),
        ),
        (404 | 410, Method::Delete) => TransferError::new(
            ErrorKind::CouldNotDelete,
            format!("could not delete {}: it does not exist", url),
        ),
        (404 | 410, _) => {
            TransferError::new(ErrorKind::DoesNotExist, format!("{} does not exist", url))
        }
        (405, Method::Mkcol) => TransferError::new(
            ErrorKind::CouldNotMkdir,
            format!("could not create collection {}: it already exists", url),
        ),
        (405, _) => TransferError::new(
            ErrorKind::UnsupportedAction,
            format!("the server does not allow {} on {}", method, url),
        ),
        (409, Method::Put) => TransferError::new(
            ErrorKind::CouldNotWrite,
            format!("could not write to {}: a parent collection is missing", url),
        ),
        (409, Method::Mkcol) => TransferError::new(
            ErrorKind::CouldNotMkdir,
            format!("could not create collection {}: a parent collection is missing", url),
        ),
        (412, Method::Copy | Method::Move) => TransferError::new(
            ErrorKind::CouldNotRename,
            format!("the destination for {} already exists", url),
        ),
        (423, _) => TransferError::new(
            ErrorKind::CouldNotWrite,
            format!("{} is locked by another client", url),
        ),
        (507, Method::Put | Method::Mkcol) => TransferError::new(
            ErrorKind::CouldNotWrite,
            format!("no storage left for {}", url),
        ),
        (c, Method::Put) if (400..600).contains(&c) => TransferError::new(
            ErrorKind::CouldNotWrite,
            format!("could not write to {} (server replied {})", url, c),
        ),
        (c, Method::Delete) if (400..600).contains(&c) => TransferError::new(
            ErrorKind::CouldNotDelete,
            format!("could not delete {} (server replied {})", url, c),
        ),
        (c, _) if (500..600).contains(&c) => TransferError::new(
            ErrorKind::InternalServer,
            format!("the server failed to handle {} (replied {})", url, c),
        ),
        (c, _) => TransferError::new(
            ErrorKind::CouldNotRead,
            format!("could not retrieve {} (server replied {})", url, c),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_specific_messages() {
        let e = error_for_status(409, Method::Put, "http://h/x");
        assert_eq!(e.kind, ErrorKind::CouldNotWrite);
        assert!(e.message.contains("parent collection"));

        let e = error_for_status(404, Method::Delete, "http://h/x");
        assert_eq!(e.kind, ErrorKind::CouldNotDelete);

        let e = error_for_status(404, Method::Get, "http://h/x");
        assert_eq!(e.kind, ErrorKind::DoesNotExist);
    }

    #[test]
    fn generic_fallbacks() {
        assert_eq!(
            error_for_status(500, Method::Get, "u").kind,
            ErrorKind::InternalServer
        );
        assert_eq!(
            error_for_status(418, Method::Get, "u").kind,
            ErrorKind::CouldNotRead
        );
        assert_eq!(
            error_for_status(403, Method::Get, "u").kind,
            ErrorKind::AccessDenied
        );
    }
}
