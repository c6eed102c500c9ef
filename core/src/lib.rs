/*
 * lib.rs
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

//! Carrucola core: HTTP(S)/WebDAV client engine used as a worker behind a
//! file-transfer job framework. Turns a URL plus a verb into wire bytes,
//! parses the response, negotiates authentication, decodes transfer and
//! content encodings, and opportunistically persists responses to a disk
//! cache. Transport (sockets, TLS) and the job framework live in the host;
//! the engine works over any injected byte stream.

pub mod auth;
pub mod cache;
pub mod config;
pub mod protocol;
pub mod uri;

pub use config::{ConfigMap, CredentialCache, CredentialEntry};
pub use protocol::http::{
    CachePolicy, ErrorKind, Method, Outcome, Request, RequestEngine, Response, TransferError,
    TransferHandler,
};
pub use uri::HttpUrl;
