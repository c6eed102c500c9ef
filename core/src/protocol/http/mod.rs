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

//! HTTP(S)/WebDAV client protocol: request composition, response header
//! tokenization, body framing and decoding, and the request/redirect/auth
//! retry loop. The engine works over any injected AsyncRead + AsyncWrite
//! byte stream; sockets and TLS belong to the host.

mod error;
mod handler;
mod request;
mod response;

pub mod decode;
pub mod engine;
pub mod headers;

pub use engine::{Outcome, RequestEngine};
pub use error::{ErrorKind, TransferError};
pub use handler::TransferHandler;
pub use request::{CachePolicy, Method, Request};
pub use response::Response;
