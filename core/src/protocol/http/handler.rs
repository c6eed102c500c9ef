/*
 * handler.rs
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

//! Transfer event callbacks (push model). The engine drives this as the
//! response arrives.
//!
//! Flow for a delivered body:
//! 1. `redirection(url)` — zero or more times, once per followed redirect
//! 2. `mime_type(mime)` — once, after the final response's headers
//! 3. `total_size(n)` — when the size is known up front
//! 4. `data(chunk)` — for each decoded chunk; an empty chunk ends the body
//! 5. `processed_size(n)` — running count alongside data
//!
//! On failure only `error(kind, message)` is called.

use crate::uri::HttpUrl;

use super::error::ErrorKind;

pub trait TransferHandler {
    /// MIME type of the response body, after content-encoding correction.
    fn mime_type(&mut self, mime: &str);

    /// A chunk of decoded body data. An empty slice marks the end of body.
    /// Data is only valid for the duration of the call.
    fn data(&mut self, chunk: &[u8]);

    /// The operation was redirected; `url` is the resolved target.
    fn redirection(&mut self, url: &HttpUrl);

    /// Expected total body size, when the response declares one.
    fn total_size(&mut self, size: u64);

    /// Bytes delivered so far.
    fn processed_size(&mut self, size: u64);

    /// Terminal failure for this operation.
    fn error(&mut self, kind: ErrorKind, message: &str);
}
