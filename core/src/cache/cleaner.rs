/*
 * cleaner.rs
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

//! Cache-cleaner notifications. An external process keeps LRU and total-size
//! bookkeeping over the cache directory; the store tells it about created
//! and revalidated files. Delivery is fire-and-forget over a local socket
//! with a short timeout; correctness never depends on it, and tests inject
//! the no-op implementation.

use super::entry::{CacheEntryHeader, BINARY_HEADER_LEN};

/// A cache file was newly created.
pub const CLEANER_CMD_CREATE: u32 = 1;
/// An existing cache file was revalidated/updated.
pub const CLEANER_CMD_UPDATE: u32 = 2;

/// Fixed width of the filename field: the on-disk basename, a 40-char SHA-1
/// hex digest. Longer names are truncated, shorter ones NUL-padded.
pub const CLEANER_NAME_LEN: usize = 40;

pub trait CleanerNotify: Send + Sync {
    fn notify(&self, header: &CacheEntryHeader, command: u32, name: &str);
}

/// Discards every notification. Used in tests and when no cleaner runs.
pub struct NoopNotifier;

impl CleanerNotify for NoopNotifier {
    fn notify(&self, _header: &CacheEntryHeader, _command: u32, _name: &str) {}
}

/// Wire format: binary entry header, command code, fixed-width basename.
pub(crate) fn encode_message(header: &CacheEntryHeader, command: u32, name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(BINARY_HEADER_LEN + 4 + CLEANER_NAME_LEN);
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&command.to_le_bytes());
    let name = name.as_bytes();
    let take = name.len().min(CLEANER_NAME_LEN);
    out.extend_from_slice(&name[..take]);
    out.resize(BINARY_HEADER_LEN + 4 + CLEANER_NAME_LEN, 0);
    out
}

#[cfg(unix)]
pub use unix::SocketNotifier;

#[cfg(unix)]
mod unix {
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::{encode_message, CacheEntryHeader, CleanerNotify};

    const SEND_TIMEOUT: Duration = Duration::from_millis(500);

    /// Lazily-connected unix-domain socket to the cleaner process. The
    /// stream is kept across notifications; one reconnect is attempted when
    /// a send fails, then the message is dropped.
    pub struct SocketNotifier {
        path: PathBuf,
        stream: Mutex<Option<UnixStream>>,
    }

    impl SocketNotifier {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self {
                path: path.into(),
                stream: Mutex::new(None),
            }
        }

        fn connect(&self) -> Option<UnixStream> {
            let stream = UnixStream::connect(&self.path).ok()?;
            stream.set_write_timeout(Some(SEND_TIMEOUT)).ok()?;
            Some(stream)
        }
    }

    impl CleanerNotify for SocketNotifier {
        fn notify(&self, header: &CacheEntryHeader, command: u32, name: &str) {
            let msg = encode_message(header, command, name);
            let Ok(mut guard) = self.stream.lock() else {
                return;
            };
            if let Some(stream) = guard.as_mut() {
                if stream.write_all(&msg).is_ok() {
                    return;
                }
            }
            // Stale or absent connection: one reconnect attempt, then drop.
            *guard = self.connect();
            if let Some(stream) = guard.as_mut() {
                if stream.write_all(&msg).is_err() {
                    *guard = None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_layout() {
        let mut h = CacheEntryHeader::new(100, 50, 200);
        h.bytes_cached = 9;
        let name = "0123456789abcdef0123456789abcdef01234567";
        let msg = encode_message(&h, CLEANER_CMD_CREATE, name);
        assert_eq!(msg.len(), BINARY_HEADER_LEN + 4 + CLEANER_NAME_LEN);
        assert_eq!(&msg[..BINARY_HEADER_LEN], &h.encode());
        assert_eq!(
            &msg[BINARY_HEADER_LEN..BINARY_HEADER_LEN + 4],
            &CLEANER_CMD_CREATE.to_le_bytes()
        );
        assert_eq!(&msg[BINARY_HEADER_LEN + 4..], name.as_bytes());
    }

    #[test]
    fn short_names_are_padded() {
        let h = CacheEntryHeader::new(0, 0, 0);
        let msg = encode_message(&h, CLEANER_CMD_UPDATE, "abc");
        assert_eq!(msg.len(), BINARY_HEADER_LEN + 4 + CLEANER_NAME_LEN);
        assert_eq!(&msg[BINARY_HEADER_LEN + 4..BINARY_HEADER_LEN + 7], b"abc");
        assert!(msg[BINARY_HEADER_LEN + 7..].iter().all(|&b| b == 0));
    }

    #[cfg(unix)]
    #[test]
    fn socket_notifier_delivers() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleaner.sock");
        let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();

        let expected_len = BINARY_HEADER_LEN + 4 + CLEANER_NAME_LEN;
        let accept = std::thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let mut buf = vec![0u8; expected_len];
            conn.read_exact(&mut buf).unwrap();
            buf
        });

        let notifier = SocketNotifier::new(&path);
        let h = CacheEntryHeader::new(1, 2, 3);
        notifier.notify(&h, CLEANER_CMD_CREATE, "aa");
        let received = accept.join().unwrap();
        assert_eq!(received, encode_message(&h, CLEANER_CMD_CREATE, "aa"));
    }

    #[test]
    fn missing_cleaner_is_harmless() {
        #[cfg(unix)]
        {
            let notifier = SocketNotifier::new("/nonexistent/cleaner.sock");
            notifier.notify(&CacheEntryHeader::new(0, 0, 0), CLEANER_CMD_CREATE, "aa");
        }
        NoopNotifier.notify(&CacheEntryHeader::new(0, 0, 0), CLEANER_CMD_UPDATE, "bb");
    }
}
