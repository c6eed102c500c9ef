/*
 * config.rs
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

//! Per-request configuration and the credential cache. Both are fed by the
//! host framework: the engine only does string key/value lookups here, it
//! never touches configuration files or prompts anyone.

use std::collections::HashMap;

/// Well-known configuration keys.
pub const KEY_USE_CACHE: &str = "UseCache";
pub const KEY_CACHE_DIR: &str = "CacheDir";
pub const KEY_MAX_CACHE_AGE: &str = "MaxCacheAge";
pub const KEY_MAX_CACHE_SIZE: &str = "MaxCacheSize";
pub const KEY_ENABLE_NTLMV2: &str = "EnableNTLMv2Auth";
pub const KEY_DELEGATE_CREDENTIALS: &str = "DelegateCredentialsOn";
pub const KEY_ERROR_PAGE: &str = "errorPage";
pub const KEY_USER_AGENT: &str = "UserAgent";
pub const KEY_ACCEPT: &str = "Accept";

/// Default ceiling on cached-entry age when the server sent no expiry, in
/// seconds (14 days).
pub const DEFAULT_MAX_CACHE_AGE: i64 = 14 * 24 * 60 * 60;

/// String key/value options for one worker instance.
#[derive(Debug, Default, Clone)]
pub struct ConfigMap {
    values: HashMap<String, String>,
}

impl ConfigMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    /// Boolean lookup: "true"/"1"/"yes" (any case) are true, "false"/"0"/"no"
    /// are false, anything else falls back to the default.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => true,
                "false" | "0" | "no" | "off" => false,
                _ => default,
            },
            None => default,
        }
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }
}

/// One cached credential: who to authenticate as within a protection space,
/// plus an optional serialized challenge so the next request to the same
/// space can authenticate pre-emptively without waiting for a 401.
#[derive(Debug, Clone)]
pub struct CredentialEntry {
    pub username: String,
    pub password: String,
    pub challenge_blob: Option<String>,
}

/// In-memory credential cache keyed by (protection-space root, realm). The
/// host may seed it from its own store and read committed entries back out.
#[derive(Debug, Default)]
pub struct CredentialCache {
    entries: HashMap<(String, String), CredentialEntry>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, root: &str, realm: &str) -> Option<&CredentialEntry> {
        self.entries.get(&(root.to_string(), realm.to_string()))
    }

    /// Any entry for the given root, regardless of realm. Used for
    /// pre-emptive authentication before the server has named its realm.
    pub fn lookup_any(&self, root: &str) -> Option<&CredentialEntry> {
        self.entries
            .iter()
            .find(|((r, _), _)| r == root)
            .map(|(_, e)| e)
    }

    pub fn contains(&self, root: &str, realm: &str) -> bool {
        self.entries
            .contains_key(&(root.to_string(), realm.to_string()))
    }

    pub fn store(&mut self, root: &str, realm: &str, entry: CredentialEntry) {
        self.entries
            .insert((root.to_string(), realm.to_string()), entry);
    }

    pub fn remove(&mut self, root: &str, realm: &str) {
        self.entries.remove(&(root.to_string(), realm.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_lookup() {
        let mut c = ConfigMap::new();
        c.set(KEY_ENABLE_NTLMV2, "true");
        c.set(KEY_USE_CACHE, "0");
        assert!(c.get_bool(KEY_ENABLE_NTLMV2, false));
        assert!(!c.get_bool(KEY_USE_CACHE, true));
        assert!(c.get_bool("missing", true));
    }

    #[test]
    fn credential_roundtrip() {
        let mut cache = CredentialCache::new();
        cache.store(
            "http://example.com:80",
            "realm",
            CredentialEntry {
                username: "u".into(),
                password: "p".into(),
                challenge_blob: None,
            },
        );
        assert!(cache.contains("http://example.com:80", "realm"));
        assert_eq!(
            cache.lookup("http://example.com:80", "realm").unwrap().username,
            "u"
        );
        assert!(cache.lookup_any("http://example.com:80").is_some());
        assert!(cache.lookup("http://other.com:80", "realm").is_none());
    }
}
