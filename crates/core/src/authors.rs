//! Authors-map loading: `{username: {Name, Email}}` JSON, with a
//! `username@localhost` fallback for unmapped names.
//!
//! Grounded on the teacher's `identity/mapper.rs` cache-with-fallback
//! shape, minus the LDAP resolution branch (out of scope here).

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::instrument;

use crate::errors::ConfigError;

#[derive(Debug, Clone, Deserialize)]
struct AuthorEntry {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Email")]
    email: String,
}

/// Resolved `(name, email)` identity, ready for a commit's author or
/// committer fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

pub struct AuthorsMap {
    entries: HashMap<String, AuthorEntry>,
}

impl AuthorsMap {
    #[instrument]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let entries: HashMap<String, AuthorEntry> = serde_json::from_str(&raw)
            .map_err(|e| ConfigError::InvalidValue {
                field: "authors-map".to_string(),
                detail: e.to_string(),
            })?;
        Ok(Self { entries })
    }

    pub fn empty() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Looks up `username`, case-sensitively, falling back to
    /// `username@localhost` with the bare username as the display name.
    pub fn resolve(&self, username: &str) -> Identity {
        match self.entries.get(username) {
            Some(entry) => Identity {
                name: entry.name.clone(),
                email: entry.email.clone(),
            },
            None => Identity {
                name: username.to_string(),
                email: format!("{username}@localhost"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn falls_back_when_username_missing() {
        let map = AuthorsMap::empty();
        let id = map.resolve("jdoe");
        assert_eq!(id.name, "jdoe");
        assert_eq!(id.email, "jdoe@localhost");
    }

    #[test]
    fn loads_mapped_entry_from_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"jdoe": {{"Name": "Jane Doe", "Email": "jane@example.com"}}}}"#).unwrap();
        let map = AuthorsMap::load(file.path()).unwrap();
        let id = map.resolve("jdoe");
        assert_eq!(id.name, "Jane Doe");
        assert_eq!(id.email, "jane@example.com");
    }

    #[test]
    fn unmapped_username_still_falls_back_after_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{}}").unwrap();
        let map = AuthorsMap::load(file.path()).unwrap();
        assert_eq!(map.resolve("nobody").email, "nobody@localhost");
    }
}
