//! The `.env` configuration store.
//!
//! The file is a flat list of `KEY=VALUE` lines. Parsing is lenient: blank
//! lines, `#` comments, lines that are not valid UTF-8 and lines without a
//! usable key are skipped. Entries keep
//! their insertion order so a read-modify-write cycle leaves unrelated keys
//! where they were.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use crate::errors::{DevrackError, Result};

/// Reserved key holding the server's listen address (`:3000` or `3000`).
pub const PORT_KEY: &str = "PORT";
/// Reserved key selecting the backend's operating mode.
pub const MODE_KEY: &str = "GIN_MODE";

pub const DEFAULT_PORT: &str = ":3000";
const DEFAULT_DB_FILE: &str = "database.db";

/// Backend operating mode stored under [`MODE_KEY`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Debug,
    Release,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Debug => "debug",
            Mode::Release => "release",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = DevrackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "debug" => Ok(Mode::Debug),
            "release" => Ok(Mode::Release),
            other => Err(DevrackError::InvalidValue {
                key: MODE_KEY.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Insertion-ordered `KEY=VALUE` mapping with unique keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvEntries {
    entries: Vec<(String, String)>,
}

impl EnvEntries {
    pub fn new() -> Self {
        Self::default()
    }

    /// The configuration written when a session finds no `PORT`.
    pub fn defaults() -> Self {
        let mut entries = Self::new();
        entries.set(MODE_KEY, Mode::Debug.as_str());
        entries.set(PORT_KEY, DEFAULT_PORT);
        entries.set("DB_FILE", DEFAULT_DB_FILE);
        entries
    }

    /// Parses file contents. Malformed lines are skipped, never reported.
    pub fn parse(raw: &str) -> Self {
        Self::parse_bytes(raw.as_bytes())
    }

    /// Like [`EnvEntries::parse`], for raw file bytes.
    pub fn parse_bytes(raw: &[u8]) -> Self {
        let mut entries = Self::new();
        for (number, line) in raw.split(|byte| *byte == b'\n').enumerate() {
            let Ok(line) = std::str::from_utf8(line) else {
                debug!(line = number + 1, "skipping line that is not valid UTF-8");
                continue;
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                debug!(line = number + 1, "skipping line without '='");
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                debug!(line = number + 1, "skipping line with empty key");
                continue;
            }
            entries.set(key, value.trim());
        }
        entries
    }

    /// Serializes one `KEY=VALUE` line per entry, in insertion order.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Inserts or replaces a value. A replaced key keeps its position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Adds every entry of `other` whose key is not present yet.
    pub fn fill_missing(&mut self, other: &EnvEntries) {
        for (key, value) in other.iter() {
            if self.get(key).is_none() {
                self.set(key, value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Validated operating mode; `None` when the key is absent.
    pub fn mode(&self) -> Result<Option<Mode>> {
        self.get(MODE_KEY).map(Mode::from_str).transpose()
    }
}

/// Reads and writes the `.env` file at a fixed path.
#[derive(Debug, Clone)]
pub struct EnvStore {
    path: PathBuf,
}

impl EnvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the file. A missing file is an empty mapping, not an error.
    pub fn read(&self) -> Result<EnvEntries> {
        match std::fs::read(&self.path) {
            Ok(raw) => Ok(EnvEntries::parse_bytes(&raw)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "config file not found");
                Ok(EnvEntries::new())
            }
            Err(source) => Err(DevrackError::ConfigRead {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Replaces the whole file with `entries`.
    pub fn write(&self, entries: &EnvEntries) -> Result<()> {
        std::fs::write(&self.path, entries.render()).map_err(|source| DevrackError::ConfigWrite {
            path: self.path.clone(),
            source,
        })
    }
}

/// Looks up the reserved `PORT` key, verbatim.
pub fn get_port(entries: &EnvEntries) -> Option<&str> {
    entries.get(PORT_KEY)
}

/// Numeric port behind a `PORT` value, accepting both `:3000` and `3000`.
pub fn port_number(value: &str) -> Option<u16> {
    let digits = value.trim();
    let digits = digits.strip_prefix(':').unwrap_or(digits);
    match digits.parse::<u16>() {
        Ok(0) | Err(_) => None,
        Ok(port) => Some(port),
    }
}
