//! Membership lists and key/value tables for routing decisions.
//!
//! Every operation that can touch a backing store returns an explicit
//! `Result`; a `false` membership answer and a failed lookup are different
//! things and callers are expected to treat them differently.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LookupError {
    #[error("reading table {table}: {reason}")]
    Io { table: String, reason: String },
    #[error("table {table}, line {line}: {reason}")]
    Parse {
        table: String,
        line: usize,
        reason: String,
    },
    #[error("table {table} is unavailable: {reason}")]
    Unavailable { table: String, reason: String },
}

/// How a [`DomainList`] pattern relates to lookup names. Fixed when the
/// list is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStyle {
    /// `example.com` matches only `example.com`.
    Exact,
    /// `example.com` also matches `a.example.com` and deeper.
    Subdomain,
}

#[derive(Debug, Clone)]
struct Pattern {
    negated: bool,
    text: String,
}

fn parse_patterns(patterns: &[String]) -> Vec<Pattern> {
    patterns
        .iter()
        .filter(|p| !p.is_empty())
        .map(|p| match p.strip_prefix('!') {
            Some(rest) => Pattern {
                negated: true,
                text: rest.to_ascii_lowercase(),
            },
            None => Pattern {
                negated: false,
                text: p.to_ascii_lowercase(),
            },
        })
        .collect()
}

/// An ordered membership list with exact, case-insensitive matching and
/// `!pattern` negation. First match wins.
#[derive(Debug, Clone, Default)]
pub struct StringList {
    name: String,
    patterns: Vec<Pattern>,
    fail: Option<String>,
}

impl StringList {
    pub fn new(name: &str, patterns: &[String]) -> Self {
        Self {
            name: name.to_string(),
            patterns: parse_patterns(patterns),
            fail: None,
        }
    }

    /// Make every membership test fail with the given reason, as a
    /// table-backed list would when its backing store is unreadable.
    pub fn fail_with(mut self, reason: &str) -> Self {
        self.fail = Some(reason.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.fail.is_none()
    }

    pub fn matches(&self, name: &str) -> Result<bool, LookupError> {
        if let Some(reason) = &self.fail {
            return Err(LookupError::Unavailable {
                table: self.name.clone(),
                reason: reason.clone(),
            });
        }
        let name = name.to_ascii_lowercase();
        for pat in &self.patterns {
            if pat.text == name {
                return Ok(!pat.negated);
            }
        }
        Ok(false)
    }
}

/// An ordered domain membership list. Whether a pattern also covers
/// subdomains is a property of the whole list, decided at construction.
#[derive(Debug, Clone)]
pub struct DomainList {
    name: String,
    patterns: Vec<Pattern>,
    style: MatchStyle,
    fail: Option<String>,
}

impl DomainList {
    pub fn new(name: &str, patterns: &[String], style: MatchStyle) -> Self {
        Self {
            name: name.to_string(),
            patterns: parse_patterns(patterns),
            style,
            fail: None,
        }
    }

    /// See [`StringList::fail_with`].
    pub fn fail_with(mut self, reason: &str) -> Self {
        self.fail = Some(reason.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty() && self.fail.is_none()
    }

    pub fn matches(&self, name: &str) -> Result<bool, LookupError> {
        if let Some(reason) = &self.fail {
            return Err(LookupError::Unavailable {
                table: self.name.clone(),
                reason: reason.clone(),
            });
        }
        let name = name.to_ascii_lowercase();
        for pat in &self.patterns {
            let hit = pat.text == name
                || (self.style == MatchStyle::Subdomain
                    && name.len() > pat.text.len()
                    && name.ends_with(&pat.text)
                    && name.as_bytes()[name.len() - pat.text.len() - 1] == b'.');
            if hit {
                return Ok(!pat.negated);
            }
        }
        Ok(false)
    }
}

/// A key/value table. Keys are matched case-insensitively.
pub trait LookupTable: Send + Sync {
    fn name(&self) -> &str;
    fn lookup(&self, key: &str) -> Result<Option<String>, LookupError>;
}

/// A table loaded from a text file of whitespace-separated `key value`
/// lines. `#` starts a comment; blank lines are skipped. The file is read
/// once at construction.
#[derive(Debug, Clone)]
pub struct FileTable {
    name: String,
    entries: HashMap<String, String>,
}

impl FileTable {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LookupError> {
        let path = path.as_ref();
        let name = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|err| LookupError::Io {
            table: name.clone(),
            reason: err.to_string(),
        })?;

        let mut entries = HashMap::new();
        for (idx, line) in content.lines().enumerate() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line.split_once(char::is_whitespace).ok_or_else(|| {
                LookupError::Parse {
                    table: name.clone(),
                    line: idx + 1,
                    reason: "expected `key value`".to_string(),
                }
            })?;
            entries.insert(key.to_ascii_lowercase(), value.trim().to_string());
        }

        Ok(Self { name, entries })
    }
}

impl LookupTable for FileTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, key: &str) -> Result<Option<String>, LookupError> {
        Ok(self.entries.get(&key.to_ascii_lowercase()).cloned())
    }
}

/// An in-memory table. Mostly useful in tests, where its forced-failure
/// mode exercises callers' error paths.
#[derive(Debug, Clone, Default)]
pub struct MemTable {
    name: String,
    entries: HashMap<String, String>,
    fail: Option<String>,
}

impl MemTable {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.entries
            .insert(key.to_ascii_lowercase(), value.to_string());
        self
    }

    /// Make every lookup fail with the given reason.
    pub fn fail_with(mut self, reason: &str) -> Self {
        self.fail = Some(reason.to_string());
        self
    }
}

impl LookupTable for MemTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn lookup(&self, key: &str) -> Result<Option<String>, LookupError> {
        if let Some(reason) = &self.fail {
            return Err(LookupError::Unavailable {
                table: self.name.clone(),
                reason: reason.clone(),
            });
        }
        Ok(self.entries.get(&key.to_ascii_lowercase()).cloned())
    }
}

/// An ordered set of tables consulted under one parameter name.
/// The first table that produces a value wins; a failing table fails the
/// whole lookup.
pub struct Tables {
    name: String,
    tables: Vec<Box<dyn LookupTable>>,
}

impl Tables {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tables: Vec::new(),
        }
    }

    pub fn push(&mut self, table: Box<dyn LookupTable>) {
        self.tables.push(table);
    }

    pub fn with(mut self, table: impl LookupTable + 'static) -> Self {
        self.tables.push(Box::new(table));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    pub fn lookup(&self, key: &str) -> Result<Option<String>, LookupError> {
        for table in &self.tables {
            if let Some(value) = table.lookup(key)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }
}

impl std::fmt::Debug for Tables {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Tables")
            .field("name", &self.name)
            .field("tables", &self.tables.iter().map(|t| t.name()).collect::<Vec<_>>())
            .finish()
    }
}
