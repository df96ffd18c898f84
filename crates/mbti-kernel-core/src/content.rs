//! Descriptive content per type code, loaded lazily and kept in memory.
//!
//! Scoring never reads from here; hosts attach content to a finished
//! [`crate::AssessmentResult`] when a source is available.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{KernelError, TypeCode};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeContent {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
}

pub trait ContentSource {
    /// # Errors
    /// Returns [`KernelError::Content`] when no content exists for `code`
    /// or the backing source fails.
    fn load(&self, code: TypeCode) -> Result<TypeContent, KernelError>;
}

/// In-memory source keyed by type code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapContentSource {
    entries: BTreeMap<TypeCode, TypeContent>,
}

impl MapContentSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, code: TypeCode, content: TypeContent) {
        self.entries.insert(code, content);
    }

    /// Decodes a JSON object of the form `{ "INTJ": { "name": .. }, .. }`.
    ///
    /// # Errors
    /// Returns [`KernelError::Content`] when the payload is not an object,
    /// a key is not a type code, or an entry fails to decode.
    pub fn from_json(value: &Value) -> Result<Self, KernelError> {
        let Some(object) = value.as_object() else {
            return Err(KernelError::Content(
                "content payload MUST be a JSON object keyed by type code".to_string(),
            ));
        };

        let mut source = Self::new();
        for (raw_code, raw_content) in object {
            let code = TypeCode::parse(raw_code)
                .map_err(|err| KernelError::Content(err.to_string()))?;
            let content: TypeContent =
                serde_json::from_value(raw_content.clone()).map_err(|err| {
                    KernelError::Content(format!("invalid content for {code}: {err}"))
                })?;
            source.insert(code, content);
        }
        Ok(source)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ContentSource for MapContentSource {
    fn load(&self, code: TypeCode) -> Result<TypeContent, KernelError> {
        self.entries
            .get(&code)
            .cloned()
            .ok_or_else(|| KernelError::Content(format!("no descriptive content for {code}")))
    }
}

/// Loads content on first request and serves repeats from memory.
#[derive(Debug)]
pub struct ContentCache<S> {
    source: S,
    loaded: BTreeMap<TypeCode, TypeContent>,
}

impl<S: ContentSource> ContentCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            loaded: BTreeMap::new(),
        }
    }

    /// # Errors
    /// Propagates the source error when `code` is not cached and cannot be
    /// loaded. Failed loads are not cached.
    pub fn get(&mut self, code: TypeCode) -> Result<&TypeContent, KernelError> {
        if !self.loaded.contains_key(&code) {
            let content = self.source.load(code)?;
            self.loaded.insert(code, content);
        }

        self.loaded
            .get(&code)
            .ok_or_else(|| KernelError::Content(format!("content cache lost entry for {code}")))
    }

    /// Loads every code it can and returns how many are now cached.
    pub fn preload(&mut self, codes: &[TypeCode]) -> usize {
        for code in codes {
            let _ = self.get(*code);
        }
        codes
            .iter()
            .filter(|code| self.loaded.contains_key(*code))
            .count()
    }

    #[must_use]
    pub fn is_cached(&self, code: TypeCode) -> bool {
        self.loaded.contains_key(&code)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}
