//! Connection parameters
//!
//! A `ParameterSet` maps descriptor keys to single string values. Sets are
//! combined in a fixed layer order with last-writer-wins semantics:
//!
//! 1. identity (`commitname`, `commitemail`)
//! 2. tuning defaults
//! 3. retry defaults
//! 4. caller overrides
//!
//! Keys are kept sorted so the encoded query string is reproducible.

use std::collections::BTreeMap;

use url::form_urlencoded;

use crate::retry::RetryPolicy;

/// Committer name attached to writes
pub const KEY_COMMIT_NAME: &str = "commitname";
/// Committer email attached to writes
pub const KEY_COMMIT_EMAIL: &str = "commitemail";
/// Working database selector
pub const KEY_DATABASE: &str = "database";

/// Mapping from parameter key to a single value
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSet {
    values: BTreeMap<String, String>,
}

impl ParameterSet {
    /// Create an empty parameter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, replacing any previous one
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Builder-style `set`
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Overwrite every key present in `src`
    ///
    /// Values already in `self` that `src` does not mention are kept.
    pub fn merge(&mut self, src: &ParameterSet) {
        for (key, value) in &src.values {
            self.values.insert(key.clone(), value.clone());
        }
    }

    /// Encode as `k1=v1&k2=v2` with form encoding of keys and values
    pub fn encode(&self) -> String {
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (key, value) in &self.values {
            serializer.append_pair(key, value);
        }
        serializer.finish()
    }

    /// Decode a query string produced by [`ParameterSet::encode`]
    ///
    /// A key repeated in the query keeps its last value.
    pub fn decode(query: &str) -> Self {
        let mut set = Self::new();
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            set.set(key.into_owned(), value.into_owned());
        }
        set
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (key, value) in iter {
            set.set(key, value);
        }
        set
    }
}

/// Reserved for engine tuning keys; currently empty
///
/// The engine disables any process-level caching and fails fast on a held
/// lock by itself whenever open retries are requested.
pub fn default_tuning_params() -> ParameterSet {
    ParameterSet::new()
}

/// Default open-retry parameters
pub fn default_retry_params() -> ParameterSet {
    RetryPolicy::default().to_params()
}

/// Tuning defaults followed by retry defaults
pub fn default_open_params() -> ParameterSet {
    let mut params = default_tuning_params();
    params.merge(&default_retry_params());
    params
}
