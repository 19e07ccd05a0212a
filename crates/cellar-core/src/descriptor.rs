//! Connection descriptors
//!
//! A descriptor is `file://<directory>[?<params>]`. The engine treats
//! everything after the `file://` prefix as a raw filesystem directory and
//! does not URL-decode it, so the directory is copied verbatim and only the
//! parameter keys and values are encoded.
//!
//! Two descriptors are built from one [`Config`]:
//!
//! - [`container_descriptor`]: opens the multi-database root, never selects
//!   a database
//! - [`main_descriptor`]: the working connection, selects `Config::database`
//!   when one is configured

use std::fmt;

use crate::config::Config;
use crate::error::{ConfigError, StoreError, StoreResult};
use crate::params::{ParameterSet, KEY_COMMIT_EMAIL, KEY_COMMIT_NAME, KEY_DATABASE};

/// Canonical scheme prefix
pub const SCHEME_PREFIX: &str = "file://";

/// Textual connection descriptor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionDescriptor(String);

impl ConnectionDescriptor {
    /// Validate a descriptor string
    pub fn parse(raw: &str) -> StoreResult<Self> {
        if !raw.starts_with(SCHEME_PREFIX) {
            return Err(StoreError::InvalidDescriptor(format!(
                "descriptor must start with '{SCHEME_PREFIX}': {raw}"
            )));
        }
        let descriptor = Self(raw.to_string());
        if descriptor.directory().is_empty() {
            return Err(StoreError::InvalidDescriptor(format!(
                "descriptor has no directory: {raw}"
            )));
        }
        Ok(descriptor)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The raw directory segment
    ///
    /// Split at the last `?`, not the first: the directory is never escaped
    /// and may itself contain `?`, while encoded parameters never do. A
    /// first-`?` parser would cut such a directory short.
    pub fn directory(&self) -> &str {
        let rest = &self.0[SCHEME_PREFIX.len()..];
        match rest.rfind('?') {
            Some(idx) => &rest[..idx],
            None => rest,
        }
    }

    /// Decoded parameters
    pub fn params(&self) -> ParameterSet {
        let rest = &self.0[SCHEME_PREFIX.len()..];
        match rest.rfind('?') {
            Some(idx) => ParameterSet::decode(&rest[idx + 1..]),
            None => ParameterSet::new(),
        }
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ConnectionDescriptor {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Descriptor for the multi-database root
///
/// `extra` is merged over the identity parameters. A `database` key coming
/// from `extra` is dropped.
pub fn container_descriptor(
    cfg: &Config,
    extra: &ParameterSet,
) -> Result<ConnectionDescriptor, ConfigError> {
    cfg.validate()?;
    let mut params = identity_params(cfg);
    params.merge(extra);
    params.remove(KEY_DATABASE);
    build_descriptor(directory_of(cfg)?, &params)
}

/// Descriptor for the working connection
///
/// Selects `cfg.database` when it is set and non-empty; `extra` is merged
/// last.
pub fn main_descriptor(
    cfg: &Config,
    extra: &ParameterSet,
) -> Result<ConnectionDescriptor, ConfigError> {
    cfg.validate()?;
    let mut params = identity_params(cfg);
    if let Some(database) = cfg.database() {
        params.set(KEY_DATABASE, database);
    }
    params.merge(extra);
    build_descriptor(directory_of(cfg)?, &params)
}

/// Join a directory and encoded parameters
pub fn build_descriptor(
    dir: &str,
    params: &ParameterSet,
) -> Result<ConnectionDescriptor, ConfigError> {
    let base = if dir.starts_with(SCHEME_PREFIX) {
        dir.to_string()
    } else {
        format!("{SCHEME_PREFIX}{dir}")
    };

    if params.is_empty() {
        if base[SCHEME_PREFIX.len()..].contains('?') {
            return Err(ConfigError::AmbiguousPath(dir.to_string()));
        }
        return Ok(ConnectionDescriptor(base));
    }

    Ok(ConnectionDescriptor(format!("{}?{}", base, params.encode())))
}

fn identity_params(cfg: &Config) -> ParameterSet {
    let mut params = ParameterSet::new();
    if let Some(name) = cfg.committer_name() {
        params.set(KEY_COMMIT_NAME, name);
    }
    if let Some(email) = cfg.committer_email() {
        params.set(KEY_COMMIT_EMAIL, email);
    }
    params
}

fn directory_of(cfg: &Config) -> Result<&str, ConfigError> {
    cfg.path
        .to_str()
        .ok_or_else(|| ConfigError::NonUtf8Path(cfg.path.clone()))
}
