//! Configuration loading: locate a YAML document, substitute environment
//! variables into it, then deserialize and validate the typed model.

pub mod models;

use std::path::{Path, PathBuf};

use serde_yaml::Value;
use thiserror::Error;

pub use models::AutoscalerConfig;

/// Search order used when no `--config` path is given on the command line.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &[
    "/etc/lxc-autoscaler/config.yaml",
    "/usr/local/etc/lxc-autoscaler/config.yaml",
    "./config.yaml",
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("no configuration file found in default search paths")]
    NotFound,

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path} as YAML: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration field {field} = {value}: {message}")]
    Invalid {
        field: String,
        value: String,
        message: String,
    },
}

/// Finds a config file: an explicit path if given, otherwise the first of
/// [`DEFAULT_CONFIG_PATHS`] that exists.
pub fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    for candidate in DEFAULT_CONFIG_PATHS {
        let path = Path::new(candidate);
        if path.exists() {
            return Ok(path.to_path_buf());
        }
    }
    Err(ConfigError::NotFound)
}

/// Loads, substitutes, parses, and validates a configuration file.
pub fn load_config(path: &Path) -> Result<AutoscalerConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut value: Value = serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    substitute_env_vars(&mut value);

    let config: AutoscalerConfig =
        serde_yaml::from_value(value).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    config.validate()?;
    Ok(config)
}

/// Recursively rewrites string scalars of the form `${VAR}` or
/// `${VAR:default}` using the process environment. A missing variable with
/// no default is left as the literal `${VAR}` text so the ensuing
/// deserialization error points at what's missing.
fn substitute_env_vars(value: &mut Value) {
    match value {
        Value::String(s) => {
            if let Some(resolved) = substitute_in_str(s) {
                *s = resolved;
            }
        }
        Value::Sequence(seq) => {
            for item in seq {
                substitute_env_vars(item);
            }
        }
        Value::Mapping(map) => {
            for (_, v) in map.iter_mut() {
                substitute_env_vars(v);
            }
        }
        _ => {}
    }
}

fn substitute_in_str(s: &str) -> Option<String> {
    if !(s.starts_with("${") && s.ends_with('}')) {
        return None;
    }
    let inner = &s[2..s.len() - 1];
    let (var, default) = match inner.split_once(':') {
        Some((var, default)) => (var, Some(default)),
        None => (inner, None),
    };
    match std::env::var(var) {
        Ok(value) => Some(value),
        Err(_) => default.map(str::to_string),
    }
}
