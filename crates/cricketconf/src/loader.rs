//! File reading and parse-error reporting.

use std::path::Path;

use crate::{Config, ConfigError};

/// Read and parse one TOML config file.
///
/// Parse failures carry the file path and the deserializer's message,
/// which includes the line/column of the offending construct.
pub fn load_from_file(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;

    toml::from_str(&contents).map_err(|err| ConfigError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}
