//! Loading programs and configurations from RSN files.

use std::fmt::{self, Display};
use std::path::Path;
use std::{fs, io};

use serde::de::DeserializeOwned;
use symdex_vm::class::Program;
use symdex_vm::vm::Configuration;

/// A file could not be loaded.
#[derive(Debug)]
pub enum LoadError {
    /// The file could not be read.
    Io(io::Error),
    /// The file's contents are not valid RSN for the expected type.
    Parse(String),
}

impl From<io::Error> for LoadError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::Io(err) => Display::fmt(err, f),
            LoadError::Parse(err) => write!(f, "parse error: {err}"),
        }
    }
}

impl std::error::Error for LoadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoadError::Io(err) => Some(err),
            LoadError::Parse(_) => None,
        }
    }
}

/// Parses `source` as RSN. The outermost braces of a map may be omitted.
pub fn parse<T: DeserializeOwned>(source: &str) -> Result<T, LoadError> {
    rsn::parser::Config::default()
        .allow_implicit_map(true)
        .deserialize(source)
        .map_err(|err| LoadError::Parse(err.to_string()))
}

/// Loads a [`Program`] from an RSN file.
pub fn load_program(path: impl AsRef<Path>) -> Result<Program, LoadError> {
    parse(&fs::read_to_string(path)?)
}

/// Loads a [`Configuration`] from an RSN file. Limits the file does not
/// name keep their defaults.
pub fn load_configuration(path: impl AsRef<Path>) -> Result<Configuration, LoadError> {
    parse(&fs::read_to_string(path)?)
}

/// Returns the configuration file used when none is given explicitly.
#[cfg(feature = "cli")]
#[must_use]
pub fn default_configuration_path() -> Option<std::path::PathBuf> {
    dirs::config_dir().map(|dir| dir.join("symdex").join("config.rsn"))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn configuration_keeps_unnamed_defaults() {
        let configuration: Configuration = parse("{max_nodes: 25}").unwrap();
        assert_eq!(
            configuration,
            Configuration::default().with_max_nodes(25)
        );
    }

    #[test]
    fn configuration_reads_timeout() {
        let configuration: Configuration =
            parse("{max_execution_time: Some({secs: 2, nanos: 0})}").unwrap();
        assert_eq!(
            configuration.max_execution_time,
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn malformed_program_is_parse_error() {
        assert!(matches!(
            parse::<Program>("classes: [{name: }]"),
            Err(LoadError::Parse(_))
        ));
    }
}
