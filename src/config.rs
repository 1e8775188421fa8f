use std::fmt;
use std::path::Path;
use std::str::FromStr;

use bon::Builder;
use serde::Deserialize;
use serde_with::{DeserializeFromStr, SerializeDisplay};
use tracing::{debug, instrument};

use crate::error::ConfigError;

/// Firmware revision reported by a tag, in `major.minor.micro` form.
#[derive(
    Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub struct FirmwareVersion {
    major: u32,
    minor: u32,
    micro: u32,
}

impl FirmwareVersion {
    /// Creates a firmware version from its components.
    #[must_use]
    pub const fn new(major: u32, minor: u32, micro: u32) -> Self {
        Self {
            major,
            minor,
            micro,
        }
    }

    #[must_use]
    pub const fn major(self) -> u32 {
        self.major
    }

    #[must_use]
    pub const fn minor(self) -> u32 {
        self.minor
    }

    #[must_use]
    pub const fn micro(self) -> u32 {
        self.micro
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.micro)
    }
}

impl FromStr for FirmwareVersion {
    type Err = ConfigError;

    /// Parses `major.minor.micro`.
    ///
    /// ```
    /// use taglink::FirmwareVersion;
    ///
    /// let version: FirmwareVersion = "1.96.0".parse().unwrap();
    /// assert_eq!(FirmwareVersion::new(1, 96, 0), version);
    /// ```
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidFirmwareVersion {
            value: value.to_string(),
        };

        let mut parts = value.trim().split('.');
        let mut next = || -> Result<u32, ConfigError> {
            parts
                .next()
                .and_then(|part| part.parse::<u32>().ok())
                .ok_or_else(&invalid)
        };
        let version = Self::new(next()?, next()?, next()?);

        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(version)
    }
}

/// Per-device connection settings.
///
/// Link-configuration values and the reconnect policy are protocol constants
/// and are not configurable here.
#[derive(Debug, Clone, Default, Eq, PartialEq, Builder, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ConnectionConfig {
    /// Firmware versions known to be incompatible with this SDK.
    #[builder(default)]
    #[serde(default)]
    blocked_firmware_versions: Vec<FirmwareVersion>,
}

impl ConnectionConfig {
    /// Parses configuration from JSON text.
    ///
    /// ```
    /// use taglink::{ConnectionConfig, FirmwareVersion};
    ///
    /// let config = ConnectionConfig::from_json_str(
    ///     r#"{ "blocked_firmware_versions": ["0.9.1"] }"#,
    /// )?;
    /// assert!(config.is_firmware_blocked(FirmwareVersion::new(0, 9, 1)));
    /// # Ok::<(), taglink::ConfigError>(())
    /// ```
    ///
    /// # Errors
    ///
    /// Returns an error when the text is not valid JSON or contains an
    /// invalid firmware version.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    #[instrument(level = "debug", skip(path), fields(path = %path.as_ref().display()))]
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::from_json_str(&json)?;
        debug!(
            blocked_versions = config.blocked_firmware_versions.len(),
            "loaded connection configuration"
        );
        Ok(config)
    }

    /// Returns the firmware block-list.
    #[must_use]
    pub fn blocked_firmware_versions(&self) -> &[FirmwareVersion] {
        &self.blocked_firmware_versions
    }

    /// Returns whether a tag running `version` must be updated before use.
    #[must_use]
    pub fn is_firmware_blocked(&self, version: FirmwareVersion) -> bool {
        self.blocked_firmware_versions.contains(&version)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("1.2.3", FirmwareVersion::new(1, 2, 3))]
    #[case(" 0.96.0 ", FirmwareVersion::new(0, 96, 0))]
    fn firmware_version_parses_dotted_triplets(
        #[case] raw: &str,
        #[case] expected: FirmwareVersion,
    ) {
        let parsed: FirmwareVersion = raw.parse().expect("version should parse");
        assert_eq!(expected, parsed);
    }

    #[rstest]
    #[case("1.2")]
    #[case("1.2.3.4")]
    #[case("1.x.3")]
    #[case("")]
    fn firmware_version_rejects_malformed_values(#[case] raw: &str) {
        let parsed = raw.parse::<FirmwareVersion>();
        assert_matches!(parsed, Err(ConfigError::InvalidFirmwareVersion { value }) if value == raw);
    }

    #[test]
    fn firmware_version_displays_dotted_triplet() {
        assert_eq!("2.0.11", FirmwareVersion::new(2, 0, 11).to_string());
    }

    #[test]
    fn config_defaults_to_empty_block_list() {
        let config = ConnectionConfig::from_json_str("{}").expect("empty object should parse");
        assert_eq!(ConnectionConfig::default(), config);
        assert_eq!(false, config.is_firmware_blocked(FirmwareVersion::new(1, 0, 0)));
    }

    #[test]
    fn config_rejects_invalid_block_list_entries() {
        let result = ConnectionConfig::from_json_str(r#"{ "blocked_firmware_versions": ["one"] }"#);
        assert_matches!(result, Err(ConfigError::Parse(_)));
    }

    #[test]
    fn config_builder_sets_block_list() {
        let config = ConnectionConfig::builder()
            .blocked_firmware_versions(vec![FirmwareVersion::new(0, 9, 1)])
            .build();
        assert_eq!(true, config.is_firmware_blocked(FirmwareVersion::new(0, 9, 1)));
        assert_eq!(false, config.is_firmware_blocked(FirmwareVersion::new(0, 9, 2)));
    }

    #[test]
    fn config_file_errors_name_the_path() {
        let result = ConnectionConfig::from_json_file("/nonexistent/taglink.json");
        assert_matches!(result, Err(ConfigError::Io { path, .. }) if path == "/nonexistent/taglink.json");
    }
}
