//! Relay pair list and runtime settings.
//!
//! The pair list is a plain text file, one `<source>,<destination>` per line.
//! Runtime settings are an optional TOML file parsed into a permissive
//! `*Input` struct and then resolved into [`RelaySettings`].

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::media::TransportOptions;
use crate::pacing::PacingConfig;

pub const CONFIG_VERSION: u32 = 1;

/// One configured source → destination relay. Immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayPair {
    pub source: String,
    pub destination: String,
}

impl RelayPair {
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

fn parse_line(lineno: usize, line: &str) -> Option<RelayPair> {
    let (source, destination) = line.split_once(',')?;
    let source = source.trim();
    let destination = destination.trim();
    if source.is_empty() || destination.is_empty() {
        tracing::debug!(line = lineno, "skipping pair with an empty field");
        return None;
    }
    Some(RelayPair::new(source, destination))
}

/// Parse a pair list.
///
/// Each line is split at its first comma and both halves are trimmed. Lines
/// without a comma, or with an empty half, are skipped.
pub fn parse_pairs(input: &str) -> Vec<RelayPair> {
    input
        .lines()
        .enumerate()
        .filter_map(|(i, line)| parse_line(i + 1, line))
        .collect()
}

/// Parse a pair list from raw bytes. Lines that are not valid UTF-8 are
/// skipped like any other malformed line.
pub fn parse_pair_bytes(input: &[u8]) -> Vec<RelayPair> {
    input
        .split(|&b| b == b'\n')
        .enumerate()
        .filter_map(|(i, raw)| match std::str::from_utf8(raw) {
            Ok(line) => parse_line(i + 1, line),
            Err(e) => {
                tracing::warn!(line = i + 1, error = %e, "skipping pair line that is not valid UTF-8");
                None
            }
        })
        .collect()
}

/// Read and parse the pair list at `path`. Only a missing or unreadable file
/// is an error.
pub fn load_pairs(path: &Path) -> Result<Vec<RelayPair>, ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_pair_bytes(&bytes))
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelaySettingsInput {
    pub version: u32,
    pub pacing: PacingInput,
    pub supervisor: SupervisorInput,
    pub fleet: FleetInput,
    pub output: OutputInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PacingInput {
    pub burst_allowance_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub sleep_slice_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SupervisorInput {
    pub cooldown_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FleetInput {
    pub stagger_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputInput {
    pub container: Option<String>,
    pub reconnect: Option<bool>,
    pub reconnect_streamed: Option<bool>,
    pub reconnect_delay_max_s: Option<u32>,
}

/// Destination side settings shared by every relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputConfig {
    /// Container kind handed to the media library (e.g. `flv` for RTMP).
    pub container: String,
    pub transport: TransportOptions,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            container: "flv".to_string(),
            transport: TransportOptions::default(),
        }
    }
}

/// Resolved runtime settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub version: u32,
    pub pacing: PacingConfig,
    /// Pause between the end of one attempt and the start of the next.
    pub cooldown: Duration,
    /// Pause between starting consecutive relays.
    pub stagger: Duration,
    pub output: OutputConfig,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            pacing: PacingConfig::default(),
            cooldown: Duration::from_secs(5),
            stagger: Duration::from_millis(500),
            output: OutputConfig::default(),
        }
    }
}

impl RelaySettingsInput {
    pub fn resolve(self) -> Result<RelaySettings, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let defaults = RelaySettings::default();
        let ms = |v: Option<u64>, d: Duration| v.map(Duration::from_millis).unwrap_or(d);

        let pacing = PacingConfig {
            burst_allowance: ms(
                self.pacing.burst_allowance_ms,
                defaults.pacing.burst_allowance,
            ),
            max_delay: ms(self.pacing.max_delay_ms, defaults.pacing.max_delay),
            sleep_slice: ms(self.pacing.sleep_slice_ms, defaults.pacing.sleep_slice)
                .max(Duration::from_millis(1)),
        };

        let container = self
            .output
            .container
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or(defaults.output.container);
        let transport = TransportOptions {
            reconnect: self
                .output
                .reconnect
                .unwrap_or(defaults.output.transport.reconnect),
            reconnect_streamed: self
                .output
                .reconnect_streamed
                .unwrap_or(defaults.output.transport.reconnect_streamed),
            reconnect_delay_max_s: self
                .output
                .reconnect_delay_max_s
                .unwrap_or(defaults.output.transport.reconnect_delay_max_s),
        };

        Ok(RelaySettings {
            version,
            pacing,
            cooldown: ms(self.supervisor.cooldown_ms, defaults.cooldown),
            stagger: ms(self.fleet.stagger_ms, defaults.stagger),
            output: OutputConfig {
                container,
                transport,
            },
        })
    }
}

impl RelaySettings {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(RelaySettings::default());
        }
        let parsed: RelaySettingsInput =
            toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        parsed.resolve()
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }
}
