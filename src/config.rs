//! Environment-driven configuration, read once at startup.

use std::env;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
const DEFAULT_LISTEN_PORT: u16 = 11434;
const DEFAULT_UPSTREAM: &str = "http://10.66.0.7:8080";

/// Configuration error raised during startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid LISTEN_PORT '{value}': {source}")]
    InvalidPort {
        value: String,
        source: std::num::ParseIntError,
    },
}

/// How the `reasoning_content` channel is handled.
///
/// Only `ShowReasoning` alters the content stream; the other modes are
/// pass-through but the configured value is logged for diagnosis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ThinkingMode {
    #[default]
    Default,
    Vscode,
    Events,
    Both,
    ShowReasoning,
    Off,
}

impl ThinkingMode {
    /// Whether the streaming pipeline rewrites reasoning into content.
    pub fn injects_reasoning(self) -> bool {
        self == Self::ShowReasoning
    }
}

impl FromStr for ThinkingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "vscode" => Ok(Self::Vscode),
            "events" => Ok(Self::Events),
            "both" => Ok(Self::Both),
            "show_reasoning" => Ok(Self::ShowReasoning),
            "off" => Ok(Self::Off),
            other => Err(other.to_owned()),
        }
    }
}

impl fmt::Display for ThinkingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Default => "default",
            Self::Vscode => "vscode",
            Self::Events => "events",
            Self::Both => "both",
            Self::ShowReasoning => "show_reasoning",
            Self::Off => "off",
        };
        f.write_str(name)
    }
}

/// Process configuration. Built from the environment once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    /// Upstream base URL, no trailing slash.
    pub upstream: String,
    pub thinking_mode: ThinkingMode,
    pub thinking_debug: bool,
    pub verbose: bool,
}

impl Config {
    /// Read configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let listen_host =
            env::var("LISTEN_HOST").unwrap_or_else(|_| DEFAULT_LISTEN_HOST.to_owned());

        let listen_port = match env::var("LISTEN_PORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|source| ConfigError::InvalidPort { value: raw, source })?,
            Err(_) => DEFAULT_LISTEN_PORT,
        };

        let upstream = env::var("UPSTREAM")
            .unwrap_or_else(|_| DEFAULT_UPSTREAM.to_owned())
            .trim_end_matches('/')
            .to_owned();

        let thinking_mode = match env::var("THINKING_MODE") {
            Ok(raw) => raw.parse().unwrap_or_else(|unknown: String| {
                tracing::warn!("unknown THINKING_MODE '{unknown}', using 'default'");
                ThinkingMode::Default
            }),
            Err(_) => ThinkingMode::Default,
        };

        Ok(Self {
            listen_host,
            listen_port,
            upstream,
            thinking_mode,
            thinking_debug: flag_from_env("THINKING_DEBUG"),
            verbose: flag_from_env("VERBOSE"),
        })
    }
}

/// Parse a boolean environment flag: `1`, `true`, and `yes` (any case) are true.
pub fn flag_from_env(name: &str) -> bool {
    env::var(name).is_ok_and(|v| parse_flag(&v))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}
