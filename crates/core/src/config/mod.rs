use std::{fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{BeatCueError, Result};

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub osc: OscConfig,
    pub engine: EngineConfig,
    pub simulator: SimulatorConfig,
}

impl AppConfig {
    /// Reads a TOML configuration file. Missing sections fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|err| {
            BeatCueError::Config(format!("cannot read {}: {err}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.engine.tick_rate_hz > 0.0 && self.engine.tick_rate_hz.is_finite()) {
            return Err(BeatCueError::Config(format!(
                "tick rate must be positive, got {}",
                self.engine.tick_rate_hz
            )));
        }
        for (name, addr) in [("source", &self.osc.source_addr), ("target", &self.osc.target_addr)] {
            if !is_host_port(addr) {
                return Err(BeatCueError::Config(format!("OSC {name} `{addr}` is not host:port")));
            }
        }
        Ok(())
    }
}

/// Shape check only; name resolution happens when the sink is built.
fn is_host_port(addr: &str) -> bool {
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Outbound transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OscConfig {
    /// When false every batch is dropped after logging.
    pub enabled: bool,
    pub source_addr: String,
    pub target_addr: String,
}

impl Default for OscConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            source_addr: "0.0.0.0:0".to_string(),
            target_addr: "127.0.0.1:6669".to_string(),
        }
    }
}

/// Settings for the polling loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub tick_rate_hz: f64,
    pub cue_dir: PathBuf,
    /// Rewrite timeline files with their normalized form while loading.
    pub normalize_timelines: bool,
    /// Emit `/beat`, `/bpm` and deck metadata messages alongside cues.
    pub telemetry: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_rate_hz: 120.0,
            cue_dir: PathBuf::from("cues"),
            normalize_timelines: false,
            telemetry: true,
        }
    }
}

/// Parameters of the built-in constant-tempo source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub tempo: f64,
    pub artist: String,
    pub title: String,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            tempo: 120.0,
            artist: String::new(),
            title: String::new(),
        }
    }
}
