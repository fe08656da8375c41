//! Device model descriptors.
//!
//! A model is a capability descriptor plus a table of command generators. The
//! built-in models are the `base` descriptor with per-model overrides applied,
//! and a device's configuration can override the capabilities again.

use forge_shared::config::{AxisOffsets, DeviceConfig};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unknown device model '{0}'")]
pub struct UnknownModel(pub String);

/// Named instruction generators for one model.
#[derive(Debug, Clone, Copy)]
pub struct CommandSet {
    /// Blocks until all buffered motion has finished.
    pub finish_moves: fn() -> String,
    /// Asks for a position report.
    pub query_position: fn() -> String,
    /// Absolute move of the Z axis to the given height.
    pub lift: fn(f64) -> String,
    /// Resets the firmware's line counter (checksummed links only).
    pub reset_line_numbers: fn() -> String,
    pub start_sequence: fn() -> Vec<String>,
    pub end_sequence: fn() -> Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ModelDescriptor {
    pub name: String,
    pub checksum_support: bool,
    pub offsets: AxisOffsets,
    pub commands: CommandSet,
}

/// Partial descriptor; `None` keeps the value being overridden.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelOverride {
    pub checksum_support: Option<bool>,
    pub offsets: Option<AxisOffsets>,
    pub finish_moves: Option<fn() -> String>,
    pub query_position: Option<fn() -> String>,
    pub lift: Option<fn(f64) -> String>,
    pub reset_line_numbers: Option<fn() -> String>,
    pub start_sequence: Option<fn() -> Vec<String>>,
    pub end_sequence: Option<fn() -> Vec<String>>,
}

fn finish_moves() -> String {
    "M400".to_string()
}

fn query_position() -> String {
    "M114".to_string()
}

fn lift(z: f64) -> String {
    format!("G1 Z{:.3} F1200", z)
}

fn reset_line_numbers() -> String {
    "M110 N0".to_string()
}

fn start_sequence() -> Vec<String> {
    vec!["G28".to_string(), "G90".to_string()]
}

fn end_sequence() -> Vec<String> {
    vec!["M104 S0".to_string(), "M140 S0".to_string(), "M84".to_string()]
}

fn klipper_end_sequence() -> Vec<String> {
    vec!["TURN_OFF_HEATERS".to_string(), "M84".to_string()]
}

fn reprap_lift(z: f64) -> String {
    format!("G1 Z{:.3} F600", z)
}

pub const MODEL_NAMES: &[&str] = &["base", "marlin", "reprap", "klipper"];

impl ModelDescriptor {
    pub fn base() -> Self {
        Self {
            name: "base".to_string(),
            checksum_support: false,
            offsets: AxisOffsets::default(),
            commands: CommandSet {
                finish_moves,
                query_position,
                lift,
                reset_line_numbers,
                start_sequence,
                end_sequence,
            },
        }
    }

    pub fn compose(mut self, name: &str, overrides: ModelOverride) -> Self {
        self.name = name.to_string();
        if let Some(checksum) = overrides.checksum_support {
            self.checksum_support = checksum;
        }
        if let Some(offsets) = overrides.offsets {
            self.offsets = offsets;
        }
        let c = &mut self.commands;
        c.finish_moves = overrides.finish_moves.unwrap_or(c.finish_moves);
        c.query_position = overrides.query_position.unwrap_or(c.query_position);
        c.lift = overrides.lift.unwrap_or(c.lift);
        c.reset_line_numbers = overrides.reset_line_numbers.unwrap_or(c.reset_line_numbers);
        c.start_sequence = overrides.start_sequence.unwrap_or(c.start_sequence);
        c.end_sequence = overrides.end_sequence.unwrap_or(c.end_sequence);
        self
    }

    pub fn lookup(name: &str) -> Result<Self, UnknownModel> {
        let overrides = match name {
            "base" => return Ok(Self::base()),
            "marlin" => ModelOverride {
                checksum_support: Some(true),
                ..ModelOverride::default()
            },
            "reprap" => ModelOverride {
                checksum_support: Some(true),
                lift: Some(reprap_lift),
                ..ModelOverride::default()
            },
            "klipper" => ModelOverride {
                end_sequence: Some(klipper_end_sequence),
                ..ModelOverride::default()
            },
            other => return Err(UnknownModel(other.to_string())),
        };
        Ok(Self::base().compose(name, overrides))
    }

    /// Model named by `config`, with the device's own capability overrides.
    pub fn from_config(config: &DeviceConfig) -> Result<Self, UnknownModel> {
        let model = Self::lookup(&config.model)?;
        let name = model.name.clone();
        let offsets = (!config.offsets.is_zero()).then_some(config.offsets);
        Ok(model.compose(
            &name,
            ModelOverride {
                checksum_support: config.checksum,
                offsets,
                ..ModelOverride::default()
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marlin_extends_base_with_checksums() {
        let marlin = ModelDescriptor::lookup("marlin").unwrap();
        assert!(marlin.checksum_support);
        assert_eq!((marlin.commands.query_position)(), "M114");
        assert_eq!((marlin.commands.lift)(15.0), "G1 Z15.000 F1200");
    }

    #[test]
    fn reprap_overrides_lift_only() {
        let reprap = ModelDescriptor::lookup("reprap").unwrap();
        assert_eq!((reprap.commands.lift)(2.5), "G1 Z2.500 F600");
        assert_eq!((reprap.commands.finish_moves)(), "M400");
    }

    #[test]
    fn device_config_overrides_model() {
        let config = DeviceConfig {
            id: "a".to_string(),
            model: "marlin".to_string(),
            checksum: Some(false),
            offsets: AxisOffsets { x: 0.0, y: 0.0, z: 0.3 },
            ..DeviceConfig::default()
        };
        let model = ModelDescriptor::from_config(&config).unwrap();
        assert_eq!(model.name, "marlin");
        assert!(!model.checksum_support);
        assert_eq!(model.offsets.z, 0.3);
    }

    #[test]
    fn unknown_model_is_rejected() {
        assert!(ModelDescriptor::lookup("makerbot").is_err());
        for name in MODEL_NAMES {
            assert!(ModelDescriptor::lookup(name).is_ok());
        }
    }
}
