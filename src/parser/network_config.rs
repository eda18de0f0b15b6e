use std::fs;
use std::path::Path;

use log::{debug, warn};

use crate::backend::BackendType;
use crate::error::{Error, Result};
use crate::model::OpType;

/// Highest core count a layer may request
pub const MAX_NUM_ACCELERATORS: i64 = 8;

/// Placement of one layer: `<name> <op type code> <backend> <cores>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerConfig {
    pub layer_name: String,
    pub op_type: OpType,
    pub backend: BackendType,
    pub num_cores: usize,
}

impl LayerConfig {
    /// Parse one line. Fields are separated by one or more spaces and the
    /// line must contain nothing else; otherwise `None` is returned.
    pub fn parse_line(line: &str) -> Option<Self> {
        if line.starts_with(' ') || line.ends_with(' ') {
            return None;
        }

        let fields: Vec<&str> = line.split(' ').filter(|f| !f.is_empty()).collect();
        let [name, op_code, backend, cores] = fields.as_slice() else {
            return None;
        };

        let op_code: i64 = op_code.parse().ok()?;
        let cores: i64 = cores.parse().ok()?;
        let num_cores = if cores <= 0 || cores > MAX_NUM_ACCELERATORS {
            1
        } else {
            cores as usize
        };

        Some(Self {
            layer_name: name.to_string(),
            op_type: OpType::from_code(op_code),
            backend: BackendType::from_config_name(backend),
            num_cores,
        })
    }
}

/// Layer placements read from a configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkConfig {
    layers: Vec<LayerConfig>,
}

impl NetworkConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse every line; blank lines are skipped and malformed ones dropped
    pub fn parse_str(text: &str) -> Self {
        let mut config = Self::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match LayerConfig::parse_line(line) {
                Some(layer) => config.push(layer),
                None => warn!("Dropping malformed layer config on line {}: '{}'", lineno + 1, line),
            }
        }
        debug!("Parsed {} layer config(s)", config.len());
        config
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::LoadError(path.to_path_buf(), e.to_string()))?;
        Ok(Self::parse_str(&text))
    }

    pub fn push(&mut self, layer: LayerConfig) {
        self.layers.push(layer);
    }

    /// Placement of a layer; when a layer appears more than once the last
    /// record wins
    pub fn get(&self, layer_name: &str) -> Option<&LayerConfig> {
        self.layers.iter().rev().find(|l| l.layer_name == layer_name)
    }

    pub fn layers(&self) -> &[LayerConfig] {
        &self.layers
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}
