use std::collections::HashMap;
use std::fs;
use std::path::Path;

use log::{debug, info};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::backend::BackendType;
use crate::error::{Error, Result};

pub const DEFAULT_CPU_MEM_SIZE: u64 = 128 * 1024;
pub const DEFAULT_CPU_NUM_PES: usize = 8;
pub const DEFAULT_CPU_NUM_MACCS_PER_PE: usize = 32;

pub const DEFAULT_SMV_MEM_SIZE: u64 = 32 * 1024;
pub const DEFAULT_SMV_NUM_PES: usize = 8;
pub const DEFAULT_SMV_NUM_MACCS_PER_PE: usize = 32;

/// Resources of one backend instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Local memory capacity in bytes
    pub mem_size: u64,
    pub num_pes: usize,
    pub num_maccs_per_pe: usize,
}

impl BackendConfig {
    pub fn default_for(backend: BackendType) -> Self {
        match backend {
            BackendType::Reference | BackendType::Cpu => Self {
                mem_size: DEFAULT_CPU_MEM_SIZE,
                num_pes: DEFAULT_CPU_NUM_PES,
                num_maccs_per_pe: DEFAULT_CPU_NUM_MACCS_PER_PE,
            },
            BackendType::Smv => Self {
                mem_size: DEFAULT_SMV_MEM_SIZE,
                num_pes: DEFAULT_SMV_NUM_PES,
                num_maccs_per_pe: DEFAULT_SMV_NUM_MACCS_PER_PE,
            },
        }
    }

    /// MAC units across all processing elements
    pub fn total_maccs(&self) -> usize {
        self.num_pes * self.num_maccs_per_pe
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::default_for(BackendType::Cpu)
    }
}

/// Partial settings applied to every instance of one backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendOverride {
    pub mem_size: Option<u64>,
    pub num_pes: Option<usize>,
    pub num_maccs_per_pe: Option<usize>,
}

impl BackendOverride {
    fn apply(&self, config: &mut BackendConfig) {
        if let Some(mem_size) = self.mem_size {
            config.mem_size = mem_size;
        }
        if let Some(num_pes) = self.num_pes {
            config.num_pes = num_pes;
        }
        if let Some(num_maccs) = self.num_maccs_per_pe {
            config.num_maccs_per_pe = num_maccs;
        }
    }
}

/// Override document, e.g. `{ "cpu": { "mem_size": 65536 } }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendOverrides {
    pub reference: Option<BackendOverride>,
    pub cpu: Option<BackendOverride>,
    pub smv: Option<BackendOverride>,
}

impl BackendOverrides {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::LoadError(path.to_path_buf(), e.to_string()))?;
        Self::from_json_str(&text)
    }

    fn for_backend(&self, backend: BackendType) -> Option<&BackendOverride> {
        match backend {
            BackendType::Reference => self.reference.as_ref(),
            BackendType::Cpu => self.cpu.as_ref(),
            BackendType::Smv => self.smv.as_ref(),
        }
    }
}

/// Per-instance resources of every backend type.
///
/// Built once before execution and read-only afterwards. Lookups with an
/// out-of-range instance index resolve to instance 0.
#[derive(Debug, Clone)]
pub struct BackendResourceModel {
    configs: HashMap<BackendType, Vec<BackendConfig>>,
}

impl BackendResourceModel {
    /// Default resources for `num_cpu` CPU instances and `num_smv` SMV
    /// instances. The reference backend mirrors the CPU instances. Every
    /// backend has at least one instance.
    pub fn with_defaults(num_cpu: usize, num_smv: usize) -> Self {
        let configs = BackendType::iter()
            .map(|backend| {
                let count = match backend {
                    BackendType::Reference | BackendType::Cpu => num_cpu,
                    BackendType::Smv => num_smv,
                }
                .max(1);
                (backend, vec![BackendConfig::default_for(backend); count])
            })
            .collect();
        Self { configs }
    }

    /// Defaults followed by the overrides of a JSON document
    pub fn from_json_str(num_cpu: usize, num_smv: usize, json: &str) -> Result<Self> {
        let mut model = Self::with_defaults(num_cpu, num_smv);
        model.apply_overrides(&BackendOverrides::from_json_str(json)?);
        Ok(model)
    }

    pub fn from_file<P: AsRef<Path>>(num_cpu: usize, num_smv: usize, path: P) -> Result<Self> {
        let mut model = Self::with_defaults(num_cpu, num_smv);
        model.apply_overrides(&BackendOverrides::from_file(path)?);
        Ok(model)
    }

    /// Apply overrides to every instance of the backends they name
    pub fn apply_overrides(&mut self, overrides: &BackendOverrides) {
        for (backend, instances) in self.configs.iter_mut() {
            if let Some(o) = overrides.for_backend(*backend) {
                info!("Applying {} resource overrides to {} instance(s)", backend, instances.len());
                instances.iter_mut().for_each(|config| o.apply(config));
            }
        }
    }

    pub fn instance_count(&self, backend: BackendType) -> usize {
        self.configs.get(&backend).map(|c| c.len()).unwrap_or(0)
    }

    /// Resources of one instance, falling back to instance 0 when `index`
    /// is negative or past the last instance
    pub fn lookup(&self, backend: BackendType, index: i64) -> BackendConfig {
        let instances = match self.configs.get(&backend) {
            Some(instances) if !instances.is_empty() => instances,
            _ => return BackendConfig::default_for(backend),
        };

        match usize::try_from(index).ok().and_then(|i| instances.get(i)) {
            Some(config) => *config,
            None => {
                debug!(
                    "{} instance {} out of range ({} configured), using instance 0",
                    backend,
                    index,
                    instances.len()
                );
                instances[0]
            }
        }
    }
}

impl Default for BackendResourceModel {
    fn default() -> Self {
        Self::with_defaults(1, 1)
    }
}
