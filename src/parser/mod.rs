pub mod archive;
pub mod network_builder;
pub mod network_config;

// Re-export key types from the parser module
pub use archive::{GlobalHeader, TensorArchive};
pub use network_builder::{NetworkBuilder, NetworkParameters, NetworkTopology, NodeDesc};
pub use network_config::{LayerConfig, NetworkConfig};
