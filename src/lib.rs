pub mod backend;
pub mod error;
pub mod execution;
pub mod layout;
pub mod memory;
pub mod model;
pub mod ops;
pub mod parser;

// Re-export commonly used types
pub use backend::{BackendConfig, BackendResourceModel, BackendType};
pub use error::{Error, Result};
pub use execution::context::{ExecutionContext, ExecutionOptions};
pub use execution::scheduler::{run_network, RunSummary, Scheduler};
pub use layout::tensor_layout::{compute_output_dim, TensorShape};
pub use memory::workspace::Workspace;
pub use model::{DataLayout, DataType, Network, NodeId, OpType, PaddingType, SamplingInfo, SamplingLevel};
pub use ops::registry::{Operator, OperatorRegistry};
pub use ops::tensor::{Tensor, TensorHandle};
pub use parser::network_builder::{NetworkBuilder, NetworkParameters, NetworkTopology, NodeDesc};
pub use parser::network_config::NetworkConfig;
