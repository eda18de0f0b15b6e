pub mod registry;
pub mod tensor;
pub mod data;
pub mod eltwise;
pub mod activations;
pub mod control_flow;

pub mod prelude {
    pub use super::registry::{NodeParams, Operator, OperatorBase, OperatorRegistry};
    pub use super::tensor::{Tensor, TensorData, TensorHandle};
}

pub use registry::{Operator, OperatorRegistry};
pub use tensor::{Tensor, TensorData, TensorHandle};

// Module files for nn subdirectory
pub mod nn {
    pub mod conv;
    pub mod pool;
}
