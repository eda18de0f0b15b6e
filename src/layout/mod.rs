pub mod tensor_layout;
pub mod zeropad;

pub use tensor_layout::{calc_padding, compute_output_dim, TensorShape};
pub use zeropad::{materialize_zero_padding, zero_pad_into};
