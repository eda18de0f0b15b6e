use std::collections::HashMap;
use std::sync::Arc;

use log::trace;

use crate::error::{Error, Result};
use crate::ops::tensor::{Tensor, TensorHandle};

/// Owner of every tensor used by a network.
///
/// Tensors are registered once under a unique name and live as long as the
/// workspace. Operators only hold shared handles to them.
#[derive(Debug, Default)]
pub struct Workspace {
    tensors: HashMap<String, TensorHandle>,
    // registration order, for stable iteration
    order: Vec<String>,
    total_bytes: usize,
}

impl Workspace {
    /// Create an empty workspace
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a tensor and return a handle to it
    pub fn add_tensor(&mut self, tensor: Tensor) -> Result<TensorHandle> {
        if self.tensors.contains_key(tensor.name()) {
            return Err(Error::DuplicateTensor(tensor.name().to_string()));
        }

        let name = tensor.name().to_string();
        let bytes = tensor.size_in_bytes();
        let handle = Arc::new(tensor);
        trace!("Workspace: registered '{}' ({} bytes)", name, bytes);

        self.total_bytes += bytes;
        self.order.push(name.clone());
        self.tensors.insert(name, handle.clone());
        Ok(handle)
    }

    /// Look up a tensor by name
    pub fn get_tensor(&self, name: &str) -> Result<TensorHandle> {
        self.tensors
            .get(name)
            .cloned()
            .ok_or_else(|| Error::TensorNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tensors.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensor names in registration order
    pub fn tensor_names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    /// Bytes held by all backing buffers, alignment padding included
    pub fn total_storage_bytes(&self) -> usize {
        self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::tensor_layout::TensorShape;
    use crate::model::DataLayout;

    fn tensor(name: &str) -> Tensor {
        Tensor::new(name, TensorShape::new(&[1, 2, 3, 3], DataLayout::NCHW, 0))
    }

    #[test]
    fn test_add_and_get() {
        let mut workspace = Workspace::new();
        let handle = workspace.add_tensor(tensor("a")).unwrap();
        let fetched = workspace.get_tensor("a").unwrap();
        assert!(Arc::ptr_eq(&handle, &fetched));
        assert!(workspace.contains("a"));
        assert_eq!(workspace.len(), 1);
        assert_eq!(workspace.total_storage_bytes(), 18 * 4);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut workspace = Workspace::new();
        workspace.add_tensor(tensor("a")).unwrap();
        match workspace.add_tensor(tensor("a")) {
            Err(Error::DuplicateTensor(name)) => assert_eq!(name, "a"),
            other => panic!("expected duplicate error, got {:?}", other),
        }
        assert_eq!(workspace.len(), 1);
    }

    #[test]
    fn test_missing_tensor() {
        let workspace = Workspace::new();
        assert!(workspace.is_empty());
        assert!(matches!(workspace.get_tensor("nope"), Err(Error::TensorNotFound(_))));
    }

    #[test]
    fn test_names_in_registration_order() {
        let mut workspace = Workspace::new();
        for name in ["c", "a", "b"] {
            workspace.add_tensor(tensor(name)).unwrap();
        }
        assert_eq!(workspace.tensor_names().collect::<Vec<_>>(), vec!["c", "a", "b"]);
    }
}
