use std::sync::Arc;

use log::info;

use crate::backend::{BackendResourceModel, BackendType};
use crate::error::{Error, Result};
use crate::model::SamplingInfo;

/// Options for running a network
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Number of worker threads (0 = rayon's default)
    pub thread_count: usize,
    /// Dispatch ready operators concurrently on the worker pool
    pub parallel_dispatch: bool,
    /// Sampling applied to operators that support it and have none of their own
    pub sampling: SamplingInfo,
}

impl ExecutionOptions {
    /// Create a new execution options object
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of threads to use
    pub fn set_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    /// Enable or disable concurrent dispatch of ready operators
    pub fn enable_parallel_dispatch(mut self, enable: bool) -> Self {
        self.parallel_dispatch = enable;
        self
    }

    /// Set the default sampling configuration
    pub fn set_sampling(mut self, sampling: SamplingInfo) -> Self {
        self.sampling = sampling;
        self
    }
}

/// Everything a run needs besides the network itself: options, backend
/// resources and the worker pool.
#[derive(Debug)]
pub struct ExecutionContext {
    options: ExecutionOptions,
    resources: Arc<BackendResourceModel>,
    thread_pool: Option<Arc<rayon::ThreadPool>>,
}

impl ExecutionContext {
    /// Create a context. A worker pool is built when a thread count is set
    /// or parallel dispatch is requested.
    pub fn new(options: ExecutionOptions, resources: BackendResourceModel) -> Result<Self> {
        let thread_pool = if options.thread_count > 0 || options.parallel_dispatch {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(options.thread_count)
                .thread_name(|i| format!("nnsim-worker-{}", i))
                .build()
                .map_err(|e| Error::ExecutionError(format!("Failed to build thread pool: {}", e)))?;
            info!("Created worker pool with {} threads", pool.current_num_threads());
            Some(Arc::new(pool))
        } else {
            None
        };

        Ok(Self {
            options,
            resources: Arc::new(resources),
            thread_pool,
        })
    }

    pub fn options(&self) -> &ExecutionOptions {
        &self.options
    }

    pub fn resources(&self) -> &BackendResourceModel {
        &self.resources
    }

    pub fn thread_pool(&self) -> Option<&Arc<rayon::ThreadPool>> {
        self.thread_pool.as_ref()
    }

    /// Number of simulated accelerators available
    pub fn num_accelerators(&self) -> usize {
        self.resources.instance_count(BackendType::Smv)
    }

    /// Run `f` inside the worker pool, or on the calling thread without one
    pub fn install<R, F>(&self, f: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.thread_pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self {
            options: ExecutionOptions::default(),
            resources: Arc::new(BackendResourceModel::default()),
            thread_pool: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SamplingLevel;

    #[test]
    fn test_default_context_is_single_threaded() {
        let context = ExecutionContext::default();
        assert!(context.thread_pool().is_none());
        assert_eq!(context.install(|| 41 + 1), 42);
        assert_eq!(context.num_accelerators(), 1);
    }

    #[test]
    fn test_pool_creation() {
        let options = ExecutionOptions::new()
            .set_thread_count(2)
            .enable_parallel_dispatch(true)
            .set_sampling(SamplingInfo::new(SamplingLevel::Low, 2));
        let context = ExecutionContext::new(options, BackendResourceModel::with_defaults(1, 3)).unwrap();

        let pool = context.thread_pool().unwrap();
        assert_eq!(pool.current_num_threads(), 2);
        assert_eq!(context.install(rayon::current_num_threads), 2);
        assert_eq!(context.options().sampling.level, SamplingLevel::Low);
        assert_eq!(context.num_accelerators(), 3);
    }
}
