//! Dependency-driven execution of a compiled [`Network`].
//!
//! Every operator starts with a pending count equal to the number of its
//! input slots fed by other operators. Completing an operator decrements the
//! count of each consumer once per edge; the consumer becomes ready when its
//! count reaches zero. Sequential runs dispatch the lowest ready [`NodeId`]
//! first. Parallel runs spawn each ready operator on the context's pool.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Mutex;

use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::execution::context::ExecutionContext;
use crate::model::{Network, NodeId, TileReport};
use crate::ops::registry::OpState;
use crate::ops::tensor::TensorHandle;

/// Outcome of one run
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Operators in the order they completed
    pub order: Vec<NodeId>,
    /// Output tensors of the sink operators
    pub outputs: Vec<TensorHandle>,
    /// Tiling statistics per operator name
    pub tiles: Vec<(String, TileReport)>,
}

impl RunSummary {
    /// A sink output by tensor name
    pub fn output(&self, name: &str) -> Option<&TensorHandle> {
        self.outputs.iter().find(|t| t.name() == name)
    }

    /// Position of an operator in the completion order
    pub fn position(&self, id: NodeId) -> Option<usize> {
        self.order.iter().position(|&n| n == id)
    }
}

/// Runs a network against an execution context
#[derive(Debug)]
pub struct Scheduler<'a> {
    network: &'a Network,
    context: &'a ExecutionContext,
}

impl<'a> Scheduler<'a> {
    pub fn new(network: &'a Network, context: &'a ExecutionContext) -> Self {
        Self { network, context }
    }

    /// Validate the network, then run every operator once
    pub fn run(&self) -> Result<RunSummary> {
        if !self.network.is_compiled() {
            return Err(Error::InvalidGraph(format!(
                "Network '{}' must be compiled before it runs",
                self.network.name()
            )));
        }
        self.network.validate()?;
        self.network.reset_schedule();

        let parallel = self.context.options().parallel_dispatch && self.context.thread_pool().is_some();
        info!(
            "Running network '{}' ({} operators, {} dispatch)",
            self.network.name(),
            self.network.len(),
            if parallel { "parallel" } else { "sequential" }
        );

        let order = if parallel {
            self.run_parallel()?
        } else {
            self.run_sequential()?
        };

        if order.len() != self.network.len() || !self.network.all_done() {
            return Err(Error::ExecutionError(format!(
                "Network '{}' stalled after {} of {} operators",
                self.network.name(),
                order.len(),
                self.network.len()
            )));
        }

        Ok(self.summarize(order))
    }

    fn initially_ready(&self) -> Result<Vec<NodeId>> {
        let mut ready = Vec::new();
        for id in 0..self.network.len() {
            if self.network.initial_pending(id) == 0 {
                self.network
                    .operator(id)?
                    .base()
                    .transition(OpState::Pending, OpState::Ready)?;
                ready.push(id);
            }
        }
        Ok(ready)
    }

    fn run_sequential(&self) -> Result<Vec<NodeId>> {
        let mut ready: BinaryHeap<Reverse<NodeId>> =
            self.initially_ready()?.into_iter().map(Reverse).collect();
        let mut order = Vec::with_capacity(self.network.len());

        while let Some(Reverse(id)) = ready.pop() {
            self.dispatch(id)?;
            order.push(id);
            ready.extend(self.release_consumers(id)?.into_iter().map(Reverse));
        }
        Ok(order)
    }

    fn run_parallel(&self) -> Result<Vec<NodeId>> {
        let pool = self
            .context
            .thread_pool()
            .ok_or_else(|| Error::ExecutionError("Parallel dispatch needs a worker pool".to_string()))?;
        let initial = self.initially_ready()?;

        let order = Mutex::new(Vec::with_capacity(self.network.len()));
        let failure: Mutex<Option<Error>> = Mutex::new(None);

        pool.scope(|scope| {
            for id in initial {
                self.spawn_dispatch(scope, id, &order, &failure);
            }
        });

        let failure = failure
            .into_inner()
            .map_err(|_| Error::ExecutionError("Failure slot lock poisoned".to_string()))?;
        if let Some(error) = failure {
            return Err(error);
        }
        order
            .into_inner()
            .map_err(|_| Error::ExecutionError("Completion order lock poisoned".to_string()))
    }

    fn spawn_dispatch<'s>(
        &'s self,
        scope: &rayon::Scope<'s>,
        id: NodeId,
        order: &'s Mutex<Vec<NodeId>>,
        failure: &'s Mutex<Option<Error>>,
    ) {
        scope.spawn(move |scope| {
            if failure.lock().map(|f| f.is_some()).unwrap_or(true) {
                return;
            }

            let result = self.dispatch(id).and_then(|_| {
                // Completion is recorded before any consumer can start
                order
                    .lock()
                    .map_err(|_| Error::ExecutionError("Completion order lock poisoned".to_string()))?
                    .push(id);
                self.release_consumers(id)
            });

            match result {
                Ok(newly_ready) => {
                    for next in newly_ready {
                        self.spawn_dispatch(scope, next, order, failure);
                    }
                }
                Err(error) => {
                    if let Ok(mut slot) = failure.lock() {
                        slot.get_or_insert(error);
                    }
                }
            }
        });
    }

    /// Run one ready operator through to `Done`
    fn dispatch(&self, id: NodeId) -> Result<()> {
        let op = self.network.operator(id)?;
        let base = op.base();
        base.transition(OpState::Ready, OpState::Running)?;

        let assignment = base.assignment();
        let resources = self.context.resources().lookup(assignment.backend, assignment.instance);
        debug!(
            "Dispatching '{}' ({}) on {} instance {}: {} bytes local memory, {} PEs",
            op.name(),
            op.op_type(),
            assignment.backend,
            assignment.instance,
            resources.mem_size,
            resources.num_pes
        );

        op.run(self.context)?;
        base.transition(OpState::Running, OpState::Done)?;
        op.propagate_dead()
    }

    /// Notify the consumers of a finished operator and return those that
    /// became ready
    fn release_consumers(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let op = self.network.operator(id)?;
        let mut newly_ready = Vec::new();
        for &consumer in self.network.consumers(id) {
            let next = self.network.operator(consumer)?;
            let remaining = next.base().decr_num_pending_inputs()?;
            trace!("'{}' -> '{}': {} input(s) pending", op.name(), next.name(), remaining);
            if remaining == 0 {
                next.base().transition(OpState::Pending, OpState::Ready)?;
                newly_ready.push(consumer);
            }
        }
        Ok(newly_ready)
    }

    fn summarize(&self, order: Vec<NodeId>) -> RunSummary {
        let mut outputs = Vec::new();
        for id in self.network.sink_operators() {
            if let Ok(op) = self.network.operator(id) {
                outputs.extend(op.base().outputs().iter().flatten().cloned());
            }
        }
        let tiles = self
            .network
            .operators()
            .map(|op| (op.name().to_string(), op.base().tile_report()))
            .collect();

        info!("Network '{}' finished, {} sink output(s)", self.network.name(), outputs.len());
        RunSummary { order, outputs, tiles }
    }
}

/// Compile if needed and run a network once
pub fn run_network(network: &mut Network, context: &ExecutionContext) -> Result<RunSummary> {
    if !network.is_compiled() {
        network.compile()?;
    }
    Scheduler::new(network, context).run()
}
