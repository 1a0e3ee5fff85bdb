//! Operator contract
//!
//! Operators are opaque to the executor: it only needs to run them on a
//! workspace, ask them for batch sizes and capture/restore their state.
//! Capabilities are declared once and tagged on the graph node at
//! construction time.

use crate::graph::OpSpec;
use crate::workspace::Workspace;

/// Capability tags, computed once when the node is added to the graph
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCapabilities {
    /// Decides the batch size of the iteration it participates in
    pub batch_size_provider: bool,
    /// Joins the branches of a conditional
    pub is_merge: bool,
    /// Splits samples between conditional branches
    pub is_conditional_split: bool,
    /// Writes each output as one contiguous allocation
    pub contiguous_outputs: bool,
}

impl OpCapabilities {
    pub fn batch_size_provider() -> Self {
        Self {
            batch_size_provider: true,
            ..Self::default()
        }
    }

    pub fn merge() -> Self {
        Self {
            is_merge: true,
            ..Self::default()
        }
    }

    pub fn conditional_split() -> Self {
        Self {
            is_conditional_split: true,
            ..Self::default()
        }
    }

    pub fn contiguous() -> Self {
        Self {
            contiguous_outputs: true,
            ..Self::default()
        }
    }
}

/// A unit of work run once per iteration by the stage it belongs to
pub trait Operator: Send {
    /// Called once by `OpGraph::instantiate_operators`
    fn setup(&mut self, _spec: &OpSpec) -> anyhow::Result<()> {
        Ok(())
    }

    fn run(&mut self, ws: &mut Workspace) -> anyhow::Result<()>;

    fn capabilities(&self) -> OpCapabilities {
        OpCapabilities::default()
    }

    /// Batch size of the next iteration. Only consulted for batch-size
    /// providers; `None` means the provider has nothing queued.
    fn next_batch_size(&mut self) -> Option<usize> {
        None
    }

    /// Opaque state blob captured after every run when checkpointing is on
    fn save_state(&self) -> anyhow::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn restore_state(&mut self, _state: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

type RunFn = Box<dyn FnMut(&mut Workspace) -> anyhow::Result<()> + Send>;

/// Stateless operator backed by a closure
pub struct FnOperator {
    run: RunFn,
    capabilities: OpCapabilities,
}

impl FnOperator {
    pub fn new<F>(run: F) -> Self
    where
        F: FnMut(&mut Workspace) -> anyhow::Result<()> + Send + 'static,
    {
        Self {
            run: Box::new(run),
            capabilities: OpCapabilities::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: OpCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

impl Operator for FnOperator {
    fn run(&mut self, ws: &mut Workspace) -> anyhow::Result<()> {
        (self.run)(ws)
    }

    fn capabilities(&self) -> OpCapabilities {
        self.capabilities
    }
}

impl std::fmt::Debug for FnOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnOperator")
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
