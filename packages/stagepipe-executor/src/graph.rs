//! Operator graph
//!
//! Nodes are partitioned into the three execution stages. Within a stage,
//! nodes keep insertion order, which is topological because an operator can
//! only consume tensors that already exist when it is added.

use crate::error::{ExecutorError, Result};
use crate::operator::{OpCapabilities, Operator};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

pub type OpNodeId = usize;
pub type TensorNodeId = usize;

/// Execution stage of an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpType {
    Cpu,
    Mixed,
    Gpu,
}

impl OpType {
    pub const ALL: [OpType; 3] = [OpType::Cpu, OpType::Mixed, OpType::Gpu];

    pub fn index(&self) -> usize {
        match self {
            OpType::Cpu => 0,
            OpType::Mixed => 1,
            OpType::Gpu => 2,
        }
    }

    /// Stage that consumes this stage's released iterations
    pub fn next(&self) -> Option<OpType> {
        match self {
            OpType::Cpu => Some(OpType::Mixed),
            OpType::Mixed => Some(OpType::Gpu),
            OpType::Gpu => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Cpu => "CPU",
            OpType::Mixed => "MIXED",
            OpType::Gpu => "GPU",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(OpType::Cpu),
            "mixed" => Ok(OpType::Mixed),
            "gpu" => Ok(OpType::Gpu),
            _ => Err(ExecutorError::construction(format!(
                "Invalid op type: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for OpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a tensor's bytes live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageDevice {
    Cpu,
    Gpu,
}

/// Declarative description of one operator instance
#[derive(Debug, Clone, Default)]
pub struct OpSpec {
    schema_name: String,
    regular_inputs: Vec<String>,
    argument_inputs: Vec<String>,
    outputs: Vec<(String, StorageDevice)>,
    bytes_per_sample_hints: Vec<usize>,
}

impl OpSpec {
    pub fn new(schema_name: impl Into<String>) -> Self {
        Self {
            schema_name: schema_name.into(),
            ..Self::default()
        }
    }

    pub fn input(mut self, name: impl Into<String>) -> Self {
        self.regular_inputs.push(name.into());
        self
    }

    /// Inputs that parametrize the operator rather than carry data
    pub fn argument_input(mut self, name: impl Into<String>) -> Self {
        self.argument_inputs.push(name.into());
        self
    }

    pub fn output(mut self, name: impl Into<String>, device: StorageDevice) -> Self {
        self.outputs.push((name.into(), device));
        self
    }

    /// One hint per output, or a single hint shared by all outputs.
    /// A zero hint falls back to the executor default.
    pub fn bytes_per_sample_hint(mut self, hints: Vec<usize>) -> Self {
        self.bytes_per_sample_hints = hints;
        self
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn num_regular_input(&self) -> usize {
        self.regular_inputs.len()
    }

    pub fn num_input(&self) -> usize {
        self.regular_inputs.len() + self.argument_inputs.len()
    }

    pub fn num_output(&self) -> usize {
        self.outputs.len()
    }

    /// Regular inputs first, then argument inputs
    pub fn input_names(&self) -> impl Iterator<Item = &str> {
        self.regular_inputs
            .iter()
            .chain(self.argument_inputs.iter())
            .map(String::as_str)
    }

    pub fn output_name(&self, idx: usize) -> Option<&str> {
        self.outputs.get(idx).map(|(name, _)| name.as_str())
    }

    pub fn output_device(&self, idx: usize) -> Option<StorageDevice> {
        self.outputs.get(idx).map(|(_, device)| *device)
    }

    pub fn memory_hints(&self, default_hint: usize) -> Vec<usize> {
        let hints = &self.bytes_per_sample_hints;
        (0..self.outputs.len())
            .map(|i| {
                let hint = match hints.len() {
                    0 => 0,
                    1 => hints[0],
                    _ => hints.get(i).copied().unwrap_or(0),
                };
                if hint == 0 {
                    default_hint
                } else {
                    hint
                }
            })
            .collect()
    }
}

/// Operator node with its tensor edges
pub struct OpNode {
    pub id: OpNodeId,
    pub instance_name: String,
    pub op_type: OpType,
    pub spec: OpSpec,
    pub parent_tensors: Vec<TensorNodeId>,
    pub children_tensors: Vec<TensorNodeId>,
    pub capabilities: OpCapabilities,
    op: Mutex<Box<dyn Operator>>,
}

impl OpNode {
    pub fn operator(&self) -> MutexGuard<'_, Box<dyn Operator>> {
        self.op.lock()
    }
}

impl std::fmt::Debug for OpNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpNode")
            .field("id", &self.id)
            .field("instance_name", &self.instance_name)
            .field("op_type", &self.op_type)
            .field("parent_tensors", &self.parent_tensors)
            .field("children_tensors", &self.children_tensors)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Producer of a tensor: node, stage, storage and output index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Producer {
    pub node: OpNodeId,
    pub op_type: OpType,
    pub storage_device: StorageDevice,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub struct TensorNode {
    pub id: TensorNodeId,
    pub name: String,
    pub producer: Producer,
    pub consumers: Vec<OpNodeId>,
}

/// Immutable operator graph, shared by the executor and its workspaces
pub struct OpGraph {
    nodes: Vec<OpNode>,
    tensors: Vec<TensorNode>,
    partitions: [Vec<OpNodeId>; 3],
    node_by_name: HashMap<String, OpNodeId>,
    tensor_by_name: HashMap<String, TensorNodeId>,
    instantiated: AtomicBool,
}

impl OpGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    /// Number of operators, optionally restricted to one stage
    pub fn num_op(&self, op_type: Option<OpType>) -> usize {
        match op_type {
            Some(t) => self.partitions[t.index()].len(),
            None => self.nodes.len(),
        }
    }

    /// `idx`-th operator of a stage, in topological order
    pub fn node(&self, op_type: OpType, idx: usize) -> Option<&OpNode> {
        self.partitions[op_type.index()]
            .get(idx)
            .map(|&id| &self.nodes[id])
    }

    pub fn node_by_id(&self, id: OpNodeId) -> Option<&OpNode> {
        self.nodes.get(id)
    }

    pub fn node_by_name(&self, name: &str) -> Option<&OpNode> {
        self.node_by_name.get(name).map(|&id| &self.nodes[id])
    }

    pub fn nodes(&self) -> impl Iterator<Item = &OpNode> {
        self.nodes.iter()
    }

    pub fn stage_nodes(&self, op_type: OpType) -> impl Iterator<Item = &OpNode> {
        self.partitions[op_type.index()]
            .iter()
            .map(move |&id| &self.nodes[id])
    }

    pub fn num_tensor(&self) -> usize {
        self.tensors.len()
    }

    pub fn tensor(&self, id: TensorNodeId) -> Option<&TensorNode> {
        self.tensors.get(id)
    }

    pub fn tensor_by_name(&self, name: &str) -> Option<&TensorNode> {
        self.tensor_by_name.get(name).map(|&id| &self.tensors[id])
    }

    pub fn tensors(&self) -> impl Iterator<Item = &TensorNode> {
        self.tensors.iter()
    }

    /// Resolve pipeline output names to tensor ids
    pub fn get_outputs(&self, names: &[String]) -> Result<Vec<TensorNodeId>> {
        names
            .iter()
            .map(|name| {
                self.tensor_by_name.get(name).copied().ok_or_else(|| {
                    ExecutorError::construction(format!(
                        "Pipeline output `{}` is not produced by any operator",
                        name
                    ))
                })
            })
            .collect()
    }

    pub fn has_conditionals(&self) -> bool {
        self.nodes
            .iter()
            .any(|n| n.capabilities.is_merge || n.capabilities.is_conditional_split)
    }

    /// Call `setup` on every operator. Runs at most once per graph.
    pub fn instantiate_operators(&self) -> Result<()> {
        if self.instantiated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for node in &self.nodes {
            node.operator().setup(&node.spec).map_err(|e| {
                ExecutorError::construction(format!(
                    "Failed to set up operator `{}`: {:#}",
                    node.instance_name, e
                ))
            })?;
        }
        debug!(num_ops = self.nodes.len(), "Operators instantiated");
        Ok(())
    }
}

impl std::fmt::Debug for OpGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpGraph")
            .field("nodes", &self.nodes)
            .field("tensors", &self.tensors)
            .finish()
    }
}

/// Validating graph builder
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<OpNode>,
    tensors: Vec<TensorNode>,
    partitions: [Vec<OpNodeId>; 3],
    node_by_name: HashMap<String, OpNodeId>,
    tensor_by_name: HashMap<String, TensorNodeId>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an operator instance. Its inputs must already be produced by
    /// previously added operators.
    pub fn add_op(
        &mut self,
        instance_name: impl Into<String>,
        op_type: OpType,
        spec: OpSpec,
        op: Box<dyn Operator>,
    ) -> Result<OpNodeId> {
        let instance_name = instance_name.into();
        if self.node_by_name.contains_key(&instance_name) {
            return Err(ExecutorError::construction(format!(
                "Duplicate operator instance name `{}`",
                instance_name
            )));
        }
        if spec.num_output() == 0 && op_type != OpType::Cpu {
            return Err(ExecutorError::construction(format!(
                "{} operator `{}` has no outputs",
                op_type, instance_name
            )));
        }

        let id = self.nodes.len();
        let mut parent_tensors = Vec::with_capacity(spec.num_input());
        for name in spec.input_names() {
            let tid = *self.tensor_by_name.get(name).ok_or_else(|| {
                ExecutorError::construction(format!(
                    "Operator `{}` consumes unknown tensor `{}`",
                    instance_name, name
                ))
            })?;
            check_edge(&instance_name, op_type, &self.tensors[tid])?;
            parent_tensors.push(tid);
        }

        for (i, (name, device)) in spec.outputs.iter().enumerate() {
            let repeated = spec.outputs[..i].iter().any(|(other, _)| other == name);
            if repeated || self.tensor_by_name.contains_key(name) {
                return Err(ExecutorError::construction(format!(
                    "Tensor `{}` is produced twice (second producer `{}`)",
                    name, instance_name
                )));
            }
            if op_type == OpType::Cpu && *device != StorageDevice::Cpu {
                return Err(ExecutorError::construction(format!(
                    "CPU operator `{}` cannot produce device tensor `{}`",
                    instance_name, name
                )));
            }
        }

        let mut children_tensors = Vec::with_capacity(spec.num_output());
        for (index, (name, device)) in spec.outputs.iter().enumerate() {
            let tid = self.tensors.len();
            self.tensors.push(TensorNode {
                id: tid,
                name: name.clone(),
                producer: Producer {
                    node: id,
                    op_type,
                    storage_device: *device,
                    index,
                },
                consumers: Vec::new(),
            });
            self.tensor_by_name.insert(name.clone(), tid);
            children_tensors.push(tid);
        }

        for &tid in &parent_tensors {
            self.tensors[tid].consumers.push(id);
        }

        let capabilities = op.capabilities();
        self.nodes.push(OpNode {
            id,
            instance_name: instance_name.clone(),
            op_type,
            spec,
            parent_tensors,
            children_tensors,
            capabilities,
            op: Mutex::new(op),
        });
        self.partitions[op_type.index()].push(id);
        self.node_by_name.insert(instance_name, id);
        Ok(id)
    }

    pub fn build(self) -> Result<OpGraph> {
        if self.nodes.is_empty() {
            return Err(ExecutorError::construction("Graph has no operators"));
        }
        Ok(OpGraph {
            nodes: self.nodes,
            tensors: self.tensors,
            partitions: self.partitions,
            node_by_name: self.node_by_name,
            tensor_by_name: self.tensor_by_name,
            instantiated: AtomicBool::new(false),
        })
    }
}

/// Stage ordering rules: data only flows CPU -> MIXED -> GPU, and MIXED
/// operators are the only bridge from host to device.
fn check_edge(consumer: &str, op_type: OpType, input: &TensorNode) -> Result<()> {
    let producer = input.producer;
    let allowed = match op_type {
        OpType::Cpu => producer.op_type == OpType::Cpu,
        OpType::Mixed => producer.op_type == OpType::Cpu,
        OpType::Gpu => {
            producer.storage_device == StorageDevice::Gpu || producer.op_type == OpType::Cpu
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(ExecutorError::construction(format!(
            "{} operator `{}` cannot consume tensor `{}` produced by the {} stage",
            op_type, consumer, input.name, producer.op_type
        )))
    }
}
