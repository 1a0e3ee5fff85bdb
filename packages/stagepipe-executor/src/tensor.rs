//! Tensor storage
//!
//! Every graph tensor owns a ring of buffers (`TensorStoreQueue`), one per
//! queue slot of its producing stage. Buffers are shared with workspaces
//! through `Arc<RwLock<..>>` handles: the producing stage writes, downstream
//! stages only read until the slot is released.

use crate::graph::{OpGraph, OpType, StorageDevice, TensorNodeId};
use crate::queue_policy::StageQueues;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub type TensorHandle = Arc<RwLock<TensorList>>;

/// Batch of samples, each one an opaque byte buffer
#[derive(Debug, Clone)]
pub struct TensorList {
    device: StorageDevice,
    samples: Vec<Vec<u8>>,
    pinned: bool,
    contiguous: bool,
    contiguous_capacity: usize,
    chunk_capacity: Vec<usize>,
}

impl TensorList {
    pub fn new(device: StorageDevice) -> Self {
        Self {
            device,
            samples: Vec::new(),
            pinned: false,
            contiguous: false,
            contiguous_capacity: 0,
            chunk_capacity: Vec::new(),
        }
    }

    pub fn into_handle(self) -> TensorHandle {
        Arc::new(RwLock::new(self))
    }

    pub fn device(&self) -> StorageDevice {
        self.device
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    pub fn set_pinned(&mut self, pinned: bool) {
        self.pinned = pinned;
    }

    pub fn is_contiguous(&self) -> bool {
        self.contiguous
    }

    pub fn set_contiguous(&mut self, contiguous: bool) {
        self.contiguous = contiguous;
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn sample(&self, idx: usize) -> Option<&[u8]> {
        self.samples.get(idx).map(Vec::as_slice)
    }

    pub fn samples(&self) -> &[Vec<u8>] {
        &self.samples
    }

    /// Replace the whole batch
    pub fn set_samples(&mut self, samples: Vec<Vec<u8>>) {
        self.samples = samples;
        self.grow_reservation();
    }

    pub fn push_sample(&mut self, sample: Vec<u8>) {
        self.samples.push(sample);
        self.grow_reservation();
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Bytes in use
    pub fn nbytes(&self) -> usize {
        self.samples.iter().map(Vec::len).sum()
    }

    /// Bytes reserved
    pub fn capacity(&self) -> usize {
        if self.contiguous {
            self.contiguous_capacity
        } else {
            self.chunk_capacity.iter().sum()
        }
    }

    /// Reserve one allocation of `bytes` for the whole batch
    pub fn reserve_contiguous(&mut self, bytes: usize) {
        self.contiguous_capacity = self.contiguous_capacity.max(bytes);
    }

    /// Reserve `bytes_per_sample` for each of `batch_size` samples
    pub fn reserve_chunks(&mut self, bytes_per_sample: usize, batch_size: usize) {
        if self.chunk_capacity.len() < batch_size {
            self.chunk_capacity.resize(batch_size, 0);
        }
        for chunk in self.chunk_capacity.iter_mut().take(batch_size) {
            *chunk = (*chunk).max(bytes_per_sample);
        }
    }

    /// (largest sample size, largest per-sample reservation).
    /// Contiguous storage reports its averages per sample.
    pub fn max_sizes(&self) -> (usize, usize) {
        if self.contiguous {
            let n = self.samples.len();
            if n == 0 {
                return (0, 0);
            }
            (
                self.nbytes().div_ceil(n),
                self.contiguous_capacity.div_ceil(n),
            )
        } else {
            let max_real = self.samples.iter().map(Vec::len).max().unwrap_or(0);
            let max_reserved = self.chunk_capacity.iter().copied().max().unwrap_or(0);
            (max_real, max_reserved)
        }
    }

    fn grow_reservation(&mut self) {
        if self.contiguous {
            let total = self.nbytes();
            self.contiguous_capacity = self.contiguous_capacity.max(total);
        } else {
            if self.chunk_capacity.len() < self.samples.len() {
                self.chunk_capacity.resize(self.samples.len(), 0);
            }
            for (chunk, sample) in self.chunk_capacity.iter_mut().zip(&self.samples) {
                *chunk = (*chunk).max(sample.len());
            }
        }
    }
}

/// Ring of buffers for one tensor, indexed by the producing stage's slot
#[derive(Debug, Clone)]
pub struct TensorStoreQueue {
    tensor: TensorNodeId,
    stage: OpType,
    buffers: Vec<TensorHandle>,
}

impl TensorStoreQueue {
    pub fn new(tensor: TensorNodeId, stage: OpType, device: StorageDevice, depth: usize) -> Self {
        let buffers = (0..depth.max(1))
            .map(|_| TensorList::new(device).into_handle())
            .collect();
        Self {
            tensor,
            stage,
            buffers,
        }
    }

    pub fn tensor(&self) -> TensorNodeId {
        self.tensor
    }

    pub fn stage(&self) -> OpType {
        self.stage
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Buffer for a queue slot. A single-buffer queue serves every slot.
    pub fn slot(&self, queue_idx: usize) -> TensorHandle {
        Arc::clone(&self.buffers[queue_idx % self.buffers.len()])
    }

    pub fn buffers(&self) -> &[TensorHandle] {
        &self.buffers
    }
}

/// Ring size of every tensor: pipeline outputs and tensors read by a later
/// stage get their producer's depth, everything else a single buffer.
pub fn tensor_queue_sizes(
    graph: &OpGraph,
    outputs: &[TensorNodeId],
    depths: StageQueues,
) -> Vec<usize> {
    let outputs: HashSet<TensorNodeId> = outputs.iter().copied().collect();
    graph
        .tensors()
        .map(|tensor| {
            let stage = tensor.producer.op_type;
            let crosses_stage = tensor.consumers.iter().any(|&consumer| {
                graph
                    .node_by_id(consumer)
                    .map(|n| n.op_type != stage)
                    .unwrap_or(false)
            });
            if outputs.contains(&tensor.id) || crosses_stage {
                depths[stage]
            } else {
                1
            }
        })
        .collect()
}

pub fn create_backing_storage(graph: &OpGraph, sizes: &[usize]) -> Vec<TensorStoreQueue> {
    graph
        .tensors()
        .map(|tensor| {
            TensorStoreQueue::new(
                tensor.id,
                tensor.producer.op_type,
                tensor.producer.storage_device,
                sizes[tensor.id],
            )
        })
        .collect()
}

fn set_queue_pinned(queue: &TensorStoreQueue, pinned: bool) {
    for buffer in queue.buffers() {
        buffer.write().set_pinned(pinned);
    }
}

fn is_queue_pinned(queue: &TensorStoreQueue) -> bool {
    queue.buffers().iter().any(|b| b.read().is_pinned())
}

/// Mark host buffers that feed host-to-device copies as pinned.
///
/// Only host tensors produced by the CPU stage are candidates:
/// - MIXED operators with a device output pin them
/// - GPU operators pin them when their first output lives on the device
/// - a CPU merge pins all its outputs if any of its regular inputs is pinned
///
/// CPU-only execution and `restrict_pinned` disable pinning entirely.
pub fn prepin(
    storage: &[TensorStoreQueue],
    graph: &OpGraph,
    cpu_only: bool,
    restrict_pinned: bool,
) {
    if cpu_only || restrict_pinned {
        for queue in storage {
            set_queue_pinned(queue, false);
        }
        return;
    }

    let cpu_stage_host_tensor = |tid: TensorNodeId| {
        graph
            .tensor(tid)
            .map(|t| t.producer.op_type == OpType::Cpu && t.producer.storage_device == StorageDevice::Cpu)
            .unwrap_or(false)
    };

    for op_type in [OpType::Mixed, OpType::Gpu] {
        for node in graph.stage_nodes(op_type) {
            if node.spec.output_device(0) != Some(StorageDevice::Gpu) {
                continue;
            }
            for &tid in &node.parent_tensors {
                if cpu_stage_host_tensor(tid) {
                    set_queue_pinned(&storage[tid], true);
                }
            }
        }
    }

    // merges are visited in topological order, so pinning propagates
    // through chains of them
    for node in graph.stage_nodes(OpType::Cpu) {
        if !node.capabilities.is_merge {
            continue;
        }
        let regular = node.spec.num_regular_input();
        let any_pinned = node
            .parent_tensors
            .iter()
            .take(regular)
            .any(|&tid| is_queue_pinned(&storage[tid]));
        if any_pinned {
            for &tid in &node.children_tensors {
                set_queue_pinned(&storage[tid], true);
            }
        }
    }
}

/// Reserve output memory up front from the per-output byte hints.
///
/// MIXED outputs and outputs of operators declaring contiguous outputs are
/// stored contiguously. Host buffers are only reserved when pinned.
pub fn presize(
    storage: &[TensorStoreQueue],
    graph: &OpGraph,
    default_hint: usize,
    max_batch_size: usize,
) {
    let mut reserved = 0usize;
    for node in graph.nodes() {
        let hints = node.spec.memory_hints(default_hint);
        let contiguous = node.op_type == OpType::Mixed || node.capabilities.contiguous_outputs;
        for (j, &tid) in node.children_tensors.iter().enumerate() {
            let hint = hints.get(j).copied().unwrap_or(default_hint);
            for buffer in storage[tid].buffers() {
                let mut tl = buffer.write();
                if contiguous {
                    tl.set_contiguous(true);
                }
                let should_reserve = hint > 0
                    && match tl.device() {
                        StorageDevice::Cpu => tl.is_pinned(),
                        StorageDevice::Gpu => true,
                    };
                if !should_reserve {
                    continue;
                }
                if tl.is_contiguous() {
                    tl.reserve_contiguous(hint * max_batch_size);
                } else {
                    tl.reserve_chunks(hint, max_batch_size);
                }
                reserved += hint * max_batch_size;
            }
        }
    }
    debug!(bytes = reserved, "Presized tensor storage");
}
