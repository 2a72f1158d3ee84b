//! Per-endpoint processor chains
//!
//! A chain is a fixed-length ordered list of processors, each guarded by
//! an active bit. Workers walk the chain once per burst; the control plane
//! toggles stages without locking and the toggle takes effect at most one
//! burst later.

use std::{
	collections::BTreeMap,
	fmt,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
};

use crate::apis::MbufVec;
use crate::program::ProgramError;

/// Upper bound on processors per chain.
pub const MAX_CHAIN_STAGES: usize = 16;

/// Parameters handed to a processor's `init`.
pub type ProcParams = BTreeMap<String, String>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FlowDir {
	Rx,
	Tx,
}

impl fmt::Display for FlowDir {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			FlowDir::Rx => write!(f, "rx"),
			FlowDir::Tx => write!(f, "tx"),
		}
	}
}

/// Execution context passed to every processor invocation.
pub struct ProcContext {
	pub dir: FlowDir,
	pub endpoint_id: u16,
}

impl ProcContext {
	pub fn new(dir: FlowDir) -> Self {
		Self { dir, endpoint_id: 0 }
	}

	#[inline]
	pub fn set_related_endpoint_id(&mut self, endpoint_id: u16) {
		self.endpoint_id = endpoint_id;
	}
}

/// A pluggable pipeline stage. Processors own their per-instance state,
/// may rewrite packet private metadata (including the destination
/// endpoint) and must not block. `process` returns the number of packets
/// kept; the chain trims the burst tail down to that count.
pub trait FlowProcessor: Send {
	fn init(&mut self, _params: &ProcParams) -> Result<(), ProgramError> {
		Ok(())
	}

	fn process(&mut self, vec: &mut MbufVec, ctx: &ProcContext) -> usize;

	fn name(&self) -> &str;
}

/// Per-stage active bits, shared between the worker that runs the chain
/// and the control plane that toggles stages.
pub struct StageMask {
	bits: [AtomicBool; MAX_CHAIN_STAGES],
}

impl StageMask {
	fn new() -> Self {
		Self {
			bits: std::array::from_fn(|_| AtomicBool::new(true)),
		}
	}

	#[inline]
	pub fn is_active(&self, stage: usize) -> bool {
		self.bits[stage].load(Ordering::Acquire)
	}

	#[inline]
	pub fn set_active(&self, stage: usize, active: bool) {
		self.bits[stage].store(active, Ordering::Release);
	}
}

/// Ordered processor chain for one endpoint and direction.
pub struct ProcChain {
	procs: Vec<Box<dyn FlowProcessor>>,
	mask: Arc<StageMask>,
}

impl ProcChain {
	pub fn new() -> Self {
		Self {
			procs: Vec::new(),
			mask: Arc::new(StageMask::new()),
		}
	}

	pub fn add_proc(&mut self, proc: Box<dyn FlowProcessor>) -> Result<(), ProgramError> {
		if self.procs.len() == MAX_CHAIN_STAGES {
			return Err(ProgramError::TooManyStages(self.procs.len() + 1));
		}
		self.procs.push(proc);
		Ok(())
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.procs.len()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.procs.is_empty()
	}

	/// The shared active bits, for the control surface.
	pub fn mask(&self) -> Arc<StageMask> {
		Arc::clone(&self.mask)
	}

	pub fn chain_names(&self) -> Vec<String> {
		self.procs.iter().map(|p| p.name().to_owned()).collect()
	}

	pub fn stage_index(&self, name: &str) -> Option<usize> {
		self.procs.iter().position(|p| p.name() == name)
	}

	/// Runs the burst through every active stage in order. Stages drop
	/// packets by returning a kept count smaller than the burst; the tail
	/// beyond it is freed.
	pub fn process(&mut self, vec: &mut MbufVec, ctx: &ProcContext) {
		for (stage, proc) in self.procs.iter_mut().enumerate() {
			if vec.is_empty() {
				break;
			}
			if !self.mask.is_active(stage) {
				continue;
			}
			let kept = proc.process(vec, ctx);
			if kept < vec.len() {
				let dropped = vec.len() - kept;
				vec.free_back(dropped);
			}
		}
	}
}

impl Default for ProcChain {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::apis::{Mempool, MempoolConfig};
	use std::sync::Arc;

	struct KeepN {
		keep: usize,
	}

	impl FlowProcessor for KeepN {
		fn process(&mut self, vec: &mut MbufVec, _ctx: &ProcContext) -> usize {
			self.keep.min(vec.len())
		}

		fn name(&self) -> &str {
			"keep-n"
		}
	}

	fn pool() -> Arc<Mempool> {
		Mempool::new(
			"chain-test",
			MempoolConfig {
				capacity: 64,
				cache_size: 0,
				dataroom: 128,
				headroom: 0,
			},
		)
		.unwrap()
	}

	#[test]
	fn short_kept_count_trims_the_tail() {
		let mp = pool();
		let mut vec = MbufVec::new();
		mp.alloc_bulk(&mut vec, 8).unwrap();

		let mut chain = ProcChain::new();
		chain.add_proc(Box::new(KeepN { keep: 5 })).unwrap();
		chain.add_proc(Box::new(KeepN { keep: 2 })).unwrap();

		let ctx = ProcContext::new(FlowDir::Rx);
		chain.process(&mut vec, &ctx);
		assert_eq!(vec.len(), 2);
		assert_eq!(mp.in_use(), 2);
	}

	#[test]
	fn disabled_stages_are_skipped() {
		let mp = pool();
		let mut vec = MbufVec::new();
		mp.alloc_bulk(&mut vec, 8).unwrap();

		let mut chain = ProcChain::new();
		chain.add_proc(Box::new(KeepN { keep: 0 })).unwrap();
		chain.mask().set_active(0, false);

		let ctx = ProcContext::new(FlowDir::Rx);
		chain.process(&mut vec, &ctx);
		assert_eq!(vec.len(), 8);
	}

	#[test]
	fn empty_bursts_short_circuit() {
		let mut chain = ProcChain::new();
		chain.add_proc(Box::new(KeepN { keep: 0 })).unwrap();
		let mut vec = MbufVec::new();
		let ctx = ProcContext::new(FlowDir::Tx);
		chain.process(&mut vec, &ctx);
		assert_eq!(vec.len(), 0);
	}

	#[test]
	fn chain_rejects_excess_stages() {
		let mut chain = ProcChain::new();
		for _ in 0..MAX_CHAIN_STAGES {
			chain.add_proc(Box::new(KeepN { keep: 0 })).unwrap();
		}
		assert!(chain.add_proc(Box::new(KeepN { keep: 0 })).is_err());
	}
}
