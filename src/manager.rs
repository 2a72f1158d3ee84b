//! The flow manager owns a loaded program and drives it through the
//! Idle -> Loaded -> Running lifecycle
//!
//! At load the program's endpoints and chains are adopted into a shared
//! runtime. At start the executor binds workers to cores and the worker
//! loops take over the hot path; the manager thread only touches atomics
//! (stage bits, the run flag, counters) from then on. Stop clears the run
//! flag, joins the workers and stops the ports.

use std::{
	cell::UnsafeCell,
	sync::{
		atomic::{AtomicBool, AtomicUsize, Ordering},
		Arc, Mutex,
	},
};

use thiserror::Error;

use crate::apis::{MbufVec, MbufVecView, Mempool, RingError};
use crate::distributor::FlowDistributor;
use crate::endpoint::{Endpoint, LoopbackHandle};
use crate::executor::{
	assign_cores, register_worker_thread, CoreInfo, ExecutorError, FlowExecutor, WorkerFn,
};
use crate::flowtable::FlowTable;
use crate::pipeline::{FlowDir, ProcChain, ProcContext, StageMask};
use crate::program::LoadedProgram;
use crate::telemetry::{FlowMetrics, MetricEntry, MetricUnit};
use crate::MAX_WORKERS;

#[derive(Error, Debug)]
pub enum ManagerError {
	#[error("no program loaded")]
	NoProgram,
	#[error("flow program already active")]
	AlreadyActive,
	#[error("cannot replace an active flow program")]
	ReplaceActive,
	#[error("port {} failed to start", _0)]
	PortStartFailed(String),
	#[error("no such endpoint or stage: {}", _0)]
	UnknownStage(String),
	#[error("assignment needs {} workers but only {} slots exist", _0, MAX_WORKERS)]
	TooManyWorkers(usize),
	#[error(transparent)]
	Executor(#[from] ExecutorError),
	#[error(transparent)]
	Ring(#[from] RingError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeState {
	Idle,
	Loaded,
	Running,
}

#[derive(Clone, Copy, Debug)]
pub struct ManagerOptions {
	/// Capacity of each distributor ring.
	pub ring_capacity: usize,
}

impl Default for ManagerOptions {
	fn default() -> Self {
		Self { ring_capacity: 1024 }
	}
}

/// Interior-mutable slot for state that exactly one worker thread touches
/// while the program runs. The state machine guarantees exclusivity: the
/// executor hands every endpoint (and every port's transmit side) to a
/// single worker, and the control plane only reaches in while no workers
/// exist.
struct WorkerCell<T>(UnsafeCell<T>);

unsafe impl<T: Send> Sync for WorkerCell<T> {}

impl<T> WorkerCell<T> {
	fn new(value: T) -> Self {
		Self(UnsafeCell::new(value))
	}

	#[allow(clippy::mut_from_ref)]
	unsafe fn borrow_mut(&self) -> &mut T {
		&mut *self.0.get()
	}
}

struct EndpointRuntime {
	endpoint: Endpoint,
	rx_chain: WorkerCell<ProcChain>,
	tx_chain: WorkerCell<ProcChain>,
	rx_stage_names: Vec<String>,
	tx_stage_names: Vec<String>,
	rx_mask: Arc<StageMask>,
	tx_mask: Arc<StageMask>,
}

struct SharedRuntime {
	name: String,
	endpoints: Vec<EndpointRuntime>,
	distributor: FlowDistributor,
	mempool: Arc<Mempool>,
	flowtable: Arc<FlowTable>,
	metrics: Arc<FlowMetrics>,
	num_distributors: AtomicUsize,
}

impl SharedRuntime {
	/// One endpoint-worker pass: pull a burst per endpoint, run its RX
	/// chain, hand the survivors to the distributor fabric.
	fn endpoint_iteration(&self, worker: usize, ids: &[usize], ctx: &mut ProcContext, vec: &mut MbufVec) {
		for &ep_id in ids {
			let ep = &self.endpoints[ep_id];
			ctx.set_related_endpoint_id(ep_id as u16);

			let received = ep.endpoint.rx_burst(vec) as u64;
			if received > 0 {
				let bytes: u64 = MbufVecView::new(vec).iter().map(|m| m.data_len() as u64).sum();
				self.metrics.rx_packets.add(worker, received);
				self.metrics.rx_bytes.add(worker, bytes);
			}

			let before = vec.len();
			// This worker is the only one processing this endpoint.
			unsafe { ep.rx_chain.borrow_mut() }.process(vec, ctx);
			let dropped = (before - vec.len()) as u64;
			if dropped > 0 {
				self.metrics.rx_dropped.add(worker, dropped);
			}

			self.distributor.push_packets(ep_id as u16, 0, vec, &self.mempool);
		}
		self.flowtable.checkpoint(worker);
	}

	/// One distributor pass over this worker's share of the ports: drain
	/// each destination ring, run the TX chain, transmit, free refusals.
	fn distributor_iteration(&self, worker: usize, dist_ids: &[usize], ctx: &mut ProcContext, vec: &mut MbufVec) {
		let stride = self.num_distributors.load(Ordering::Relaxed).max(1);
		for &dist_id in dist_ids {
			let mut port = dist_id;
			while port < self.endpoints.len() {
				let pulled = self.distributor.pull_packets(port as u16, 0, vec) as u64;
				self.metrics.total_packets.add(worker, pulled);
				self.metrics.total_executions.inc();
				self.metrics.num_flow_entries.set(self.flowtable.num_flows() as u64);

				if !vec.is_empty() {
					ctx.set_related_endpoint_id(port as u16);
					let ep = &self.endpoints[port];
					// Ports are partitioned over distributors, so this
					// worker owns the transmit side of this port.
					unsafe { ep.tx_chain.borrow_mut() }.process(vec, ctx);

					let offered_bytes: u64 =
						MbufVecView::new(vec).iter().map(|m| m.data_len() as u64).sum();
					let sent = ep.endpoint.tx_burst(vec) as u64;
					let refused_bytes: u64 =
						MbufVecView::new(vec).iter().map(|m| m.data_len() as u64).sum();
					self.metrics.tx_packets.add(worker, sent);
					self.metrics.tx_bytes.add(worker, offered_bytes - refused_bytes);

					// Whatever the port refused is dropped here.
					vec.free();
				}
				port += stride;
			}
		}
		self.flowtable.checkpoint(worker);
	}

	fn endpoint_worker(&self, worker: usize, ids: &[usize], run_flag: &AtomicBool) {
		self.flowtable.set_core_active(worker);
		let mut ctx = ProcContext::new(FlowDir::Rx);
		let mut vec = MbufVec::new();
		while run_flag.load(Ordering::SeqCst) {
			self.endpoint_iteration(worker, ids, &mut ctx, &mut vec);
		}
		self.flowtable.set_core_inactive(worker);
	}

	fn distributor_worker(&self, worker: usize, dist_ids: &[usize], run_flag: &AtomicBool) {
		self.flowtable.set_core_active(worker);
		let mut ctx = ProcContext::new(FlowDir::Tx);
		let mut vec = MbufVec::new();
		while run_flag.load(Ordering::SeqCst) {
			self.distributor_iteration(worker, dist_ids, &mut ctx, &mut vec);
		}
		self.flowtable.set_core_inactive(worker);
	}
}

struct ManagerState {
	shared: Option<Arc<SharedRuntime>>,
	executor: Option<FlowExecutor>,
}

pub struct FlowManager {
	mempool: Arc<Mempool>,
	flowtable: Arc<FlowTable>,
	metrics: Arc<FlowMetrics>,
	options: ManagerOptions,
	state: Mutex<ManagerState>,
}

impl FlowManager {
	pub fn new(mempool: Arc<Mempool>, flowtable: Arc<FlowTable>, options: ManagerOptions) -> Self {
		Self {
			mempool,
			flowtable,
			metrics: Arc::new(FlowMetrics::new()),
			options,
			state: Mutex::new(ManagerState {
				shared: None,
				executor: None,
			}),
		}
	}

	pub fn state(&self) -> RuntimeState {
		let state = self.state.lock().unwrap();
		if state.executor.is_some() {
			RuntimeState::Running
		} else if state.shared.is_some() {
			RuntimeState::Loaded
		} else {
			RuntimeState::Idle
		}
	}

	/// Adopts an assembled program. Refused while a program is running.
	pub fn load(&self, program: LoadedProgram) -> Result<(), ManagerError> {
		let mut state = self.state.lock().unwrap();
		if state.executor.is_some() {
			return Err(ManagerError::ReplaceActive);
		}

		let num_endpoints = program.endpoints.len();
		// Ports are partitioned over distributor workers, so each fabric
		// ring has exactly one consumer. With a single endpoint there is
		// also only one producing worker.
		let single_producer = num_endpoints <= 1;
		let mut distributor = FlowDistributor::new(
			num_endpoints.max(1),
			1,
			self.options.ring_capacity,
			single_producer,
			true,
		)?;
		distributor.set_num_active_ports(num_endpoints);

		let mut endpoints = Vec::with_capacity(num_endpoints);
		for assembled in program.endpoints {
			let rx_stage_names = assembled.rx_chain.chain_names();
			let tx_stage_names = assembled.tx_chain.chain_names();
			let rx_mask = assembled.rx_chain.mask();
			let tx_mask = assembled.tx_chain.mask();

			log::info!(
				"loaded rx chain for endpoint {}: [{}]",
				assembled.endpoint.name(),
				rx_stage_names.join(", ")
			);
			log::info!(
				"loaded tx chain for endpoint {}: [{}]",
				assembled.endpoint.name(),
				tx_stage_names.join(", ")
			);

			endpoints.push(EndpointRuntime {
				endpoint: assembled.endpoint,
				rx_chain: WorkerCell::new(assembled.rx_chain),
				tx_chain: WorkerCell::new(assembled.tx_chain),
				rx_stage_names,
				tx_stage_names,
				rx_mask,
				tx_mask,
			});
		}

		state.shared = Some(Arc::new(SharedRuntime {
			name: program.name,
			endpoints,
			distributor,
			mempool: Arc::clone(&self.mempool),
			flowtable: Arc::clone(&self.flowtable),
			metrics: Arc::clone(&self.metrics),
			num_distributors: AtomicUsize::new(1),
		}));
		Ok(())
	}

	/// Starts the ports and launches the workers.
	pub fn start(&self, available_cores: &[CoreInfo], num_distributors: usize) -> Result<(), ManagerError> {
		let mut state = self.state.lock().unwrap();
		if state.executor.is_some() {
			return Err(ManagerError::AlreadyActive);
		}
		let shared = state.shared.as_ref().ok_or(ManagerError::NoProgram)?;

		let endpoint_sockets: Vec<i32> =
			shared.endpoints.iter().map(|e| e.endpoint.socket_id()).collect();
		let assignment = assign_cores(&endpoint_sockets, num_distributors, available_cores)?;
		let num_workers = assignment.num_workers();
		if num_workers > MAX_WORKERS {
			return Err(ManagerError::TooManyWorkers(num_workers));
		}

		let mut started = 0usize;
		for runtime in &shared.endpoints {
			if let Err(err) = runtime.endpoint.start() {
				log::error!("endpoint {}: {}", runtime.endpoint.name(), err);
				for stop_me in &shared.endpoints[..started] {
					stop_me.endpoint.stop();
				}
				return Err(ManagerError::PortStartFailed(runtime.endpoint.name().to_owned()));
			}
			started += 1;
		}

		shared.num_distributors.store(num_distributors, Ordering::Relaxed);

		let endpoint_cb: WorkerFn = {
			let shared = Arc::clone(shared);
			Arc::new(move |worker, ids, run_flag| shared.endpoint_worker(worker, ids, run_flag))
		};
		let distributor_cb: WorkerFn = {
			let shared = Arc::clone(shared);
			Arc::new(move |worker, ids, run_flag| shared.distributor_worker(worker, ids, run_flag))
		};

		log::info!("starting flow program {} with {} workers", shared.name, num_workers);
		state.executor = Some(FlowExecutor::start(&assignment, endpoint_cb, distributor_cb));
		Ok(())
	}

	/// True while workers are running and none has cleared the run flag
	/// (a worker panic clears it before the manager observes it).
	pub fn is_active(&self) -> bool {
		let state = self.state.lock().unwrap();
		state.executor.as_ref().map(|e| e.is_running()).unwrap_or(false)
	}

	/// Clears the run flag, joins the workers and stops the ports.
	/// Idempotent; a no-op when nothing runs.
	pub fn stop(&self) {
		let mut state = self.state.lock().unwrap();
		if let Some(mut executor) = state.executor.take() {
			executor.stop();
		}
		if let Some(shared) = state.shared.as_ref() {
			for runtime in &shared.endpoints {
				runtime.endpoint.stop();
			}
		}
	}

	/// Toggles one pipeline stage. Takes effect on the worker at most one
	/// burst later.
	pub fn set_stage_active(
		&self,
		endpoint: &str,
		dir: FlowDir,
		stage: &str,
		active: bool,
	) -> Result<(), ManagerError> {
		let state = self.state.lock().unwrap();
		let shared = state.shared.as_ref().ok_or(ManagerError::NoProgram)?;
		let runtime = shared
			.endpoints
			.iter()
			.find(|e| e.endpoint.name() == endpoint)
			.ok_or_else(|| ManagerError::UnknownStage(endpoint.to_owned()))?;
		let (names, mask) = match dir {
			FlowDir::Rx => (&runtime.rx_stage_names, &runtime.rx_mask),
			FlowDir::Tx => (&runtime.tx_stage_names, &runtime.tx_mask),
		};
		match names.iter().position(|n| n == stage) {
			Some(idx) => {
				mask.set_active(idx, active);
				Ok(())
			}
			None => Err(ManagerError::UnknownStage(stage.to_owned())),
		}
	}

	/// The outside end of a loopback endpoint, for injectors and tests.
	pub fn loopback_handle(&self, endpoint: &str) -> Option<LoopbackHandle> {
		let state = self.state.lock().unwrap();
		let shared = state.shared.as_ref()?;
		shared
			.endpoints
			.iter()
			.find(|e| e.endpoint.name() == endpoint)
			.and_then(|e| e.endpoint.loopback_handle())
	}

	/// Runs one endpoint-worker pass over the given endpoints on the
	/// calling thread. Only available while the program is loaded but not
	/// running; embedders that schedule workers themselves (and the test
	/// suite) use this to single-step the dataplane.
	pub fn drive_endpoints(&self, ids: &[usize]) -> Result<(), ManagerError> {
		let state = self.state.lock().unwrap();
		if state.executor.is_some() {
			return Err(ManagerError::AlreadyActive);
		}
		let shared = state.shared.as_ref().ok_or(ManagerError::NoProgram)?;
		register_worker_thread(0);
		shared.flowtable.set_core_active(0);
		let mut ctx = ProcContext::new(FlowDir::Rx);
		let mut vec = MbufVec::new();
		shared.endpoint_iteration(0, ids, &mut ctx, &mut vec);
		Ok(())
	}

	/// Runs one distributor pass over every port on the calling thread.
	/// Counterpart of `drive_endpoints`.
	pub fn drive_distributor(&self) -> Result<(), ManagerError> {
		let state = self.state.lock().unwrap();
		if state.executor.is_some() {
			return Err(ManagerError::AlreadyActive);
		}
		let shared = state.shared.as_ref().ok_or(ManagerError::NoProgram)?;
		register_worker_thread(0);
		shared.flowtable.set_core_active(0);
		shared.num_distributors.store(1, Ordering::Relaxed);
		let mut ctx = ProcContext::new(FlowDir::Tx);
		let mut vec = MbufVec::new();
		shared.distributor_iteration(0, &[0], &mut ctx, &mut vec);
		Ok(())
	}

	/// Counter snapshot entries: the standing metrics plus the pool, flow
	/// table and fabric drop counters.
	pub fn telemetry_entries(&self) -> Vec<MetricEntry> {
		self.metrics.num_flow_entries.set(self.flowtable.num_flows() as u64);
		let mut entries = self.metrics.entries();
		entries.push(MetricEntry {
			label: "pool_in_use".into(),
			value: self.mempool.in_use() as u64,
			unit: MetricUnit::None,
		});
		entries.push(MetricEntry {
			label: "pool_alloc_failures".into(),
			value: self.mempool.alloc_failures(),
			unit: MetricUnit::None,
		});
		entries.push(MetricEntry {
			label: "classify_failures".into(),
			value: self.flowtable.classify_failures(),
			unit: MetricUnit::Packets,
		});
		let state = self.state.lock().unwrap();
		if let Some(shared) = state.shared.as_ref() {
			entries.push(MetricEntry {
				label: "ring_full_drops".into(),
				value: shared.distributor.ring_full_drops(),
				unit: MetricUnit::Packets,
			});
			entries.push(MetricEntry {
				label: "broadcast_clone_failures".into(),
				value: shared.distributor.clone_failures(),
				unit: MetricUnit::Packets,
			});
			entries.push(MetricEntry {
				label: "sentinel_drops".into(),
				value: shared.distributor.sentinel_drops(),
				unit: MetricUnit::Packets,
			});
		}
		entries
	}

	pub fn metrics(&self) -> Arc<FlowMetrics> {
		Arc::clone(&self.metrics)
	}
}

impl Drop for FlowManager {
	fn drop(&mut self) {
		self.stop();
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::apis::MempoolConfig;
	use crate::processors::ProcessorRegistry;
	use crate::program::{FlowProgramSpec, LoadedProgram, NoEthDevs};

	fn manager() -> FlowManager {
		let mempool = Mempool::new(
			"manager-test",
			MempoolConfig {
				capacity: 256,
				cache_size: 0,
				dataroom: 2048,
				headroom: 0,
			},
		)
		.unwrap();
		let flowtable = Arc::new(FlowTable::new(64));
		FlowManager::new(mempool, flowtable, ManagerOptions { ring_capacity: 64 })
	}

	fn load_two_loopbacks(mgr: &FlowManager) {
		let spec = FlowProgramSpec::from_toml_str(
			r#"
			name = "lifecycle"
			[[endpoint]]
			name = "a"
			kind = { type = "loopback", capacity = 64 }
			[[endpoint]]
			name = "b"
			kind = { type = "loopback", capacity = 64 }
		"#,
		)
		.unwrap();
		let registry = ProcessorRegistry::with_builtins();
		let program =
			LoadedProgram::assemble(&spec, &registry, &mut NoEthDevs, &mgr.mempool, &mgr.flowtable).unwrap();
		mgr.load(program).unwrap();
	}

	#[test]
	fn lifecycle_transitions() {
		let mgr = manager();
		assert_eq!(mgr.state(), RuntimeState::Idle);
		assert!(matches!(mgr.start(&[], 1), Err(ManagerError::NoProgram)));

		load_two_loopbacks(&mgr);
		assert_eq!(mgr.state(), RuntimeState::Loaded);

		let cores = vec![
			CoreInfo::new(0, 0),
			CoreInfo::new(0, 0),
			CoreInfo::new(0, 0),
		];
		mgr.start(&cores, 1).unwrap();
		assert_eq!(mgr.state(), RuntimeState::Running);
		assert!(matches!(mgr.start(&cores, 1), Err(ManagerError::AlreadyActive)));

		mgr.stop();
		assert_eq!(mgr.state(), RuntimeState::Loaded);
		// Stop is idempotent.
		mgr.stop();
	}

	#[test]
	fn start_needs_enough_cores() {
		let mgr = manager();
		load_two_loopbacks(&mgr);
		let cores = vec![CoreInfo::new(0, 0)];
		assert!(matches!(
			mgr.start(&cores, 1),
			Err(ManagerError::Executor(ExecutorError::InsufficientCores { .. }))
		));
	}

	#[test]
	fn load_refused_while_running() {
		let mgr = manager();
		load_two_loopbacks(&mgr);
		let cores = vec![CoreInfo::new(0, 0); 3];
		mgr.start(&cores, 1).unwrap();

		let spec = FlowProgramSpec::from_toml_str(
			r#"
			name = "other"
			[[endpoint]]
			name = "c"
			kind = { type = "loopback" }
		"#,
		)
		.unwrap();
		let registry = ProcessorRegistry::with_builtins();
		let program =
			LoadedProgram::assemble(&spec, &registry, &mut NoEthDevs, &mgr.mempool, &mgr.flowtable).unwrap();
		assert!(matches!(mgr.load(program), Err(ManagerError::ReplaceActive)));
		mgr.stop();
	}
}
