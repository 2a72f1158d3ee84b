//! The executor assigns workers to CPU cores and drives them
//!
//! One OS thread is spawned per assigned core, pinned to it, and handed
//! the worker callback together with the ids of the components it serves.
//! Endpoint workers prefer cores on the endpoint's NUMA socket. A panic
//! inside a callback is caught at the worker boundary: it is logged, the
//! shared run flag is cleared and every worker drains out.

use std::{
	cell::Cell,
	panic::{self, AssertUnwindSafe},
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread::JoinHandle,
};

use thiserror::Error;

thread_local! {
	static WORKER_SLOT: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Binds the calling thread to a worker slot. Slots index per-worker
/// state (pool caches, flow table epochs, per-core metrics) and must be
/// unique among live workers.
pub fn register_worker_thread(slot: usize) {
	WORKER_SLOT.with(|s| s.set(slot));
}

/// The calling thread's worker slot, if it registered one.
#[inline]
pub fn current_worker_slot() -> Option<usize> {
	let slot = WORKER_SLOT.with(|s| s.get());
	if slot == usize::MAX {
		None
	} else {
		Some(slot)
	}
}

#[derive(Error, Debug)]
pub enum ExecutorError {
	#[error("insufficient number of cores: need {needed} but only {available} are available")]
	InsufficientCores { needed: usize, available: usize },
}

/// A CPU core paired with the NUMA socket it belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CoreInfo {
	pub core_id: u32,
	pub socket_id: i32,
}

impl CoreInfo {
	pub fn new(core_id: u32, socket_id: i32) -> Self {
		Self { core_id, socket_id }
	}
}

/// The online CPUs, reported as socket 0. Embedders with NUMA topology
/// knowledge should build the list themselves.
pub fn available_cores() -> Vec<CoreInfo> {
	let count = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
	(0..count as u32).map(|core| CoreInfo::new(core, 0)).collect()
}

/// Cores chosen for the workers: one entry per endpoint and one per
/// distributor. Entries may repeat when components share a core.
#[derive(Debug)]
pub struct CoreAssignment {
	pub endpoint_cores: Vec<CoreInfo>,
	pub distributor_cores: Vec<CoreInfo>,
}

impl CoreAssignment {
	/// Distinct worker threads this assignment will spawn.
	pub fn num_workers(&self) -> usize {
		group_by_core(&self.endpoint_cores).len() + group_by_core(&self.distributor_cores).len()
	}
}

/// Picks one core per endpoint (preferring the endpoint's socket) and one
/// per distributor from the remaining pool.
pub fn assign_cores(
	endpoint_sockets: &[i32],
	num_distributors: usize,
	available: &[CoreInfo],
) -> Result<CoreAssignment, ExecutorError> {
	let needed = endpoint_sockets.len() + num_distributors;
	if available.len() < needed {
		return Err(ExecutorError::InsufficientCores {
			needed,
			available: available.len(),
		});
	}

	let mut remaining: Vec<CoreInfo> = available.to_vec();
	let mut endpoint_cores = Vec::with_capacity(endpoint_sockets.len());

	for (endpoint, &socket) in endpoint_sockets.iter().enumerate() {
		let position = remaining
			.iter()
			.position(|core| core.socket_id == socket)
			.unwrap_or_else(|| {
				log::warn!(
					"no core on socket {} free for endpoint {}, taking any; expect degraded performance",
					socket,
					endpoint
				);
				0
			});
		endpoint_cores.push(remaining.remove(position));
	}

	let distributor_cores = remaining.drain(..num_distributors).collect::<Vec<_>>();

	for (endpoint, core) in endpoint_cores.iter().enumerate() {
		log::info!("assigned core {} to endpoint {}", core.core_id, endpoint);
	}
	for (distributor, core) in distributor_cores.iter().enumerate() {
		log::info!("assigned core {} to distributor {}", core.core_id, distributor);
	}

	Ok(CoreAssignment {
		endpoint_cores,
		distributor_cores,
	})
}

/// Groups component indices by the core they were assigned, preserving
/// component order within a core.
pub(crate) fn group_by_core(cores: &[CoreInfo]) -> Vec<(u32, Vec<usize>)> {
	let mut groups: Vec<(u32, Vec<usize>)> = Vec::new();
	for (component, core) in cores.iter().enumerate() {
		match groups.iter_mut().find(|(core_id, _)| *core_id == core.core_id) {
			Some((_, components)) => components.push(component),
			None => groups.push((core.core_id, vec![component])),
		}
	}
	groups
}

fn pin_current_thread(core_id: u32) -> bool {
	unsafe {
		let mut set: libc::cpu_set_t = std::mem::zeroed();
		libc::CPU_SET(core_id as usize, &mut set);
		libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) == 0
	}
}

/// Worker callback: receives the worker's slot, the component ids it
/// serves and the shared run flag. The callback owns its loop and returns
/// when the flag clears.
pub type WorkerFn = Arc<dyn Fn(usize, &[usize], &AtomicBool) + Send + Sync>;

pub struct FlowExecutor {
	threads: Vec<JoinHandle<()>>,
	run_flag: Arc<AtomicBool>,
}

impl FlowExecutor {
	/// Spawns one pinned thread per assigned core and hands each its
	/// component ids.
	pub fn start(assignment: &CoreAssignment, endpoint_cb: WorkerFn, distributor_cb: WorkerFn) -> Self {
		let run_flag = Arc::new(AtomicBool::new(true));
		let mut threads = Vec::new();
		let mut slot = 0usize;

		let mut spawn_group = |core_id: u32, ids: Vec<usize>, cb: WorkerFn, label: &str| {
			let flag = Arc::clone(&run_flag);
			let worker_slot = slot;
			slot += 1;
			let name = format!("flow-{}-{}", label, core_id);
			let handle = std::thread::Builder::new()
				.name(name.clone())
				.spawn(move || {
					if !pin_current_thread(core_id) {
						log::warn!("{}: could not pin to core {}", name, core_id);
					}
					register_worker_thread(worker_slot);
					let result = panic::catch_unwind(AssertUnwindSafe(|| {
						cb(worker_slot, &ids, &flag);
					}));
					if result.is_err() {
						log::error!("{}: worker panicked, stopping all workers", name);
						flag.store(false, Ordering::SeqCst);
					}
				})
				.expect("spawning worker thread");
			threads.push(handle);
		};

		for (core_id, ids) in group_by_core(&assignment.endpoint_cores) {
			spawn_group(core_id, ids, Arc::clone(&endpoint_cb), "ep");
		}
		for (core_id, ids) in group_by_core(&assignment.distributor_cores) {
			spawn_group(core_id, ids, Arc::clone(&distributor_cb), "dist");
		}
		drop(spawn_group);

		Self { threads, run_flag }
	}

	pub fn run_flag(&self) -> Arc<AtomicBool> {
		Arc::clone(&self.run_flag)
	}

	/// True while no worker has cleared the run flag.
	pub fn is_running(&self) -> bool {
		self.run_flag.load(Ordering::SeqCst)
	}

	/// Clears the run flag and joins every worker. Idempotent.
	pub fn stop(&mut self) {
		self.run_flag.store(false, Ordering::SeqCst);
		for handle in self.threads.drain(..) {
			let _ = handle.join();
		}
	}
}

impl Drop for FlowExecutor {
	fn drop(&mut self) {
		self.stop();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn cores(specs: &[(u32, i32)]) -> Vec<CoreInfo> {
		specs.iter().map(|&(c, s)| CoreInfo::new(c, s)).collect()
	}

	#[test]
	fn prefers_matching_socket() {
		let available = cores(&[(0, 0), (1, 1), (2, 0), (3, 1)]);
		let assignment = assign_cores(&[1, 0], 2, &available).unwrap();
		assert_eq!(assignment.endpoint_cores[0].socket_id, 1);
		assert_eq!(assignment.endpoint_cores[1].socket_id, 0);
		assert_eq!(assignment.distributor_cores.len(), 2);
	}

	#[test]
	fn falls_back_to_any_core() {
		let available = cores(&[(0, 0), (1, 0)]);
		let assignment = assign_cores(&[7], 1, &available).unwrap();
		assert_eq!(assignment.endpoint_cores[0].core_id, 0);
		assert_eq!(assignment.distributor_cores[0].core_id, 1);
	}

	#[test]
	fn insufficient_cores_is_an_error() {
		let available = cores(&[(0, 0)]);
		assert!(matches!(
			assign_cores(&[0, 0], 1, &available),
			Err(ExecutorError::InsufficientCores { needed: 3, available: 1 })
		));
	}

	#[test]
	fn grouping_collects_shared_cores() {
		let assigned = cores(&[(4, 0), (5, 0), (4, 0)]);
		let groups = group_by_core(&assigned);
		assert_eq!(groups.len(), 2);
		assert_eq!(groups[0], (4, vec![0, 2]));
		assert_eq!(groups[1], (5, vec![1]));
	}

	#[test]
	fn workers_stop_on_flag_clear() {
		let assignment = CoreAssignment {
			endpoint_cores: cores(&[(0, 0)]),
			distributor_cores: cores(&[(0, 0)]),
		};
		let spin: WorkerFn = Arc::new(|_slot, _ids, flag: &AtomicBool| {
			while flag.load(Ordering::SeqCst) {
				std::hint::spin_loop();
			}
		});
		let mut executor = FlowExecutor::start(&assignment, Arc::clone(&spin), spin);
		assert!(executor.is_running());
		executor.stop();
		assert!(!executor.is_running());
	}

	#[test]
	fn worker_panic_clears_the_run_flag() {
		let assignment = CoreAssignment {
			endpoint_cores: cores(&[(0, 0)]),
			distributor_cores: cores(&[(0, 0)]),
		};
		let panicking: WorkerFn = Arc::new(|_slot, _ids, _flag: &AtomicBool| {
			panic!("processor failure");
		});
		let waiting: WorkerFn = Arc::new(|_slot, _ids, flag: &AtomicBool| {
			while flag.load(Ordering::SeqCst) {
				std::hint::spin_loop();
			}
		});
		let mut executor = FlowExecutor::start(&assignment, panicking, waiting);
		// The distributor only exits because the panic cleared the flag.
		for handle in executor.threads.drain(..) {
			let _ = handle.join();
		}
		assert!(!executor.is_running());
	}
}
