//! Concurrent flow table: a fingerprint to flow-record map with bounded
//! associativity and deferred reclamation
//!
//! Buckets are small set-associative blocks scanned linearly from the
//! per-bucket LRU cursor. Lookups run in parallel without locks; an insert
//! publishes the bucket hash first and the record reference second behind
//! a release fence, so a reader that observes the reference also observes
//! a matching hash. Displaced records are only returned to the record pool
//! after every registered worker has passed a quiescent checkpoint.

use std::{
	cell::UnsafeCell,
	hint,
	net::Ipv4Addr,
	ptr,
	sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU16, AtomicU64, AtomicUsize, Ordering},
	time::Instant,
};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;

use crate::apis::PORT_ID_IGNORE;
use crate::MAX_WORKERS;

pub type FlowHash = u64;

/// Slots per bucket. Flows whose reduced keys collide replace each other
/// LRU-wise once the bucket is full.
pub const FLOW_BUCKET_WIDTH: usize = 8;

/// Per-flow state. Identity fields are written by the creating worker
/// before the record is published to the table and are read-only
/// afterwards; the atomic fields may be updated by processors at any time.
pub struct FlowRecord {
	pub flow_hash: FlowHash,
	pub src_addr: Ipv4Addr,
	pub dst_addr: Ipv4Addr,
	pub ether_src: [u8; 6],
	pub ether_dst: [u8; 6],
	pub src_port: u16,
	pub dst_port: u16,
	pub next_proto: u8,
	/// Free-form mark bits for processors.
	pub mark: AtomicU64,
	/// Sticky routing decision taken by a filter on the first packet of
	/// the flow; PORT_ID_IGNORE until one is taken.
	pub overwrite_dst_port: AtomicU16,
	pub last_used_tsc: AtomicU64,
}

impl FlowRecord {
	fn blank() -> Self {
		Self {
			flow_hash: 0,
			src_addr: Ipv4Addr::UNSPECIFIED,
			dst_addr: Ipv4Addr::UNSPECIFIED,
			ether_src: [0; 6],
			ether_dst: [0; 6],
			src_port: 0,
			dst_port: 0,
			next_proto: 0,
			mark: AtomicU64::new(0),
			overwrite_dst_port: AtomicU16::new(PORT_ID_IGNORE),
			last_used_tsc: AtomicU64::new(0),
		}
	}

	fn reset_dynamic(&self, now: u64) {
		self.mark.store(0, Ordering::Relaxed);
		self.overwrite_dst_port.store(PORT_ID_IGNORE, Ordering::Relaxed);
		self.last_used_tsc.store(now, Ordering::Relaxed);
	}
}

struct RecordSlot(UnsafeCell<FlowRecord>);

unsafe impl Sync for RecordSlot {}

/// Fixed-capacity record pool fed back by the reclamation path.
struct FlowRecordPool {
	slots: Box<[RecordSlot]>,
	free: ArrayQueue<usize>,
	in_use: AtomicUsize,
}

impl FlowRecordPool {
	fn new(capacity: usize) -> Self {
		let mut slots = Vec::with_capacity(capacity);
		slots.resize_with(capacity, || RecordSlot(UnsafeCell::new(FlowRecord::blank())));
		let free = ArrayQueue::new(capacity);
		for idx in 0..capacity {
			let _ = free.push(idx);
		}
		Self {
			slots: slots.into_boxed_slice(),
			free,
			in_use: AtomicUsize::new(0),
		}
	}

	fn alloc(&self) -> Option<*mut FlowRecord> {
		let idx = self.free.pop()?;
		self.in_use.fetch_add(1, Ordering::AcqRel);
		Some(self.slots[idx].0.get())
	}

	fn free_ptr(&self, record: *mut FlowRecord) {
		let base = self.slots.as_ptr() as usize;
		let idx = (record as usize - base) / std::mem::size_of::<RecordSlot>();
		debug_assert!(idx < self.slots.len());
		self.in_use.fetch_sub(1, Ordering::AcqRel);
		let _ = self.free.push(idx);
	}

	fn in_use(&self) -> usize {
		self.in_use.load(Ordering::Acquire)
	}
}

struct Bucket {
	hashes: [AtomicU64; FLOW_BUCKET_WIDTH],
	refs: [AtomicPtr<FlowRecord>; FLOW_BUCKET_WIDTH],
	/// Index of the most recently inserted slot; the victim for the next
	/// insert sits right behind it. Advanced only by inserting workers.
	lru_head: AtomicU64,
}

impl Bucket {
	fn new() -> Self {
		Self {
			hashes: std::array::from_fn(|_| AtomicU64::new(0)),
			refs: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
			lru_head: AtomicU64::new(0),
		}
	}
}

/// Quiescence tracking for one registered worker.
struct CoreEpoch {
	active: AtomicBool,
	seen: AtomicU64,
}

pub struct FlowTable {
	buckets: Box<[Bucket]>,
	bucket_mask: u64,
	records: FlowRecordPool,
	epoch: AtomicU64,
	cores: Box<[CachePadded<CoreEpoch>]>,
	classify_failures: AtomicU64,
	started: Instant,
}

impl FlowTable {
	/// `capacity` bounds the number of live flow records; the bucket array
	/// is sized to hold that many at full associativity.
	pub fn new(capacity: usize) -> Self {
		let capacity = capacity.max(FLOW_BUCKET_WIDTH);
		let num_buckets = (capacity / FLOW_BUCKET_WIDTH).next_power_of_two();
		let mut buckets = Vec::with_capacity(num_buckets);
		buckets.resize_with(num_buckets, Bucket::new);
		let mut cores = Vec::with_capacity(MAX_WORKERS);
		cores.resize_with(MAX_WORKERS, || {
			CachePadded::new(CoreEpoch {
				active: AtomicBool::new(false),
				seen: AtomicU64::new(0),
			})
		});
		log::info!("flow table: {} records across {} buckets", capacity, num_buckets);
		Self {
			buckets: buckets.into_boxed_slice(),
			bucket_mask: num_buckets as u64 - 1,
			records: FlowRecordPool::new(capacity),
			epoch: AtomicU64::new(0),
			cores: cores.into_boxed_slice(),
			classify_failures: AtomicU64::new(0),
			started: Instant::now(),
		}
	}

	/// Number of flow records currently installed.
	pub fn num_flows(&self) -> usize {
		self.records.in_use()
	}

	pub fn capacity(&self) -> usize {
		self.records.slots.len()
	}

	/// Lookups that could not allocate a record.
	pub fn classify_failures(&self) -> u64 {
		self.classify_failures.load(Ordering::Relaxed)
	}

	/// Cheap monotonic timestamp stored in records on every touch.
	#[inline]
	pub fn now_tsc(&self) -> u64 {
		self.started.elapsed().as_nanos() as u64
	}

	/// Registers a worker with the reclamation protocol. Must be called
	/// before the worker performs any lookups.
	pub fn set_core_active(&self, core: usize) {
		let slot = &self.cores[core];
		slot.seen.store(self.epoch.load(Ordering::Acquire), Ordering::Release);
		slot.active.store(true, Ordering::Release);
	}

	/// Declares that the worker holds no references into the table.
	/// Workers call this once per outer loop iteration.
	#[inline]
	pub fn checkpoint(&self, core: usize) {
		let slot = &self.cores[core];
		slot.seen.store(self.epoch.load(Ordering::Acquire), Ordering::Release);
	}

	/// Removes the worker from the reclamation protocol, e.g. on shutdown.
	pub fn set_core_inactive(&self, core: usize) {
		self.cores[core].active.store(false, Ordering::Release);
	}

	#[inline]
	fn bucket(&self, hash: FlowHash) -> &Bucket {
		&self.buckets[(hash & self.bucket_mask) as usize]
	}

	/// Scans a bucket for `hash`, newest slot first. Validates the hash
	/// stored in the record itself so a slot rewritten by a concurrent
	/// insert can never yield a mismatched record.
	fn scan(&self, bucket: &Bucket, hash: FlowHash) -> Option<&FlowRecord> {
		let start = bucket.lru_head.load(Ordering::Relaxed) as usize;
		for step in 0..FLOW_BUCKET_WIDTH {
			let slot = (start + step) % FLOW_BUCKET_WIDTH;
			if bucket.hashes[slot].load(Ordering::Relaxed) != hash {
				continue;
			}
			let record = bucket.refs[slot].load(Ordering::Acquire);
			if record.is_null() {
				continue;
			}
			let record = unsafe { &*record };
			if record.flow_hash == hash {
				return Some(record);
			}
		}
		None
	}

	/// Read-only lookup. The returned reference is valid until the calling
	/// worker's next checkpoint.
	pub fn lookup(&self, hash: FlowHash) -> Option<&FlowRecord> {
		let record = self.scan(self.bucket(hash), hash)?;
		record.last_used_tsc.store(self.now_tsc(), Ordering::Relaxed);
		Some(record)
	}

	/// Looks up `hash` and, on a miss, installs a fresh record initialized
	/// by `fill`. Returns the record and whether it was created, or None
	/// when the record pool is exhausted (the packet then proceeds
	/// unclassified). `core` is the calling worker's registered slot.
	pub fn get_or_create<F>(&self, core: usize, hash: FlowHash, fill: F) -> Option<(&FlowRecord, bool)>
	where
		F: FnOnce(&mut FlowRecord),
	{
		let bucket = self.bucket(hash);
		let now = self.now_tsc();

		if let Some(record) = self.scan(bucket, hash) {
			record.last_used_tsc.store(now, Ordering::Relaxed);
			return Some((record, false));
		}

		let record = match self.records.alloc() {
			Some(record) => record,
			None => {
				self.classify_failures.fetch_add(1, Ordering::Relaxed);
				return None;
			}
		};

		// The record is still private; initialize it in place before it
		// becomes visible to other workers.
		{
			let record = unsafe { &mut *record };
			fill(record);
			record.flow_hash = hash;
			record.reset_dynamic(now);
		}

		// Two-step publish into the victim slot: hash first, reference
		// second. A reader that sees the new reference therefore also
		// sees its matching hash and initialized fields.
		let lru = bucket.lru_head.load(Ordering::Relaxed) as usize;
		let victim = (lru + FLOW_BUCKET_WIDTH - 1) % FLOW_BUCKET_WIDTH;
		bucket.hashes[victim].store(hash, Ordering::Relaxed);
		fence(Ordering::Release);
		let displaced = bucket.refs[victim].swap(record, Ordering::AcqRel);
		bucket.lru_head.store(victim as u64, Ordering::Release);

		if !displaced.is_null() {
			// The displaced record may still be referenced by readers that
			// grabbed it before the swap; hold it back until every worker
			// registered right now has passed a checkpoint.
			let token = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
			self.checkpoint(core);
			self.wait_quiescent(token);
			self.records.free_ptr(displaced);
		}

		Some((unsafe { &*record }, true))
	}

	fn wait_quiescent(&self, token: u64) {
		for slot in self.cores.iter() {
			loop {
				if !slot.active.load(Ordering::Acquire) {
					break;
				}
				if slot.seen.load(Ordering::Acquire) >= token {
					break;
				}
				hint::spin_loop();
			}
		}
	}
}

unsafe impl Send for FlowTable {}
unsafe impl Sync for FlowTable {}
