//! The Mempool owns a fixed arena of packet buffers with a shared free
//! list and per-worker caches. Bulk allocation either fully succeeds or
//! fails without handing out a partial burst; freeing always succeeds.

use std::{
	alloc::{self, Layout},
	cell::UnsafeCell,
	fmt, mem,
	ptr::{self, NonNull},
	sync::{
		atomic::{fence, AtomicU32, AtomicU64, AtomicUsize, Ordering},
		Arc,
	},
};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;

use super::{mbuf::PktHdr, Mbuf, MbufVec, PoolError};
use crate::executor::current_worker_slot;
use crate::MAX_WORKERS;

/// Default headroom in front of the data area, leaving space for header
/// prepends without a copy.
pub const DEFAULT_HEADROOM: u16 = 128;

#[derive(Clone, Copy, Debug)]
pub struct MempoolConfig {
	/// Total number of buffers in the pool.
	pub capacity: usize,
	/// Per-worker cache size. 0 disables caching.
	pub cache_size: usize,
	/// Usable data bytes per buffer, excluding headroom.
	pub dataroom: u16,
	pub headroom: u16,
}

impl Default for MempoolConfig {
	fn default() -> Self {
		Self {
			capacity: 1 << 14,
			cache_size: 128,
			dataroom: 2048,
			headroom: DEFAULT_HEADROOM,
		}
	}
}

/// Free buffers parked next to one worker so the common alloc/free path
/// never touches the shared queue. Each slot is owned by exactly one
/// registered worker thread.
struct WorkerCache(UnsafeCell<Vec<usize>>);

unsafe impl Sync for WorkerCache {}

pub struct Mempool {
	name: String,
	base: *mut u8,
	layout: Layout,
	stride: usize,
	capacity: usize,
	cache_size: usize,
	dataroom: u16,
	headroom: u16,
	free: ArrayQueue<usize>,
	caches: Box<[CachePadded<WorkerCache>]>,
	in_use: AtomicUsize,
	alloc_failures: AtomicU64,
}

unsafe impl Send for Mempool {}
unsafe impl Sync for Mempool {}

impl Mempool {
	pub fn new(name: &str, cfg: MempoolConfig) -> Result<Arc<Self>, PoolError> {
		if cfg.capacity == 0 {
			return Err(PoolError::BadConfig("capacity must be non-zero"));
		}
		if cfg.dataroom == 0 {
			return Err(PoolError::BadConfig("dataroom must be non-zero"));
		}
		if cfg.cache_size > cfg.capacity {
			return Err(PoolError::BadConfig("cache size exceeds capacity"));
		}

		let buf_len = cfg.headroom as usize + cfg.dataroom as usize;
		if buf_len > u16::MAX as usize {
			return Err(PoolError::BadConfig("headroom + dataroom exceeds 64K"));
		}

		// Keep every buffer header on its own cache line.
		let region = (buf_len + 63) & !63;
		let stride = mem::size_of::<PktHdr>() + region;
		let layout = Layout::from_size_align(stride * cfg.capacity, 64)
			.map_err(|_| PoolError::BadConfig("arena layout overflow"))?;

		let base = unsafe { alloc::alloc_zeroed(layout) };
		if base.is_null() {
			return Err(PoolError::BadConfig("arena allocation failed"));
		}

		let mut caches = Vec::with_capacity(MAX_WORKERS);
		for _ in 0..MAX_WORKERS {
			caches.push(CachePadded::new(WorkerCache(UnsafeCell::new(Vec::with_capacity(
				cfg.cache_size,
			)))));
		}

		let pool = Arc::new(Self {
			name: name.to_owned(),
			base,
			layout,
			stride,
			capacity: cfg.capacity,
			cache_size: cfg.cache_size,
			dataroom: cfg.dataroom,
			headroom: cfg.headroom,
			free: ArrayQueue::new(cfg.capacity),
			caches: caches.into_boxed_slice(),
			in_use: AtomicUsize::new(0),
			alloc_failures: AtomicU64::new(0),
		});

		let pool_ptr = Arc::as_ptr(&pool);
		for idx in 0..cfg.capacity {
			let hdr = pool.slot_hdr(idx);
			unsafe {
				ptr::write(
					ptr::addr_of_mut!((*hdr).pool),
					pool_ptr,
				);
				ptr::write(ptr::addr_of_mut!((*hdr).shared), ptr::null_mut());
				ptr::write(ptr::addr_of_mut!((*hdr).refcnt), AtomicU32::new(0));
				(*hdr).data_off = cfg.headroom;
				(*hdr).data_len = 0;
				(*hdr).buf_len = buf_len as u16;
				(*hdr).info.reset();
			}
			// Arena slots always fit the queue, the push cannot fail.
			let _ = pool.free.push(idx);
		}

		log::info!("created mempool {}: {} buffers, {}B dataroom", name, cfg.capacity, cfg.dataroom);
		Ok(pool)
	}

	#[inline]
	fn slot_hdr(&self, idx: usize) -> *mut PktHdr {
		unsafe { self.base.add(idx * self.stride) as *mut PktHdr }
	}

	#[inline]
	fn hdr_index(&self, hdr: *mut PktHdr) -> usize {
		(hdr as usize - self.base as usize) / self.stride
	}

	#[inline]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[inline]
	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Number of buffers currently held by live handles.
	#[inline]
	pub fn in_use(&self) -> usize {
		self.in_use.load(Ordering::Acquire)
	}

	/// Number of failed bulk allocation calls.
	#[inline]
	pub fn alloc_failures(&self) -> u64 {
		self.alloc_failures.load(Ordering::Relaxed)
	}

	#[inline]
	pub fn dataroom(&self) -> u16 {
		self.dataroom
	}

	#[inline]
	fn cache(&self) -> Option<&mut Vec<usize>> {
		if self.cache_size == 0 {
			return None;
		}
		let slot = current_worker_slot()?;
		if slot >= self.caches.len() {
			return None;
		}
		// Each registered worker owns its cache slot exclusively.
		Some(unsafe { &mut *self.caches[slot].0.get() })
	}

	fn take_one(&self) -> Option<usize> {
		if let Some(cache) = self.cache() {
			if let Some(idx) = cache.pop() {
				return Some(idx);
			}
			// Refill the cache in one sweep before retrying the fast path.
			for _ in 0..self.cache_size {
				match self.free.pop() {
					Some(idx) => cache.push(idx),
					None => break,
				}
			}
			return cache.pop();
		}
		self.free.pop()
	}

	fn put_one(&self, idx: usize) {
		if let Some(cache) = self.cache() {
			if cache.len() < self.cache_size {
				cache.push(idx);
				return;
			}
			// Cache full: spill it back to the shared queue wholesale.
			for spilled in cache.drain(..) {
				let _ = self.free.push(spilled);
			}
		}
		let _ = self.free.push(idx);
	}

	fn init_hdr(&self, idx: usize) -> NonNull<PktHdr> {
		let hdr = self.slot_hdr(idx);
		unsafe {
			(*hdr).shared = ptr::null_mut();
			(*hdr).refcnt.store(1, Ordering::Relaxed);
			(*hdr).data_off = self.headroom;
			(*hdr).data_len = 0;
			(*hdr).info.reset();
			NonNull::new_unchecked(hdr)
		}
	}

	/// Allocates a single buffer.
	pub fn alloc(&self) -> Result<Mbuf, PoolError> {
		match self.take_one() {
			Some(idx) => {
				self.in_use.fetch_add(1, Ordering::AcqRel);
				Ok(unsafe { Mbuf::from_hdr(self.init_hdr(idx)) })
			}
			None => {
				self.alloc_failures.fetch_add(1, Ordering::Relaxed);
				Err(PoolError::Exhausted)
			}
		}
	}

	/// Allocates `count` buffers into the free tail of `vec`, or fails
	/// without handing out any.
	pub fn alloc_bulk(&self, vec: &mut MbufVec, count: usize) -> Result<(), PoolError> {
		if count > vec.free_tail() {
			return Err(PoolError::BadConfig("burst vector too small for bulk alloc"));
		}
		let mut taken = [0usize; super::MAX_BURST];
		let mut got = 0;
		while got < count {
			match self.take_one() {
				Some(idx) => {
					taken[got] = idx;
					got += 1;
				}
				None => break,
			}
		}
		if got < count {
			for &idx in &taken[..got] {
				self.put_one(idx);
			}
			self.alloc_failures.fetch_add(1, Ordering::Relaxed);
			return Err(PoolError::Exhausted);
		}
		self.in_use.fetch_add(count, Ordering::AcqRel);
		for &idx in &taken[..count] {
			let mbuf = unsafe { Mbuf::from_hdr(self.init_hdr(idx)) };
			// Free tail space was checked above.
			let _ = vec.push(mbuf);
		}
		Ok(())
	}

	/// Frees every live handle in `vec`. Provided for symmetry with
	/// `alloc_bulk`; dropping handles individually is equivalent.
	pub fn free_bulk(&self, vec: &mut MbufVec) {
		vec.free();
	}

	/// Returns one buffer to the pool, resolving broadcast clone
	/// indirection. Called from `Mbuf::drop`.
	pub(crate) fn free_mbuf(&self, raw: NonNull<PktHdr>) {
		let hdr = raw.as_ptr();
		let shared = unsafe { (*hdr).shared };
		if shared.is_null() {
			// Direct buffer: the slot goes back once the last payload
			// reference is gone.
			if unsafe { (*hdr).refcnt.fetch_sub(1, Ordering::Release) } == 1 {
				fence(Ordering::Acquire);
				self.put_one(self.hdr_index(hdr));
			}
		} else {
			// Clone: release the donor payload, then the clone header.
			if unsafe { (*shared).refcnt.fetch_sub(1, Ordering::Release) } == 1 {
				fence(Ordering::Acquire);
				self.put_one(self.hdr_index(shared));
			}
			self.put_one(self.hdr_index(hdr));
		}
		self.in_use.fetch_sub(1, Ordering::AcqRel);
	}
}

impl fmt::Debug for Mempool {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct(&self.name)
			.field("capacity", &self.capacity)
			.field("cache size", &self.cache_size)
			.field("dataroom", &self.dataroom)
			.field("in use", &self.in_use())
			.finish()
	}
}

impl Drop for Mempool {
	fn drop(&mut self) {
		let leaked = self.in_use.load(Ordering::Acquire);
		if leaked != 0 {
			log::warn!("mempool {} dropped with {} buffers still in use", self.name, leaked);
		}
		unsafe { alloc::dealloc(self.base, self.layout) };
	}
}

// data_region() assumes the data area starts right behind a cache-line
// aligned header.
const _: () = assert!(mem::size_of::<PktHdr>() % 64 == 0);
const _: () = assert!(mem::align_of::<PktHdr>() == 64);

#[cfg(test)]
mod tests {
	use super::*;

	fn small_pool(capacity: usize) -> Arc<Mempool> {
		Mempool::new(
			"test",
			MempoolConfig {
				capacity,
				cache_size: 0,
				dataroom: 512,
				headroom: 64,
			},
		)
		.unwrap()
	}

	#[test]
	fn alloc_free_roundtrip() {
		let mp = small_pool(8);
		assert_eq!(mp.in_use(), 0);
		let m = mp.alloc().unwrap();
		assert_eq!(mp.in_use(), 1);
		assert_eq!(m.data_len(), 0);
		drop(m);
		assert_eq!(mp.in_use(), 0);
	}

	#[test]
	fn bulk_alloc_is_atomic() {
		let mp = small_pool(8);
		let mut vec = MbufVec::with_capacity(16);
		assert!(mp.alloc_bulk(&mut vec, 16).is_err());
		assert_eq!(vec.len(), 0);
		assert_eq!(mp.in_use(), 0);
		assert_eq!(mp.alloc_failures(), 1);

		mp.alloc_bulk(&mut vec, 8).unwrap();
		assert_eq!(vec.len(), 8);
		assert_eq!(mp.in_use(), 8);
		vec.free();
		assert_eq!(mp.in_use(), 0);
	}

	#[test]
	fn exhaustion_is_counted_not_fatal() {
		let mp = small_pool(2);
		let a = mp.alloc().unwrap();
		let b = mp.alloc().unwrap();
		assert!(matches!(mp.alloc(), Err(PoolError::Exhausted)));
		assert_eq!(mp.alloc_failures(), 1);
		drop(a);
		drop(b);
		assert!(mp.alloc().is_ok());
	}

	#[test]
	fn data_append_and_truncate() {
		let mp = small_pool(2);
		let mut m = Mbuf::from_bytes(&[1, 2, 3, 4], &mp).unwrap();
		assert_eq!(m.data(), &[1, 2, 3, 4]);
		m.append(&[5]).unwrap();
		assert_eq!(m.data_len(), 5);
		m.truncate(2).unwrap();
		assert_eq!(m.data(), &[1, 2]);
	}

	#[test]
	fn broadcast_clone_shares_payload() {
		let mp = small_pool(4);
		let m = Mbuf::from_bytes(&[9, 9, 9], &mp).unwrap();
		let c = m.clone_for_broadcast(&mp).unwrap();
		assert_eq!(mp.in_use(), 2);
		assert_eq!(c.data(), &[9, 9, 9]);
		assert!(m.payload_shared());

		// Dropping the original keeps the payload alive for the clone.
		drop(m);
		assert_eq!(c.data(), &[9, 9, 9]);
		assert_eq!(mp.in_use(), 1);
		drop(c);
		assert_eq!(mp.in_use(), 0);
	}

	#[test]
	fn clone_metadata_is_independent() {
		let mp = small_pool(4);
		let mut m = Mbuf::from_bytes(&[1], &mp).unwrap();
		m.pkt_info_mut().dst_endpoint_id = 3;
		let mut c = m.clone_for_broadcast(&mp).unwrap();
		assert_eq!(c.pkt_info().dst_endpoint_id, 3);
		c.pkt_info_mut().dst_endpoint_id = 7;
		assert_eq!(m.pkt_info().dst_endpoint_id, 3);
	}
}
