//! Bounded lock-free rings of buffer handles used for inter-worker
//! hand-off
//!
//! A Ring is power-of-two sized and wait-free on the uncontended path.
//! Multi-producer and multi-consumer behaviour is selected per side at
//! construction: producers reserve a slot range with a compare-and-swap
//! on the producer head, fill the slots, then hand-shake (a bounded spin)
//! until earlier reservations have been published before advancing the
//! producer tail. Single-producer/single-consumer rings skip both the
//! compare-and-swap and the hand-shake.

use std::{
	cell::UnsafeCell,
	hint,
	ptr,
	sync::atomic::{AtomicU32, Ordering},
};

use crossbeam_utils::CachePadded;

use super::{mbuf::PktHdr, Mbuf, MbufVec, RingError};

/// Single producer enqueues only.
pub const RING_F_SP_ENQ: u32 = 0x1;
/// Single consumer dequeues only.
pub const RING_F_SC_DEQ: u32 = 0x2;

struct HeadTail {
	head: CachePadded<AtomicU32>,
	tail: CachePadded<AtomicU32>,
}

impl HeadTail {
	fn new() -> Self {
		Self {
			head: CachePadded::new(AtomicU32::new(0)),
			tail: CachePadded::new(AtomicU32::new(0)),
		}
	}
}

pub struct Ring {
	slots: Box<[UnsafeCell<*mut PktHdr>]>,
	mask: u32,
	capacity: u32,
	sp: bool,
	sc: bool,
	prod: HeadTail,
	cons: HeadTail,
}

unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
	pub fn new(capacity: usize, flags: u32) -> Result<Self, RingError> {
		if capacity == 0 || !capacity.is_power_of_two() || capacity > u32::MAX as usize / 2 {
			return Err(RingError::BadCapacity(capacity));
		}
		let mut slots = Vec::with_capacity(capacity);
		slots.resize_with(capacity, || UnsafeCell::new(ptr::null_mut()));
		Ok(Self {
			slots: slots.into_boxed_slice(),
			mask: capacity as u32 - 1,
			capacity: capacity as u32,
			sp: flags & RING_F_SP_ENQ != 0,
			sc: flags & RING_F_SC_DEQ != 0,
			prod: HeadTail::new(),
			cons: HeadTail::new(),
		})
	}

	#[inline]
	pub fn capacity(&self) -> usize {
		self.capacity as usize
	}

	/// Number of handles currently queued.
	#[inline]
	pub fn count(&self) -> usize {
		let prod_tail = self.prod.tail.load(Ordering::Acquire);
		let cons_tail = self.cons.tail.load(Ordering::Acquire);
		prod_tail.wrapping_sub(cons_tail) as usize
	}

	#[inline]
	pub fn free_count(&self) -> usize {
		self.capacity() - self.count()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.count() == 0
	}

	/// Reserves up to `wanted` producer slots. Returns the old head and
	/// the reserved count.
	#[inline]
	fn reserve_prod(&self, wanted: u32) -> (u32, u32) {
		let mut head = self.prod.head.load(Ordering::Relaxed);
		loop {
			let cons_tail = self.cons.tail.load(Ordering::Acquire);
			let free = self.capacity.wrapping_sub(head.wrapping_sub(cons_tail));
			let take = wanted.min(free);
			if take == 0 {
				return (head, 0);
			}
			if self.sp {
				self.prod.head.store(head.wrapping_add(take), Ordering::Relaxed);
				return (head, take);
			}
			match self.prod.head.compare_exchange_weak(
				head,
				head.wrapping_add(take),
				Ordering::Relaxed,
				Ordering::Relaxed,
			) {
				Ok(_) => return (head, take),
				Err(cur) => head = cur,
			}
		}
	}

	/// Publishes a reserved producer range after its slots were written.
	#[inline]
	fn commit_prod(&self, old_head: u32, new_head: u32) {
		if !self.sp {
			// Hand-shake: earlier reservations publish first, keeping the
			// consumer's view contiguous.
			while self.prod.tail.load(Ordering::Acquire) != old_head {
				hint::spin_loop();
			}
		}
		self.prod.tail.store(new_head, Ordering::Release);
	}

	#[inline]
	fn reserve_cons(&self, wanted: u32) -> (u32, u32) {
		let mut head = self.cons.head.load(Ordering::Relaxed);
		loop {
			let prod_tail = self.prod.tail.load(Ordering::Acquire);
			let avail = prod_tail.wrapping_sub(head);
			let take = wanted.min(avail);
			if take == 0 {
				return (head, 0);
			}
			if self.sc {
				self.cons.head.store(head.wrapping_add(take), Ordering::Relaxed);
				return (head, take);
			}
			match self.cons.head.compare_exchange_weak(
				head,
				head.wrapping_add(take),
				Ordering::Relaxed,
				Ordering::Relaxed,
			) {
				Ok(_) => return (head, take),
				Err(cur) => head = cur,
			}
		}
	}

	#[inline]
	fn commit_cons(&self, old_head: u32, new_head: u32) {
		if !self.sc {
			while self.cons.tail.load(Ordering::Acquire) != old_head {
				hint::spin_loop();
			}
		}
		self.cons.tail.store(new_head, Ordering::Release);
	}

	/// Enqueues a single handle; hands it back on a full ring.
	pub fn enqueue(&self, mbuf: Mbuf) -> Result<(), Mbuf> {
		let (head, n) = self.reserve_prod(1);
		if n == 0 {
			return Err(mbuf);
		}
		unsafe {
			*self.slots[(head & self.mask) as usize].get() = mbuf.into_raw();
		}
		self.commit_prod(head, head.wrapping_add(1));
		Ok(())
	}

	/// Dequeues a single handle.
	pub fn dequeue(&self) -> Option<Mbuf> {
		let (head, n) = self.reserve_cons(1);
		if n == 0 {
			return None;
		}
		let raw = unsafe { *self.slots[(head & self.mask) as usize].get() };
		self.commit_cons(head, head.wrapping_add(1));
		Some(unsafe { Mbuf::from_raw(raw) })
	}

	/// Moves `min(vec.len(), free_slots)` handles from the front of the
	/// burst into the ring and advances the burst head. Returns how many
	/// were moved.
	pub fn enqueue_burst(&self, vec: &mut MbufVec) -> usize {
		let (head, n) = self.reserve_prod(vec.len() as u32);
		if n == 0 {
			return 0;
		}
		for idx in 0..n {
			// Reserved range, slots are exclusively ours until commit.
			let mbuf = vec.take_slot(idx as usize).expect("live handle in burst window");
			unsafe {
				*self.slots[(head.wrapping_add(idx) & self.mask) as usize].get() = mbuf.into_raw();
			}
		}
		vec.consume_front(n as usize);
		self.commit_prod(head, head.wrapping_add(n));
		n as usize
	}

	/// Fills the free tail of the burst from the ring. Returns how many
	/// handles were dequeued.
	pub fn dequeue_burst(&self, vec: &mut MbufVec) -> usize {
		let (head, n) = self.reserve_cons(vec.free_tail() as u32);
		if n == 0 {
			return 0;
		}
		{
			let tail = vec.tail_slots();
			for idx in 0..n {
				let raw = unsafe { *self.slots[(head.wrapping_add(idx) & self.mask) as usize].get() };
				tail[idx as usize] = Some(unsafe { Mbuf::from_raw(raw) });
			}
		}
		vec.grow_tail(n as usize);
		self.commit_cons(head, head.wrapping_add(n));
		n as usize
	}
}

impl Drop for Ring {
	fn drop(&mut self) {
		// Free whatever is still queued.
		while let Some(mbuf) = self.dequeue() {
			drop(mbuf);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::apis::{Mempool, MempoolConfig};
	use std::sync::Arc;
	use std::thread;

	fn pool(capacity: usize) -> Arc<Mempool> {
		Mempool::new(
			"ring-test",
			MempoolConfig {
				capacity,
				cache_size: 0,
				dataroom: 128,
				headroom: 0,
			},
		)
		.unwrap()
	}

	fn tagged(mp: &Mempool, tag: u8) -> Mbuf {
		Mbuf::from_bytes(&[tag], mp).unwrap()
	}

	#[test]
	fn rejects_non_power_of_two() {
		assert!(Ring::new(12, 0).is_err());
		assert!(Ring::new(0, 0).is_err());
		assert!(Ring::new(16, 0).is_ok());
	}

	#[test]
	fn fifo_order_is_preserved() {
		let mp = pool(64);
		let ring = Ring::new(16, RING_F_SP_ENQ | RING_F_SC_DEQ).unwrap();
		for tag in 0..10u8 {
			ring.enqueue(tagged(&mp, tag)).unwrap();
		}
		for tag in 0..10u8 {
			let m = ring.dequeue().unwrap();
			assert_eq!(m.data()[0], tag);
		}
		assert!(ring.dequeue().is_none());
	}

	#[test]
	fn burst_enqueue_returns_short_count_on_backpressure() {
		let mp = pool(64);
		let ring = Ring::new(8, 0).unwrap();
		let mut vec = MbufVec::with_capacity(16);
		mp.alloc_bulk(&mut vec, 12).unwrap();

		let moved = ring.enqueue_burst(&mut vec);
		assert_eq!(moved, 8);
		assert_eq!(vec.len(), 4);
		assert_eq!(ring.count(), 8);

		let mut out = MbufVec::with_capacity(16);
		assert_eq!(ring.dequeue_burst(&mut out), 8);
		assert_eq!(out.len(), 8);
	}

	#[test]
	fn drop_frees_queued_handles() {
		let mp = pool(8);
		{
			let ring = Ring::new(8, 0).unwrap();
			for tag in 0..4u8 {
				ring.enqueue(tagged(&mp, tag)).unwrap();
			}
			assert_eq!(mp.in_use(), 4);
		}
		assert_eq!(mp.in_use(), 0);
	}

	#[test]
	fn spsc_threads_preserve_sequence() {
		let mp = pool(1 << 10);
		let ring = Arc::new(Ring::new(256, RING_F_SP_ENQ | RING_F_SC_DEQ).unwrap());
		let total = 500u16;

		let producer = {
			let ring = Arc::clone(&ring);
			let mp = Arc::clone(&mp);
			thread::spawn(move || {
				for seq in 0..total {
					let mut m = mp.alloc().unwrap();
					m.append(&seq.to_be_bytes()).unwrap();
					loop {
						match ring.enqueue(m) {
							Ok(()) => break,
							Err(back) => m = back,
						}
					}
				}
			})
		};

		let mut expected = 0u16;
		while expected < total {
			if let Some(m) = ring.dequeue() {
				let seq = u16::from_be_bytes([m.data()[0], m.data()[1]]);
				assert_eq!(seq, expected);
				expected += 1;
			}
		}
		producer.join().unwrap();
		assert_eq!(mp.in_use(), 0);
	}

	#[test]
	fn mpmc_threads_lose_nothing() {
		let mp = pool(1 << 12);
		let ring = Arc::new(Ring::new(512, 0).unwrap());
		let per_producer = 400u16;
		let producers = 3;

		let handles: Vec<_> = (0..producers)
			.map(|_| {
				let ring = Arc::clone(&ring);
				let mp = Arc::clone(&mp);
				thread::spawn(move || {
					for seq in 0..per_producer {
						let mut m = mp.alloc().unwrap();
						m.append(&seq.to_be_bytes()).unwrap();
						loop {
							match ring.enqueue(m) {
								Ok(()) => break,
								Err(back) => m = back,
							}
						}
					}
				})
			})
			.collect();

		let mut received = 0usize;
		let expected = per_producer as usize * producers;
		while received < expected {
			if ring.dequeue().is_some() {
				received += 1;
			}
		}
		for h in handles {
			h.join().unwrap();
		}
		assert_eq!(received, expected);
		assert_eq!(mp.in_use(), 0);
	}
}
