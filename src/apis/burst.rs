//! The MbufVec is the unit of work between pipeline stages: a small
//! fixed-capacity batch of buffer handles with head and tail cursors.
//! Handles in `[head, tail)` are live; the owned vector frees whatever is
//! still live when it is dropped.

use super::Mbuf;

/// Default burst size used by the workers.
pub const BURST_SIZE: usize = 32;
/// Hard upper bound on a burst vector's capacity.
pub const MAX_BURST: usize = 256;

pub struct MbufVec {
	slots: Box<[Option<Mbuf>]>,
	head: usize,
	tail: usize,
}

impl MbufVec {
	pub fn new() -> Self {
		Self::with_capacity(BURST_SIZE)
	}

	pub fn with_capacity(capacity: usize) -> Self {
		assert!(capacity > 0 && capacity <= MAX_BURST);
		let mut slots = Vec::with_capacity(capacity);
		slots.resize_with(capacity, || None);
		Self {
			slots: slots.into_boxed_slice(),
			head: 0,
			tail: 0,
		}
	}

	#[inline]
	pub fn capacity(&self) -> usize {
		self.slots.len()
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.tail - self.head
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.head == self.tail
	}

	/// Free slots left behind the tail.
	#[inline]
	pub fn free_tail(&self) -> usize {
		self.capacity() - self.tail
	}

	/// Appends a handle at the tail.
	pub fn push(&mut self, mbuf: Mbuf) -> Result<(), Mbuf> {
		if self.tail == self.capacity() {
			return Err(mbuf);
		}
		self.slots[self.tail] = Some(mbuf);
		self.tail += 1;
		Ok(())
	}

	/// Live handle at position `idx` (relative to the head).
	#[inline]
	pub fn slot(&self, idx: usize) -> Option<&Mbuf> {
		self.slots.get(self.head + idx).and_then(|s| s.as_ref())
	}

	#[inline]
	pub fn slot_mut(&mut self, idx: usize) -> Option<&mut Mbuf> {
		let at = self.head + idx;
		if at >= self.tail {
			return None;
		}
		self.slots[at].as_mut()
	}

	/// Removes and returns the handle at `idx`, leaving a null slot
	/// behind. Call `repack` before handing the burst to the next stage.
	pub fn take_slot(&mut self, idx: usize) -> Option<Mbuf> {
		let at = self.head + idx;
		if at >= self.tail {
			return None;
		}
		self.slots[at].take()
	}

	/// Frees the handle at `idx`, leaving a null slot behind.
	pub fn free_slot(&mut self, idx: usize) {
		let at = self.head + idx;
		if at < self.tail {
			self.slots[at] = None;
		}
	}

	/// Advances the head past `num` handles that were moved elsewhere.
	pub fn consume_front(&mut self, num: usize) {
		let num = num.min(self.len());
		debug_assert!(self.slots[self.head..self.head + num].iter().all(|s| s.is_none()));
		self.head += num;
	}

	/// Frees the first `num` live handles and advances the head.
	pub fn free_front(&mut self, num: usize) {
		let num = num.min(self.len());
		for slot in &mut self.slots[self.head..self.head + num] {
			*slot = None;
		}
		self.head += num;
	}

	/// Frees the last `num` live handles and pulls the tail back.
	pub fn free_back(&mut self, num: usize) {
		let num = num.min(self.len());
		for slot in &mut self.slots[self.tail - num..self.tail] {
			*slot = None;
		}
		self.tail -= num;
	}

	/// The free slots behind the tail, for drivers and rings that fill a
	/// burst in place. Follow with `grow_tail` for however many slots were
	/// filled.
	pub fn tail_slots(&mut self) -> &mut [Option<Mbuf>] {
		let tail = self.tail;
		&mut self.slots[tail..]
	}

	/// Extends the live window over `num` slots filled via `tail_slots`.
	/// Returns how many slots were actually added.
	pub fn grow_tail(&mut self, num: usize) -> usize {
		let num = num.min(self.free_tail());
		debug_assert!(self.slots[self.tail..self.tail + num].iter().all(|s| s.is_some()));
		self.tail += num;
		num
	}

	/// Frees every live handle and resets the cursors.
	pub fn free(&mut self) {
		for slot in &mut self.slots[self.head..self.tail] {
			*slot = None;
		}
		self.head = 0;
		self.tail = 0;
	}

	/// Resets the cursors after every handle was moved out.
	pub fn consume(&mut self) {
		debug_assert!(self.slots[self.head..self.tail].iter().all(|s| s.is_none()));
		self.head = 0;
		self.tail = 0;
	}

	/// Compacts live handles to the front of the vector, dropping the
	/// null slots left behind by `take_slot`/`free_slot`.
	pub fn repack(&mut self) {
		let mut dst = 0;
		for idx in self.head..self.tail {
			if self.slots[idx].is_some() {
				if dst != idx {
					self.slots[dst] = self.slots[idx].take();
				}
				dst += 1;
			}
		}
		self.head = 0;
		self.tail = dst;
	}

	/// Iterates over the live handles, skipping null slots.
	pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Mbuf> {
		self.slots[self.head..self.tail].iter_mut().filter_map(|s| s.as_mut())
	}
}

impl Default for MbufVec {
	fn default() -> Self {
		Self::new()
	}
}

/// Borrowed window over a burst, handed to code that may only inspect a
/// sub-range of the live handles.
pub struct MbufVecView<'a> {
	slots: &'a [Option<Mbuf>],
}

impl<'a> MbufVecView<'a> {
	pub fn new(vec: &'a MbufVec) -> Self {
		Self {
			slots: &vec.slots[vec.head..vec.tail],
		}
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.slots.len()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.slots.is_empty()
	}

	#[inline]
	pub fn get(&self, idx: usize) -> Option<&Mbuf> {
		self.slots.get(idx).and_then(|s| s.as_ref())
	}

	pub fn iter(&self) -> impl Iterator<Item = &Mbuf> {
		self.slots.iter().filter_map(|s| s.as_ref())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::apis::{Mempool, MempoolConfig};
	use std::sync::Arc;

	fn pool() -> Arc<Mempool> {
		Mempool::new(
			"burst-test",
			MempoolConfig {
				capacity: 64,
				cache_size: 0,
				dataroom: 256,
				headroom: 0,
			},
		)
		.unwrap()
	}

	fn filled(mp: &Mempool, n: usize) -> MbufVec {
		let mut vec = MbufVec::with_capacity(BURST_SIZE);
		mp.alloc_bulk(&mut vec, n).unwrap();
		vec
	}

	#[test]
	fn cursor_invariants() {
		let mp = pool();
		let mut vec = filled(&mp, 8);
		assert_eq!(vec.len(), 8);

		vec.free_front(3);
		assert_eq!(vec.len(), 5);
		vec.free_back(2);
		assert_eq!(vec.len(), 3);
		assert!(vec.capacity() >= vec.len());
		vec.free();
		assert_eq!(vec.len(), 0);
		assert_eq!(mp.in_use(), 0);
	}

	#[test]
	fn repack_drops_null_slots() {
		let mp = pool();
		let mut vec = filled(&mp, 6);
		vec.free_slot(1);
		vec.free_slot(4);
		vec.repack();
		assert_eq!(vec.len(), 4);
		assert_eq!(mp.in_use(), 4);
		for idx in 0..4 {
			assert!(vec.slot(idx).is_some());
		}
	}

	#[test]
	fn saturating_bounds() {
		let mp = pool();
		let mut vec = filled(&mp, 4);
		vec.free_front(100);
		assert_eq!(vec.len(), 0);
		let mut vec = filled(&mp, 4);
		vec.free_back(100);
		assert_eq!(vec.len(), 0);
	}

	#[test]
	fn drop_frees_live_handles() {
		let mp = pool();
		{
			let _vec = filled(&mp, 10);
			assert_eq!(mp.in_use(), 10);
		}
		assert_eq!(mp.in_use(), 0);
	}

	#[test]
	fn grow_tail_after_external_fill() {
		let mp = pool();
		let mut vec = MbufVec::with_capacity(8);
		{
			let tail = vec.tail_slots();
			tail[0] = Some(mp.alloc().unwrap());
			tail[1] = Some(mp.alloc().unwrap());
		}
		assert_eq!(vec.grow_tail(2), 2);
		assert_eq!(vec.len(), 2);
	}

	#[test]
	fn push_rejects_when_full() {
		let mp = pool();
		let mut vec = MbufVec::with_capacity(2);
		assert!(vec.push(mp.alloc().unwrap()).is_ok());
		assert!(vec.push(mp.alloc().unwrap()).is_ok());
		assert!(vec.push(mp.alloc().unwrap()).is_err());
	}
}
