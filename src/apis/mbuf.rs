//! The Mbuf structure is a move-only handle to one packet buffer inside a
//! Mempool arena. Each buffer carries headroom, a data area and a private
//! metadata region that the processor chains annotate.

use std::{
	fmt,
	marker::{Send, Sync},
	mem,
	ptr::NonNull,
	slice,
	sync::atomic::AtomicU32,
};

use super::{BufError, Mempool, PoolError};
use crate::flowtable::FlowRecord;

/// Destination endpoint sentinel: replicate to every active endpoint
/// except the source.
pub const PORT_ID_BROADCAST: u16 = 0xFFFF;
/// Destination endpoint sentinel: free the packet at the distributor.
pub const PORT_ID_DROP: u16 = 0xFFFE;
/// Destination endpoint sentinel: no decision has been taken.
pub const PORT_ID_IGNORE: u16 = 0xFFFD;

/// Private per-packet metadata, stored in the buffer's private region.
/// Aligned to a cache line so neighbouring buffers never share one.
#[repr(C, align(64))]
pub struct PacketInfo {
	/// Flow record this packet was classified into, or null. The pointer
	/// stays valid while the owning worker is between two flow table
	/// checkpoints; it must not be carried across one.
	pub flow_info: *const FlowRecord,
	pub src_endpoint_id: u16,
	pub dst_endpoint_id: u16,
	pub l2_len: u16,
	pub l3_offset: u16,
	pub l4_offset: u16,
	pub ether_type: u16,
	/// VLAN tag control information, 0 if the frame is untagged.
	pub vlan_tci: u16,
	pub ipv4_total_len: u16,
	pub ipv4_next_proto: u8,
	pub is_fragment: bool,
	pub new_flow: bool,
}

impl PacketInfo {
	pub(crate) fn reset(&mut self) {
		self.flow_info = std::ptr::null();
		self.src_endpoint_id = 0;
		self.dst_endpoint_id = PORT_ID_IGNORE;
		self.l2_len = 0;
		self.l3_offset = 0;
		self.l4_offset = 0;
		self.ether_type = 0;
		self.vlan_tci = 0;
		self.ipv4_total_len = 0;
		self.ipv4_next_proto = 0;
		self.is_fragment = false;
		self.new_flow = false;
	}

	/// Returns the flow record reference, if the packet was classified.
	#[inline]
	pub fn flow(&self) -> Option<&FlowRecord> {
		unsafe { self.flow_info.as_ref() }
	}
}

/// In-arena buffer header. The data region of `buf_len` bytes follows
/// directly behind it; `Mempool` lays buffers out at a fixed stride.
#[repr(C, align(64))]
pub(crate) struct PktHdr {
	/// Owning pool, used to return the buffer on drop.
	pub(crate) pool: *const Mempool,
	/// Payload donor when this buffer is a broadcast clone, else null.
	pub(crate) shared: *mut PktHdr,
	/// Number of handles referencing this buffer's payload (itself plus
	/// broadcast clones).
	pub(crate) refcnt: AtomicU32,
	pub(crate) data_off: u16,
	pub(crate) data_len: u16,
	pub(crate) buf_len: u16,
	pub(crate) info: PacketInfo,
}

/// Byte address of the data region that follows a buffer header.
#[inline]
pub(crate) unsafe fn data_region(hdr: *mut PktHdr) -> *mut u8 {
	(hdr as *mut u8).add(mem::size_of::<PktHdr>())
}

pub struct Mbuf {
	raw: NonNull<PktHdr>,
}

unsafe impl Send for Mbuf {}
unsafe impl Sync for Mbuf {}

impl Mbuf {
	/// Allocates a fresh buffer from the pool.
	pub fn new(mp: &Mempool) -> Result<Self, PoolError> {
		mp.alloc()
	}

	/// Allocates a buffer and fills its data area from a byte slice.
	pub fn from_bytes(data: &[u8], mp: &Mempool) -> Result<Self, PoolError> {
		let mut mbuf = mp.alloc()?;
		mbuf.append(data).map_err(|_| PoolError::BadConfig("frame larger than dataroom"))?;
		Ok(mbuf)
	}

	#[inline]
	pub(crate) unsafe fn from_hdr(raw: NonNull<PktHdr>) -> Self {
		Mbuf { raw }
	}

	#[inline]
	pub(crate) fn hdr(&self) -> &PktHdr {
		unsafe { self.raw.as_ref() }
	}

	#[inline]
	fn hdr_mut(&mut self) -> &mut PktHdr {
		unsafe { self.raw.as_mut() }
	}

	/// Header that owns the payload bytes: the buffer itself, or its
	/// donor when this handle is a broadcast clone.
	#[inline]
	pub(crate) fn payload_owner(&self) -> *mut PktHdr {
		let h = self.hdr();
		if h.shared.is_null() {
			self.raw.as_ptr()
		} else {
			h.shared
		}
	}

	/// Acquires the raw header pointer, consuming the handle without
	/// freeing the buffer. Pair with `from_raw`, otherwise the buffer
	/// leaks.
	#[inline]
	pub(crate) fn into_raw(self) -> *mut PktHdr {
		let ptr = self.raw.as_ptr();
		mem::forget(self);
		ptr
	}

	/// Rebuilds a handle from a pointer produced by `into_raw`.
	#[inline]
	pub(crate) unsafe fn from_raw(ptr: *mut PktHdr) -> Self {
		Mbuf {
			raw: NonNull::new_unchecked(ptr),
		}
	}

	/// Amount of data stored in the buffer.
	#[inline]
	pub fn data_len(&self) -> usize {
		self.hdr().data_len as usize
	}

	/// Bytes left between the end of data and the end of the buffer.
	#[inline]
	pub fn tailroom(&self) -> usize {
		let h = self.hdr();
		(h.buf_len - h.data_off - h.data_len) as usize
	}

	#[inline]
	fn data_ptr(&self) -> *mut u8 {
		let owner = self.payload_owner();
		unsafe { data_region(owner).add(self.hdr().data_off as usize) }
	}

	/// The packet bytes.
	#[inline]
	pub fn data(&self) -> &[u8] {
		unsafe { slice::from_raw_parts(self.data_ptr(), self.data_len()) }
	}

	/// Mutable access to the packet bytes. Refused while broadcast clones
	/// share the payload.
	#[inline]
	pub fn data_mut(&mut self) -> Result<&mut [u8], BufError> {
		if !self.payload_shared() {
			Ok(unsafe { slice::from_raw_parts_mut(self.data_ptr(), self.data_len()) })
		} else {
			Err(BufError::Shared)
		}
	}

	/// True while more than one handle references the payload.
	#[inline]
	pub fn payload_shared(&self) -> bool {
		let owner = self.payload_owner();
		!self.hdr().shared.is_null()
			|| unsafe { (*owner).refcnt.load(std::sync::atomic::Ordering::Acquire) } > 1
	}

	/// Appends bytes at the end of the data area.
	pub fn append(&mut self, bytes: &[u8]) -> Result<(), BufError> {
		if self.payload_shared() {
			return Err(BufError::Shared);
		}
		if bytes.len() > self.tailroom() {
			return Err(BufError::OutOfBuffer(bytes.len(), self.tailroom()));
		}
		unsafe {
			let dst = self.data_ptr().add(self.data_len());
			std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
		}
		self.hdr_mut().data_len += bytes.len() as u16;
		Ok(())
	}

	/// Truncates the data area to `to_len` bytes.
	pub fn truncate(&mut self, to_len: usize) -> Result<(), BufError> {
		if to_len >= self.data_len() {
			return Err(BufError::NotResized);
		}
		self.hdr_mut().data_len = to_len as u16;
		Ok(())
	}

	/// The private metadata region.
	#[inline]
	pub fn pkt_info(&self) -> &PacketInfo {
		&self.hdr().info
	}

	/// Mutable access to the private metadata region.
	#[inline]
	pub fn pkt_info_mut(&mut self) -> &mut PacketInfo {
		&mut self.hdr_mut().info
	}

	/// Creates an independent handle that shares this buffer's payload.
	/// The clone gets its own private metadata (copied from this one) and
	/// holds a reference on the payload; the payload is returned to the
	/// pool once the last referencing handle is dropped.
	pub fn clone_for_broadcast(&self, mp: &Mempool) -> Result<Mbuf, PoolError> {
		let mut clone = mp.alloc()?;
		let owner = self.payload_owner();
		unsafe {
			(*owner).refcnt.fetch_add(1, std::sync::atomic::Ordering::AcqRel);
		}
		let h = clone.hdr_mut();
		h.shared = owner;
		h.data_off = self.hdr().data_off;
		h.data_len = self.hdr().data_len;
		*clone.pkt_info_mut() = unsafe { std::ptr::read(&self.hdr().info) };
		Ok(clone)
	}
}

impl fmt::Debug for Mbuf {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let h = self.hdr();
		f.debug_struct(&format!("mbuf@{:p}", self.raw))
			.field("buf_len", &h.buf_len)
			.field("data_len", &h.data_len)
			.field("data_off", &h.data_off)
			.field("cloned", &!h.shared.is_null())
			.finish()
	}
}

impl Drop for Mbuf {
	fn drop(&mut self) {
		let pool = self.hdr().pool;
		unsafe { (*pool).free_mbuf(self.raw) };
	}
}
