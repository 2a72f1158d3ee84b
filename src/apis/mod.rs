//! This module defines the core dataplane structures: Mbuf, Mempool,
//! MbufVec and Ring, along with the errors they surface
//!
//! These structures carry packets between endpoint and distributor workers
//! without locks on the hot path

mod burst;
mod mbuf;
mod mempool;
mod memring;

pub use burst::*;
pub use mbuf::*;
pub use mempool::*;
pub use memring::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
	#[error("buffer pool exhausted")]
	Exhausted,
	#[error("bad pool configuration: {}", _0)]
	BadConfig(&'static str),
}

#[derive(Error, Debug)]
pub enum BufError {
	/// The offset exceeds the buffer length
	#[error("Offset {} exceeds the buffer length {}", _0, _1)]
	BadOffset(usize, usize),

	/// The write exceeds the remaining buffer length
	#[error("Write of {} bytes exceeds the remaining buffer length {}", _0, _1)]
	OutOfBuffer(usize, usize),

	/// The buffer is not resized
	#[error("Buffer is not resized")]
	NotResized,

	/// The payload is shared with broadcast clones and cannot be mutated
	#[error("Buffer payload is shared")]
	Shared,
}

#[derive(Error, Debug)]
pub enum RingError {
	#[error("ring capacity {} is not a power of two", _0)]
	BadCapacity(usize),
}
