//! Endpoints are the logical ports packets enter and leave through. The
//! device behind an endpoint is either a real NIC driver implementing
//! EthDev or a ring-backed loopback used for software ports and tests.

use std::sync::Arc;

use thiserror::Error;

use crate::apis::{MbufVec, Ring, RingError};

/// Hard bound on endpoints per program, well below the destination id
/// sentinel space.
pub const MAX_ENDPOINTS: usize = 64;

#[derive(Error, Debug)]
pub enum PortError {
	#[error("port refused to start: {}", _0)]
	StartFailed(String),
}

/// Burst-oriented NIC driver surface. Implementations wrap the actual
/// device access (descriptor rings, hugepage buffers) and are free to
/// return short counts under pressure; they must not block.
pub trait EthDev: Send + Sync {
	/// Pulls up to the burst's free tail worth of packets from a receive
	/// queue. Returns the number received.
	fn rx_burst(&self, queue_id: u16, vec: &mut MbufVec) -> u16;

	/// Offers the burst to a transmit queue, consuming the handles it
	/// accepts from the front. Returns the number transmitted; refused
	/// packets stay in the burst.
	fn tx_burst(&self, queue_id: u16, vec: &mut MbufVec) -> u16;

	/// NUMA node the device memory is attached to.
	fn socket_id(&self) -> i32;

	fn start(&self) -> Result<(), PortError>;

	fn stop(&self);
}

/// Software port backed by two rings. What the runtime transmits lands in
/// the tx ring; whatever is injected into the rx ring is received. The
/// matching LoopbackHandle gives the outside (tests, generators) the
/// other end of both rings.
pub struct LoopbackDev {
	rx: Arc<Ring>,
	tx: Arc<Ring>,
	socket_id: i32,
}

impl LoopbackDev {
	pub fn new(capacity: usize) -> Result<(Self, LoopbackHandle), RingError> {
		let rx = Arc::new(Ring::new(capacity, 0)?);
		let tx = Arc::new(Ring::new(capacity, 0)?);
		let handle = LoopbackHandle {
			rx: Arc::clone(&rx),
			tx: Arc::clone(&tx),
		};
		Ok((
			Self {
				rx,
				tx,
				socket_id: 0,
			},
			handle,
		))
	}

	fn handle(&self) -> LoopbackHandle {
		LoopbackHandle {
			rx: Arc::clone(&self.rx),
			tx: Arc::clone(&self.tx),
		}
	}
}

// A loopback can also stand in for a NIC driver, e.g. when bound on the
// command line as a device.
impl EthDev for LoopbackDev {
	fn rx_burst(&self, _queue_id: u16, vec: &mut MbufVec) -> u16 {
		self.rx.dequeue_burst(vec) as u16
	}

	fn tx_burst(&self, _queue_id: u16, vec: &mut MbufVec) -> u16 {
		self.tx.enqueue_burst(vec) as u16
	}

	fn socket_id(&self) -> i32 {
		self.socket_id
	}

	fn start(&self) -> Result<(), PortError> {
		Ok(())
	}

	fn stop(&self) {}
}

/// Outside end of a loopback port.
#[derive(Clone)]
pub struct LoopbackHandle {
	rx: Arc<Ring>,
	tx: Arc<Ring>,
}

impl LoopbackHandle {
	/// Offers packets to the port's receive side. Returns how many were
	/// accepted; the rest stay in the burst.
	pub fn inject(&self, vec: &mut MbufVec) -> usize {
		self.rx.enqueue_burst(vec)
	}

	/// Collects packets the runtime transmitted on this port.
	pub fn drain(&self, vec: &mut MbufVec) -> usize {
		self.tx.dequeue_burst(vec)
	}

	/// Number of transmitted packets waiting to be drained.
	pub fn pending_tx(&self) -> usize {
		self.tx.count()
	}
}

pub enum EndpointKind {
	Eth(Box<dyn EthDev>),
	Loopback(LoopbackDev),
}

/// A logical port with an id that packets carry in their metadata.
pub struct Endpoint {
	name: String,
	id: u16,
	kind: EndpointKind,
}

impl Endpoint {
	pub fn new(name: String, id: u16, kind: EndpointKind) -> Self {
		Self { name, id, kind }
	}

	#[inline]
	pub fn name(&self) -> &str {
		&self.name
	}

	#[inline]
	pub fn id(&self) -> u16 {
		self.id
	}

	pub fn socket_id(&self) -> i32 {
		match &self.kind {
			EndpointKind::Eth(dev) => dev.socket_id(),
			EndpointKind::Loopback(dev) => dev.socket_id,
		}
	}

	pub fn start(&self) -> Result<(), PortError> {
		match &self.kind {
			EndpointKind::Eth(dev) => dev.start(),
			EndpointKind::Loopback(_) => Ok(()),
		}
	}

	pub fn stop(&self) {
		if let EndpointKind::Eth(dev) = &self.kind {
			dev.stop();
		}
	}

	/// Grows the burst tail with received packets.
	#[inline]
	pub fn rx_burst(&self, vec: &mut MbufVec) -> u16 {
		match &self.kind {
			EndpointKind::Eth(dev) => dev.rx_burst(0, vec),
			EndpointKind::Loopback(dev) => dev.rx.dequeue_burst(vec) as u16,
		}
	}

	/// Consumes accepted packets from the burst front; refused ones stay.
	#[inline]
	pub fn tx_burst(&self, vec: &mut MbufVec) -> u16 {
		match &self.kind {
			EndpointKind::Eth(dev) => dev.tx_burst(0, vec),
			EndpointKind::Loopback(dev) => dev.tx.enqueue_burst(vec) as u16,
		}
	}

	/// The outside end of a loopback port, None for device-backed ones.
	pub fn loopback_handle(&self) -> Option<LoopbackHandle> {
		match &self.kind {
			EndpointKind::Loopback(dev) => Some(dev.handle()),
			EndpointKind::Eth(_) => None,
		}
	}
}
