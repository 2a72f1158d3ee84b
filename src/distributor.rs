//! The distributor fabric: one ring per (destination endpoint, queue)
//! that endpoint workers push classified packets into and distributor
//! workers drain towards transmission
//!
//! Broadcast packets are cloned once per destination; the original is
//! always freed after fan-out. A full ring drops the packet and counts
//! it, the fabric itself never blocks.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::apis::{
	MbufVec, Mempool, Ring, RingError, PORT_ID_BROADCAST, PORT_ID_DROP, RING_F_SC_DEQ, RING_F_SP_ENQ,
};

pub struct FlowDistributor {
	rings: Vec<Ring>,
	max_ports: usize,
	num_queues: usize,
	num_active_ports: usize,
	ring_full_drops: AtomicU64,
	clone_failures: AtomicU64,
	sentinel_drops: AtomicU64,
}

impl FlowDistributor {
	/// Builds the fabric with `max_ports * num_queues` rings. When the
	/// final core assignment has a single endpoint worker pushing and a
	/// single distributor draining, pass `single_producer`/
	/// `single_consumer` to strip the rings down to their fast paths.
	pub fn new(
		max_ports: usize,
		num_queues: usize,
		ring_capacity: usize,
		single_producer: bool,
		single_consumer: bool,
	) -> Result<Self, RingError> {
		let mut flags = 0;
		if single_producer {
			flags |= RING_F_SP_ENQ;
		}
		if single_consumer {
			flags |= RING_F_SC_DEQ;
		}
		let mut rings = Vec::with_capacity(max_ports * num_queues);
		for _ in 0..max_ports * num_queues {
			rings.push(Ring::new(ring_capacity, flags)?);
		}
		Ok(Self {
			rings,
			max_ports,
			num_queues,
			num_active_ports: 0,
			ring_full_drops: AtomicU64::new(0),
			clone_failures: AtomicU64::new(0),
			sentinel_drops: AtomicU64::new(0),
		})
	}

	pub fn set_num_active_ports(&mut self, num: usize) {
		debug_assert!(num <= self.max_ports);
		self.num_active_ports = num;
	}

	#[inline]
	pub fn num_active_ports(&self) -> usize {
		self.num_active_ports
	}

	/// Packets dropped because a destination ring was full.
	pub fn ring_full_drops(&self) -> u64 {
		self.ring_full_drops.load(Ordering::Relaxed)
	}

	/// Broadcast clones that could not be allocated.
	pub fn clone_failures(&self) -> u64 {
		self.clone_failures.load(Ordering::Relaxed)
	}

	/// Packets freed because their destination was the drop sentinel, was
	/// never decided, or named a port outside the active range.
	pub fn sentinel_drops(&self) -> u64 {
		self.sentinel_drops.load(Ordering::Relaxed)
	}

	#[inline]
	fn ring(&self, port: usize, queue: usize) -> &Ring {
		&self.rings[port * self.num_queues + queue]
	}

	/// Routes every packet of the burst to its destination ring and
	/// leaves the burst empty.
	pub fn push_packets(&self, src_port: u16, queue: usize, vec: &mut MbufVec, mempool: &Mempool) {
		let count = vec.len();
		for idx in 0..count {
			let Some(mbuf) = vec.take_slot(idx) else {
				continue;
			};
			let dst = mbuf.pkt_info().dst_endpoint_id;
			if dst == PORT_ID_BROADCAST {
				for port in 0..self.num_active_ports {
					if port as u16 == src_port {
						continue;
					}
					match mbuf.clone_for_broadcast(mempool) {
						Ok(clone) => {
							if self.ring(port, queue).enqueue(clone).is_err() {
								self.ring_full_drops.fetch_add(1, Ordering::Relaxed);
							}
						}
						Err(_) => {
							self.clone_failures.fetch_add(1, Ordering::Relaxed);
						}
					}
				}
				// The original was replicated, not routed.
				drop(mbuf);
			} else if (dst as usize) < self.num_active_ports {
				if self.ring(dst as usize, queue).enqueue(mbuf).is_err() {
					self.ring_full_drops.fetch_add(1, Ordering::Relaxed);
				}
			} else {
				if dst != PORT_ID_DROP {
					self.sentinel_drops.fetch_add(1, Ordering::Relaxed);
				}
				drop(mbuf);
			}
		}
		vec.consume();
	}

	/// Fills the burst tail from one destination ring. Returns the number
	/// of packets pulled.
	pub fn pull_packets(&self, port: u16, queue: usize, vec: &mut MbufVec) -> usize {
		self.ring(port as usize, queue).dequeue_burst(vec)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::apis::{Mbuf, MempoolConfig, PORT_ID_IGNORE};
	use std::sync::Arc;

	fn pool(capacity: usize) -> Arc<Mempool> {
		Mempool::new(
			"dist-test",
			MempoolConfig {
				capacity,
				cache_size: 0,
				dataroom: 256,
				headroom: 0,
			},
		)
		.unwrap()
	}

	fn packet_to(mp: &Mempool, src: u16, dst: u16) -> Mbuf {
		let mut m = Mbuf::from_bytes(&[0xab], mp).unwrap();
		let info = m.pkt_info_mut();
		info.src_endpoint_id = src;
		info.dst_endpoint_id = dst;
		m
	}

	#[test]
	fn unicast_lands_in_the_destination_ring() {
		let mp = pool(32);
		let mut dist = FlowDistributor::new(4, 1, 16, false, false).unwrap();
		dist.set_num_active_ports(4);

		let mut burst = MbufVec::new();
		burst.push(packet_to(&mp, 0, 2)).unwrap();
		dist.push_packets(0, 0, &mut burst, &mp);
		assert!(burst.is_empty());

		let mut out = MbufVec::new();
		assert_eq!(dist.pull_packets(2, 0, &mut out), 1);
		assert_eq!(dist.pull_packets(1, 0, &mut out), 0);
	}

	#[test]
	fn broadcast_clones_to_everyone_but_the_source() {
		let mp = pool(32);
		let mut dist = FlowDistributor::new(4, 1, 16, false, false).unwrap();
		dist.set_num_active_ports(4);

		let mut burst = MbufVec::new();
		burst.push(packet_to(&mp, 0, PORT_ID_BROADCAST)).unwrap();
		dist.push_packets(0, 0, &mut burst, &mp);

		let mut out = MbufVec::new();
		assert_eq!(dist.pull_packets(0, 0, &mut out), 0);
		for port in 1..4 {
			assert_eq!(dist.pull_packets(port, 0, &mut out), 1);
		}
		assert_eq!(out.len(), 3);
		out.free();
		assert_eq!(mp.in_use(), 0);
	}

	#[test]
	fn drop_sentinel_frees_the_packet() {
		let mp = pool(8);
		let mut dist = FlowDistributor::new(2, 1, 16, false, false).unwrap();
		dist.set_num_active_ports(2);

		let mut burst = MbufVec::new();
		burst.push(packet_to(&mp, 0, PORT_ID_DROP)).unwrap();
		burst.push(packet_to(&mp, 0, PORT_ID_IGNORE)).unwrap();
		dist.push_packets(0, 0, &mut burst, &mp);

		assert_eq!(mp.in_use(), 0);
		assert_eq!(dist.sentinel_drops(), 1);
	}

	#[test]
	fn full_rings_drop_and_count() {
		let mp = pool(32);
		let mut dist = FlowDistributor::new(2, 1, 4, false, false).unwrap();
		dist.set_num_active_ports(2);

		let mut burst = MbufVec::new();
		for _ in 0..6 {
			burst.push(packet_to(&mp, 0, 1)).unwrap();
		}
		dist.push_packets(0, 0, &mut burst, &mp);
		assert_eq!(dist.ring_full_drops(), 2);

		let mut out = MbufVec::new();
		assert_eq!(dist.pull_packets(1, 0, &mut out), 4);
		out.free();
		assert_eq!(mp.in_use(), 0);
	}
}
