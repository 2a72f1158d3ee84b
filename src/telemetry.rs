//! Runtime counters and their export
//!
//! Hot-path counters are either scalar atomics or per-worker cells that
//! aggregate on read, so workers never share a cache line when counting.
//! Snapshots serialize to a flat JSON object and are published as UDP
//! datagrams to a configured collector endpoint.

use std::{
	io,
	net::UdpSocket,
	sync::atomic::{AtomicU64, Ordering},
	time::{SystemTime, UNIX_EPOCH},
};

use crossbeam_utils::CachePadded;
use serde_json::json;

use crate::MAX_WORKERS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricUnit {
	None,
	Packets,
	Bytes,
}

impl MetricUnit {
	pub fn as_str(&self) -> &'static str {
		match self {
			MetricUnit::None => "",
			MetricUnit::Packets => "packets",
			MetricUnit::Bytes => "bytes",
		}
	}
}

/// Single counter updated from any thread.
pub struct ScalarMetric {
	name: &'static str,
	unit: MetricUnit,
	value: AtomicU64,
}

impl ScalarMetric {
	pub fn new(name: &'static str, unit: MetricUnit) -> Self {
		Self {
			name,
			unit,
			value: AtomicU64::new(0),
		}
	}

	#[inline]
	pub fn set(&self, value: u64) {
		self.value.store(value, Ordering::Relaxed);
	}

	#[inline]
	pub fn add(&self, value: u64) {
		self.value.fetch_add(value, Ordering::Relaxed);
	}

	#[inline]
	pub fn inc(&self) {
		self.value.fetch_add(1, Ordering::Relaxed);
	}

	#[inline]
	pub fn get(&self) -> u64 {
		self.value.load(Ordering::Relaxed)
	}

	fn entry(&self) -> MetricEntry {
		MetricEntry {
			label: self.name.to_owned(),
			value: self.get(),
			unit: self.unit,
		}
	}
}

/// Counter with one cell per worker slot; reads aggregate over all cells.
pub struct PerCoreMetric {
	name: &'static str,
	unit: MetricUnit,
	cells: Box<[CachePadded<AtomicU64>]>,
}

impl PerCoreMetric {
	pub fn new(name: &'static str, unit: MetricUnit) -> Self {
		let mut cells = Vec::with_capacity(MAX_WORKERS);
		cells.resize_with(MAX_WORKERS, || CachePadded::new(AtomicU64::new(0)));
		Self {
			name,
			unit,
			cells: cells.into_boxed_slice(),
		}
	}

	#[inline]
	pub fn add(&self, slot: usize, value: u64) {
		self.cells[slot].fetch_add(value, Ordering::Relaxed);
	}

	#[inline]
	pub fn inc(&self, slot: usize) {
		self.cells[slot].fetch_add(1, Ordering::Relaxed);
	}

	pub fn total(&self) -> u64 {
		self.cells.iter().map(|c| c.load(Ordering::Relaxed)).sum()
	}

	fn entry(&self) -> MetricEntry {
		MetricEntry {
			label: self.name.to_owned(),
			value: self.total(),
			unit: self.unit,
		}
	}
}

pub struct MetricEntry {
	pub label: String,
	pub value: u64,
	pub unit: MetricUnit,
}

/// The runtime's standing counters.
pub struct FlowMetrics {
	pub rx_packets: PerCoreMetric,
	pub tx_packets: PerCoreMetric,
	pub rx_bytes: PerCoreMetric,
	pub tx_bytes: PerCoreMetric,
	pub rx_dropped: PerCoreMetric,
	pub total_packets: PerCoreMetric,
	pub total_executions: ScalarMetric,
	pub num_flow_entries: ScalarMetric,
}

impl FlowMetrics {
	pub fn new() -> Self {
		Self {
			rx_packets: PerCoreMetric::new("rx_packets", MetricUnit::Packets),
			tx_packets: PerCoreMetric::new("tx_packets", MetricUnit::Packets),
			rx_bytes: PerCoreMetric::new("rx_bytes", MetricUnit::Bytes),
			tx_bytes: PerCoreMetric::new("tx_bytes", MetricUnit::Bytes),
			rx_dropped: PerCoreMetric::new("rx_dropped", MetricUnit::Packets),
			total_packets: PerCoreMetric::new("total_packets", MetricUnit::Packets),
			total_executions: ScalarMetric::new("total_executions", MetricUnit::None),
			num_flow_entries: ScalarMetric::new("num_flow_entries", MetricUnit::None),
		}
	}

	pub fn entries(&self) -> Vec<MetricEntry> {
		vec![
			self.rx_packets.entry(),
			self.tx_packets.entry(),
			self.rx_bytes.entry(),
			self.tx_bytes.entry(),
			self.rx_dropped.entry(),
			self.total_packets.entry(),
			self.total_executions.entry(),
			self.num_flow_entries.entry(),
		]
	}
}

impl Default for FlowMetrics {
	fn default() -> Self {
		Self::new()
	}
}

/// Serializes counters into the collector wire format.
pub fn snapshot(entries: &[MetricEntry]) -> serde_json::Value {
	let timestamp_us = SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_micros() as u64)
		.unwrap_or(0);
	let values: Vec<serde_json::Value> = entries
		.iter()
		.map(|entry| {
			json!({
				"label": entry.label,
				"value": { "type": "integer", "value": entry.value },
				"unit": entry.unit.as_str(),
			})
		})
		.collect();
	json!({
		"timestamp_us": timestamp_us,
		"type": "root",
		"values": values,
	})
}

/// Publishes snapshots to a collector as JSON datagrams.
pub struct TelemetryDistributor {
	socket: UdpSocket,
	target: String,
}

impl TelemetryDistributor {
	pub fn new(endpoint_addr: &str) -> io::Result<Self> {
		let socket = UdpSocket::bind("0.0.0.0:0")?;
		Ok(Self {
			socket,
			target: endpoint_addr.to_owned(),
		})
	}

	pub fn do_update(&self, snapshot: &serde_json::Value) -> io::Result<()> {
		let payload = serde_json::to_vec(snapshot)?;
		self.socket.send_to(&payload, &self.target)?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn per_core_cells_aggregate() {
		let metric = PerCoreMetric::new("rx_packets", MetricUnit::Packets);
		metric.add(0, 10);
		metric.add(3, 5);
		metric.inc(3);
		assert_eq!(metric.total(), 16);
	}

	#[test]
	fn snapshot_carries_the_wire_shape() {
		let metrics = FlowMetrics::new();
		metrics.rx_packets.add(0, 42);
		metrics.num_flow_entries.set(3);

		let value = snapshot(&metrics.entries());
		assert_eq!(value["type"], "root");
		assert!(value["timestamp_us"].as_u64().unwrap() > 0);

		let values = value["values"].as_array().unwrap();
		let rx = values.iter().find(|v| v["label"] == "rx_packets").unwrap();
		assert_eq!(rx["value"]["value"], 42);
		assert_eq!(rx["value"]["type"], "integer");
		assert_eq!(rx["unit"], "packets");
	}

	#[test]
	fn distributor_sends_datagrams() {
		let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
		receiver.set_nonblocking(false).unwrap();
		let addr = receiver.local_addr().unwrap();

		let telemetry = TelemetryDistributor::new(&addr.to_string()).unwrap();
		let metrics = FlowMetrics::new();
		telemetry.do_update(&snapshot(&metrics.entries())).unwrap();

		let mut buf = [0u8; 4096];
		let (len, _) = receiver.recv_from(&mut buf).unwrap();
		let parsed: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
		assert_eq!(parsed["type"], "root");
	}
}
