//! End-to-end scenarios over loopback endpoints: inject frames on one
//! port, single-step the endpoint and distributor passes, and observe
//! what the peer ports transmit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use etherparse::PacketBuilder;

use flowengine::endpoint::LoopbackHandle;
use flowengine::executor::CoreInfo;
use flowengine::flowtable::{FlowTable, FLOW_BUCKET_WIDTH};
use flowengine::manager::{FlowManager, ManagerOptions};
use flowengine::pipeline::FlowDir;
use flowengine::processors::ProcessorRegistry;
use flowengine::program::{FlowProgramSpec, LoadedProgram, NoEthDevs};
use flowengine::{Mbuf, MbufVec, Mempool, MempoolConfig, PoolError};

struct Harness {
	manager: FlowManager,
	mempool: Arc<Mempool>,
	flowtable: Arc<FlowTable>,
}

fn harness(pool_capacity: usize, flowtable_capacity: usize, ring_capacity: usize, program: &str) -> Harness {
	let mempool = Mempool::new(
		"scenario",
		MempoolConfig {
			capacity: pool_capacity,
			cache_size: 0,
			dataroom: 2048,
			headroom: 128,
		},
	)
	.unwrap();
	let flowtable = Arc::new(FlowTable::new(flowtable_capacity));
	let registry = ProcessorRegistry::with_builtins();
	let spec = FlowProgramSpec::from_toml_str(program).unwrap();
	let loaded = LoadedProgram::assemble(&spec, &registry, &mut NoEthDevs, &mempool, &flowtable).unwrap();

	let manager = FlowManager::new(
		Arc::clone(&mempool),
		Arc::clone(&flowtable),
		ManagerOptions { ring_capacity },
	);
	manager.load(loaded).unwrap();
	Harness {
		manager,
		mempool,
		flowtable,
	}
}

fn udp_frame(mp: &Mempool, src: [u8; 4], sport: u16, dst: [u8; 4], dport: u16, payload_len: usize) -> Mbuf {
	let builder = PacketBuilder::ethernet2([2, 0, 0, 0, 0, 1], [2, 0, 0, 0, 0, 2])
		.ipv4(src, dst, 64)
		.udp(sport, dport);
	let payload = vec![0x5a; payload_len];
	let mut frame = Vec::with_capacity(builder.size(payload.len()));
	builder.write(&mut frame, &payload).unwrap();
	Mbuf::from_bytes(&frame, mp).unwrap()
}

fn inject_udp(handle: &LoopbackHandle, mp: &Mempool, count: usize) {
	let mut injected = 0;
	while injected < count {
		let chunk = (count - injected).min(64);
		let mut vec = MbufVec::with_capacity(64);
		for _ in 0..chunk {
			vec.push(udp_frame(mp, [10, 0, 0, 1], 1000, [10, 0, 0, 2], 2000, 64)).unwrap();
		}
		assert_eq!(handle.inject(&mut vec), chunk);
		injected += chunk;
	}
}

/// Single-steps the dataplane until nothing moves anymore.
fn pump(manager: &FlowManager, endpoint_ids: &[usize]) {
	for _ in 0..256 {
		manager.drive_endpoints(endpoint_ids).unwrap();
		manager.drive_distributor().unwrap();
	}
}

fn drain(handle: &LoopbackHandle) -> usize {
	let mut total = 0;
	let mut vec = MbufVec::with_capacity(64);
	loop {
		let pulled = handle.drain(&mut vec);
		if pulled == 0 {
			break;
		}
		total += pulled;
		vec.free();
	}
	total
}

const SINGLE_PORT: &str = r#"
	name = "single-port"

	[[endpoint]]
	name = "a"
	kind = { type = "loopback", capacity = 1024 }

	[[endpoint.rx]]
	class = "ingress_packet_validator"
	name = "validator0"

	[[endpoint.rx]]
	class = "flow_classifier"
	name = "classifier0"
"#;

#[test]
fn single_endpoint_classifies_and_transmits_nothing() {
	let h = harness(256, 64, 1024, SINGLE_PORT);
	let a = h.manager.loopback_handle("a").unwrap();

	inject_udp(&a, &h.mempool, 32);
	pump(&h.manager, &[0]);

	// One flow for the single 5-tuple; broadcast fan-out excludes the
	// source, so nothing comes back out of the only endpoint.
	assert_eq!(h.flowtable.num_flows(), 1);
	assert_eq!(drain(&a), 0);

	let metrics = h.manager.metrics();
	assert_eq!(metrics.rx_packets.total(), 32);
	assert_eq!(metrics.rx_bytes.total(), 32 * 106);
	assert_eq!(metrics.tx_packets.total(), 0);
	assert_eq!(h.mempool.in_use(), 0);
}

const FORWARD_A_TO_B: &str = r#"
	name = "forward-a-to-b"

	[[endpoint]]
	name = "a"
	kind = { type = "loopback", capacity = 1024 }

	[[endpoint.rx]]
	class = "ingress_packet_validator"
	name = "validator0"

	[[endpoint.rx]]
	class = "flow_classifier"
	name = "classifier0"

	[[endpoint.rx]]
	class = "packet_filter"
	name = "filter0"
	params = { action = "forward", dst_endpoint = "1", match_proto = "udp", eval_flow_once = "true" }

	[[endpoint]]
	name = "b"
	kind = { type = "loopback", capacity = 1024 }
"#;

#[test]
fn sticky_forwarding_moves_every_packet_to_the_peer() {
	let h = harness(4096, 64, 1024, FORWARD_A_TO_B);
	let a = h.manager.loopback_handle("a").unwrap();
	let b = h.manager.loopback_handle("b").unwrap();

	inject_udp(&a, &h.mempool, 1000);

	let mut received = 0;
	let deadline = Instant::now() + Duration::from_secs(10);
	while received < 1000 && Instant::now() < deadline {
		h.manager.drive_endpoints(&[0, 1]).unwrap();
		h.manager.drive_distributor().unwrap();
		received += drain(&b);
	}

	assert_eq!(received, 1000);
	assert_eq!(h.flowtable.num_flows(), 1);
	assert_eq!(drain(&a), 0);
	let entries = h.manager.telemetry_entries();
	let ring_drops = entries.iter().find(|e| e.label == "ring_full_drops").unwrap();
	assert_eq!(ring_drops.value, 0);
	assert_eq!(h.mempool.in_use(), 0);
}

const BROADCAST_FOUR: &str = r#"
	name = "broadcast-four"

	[[endpoint]]
	name = "a"
	kind = { type = "loopback", capacity = 1024 }

	[[endpoint.rx]]
	class = "ingress_packet_validator"
	name = "validator0"

	[[endpoint.rx]]
	class = "flow_classifier"
	name = "classifier0"

	[[endpoint.rx]]
	class = "packet_filter"
	name = "filter0"
	params = { action = "broadcast" }

	[[endpoint]]
	name = "b"
	kind = { type = "loopback", capacity = 1024 }

	[[endpoint]]
	name = "c"
	kind = { type = "loopback", capacity = 1024 }

	[[endpoint]]
	name = "d"
	kind = { type = "loopback", capacity = 1024 }
"#;

#[test]
fn broadcast_reaches_every_peer_but_not_the_source() {
	let h = harness(512, 64, 1024, BROADCAST_FOUR);
	let a = h.manager.loopback_handle("a").unwrap();

	inject_udp(&a, &h.mempool, 10);
	pump(&h.manager, &[0, 1, 2, 3]);

	assert_eq!(drain(&a), 0);
	let mut across_peers = 0;
	for name in ["b", "c", "d"] {
		let handle = h.manager.loopback_handle(name).unwrap();
		let got = drain(&handle);
		assert_eq!(got, 10, "peer {} should see every broadcast frame", name);
		across_peers += got;
	}
	assert_eq!(across_peers, 30);
	assert_eq!(h.mempool.in_use(), 0);
}

#[test]
fn bucket_pressure_displaces_lru_and_reclaims() {
	// Sixteen distinct fingerprints forced into one bucket of width
	// eight: each of the last eight insertions displaces the oldest.
	let table = FlowTable::new(16);
	table.set_core_active(0);
	let num_buckets = (16 / FLOW_BUCKET_WIDTH).next_power_of_two() as u64;

	let mut created_count = 0;
	for k in 1..=16u64 {
		let hash = k * num_buckets;
		let (_, created) = table.get_or_create(0, hash, |_| {}).unwrap();
		if created {
			created_count += 1;
		}
	}
	table.checkpoint(0);

	assert_eq!(created_count, 16);
	assert_eq!(table.num_flows(), FLOW_BUCKET_WIDTH);
}

const DROP_FILTER: &str = r#"
	name = "drop-filter"

	[[endpoint]]
	name = "a"
	kind = { type = "loopback", capacity = 1024 }

	[[endpoint.rx]]
	class = "ingress_packet_validator"
	name = "validator0"

	[[endpoint.rx]]
	class = "flow_classifier"
	name = "classifier0"

	[[endpoint.rx]]
	class = "packet_filter"
	name = "filter0"
	params = { action = "drop", match_proto = "udp" }

	[[endpoint]]
	name = "b"
	kind = { type = "loopback", capacity = 1024 }
"#;

#[test]
fn disabling_a_stage_lets_its_victims_through() {
	let h = harness(512, 64, 1024, DROP_FILTER);
	let a = h.manager.loopback_handle("a").unwrap();
	let b = h.manager.loopback_handle("b").unwrap();

	inject_udp(&a, &h.mempool, 50);
	pump(&h.manager, &[0, 1]);
	assert_eq!(drain(&b), 0);

	h.manager
		.set_stage_active("a", FlowDir::Rx, "filter0", false)
		.unwrap();

	inject_udp(&a, &h.mempool, 100);
	pump(&h.manager, &[0, 1]);
	// With the filter inactive the validator's broadcast default stands.
	assert_eq!(drain(&b), 100);
	assert_eq!(h.mempool.in_use(), 0);
}

#[test]
fn pool_exhaustion_degrades_without_crashing() {
	let h = harness(64, 64, 1024, SINGLE_PORT);
	let a = h.manager.loopback_handle("a").unwrap();

	// A 128 buffer bulk request must fail atomically...
	let mut oversized = MbufVec::with_capacity(128);
	assert!(matches!(
		h.mempool.alloc_bulk(&mut oversized, 128),
		Err(PoolError::Exhausted)
	));
	assert_eq!(oversized.len(), 0);
	assert_eq!(h.mempool.alloc_failures(), 1);

	// ...while the 64 available buffers keep flowing.
	inject_udp(&a, &h.mempool, 64);
	pump(&h.manager, &[0]);
	assert_eq!(h.manager.metrics().rx_packets.total(), 64);
	assert_eq!(h.mempool.in_use(), 0);
}

#[test]
fn threaded_run_forwards_and_conserves_buffers() {
	let h = harness(4096, 64, 1024, FORWARD_A_TO_B);
	let a = h.manager.loopback_handle("a").unwrap();
	let b = h.manager.loopback_handle("b").unwrap();

	let cores = vec![CoreInfo::new(0, 0); 3];
	h.manager.start(&cores, 1).unwrap();

	inject_udp(&a, &h.mempool, 100);

	let mut received = 0;
	let deadline = Instant::now() + Duration::from_secs(10);
	while received < 100 && Instant::now() < deadline {
		received += drain(&b);
		std::thread::sleep(Duration::from_millis(10));
	}
	assert_eq!(received, 100);

	h.manager.stop();
	drain(&a);
	drain(&b);
	assert_eq!(h.mempool.in_use(), 0);
}
