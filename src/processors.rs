//! Built-in pipeline processors and the class-name registry that the
//! program loader resolves against
//!
//! The validator annotates packet metadata from the L2..L4 headers, the
//! classifier correlates packets into flow records and the filter applies
//! a declarative routing rule with an optional sticky per-flow decision.

use std::{collections::HashMap, net::Ipv4Addr, sync::atomic::Ordering, sync::Arc};

use etherparse::{InternetSlice, LinkSlice, SlicedPacket, VlanSlice};

use crate::apis::{MbufVec, Mempool, PORT_ID_BROADCAST, PORT_ID_DROP, PORT_ID_IGNORE};
use crate::flowtable::{FlowHash, FlowTable};
use crate::pipeline::{FlowProcessor, ProcContext, ProcParams};
use crate::program::ProgramError;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const ETHER_TYPE_ARP: u16 = 0x0806;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

/// Constructor closure stored in the registry for each processor class.
pub type ProcCtor =
	Box<dyn Fn(String, &Arc<Mempool>, &Arc<FlowTable>) -> Box<dyn FlowProcessor> + Send + Sync>;

/// Maps processor class names to constructors. Populated with the
/// built-in classes at startup; embedders may register their own.
pub struct ProcessorRegistry {
	ctors: HashMap<String, ProcCtor>,
}

impl ProcessorRegistry {
	pub fn new() -> Self {
		Self {
			ctors: HashMap::new(),
		}
	}

	pub fn with_builtins() -> Self {
		let mut registry = Self::new();
		registry.register("ingress_packet_validator", |name, _mp, _ft| {
			Box::new(IngressPacketValidator::new(name))
		});
		registry.register("flow_classifier", |name, _mp, ft| {
			Box::new(FlowClassifier::new(name, Arc::clone(ft)))
		});
		registry.register("packet_filter", |name, _mp, _ft| {
			Box::new(PacketFilter::new(name))
		});
		registry
	}

	pub fn register<F>(&mut self, class: &str, ctor: F)
	where
		F: Fn(String, &Arc<Mempool>, &Arc<FlowTable>) -> Box<dyn FlowProcessor> + Send + Sync + 'static,
	{
		self.ctors.insert(class.to_owned(), Box::new(ctor));
	}

	pub fn create(
		&self,
		class: &str,
		instance: &str,
		params: &ProcParams,
		mempool: &Arc<Mempool>,
		flowtable: &Arc<FlowTable>,
	) -> Result<Box<dyn FlowProcessor>, ProgramError> {
		let ctor = self
			.ctors
			.get(class)
			.ok_or_else(|| ProgramError::UnknownClass(class.to_owned()))?;
		let mut proc = ctor(instance.to_owned(), mempool, flowtable);
		proc.init(params)?;
		Ok(proc)
	}

	pub fn classes(&self) -> Vec<&str> {
		self.ctors.keys().map(|k| k.as_str()).collect()
	}
}

impl Default for ProcessorRegistry {
	fn default() -> Self {
		Self::with_builtins()
	}
}

struct ParsedHeaders {
	l2_len: u16,
	vlan_tci: u16,
	ether_type: u16,
	ipv4: Option<ParsedIpv4>,
}

struct ParsedIpv4 {
	next_proto: u8,
	total_len: u16,
	header_len: u16,
	is_fragment: bool,
}

fn parse_headers(data: &[u8]) -> Option<ParsedHeaders> {
	let sliced = SlicedPacket::from_ethernet(data).ok()?;
	let link = match sliced.link {
		Some(LinkSlice::Ethernet2(e)) => e,
		None => return None,
	};
	let (l2_len, vlan_tci, ether_type) = match &sliced.vlan {
		None => (14u16, 0u16, link.ether_type()),
		Some(VlanSlice::SingleVlan(v)) => {
			let tci = ((v.priority_code_point() as u16) << 13)
				| ((v.drop_eligible_indicator() as u16) << 12)
				| v.vlan_identifier();
			(18u16, tci, v.ether_type())
		}
		// Stacked tags are not routed here.
		Some(VlanSlice::DoubleVlan(_)) => return None,
	};
	let ipv4 = match &sliced.ip {
		Some(InternetSlice::Ipv4(header, _ext)) => Some(ParsedIpv4 {
			next_proto: header.protocol(),
			total_len: header.total_len(),
			header_len: header.slice().len() as u16,
			is_fragment: header.is_fragmenting_payload(),
		}),
		_ => None,
	};
	Some(ParsedHeaders {
		l2_len,
		vlan_tci,
		ether_type,
		ipv4,
	})
}

/// First RX stage: stamps source/destination endpoint defaults and the
/// header offsets every later stage relies on. Frames that do not parse
/// are freed and the burst is repacked.
pub struct IngressPacketValidator {
	name: String,
}

impl IngressPacketValidator {
	pub fn new(name: String) -> Self {
		Self { name }
	}
}

impl FlowProcessor for IngressPacketValidator {
	fn process(&mut self, vec: &mut MbufVec, ctx: &ProcContext) -> usize {
		let mut dropped = false;
		for idx in 0..vec.len() {
			let parsed = match vec.slot(idx) {
				Some(mbuf) => parse_headers(mbuf.data()),
				None => continue,
			};
			let Some(headers) = parsed else {
				vec.free_slot(idx);
				dropped = true;
				continue;
			};
			let info = vec.slot_mut(idx).expect("slot checked above").pkt_info_mut();
			info.new_flow = false;
			info.src_endpoint_id = ctx.endpoint_id;
			info.dst_endpoint_id = PORT_ID_BROADCAST;
			info.l2_len = headers.l2_len;
			info.vlan_tci = headers.vlan_tci;
			info.ether_type = headers.ether_type;
			info.l3_offset = headers.l2_len;
			if let Some(ipv4) = headers.ipv4 {
				info.l4_offset = headers.l2_len + ipv4.header_len;
				info.ipv4_next_proto = ipv4.next_proto;
				info.ipv4_total_len = ipv4.total_len;
				info.is_fragment = ipv4.is_fragment;
			} else {
				info.l4_offset = headers.l2_len;
			}
		}
		if dropped {
			vec.repack();
		}
		vec.len()
	}

	fn name(&self) -> &str {
		&self.name
	}
}

#[inline]
fn fnv1a(hash: &mut u64, bytes: &[u8]) {
	const PRIME: u64 = 0x100_0000_01b3;
	for &b in bytes {
		*hash ^= b as u64;
		*hash = hash.wrapping_mul(PRIME);
	}
}

/// Flow fingerprint over the IPv4 5-tuple. Ports are zero for fragments
/// and for protocols without them, which degrades those flows to a
/// 3-tuple without affecting the rest.
pub fn flow_hash_ipv4(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, src_port: u16, dst_port: u16) -> FlowHash {
	let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
	fnv1a(&mut hash, &src.octets());
	fnv1a(&mut hash, &dst.octets());
	fnv1a(&mut hash, &[proto]);
	fnv1a(&mut hash, &src_port.to_be_bytes());
	fnv1a(&mut hash, &dst_port.to_be_bytes());
	hash
}

/// Correlates IPv4 packets into flow records. Packets that cannot be
/// classified (non-IPv4, or the record pool is drained) pass through with
/// their flow reference left empty.
pub struct FlowClassifier {
	name: String,
	flowtable: Arc<FlowTable>,
}

impl FlowClassifier {
	pub fn new(name: String, flowtable: Arc<FlowTable>) -> Self {
		Self { name, flowtable }
	}
}

impl FlowProcessor for FlowClassifier {
	fn process(&mut self, vec: &mut MbufVec, _ctx: &ProcContext) -> usize {
		let core = crate::executor::current_worker_slot().unwrap_or(0);
		for mbuf in vec.iter_mut() {
			let data_len = mbuf.data_len();
			let info = mbuf.pkt_info();
			if info.ether_type != ETHER_TYPE_IPV4 {
				continue;
			}
			let l3 = info.l3_offset as usize;
			if l3 + 20 > data_len {
				continue;
			}
			let data = mbuf.data();
			let src_addr = Ipv4Addr::new(data[l3 + 12], data[l3 + 13], data[l3 + 14], data[l3 + 15]);
			let dst_addr = Ipv4Addr::new(data[l3 + 16], data[l3 + 17], data[l3 + 18], data[l3 + 19]);
			let mut ether_dst = [0u8; 6];
			let mut ether_src = [0u8; 6];
			ether_dst.copy_from_slice(&data[0..6]);
			ether_src.copy_from_slice(&data[6..12]);

			let info = mbuf.pkt_info();
			let proto = info.ipv4_next_proto;
			let l4 = info.l4_offset as usize;
			let mut src_port = 0u16;
			let mut dst_port = 0u16;
			let has_ports = (proto == IP_PROTO_UDP || proto == IP_PROTO_TCP)
				&& !info.is_fragment
				&& l4 + 4 <= data_len;
			if has_ports {
				let data = mbuf.data();
				src_port = u16::from_be_bytes([data[l4], data[l4 + 1]]);
				dst_port = u16::from_be_bytes([data[l4 + 2], data[l4 + 3]]);
			}

			let hash = flow_hash_ipv4(src_addr, dst_addr, proto, src_port, dst_port);
			let entry = self.flowtable.get_or_create(core, hash, |record| {
				record.src_addr = src_addr;
				record.dst_addr = dst_addr;
				record.ether_src = ether_src;
				record.ether_dst = ether_dst;
				record.src_port = src_port;
				record.dst_port = dst_port;
				record.next_proto = proto;
			});

			let info = mbuf.pkt_info_mut();
			match entry {
				Some((record, created)) => {
					info.flow_info = record as *const _;
					info.new_flow = created;
				}
				None => {
					info.flow_info = std::ptr::null();
				}
			}
		}
		vec.len()
	}

	fn name(&self) -> &str {
		&self.name
	}
}

enum FilterAction {
	Forward(u16),
	Drop,
	Broadcast,
}

/// Declarative routing rule. Packets matching the configured protocol and
/// destination port get the rule's action applied to their destination
/// endpoint; with `eval_flow_once` the decision is written through to the
/// flow record and replayed for every later packet of the flow.
pub struct PacketFilter {
	name: String,
	action: FilterAction,
	match_proto: Option<u8>,
	match_dst_port: Option<u16>,
	eval_flow_once: bool,
}

impl PacketFilter {
	pub fn new(name: String) -> Self {
		Self {
			name,
			action: FilterAction::Broadcast,
			match_proto: None,
			match_dst_port: None,
			eval_flow_once: false,
		}
	}

	fn parse_proto(&self, value: &str) -> Result<u8, ProgramError> {
		match value {
			"udp" => Ok(IP_PROTO_UDP),
			"tcp" => Ok(IP_PROTO_TCP),
			"icmp" => Ok(IP_PROTO_ICMP),
			other => other.parse::<u8>().map_err(|_| ProgramError::BadParam {
				proc: self.name.clone(),
				param: "match_proto".into(),
				value: other.to_owned(),
			}),
		}
	}
}

impl FlowProcessor for PacketFilter {
	fn init(&mut self, params: &ProcParams) -> Result<(), ProgramError> {
		let action = params.get("action").ok_or_else(|| ProgramError::MissingParam {
			proc: self.name.clone(),
			param: "action".into(),
		})?;
		self.action = match action.as_str() {
			"drop" => FilterAction::Drop,
			"broadcast" => FilterAction::Broadcast,
			"forward" => {
				let dst = params.get("dst_endpoint").ok_or_else(|| ProgramError::MissingParam {
					proc: self.name.clone(),
					param: "dst_endpoint".into(),
				})?;
				let dst = dst.parse::<u16>().map_err(|_| ProgramError::BadParam {
					proc: self.name.clone(),
					param: "dst_endpoint".into(),
					value: dst.clone(),
				})?;
				FilterAction::Forward(dst)
			}
			other => {
				return Err(ProgramError::BadParam {
					proc: self.name.clone(),
					param: "action".into(),
					value: other.to_owned(),
				})
			}
		};
		if let Some(proto) = params.get("match_proto") {
			self.match_proto = Some(self.parse_proto(proto)?);
		}
		if let Some(port) = params.get("match_dst_port") {
			let port = port.parse::<u16>().map_err(|_| ProgramError::BadParam {
				proc: self.name.clone(),
				param: "match_dst_port".into(),
				value: port.clone(),
			})?;
			self.match_dst_port = Some(port);
		}
		if let Some(once) = params.get("eval_flow_once") {
			self.eval_flow_once = once == "true";
		}
		Ok(())
	}

	fn process(&mut self, vec: &mut MbufVec, _ctx: &ProcContext) -> usize {
		for mbuf in vec.iter_mut() {
			let flow_ptr = mbuf.pkt_info().flow_info;
			let flow = unsafe { flow_ptr.as_ref() };
			let info = mbuf.pkt_info_mut();

			if self.eval_flow_once {
				if let Some(flow) = flow {
					let sticky = flow.overwrite_dst_port.load(Ordering::Acquire);
					if sticky != PORT_ID_IGNORE {
						info.dst_endpoint_id = sticky;
						continue;
					}
				}
			}

			let proto_matches = self.match_proto.map_or(true, |p| info.ipv4_next_proto == p);
			let port_matches = self.match_dst_port.map_or(true, |p| {
				flow.map_or(false, |f| f.dst_port == p)
			});
			if proto_matches && port_matches {
				info.dst_endpoint_id = match self.action {
					FilterAction::Drop => PORT_ID_DROP,
					FilterAction::Broadcast => PORT_ID_BROADCAST,
					FilterAction::Forward(dst) => dst,
				};
			}

			if self.eval_flow_once {
				if let Some(flow) = flow {
					flow.overwrite_dst_port.store(info.dst_endpoint_id, Ordering::Release);
				}
			}
		}
		vec.len()
	}

	fn name(&self) -> &str {
		&self.name
	}
}
