//! Flow program descriptors
//!
//! A flow program names the endpoints and wires an ordered processor
//! chain per endpoint and direction. The external configuration layer
//! produces the serializable spec; `LoadedProgram::assemble` resolves it
//! against the processor registry and a device provider into live
//! endpoints and chains, ready for the manager to adopt.

use std::sync::Arc;

use serde::Deserialize;
use thiserror::Error;

use crate::apis::Mempool;
use crate::endpoint::{Endpoint, EndpointKind, EthDev, LoopbackDev, MAX_ENDPOINTS};
use crate::flowtable::FlowTable;
use crate::pipeline::{ProcChain, ProcParams, MAX_CHAIN_STAGES};
use crate::processors::ProcessorRegistry;

#[derive(Error, Debug)]
pub enum ProgramError {
	#[error("unknown processor class {}", _0)]
	UnknownClass(String),
	#[error("processor {proc}: missing parameter {param}")]
	MissingParam { proc: String, param: String },
	#[error("processor {proc}: invalid value {value:?} for parameter {param}")]
	BadParam { proc: String, param: String, value: String },
	#[error("endpoint {} defined twice", _0)]
	DuplicateEndpoint(String),
	#[error("too many processors in one chain: {} (limit {})", _0, MAX_CHAIN_STAGES)]
	TooManyStages(usize),
	#[error("too many endpoints: {} (limit {})", _0, MAX_ENDPOINTS)]
	TooManyEndpoints(usize),
	#[error("no driver available for device {}", _0)]
	NoDriver(String),
	#[error("bad ring capacity {}", _0)]
	BadRingCapacity(usize),
	#[error("failed to parse flow program: {}", _0)]
	Parse(String),
}

fn default_loopback_capacity() -> usize {
	1024
}

/// Device declaration behind an endpoint.
#[derive(Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum EndpointDecl {
	/// NIC-backed port; the device string is resolved by the embedder's
	/// driver provider.
	Eth { device: String },
	/// Ring-backed software port.
	Loopback {
		#[serde(default = "default_loopback_capacity")]
		capacity: usize,
	},
}

/// One processor instance in a chain.
#[derive(Deserialize, Debug, Clone)]
pub struct ProcSpec {
	pub class: String,
	pub name: String,
	#[serde(default)]
	pub params: ProcParams,
}

#[derive(Deserialize, Debug, Clone)]
pub struct EndpointSpec {
	pub name: String,
	pub kind: EndpointDecl,
	#[serde(default)]
	pub rx: Vec<ProcSpec>,
	#[serde(default)]
	pub tx: Vec<ProcSpec>,
}

/// Serializable flow program, typically loaded from a TOML document.
#[derive(Deserialize, Debug, Clone)]
pub struct FlowProgramSpec {
	pub name: String,
	#[serde(default, rename = "endpoint")]
	pub endpoints: Vec<EndpointSpec>,
}

impl FlowProgramSpec {
	pub fn from_toml_str(input: &str) -> Result<Self, ProgramError> {
		toml::from_str(input).map_err(|e| ProgramError::Parse(e.to_string()))
	}
}

/// Resolves device strings from `EndpointDecl::Eth` into drivers.
pub trait EthDevProvider {
	fn provide(&mut self, endpoint: &str, device: &str) -> Result<Box<dyn EthDev>, ProgramError>;
}

/// Provider for programs without NIC-backed endpoints.
pub struct NoEthDevs;

impl EthDevProvider for NoEthDevs {
	fn provide(&mut self, _endpoint: &str, device: &str) -> Result<Box<dyn EthDev>, ProgramError> {
		Err(ProgramError::NoDriver(device.to_owned()))
	}
}

pub(crate) struct AssembledEndpoint {
	pub(crate) endpoint: Endpoint,
	pub(crate) rx_chain: ProcChain,
	pub(crate) tx_chain: ProcChain,
}

/// A fully resolved flow program: endpoints constructed, processor chains
/// built and initialized. Frozen from here on; the manager only toggles
/// stage active bits.
pub struct LoadedProgram {
	pub(crate) name: String,
	pub(crate) endpoints: Vec<AssembledEndpoint>,
}

impl LoadedProgram {
	pub fn assemble(
		spec: &FlowProgramSpec,
		registry: &ProcessorRegistry,
		devices: &mut dyn EthDevProvider,
		mempool: &Arc<Mempool>,
		flowtable: &Arc<FlowTable>,
	) -> Result<Self, ProgramError> {
		if spec.endpoints.len() > MAX_ENDPOINTS {
			return Err(ProgramError::TooManyEndpoints(spec.endpoints.len()));
		}

		let mut endpoints: Vec<AssembledEndpoint> = Vec::with_capacity(spec.endpoints.len());
		for (id, ep_spec) in spec.endpoints.iter().enumerate() {
			if endpoints.iter().any(|a| a.endpoint.name() == ep_spec.name) {
				return Err(ProgramError::DuplicateEndpoint(ep_spec.name.clone()));
			}

			let kind = match &ep_spec.kind {
				EndpointDecl::Eth { device } => {
					EndpointKind::Eth(devices.provide(&ep_spec.name, device)?)
				}
				EndpointDecl::Loopback { capacity } => {
					let (dev, _handle) = LoopbackDev::new(*capacity)
						.map_err(|_| ProgramError::BadRingCapacity(*capacity))?;
					EndpointKind::Loopback(dev)
				}
			};

			let mut rx_chain = ProcChain::new();
			for proc_spec in &ep_spec.rx {
				let proc = registry.create(
					&proc_spec.class,
					&proc_spec.name,
					&proc_spec.params,
					mempool,
					flowtable,
				)?;
				rx_chain.add_proc(proc)?;
			}
			let mut tx_chain = ProcChain::new();
			for proc_spec in &ep_spec.tx {
				let proc = registry.create(
					&proc_spec.class,
					&proc_spec.name,
					&proc_spec.params,
					mempool,
					flowtable,
				)?;
				tx_chain.add_proc(proc)?;
			}

			endpoints.push(AssembledEndpoint {
				endpoint: Endpoint::new(ep_spec.name.clone(), id as u16, kind),
				rx_chain,
				tx_chain,
			});
		}

		Ok(Self {
			name: spec.name.clone(),
			endpoints,
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn num_endpoints(&self) -> usize {
		self.endpoints.len()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::apis::MempoolConfig;

	const PROGRAM: &str = r#"
		name = "two-port-forward"

		[[endpoint]]
		name = "wan0"
		kind = { type = "loopback", capacity = 64 }

		[[endpoint.rx]]
		class = "ingress_packet_validator"
		name = "validate0"

		[[endpoint.rx]]
		class = "flow_classifier"
		name = "classify0"

		[[endpoint.rx]]
		class = "packet_filter"
		name = "filter0"
		params = { action = "forward", dst_endpoint = "1", eval_flow_once = "true" }

		[[endpoint]]
		name = "lan0"
		kind = { type = "loopback" }
	"#;

	fn deps() -> (Arc<Mempool>, Arc<FlowTable>) {
		let mp = Mempool::new(
			"program-test",
			MempoolConfig {
				capacity: 64,
				cache_size: 0,
				dataroom: 512,
				headroom: 0,
			},
		)
		.unwrap();
		(mp, Arc::new(FlowTable::new(32)))
	}

	#[test]
	fn parses_and_assembles() {
		let spec = FlowProgramSpec::from_toml_str(PROGRAM).unwrap();
		assert_eq!(spec.name, "two-port-forward");
		assert_eq!(spec.endpoints.len(), 2);

		let (mp, ft) = deps();
		let registry = ProcessorRegistry::with_builtins();
		let program = LoadedProgram::assemble(&spec, &registry, &mut NoEthDevs, &mp, &ft).unwrap();
		assert_eq!(program.num_endpoints(), 2);
		assert_eq!(program.endpoints[0].rx_chain.len(), 3);
		assert!(program.endpoints[1].rx_chain.is_empty());
		assert_eq!(
			program.endpoints[0].rx_chain.chain_names(),
			vec!["validate0", "classify0", "filter0"]
		);
	}

	#[test]
	fn unknown_class_is_fatal_at_load() {
		let toml = r#"
			name = "broken"
			[[endpoint]]
			name = "a"
			kind = { type = "loopback" }
			[[endpoint.rx]]
			class = "does_not_exist"
			name = "x"
		"#;
		let spec = FlowProgramSpec::from_toml_str(toml).unwrap();
		let (mp, ft) = deps();
		let registry = ProcessorRegistry::with_builtins();
		assert!(matches!(
			LoadedProgram::assemble(&spec, &registry, &mut NoEthDevs, &mp, &ft),
			Err(ProgramError::UnknownClass(_))
		));
	}

	#[test]
	fn duplicate_endpoints_are_rejected() {
		let toml = r#"
			name = "dup"
			[[endpoint]]
			name = "a"
			kind = { type = "loopback" }
			[[endpoint]]
			name = "a"
			kind = { type = "loopback" }
		"#;
		let spec = FlowProgramSpec::from_toml_str(toml).unwrap();
		let (mp, ft) = deps();
		let registry = ProcessorRegistry::with_builtins();
		assert!(matches!(
			LoadedProgram::assemble(&spec, &registry, &mut NoEthDevs, &mp, &ft),
			Err(ProgramError::DuplicateEndpoint(_))
		));
	}

	#[test]
	fn eth_devices_need_a_provider() {
		let toml = r#"
			name = "nic"
			[[endpoint]]
			name = "phys0"
			kind = { type = "eth", device = "net_null0" }
		"#;
		let spec = FlowProgramSpec::from_toml_str(toml).unwrap();
		let (mp, ft) = deps();
		let registry = ProcessorRegistry::with_builtins();
		assert!(matches!(
			LoadedProgram::assemble(&spec, &registry, &mut NoEthDevs, &mp, &ft),
			Err(ProgramError::NoDriver(_))
		));
	}
}
