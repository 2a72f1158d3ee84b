//! flowengine binary: loads a flow program, binds devices, starts the
//! workers and runs the controller loop until a signal arrives.

use std::{
	collections::BTreeMap,
	collections::HashMap,
	path::PathBuf,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	time::Duration,
};

use anyhow::{bail, Context, Result};
use clap::Parser;

use flowengine::config::AppConfig;
use flowengine::endpoint::{EthDev, LoopbackDev};
use flowengine::executor::{available_cores, CoreInfo};
use flowengine::flowtable::FlowTable;
use flowengine::manager::{FlowManager, ManagerOptions};
use flowengine::processors::ProcessorRegistry;
use flowengine::program::{EthDevProvider, FlowProgramSpec, LoadedProgram, ProgramError};
use flowengine::telemetry::{snapshot, TelemetryDistributor};
use flowengine::{Mempool, MempoolConfig, DEFAULT_HEADROOM};

#[derive(Parser, Debug)]
#[command(name = "flowengine", about = "User-space packet processing orchestrator")]
struct Args {
	/// Flow program file (TOML).
	#[arg(long)]
	program: PathBuf,

	/// Optional app config file (TOML); command line flags win.
	#[arg(long)]
	config: Option<PathBuf>,

	/// Device binding, repeatable: type&id&key=value&...
	#[arg(long = "device")]
	devices: Vec<String>,

	#[arg(long)]
	pool_capacity: Option<usize>,

	#[arg(long)]
	cache_size: Option<usize>,

	#[arg(long)]
	dataroom: Option<u16>,

	#[arg(long)]
	flowtable_capacity: Option<usize>,

	#[arg(long)]
	distributors: Option<usize>,

	#[arg(long)]
	telemetry_endpoint: Option<String>,

	/// Worker cores, comma separated. Defaults to every online CPU.
	#[arg(long, value_delimiter = ',')]
	cores: Option<Vec<u32>>,
}

struct DeviceBinding {
	kind: String,
	options: BTreeMap<String, String>,
}

/// Resolves `eth` endpoint device ids against the command line bindings.
struct DeviceBindings {
	bindings: HashMap<String, DeviceBinding>,
}

impl DeviceBindings {
	fn parse(specs: &[String]) -> Result<Self> {
		let mut bindings = HashMap::new();
		for spec in specs {
			let mut parts = spec.split('&');
			let kind = parts.next().unwrap_or_default().to_owned();
			let id = parts
				.next()
				.with_context(|| format!("device binding {:?} is missing an id", spec))?
				.to_owned();
			let mut options = BTreeMap::new();
			for option in parts {
				match option.split_once('=') {
					Some((key, value)) => {
						options.insert(key.to_owned(), value.to_owned());
					}
					None => bail!("device binding option {:?} is not key=value", option),
				}
			}
			if kind.is_empty() {
				bail!("device binding {:?} is missing a type", spec);
			}
			log::info!("bound device {} (type {})", id, kind);
			bindings.insert(id, DeviceBinding { kind, options });
		}
		Ok(Self { bindings })
	}
}

impl EthDevProvider for DeviceBindings {
	fn provide(&mut self, endpoint: &str, device: &str) -> Result<Box<dyn EthDev>, ProgramError> {
		let binding = self
			.bindings
			.get(device)
			.ok_or_else(|| ProgramError::NoDriver(device.to_owned()))?;
		match binding.kind.as_str() {
			"loopback" => {
				let capacity = binding
					.options
					.get("capacity")
					.and_then(|v| v.parse::<usize>().ok())
					.unwrap_or(1024);
				let (dev, _handle) = LoopbackDev::new(capacity)
					.map_err(|_| ProgramError::BadRingCapacity(capacity))?;
				log::info!("endpoint {} backed by loopback device {}", endpoint, device);
				Ok(Box::new(dev))
			}
			other => {
				log::error!("device {} has unsupported type {}", device, other);
				Err(ProgramError::NoDriver(device.to_owned()))
			}
		}
	}
}

fn effective_config(args: &Args) -> Result<AppConfig> {
	let mut config = match &args.config {
		Some(path) => AppConfig::load_from_toml(path)
			.with_context(|| format!("loading config {}", path.display()))?,
		None => AppConfig::default(),
	};
	if let Some(v) = args.pool_capacity {
		config.pool_capacity = v;
	}
	if let Some(v) = args.cache_size {
		config.pool_cache_size = v;
	}
	if let Some(v) = args.dataroom {
		config.dataroom = v;
	}
	if let Some(v) = args.flowtable_capacity {
		config.flowtable_capacity = v;
	}
	if let Some(v) = args.distributors {
		config.num_distributors = v;
	}
	if let Some(v) = &args.telemetry_endpoint {
		config.telemetry_endpoint = Some(v.clone());
	}
	config.apply_limits();
	Ok(config)
}

fn main() -> Result<()> {
	env_logger::init();
	let args = Args::parse();
	let config = effective_config(&args)?;

	let program_text = std::fs::read_to_string(&args.program)
		.with_context(|| format!("reading program {}", args.program.display()))?;
	let spec = FlowProgramSpec::from_toml_str(&program_text)?;
	let mut devices = DeviceBindings::parse(&args.devices)?;

	let mempool = Mempool::new(
		"primary",
		MempoolConfig {
			capacity: config.pool_capacity,
			cache_size: config.pool_cache_size,
			dataroom: config.dataroom,
			headroom: DEFAULT_HEADROOM,
		},
	)?;
	let flowtable = Arc::new(FlowTable::new(config.flowtable_capacity));
	let registry = ProcessorRegistry::with_builtins();

	let program = LoadedProgram::assemble(&spec, &registry, &mut devices, &mempool, &flowtable)
		.context("assembling flow program")?;
	log::info!("assembled flow program {} with {} endpoints", program.name(), program.num_endpoints());

	let manager = FlowManager::new(
		Arc::clone(&mempool),
		Arc::clone(&flowtable),
		ManagerOptions {
			ring_capacity: config.ring_capacity,
		},
	);
	manager.load(program).context("loading flow program")?;

	let cores: Vec<CoreInfo> = match &args.cores {
		Some(ids) => ids.iter().map(|&id| CoreInfo::new(id, 0)).collect(),
		None => available_cores(),
	};
	manager
		.start(&cores, config.num_distributors)
		.context("starting flow program")?;

	let telemetry = match &config.telemetry_endpoint {
		Some(endpoint) => Some(
			TelemetryDistributor::new(endpoint)
				.with_context(|| format!("connecting telemetry to {}", endpoint))?,
		),
		None => None,
	};

	let keep_running = Arc::new(AtomicBool::new(true));
	{
		let keep_running = Arc::clone(&keep_running);
		ctrlc::set_handler(move || {
			keep_running.store(false, Ordering::SeqCst);
		})
		.context("installing signal handler")?;
	}

	log::info!("running; send SIGINT or SIGTERM to stop");
	while keep_running.load(Ordering::SeqCst) {
		std::thread::sleep(Duration::from_secs(1));
		if let Some(telemetry) = &telemetry {
			if let Err(err) = telemetry.do_update(&snapshot(&manager.telemetry_entries())) {
				log::warn!("telemetry update failed: {}", err);
			}
		}
		if !manager.is_active() {
			log::error!("workers stopped unexpectedly, shutting down");
			manager.stop();
			bail!("worker failure");
		}
	}

	log::info!("stopping");
	manager.stop();
	Ok(())
}
