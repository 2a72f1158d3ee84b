//! Application configuration: TOML-loadable with defaults and clamped
//! numeric limits, merged under the command line by the binary.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
	#[error("could not read config file: {}", _0)]
	Io(#[from] std::io::Error),
	#[error("could not parse config file: {}", _0)]
	Parse(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
	/// Buffers in the primary packet allocator.
	pub pool_capacity: usize,
	/// Per-worker allocator cache size.
	pub pool_cache_size: usize,
	/// Usable bytes per packet buffer.
	pub dataroom: u16,
	/// Maximum number of live flow records.
	pub flowtable_capacity: usize,
	pub num_distributors: usize,
	/// Capacity of each distributor ring.
	pub ring_capacity: usize,
	/// Collector address for telemetry datagrams; disabled when unset.
	pub telemetry_endpoint: Option<String>,
}

impl Default for AppConfig {
	fn default() -> Self {
		Self {
			pool_capacity: 1 << 14,
			pool_cache_size: 128,
			dataroom: 2000,
			flowtable_capacity: 4096,
			num_distributors: 1,
			ring_capacity: 1024,
			telemetry_endpoint: None,
		}
	}
}

fn clamp<T: Ord + Copy + std::fmt::Display>(name: &str, value: T, min: T, max: T) -> T {
	if value < min || value > max {
		let clamped = value.clamp(min, max);
		log::warn!("config: {} = {} outside [{}, {}], using {}", name, value, min, max, clamped);
		clamped
	} else {
		value
	}
}

impl AppConfig {
	pub fn load_from_toml(path: &Path) -> Result<Self, ConfigError> {
		let raw = std::fs::read_to_string(path)?;
		let mut config: AppConfig =
			toml::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
		config.apply_limits();
		Ok(config)
	}

	/// Clamps every numeric parameter into its supported range and rounds
	/// the ring capacity up to a power of two.
	pub fn apply_limits(&mut self) {
		self.pool_capacity = clamp("pool_capacity", self.pool_capacity, 64, 1 << 22);
		self.pool_cache_size = clamp("pool_cache_size", self.pool_cache_size, 0, 1024);
		self.dataroom = clamp("dataroom", self.dataroom, 128, 16000);
		self.flowtable_capacity = clamp("flowtable_capacity", self.flowtable_capacity, 8, 1 << 20);
		self.num_distributors = clamp("num_distributors", self.num_distributors, 1, 8);
		self.ring_capacity = clamp("ring_capacity", self.ring_capacity, 16, 1 << 16);
		if !self.ring_capacity.is_power_of_two() {
			let rounded = self.ring_capacity.next_power_of_two();
			log::warn!("config: ring_capacity {} is not a power of two, using {}", self.ring_capacity, rounded);
			self.ring_capacity = rounded;
		}
	}
}
