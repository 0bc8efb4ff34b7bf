//! Sluice Config
//!
//! This crate contains the runtime configuration types for sluice. Every knob
//! that tunes the scheduling engine (polling intervals, retry counts, timeouts,
//! sandbox locations) lives here so that nothing downstream hardcodes it.
//!
//! Configuration can be loaded from:
//! - Environment variables (`SLUICE_*`), optionally seeded from a `.env` file
//! - JSON (all types are serde (de)serializable)
//!
//! # Example
//!
//! ```ignore
//! use sluice_config::SluiceConfig;
//!
//! let config = SluiceConfig::from_env()?;
//! println!("polling every {:?}", config.fleet.poll_interval());
//! ```

mod container;
mod env;
mod fleet;
mod scheduler;

pub use container::{ContainerConfig, Isolation};
pub use env::{ConfigError, EnvLookup};
pub use fleet::FleetConfig;
pub use scheduler::{SchedulerConfig, SchedulerKind};

use serde::{Deserialize, Serialize};

/// Complete configuration for a sluice deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SluiceConfig {
  #[serde(default)]
  pub fleet: FleetConfig,
  #[serde(default)]
  pub scheduler: SchedulerConfig,
  #[serde(default)]
  pub container: ContainerConfig,
}

impl SluiceConfig {
  /// Load configuration from the process environment.
  ///
  /// Loads `.env` file if present, then reads `SLUICE_*` variables. Unset
  /// variables keep their defaults; malformed values are an error.
  pub fn from_env() -> Result<Self, ConfigError> {
    dotenvy::dotenv().ok();
    Self::from_lookup(&env::ProcessEnv)
  }

  /// Load configuration through an arbitrary variable lookup.
  pub fn from_lookup(lookup: &dyn EnvLookup) -> Result<Self, ConfigError> {
    Ok(Self {
      fleet: FleetConfig::from_lookup(lookup)?,
      scheduler: SchedulerConfig::from_lookup(lookup)?,
      container: ContainerConfig::from_lookup(lookup)?,
    })
  }
}
