use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use figment::providers::Format as _;
use ota_agent_core::{MinorGate, policy::DEFAULT_WILDCARD_MINORS};
use serde::{Deserialize, Serialize};
use serde_with::{DurationMilliSeconds, serde_as};

mod args;
pub use args::{Args, Command};


pub const DEFAULT_PARTITIONS: &str = ota_slot_ctrl::program::DEFAULT_PARTITIONS;

/// `Settings` are the configurable options for running the OTA agent.
///
/// The only entry point to construct `Settings` outside of tests is `Settings::get`.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct Settings {
    /// Used when an update is requested without a URL.
    pub default_url: String,
    /// The partition directory managed by `ota-slot-ctrl`.
    pub partitions: PathBuf,
    #[serde_as(as = "DurationMilliSeconds")]
    pub receive_timeout: Duration,
    pub trust_anchor: Option<PathBuf>,
    pub skip_hostname_verification: bool,
    pub keep_alive: bool,
    pub minor_gate: MinorGate,
    pub minor_gate_wildcards: Vec<u32>,
    pub reject_same_version: bool,
    /// Installs the update but leaves restarting to someone else.
    pub norestart: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_url: String::new(),
            partitions: PathBuf::from(DEFAULT_PARTITIONS),
            receive_timeout: Duration::from_millis(5000),
            trust_anchor: None,
            skip_hostname_verification: false,
            keep_alive: true,
            minor_gate: MinorGate::Off,
            minor_gate_wildcards: DEFAULT_WILDCARD_MINORS.to_vec(),
            reject_same_version: false,
            norestart: false,
        }
    }
}

impl Settings {
    /// Constructs `Settings` from defaults, a config file, environment variables, and
    /// command line arguments. Command line arguments always take precedence over
    /// environment variables, which in turn take precedence over the config file.
    pub fn get<P: AsRef<Path>>(
        args: &Args,
        config: P,
        env_prefix: &str,
    ) -> figment::error::Result<Settings> {
        figment::Figment::new()
            .merge(figment::providers::Serialized::defaults(Settings::default()))
            .merge(figment::providers::Toml::file(config))
            .merge(figment::providers::Env::prefixed(env_prefix))
            .merge(figment::providers::Serialized::defaults(args))
            .extract()
    }
}
