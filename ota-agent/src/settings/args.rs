use clap::{Parser, Subcommand};
use ota_agent_core::MinorGate;
use serde::Serialize;

/// Downloads firmware images over HTTPS and installs them into the inactive slot.
///
/// The image's version is checked before anything is written. After the image is
/// written and verified, the slot it was written to becomes the boot target and the
/// device restarts.
#[derive(Debug, Parser, Serialize)]
#[command(author, version)]
pub struct Args {
    /// The path to the config file.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    /// The URL used when an update is requested without one.
    #[arg(long, alias = "url")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_url: Option<String>,
    /// The partition directory.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partitions: Option<String>,
    /// Milliseconds to wait for the server before giving up on a connect or a read.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receive_timeout: Option<u64>,
    /// PEM certificate the server must chain to, replacing the built-in roots.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_anchor: Option<String>,
    /// Accepts server certificates issued for a different hostname.
    #[arg(long)]
    // Serialization is skipped if not set because command line args always take
    // precedence over env vars and a config file. This would otherwise make it
    // impossible to set this config option outside of cli args.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skip_hostname_verification: bool,
    /// Whether to send TCP keep-alive probes.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<bool>,
    /// Whether an image must share the running image's minor version: `off` or `enforce`.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor_gate: Option<MinorGate>,
    /// Running minor versions that accept any minor version, comma separated.
    #[arg(long, value_delimiter = ',')]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minor_gate_wildcards: Option<Vec<u32>>,
    /// Refuses images with the version that is already running.
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reject_same_version: bool,
    /// Installs the update without restarting afterwards.
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub norestart: bool,
    #[command(subcommand)]
    #[serde(skip)]
    pub command: Option<Command>,
}

#[derive(Clone, Debug, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Downloads and installs an image, then restarts. The default.
    Update {
        /// URL of the image, the configured default URL if not given.
        url: Option<String>,
    },
    /// Reads update requests from standard input.
    Console,
    /// Prints the slots and the versions of their images.
    Info,
    /// Marks the running image as working, cancelling a pending rollback.
    Init,
}
