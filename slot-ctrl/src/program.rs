use std::{fmt::Write as _, path::PathBuf};

use clap::{Parser, Subcommand};
use color_eyre::{Result, eyre::WrapErr as _};

use crate::{ImageState, Slot, SlotCtrl};

pub const DEFAULT_PARTITIONS: &str = "/var/lib/ota-agent/partitions";

#[derive(Parser)]
#[command(
    author,
    version,
    long_about = "This tool is designed to read and write the slot and image state of a partition directory."
)]
#[allow(missing_docs)]
pub struct Cli {
    /// The partition directory.
    #[arg(long, short = 'p', env = "OTA_AGENT_PARTITIONS", default_value = DEFAULT_PARTITIONS)]
    partitions: PathBuf,
    #[command(subcommand)]
    subcmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Get the current active slot.
    #[command(name = "current", short_flag = 'c')]
    GetSlot,
    /// Get the slot set for the next boot.
    #[command(name = "next", short_flag = 'n')]
    GetNextSlot,
    /// Set slot for the next boot.
    #[command(name = "set", short_flag = 's')]
    SetNextSlot { slot: Slot },
    /// Image state controls.
    Status {
        /// Control the inactive slot instead of the active.
        #[arg(long = "inactive", short = 'i')]
        inactive: bool,
        #[command(subcommand)]
        subcmd: StatusCommands,
    },
    /// Print the version of the image held by each slot.
    #[command(name = "info")]
    Info,
    /// Initialize a partition directory.
    Create {
        /// The slot to mark as running.
        #[arg(default_value = "a")]
        slot: Slot,
    },
}

#[derive(Subcommand)]
enum StatusCommands {
    /// Get the image state.
    #[command(name = "get", short_flag = 'g')]
    GetImageState,
    /// Set the image state.
    #[command(name = "set", short_flag = 's')]
    SetImageState { state: ImageState },
    /// Get a full list of image state variants.
    #[command(name = "list", short_flag = 'l')]
    ListStateVariants,
}

/// Runs a command, returning what should be printed.
pub fn run(cli: Cli) -> Result<String> {
    let open = || {
        SlotCtrl::open(&cli.partitions).wrap_err_with(|| {
            format!(
                "failed opening partition directory {:?}, run `ota-slot-ctrl create` first",
                cli.partitions
            )
        })
    };

    let out = match cli.subcmd {
        Commands::Create { slot } => {
            SlotCtrl::create(&cli.partitions, slot)?;
            String::new()
        }
        Commands::GetSlot => open()?.get_current_slot()?.to_string(),
        Commands::GetNextSlot => open()?.get_next_boot_slot()?.to_string(),
        Commands::SetNextSlot { slot } => {
            open()?.set_next_boot_slot(slot)?;
            String::new()
        }
        Commands::Status { inactive, subcmd } => {
            let slot_ctrl = open()?;
            let slot = if inactive {
                slot_ctrl.get_inactive_slot()?
            } else {
                slot_ctrl.get_current_slot()?
            };
            match subcmd {
                StatusCommands::GetImageState => {
                    slot_ctrl.get_image_state(slot)?.to_string()
                }
                StatusCommands::SetImageState { state } => {
                    slot_ctrl.set_image_state(state, slot)?;
                    String::new()
                }
                StatusCommands::ListStateVariants => [
                    "Available image states with their aliases:",
                    "  new (0)",
                    "  pending_verify (pendingverify, pending, 1)",
                    "  valid (2)",
                    "  invalid (3)",
                    "  aborted (4)",
                    "  undefined (5)",
                ]
                .join("\n"),
            }
        }
        Commands::Info => {
            let slot_ctrl = open()?;
            let mut out = String::new();
            for slot in Slot::ALL {
                let state = slot_ctrl.get_image_state(slot)?;
                let version = slot_ctrl
                    .read_image_metadata(slot)?
                    .map(|metadata| metadata.version().to_string())
                    .unwrap_or_else(|| "-".to_string());
                writeln!(out, "{slot}: {state} {version}")?;
            }
            out.trim_end().to_string()
        }
    };

    Ok(out)
}
