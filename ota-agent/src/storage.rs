//! The slots an update is installed into.

use std::fmt;

use eyre::WrapErr as _;
use ota_agent_core::{ImageVersion, Slot};
use ota_slot_ctrl::{SlotCtrl, SlotWriter};

/// What is running right now, captured once at the start of an update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunningContext {
    pub running_slot: Slot,
    pub boot_slot: Slot,
    pub running_version: Option<ImageVersion>,
    /// Version of the image the bootloader last rejected, if any.
    pub last_invalid_version: Option<ImageVersion>,
}

impl fmt::Display for RunningContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "running slot {}", self.running_slot)?;
        if let Some(version) = &self.running_version {
            write!(f, " version `{version}`")?;
        }
        if self.boot_slot != self.running_slot {
            write!(f, ", booting slot {} next", self.boot_slot)?;
        }
        if let Some(version) = &self.last_invalid_version {
            write!(f, ", last invalid version `{version}`")?;
        }
        Ok(())
    }
}

/// An open slot receiving image bytes in order.
pub trait WriteHandle: Send {
    fn write(&mut self, buf: &[u8]) -> eyre::Result<()>;

    /// Validates the written image and makes the slot eligible for booting.
    fn finalize(&mut self) -> eyre::Result<()>;

    /// Discards everything written. Safe to call more than once.
    fn abort(&mut self);

    fn written(&self) -> u64;
}

pub trait Storage: Send + Sync + 'static {
    type Writer: WriteHandle;

    fn running_context(&self) -> eyre::Result<RunningContext>;

    /// The slot a new image is written to.
    fn candidate_slot(&self) -> eyre::Result<Slot>;

    fn open(&self, slot: Slot) -> eyre::Result<Self::Writer>;

    fn set_boot_slot(&self, slot: Slot) -> eyre::Result<()>;
}

impl WriteHandle for SlotWriter {
    fn write(&mut self, buf: &[u8]) -> eyre::Result<()> {
        SlotWriter::write(self, buf)?;
        Ok(())
    }

    fn finalize(&mut self) -> eyre::Result<()> {
        SlotWriter::finalize(self)?;
        Ok(())
    }

    fn abort(&mut self) {
        SlotWriter::abort(self);
    }

    fn written(&self) -> u64 {
        SlotWriter::written(self)
    }
}

impl Storage for SlotCtrl {
    type Writer = SlotWriter;

    fn running_context(&self) -> eyre::Result<RunningContext> {
        let running_slot = self
            .get_current_slot()
            .wrap_err("failed getting current slot")?;
        let boot_slot = self
            .get_next_boot_slot()
            .wrap_err("failed getting next boot slot")?;
        let running_version = self
            .read_image_metadata(running_slot)?
            .map(|metadata| metadata.version().clone());
        let last_invalid_version = match self.get_last_invalid_slot()? {
            Some(slot) => self
                .read_image_metadata(slot)?
                .map(|metadata| metadata.version().clone()),
            None => None,
        };

        Ok(RunningContext {
            running_slot,
            boot_slot,
            running_version,
            last_invalid_version,
        })
    }

    fn candidate_slot(&self) -> eyre::Result<Slot> {
        Ok(self.get_inactive_slot()?)
    }

    fn open(&self, slot: Slot) -> eyre::Result<Self::Writer> {
        Ok(self.begin_write(slot)?)
    }

    fn set_boot_slot(&self, slot: Slot) -> eyre::Result<()> {
        Ok(self.set_next_boot_slot(slot)?)
    }
}
