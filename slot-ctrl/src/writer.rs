use std::{
    fs::{self, File},
    io::{self, BufReader, Write},
    path::PathBuf,
};

use ota_agent_core::{Slot, VerifiedImage, image};
use tracing::{debug, info, warn};

use crate::{Error, ImageState, Result, SlotCtrl};

/// Streams a new image into an inactive slot.
///
/// Bytes are staged next to the slot file. [`SlotWriter::finalize`] verifies the staged
/// image and only then replaces the slot contents; [`SlotWriter::abort`] and dropping
/// an unfinished writer discard the staged bytes, leaving the slot untouched.
#[derive(Debug)]
pub struct SlotWriter {
    slot_ctrl: SlotCtrl,
    slot: Slot,
    staging: PathBuf,
    file: Option<File>,
    written: u64,
}

impl SlotWriter {
    pub(crate) fn open(slot_ctrl: SlotCtrl, slot: Slot) -> Result<Self> {
        if slot == slot_ctrl.get_current_slot()? {
            return Err(Error::SlotRunning(slot));
        }
        if !slot_ctrl.claim(slot) {
            return Err(Error::SlotBusy(slot));
        }

        let staging = slot_ctrl.staging_path(slot);
        let file = match File::create(&staging) {
            Ok(file) => file,
            Err(e) => {
                slot_ctrl.release(slot);
                return Err(Error::io(staging)(e));
            }
        };
        debug!("opened slot {slot} for writing");

        Ok(Self {
            slot_ctrl,
            slot,
            staging,
            file: Some(file),
            written: 0,
        })
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Appends `buf` to the staged image.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or(Error::WriterClosed(self.slot))?;
        file.write_all(buf).map_err(Error::io(&self.staging))?;
        self.written += buf.len() as u64;
        Ok(())
    }

    /// Verifies the staged image and makes it the slot's contents, in state
    /// [`ImageState::New`]. The writer is closed afterwards, whatever the outcome.
    pub fn finalize(&mut self) -> Result<VerifiedImage> {
        let file = self.file.take().ok_or(Error::WriterClosed(self.slot))?;
        let result = self.commit(file);
        if result.is_err() {
            self.discard();
        }
        self.slot_ctrl.release(self.slot);
        result
    }

    fn commit(&self, file: File) -> Result<VerifiedImage> {
        file.sync_all().map_err(Error::io(&self.staging))?;
        drop(file);

        let staged = File::open(&self.staging).map_err(Error::io(&self.staging))?;
        let verified = image::verify(BufReader::new(staged)).map_err(|source| {
            Error::Integrity {
                slot: self.slot,
                source,
            }
        })?;

        // the slot contents are in flux until the new image is in place
        let target = self.slot_ctrl.slot_path(self.slot);
        let previous = self.slot_ctrl.get_image_state(self.slot)?;
        self.slot_ctrl
            .set_image_state(ImageState::Undefined, self.slot)?;
        if let Err(e) = fs::rename(&self.staging, &target) {
            self.slot_ctrl.set_image_state(previous, self.slot)?;
            return Err(Error::io(target)(e));
        }
        self.slot_ctrl.set_image_state(ImageState::New, self.slot)?;

        info!(
            "wrote {} byte image to slot {} ({} bytes received)",
            verified.len, self.slot, self.written
        );
        Ok(verified)
    }

    /// Discards the staged image. Calling this on a closed writer does nothing.
    pub fn abort(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            self.discard();
            self.slot_ctrl.release(self.slot);
            info!(
                "aborted write to slot {} after {} bytes",
                self.slot, self.written
            );
        }
    }

    fn discard(&self) {
        match fs::remove_file(&self.staging) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed removing {:?}: {e}", self.staging),
        }
    }
}

impl Drop for SlotWriter {
    fn drop(&mut self) {
        if self.file.is_some() {
            warn!("unfinished writer for slot {} dropped", self.slot);
            self.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use ota_agent_core::test_utils::ImageBuilder;
    use tempfile::TempDir;

    use super::*;

    fn setup() -> (TempDir, SlotCtrl) {
        let dir = TempDir::new().unwrap();
        let slot_ctrl = SlotCtrl::create(dir.path(), Slot::A).unwrap();
        (dir, slot_ctrl)
    }

    #[test]
    fn written_image_lands_in_slot() {
        let (_dir, slot_ctrl) = setup();
        let image = ImageBuilder::new("1.5.1").build();

        let mut writer = slot_ctrl.begin_write(Slot::B).unwrap();
        for chunk in image.chunks(100) {
            writer.write(chunk).unwrap();
        }
        assert_eq!(writer.written(), image.len() as u64);
        writer.finalize().unwrap();

        assert_eq!(fs::read(slot_ctrl.slot_path(Slot::B)).unwrap(), image);
        assert!(!slot_ctrl.staging_path(Slot::B).exists());
        assert_eq!(slot_ctrl.get_image_state(Slot::B).unwrap(), ImageState::New);
        let metadata = slot_ctrl.read_image_metadata(Slot::B).unwrap().unwrap();
        assert_eq!(metadata.version().text(), "1.5.1");
    }

    #[test]
    fn running_slot_cannot_be_written() {
        let (_dir, slot_ctrl) = setup();
        assert!(matches!(
            slot_ctrl.begin_write(Slot::A),
            Err(Error::SlotRunning(Slot::A))
        ));
    }

    #[test]
    fn only_one_writer_per_slot() {
        let (_dir, slot_ctrl) = setup();
        let mut first = slot_ctrl.begin_write(Slot::B).unwrap();
        assert!(matches!(
            slot_ctrl.begin_write(Slot::B),
            Err(Error::SlotBusy(Slot::B))
        ));

        first.abort();
        slot_ctrl.begin_write(Slot::B).unwrap();
    }

    #[test]
    fn abort_leaves_slot_untouched() {
        let (_dir, slot_ctrl) = setup();
        let old = ImageBuilder::new("1.0.0").build();
        fs::write(slot_ctrl.slot_path(Slot::B), &old).unwrap();
        slot_ctrl
            .set_image_state(ImageState::Invalid, Slot::B)
            .unwrap();

        let mut writer = slot_ctrl.begin_write(Slot::B).unwrap();
        writer.write(&[1, 2, 3]).unwrap();
        writer.abort();
        writer.abort();

        assert_eq!(fs::read(slot_ctrl.slot_path(Slot::B)).unwrap(), old);
        assert!(!slot_ctrl.staging_path(Slot::B).exists());
        assert_eq!(
            slot_ctrl.get_image_state(Slot::B).unwrap(),
            ImageState::Invalid
        );
        assert!(matches!(
            writer.write(&[4]),
            Err(Error::WriterClosed(Slot::B))
        ));
        assert!(matches!(
            writer.finalize(),
            Err(Error::WriterClosed(Slot::B))
        ));
    }

    #[test]
    fn dropping_writer_aborts() {
        let (_dir, slot_ctrl) = setup();
        {
            let mut writer = slot_ctrl.begin_write(Slot::B).unwrap();
            writer.write(&[0xE9; 10]).unwrap();
        }
        assert!(!slot_ctrl.staging_path(Slot::B).exists());
        slot_ctrl.begin_write(Slot::B).unwrap();
    }

    #[test]
    fn corrupt_image_fails_finalize() {
        let (_dir, slot_ctrl) = setup();
        let mut image = ImageBuilder::new("1.5.1").build();
        let last = image.len() - 1;
        image[last] ^= 0xFF;

        let mut writer = slot_ctrl.begin_write(Slot::B).unwrap();
        writer.write(&image).unwrap();
        assert!(matches!(
            writer.finalize(),
            Err(Error::Integrity { slot: Slot::B, .. })
        ));

        assert!(!slot_ctrl.slot_path(Slot::B).exists());
        assert!(!slot_ctrl.staging_path(Slot::B).exists());
        assert_eq!(
            slot_ctrl.get_image_state(Slot::B).unwrap(),
            ImageState::Undefined
        );
        // the slot is free again
        slot_ctrl.begin_write(Slot::B).unwrap();
    }
}
