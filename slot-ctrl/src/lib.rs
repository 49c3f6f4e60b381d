//! The rust program for reading and writing the slot and image state of a file-backed
//! partition directory.
//!
//! A partition directory holds one image file per slot (`slot_a.bin`, `slot_b.bin`)
//! and `otadata.json`, which records the running slot, the slot to boot next and the
//! [`ImageState`] of each slot.

#![allow(clippy::missing_errors_doc)]

use std::{
    collections::HashSet,
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use ota_agent_core::{ImageMetadata, image::IMAGE_METADATA_LEN};
use tempfile::NamedTempFile;
use tracing::{debug, info};

mod domain;
mod writer;

pub mod program;
pub mod test_utils;

pub use domain::{Error, ImageState, ImageStateParseError, Result};
pub use ota_agent_core::Slot;
pub use writer::SlotWriter;

use domain::OtaData;

pub const OTADATA_FILE: &str = "otadata.json";

#[derive(Clone, Debug)]
pub struct SlotCtrl {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    root: PathBuf,
    open_writers: Mutex<HashSet<Slot>>,
    otadata: Mutex<()>,
}

impl SlotCtrl {
    /// Initializes a new partition directory with `current` as the running, valid slot.
    pub fn create(root: impl AsRef<Path>, current: Slot) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(Error::io(root))?;
        let path = root.join(OTADATA_FILE);
        if path.try_exists().map_err(Error::io(&path))? {
            return Err(Error::AlreadyInitialized(root.to_path_buf()));
        }

        let slot_ctrl = Self::new(root);
        slot_ctrl.store(&OtaData::new(current))?;
        info!("initialized partition directory {root:?} running slot {current}");
        Ok(slot_ctrl)
    }

    /// Opens an existing partition directory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let slot_ctrl = Self::new(root.as_ref());
        slot_ctrl.load()?;
        Ok(slot_ctrl)
    }

    fn new(root: &Path) -> Self {
        Self {
            inner: Arc::new(Inner {
                root: root.to_path_buf(),
                open_writers: Mutex::default(),
                otadata: Mutex::default(),
            }),
        }
    }

    #[must_use]
    pub fn slot_path(&self, slot: Slot) -> PathBuf {
        self.inner.root.join(format!("slot_{slot}.bin"))
    }

    pub(crate) fn staging_path(&self, slot: Slot) -> PathBuf {
        self.inner.root.join(format!("slot_{slot}.bin.partial"))
    }

    /// Get the current active slot.
    pub fn get_current_slot(&self) -> Result<Slot> {
        Ok(self.load()?.current)
    }

    /// Get the inactive slot.
    pub fn get_inactive_slot(&self) -> Result<Slot> {
        Ok(self.get_current_slot()?.opposite())
    }

    /// Get the slot set for the next boot.
    pub fn get_next_boot_slot(&self) -> Result<Slot> {
        Ok(self.load()?.next)
    }

    /// Set the slot for the next boot. Only slots holding a bootable image qualify.
    pub fn set_next_boot_slot(&self, slot: Slot) -> Result<()> {
        self.update(|data| {
            let state = data.state(slot);
            if !state.is_bootable() {
                return Err(Error::NotBootable { slot, state });
            }
            data.next = slot;
            Ok(())
        })?;
        info!("next boot slot set to {slot}");
        Ok(())
    }

    /// Get the image state for the current active slot.
    pub fn get_current_image_state(&self) -> Result<ImageState> {
        let data = self.load()?;
        Ok(data.state(data.current))
    }

    /// Get the image state for a certain `slot`.
    pub fn get_image_state(&self, slot: Slot) -> Result<ImageState> {
        Ok(self.load()?.state(slot))
    }

    /// Set the image state for a certain `slot`.
    pub fn set_image_state(&self, state: ImageState, slot: Slot) -> Result<()> {
        self.update(|data| {
            *data.state_mut(slot) = state;
            Ok(())
        })
    }

    /// The inactive slot, if the image it holds was rejected or never confirmed.
    pub fn get_last_invalid_slot(&self) -> Result<Option<Slot>> {
        let data = self.load()?;
        Ok(Slot::ALL
            .into_iter()
            .find(|&slot| slot != data.current && data.state(slot).is_invalid()))
    }

    /// Marks the current slot as working correctly if it is pending verification,
    /// which cancels the pending rollback. Any other state is left alone. Returns the
    /// state the slot had before.
    pub fn mark_current_slot_ok(&self) -> Result<ImageState> {
        let previous = self.update(|data| {
            let current = data.current;
            let state = data.state_mut(current);
            let previous = *state;
            if previous == ImageState::PendingVerify {
                *state = ImageState::Valid;
            }
            Ok(previous)
        })?;
        match previous {
            ImageState::PendingVerify => info!("marked current slot valid"),
            state => debug!("current slot is {state}, not pending verification"),
        }
        Ok(previous)
    }

    /// Marks the current slot invalid and schedules the other slot for the next boot.
    /// Returns the slot that will boot next.
    pub fn mark_current_slot_invalid(&self) -> Result<Slot> {
        let fallback = self.update(|data| {
            let current = data.current;
            let fallback = current.opposite();
            let state = data.state(fallback);
            if !state.is_bootable() {
                return Err(Error::NotBootable {
                    slot: fallback,
                    state,
                });
            }
            *data.state_mut(current) = ImageState::Invalid;
            data.next = fallback;
            Ok(fallback)
        })?;
        info!("marked current slot invalid, rolling back to slot {fallback}");
        Ok(fallback)
    }

    /// Reads the image metadata at the start of a slot, if it holds a readable image.
    pub fn read_image_metadata(&self, slot: Slot) -> Result<Option<ImageMetadata>> {
        let path = self.slot_path(slot);
        let file = match File::open(&path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            file => file.map_err(Error::io(&path))?,
        };
        let mut head = Vec::with_capacity(IMAGE_METADATA_LEN);
        file.take(IMAGE_METADATA_LEN as u64)
            .read_to_end(&mut head)
            .map_err(Error::io(&path))?;

        match ImageMetadata::parse(&head) {
            Ok(metadata) => Ok(Some(metadata)),
            Err(e) => {
                debug!("slot {slot} holds no readable image: {e}");
                Ok(None)
            }
        }
    }

    /// Opens `slot` for writing a new image. Fails for the running slot and for a slot
    /// that already has an open writer.
    pub fn begin_write(&self, slot: Slot) -> Result<SlotWriter> {
        SlotWriter::open(self.clone(), slot)
    }

    pub(crate) fn claim(&self, slot: Slot) -> bool {
        lock(&self.inner.open_writers).insert(slot)
    }

    pub(crate) fn release(&self, slot: Slot) {
        lock(&self.inner.open_writers).remove(&slot);
    }

    fn otadata_path(&self) -> PathBuf {
        self.inner.root.join(OTADATA_FILE)
    }

    fn load(&self) -> Result<OtaData> {
        let path = self.otadata_path();
        let bytes = fs::read(&path).map_err(Error::io(&path))?;
        serde_json::from_slice(&bytes).map_err(|source| Error::InvalidOtaData { path, source })
    }

    /// Replaces `otadata.json` atomically.
    fn store(&self, data: &OtaData) -> Result<()> {
        let path = self.otadata_path();
        let mut tmp = NamedTempFile::new_in(&self.inner.root).map_err(Error::io(&path))?;
        serde_json::to_writer_pretty(&mut tmp, data)
            .map_err(io::Error::from)
            .and_then(|()| tmp.as_file().sync_all())
            .map_err(Error::io(&path))?;
        tmp.persist(&path).map_err(|e| Error::io(&path)(e.error))?;
        Ok(())
    }

    fn update<T>(&self, f: impl FnOnce(&mut OtaData) -> Result<T>) -> Result<T> {
        let _guard = lock(&self.inner.otadata);
        let mut data = self.load()?;
        let out = f(&mut data)?;
        self.store(&data)?;
        Ok(out)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn create_refuses_initialized_directory() {
        let dir = TempDir::new().unwrap();
        SlotCtrl::create(dir.path(), Slot::A).unwrap();

        assert!(matches!(
            SlotCtrl::create(dir.path(), Slot::B),
            Err(Error::AlreadyInitialized(_))
        ));
    }

    #[test]
    fn open_requires_otadata() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(SlotCtrl::open(dir.path()), Err(Error::Io { .. })));
    }

    #[test]
    fn fresh_directory_runs_valid_slot() {
        let dir = TempDir::new().unwrap();
        let slot_ctrl = SlotCtrl::create(dir.path(), Slot::B).unwrap();

        assert_eq!(slot_ctrl.get_current_slot().unwrap(), Slot::B);
        assert_eq!(slot_ctrl.get_next_boot_slot().unwrap(), Slot::B);
        assert_eq!(
            slot_ctrl.get_current_image_state().unwrap(),
            ImageState::Valid
        );
        assert_eq!(
            slot_ctrl.get_image_state(Slot::A).unwrap(),
            ImageState::Undefined
        );
        assert_eq!(slot_ctrl.read_image_metadata(Slot::A).unwrap(), None);
    }

    #[test]
    fn corrupt_otadata_is_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(OTADATA_FILE), b"{ not json").unwrap();

        assert!(matches!(
            SlotCtrl::open(dir.path()),
            Err(Error::InvalidOtaData { .. })
        ));
    }
}
