use std::fs;

use crate::{
    ImageState, Slot, SlotCtrl,
    program::{self, Cli},
};
use bon::bon;
use clap::Parser;
use tempfile::TempDir;

/// A Fixture that initializes a partition directory in a temporary location.
/// Slot A runs a valid image and slot B is undefined by default.
pub struct Fixture {
    pub tempdir: TempDir,
    pub slot_ctrl: SlotCtrl,
}

#[bon]
impl Fixture {
    #[builder]
    pub fn new(
        #[builder(default = Slot::A)] current_slot: Slot,
        next_slot: Option<Slot>,
        #[builder(default = ImageState::Valid)] state_a: ImageState,
        #[builder(default = ImageState::Undefined)] state_b: ImageState,
        image_a: Option<Vec<u8>>,
        image_b: Option<Vec<u8>>,
    ) -> Fixture {
        let tempdir = TempDir::new().unwrap();
        let slot_ctrl = SlotCtrl::create(tempdir.path(), current_slot).unwrap();

        for (slot, image) in [(Slot::A, image_a), (Slot::B, image_b)] {
            if let Some(image) = image {
                fs::write(slot_ctrl.slot_path(slot), image).unwrap();
            }
        }
        slot_ctrl.set_image_state(state_a, Slot::A).unwrap();
        slot_ctrl.set_image_state(state_b, Slot::B).unwrap();
        let next_slot = next_slot.unwrap_or(current_slot);
        if next_slot != current_slot {
            slot_ctrl.set_next_boot_slot(next_slot).unwrap();
        }

        Self { tempdir, slot_ctrl }
    }

    pub fn run(&self, cmd: &str) -> color_eyre::Result<String> {
        let partitions = self.tempdir.path().to_string_lossy();
        let mut args = vec!["ota-slot-ctrl", "--partitions", &*partitions];
        args.extend(cmd.split_ascii_whitespace());

        let cli = Cli::try_parse_from(&args)?;
        program::run(cli)
    }
}
