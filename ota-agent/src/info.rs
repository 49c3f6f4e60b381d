use std::fmt::Write as _;

use eyre::WrapErr as _;
use ota_agent_core::Slot;
use ota_slot_ctrl::SlotCtrl;

/// Describes the running, boot, candidate and last invalid slots, each with the
/// state and version of its image.
pub fn describe(slot_ctrl: &SlotCtrl) -> eyre::Result<String> {
    let running = slot_ctrl
        .get_current_slot()
        .wrap_err("failed getting current slot")?;
    let boot = slot_ctrl
        .get_next_boot_slot()
        .wrap_err("failed getting next boot slot")?;
    let candidate = slot_ctrl
        .get_inactive_slot()
        .wrap_err("failed getting inactive slot")?;
    let last_invalid = slot_ctrl
        .get_last_invalid_slot()
        .wrap_err("failed getting last invalid slot")?;

    let mut out = String::new();
    for (role, slot) in [
        ("running", Some(running)),
        ("boot", Some(boot)),
        ("candidate", Some(candidate)),
        ("last invalid", last_invalid),
    ] {
        match slot {
            Some(slot) => writeln!(out, "{role}: {}", describe_slot(slot_ctrl, slot)?)?,
            None => writeln!(out, "{role}: -")?,
        }
    }
    Ok(out.trim_end().to_string())
}

fn describe_slot(slot_ctrl: &SlotCtrl, slot: Slot) -> eyre::Result<String> {
    let state = slot_ctrl
        .get_image_state(slot)
        .wrap_err_with(|| format!("failed getting image state of slot {slot}"))?;
    let image = match slot_ctrl.read_image_metadata(slot)? {
        Some(metadata) => format!(
            "`{}` {}",
            metadata.descriptor().project_name,
            metadata.version()
        ),
        None => "no image".to_string(),
    };
    Ok(format!("slot {slot} ({state}) {image}"))
}
