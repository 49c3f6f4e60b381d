use std::process::Command;

use eyre::{WrapErr as _, ensure};
use tracing::{debug, info};

/// Restarts the device so the bootloader picks up the new boot slot.
pub trait Restart: Send + Sync + 'static {
    fn restart(&self) -> eyre::Result<()>;
}

impl<T: Restart + ?Sized> Restart for Box<T> {
    fn restart(&self) -> eyre::Result<()> {
        (**self).restart()
    }
}

/// Reboots through `systemctl`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemctlReboot;

impl Restart for SystemctlReboot {
    fn restart(&self) -> eyre::Result<()> {
        debug!("rebooting using `/bin/systemctl reboot`");
        let output = Command::new("/bin/systemctl")
            .arg("reboot")
            .output()
            .wrap_err("failed spawning `/bin/systemctl reboot`")?;
        ensure!(
            output.status.success(),
            "command `/bin/systemctl reboot` failed with status code `{:?}` and stderr `{:?}`",
            output.status,
            String::from_utf8_lossy(&output.stderr),
        );
        Ok(())
    }
}

/// Leaves the device running; the new image boots on the next restart.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRestart;

impl Restart for NoRestart {
    fn restart(&self) -> eyre::Result<()> {
        info!("norestart set, the new image boots on the next restart");
        Ok(())
    }
}
