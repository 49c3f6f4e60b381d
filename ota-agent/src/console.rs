//! Line based console for requesting updates interactively.

use std::io::{self, BufRead, Write};

use tracing::warn;

use crate::{
    guard::{Requested, UpdateGuard},
    restart::Restart,
    storage::Storage,
    transport::Transport,
};

pub const PROMPT: &str = "ota> ";

const HELP: &str = "\
commands:
  ota [url]   start an update, from the default URL if none is given
  info        print the slots and their images
  help        print this message
  exit        leave the console";

/// Reads commands from `input` until it ends or `exit` is entered. Update requests
/// return as soon as the worker is started.
pub fn run<B, W, T, S, R, F>(
    input: B,
    mut output: W,
    guard: &UpdateGuard<T, S, R>,
    mut info: F,
) -> io::Result<()>
where
    B: BufRead,
    W: Write,
    T: Transport,
    S: Storage,
    R: Restart,
    F: FnMut() -> eyre::Result<String>,
{
    write!(output, "{PROMPT}")?;
    output.flush()?;
    for line in input.lines() {
        let line = line?;
        let words = line.split_whitespace().collect::<Vec<_>>();
        match words.as_slice() {
            [] => {}
            ["ota", url @ ..] if url.len() <= 1 => {
                match guard.request_update(url.first().copied())? {
                    Requested::Accepted => writeln!(output, "update started")?,
                    Requested::AlreadyRunning => {
                        writeln!(output, "an update is already running")?;
                    }
                }
            }
            ["ota", ..] => writeln!(output, "usage: ota [url]")?,
            ["info"] => match info() {
                Ok(text) => writeln!(output, "{text}")?,
                Err(err) => {
                    warn!("failed reading slot info: {err:?}");
                    writeln!(output, "failed reading slot info: {err}")?;
                }
            },
            ["help"] => writeln!(output, "{HELP}")?,
            ["exit" | "quit"] => return Ok(()),
            [cmd, ..] => writeln!(output, "unknown command `{cmd}`, try `help`")?,
        }
        write!(output, "{PROMPT}")?;
        output.flush()?;
    }
    Ok(())
}
