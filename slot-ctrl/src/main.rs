use clap::Parser;
use color_eyre::eyre::Result;
use ota_slot_ctrl::program::{self, Cli};

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    let out = program::run(cli)?;
    if !out.is_empty() {
        println!("{out}");
    }
    Ok(())
}
