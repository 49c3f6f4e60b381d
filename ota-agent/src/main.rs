use std::{borrow::Cow, io, path::Path};

use clap::Parser as _;
use eyre::{WrapErr as _, eyre};
use ota_agent::{
    Args, Command, OtaAgentResult, Settings, UpdateAgent, UpdateConfig, UpdateGuard,
    console, logging,
    restart::{NoRestart, Restart, SystemctlReboot},
    transport::HttpsTransport,
};
use ota_slot_ctrl::{ImageState, SlotCtrl};
use tracing::{debug, error, info, warn};

const CFG_DEFAULT_PATH: &str = "/etc/ota_agent.conf";
const ENV_VAR_PREFIX: &str = "OTA_AGENT_";
const CFG_ENV_VAR: &str = const_format::concatcp!(ENV_VAR_PREFIX, "CONFIG");

fn main() -> OtaAgentResult {
    let args = Args::parse();
    let command = args.command.clone().unwrap_or(Command::Update { url: None });
    logging::init(command == Command::Console);

    match run(&args, command) {
        Ok(result) => result,
        Err(err) => {
            error!("{err:?}");
            err.into()
        }
    }
}

fn get_config_source(args: &Args) -> Cow<'_, Path> {
    if let Some(config) = &args.config {
        info!("using config provided by command line argument: `{config}`");
        Cow::Borrowed(config.as_ref())
    } else if let Some(config) = figment::providers::Env::var(CFG_ENV_VAR) {
        info!("using config set in environment variable `{CFG_ENV_VAR}={config}`");
        Cow::Owned(std::path::PathBuf::from(config))
    } else {
        info!("using default config at `{CFG_DEFAULT_PATH}`");
        Cow::Borrowed(CFG_DEFAULT_PATH.as_ref())
    }
}

fn run(args: &Args, command: Command) -> eyre::Result<OtaAgentResult> {
    color_eyre::install()?;

    let config_path = get_config_source(args);
    let settings = Settings::get(args, config_path, ENV_VAR_PREFIX)
        .wrap_err("failed reading settings")?;

    let settings_ser = match serde_json::to_string(&settings) {
        Ok(ser) => ser,
        Err(e) => {
            warn!("failed serializing settings as json, printing debug string: {e:?}");
            format!("{settings:?}")
        }
    };
    debug!("running with the following settings: {settings_ser}");

    let slot_ctrl = SlotCtrl::open(&settings.partitions).wrap_err_with(|| {
        format!(
            "failed opening partition directory `{}`",
            settings.partitions.display()
        )
    })?;

    match command {
        Command::Info => {
            println!("{}", ota_agent::info::describe(&slot_ctrl)?);
            Ok(OtaAgentResult::Success)
        }
        Command::Init => {
            let previous = slot_ctrl
                .mark_current_slot_ok()
                .wrap_err("failed marking current slot as valid")?;
            let current = slot_ctrl.get_current_slot()?;
            if previous == ImageState::PendingVerify {
                info!("slot {current} marked as valid");
            } else {
                info!("slot {current} is {previous}, nothing to confirm");
            }
            Ok(OtaAgentResult::Success)
        }
        Command::Update { url } => {
            let guard = make_guard(&settings, slot_ctrl);
            guard
                .request_update(url.as_deref())
                .wrap_err("failed spawning update worker")?;
            match guard.wait() {
                Some(Ok(Ok(()))) => Ok(OtaAgentResult::Success),
                // already logged by the worker
                Some(Ok(Err(err))) => Ok(OtaAgentResult::from(&err)),
                Some(Err(_)) => Err(eyre!("update worker panicked")),
                None => Err(eyre!("update worker vanished")),
            }
        }
        Command::Console => {
            let guard = make_guard(&settings, slot_ctrl.clone());
            console::run(io::stdin().lock(), io::stdout(), &guard, || {
                ota_agent::info::describe(&slot_ctrl)
            })
            .wrap_err("console failed")?;
            if guard.is_running() {
                info!("waiting for the running update before leaving");
            }
            if let Some(Err(_)) = guard.wait() {
                return Err(eyre!("update worker panicked"));
            }
            Ok(OtaAgentResult::Success)
        }
    }
}

fn make_guard(
    settings: &Settings,
    slot_ctrl: SlotCtrl,
) -> UpdateGuard<HttpsTransport, SlotCtrl, Box<dyn Restart>> {
    let restart: Box<dyn Restart> = if settings.norestart {
        debug!("norestart flag set; not restarting after the update");
        Box::new(NoRestart)
    } else {
        Box::new(SystemctlReboot)
    };
    let agent = UpdateAgent::new(
        HttpsTransport,
        slot_ctrl,
        restart,
        UpdateConfig::from(settings),
    );
    UpdateGuard::new(agent)
}
