//! Over-the-air firmware updates: an image is streamed over HTTPS into the inactive
//! slot, verified there, and made the boot target before the device restarts.

pub mod console;
pub mod error;
pub mod guard;
pub mod info;
pub mod logging;
pub mod orchestrator;
pub mod ota_agent_result;
pub mod restart;
pub mod settings;
pub mod storage;
pub mod transport;

pub use error::{FailureReason, UpdateError};
pub use guard::{Requested, UpdateGuard};
pub use orchestrator::{Phase, UpdateAgent, UpdateConfig, UpdateEvent};
pub use ota_agent_result::OtaAgentResult;
pub use settings::{Args, Command, Settings};
