//! Drives a single update attempt through its phases:
//!
//! 1. read the running slot context from storage and connect to the update URL;
//! 2. buffer the stream until the image metadata can be read and decide whether the
//!    offered image is acceptable;
//! 3. open the candidate slot and stream the image into it;
//! 4. finalize the slot once the transfer is complete, which verifies the image;
//! 5. make the candidate slot the boot target and request a restart.
//!
//! Any failure moves the attempt to [`Phase::Failed`], after which the candidate slot
//! is aborted and the connection closed in one place.

use std::{
    error::Error as _,
    io,
    path::PathBuf,
    time::{Duration, Instant},
};

use ota_agent_core::{ImageMetadata, Policy, image::IMAGE_METADATA_LEN};
use tracing::{debug, error, info, warn};

use crate::{
    error::{FailureReason, UpdateError},
    restart::Restart,
    settings::Settings,
    storage::{Storage, WriteHandle},
    transport::{ConnectRequest, Connection, Transport},
};

/// Size of the buffer the stream is read through.
pub const READ_BUFFER_LEN: usize = 1024;
const PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    AwaitingHeader,
    Writing,
    Finalizing,
    CommittingBoot,
    Restarting,
    Failed(FailureReason),
}

/// Published to observers of an update. Observers never influence the update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdateEvent {
    Phase(Phase),
    Progress { written: u64, total: Option<u64> },
}

/// The options of an update, fixed when the agent is constructed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateConfig {
    pub default_url: String,
    pub receive_timeout: Duration,
    pub trust_anchor: Option<PathBuf>,
    pub skip_hostname_verification: bool,
    pub keep_alive: bool,
    pub policy: Policy,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for UpdateConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            default_url: settings.default_url.clone(),
            receive_timeout: settings.receive_timeout,
            trust_anchor: settings.trust_anchor.clone(),
            skip_hostname_verification: settings.skip_hostname_verification,
            keep_alive: settings.keep_alive,
            policy: Policy {
                minor_gate: settings.minor_gate,
                wildcard_minors: settings.minor_gate_wildcards.clone(),
                reject_same_version: settings.reject_same_version,
            },
        }
    }
}

/// Everything an update needs: where images come from, where they go, and how the
/// device is restarted afterwards.
pub struct UpdateAgent<T, S, R> {
    transport: T,
    storage: S,
    restart: R,
    config: UpdateConfig,
    events: Option<flume::Sender<UpdateEvent>>,
}

impl<T, S, R> UpdateAgent<T, S, R>
where
    T: Transport,
    S: Storage,
    R: Restart,
{
    pub fn new(transport: T, storage: S, restart: R, config: UpdateConfig) -> Self {
        Self {
            transport,
            storage,
            restart,
            config,
            events: None,
        }
    }

    /// Publishes phase changes and progress of every update on `events`.
    #[must_use]
    pub fn with_events(mut self, events: flume::Sender<UpdateEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// The URL an update request resolves to; the configured default stands in for a
    /// missing or empty one.
    #[must_use]
    pub fn resolve_url(&self, url: Option<&str>) -> String {
        url.filter(|url| !url.is_empty())
            .unwrap_or(&self.config.default_url)
            .to_string()
    }

    /// Runs one update attempt to completion. `Ok` means a restart was requested.
    pub fn run(&self, url: &str) -> Result<(), UpdateError> {
        Orchestrator {
            agent: self,
            session: Session::new(url, self.events.clone()),
            connection: None,
            writer: None,
        }
        .run()
    }
}

struct Orchestrator<'a, T: Transport, S: Storage, R> {
    agent: &'a UpdateAgent<T, S, R>,
    session: Session,
    connection: Option<T::Connection>,
    writer: Option<S::Writer>,
}

impl<T, S, R> Orchestrator<'_, T, S, R>
where
    T: Transport,
    S: Storage,
    R: Restart,
{
    fn run(mut self) -> Result<(), UpdateError> {
        info!("starting update from `{}`", self.session.url);
        match self.drive() {
            Ok(()) => Ok(()),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn drive(&mut self) -> Result<(), UpdateError> {
        let Self {
            agent,
            session,
            connection,
            writer,
        } = self;
        let config = &agent.config;

        session.enter(Phase::Connecting);
        let context = agent
            .storage
            .running_context()
            .map_err(UpdateError::Context)?;
        info!("{context}");
        let request = ConnectRequest {
            url: &session.url,
            trust_anchor: config.trust_anchor.as_deref(),
            timeout: config.receive_timeout,
            keep_alive: config.keep_alive,
            skip_hostname_verification: config.skip_hostname_verification,
        };
        let conn = agent
            .transport
            .open(&request)
            .map_err(|source| UpdateError::Connect {
                url: session.url.clone(),
                source,
            })?;
        let conn = connection.insert(conn);
        session.total = conn.content_length();

        session.enter(Phase::AwaitingHeader);
        let mut buf = [0; READ_BUFFER_LEN];
        let header = read_header(conn, &mut buf)?;
        let metadata = ImageMetadata::parse(&header)?;
        info!(
            "offered image `{}` version `{}`",
            metadata.descriptor().project_name,
            metadata.version()
        );
        config.policy.evaluate(
            metadata.version(),
            context.running_version.as_ref(),
            context.last_invalid_version.as_ref(),
        )?;

        let slot = agent
            .storage
            .candidate_slot()
            .map_err(UpdateError::Context)?;
        let handle = agent
            .storage
            .open(slot)
            .map_err(|source| UpdateError::StorageWrite { slot, source })?;
        let handle = writer.insert(handle);
        info!("writing image to slot {slot}");

        session.enter(Phase::Writing);
        handle
            .write(&header)
            .map_err(|source| UpdateError::StorageWrite { slot, source })?;
        session.record(header.len() as u64);
        loop {
            let n = match conn.read(&mut buf) {
                Ok(0) if conn.is_transfer_complete() => break,
                Ok(0) => {
                    return Err(UpdateError::TransferInterrupted {
                        received: session.written,
                        source: None,
                    });
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(UpdateError::TransferInterrupted {
                        received: session.written,
                        source: Some(e),
                    });
                }
            };
            handle
                .write(&buf[..n])
                .map_err(|source| UpdateError::StorageWrite { slot, source })?;
            session.record(n as u64);
        }
        *connection = None;
        info!("received {} bytes", session.written);

        session.enter(Phase::Finalizing);
        handle
            .finalize()
            .map_err(|source| UpdateError::Integrity { slot, source })?;
        *writer = None;

        session.enter(Phase::CommittingBoot);
        agent
            .storage
            .set_boot_slot(slot)
            .map_err(|source| UpdateError::Commit { slot, source })?;
        info!("slot {slot} is the next boot target");

        session.enter(Phase::Restarting);
        agent.restart.restart().map_err(UpdateError::Restart)
    }

    /// The cleanup shared by every failure.
    fn fail(&mut self, err: UpdateError) -> UpdateError {
        if let Some(mut writer) = self.writer.take() {
            warn!("aborting candidate slot after {} bytes", writer.written());
            writer.abort();
        }
        self.connection = None;

        let reason = err.reason();
        let mut chain = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            chain.push_str(": ");
            chain.push_str(&cause.to_string());
            source = cause.source();
        }
        error!("update from `{}` failed ({reason}): {chain}", self.session.url);
        self.session.enter(Phase::Failed(reason));
        err
    }
}

/// Reads until the image metadata is buffered. Everything read is returned and is
/// written to the slot first.
fn read_header<C: Connection>(
    conn: &mut C,
    buf: &mut [u8],
) -> Result<Vec<u8>, UpdateError> {
    let mut header = Vec::with_capacity(IMAGE_METADATA_LEN + buf.len());
    while header.len() < IMAGE_METADATA_LEN {
        match conn.read(buf) {
            Ok(0) => {
                return Err(UpdateError::HeaderTooShort {
                    received: header.len(),
                    needed: IMAGE_METADATA_LEN,
                });
            }
            Ok(n) => header.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                return Err(UpdateError::TransferInterrupted {
                    received: header.len() as u64,
                    source: Some(e),
                });
            }
        }
    }
    Ok(header)
}

struct Session {
    url: String,
    phase: Phase,
    written: u64,
    total: Option<u64>,
    last_report: Instant,
    events: Option<flume::Sender<UpdateEvent>>,
}

impl Session {
    fn new(url: &str, events: Option<flume::Sender<UpdateEvent>>) -> Self {
        Self {
            url: url.to_string(),
            phase: Phase::Idle,
            written: 0,
            total: None,
            last_report: Instant::now(),
            events,
        }
    }

    fn enter(&mut self, phase: Phase) {
        debug!("update phase {:?} -> {phase:?}", self.phase);
        self.phase = phase;
        if phase == Phase::Writing {
            self.last_report = Instant::now();
        }
        self.publish(UpdateEvent::Phase(phase));
    }

    fn record(&mut self, n: u64) {
        self.written += n;
        if self.last_report.elapsed() < PROGRESS_INTERVAL {
            return;
        }
        self.last_report = Instant::now();
        match self.total {
            Some(total) => info!(
                "written {} of {total} bytes ({}%)",
                self.written,
                self.written.saturating_mul(100) / total.max(1)
            ),
            None => info!("written {} bytes", self.written),
        }
        self.publish(UpdateEvent::Progress {
            written: self.written,
            total: self.total,
        });
    }

    fn publish(&self, event: UpdateEvent) {
        if let Some(events) = &self.events {
            // nobody listening is fine
            let _ = events.send(event);
        }
    }
}
