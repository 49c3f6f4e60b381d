#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io::{self, Cursor},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use eyre::bail;
use ota_agent::{
    UpdateAgent, UpdateConfig,
    restart::Restart,
    storage::{RunningContext, Storage, WriteHandle},
    transport::{self, ConnectRequest, Connection, Transport},
};
use ota_agent_core::{ImageVersion, Slot, image::verify, test_utils::ImageBuilder};

pub const IMAGE_LEN: usize = 20_000;

/// A valid image of exactly [`IMAGE_LEN`] bytes.
pub fn image(version: &str) -> Vec<u8> {
    let image = ImageBuilder::new(version)
        .project_name("sensor")
        .payload(vec![0x5A; IMAGE_LEN - 336])
        .build();
    assert_eq!(image.len(), IMAGE_LEN);
    image
}

pub enum Step {
    Data(Vec<u8>),
    Fail(io::ErrorKind),
    /// Blocks the reading side until the sender sends or is dropped.
    Gate(flume::Receiver<()>),
}

/// What one connection delivers.
pub struct Script {
    steps: VecDeque<Step>,
    content_length: Option<u64>,
    complete_at_end: bool,
}

impl Script {
    /// Delivers `bytes` in chunks of `chunk` and reports the transfer complete.
    pub fn image(bytes: &[u8], chunk: usize) -> Self {
        Self {
            steps: bytes
                .chunks(chunk)
                .map(|chunk| Step::Data(chunk.to_vec()))
                .collect(),
            content_length: Some(bytes.len() as u64),
            complete_at_end: true,
        }
    }

    pub fn new(content_length: Option<u64>) -> Self {
        Self {
            steps: VecDeque::new(),
            content_length,
            complete_at_end: false,
        }
    }

    pub fn then(mut self, step: Step) -> Self {
        self.steps.push_back(step);
        self
    }

    pub fn complete(mut self) -> Self {
        self.complete_at_end = true;
        self
    }
}

/// Hands out one scripted connection per `open`. Fails to connect once the scripts
/// run out.
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    scripts: Arc<Mutex<VecDeque<Script>>>,
    urls: Arc<Mutex<Vec<String>>>,
}

impl ScriptedTransport {
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        let transport = Self::default();
        transport.scripts.lock().unwrap().extend(scripts);
        transport
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// URLs of every `open`, in order.
    pub fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }

    pub fn opened(&self) -> usize {
        self.urls.lock().unwrap().len()
    }
}

impl Transport for ScriptedTransport {
    type Connection = ScriptedConnection;

    fn open(&self, request: &ConnectRequest<'_>) -> Result<Self::Connection, transport::Error> {
        self.urls.lock().unwrap().push(request.url.to_string());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| transport::Error::InsecureScheme(request.url.to_string()))?;
        Ok(ScriptedConnection {
            script,
            current: Cursor::new(Vec::new()),
            ended: false,
        })
    }
}

pub struct ScriptedConnection {
    script: Script,
    current: Cursor<Vec<u8>>,
    ended: bool,
}

impl Connection for ScriptedConnection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let n = io::Read::read(&mut self.current, buf)?;
            if n > 0 {
                return Ok(n);
            }
            match self.script.steps.pop_front() {
                Some(Step::Data(data)) => self.current = Cursor::new(data),
                Some(Step::Fail(kind)) => return Err(io::Error::from(kind)),
                Some(Step::Gate(gate)) => {
                    let _ = gate.recv();
                }
                None => {
                    self.ended = true;
                    return Ok(0);
                }
            }
        }
    }

    fn is_transfer_complete(&self) -> bool {
        self.ended && self.script.complete_at_end
    }

    fn content_length(&self) -> Option<u64> {
        self.script.content_length
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriterCall {
    Write(usize),
    Finalize,
    Abort,
}

#[derive(Debug)]
pub struct StorageState {
    pub context: RunningContext,
    pub candidate: Slot,
    pub boot_slot: Slot,
    pub opened: Vec<Slot>,
    pub written: Vec<u8>,
    pub calls: Vec<WriterCall>,
    pub fail_context: bool,
    pub fail_commit: bool,
    /// Fails the write call with this index, counting from zero.
    pub fail_write_at: Option<usize>,
}

impl StorageState {
    pub fn count(&self, call: WriterCall) -> usize {
        self.calls.iter().filter(|&&c| c == call).count()
    }

    pub fn count_writes(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, WriterCall::Write(_)))
            .count()
    }
}

/// Keeps the written image in memory and records every call. Finalizing verifies the
/// image like a real slot does.
#[derive(Clone)]
pub struct RecordingStorage(pub Arc<Mutex<StorageState>>);

impl RecordingStorage {
    /// Running `running` from slot A, with `last_invalid` rejected earlier.
    pub fn new(running: &str, last_invalid: Option<&str>) -> Self {
        Self(Arc::new(Mutex::new(StorageState {
            context: RunningContext {
                running_slot: Slot::A,
                boot_slot: Slot::A,
                running_version: Some(ImageVersion::new(running)),
                last_invalid_version: last_invalid.map(ImageVersion::new),
            },
            candidate: Slot::B,
            boot_slot: Slot::A,
            opened: Vec::new(),
            written: Vec::new(),
            calls: Vec::new(),
            fail_context: false,
            fail_commit: false,
            fail_write_at: None,
        })))
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, StorageState> {
        self.0.lock().unwrap()
    }
}

impl Storage for RecordingStorage {
    type Writer = RecordingWriter;

    fn running_context(&self) -> eyre::Result<RunningContext> {
        let state = self.state();
        if state.fail_context {
            bail!("partition data unreadable");
        }
        Ok(state.context.clone())
    }

    fn candidate_slot(&self) -> eyre::Result<Slot> {
        Ok(self.state().candidate)
    }

    fn open(&self, slot: Slot) -> eyre::Result<Self::Writer> {
        let mut state = self.state();
        state.opened.push(slot);
        state.written.clear();
        Ok(RecordingWriter {
            storage: self.clone(),
            written: 0,
        })
    }

    fn set_boot_slot(&self, slot: Slot) -> eyre::Result<()> {
        let mut state = self.state();
        if state.fail_commit {
            bail!("partition data is read-only");
        }
        state.boot_slot = slot;
        Ok(())
    }
}

pub struct RecordingWriter {
    storage: RecordingStorage,
    written: u64,
}

impl WriteHandle for RecordingWriter {
    fn write(&mut self, buf: &[u8]) -> eyre::Result<()> {
        let mut state = self.storage.state();
        let index = state.count_writes();
        if state.fail_write_at == Some(index) {
            bail!("flash write failed at call {index}");
        }
        state.written.extend_from_slice(buf);
        state.calls.push(WriterCall::Write(buf.len()));
        self.written += buf.len() as u64;
        Ok(())
    }

    fn finalize(&mut self) -> eyre::Result<()> {
        let mut state = self.storage.state();
        state.calls.push(WriterCall::Finalize);
        verify(Cursor::new(&state.written))?;
        Ok(())
    }

    fn abort(&mut self) {
        self.storage.state().calls.push(WriterCall::Abort);
    }

    fn written(&self) -> u64 {
        self.written
    }
}

#[derive(Clone, Default)]
pub struct CountingRestart {
    pub count: Arc<AtomicUsize>,
}

impl CountingRestart {
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Restart for CountingRestart {
    fn restart(&self) -> eyre::Result<()> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FailingRestart;

impl Restart for FailingRestart {
    fn restart(&self) -> eyre::Result<()> {
        bail!("systemctl not found")
    }
}

pub struct PanickingRestart;

impl Restart for PanickingRestart {
    fn restart(&self) -> eyre::Result<()> {
        panic!("restart exploded")
    }
}

pub fn config() -> UpdateConfig {
    UpdateConfig {
        default_url: "https://updates.example.com/default.bin".to_string(),
        ..UpdateConfig::default()
    }
}

pub type TestAgent = UpdateAgent<ScriptedTransport, RecordingStorage, CountingRestart>;

pub fn agent(
    transport: &ScriptedTransport,
    storage: &RecordingStorage,
    restart: &CountingRestart,
    config: UpdateConfig,
) -> TestAgent {
    UpdateAgent::new(transport.clone(), storage.clone(), restart.clone(), config)
}
