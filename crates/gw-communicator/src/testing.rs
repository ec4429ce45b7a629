//! Scripted fakes for the communicator tests

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use gw_core::config::{CommunicatorConfig, EndpointDescriptor, SshInfo};
use gw_core::error::CapabilityError;
use gw_core::traits::{
    ChannelEvent, ExecChannel, GuestCapabilities, Machine, ProgressSink, Transport,
    TransportSession, INSERT_PUBLIC_KEY, REMOVE_PUBLIC_KEY,
};
use gw_core::{ErrorKind, TransportError};
use gw_protocol::{ScpCodec, ScpMessage, ScpRecord};

use crate::communicator::Communicator;

type Responder = Arc<dyn Fn(&ExecRecord) -> Vec<ChannelEvent> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

/// Everything one channel was asked to do
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecRecord {
    pub(crate) command: String,
    pub(crate) stdin: Vec<u8>,
    pub(crate) pty: bool,
    pub(crate) agent_forwarding: bool,
    pub(crate) env: Vec<(String, String)>,
}

/// Output of a well-behaved login shell running the script in `record`
///
/// Raw scripts get a login banner, then the marker and the output on each
/// stream. Pty scripts get the echoed script followed by the delimited
/// output, with newlines translated the way a terminal does.
pub(crate) fn shell_reply(record: &ExecRecord, stdout: &str, stderr: &str, status: u32) -> Vec<ChannelEvent> {
    let script = String::from_utf8_lossy(&record.stdin).into_owned();

    let events = if record.pty {
        let start = printf_arg(&script, "-gw-pty-start");
        let end = printf_arg(&script, "-gw-pty-end");
        let mut transcript = script.replace('\n', "\r\n");
        transcript.push_str(&start);
        transcript.push_str(&format!("{}{}", stdout, stderr).replace('\n', "\r\n"));
        transcript.push_str(&end);
        transcript.push_str("logout\r\n");
        vec![ChannelEvent::Stdout(Bytes::from(transcript))]
    } else {
        let marker = printf_arg(&script, "-gw-banner");
        vec![
            ChannelEvent::Stdout(Bytes::from(format!(
                "Welcome to the guest!\n\x1b[1mLast login: never\x1b[0m\n{}{}",
                marker, stdout
            ))),
            ChannelEvent::Stderr(Bytes::from(format!("{}{}", marker, stderr))),
        ]
    };

    let mut events = events;
    events.push(ChannelEvent::ExitStatus(status));
    events.push(ChannelEvent::Eof);
    events.push(ChannelEvent::Close);
    events
}

/// The marker printed by a `printf` line of the script
fn printf_arg(script: &str, suffix: &str) -> String {
    script
        .lines()
        .filter_map(|line| line.strip_prefix("printf "))
        .map(|arg| arg.trim_matches('\''))
        .find(|arg| arg.ends_with(suffix))
        .unwrap_or_default()
        .to_string()
}

/// The command a raw or pty script runs
fn script_command(script: &str) -> String {
    let lines: Vec<&str> = script.lines().collect();
    let after = lines
        .iter()
        .rposition(|line| {
            line.starts_with("(>&2 printf")
                || (line.starts_with("printf ") && line.ends_with("-gw-pty-start"))
        })
        .map(|pos| pos + 1)
        .unwrap_or(0);
    lines.get(after).map(|line| line.to_string()).unwrap_or_default()
}

/// A small shell: `echo`, `true`, `false`, everything else succeeds silently
fn default_responder(record: &ExecRecord) -> Vec<ChannelEvent> {
    let script = String::from_utf8_lossy(&record.stdin).into_owned();
    let command = script_command(&script);
    match command.as_str() {
        "false" => shell_reply(record, "", "", 1),
        cmd if cmd.starts_with("echo ") => {
            shell_reply(record, &format!("{}\n", &cmd["echo ".len()..]), "", 0)
        }
        _ => shell_reply(record, "", "", 0),
    }
}

#[derive(Clone, Default)]
enum ScpMode {
    /// Acknowledge everything
    #[default]
    Accept,
    /// Exit with this status before acknowledging anything
    Exit(u32),
    /// Answer the first ack with a warning
    Reject(String),
}

struct TransportState {
    failures: VecDeque<ErrorKind>,
    /// Connect attempts still to hang forever
    hangs: usize,
    responder: Responder,
    execs: Vec<ExecRecord>,
    host_key_algorithms: Vec<String>,
    scp_mode: ScpMode,
    scp_source: Vec<u8>,
    reset_after_events: bool,
}

/// Transport whose sessions run scripted channels
pub(crate) struct FakeTransport {
    state: Arc<Mutex<TransportState>>,
    pub(crate) connects: AtomicUsize,
    pub(crate) closes: Arc<AtomicUsize>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeTransport {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TransportState {
                failures: VecDeque::new(),
                hangs: 0,
                responder: Arc::new(default_responder),
                execs: Vec::new(),
                host_key_algorithms: vec!["ssh-ed25519".to_string()],
                scp_mode: ScpMode::Accept,
                scp_source: Vec::new(),
                reset_after_events: false,
            })),
            connects: AtomicUsize::new(0),
            closes: Arc::new(AtomicUsize::new(0)),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Fail the next connect attempts with these kinds, in order
    pub(crate) fn fail_next(&self, kinds: &[ErrorKind]) {
        lock(&self.state).failures.extend(kinds.iter().copied());
    }

    /// Never complete the next `count` connect attempts
    pub(crate) fn hang_next(&self, count: usize) {
        lock(&self.state).hangs += count;
    }

    /// Replace the shell behind every channel
    pub(crate) fn respond<F>(&self, responder: F)
    where
        F: Fn(&ExecRecord) -> Vec<ChannelEvent> + Send + Sync + 'static,
    {
        lock(&self.state).responder = Arc::new(responder);
    }

    /// Report a connection reset once the scripted events run out
    pub(crate) fn reset_after_events(&self) {
        lock(&self.state).reset_after_events = true;
    }

    pub(crate) fn set_host_key_algorithms(&self, algorithms: Vec<String>) {
        lock(&self.state).host_key_algorithms = algorithms;
    }

    pub(crate) fn scp_exit_status(&self, status: u32) {
        lock(&self.state).scp_mode = ScpMode::Exit(status);
    }

    pub(crate) fn scp_reject(&self, message: &str) {
        lock(&self.state).scp_mode = ScpMode::Reject(message.to_string());
    }

    /// Bytes a remote `scp -f` sends
    pub(crate) fn scp_source(&self, stream: Vec<u8>) {
        lock(&self.state).scp_source = stream;
    }

    /// Make every live session fail its liveness probe
    pub(crate) fn break_sessions(&self) {
        for session in lock(&self.sessions).iter() {
            session.broken.store(true, Ordering::SeqCst);
        }
    }

    /// Make every live session's liveness probe hang
    pub(crate) fn hang_probes(&self) {
        for session in lock(&self.sessions).iter() {
            session.hanging.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn execs(&self) -> Vec<ExecRecord> {
        lock(&self.state).execs.clone()
    }

    pub(crate) fn last_exec(&self) -> Option<ExecRecord> {
        lock(&self.state).execs.last().cloned()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(
        &self,
        _endpoint: &EndpointDescriptor,
    ) -> Result<Arc<dyn TransportSession>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let hang = {
            let mut state = lock(&self.state);
            if state.hangs > 0 {
                state.hangs -= 1;
                true
            } else {
                false
            }
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(kind) = lock(&self.state).failures.pop_front() {
            return Err(TransportError::new(kind, "scripted failure"));
        }

        let session = Arc::new(FakeSession {
            state: Arc::clone(&self.state),
            broken: AtomicBool::new(false),
            hanging: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closes: Arc::clone(&self.closes),
        });
        lock(&self.sessions).push(Arc::clone(&session));
        Ok(session)
    }
}

pub(crate) struct FakeSession {
    state: Arc<Mutex<TransportState>>,
    broken: AtomicBool,
    hanging: AtomicBool,
    closed: AtomicBool,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl TransportSession for FakeSession {
    async fn open_channel(&self) -> Result<Box<dyn ExecChannel>, TransportError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(TransportError::new(ErrorKind::Disconnected, "session broken"));
        }
        Ok(Box::new(FakeChannel {
            state: Arc::clone(&self.state),
            record: ExecRecord::default(),
            eof: false,
            events: None,
        }))
    }

    fn host_key_algorithms(&self) -> Vec<String> {
        lock(&self.state).host_key_algorithms.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self) -> Result<(), TransportError> {
        if self.hanging.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.broken.load(Ordering::SeqCst) {
            return Err(TransportError::new(ErrorKind::Disconnected, "session broken"));
        }
        Ok(())
    }
}

struct FakeChannel {
    state: Arc<Mutex<TransportState>>,
    record: ExecRecord,
    eof: bool,
    events: Option<VecDeque<ChannelEvent>>,
}

impl FakeChannel {
    fn is_scp_sink(&self) -> bool {
        self.record.command.starts_with("scp -t")
    }

    fn is_scp_source(&self) -> bool {
        self.record.command.starts_with("scp -r -f") || self.record.command.starts_with("scp -f")
    }

    fn script_events(&self) -> VecDeque<ChannelEvent> {
        let state = lock(&self.state);
        if self.is_scp_source() {
            return VecDeque::from(vec![
                ChannelEvent::Stdout(Bytes::from(state.scp_source.clone())),
                ChannelEvent::ExitStatus(0),
                ChannelEvent::Close,
            ]);
        }
        if self.is_scp_sink() {
            return VecDeque::from(vec![ChannelEvent::ExitStatus(0), ChannelEvent::Close]);
        }
        let responder = Arc::clone(&state.responder);
        drop(state);
        responder(&self.record).into()
    }
}

impl Drop for FakeChannel {
    fn drop(&mut self) {
        if !self.record.command.is_empty() || !self.record.stdin.is_empty() {
            lock(&self.state).execs.push(std::mem::take(&mut self.record));
        }
    }
}

#[async_trait]
impl ExecChannel for FakeChannel {
    async fn request_pty(&mut self) -> Result<(), TransportError> {
        self.record.pty = true;
        Ok(())
    }

    async fn request_agent_forwarding(&mut self) -> Result<(), TransportError> {
        self.record.agent_forwarding = true;
        Ok(())
    }

    async fn set_env(&mut self, name: &str, value: &str) -> Result<(), TransportError> {
        self.record.env.push((name.to_string(), value.to_string()));
        Ok(())
    }

    async fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        self.record.command = command.to_string();
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.record.stdin.extend_from_slice(data);
        Ok(())
    }

    async fn eof(&mut self) -> Result<(), TransportError> {
        self.eof = true;
        Ok(())
    }

    async fn next_event(&mut self) -> Result<Option<ChannelEvent>, TransportError> {
        if self.events.is_none() {
            if self.is_scp_sink() && !self.eof {
                let mode = lock(&self.state).scp_mode.clone();
                match mode {
                    ScpMode::Accept => {
                        return Ok(Some(ChannelEvent::Stdout(Bytes::from_static(b"\0"))))
                    }
                    ScpMode::Reject(message) => {
                        return Ok(Some(ChannelEvent::Stdout(Bytes::from(format!(
                            "\x01{}\n",
                            message
                        )))))
                    }
                    ScpMode::Exit(status) => {
                        self.events = Some(VecDeque::from(vec![
                            ChannelEvent::Stderr(Bytes::from_static(
                                b"bash: scp: command not found\n",
                            )),
                            ChannelEvent::ExitStatus(status),
                            ChannelEvent::Close,
                        ]));
                    }
                }
            } else {
                self.events = Some(self.script_events());
            }
        }

        match self.events.as_mut().and_then(VecDeque::pop_front) {
            Some(event) => Ok(Some(event)),
            None if lock(&self.state).reset_after_events => Err(TransportError::new(
                ErrorKind::ConnectionReset,
                "connection reset by peer",
            )),
            None => Ok(None),
        }
    }
}

/// Machine with a settable SSH info and a temporary data dir
pub(crate) struct FakeMachine {
    info: Mutex<Option<SshInfo>>,
    data_dir: tempfile::TempDir,
}

impl FakeMachine {
    pub(crate) fn set_ssh_info(&self, info: Option<SshInfo>) {
        *lock(&self.info) = info;
    }

    pub(crate) fn ssh_info_now(&self) -> Option<SshInfo> {
        lock(&self.info).clone()
    }

    pub(crate) fn data_dir_path(&self) -> PathBuf {
        self.data_dir.path().to_path_buf()
    }
}

#[async_trait]
impl Machine for FakeMachine {
    async fn ssh_info(&self) -> Option<SshInfo> {
        lock(&self.info).clone()
    }

    fn data_dir(&self) -> PathBuf {
        self.data_dir_path()
    }
}

/// Guest with a capability set and an invocation log
pub(crate) struct FakeGuest {
    capabilities: Mutex<HashSet<String>>,
    invocations: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeGuest {
    pub(crate) fn remove_capability(&self, name: &str) {
        lock(&self.capabilities).remove(name);
    }

    pub(crate) fn calls(&self, name: &str) -> usize {
        self.args(name).len()
    }

    pub(crate) fn args(&self, name: &str) -> Vec<Vec<String>> {
        lock(&self.invocations)
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, args)| args.clone())
            .collect()
    }
}

#[async_trait]
impl GuestCapabilities for FakeGuest {
    async fn has_capability(&self, name: &str) -> bool {
        lock(&self.capabilities).contains(name)
    }

    async fn capability(&self, name: &str, args: &[String]) -> Result<(), CapabilityError> {
        if !lock(&self.capabilities).contains(name) {
            return Err(CapabilityError::Unavailable(name.to_string()));
        }
        lock(&self.invocations).push((name.to_string(), args.to_vec()));
        // Let concurrent callers interleave
        tokio::task::yield_now().await;
        Ok(())
    }
}

/// Sink that keeps every line, grouped by level
#[derive(Default)]
pub(crate) struct RecordingSink {
    lines: Mutex<HashMap<&'static str, Vec<String>>>,
}

impl RecordingSink {
    pub(crate) fn lines(&self, level: &str) -> Vec<String> {
        lock(&self.lines).get(level).cloned().unwrap_or_default()
    }

    fn push(&self, level: &'static str, message: &str) {
        lock(&self.lines)
            .entry(level)
            .or_default()
            .push(message.to_string());
    }
}

impl ProgressSink for RecordingSink {
    fn info(&self, message: &str) {
        self.push("info", message);
    }

    fn detail(&self, message: &str) {
        self.push("detail", message);
    }

    fn warn(&self, message: &str) {
        self.push("warn", message);
    }

    fn success(&self, message: &str) {
        self.push("success", message);
    }

    fn error(&self, message: &str) {
        self.push("error", message);
    }
}

/// A communicator wired to fakes
pub(crate) struct Harness {
    pub(crate) transport: Arc<FakeTransport>,
    pub(crate) machine: Arc<FakeMachine>,
    pub(crate) guest: Arc<FakeGuest>,
    pub(crate) sink: Arc<RecordingSink>,
    config: CommunicatorConfig,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_config(CommunicatorConfig::default())
    }

    pub(crate) fn with_config(config: CommunicatorConfig) -> Self {
        let machine = FakeMachine {
            info: Mutex::new(Some(SshInfo::new("127.0.0.1", 2222, "vagrant"))),
            data_dir: tempfile::tempdir().unwrap(),
        };
        let guest = FakeGuest {
            capabilities: Mutex::new(
                [INSERT_PUBLIC_KEY, REMOVE_PUBLIC_KEY]
                    .into_iter()
                    .map(String::from)
                    .collect(),
            ),
            invocations: Mutex::new(Vec::new()),
        };

        Self {
            transport: Arc::new(FakeTransport::new()),
            machine: Arc::new(machine),
            guest: Arc::new(guest),
            sink: Arc::new(RecordingSink::default()),
            config,
        }
    }

    pub(crate) fn communicator(&self) -> Communicator {
        self.communicator_with(self.config.clone())
    }

    pub(crate) fn communicator_with(&self, config: CommunicatorConfig) -> Communicator {
        Communicator::with_transport(
            self.machine.clone(),
            self.guest.clone(),
            self.sink.clone(),
            config,
            self.transport.clone(),
        )
    }
}

/// What the remote side received during uploads
#[derive(Debug, Default)]
pub(crate) struct ScpSink {
    /// Directories created with `mkdir -p`, in order
    pub(crate) mkdirs: Vec<String>,
    /// (destination, record name, contents) per file
    pub(crate) files: Vec<(String, String, Vec<u8>)>,
}

impl ScpSink {
    pub(crate) fn from_execs(execs: &[ExecRecord]) -> Self {
        let mut sink = Self::default();

        for record in execs {
            if let Some(dest) = record.command.strip_prefix("scp -t ") {
                let mut buf = BytesMut::from(&record.stdin[..]);
                if let Ok(Some(ScpMessage::Record(ScpRecord::File { size, name, .. }))) =
                    ScpCodec::new().decode(&mut buf)
                {
                    let contents = buf[..size as usize].to_vec();
                    sink.files.push((dest.trim_matches('\'').to_string(), name, contents));
                }
                continue;
            }

            let script = String::from_utf8_lossy(&record.stdin);
            let command = script_command(&script);
            if let Some(dir) = command.strip_prefix("mkdir -p ") {
                sink.mkdirs.push(dir.trim_matches('\'').to_string());
            }
        }

        sink
    }
}
