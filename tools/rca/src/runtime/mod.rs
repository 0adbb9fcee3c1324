use crate::errors::RcaError;
use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);
const PIPE_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Merged over the inherited parent environment.
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

pub trait ProcessRunner: Send + Sync {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, RcaError>;
    /// Blocks until exit or the request timeout; a timed-out child is killed
    /// and reaped before returning.
    fn wait(&self, handle: u64) -> Result<ProcessOutput, RcaError>;
    fn kill(&self, handle: u64) -> Result<(), RcaError>;

    fn run(&self, request: ProcessRequest) -> Result<ProcessOutput, RcaError> {
        let handle = self.spawn(request)?;
        self.wait(handle)
    }
}

pub trait FileSystem: Send + Sync {
    fn read_to_string(&self, path: &Path) -> Result<String, RcaError>;
    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, RcaError>;
    fn exists(&self, path: &Path) -> bool;
}

pub trait Terminal: Send + Sync {
    fn write_line(&self, line: &str) -> Result<(), RcaError>;
}

/// Finds executables on the host, e.g. the container engine.
pub trait ExecutableLocator: Send + Sync {
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

pub struct ProductionClock;

impl Clock for ProductionClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

pub struct ProductionFileSystem;

impl FileSystem for ProductionFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, RcaError> {
        std::fs::read_to_string(path).map_err(|e| RcaError::Io(e.to_string()))
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, RcaError> {
        std::fs::read(path).map_err(|e| RcaError::Io(e.to_string()))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }
}

pub struct PathLocator {
    search_path: Option<std::ffi::OsString>,
}

impl PathLocator {
    pub fn from_env() -> Self {
        Self {
            search_path: std::env::var_os("PATH"),
        }
    }

    pub fn with_search_path(search_path: impl Into<std::ffi::OsString>) -> Self {
        Self {
            search_path: Some(search_path.into()),
        }
    }
}

impl ExecutableLocator for PathLocator {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        let candidate = Path::new(program);
        if candidate.components().count() > 1 {
            return candidate.is_file().then(|| candidate.to_path_buf());
        }
        let search_path = self.search_path.as_ref()?;
        std::env::split_paths(search_path)
            .map(|dir| dir.join(program))
            .find(|path| path.is_file())
    }
}

struct RunningChild {
    child: Child,
    started: Instant,
    timeout: Option<Duration>,
}

#[derive(Default)]
struct ProcessState {
    next_handle: u64,
    children: HashMap<u64, RunningChild>,
}

pub struct ProductionProcessRunner {
    state: Mutex<ProcessState>,
}

impl ProductionProcessRunner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProcessState::default()),
        }
    }

    fn take_child(&self, handle: u64) -> Result<RunningChild, RcaError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| RcaError::Process("process lock poisoned".to_string()))?;
        state
            .children
            .remove(&handle)
            .ok_or_else(|| RcaError::Process(format!("unknown handle {handle}")))
    }
}

impl Default for ProductionProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<String>> {
    pipe.map(|mut pipe| {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send(String::from_utf8_lossy(&buf).to_string());
        });
        rx
    })
}

/// Grandchildren of a killed process may keep the pipe open; after a timeout
/// only wait a short grace period for the remaining output.
fn collect(reader: Option<Receiver<String>>, timed_out: bool) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    if timed_out {
        reader.recv_timeout(PIPE_GRACE).unwrap_or_default()
    } else {
        reader.recv().unwrap_or_default()
    }
}

impl ProcessRunner for ProductionProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, RcaError> {
        let mut cmd = std::process::Command::new(&request.program);
        cmd.args(&request.args);
        if let Some(cwd) = &request.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&request.env);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let child = cmd.spawn().map_err(|e| RcaError::Process(e.to_string()))?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| RcaError::Process("process lock poisoned".to_string()))?;
        let handle = state.next_handle;
        state.next_handle += 1;
        state.children.insert(
            handle,
            RunningChild {
                child,
                started: Instant::now(),
                timeout: request.timeout,
            },
        );
        Ok(handle)
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, RcaError> {
        let RunningChild {
            mut child,
            started,
            timeout,
        } = self.take_child(handle)?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let mut timed_out = false;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) => {
                    if timeout.is_some_and(|limit| started.elapsed() >= limit) {
                        timed_out = true;
                        let _ = child.kill();
                        break child.wait().ok();
                    }
                    std::thread::sleep(WAIT_POLL_INTERVAL);
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RcaError::Process(e.to_string()));
                }
            }
        };

        Ok(ProcessOutput {
            exit_code: status.and_then(|s| s.code()).unwrap_or(-1),
            stdout: collect(stdout, timed_out),
            stderr: collect(stderr, timed_out),
            timed_out,
        })
    }

    fn kill(&self, handle: u64) -> Result<(), RcaError> {
        let RunningChild { mut child, .. } = self.take_child(handle)?;
        child.kill().map_err(|e| RcaError::Process(e.to_string()))?;
        child
            .wait()
            .map(|_| ())
            .map_err(|e| RcaError::Process(e.to_string()))
    }
}

pub struct ProductionTerminal;

impl Terminal for ProductionTerminal {
    fn write_line(&self, line: &str) -> Result<(), RcaError> {
        use std::io::Write;
        let mut out = std::io::stdout();
        writeln!(out, "{line}").map_err(|e| RcaError::Io(e.to_string()))
    }
}

pub struct ProductionRuntime {
    pub clock: Arc<dyn Clock>,
    pub file_system: Arc<dyn FileSystem>,
    pub process_runner: Arc<dyn ProcessRunner>,
    pub terminal: Arc<dyn Terminal>,
    pub locator: Arc<dyn ExecutableLocator>,
}

impl ProductionRuntime {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(ProductionClock),
            file_system: Arc::new(ProductionFileSystem),
            process_runner: Arc::new(ProductionProcessRunner::new()),
            terminal: Arc::new(ProductionTerminal),
            locator: Arc::new(PathLocator::from_env()),
        }
    }
}

impl Default for ProductionRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Arc<Mutex<SystemTime>>,
}

impl FakeClock {
    pub fn new(now: SystemTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock lock");
        *now += by;
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(SystemTime::UNIX_EPOCH)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> SystemTime {
        *self.now.lock().expect("clock lock")
    }
}

#[derive(Default, Clone)]
pub struct FakeFileSystem {
    files: Arc<Mutex<HashMap<PathBuf, Vec<u8>>>>,
    dirs: Arc<Mutex<Vec<PathBuf>>>,
    fail_next: Arc<Mutex<Option<RcaError>>>,
}

impl FakeFileSystem {
    pub fn with_file(path: impl Into<PathBuf>, contents: impl Into<String>) -> Self {
        let this = Self::default();
        this.add_file(path, contents.into().into_bytes());
        this
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        self.files
            .lock()
            .expect("files lock")
            .insert(path.into(), contents.into());
    }

    pub fn add_dir(&self, path: impl Into<PathBuf>) {
        self.dirs.lock().expect("dirs lock").push(path.into());
    }

    pub fn set_fail_next(&self, error: RcaError) {
        *self.fail_next.lock().expect("fail lock") = Some(error);
    }

    fn maybe_fail(&self) -> Result<(), RcaError> {
        if let Some(err) = self.fail_next.lock().expect("fail lock").take() {
            return Err(err);
        }
        Ok(())
    }
}

impl FileSystem for FakeFileSystem {
    fn read_to_string(&self, path: &Path) -> Result<String, RcaError> {
        let bytes = self.read_bytes(path)?;
        String::from_utf8(bytes).map_err(|e| RcaError::Io(e.to_string()))
    }

    fn read_bytes(&self, path: &Path) -> Result<Vec<u8>, RcaError> {
        self.maybe_fail()?;
        self.files
            .lock()
            .expect("files lock")
            .get(path)
            .cloned()
            .ok_or_else(|| RcaError::Io(format!("missing file {}", path.display())))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.lock().expect("files lock").contains_key(path)
            || self
                .dirs
                .lock()
                .expect("dirs lock")
                .iter()
                .any(|dir| dir == path)
    }
}

#[derive(Default, Clone)]
pub struct FakeTerminal {
    writes: Arc<Mutex<Vec<String>>>,
}

impl FakeTerminal {
    pub fn written_lines(&self) -> Vec<String> {
        self.writes.lock().expect("writes lock").clone()
    }
}

impl Terminal for FakeTerminal {
    fn write_line(&self, line: &str) -> Result<(), RcaError> {
        self.writes
            .lock()
            .expect("writes lock")
            .push(line.to_string());
        Ok(())
    }
}

#[derive(Default, Clone)]
pub struct FakeLocator {
    known: Arc<Mutex<BTreeMap<String, PathBuf>>>,
}

impl FakeLocator {
    pub fn with_program(program: &str, path: impl Into<PathBuf>) -> Self {
        let this = Self::default();
        this.known
            .lock()
            .expect("locator lock")
            .insert(program.to_string(), path.into());
        this
    }
}

impl ExecutableLocator for FakeLocator {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        self.known.lock().expect("locator lock").get(program).cloned()
    }
}

#[derive(Default, Clone)]
pub struct FakeProcessRunner {
    responses: Arc<Mutex<Vec<Result<ProcessOutput, RcaError>>>>,
    spawned: Arc<Mutex<Vec<ProcessRequest>>>,
    waits: Arc<Mutex<Vec<u64>>>,
    kills: Arc<Mutex<Vec<u64>>>,
    next_handle: Arc<Mutex<u64>>,
    fail_spawn: Arc<Mutex<Option<RcaError>>>,
}

impl FakeProcessRunner {
    pub fn push_response(&self, output: Result<ProcessOutput, RcaError>) {
        self.responses.lock().expect("responses lock").push(output);
    }

    pub fn fail_next_spawn(&self, error: RcaError) {
        *self.fail_spawn.lock().expect("spawn lock") = Some(error);
    }

    pub fn spawned(&self) -> Vec<ProcessRequest> {
        self.spawned.lock().expect("spawned lock").clone()
    }

    pub fn waits(&self) -> Vec<u64> {
        self.waits.lock().expect("waits lock").clone()
    }

    pub fn kills(&self) -> Vec<u64> {
        self.kills.lock().expect("kills lock").clone()
    }
}

impl ProcessRunner for FakeProcessRunner {
    fn spawn(&self, request: ProcessRequest) -> Result<u64, RcaError> {
        if let Some(err) = self.fail_spawn.lock().expect("spawn lock").take() {
            return Err(err);
        }
        self.spawned.lock().expect("spawned lock").push(request);
        let mut next = self.next_handle.lock().expect("next lock");
        let handle = *next;
        *next += 1;
        Ok(handle)
    }

    fn wait(&self, handle: u64) -> Result<ProcessOutput, RcaError> {
        self.waits.lock().expect("waits lock").push(handle);
        let mut responses = self.responses.lock().expect("responses lock");
        if responses.is_empty() {
            return Err(RcaError::Process("no fake response queued".to_string()));
        }
        responses.remove(0)
    }

    fn kill(&self, handle: u64) -> Result<(), RcaError> {
        self.kills.lock().expect("kills lock").push(handle);
        Ok(())
    }
}
