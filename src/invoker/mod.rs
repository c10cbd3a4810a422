use crate::domain::AgentOutput;
use crate::shared::ids::short_token;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

pub mod frames;
pub mod mailbox;

pub use frames::{parse_stdout, FrameScanner, OUTPUT_END_MARKER, OUTPUT_START_MARKER};

pub const WORKER_NAME_PREFIX: &str = "coreclaw-worker-";
pub const DEFAULT_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_KILL_GRACE_MS: u64 = 10_000;
pub const STDOUT_CAP_BYTES: usize = 10 * 1024 * 1024;
const STDERR_SNIPPET_BYTES: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum InvokerError {
    #[error("worker ipc io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> InvokerError {
    InvokerError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// How the child is launched. The container profile is the production shape:
/// read-only root, scratch tmpfs, no network unless granted, optional memory
/// and cpu caps, with the per-task ipc directory mounted into the workspace.
/// The process profile launches a plain binary and hands it the ipc directory
/// as its final argument.
#[derive(Debug, Clone)]
pub enum SandboxProfile {
    Container {
        runtime: String,
        image: String,
        memory_limit: Option<String>,
        cpu_limit: Option<String>,
        allow_network: bool,
    },
    Process {
        program: String,
        args: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct InvokerConfig {
    pub ipc_root: PathBuf,
    pub timeout: Duration,
    pub kill_grace: Duration,
    pub sandbox: SandboxProfile,
    pub stdout_cap_bytes: usize,
    pub log_root: Option<PathBuf>,
}

impl InvokerConfig {
    pub fn new(ipc_root: impl Into<PathBuf>, sandbox: SandboxProfile) -> Self {
        Self {
            ipc_root: ipc_root.into(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
            sandbox,
            stdout_cap_bytes: STDOUT_CAP_BYTES,
            log_root: None,
        }
    }
}

/// Input frame written once to the child's stdin. Secrets are allow-listed by
/// the caller and scrubbed from host memory right after the write.
#[derive(Debug)]
pub struct WorkerRequest {
    pub task_id: String,
    pub task_type: String,
    pub payload: Map<String, Value>,
    pub secrets: BTreeMap<String, String>,
    pub conductor_context: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct WorkerRun {
    pub container_id: String,
    pub output: AgentOutput,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub timed_out: bool,
}

pub struct WorkerInvoker {
    config: InvokerConfig,
}

impl WorkerInvoker {
    pub fn new(config: InvokerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    /// Run one task inside a fresh worker. Failures that have a defined
    /// synthesised shape (spawn error, timeout, no valid frame) come back as
    /// `Ok` with a failed Agent-Output; only ipc bookkeeping errors are `Err`.
    pub fn invoke(&self, mut request: WorkerRequest) -> Result<WorkerRun, InvokerError> {
        let container_id = format!("{WORKER_NAME_PREFIX}{}", short_token(12));
        let ipc_dir = self.config.ipc_root.join(&container_id);
        fs::create_dir_all(ipc_dir.join("input")).map_err(|e| io_err(&ipc_dir, e))?;
        fs::create_dir_all(ipc_dir.join("output")).map_err(|e| io_err(&ipc_dir, e))?;

        let start = Instant::now();
        let mut command = self.build_command(&container_id, &ipc_dir);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let _ = fs::remove_dir_all(&ipc_dir);
                request.secrets.clear();
                return Ok(WorkerRun {
                    container_id,
                    output: AgentOutput::failed(
                        format!("failed to start worker: {err}"),
                        Some(err.to_string()),
                    ),
                    exit_code: 1,
                    duration_ms: start.elapsed().as_millis() as u64,
                    timed_out: false,
                });
            }
        };

        self.write_input_frame(&mut child, &mut request);

        let (exit_code, scanner, stderr, timed_out) = self.stream_child(&mut child, &container_id);

        let _ = fs::remove_dir_all(&ipc_dir);
        self.cleanup_container(&container_id);

        let duration_ms = start.elapsed().as_millis() as u64;
        let output = match scanner.into_last_valid() {
            Some(output) => output,
            None if timed_out => AgentOutput::failed(
                format!("worker timed out after {} ms", self.config.timeout.as_millis()),
                Some(stderr_snippet(&stderr)),
            ),
            None => {
                let snippet = stderr_snippet(&stderr);
                let summary = if snippet.is_empty() {
                    "worker produced no output".to_string()
                } else {
                    snippet.clone()
                };
                AgentOutput::failed(summary, Some(stderr))
            }
        };

        Ok(WorkerRun {
            container_id,
            output,
            exit_code,
            duration_ms,
            timed_out,
        })
    }

    /// Remove leftover workers and ipc directories from a previous process.
    pub fn cleanup_orphans(&self) -> Vec<String> {
        let mut removed = Vec::new();

        if let Ok(entries) = fs::read_dir(&self.config.ipc_root) {
            for entry in entries.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with(WORKER_NAME_PREFIX) && entry.path().is_dir() {
                    if fs::remove_dir_all(entry.path()).is_ok() {
                        removed.push(name);
                    }
                }
            }
        }

        if let SandboxProfile::Container { runtime, .. } = &self.config.sandbox {
            let listing = Command::new(runtime)
                .args(["ps", "-a", "--filter"])
                .arg(format!("name={WORKER_NAME_PREFIX}"))
                .args(["--format", "{{.Names}}"])
                .output();
            if let Ok(listing) = listing {
                for name in String::from_utf8_lossy(&listing.stdout).lines() {
                    let name = name.trim();
                    if name.starts_with(WORKER_NAME_PREFIX) {
                        let _ = Command::new(runtime).args(["rm", "-f", name]).output();
                        removed.push(name.to_string());
                    }
                }
            }
        }

        removed
    }

    fn build_command(&self, container_id: &str, ipc_dir: &Path) -> Command {
        match &self.config.sandbox {
            SandboxProfile::Container {
                runtime,
                image,
                memory_limit,
                cpu_limit,
                allow_network,
            } => {
                let mut command = Command::new(runtime);
                command.args([
                    "run",
                    "--rm",
                    "-i",
                    "--name",
                    container_id,
                    "--read-only",
                    "--tmpfs",
                    "/tmp:rw,size=64m",
                ]);
                if !allow_network {
                    command.args(["--network", "none"]);
                }
                if let Some(memory) = memory_limit {
                    command.arg("--memory").arg(memory);
                }
                if let Some(cpus) = cpu_limit {
                    command.arg("--cpus").arg(cpus);
                }
                command
                    .arg("-v")
                    .arg(format!("{}:/workspace/ipc", ipc_dir.display()))
                    .arg(image);
                command
            }
            SandboxProfile::Process { program, args } => {
                let mut command = Command::new(program);
                command.args(args);
                command.arg(ipc_dir);
                command
            }
        }
    }

    fn write_input_frame(&self, child: &mut Child, request: &mut WorkerRequest) {
        let frame = serde_json::json!({
            "taskId": request.task_id,
            "taskType": request.task_type,
            "payload": request.payload,
            "secrets": request.secrets,
            "conductorContext": request.conductor_context,
        });
        let mut bytes = serde_json::to_vec(&frame).unwrap_or_default();
        bytes.push(b'\n');

        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits without reading stdin surfaces as a broken
            // pipe; that is the child's business, not a host failure.
            let _ = stdin.write_all(&bytes);
        }

        // Best-effort scrub: the serialized frame and the allow-listed values
        // leave host memory before we start waiting on the child.
        for byte in bytes.iter_mut() {
            *byte = 0;
        }
        drop(bytes);
        request.secrets.clear();
    }

    fn stream_child(
        &self,
        child: &mut Child,
        container_id: &str,
    ) -> (i32, FrameScanner, String, bool) {
        let (line_tx, line_rx) = mpsc::channel::<String>();
        let stdout_cap = self.config.stdout_cap_bytes;

        let stdout_handle = child.stdout.take().map(|stdout| {
            thread::spawn(move || {
                let mut reader = BufReader::new(stdout);
                let mut line = String::new();
                let mut seen = 0usize;
                loop {
                    line.clear();
                    match reader.read_line(&mut line) {
                        Ok(0) => break,
                        Ok(n) => {
                            seen = seen.saturating_add(n);
                            if seen > stdout_cap {
                                // Past the cap the raw text is discarded but
                                // lines keep flowing to the frame parser.
                                line.truncate(0);
                                continue;
                            }
                            if line_tx.send(line.clone()).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            })
        });
        let stderr_handle = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                let mut buf = String::new();
                let mut reader = BufReader::new(stderr);
                let _ = reader.read_to_string(&mut buf);
                buf.truncate(buf.len().min(64 * 1024));
                buf
            })
        });

        let mut scanner = FrameScanner::new();
        let mut deadline = Instant::now() + self.config.timeout;
        let mut timed_out = false;
        let mut kill_deadline: Option<Instant> = None;

        let exit_code = loop {
            while let Ok(line) = line_rx.try_recv() {
                if scanner.push_line(&line) {
                    deadline = Instant::now() + self.config.timeout;
                }
            }

            match child.try_wait() {
                Ok(Some(status)) => break status.code().unwrap_or(-1),
                Ok(None) => {
                    let now = Instant::now();
                    if !timed_out && now > deadline {
                        timed_out = true;
                        kill_deadline = Some(now + self.config.kill_grace);
                        self.request_graceful_stop(container_id);
                    }
                    if let Some(kill_at) = kill_deadline {
                        if now > kill_at {
                            let _ = child.kill();
                            let code = child
                                .wait()
                                .ok()
                                .and_then(|status| status.code())
                                .unwrap_or(-1);
                            break code;
                        }
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(_) => break -1,
            }
        };

        if let Some(handle) = stdout_handle {
            let _ = handle.join();
        }
        while let Ok(line) = line_rx.try_recv() {
            scanner.push_line(&line);
        }
        let stderr = stderr_handle
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        (exit_code, scanner, stderr, timed_out)
    }

    fn request_graceful_stop(&self, container_id: &str) {
        let _ = mailbox::request_close(&self.config.ipc_root, container_id);
        if let SandboxProfile::Container { runtime, .. } = &self.config.sandbox {
            let _ = Command::new(runtime)
                .args(["stop", "-t", "5", container_id])
                .spawn();
        }
        self.log("info", "worker.stop.requested", container_id);
    }

    fn cleanup_container(&self, container_id: &str) {
        if let SandboxProfile::Container { runtime, .. } = &self.config.sandbox {
            let _ = Command::new(runtime)
                .args(["rm", "-f", container_id])
                .output();
        }
    }

    fn log(&self, level: &str, event: &str, message: &str) {
        if let Some(root) = &self.config.log_root {
            crate::shared::logging::append_core_log(root, level, event, message);
        }
    }
}

fn stderr_snippet(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let mut end = trimmed.len().min(STDERR_SNIPPET_BYTES);
    while end < trimmed.len() && !trimmed.is_char_boundary(end) {
        end += 1;
    }
    trimmed[..end].to_string()
}
