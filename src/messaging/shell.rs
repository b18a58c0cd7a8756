//! Shell adapter: a pool of interactive subprocess sessions exposed over the
//! same WebSocket event bus as the chat-platform adapters.
//!
//! Unlike Discord/Slack/Telegram/Zulip, this adapter has no notion of a
//! conversation or a message — its events are `open_session`, `close_session`,
//! `execute_command`, and `shell_metadata`, so it does not implement
//! `PlatformAdapter`/`ConversationManager` at all and instead drives
//! `core::socket_io::SocketIoServer` directly via `OutgoingDispatch`, the same
//! seam `OutgoingEventProcessor` uses for the chat adapters. Grounded on
//! `original_source/adapters/shell_adapter/adapter/{session/*,
//! event_processor/*}.py`: `session/session.py`'s marker-delimited command
//! protocol over a persistent shell subprocess, `session/manager.py`'s
//! session table and idle/expired reaper, `session/command_executor.py`'s
//! output truncation and per-command timeout, `session/resources_monitor.py`'s
//! CPU/memory polling, and `event_processor/processor.py`'s four event
//! handlers. Windows support in the source (`cmd.exe`, `%ERRORLEVEL%`, CRLF)
//! is dropped — this deployment target is Unix-only, so the adapter always
//! drives `$SHELL` with LF markers; noted in DESIGN.md.

use crate::config::Config;
use crate::core::socket_io::{OutgoingDispatch, SocketIoServer};
use crate::error::PlatformError;
use crate::messaging::traits::Messaging;

use serde_json::{json, Value};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{watch, Mutex};

const CMD_MARKER_PREFIX: &str = "CMD_MARKER_";
const EXIT_CODE_PREFIX: &str = "EXIT_CODE_";

struct Session {
    id: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    stderr: BufReader<ChildStderr>,
    workspace_directory: String,
    created_at: std::time::Instant,
}

impl Session {
    async fn open(workspace_directory: &str) -> crate::error::Result<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());

        let mut child = Command::new(&shell)
            .current_dir(workspace_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PlatformError::Shell(format!("failed to spawn shell: {e}")))?;

        let stdin = child.stdin.take().ok_or_else(|| PlatformError::Shell("no stdin".into()))?;
        let stdout = BufReader::new(child.stdout.take().ok_or_else(|| PlatformError::Shell("no stdout".into()))?);
        let stderr = BufReader::new(child.stderr.take().ok_or_else(|| PlatformError::Shell("no stderr".into()))?);

        let mut session = Self {
            id,
            child,
            stdin,
            stdout,
            stderr,
            workspace_directory: workspace_directory.to_string(),
            created_at: std::time::Instant::now(),
        };

        session.setup().await?;
        session.drain().await?;
        Ok(session)
    }

    async fn setup(&mut self) -> crate::error::Result<()> {
        let commands = [
            "export SHELL_ADAPTER_SESSION=1\n".to_string(),
            format!("export SHELL_ADAPTER_SESSION_ID={}\n", self.id),
            "export PS1='$ '\n".to_string(),
            format!("cd {}\n", shell_quote(&self.workspace_directory)),
        ];
        for command in commands {
            self.stdin
                .write_all(command.as_bytes())
                .await
                .map_err(|e| PlatformError::Shell(format!("failed to write setup command: {e}")))?;
        }
        self.stdin.flush().await.map_err(|e| PlatformError::Shell(e.to_string()))?;
        Ok(())
    }

    async fn drain(&mut self) -> crate::error::Result<()> {
        let marker = format!("DRAIN_MARKER_{}", uuid::Uuid::new_v4().simple());
        self.stdin
            .write_all(format!("echo {marker}\n").as_bytes())
            .await
            .map_err(|e| PlatformError::Shell(e.to_string()))?;
        self.stdin.flush().await.map_err(|e| PlatformError::Shell(e.to_string()))?;

        let mut line = String::new();
        loop {
            line.clear();
            let n = self.stdout.read_line(&mut line).await.unwrap_or(0);
            if n == 0 || line.trim_end_matches('\n') == marker {
                break;
            }
        }

        for _ in 0..100 {
            let mut drain_line = String::new();
            match tokio::time::timeout(Duration::from_millis(10), self.stderr.read_line(&mut drain_line)).await {
                Ok(Ok(n)) if n > 0 => continue,
                _ => break,
            }
        }
        Ok(())
    }

    /// Runs `command` to completion, returning raw stdout/stderr/exit_code.
    /// Mirrors `Session.execute_command`'s marker protocol: the command is
    /// followed by an echo of `$?` and a sentinel line, and stdout is read
    /// until the sentinel reappears.
    async fn execute(&mut self, command: &str) -> crate::error::Result<(String, String, i32)> {
        let marker = format!("{CMD_MARKER_PREFIX}{}", uuid::Uuid::new_v4().simple());
        let exit_marker = format!("{EXIT_CODE_PREFIX}{}", uuid::Uuid::new_v4().simple());
        let full_command = format!("{command}\necho {exit_marker}$?\necho {marker}\n");

        self.stdin
            .write_all(full_command.as_bytes())
            .await
            .map_err(|e| PlatformError::Shell(format!("failed to write command: {e}")))?;
        self.stdin.flush().await.map_err(|e| PlatformError::Shell(e.to_string()))?;

        let mut stdout_lines = Vec::new();
        let mut exit_code = 0;
        loop {
            let mut line = String::new();
            let n = self
                .stdout
                .read_line(&mut line)
                .await
                .map_err(|e| PlatformError::Shell(format!("failed to read stdout: {e}")))?;
            if n == 0 {
                break;
            }
            let line = line.trim_end_matches('\n');
            if line == marker {
                break;
            } else if let Some(code) = line.strip_prefix(&exit_marker) {
                exit_code = code.parse().unwrap_or(0);
                continue;
            }
            stdout_lines.push(line.to_string());
        }

        let mut stderr_lines = Vec::new();
        for _ in 0..100 {
            let mut line = String::new();
            match tokio::time::timeout(Duration::from_millis(10), self.stderr.read_line(&mut line)).await {
                Ok(Ok(n)) if n > 0 => stderr_lines.push(line.trim_end_matches('\n').to_string()),
                _ => break,
            }
        }

        Ok((stdout_lines.join("\n"), stderr_lines.join("\n"), exit_code))
    }

    async fn update_working_directory(&mut self) -> crate::error::Result<String> {
        let marker = format!("PWD_MARKER_{}", uuid::Uuid::new_v4().simple());
        self.stdin
            .write_all(format!("pwd; echo {marker}\n").as_bytes())
            .await
            .map_err(|e| PlatformError::Shell(e.to_string()))?;
        self.stdin.flush().await.map_err(|e| PlatformError::Shell(e.to_string()))?;

        let mut last = self.workspace_directory.clone();
        loop {
            let mut line = String::new();
            let n = self.stdout.read_line(&mut line).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            let line = line.trim_end_matches('\n');
            if line == marker {
                break;
            }
            last = line.to_string();
        }
        self.workspace_directory = last.clone();
        Ok(last)
    }

    /// Forcibly terminates the session's process group. Best-effort, mirrors
    /// `Session.close`'s `killpg` with a plain `kill()` fallback. Takes
    /// `&mut self` rather than consuming, since the session may still be
    /// referenced by an in-flight command's `Arc` when this is called.
    async fn close(&mut self) {
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::killpg(pid as libc::pid_t, libc::SIGKILL);
            }
        }
        let _ = self.child.kill().await;
    }

    fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', "'\\''"))
}

/// Per-command resource tracking, checked by the background resource
/// monitor. Grounded on `resources_monitor.py`'s `register_session`/
/// `unregister_session`/`_check_sessions`.
struct ResourceWatch {
    session_id: String,
    pid: u32,
}

#[derive(Clone)]
pub struct ShellAdapter {
    adapter_name: Arc<String>,
    workspace_directory: Arc<String>,
    session_max_lifetime_hours: i64,
    command_max_lifetime: Duration,
    max_output_size: usize,
    begin_output_size: usize,
    end_output_size: usize,
    cpu_percent_limit: f32,
    memory_mb_limit: f64,
    check_interval: Duration,
    /// Each session lives behind its own lock so one session's running
    /// command never blocks another session's operations or table-wide
    /// lookups (open/close/reap only ever take the outer lock briefly).
    sessions: Arc<Mutex<HashMap<String, Arc<Mutex<Session>>>>>,
    monitored: Arc<Mutex<Vec<ResourceWatch>>>,
}

impl ShellAdapter {
    pub fn from_config(config: &Config) -> crate::error::Result<Self> {
        let workspace_directory: String = config.get_or(
            "adapter",
            "workspace_directory",
            std::env::temp_dir().to_string_lossy().to_string(),
        );
        std::fs::create_dir_all(&workspace_directory)
            .map_err(|e| PlatformError::Shell(format!("failed to create workspace directory: {e}")))?;

        Ok(Self {
            adapter_name: Arc::new(config.get_or("adapter", "adapter_name", "shell".to_string())),
            workspace_directory: Arc::new(workspace_directory),
            session_max_lifetime_hours: config.get_or("adapter", "session_max_lifetime", 24),
            command_max_lifetime: Duration::from_secs(config.get_or("adapter", "command_max_lifetime", 300)),
            max_output_size: config.get_or("output", "max_output_size", 10_000),
            begin_output_size: config.get_or("output", "begin_output_size", 2_000),
            end_output_size: config.get_or("output", "end_output_size", 2_000),
            cpu_percent_limit: config.get_or("resources_monitoring", "cpu_percent_limit", 90.0),
            memory_mb_limit: config.get_or("resources_monitoring", "memory_mb_limit", 1024.0),
            check_interval: Duration::from_secs(config.get_or("resources_monitoring", "check_interval", 15)),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            monitored: Arc::new(Mutex::new(Vec::new())),
        })
    }

    async fn open_session(&self) -> crate::error::Result<String> {
        let session = Session::open(&self.workspace_directory).await?;
        let id = session.id.clone();
        self.sessions.lock().await.insert(id.clone(), Arc::new(Mutex::new(session)));
        tracing::info!(session_id = %id, "opened shell session");
        Ok(id)
    }

    async fn close_session(&self, session_id: &str) -> crate::error::Result<()> {
        let session = self
            .sessions
            .lock()
            .await
            .remove(session_id)
            .ok_or_else(|| PlatformError::Shell(format!("session {session_id} not found")))?;
        session.lock().await.close().await;
        tracing::info!(session_id, "closed shell session");
        Ok(())
    }

    /// Runs `command`. If `session_id` is absent, a scratch session is opened
    /// and torn down around the single command, matching `processor.py`'s
    /// `_handle_execute_command_event`.
    async fn run_command(&self, session_id: Option<String>, command: &str) -> crate::error::Result<Value> {
        let (owns_session, session_id) = match session_id {
            Some(id) => (false, id),
            None => (true, self.open_session().await?),
        };

        let result = self.execute_in_session(&session_id, command).await;

        if owns_session {
            let _ = self.close_session(&session_id).await;
        } else if let Some(session) = self.sessions.lock().await.get(&session_id).cloned() {
            let _ = session.lock().await.update_working_directory().await;
        }

        result
    }

    async fn execute_in_session(&self, session_id: &str, command: &str) -> crate::error::Result<Value> {
        let session = self
            .sessions
            .lock()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| PlatformError::Shell(format!("session {session_id} not found")))?;

        if let Some(pid) = session.lock().await.pid() {
            self.monitored.lock().await.push(ResourceWatch { session_id: session_id.to_string(), pid });
        }

        let command_owned = command.to_string();
        let outcome = tokio::time::timeout(self.command_max_lifetime, async move {
            session.lock().await.execute(&command_owned).await
        })
        .await;

        self.monitored.lock().await.retain(|w| w.session_id != session_id);

        let (stdout, stderr, exit_code) = match outcome {
            Ok(result) => result?,
            Err(_) => ("".to_string(), "command execution was cancelled (timeout)".to_string(), -1),
        };

        let (stdout, stdout_size) = self.truncate(&stdout);
        let (stderr, stderr_size) = self.truncate(&stderr);

        Ok(json!({
            "stdout": stdout,
            "stderr": stderr,
            "exit_code": exit_code,
            "original_stdout_size": stdout_size,
            "original_stderr_size": stderr_size,
        }))
    }

    fn truncate(&self, text: &str) -> (String, Option<usize>) {
        let original_size = text.len();
        if original_size <= self.max_output_size {
            return (text.to_string(), None);
        }
        let begin: String = text.chars().take(self.begin_output_size).collect();
        let end: String = text
            .chars()
            .rev()
            .take(self.end_output_size)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        (format!("{begin}\n...[Output truncated]...\n{end}"), Some(original_size))
    }

    fn metadata(&self) -> Value {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
        json!({
            "operating_system": std::env::consts::OS,
            "shell": shell,
            "workspace_directory": self.workspace_directory.as_str(),
        })
    }

    /// Periodically closes sessions whose process has exited or whose
    /// lifetime exceeds `session_max_lifetime_hours`. Mirrors
    /// `Manager._cleanup_sessions`.
    async fn reap_expired_sessions(&self) {
        let max_lifetime = Duration::from_secs((self.session_max_lifetime_hours.max(0) as u64) * 3600);
        let handles: Vec<(String, Arc<Mutex<Session>>)> =
            self.sessions.lock().await.iter().map(|(id, s)| (id.clone(), Arc::clone(s))).collect();

        let mut expired = Vec::new();
        for (id, session) in handles {
            // Skip sessions with a command currently in flight rather than
            // block waiting for the lock; they'll be reconsidered next cycle.
            let Ok(mut guard) = session.try_lock() else { continue };
            let exited = guard.child.try_wait().ok().flatten().is_some();
            if exited || guard.created_at.elapsed() > max_lifetime {
                expired.push(id);
            }
        }

        for id in expired {
            tracing::info!(session_id = %id, "reaping expired shell session");
            let _ = self.close_session(&id).await;
        }
    }

    /// Polls CPU/memory of every in-flight command's process and kills any
    /// session whose command exceeds the configured limits. Mirrors
    /// `ResourceMonitor._check_sessions`, built on `sysinfo` since no direct
    /// `psutil` analogue is wired into the corpus elsewhere.
    async fn check_resource_limits(&self, system: &mut sysinfo::System) {
        system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);

        let watches: Vec<(String, u32)> = self
            .monitored
            .lock()
            .await
            .iter()
            .map(|w| (w.session_id.clone(), w.pid))
            .collect();

        for (session_id, pid) in watches {
            let Some(process) = system.process(sysinfo::Pid::from_u32(pid)) else { continue };
            let cpu_percent = process.cpu_usage();
            let memory_mb = process.memory() as f64 / (1024.0 * 1024.0);

            if cpu_percent > self.cpu_percent_limit || memory_mb > self.memory_mb_limit {
                tracing::warn!(session_id, cpu_percent, memory_mb, "shell command exceeded resource limits, closing session");
                let _ = self.close_session(&session_id).await;
                self.monitored.lock().await.retain(|w| w.session_id != session_id);
            }
        }
    }
}

impl OutgoingDispatch for ShellAdapter {
    async fn process_outgoing_event(&self, event_type: &str, data: Value) -> Value {
        let result = match event_type {
            "open_session" => self.open_session().await.map(|id| json!({ "session_id": id })),
            "close_session" => match data.get("session_id").and_then(Value::as_str) {
                Some(id) => self.close_session(id).await.map(|_| Value::Null),
                None => Err(PlatformError::Shell("missing session_id".into()).into()),
            },
            "execute_command" => match data.get("command").and_then(Value::as_str) {
                Some(command) => {
                    let session_id = data.get("session_id").and_then(Value::as_str).map(str::to_string);
                    self.run_command(session_id, command).await.map(|metadata| json!({ "metadata": metadata }))
                }
                None => Err(PlatformError::Shell("missing command".into()).into()),
            },
            "shell_metadata" => Ok(json!({ "metadata": self.metadata() })),
            other => {
                tracing::warn!(event_type = other, "unknown shell event type");
                Err(PlatformError::Shell(format!("unknown event type: {other}")).into())
            }
        };

        match result {
            Ok(extra) => {
                let mut payload = json!({ "request_completed": true });
                if let Value::Object(map) = extra {
                    payload.as_object_mut().unwrap().extend(map);
                }
                payload
            }
            Err(error) => {
                tracing::error!(%error, event_type, "shell event failed");
                json!({ "request_completed": false })
            }
        }
    }
}

impl Messaging for ShellAdapter {
    fn name(&self) -> &str {
        &self.adapter_name
    }

    async fn run(&self, mut shutdown: watch::Receiver<bool>) -> crate::error::Result<()> {
        let (socket, queue_rx) = SocketIoServer::new(self.adapter_name.as_str(), self.clone());

        let queue_shutdown = shutdown.clone();
        tokio::spawn(Arc::clone(&socket).run_queue(queue_rx, queue_shutdown));

        let router = socket.router();
        let listener = tokio::net::TcpListener::bind("0.0.0.0:8769")
            .await
            .map_err(|e| PlatformError::Shell(format!("failed to bind shell socket server: {e}")))?;
        let mut axum_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
                let _ = axum_shutdown.wait_for(|v| *v).await;
            });
            if let Err(error) = serve.await {
                tracing::error!(%error, "shell socket server exited");
            }
        });

        let reaper = self.clone();
        let mut reaper_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(180)) => {
                        reaper.reap_expired_sessions().await;
                    }
                    _ = reaper_shutdown.changed() => {
                        if *reaper_shutdown.borrow() { break; }
                    }
                }
            }
        });

        let monitor = self.clone();
        let check_interval = self.check_interval;
        let mut monitor_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut system = sysinfo::System::new();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(check_interval) => {
                        monitor.check_resource_limits(&mut system).await;
                    }
                    _ = monitor_shutdown.changed() => {
                        if *monitor_shutdown.borrow() { break; }
                    }
                }
            }
        });

        tracing::info!("shell adapter listening on 0.0.0.0:8769");
        shutdown.changed().await.ok();

        let session_ids: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for id in session_ids {
            let _ = self.close_session(&id).await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_leaves_short_text_untouched() {
        let adapter = test_adapter();
        let (text, size) = adapter.truncate("short");
        assert_eq!(text, "short");
        assert_eq!(size, None);
    }

    #[test]
    fn truncate_splits_long_text_with_marker() {
        let mut adapter = test_adapter();
        adapter.max_output_size = 10;
        adapter.begin_output_size = 3;
        adapter.end_output_size = 3;
        let (text, size) = adapter.truncate(&"a".repeat(20));
        assert!(text.contains("[Output truncated]"));
        assert_eq!(size, Some(20));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's/here"), "'it'\\''s/here'");
    }

    fn test_adapter() -> ShellAdapter {
        ShellAdapter {
            adapter_name: Arc::new("shell".to_string()),
            workspace_directory: Arc::new("/tmp".to_string()),
            session_max_lifetime_hours: 24,
            command_max_lifetime: Duration::from_secs(300),
            max_output_size: 10_000,
            begin_output_size: 2_000,
            end_output_size: 2_000,
            cpu_percent_limit: 90.0,
            memory_mb_limit: 1024.0,
            check_interval: Duration::from_secs(15),
            sessions: Arc::new(Mutex::new(HashMap::new())),
            monitored: Arc::new(Mutex::new(Vec::new())),
        }
    }
}
