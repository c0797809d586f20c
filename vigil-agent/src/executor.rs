use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::errors::{AgentError, AgentResult};
use crate::registry::{validate_args, CommandKind, CommandRegistry, Handler};
use crate::transport::{CommandEnvelope, ReportSink, ReportStatus};
use crate::updater::{UpdateOutcome, Updater};

const SYSTEM_UPDATE_TIMEOUT: Duration = Duration::from_secs(600);
const LIST_PACKAGES_TIMEOUT: Duration = Duration::from_secs(30);

/// Validates dispatched commands against the whitelist and runs them.
///
/// Synchronous commands block the caller for up to their timeout; the
/// long-duration internal actions (stress tests) detach onto background
/// tasks so the poll loop is never starved. Every dispatched command ends in
/// a reported status; no failure is silently swallowed.
pub struct Executor {
    config: Arc<AgentConfig>,
    registry: Arc<CommandRegistry>,
    sink: Arc<dyn ReportSink>,
    updater: Arc<Updater>,
    restart_tx: mpsc::Sender<()>,
    spawn_count: AtomicU64,
}

impl Executor {
    pub fn new(
        config: Arc<AgentConfig>,
        registry: Arc<CommandRegistry>,
        sink: Arc<dyn ReportSink>,
        updater: Arc<Updater>,
        restart_tx: mpsc::Sender<()>,
    ) -> Self {
        Self {
            config,
            registry,
            sink,
            updater,
            restart_tx,
            spawn_count: AtomicU64::new(0),
        }
    }

    /// Number of external processes spawned so far. The validation tests use
    /// this to prove rejected commands never reach a spawn.
    pub fn spawn_count(&self) -> u64 {
        self.spawn_count.load(Ordering::SeqCst)
    }

    pub async fn execute(&self, cmd: &CommandEnvelope) {
        info!("Executing command {} ('{}')", cmd.id, cmd.command);

        let Some(kind) = self.registry.get(&cmd.command) else {
            self.sink
                .report(
                    cmd.id,
                    ReportStatus::Failed,
                    &format!("invalid_command: '{}' is not whitelisted", cmd.command),
                )
                .await;
            return;
        };

        if let Err(e) = validate_args(kind, &cmd.args) {
            self.sink
                .report(cmd.id, ReportStatus::Failed, &e.to_string())
                .await;
            return;
        }

        match kind {
            CommandKind::External {
                bin, fixed_args, ..
            } => self.run_external(cmd, bin, fixed_args).await,
            CommandKind::Internal(handler) => self.run_internal(cmd, *handler).await,
        }
    }

    async fn run_external(&self, cmd: &CommandEnvelope, bin: &str, fixed_args: &[&str]) {
        let mut argv: Vec<String> = fixed_args.iter().map(|s| s.to_string()).collect();
        if !cmd.args.is_empty() {
            // Single discrete argv element; never interpolated into a shell.
            argv.push(cmd.args.clone());
        }

        let timeout = Duration::from_secs(self.config.executor.command_timeout_secs);
        match self.run_process(bin, &argv, timeout).await {
            Ok((true, output)) => {
                self.sink
                    .report(cmd.id, ReportStatus::Completed, &output)
                    .await
            }
            Ok((false, output)) => {
                self.sink.report(cmd.id, ReportStatus::Failed, &output).await
            }
            Err(e) => {
                self.sink
                    .report(cmd.id, ReportStatus::Failed, &e.to_string())
                    .await
            }
        }
    }

    /// Spawn a whitelisted process and wait for it under a wall-clock bound.
    /// On timeout the child is killed (kill_on_drop) and a TimeoutError comes
    /// back. Returns (exited zero, combined stdout+stderr).
    async fn run_process(
        &self,
        bin: &str,
        argv: &[String],
        timeout: Duration,
    ) -> AgentResult<(bool, String)> {
        let mut command = Command::new(bin);
        command
            .args(argv)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        let child = command
            .spawn()
            .map_err(|e| AgentError::ExecutionError(format!("failed to spawn {}: {}", bin, e)))?;

        let output = tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                AgentError::TimeoutError(format!(
                    "command timed out after {}s",
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| AgentError::ExecutionError(format!("wait on {}: {}", bin, e)))?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.success(), text))
    }

    async fn run_internal(&self, cmd: &CommandEnvelope, handler: Handler) {
        match handler {
            Handler::UpdateAgent => self.handle_update_agent(cmd).await,
            Handler::SystemUpdate => self.handle_system_update(cmd).await,
            Handler::ContainerAction => self.handle_container_action(cmd).await,
            Handler::StressCpu => self.handle_stress(cmd, StressKind::Cpu),
            Handler::StressRam => self.handle_stress(cmd, StressKind::Ram),
            Handler::ListPackages => self.handle_list_packages(cmd).await,
            Handler::KillProcess => self.handle_kill_process(cmd).await,
        }
    }

    async fn handle_update_agent(&self, cmd: &CommandEnvelope) {
        self.sink
            .report(cmd.id, ReportStatus::Running, "Checking for updates...")
            .await;

        match self.updater.check_and_apply().await {
            Ok(UpdateOutcome::Applied { version }) => {
                self.sink
                    .report(
                        cmd.id,
                        ReportStatus::Completed,
                        &format!("Update to v{} applied. Agent restarting...", version),
                    )
                    .await;
                // Grace delay so the result report lands before we go down.
                tokio::time::sleep(Duration::from_secs(2)).await;
                match self.restart_tx.try_send(()) {
                    Ok(()) => {}
                    // A restart is already queued; one signal is enough.
                    Err(TrySendError::Full(())) => {}
                    Err(TrySendError::Closed(())) => {
                        warn!("Restart channel closed; update will take effect on next launch");
                    }
                }
            }
            Ok(UpdateOutcome::UpToDate) => {
                self.sink
                    .report(
                        cmd.id,
                        ReportStatus::Completed,
                        "No updates found. Agent is up to date.",
                    )
                    .await;
            }
            Err(e) => {
                // An update failure never takes the agent down.
                self.sink
                    .report(cmd.id, ReportStatus::Failed, &e.to_string())
                    .await;
            }
        }
    }

    async fn handle_system_update(&self, cmd: &CommandEnvelope) {
        self.sink
            .report(cmd.id, ReportStatus::Running, "Detecting package manager...")
            .await;

        // Fixed command strings only; no operator input is involved here.
        let (bin, argv): (&str, Vec<String>) = if find_in_path("apt-get").is_some() {
            (
                "bash",
                vec![
                    "-c".to_string(),
                    "DEBIAN_FRONTEND=noninteractive apt-get update && \
                     DEBIAN_FRONTEND=noninteractive apt-get upgrade -y"
                        .to_string(),
                ],
            )
        } else if find_in_path("dnf").is_some() {
            ("dnf", vec!["update".to_string(), "-y".to_string()])
        } else if find_in_path("yum").is_some() {
            ("yum", vec!["update".to_string(), "-y".to_string()])
        } else {
            self.sink
                .report(
                    cmd.id,
                    ReportStatus::Failed,
                    "No supported package manager found (apt/dnf/yum)",
                )
                .await;
            return;
        };

        self.sink
            .report(
                cmd.id,
                ReportStatus::Running,
                &format!("Running system update ({}). This may take a while...", bin),
            )
            .await;

        match self.run_process(bin, &argv, SYSTEM_UPDATE_TIMEOUT).await {
            Ok((true, output)) => {
                self.sink
                    .report(
                        cmd.id,
                        ReportStatus::Completed,
                        &format!(
                            "Update successful. Rebooting system now...\n\n{}",
                            tail(&output, 500)
                        ),
                    )
                    .await;
                tokio::time::sleep(Duration::from_secs(3)).await;
                // Unconditional reboot on success; whitelist membership is
                // the only gate.
                if let Err(e) = Command::new("reboot").spawn() {
                    warn!("Failed to trigger reboot: {}", e);
                }
            }
            Ok((false, output)) => {
                self.sink
                    .report(
                        cmd.id,
                        ReportStatus::Failed,
                        &format!("Update failed:\n{}", output),
                    )
                    .await;
            }
            Err(AgentError::TimeoutError(_)) => {
                self.sink
                    .report(
                        cmd.id,
                        ReportStatus::Failed,
                        "Update timed out after 10 minutes",
                    )
                    .await;
            }
            Err(e) => {
                self.sink
                    .report(cmd.id, ReportStatus::Failed, &e.to_string())
                    .await;
            }
        }
    }

    async fn handle_container_action(&self, cmd: &CommandEnvelope) {
        let (runtime, action, argv) = match parse_container_action(&cmd.args) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.sink
                    .report(cmd.id, ReportStatus::Failed, &e.to_string())
                    .await;
                return;
            }
        };

        self.sink
            .report(
                cmd.id,
                ReportStatus::Running,
                &format!("Executing {} on {}...", action, argv.last().unwrap_or(&action)),
            )
            .await;

        let timeout = Duration::from_secs(self.config.executor.command_timeout_secs);
        match self.run_process(&runtime, &argv, timeout).await {
            Ok((true, output)) => {
                self.sink
                    .report(cmd.id, ReportStatus::Completed, &output)
                    .await
            }
            Ok((false, output)) => {
                self.sink.report(cmd.id, ReportStatus::Failed, &output).await
            }
            Err(e) => {
                self.sink
                    .report(cmd.id, ReportStatus::Failed, &e.to_string())
                    .await
            }
        }
    }

    /// Stress tests run on a detached task so the poll loop keeps breathing.
    /// The command reports `running` immediately and a terminal status when
    /// the worker finishes.
    fn handle_stress(&self, cmd: &CommandEnvelope, kind: StressKind) {
        let duration = Duration::from_secs(self.config.executor.stress_duration_secs);
        let sink = self.sink.clone();
        let id = cmd.id;

        tokio::spawn(async move {
            sink.report(
                id,
                ReportStatus::Running,
                &format!(
                    "Starting {} stress test ({}s)...",
                    kind.label(),
                    duration.as_secs()
                ),
            )
            .await;

            let result = match kind {
                StressKind::Cpu => run_stress_cpu(duration).await,
                StressKind::Ram => run_stress_ram(duration).await,
            };

            match result {
                Ok(()) => {
                    sink.report(
                        id,
                        ReportStatus::Completed,
                        &format!("{} stress test completed", kind.label()),
                    )
                    .await
                }
                Err(e) => {
                    sink.report(
                        id,
                        ReportStatus::Failed,
                        &format!("Stress test error: {}", e),
                    )
                    .await
                }
            }
        });
    }

    async fn handle_list_packages(&self, cmd: &CommandEnvelope) {
        self.sink
            .report(cmd.id, ReportStatus::Running, "Querying package database...")
            .await;

        let (bin, argv): (&str, Vec<String>) = if find_in_path("rpm").is_some() {
            (
                "bash",
                vec![
                    "-c".to_string(),
                    "rpm -qa --qf '%{NAME}\t%{VERSION}-%{RELEASE}\n' | sort".to_string(),
                ],
            )
        } else if find_in_path("dpkg-query").is_some() {
            (
                "dpkg-query",
                vec![
                    "-W".to_string(),
                    "-f=${Package}\t${Version}\n".to_string(),
                ],
            )
        } else {
            self.sink
                .report(
                    cmd.id,
                    ReportStatus::Failed,
                    "Unsupported OS: no rpm or dpkg found",
                )
                .await;
            return;
        };

        match self.run_process(bin, &argv, LIST_PACKAGES_TIMEOUT).await {
            Ok((true, output)) => {
                self.sink
                    .report(cmd.id, ReportStatus::Completed, &output)
                    .await
            }
            Ok((false, output)) => {
                self.sink.report(cmd.id, ReportStatus::Failed, &output).await
            }
            Err(e) => {
                self.sink
                    .report(cmd.id, ReportStatus::Failed, &e.to_string())
                    .await
            }
        }
    }

    async fn handle_kill_process(&self, cmd: &CommandEnvelope) {
        let (pid, signal) = match parse_kill_args(&cmd.args) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.sink
                    .report(cmd.id, ReportStatus::Failed, &e.to_string())
                    .await;
                return;
            }
        };

        match deliver_signal(pid, signal) {
            Ok(()) => {
                self.sink
                    .report(
                        cmd.id,
                        ReportStatus::Completed,
                        &format!("Sent signal {} to PID {}", signal, pid),
                    )
                    .await
            }
            Err(e) => {
                self.sink
                    .report(cmd.id, ReportStatus::Failed, &e.to_string())
                    .await
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StressKind {
    Cpu,
    Ram,
}

impl StressKind {
    fn label(&self) -> &'static str {
        match self {
            StressKind::Cpu => "CPU",
            StressKind::Ram => "RAM",
        }
    }
}

/// Two busy threads until the deadline.
async fn run_stress_cpu(duration: Duration) -> AgentResult<()> {
    let deadline = std::time::Instant::now() + duration;
    let mut workers = Vec::new();
    for _ in 0..2 {
        workers.push(tokio::task::spawn_blocking(move || {
            let mut acc = 0u64;
            while std::time::Instant::now() < deadline {
                for x in 0..1000u64 {
                    acc = acc.wrapping_add(x * x);
                }
            }
            acc
        }));
    }
    for worker in workers {
        worker
            .await
            .map_err(|e| AgentError::InternalError(format!("stress worker: {}", e)))?;
    }
    Ok(())
}

/// Hold ~512 MB resident for the duration.
async fn run_stress_ram(duration: Duration) -> AgentResult<()> {
    let ballast = vec![1u8; 512 * 1024 * 1024];
    tokio::time::sleep(duration).await;
    drop(ballast);
    Ok(())
}

/// Grammar: "<runtime> <action> <id>". Every token is re-validated before a
/// process call is constructed. Returns (runtime, action, argv).
fn parse_container_action(args: &str) -> AgentResult<(String, String, Vec<String>)> {
    let parts: Vec<&str> = args.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(AgentError::ValidationError(
            "invalid_arguments: expected 'runtime action id'".to_string(),
        ));
    }
    let (runtime, action, container_id) = (parts[0], parts[1], parts[2]);

    if !matches!(runtime, "docker" | "podman") {
        return Err(AgentError::ValidationError(format!(
            "invalid_arguments: invalid runtime: {}",
            runtime
        )));
    }
    if !matches!(action, "restart" | "stop" | "start" | "logs") {
        return Err(AgentError::ValidationError(format!(
            "invalid_arguments: invalid action: {}",
            action
        )));
    }
    if container_id.is_empty()
        || !container_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(AgentError::ValidationError(
            "invalid_arguments: invalid container ID format".to_string(),
        ));
    }

    let mut argv = vec![action.to_string()];
    if action == "logs" {
        argv.push("--tail".to_string());
        argv.push("100".to_string());
    }
    argv.push(container_id.to_string());
    Ok((runtime.to_string(), action.to_string(), argv))
}

/// Grammar: "<pid> [signal]". The signal is restricted to TERM, KILL, INT.
fn parse_kill_args(args: &str) -> AgentResult<(i32, i32)> {
    const ALLOWED_SIGNALS: &[i32] = &[15, 9, 2]; // TERM, KILL, INT

    let parts: Vec<&str> = args.split_whitespace().collect();
    if parts.is_empty() || parts.len() > 2 {
        return Err(AgentError::ValidationError(
            "invalid_arguments: expected 'pid [signal]'".to_string(),
        ));
    }
    let pid: i32 = parts[0].parse().map_err(|_| {
        AgentError::ValidationError(format!("invalid_arguments: invalid PID: {}", parts[0]))
    })?;
    let signal: i32 = match parts.get(1) {
        Some(s) => s.parse().map_err(|_| {
            AgentError::ValidationError(format!("invalid_arguments: invalid signal: {}", s))
        })?,
        None => 15,
    };
    if !ALLOWED_SIGNALS.contains(&signal) {
        return Err(AgentError::ValidationError(format!(
            "invalid_arguments: invalid signal: {} (allowed: TERM, KILL, INT)",
            signal
        )));
    }
    Ok((pid, signal))
}

#[cfg(unix)]
fn deliver_signal(pid: i32, signal: i32) -> AgentResult<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let sig = Signal::try_from(signal)
        .map_err(|_| AgentError::ValidationError(format!("invalid_arguments: signal {}", signal)))?;
    match kill(Pid::from_raw(pid), sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => Err(AgentError::ExecutionError(format!("PID {} not found", pid))),
        Err(Errno::EPERM) => Err(AgentError::ExecutionError(format!(
            "Permission denied killing PID {}",
            pid
        ))),
        Err(e) => Err(AgentError::ExecutionError(format!(
            "Error signalling PID {}: {}",
            pid, e
        ))),
    }
}

#[cfg(not(unix))]
fn deliver_signal(pid: i32, signal: i32) -> AgentResult<()> {
    let mut command = std::process::Command::new("taskkill");
    command.arg("/PID").arg(pid.to_string());
    if signal == 9 {
        command.arg("/F");
    }
    let output = command
        .output()
        .map_err(|e| AgentError::ExecutionError(format!("taskkill: {}", e)))?;
    if output.status.success() {
        Ok(())
    } else {
        Err(AgentError::ExecutionError(format!(
            "taskkill failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )))
    }
}

fn find_in_path(bin: &str) -> Option<std::path::PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(bin);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

fn tail(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth_back(max_chars.saturating_sub(1)) {
        Some((idx, _)) if s.len() > max_chars => &s[idx..],
        _ => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgentConfig, ExecutorConfig, LoggingConfig, ServerConfig, UpdateConfig};
    use crate::registry::OsFamily;
    use crate::transport::{ServerClient, UpdateSource, VersionInfo};
    use async_trait::async_trait;
    use tokio::sync::Mutex;

    struct MemorySink {
        reports: Mutex<Vec<(i64, ReportStatus, String)>>,
    }

    impl MemorySink {
        fn new() -> Self {
            Self {
                reports: Mutex::new(Vec::new()),
            }
        }

        async fn reports(&self) -> Vec<(i64, ReportStatus, String)> {
            self.reports.lock().await.clone()
        }
    }

    #[async_trait]
    impl ReportSink for MemorySink {
        async fn report(&self, id: i64, status: ReportStatus, output: &str) {
            self.reports
                .lock()
                .await
                .push((id, status, output.to_string()));
        }
    }

    fn test_config() -> Arc<AgentConfig> {
        Arc::new(AgentConfig {
            server: ServerConfig {
                url: "http://127.0.0.1:9".to_string(),
                api_key: "test".to_string(),
                hostname: "test-host".to_string(),
                push_interval_secs: 15,
            },
            update: UpdateConfig::default(),
            executor: ExecutorConfig {
                command_timeout_secs: 10,
                stress_duration_secs: 1,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "plain".to_string(),
            },
        })
    }

    fn test_executor() -> (Executor, Arc<MemorySink>) {
        let config = test_config();
        let sink = Arc::new(MemorySink::new());
        let client = Arc::new(ServerClient::new(&config.server.url, "test").unwrap());
        let updater =
            Arc::new(Updater::new(client, Some(std::env::temp_dir()), "1.41.0").unwrap());
        let (restart_tx, _restart_rx) = mpsc::channel(1);
        let executor = Executor::new(
            config,
            Arc::new(CommandRegistry::for_platform(OsFamily::Linux).unwrap()),
            sink.clone(),
            updater,
            restart_tx,
        );
        (executor, sink)
    }

    fn envelope(id: i64, command: &str, args: &str) -> CommandEnvelope {
        CommandEnvelope {
            id,
            command: command.to_string(),
            args: args.to_string(),
        }
    }

    #[tokio::test]
    async fn test_unknown_command_rejected_without_spawn() {
        let (executor, sink) = test_executor();
        executor.execute(&envelope(1, "rm", "-rf /")).await;

        let reports = sink.reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].1, ReportStatus::Failed);
        assert!(reports[0].2.contains("invalid_command"));
        assert_eq!(executor.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_pattern_mismatch_rejected_without_spawn() {
        let (executor, sink) = test_executor();
        executor
            .execute(&envelope(2, "ping", "10.0.0.5; cat /etc/shadow"))
            .await;

        let reports = sink.reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].1, ReportStatus::Failed);
        assert!(reports[0].2.contains("invalid_arguments"));
        assert_eq!(executor.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_no_pattern_entry_rejects_any_argument() {
        let (executor, sink) = test_executor();
        executor.execute(&envelope(3, "uptime", "--help")).await;

        let reports = sink.reports().await;
        assert_eq!(reports[0].1, ReportStatus::Failed);
        assert!(reports[0].2.contains("invalid_arguments"));
        assert_eq!(executor.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_external_command_completes_with_output() {
        let (executor, sink) = test_executor();
        executor.execute(&envelope(4, "disk_space", "")).await;

        let reports = sink.reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].1, ReportStatus::Completed);
        assert!(!reports[0].2.is_empty());
        assert_eq!(executor.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_run_process_timeout_kills_child() {
        let (executor, _sink) = test_executor();
        let err = executor
            .run_process(
                "sleep",
                &["30".to_string()],
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::TimeoutError(_)));
    }

    #[tokio::test]
    async fn test_kill_process_disallowed_signal_rejected() {
        let (executor, sink) = test_executor();
        executor.execute(&envelope(5, "kill_process", "123 9999")).await;

        let reports = sink.reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].1, ReportStatus::Failed);
        assert!(reports[0].2.contains("invalid_arguments"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_process_terminates_child() {
        let (executor, sink) = test_executor();
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();

        executor
            .execute(&envelope(6, "kill_process", &pid.to_string()))
            .await;

        let reports = sink.reports().await;
        assert_eq!(reports[0].1, ReportStatus::Completed);
        assert!(reports[0].2.contains("Sent signal 15"));
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_kill_process_missing_pid_reports_not_found() {
        let (executor, sink) = test_executor();
        // Spawn and fully reap a child; its pid is free again afterwards.
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id().unwrap();
        child.wait().await.unwrap();

        executor
            .execute(&envelope(7, "kill_process", &pid.to_string()))
            .await;

        let reports = sink.reports().await;
        assert_eq!(reports[0].1, ReportStatus::Failed);
        assert!(reports[0].2.contains("not found"));
    }

    #[test]
    fn test_parse_container_action_grammar() {
        assert!(parse_container_action("docker restart web-1").is_ok());
        let (_, _, argv) = parse_container_action("podman logs db_1").unwrap();
        assert_eq!(argv, vec!["logs", "--tail", "100", "db_1"]);

        assert!(parse_container_action("lxc restart web-1").is_err());
        assert!(parse_container_action("docker explode web-1").is_err());
        assert!(parse_container_action("docker restart ../etc").is_err());
        assert!(parse_container_action("docker restart").is_err());
    }

    #[test]
    fn test_parse_kill_args_grammar() {
        assert_eq!(parse_kill_args("1234").unwrap(), (1234, 15));
        assert_eq!(parse_kill_args("1234 9").unwrap(), (1234, 9));
        assert_eq!(parse_kill_args("1234 2").unwrap(), (1234, 2));
        assert!(parse_kill_args("1234 1").is_err());
        assert!(parse_kill_args("abc").is_err());
        assert!(parse_kill_args("").is_err());
        assert!(parse_kill_args("1 2 3").is_err());
    }

    #[test]
    fn test_tail_keeps_last_chars() {
        assert_eq!(tail("hello", 500), "hello");
        let long = "x".repeat(600);
        assert_eq!(tail(&long, 500).len(), 500);
    }

    struct StubUpdateSource;

    #[async_trait]
    impl UpdateSource for StubUpdateSource {
        async fn fetch_version(&self) -> AgentResult<VersionInfo> {
            Ok(VersionInfo {
                version: "99.0.0".to_string(),
                download_url: "/api/agent/download".to_string(),
                requirements_url: None,
                sha256: None,
            })
        }

        async fn download(&self, _path: &str) -> AgentResult<Vec<u8>> {
            Ok(b"new build".to_vec())
        }
    }

    #[tokio::test]
    async fn test_repeated_update_agent_does_not_block_on_restart_signal() {
        let target = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::new());
        let updater = Arc::new(
            Updater::new(
                Arc::new(StubUpdateSource),
                Some(target.path().to_path_buf()),
                "1.41.0",
            )
            .unwrap(),
        );
        let (restart_tx, _restart_rx) = mpsc::channel(1);
        let executor = Executor::new(
            test_config(),
            Arc::new(CommandRegistry::for_platform(OsFamily::Linux).unwrap()),
            sink.clone(),
            updater,
            restart_tx,
        );

        // Both commands apply the same advertised build. The second fills no
        // new restart slot and must complete instead of waiting on the
        // receiver, which lives on the task running this very test.
        tokio::time::timeout(Duration::from_secs(15), async {
            executor.execute(&envelope(9, "update_agent", "")).await;
            executor.execute(&envelope(10, "update_agent", "")).await;
        })
        .await
        .expect("second update blocked on the restart signal");

        let reports = sink.reports().await;
        assert_eq!(reports.len(), 4);
        assert_eq!(reports[1].1, ReportStatus::Completed);
        assert_eq!(reports[3].1, ReportStatus::Completed);
    }

    #[tokio::test]
    async fn test_stress_reports_running_then_completed() {
        let (executor, sink) = test_executor();
        executor.execute(&envelope(8, "stress_cpu", "")).await;

        // Detached worker: wait for it to finish (1s duration in tests).
        tokio::time::sleep(Duration::from_secs(3)).await;
        let reports = sink.reports().await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].1, ReportStatus::Running);
        assert_eq!(reports[1].1, ReportStatus::Completed);
        assert!(reports[1].2.contains("CPU stress test completed"));
    }
}
