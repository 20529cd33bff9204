//! Backup process orchestrator.
//!
//! Runs the external backup tool for one device at a time, turns its output
//! into progress events, classifies failures and, when the backup on disk
//! turns out to be encrypted, hands it to the decryption engine.

pub mod classify;
pub mod probe;

use crate::config::Config;
use crate::decrypt::{is_backup_encrypted, DecryptionEngine};
use crate::events::{BackupEvent, EventBus};
use crate::fs::walker::directory_size;
use crate::transfer::progress::{BackupPhase, BackupProgress, OutputSplitter, ProgressParser};
use crate::utils::{BackupError, BackupErrorCode, Result};
use classify::{classify_failure, normalize_exit_code};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use probe::EncryptionProbe;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

/// Output still buffered after the tool exits is read for at most this long.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const READ_BUFFER_SIZE: usize = 8 * 1024;
/// Diagnostic text kept for failure classification.
const MAX_DIAGNOSTIC_BYTES: usize = 4 * 1024;

/// Parameters of one backup run.
#[derive(Clone)]
pub struct BackupOptions {
    pub device_id: String,
    pub output_dir: PathBuf,

    /// Skip application data (`--skip-apps`)
    pub skip_apps: bool,

    /// Force a full rather than incremental backup (`--full`)
    pub force_full: bool,

    /// Backup password, needed when the device encrypts its backups
    pub password: Option<Zeroizing<String>>,
}

impl BackupOptions {
    pub fn new(device_id: impl Into<String>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            device_id: device_id.into(),
            output_dir: output_dir.into(),
            skip_apps: true,
            force_full: false,
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(Zeroizing::new(password.into()));
        self
    }

    pub fn with_skip_apps(mut self, skip_apps: bool) -> Self {
        self.skip_apps = skip_apps;
        self
    }

    pub fn with_force_full(mut self, force_full: bool) -> Self {
        self.force_full = force_full;
        self
    }

    /// Arguments passed to the backup tool.
    pub fn tool_args(&self) -> Vec<String> {
        let mut args = vec![
            "-u".to_string(),
            self.device_id.clone(),
            "backup".to_string(),
        ];
        if self.skip_apps {
            args.push("--skip-apps".to_string());
        }
        if self.force_full {
            args.push("--full".to_string());
        }
        args.push(self.output_dir.to_string_lossy().into_owned());
        args
    }
}

impl fmt::Debug for BackupOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupOptions")
            .field("device_id", &self.device_id)
            .field("output_dir", &self.output_dir)
            .field("skip_apps", &self.skip_apps)
            .field("force_full", &self.force_full)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Terminal outcome of a backup run. Created exactly once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupResult {
    pub success: bool,

    /// The backup directory, or the decrypted output when it was decrypted
    pub backup_path: Option<PathBuf>,

    pub error: Option<String>,
    pub error_code: Option<BackupErrorCode>,
    pub duration_ms: u64,
    pub is_incremental: bool,
    pub size_bytes: u64,
    pub is_encrypted: bool,
}

impl BackupResult {
    fn failed(code: BackupErrorCode, message: impl Into<String>, started: Instant) -> Self {
        Self {
            success: false,
            backup_path: None,
            error: Some(message.into()),
            error_code: Some(code),
            duration_ms: elapsed_ms(started),
            is_incremental: false,
            size_bytes: 0,
            is_encrypted: false,
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// The in-flight run, if any. Owned by one orchestrator.
#[derive(Debug, Default)]
struct RunState {
    active: Option<ActiveRun>,
    next_id: u64,
}

#[derive(Debug)]
struct ActiveRun {
    id: u64,
    cancel: CancellationToken,
}

/// Releases the run slot when a run finishes, unless it was already released
/// by a cancellation (and possibly taken by a newer run).
struct RunSlot<'a> {
    state: &'a Mutex<RunState>,
    id: u64,
}

impl Drop for RunSlot<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.active.as_ref().is_some_and(|run| run.id == self.id) {
            state.active = None;
        }
    }
}

enum Output {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Runs device backups and reports on them through an [`EventBus`].
pub struct BackupOrchestrator {
    config: Config,
    events: EventBus,
    probe: EncryptionProbe,
    engine: Arc<DecryptionEngine>,
    run: Mutex<RunState>,
    latest: Mutex<Option<BackupProgress>>,
}

impl BackupOrchestrator {
    pub fn new(config: Config) -> Self {
        Self::with_engine(config, DecryptionEngine::new())
    }

    pub fn with_engine(config: Config, engine: DecryptionEngine) -> Self {
        let probe = EncryptionProbe::new(config.tools.info.clone(), config.backup.probe_timeout());
        Self {
            config,
            events: EventBus::new(),
            probe,
            engine: Arc::new(engine),
            run: Mutex::new(RunState::default()),
            latest: Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BackupEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.lock_run().active.is_some()
    }

    /// Most recent progress of the current or last run.
    pub fn latest_progress(&self) -> Option<BackupProgress> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the device will encrypt its backup. Never fails.
    pub async fn check_encryption_status(&self, device_id: &str) -> bool {
        self.probe.check(device_id).await
    }

    /// Runs one backup to completion.
    ///
    /// Operational failures come back as a failed [`BackupResult`]; an `Err`
    /// means the call itself was invalid, e.g. a run is already active.
    pub async fn start_backup(&self, options: BackupOptions) -> Result<BackupResult> {
        let (id, cancel) = self.claim_run()?;
        let _slot = RunSlot {
            state: &self.run,
            id,
        };
        self.set_latest(None);

        let started = Instant::now();
        info!("Starting backup {} of device {}", id, options.device_id);

        let result = match self.run_backup(&options, &cancel, started).await {
            Ok(result) => result,
            Err(e) => {
                error!("Backup {} failed: {}", id, e);
                BackupResult::failed(BackupErrorCode::UnknownError, e.to_string(), started)
            }
        };

        if result.success {
            info!(
                "Backup {} finished in {} ms ({} bytes)",
                id, result.duration_ms, result.size_bytes
            );
        } else if let (Some(code), Some(message)) = (result.error_code, result.error.clone()) {
            warn!("Backup {} failed with {}: {}", id, code, message);
            self.events.emit(BackupEvent::Error { code, message });
        }
        self.events.emit(BackupEvent::Complete(result.clone()));

        Ok(result)
    }

    /// Requests cancellation of the active run. Returns `false` when idle.
    ///
    /// The run slot is released at once; the tool gets SIGTERM and, after the
    /// configured grace period, SIGKILL.
    pub fn cancel_backup(&self) -> bool {
        match self.lock_run().active.take() {
            Some(run) => {
                info!("Cancelling backup {}", run.id);
                run.cancel.cancel();
                true
            }
            None => {
                debug!("Cancel requested with no backup running");
                false
            }
        }
    }

    fn lock_run(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn claim_run(&self) -> Result<(u64, CancellationToken)> {
        let mut state = self.lock_run();
        if state.active.is_some() {
            return Err(BackupError::AlreadyRunning);
        }
        state.next_id += 1;
        let run = ActiveRun {
            id: state.next_id,
            cancel: CancellationToken::new(),
        };
        let claimed = (run.id, run.cancel.clone());
        state.active = Some(run);
        Ok(claimed)
    }

    fn set_latest(&self, progress: Option<BackupProgress>) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = progress;
    }

    fn report(&self, progress: BackupProgress) {
        self.set_latest(Some(progress.clone()));
        self.events.emit(BackupEvent::Progress(progress));
    }

    fn password_required(&self, device_id: &str, started: Instant) -> BackupResult {
        self.events.emit(BackupEvent::PasswordRequired {
            device_id: device_id.to_string(),
        });
        let code = BackupErrorCode::PasswordRequired;
        BackupResult::failed(code, code.user_message(), started)
    }

    async fn run_backup(
        &self,
        options: &BackupOptions,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<BackupResult> {
        let will_encrypt = self.check_encryption_status(&options.device_id).await;
        if will_encrypt && options.password.is_none() {
            info!("Device {} encrypts its backups; password required", options.device_id);
            return Ok(self.password_required(&options.device_id, started));
        }
        if cancel.is_cancelled() {
            return Ok(cancelled(started));
        }

        tokio::fs::create_dir_all(&options.output_dir).await?;
        self.report(BackupProgress::milestone(BackupPhase::Preparing, 0.0));

        let tool = &self.config.tools.backup;
        let mut command = tool.command();
        command
            .args(options.tool_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| BackupError::Spawn {
            program: tool.program.clone(),
            source,
        })?;
        let pid = child.id();
        debug!("Spawned {} (pid {:?})", tool.program, pid);

        let (tx, mut rx) = mpsc::channel(64);
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, tx.clone(), Output::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, tx, Output::Stderr));
        }

        let mut monitor = OutputMonitor::new(started);
        let grace = self.config.backup.cancel_grace();
        let mut kill_at: Option<tokio::time::Instant> = None;
        let mut killed = false;

        let status = loop {
            tokio::select! {
                Some(output) = rx.recv() => {
                    for progress in monitor.consume(output) {
                        self.report(progress);
                    }
                }
                status = child.wait() => break status?,
                _ = cancel.cancelled(), if kill_at.is_none() => {
                    info!("Sending SIGTERM to backup tool");
                    send_signal(pid, Signal::SIGTERM);
                    kill_at = Some(tokio::time::Instant::now() + grace);
                }
                _ = tokio::time::sleep_until(kill_at.unwrap_or_else(tokio::time::Instant::now)),
                    if kill_at.is_some() && !killed =>
                {
                    warn!("Backup tool still running {:?} after SIGTERM, killing", grace);
                    send_signal(pid, Signal::SIGKILL);
                    killed = true;
                }
            }
        };

        // Readers may still hold buffered output.
        let drain_until = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while let Ok(Some(output)) = tokio::time::timeout_at(drain_until, rx.recv()).await {
            for progress in monitor.consume(output) {
                self.report(progress);
            }
        }
        for progress in monitor.finish() {
            self.report(progress);
        }

        if cancel.is_cancelled() {
            info!("Backup tool exited after cancellation ({})", status);
            return Ok(cancelled(started));
        }

        if !status.success() {
            let exit_code = exit_code(&status);
            let (code, message) = classify_failure(exit_code, &monitor.diagnostics);
            return Ok(BackupResult::failed(code, message, started));
        }

        self.finish_backup(options, monitor.parser.is_incremental(), cancel, started)
            .await
    }

    async fn finish_backup(
        &self,
        options: &BackupOptions,
        is_incremental: bool,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<BackupResult> {
        let backup_dir = resolve_backup_dir(&options.output_dir, &options.device_id);

        // The device probe can disagree with what was written.
        let is_encrypted = is_backup_encrypted(&backup_dir);

        let size_dir = backup_dir.clone();
        let size_bytes = tokio::task::spawn_blocking(move || directory_size(&size_dir))
            .await
            .map_err(|e| BackupError::Task(e.to_string()))?;

        let mut backup_path = backup_dir.clone();
        if is_encrypted {
            let Some(password) = options.password.clone() else {
                return Ok(self.password_required(&options.device_id, started));
            };

            if cancel.is_cancelled() {
                return Ok(cancelled(started));
            }
            self.report(BackupProgress::milestone(BackupPhase::Decrypting, 100.0));
            let engine = Arc::clone(&self.engine);
            let dir = backup_dir.clone();
            let token = cancel.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                engine.decrypt_cancellable(&dir, &password, &token)
            })
            .await
            .map_err(|e| BackupError::Task(e.to_string()))?;

            // A cancel that lands after the last file still discards the output.
            if cancel.is_cancelled() || outcome.is_cancelled() {
                if let Some(decrypted) = outcome.decrypted_path {
                    self.discard_decrypted(decrypted).await;
                }
                return Ok(cancelled(started));
            }
            if !outcome.success {
                let code = if outcome.is_incorrect_password() {
                    BackupErrorCode::IncorrectPassword
                } else {
                    BackupErrorCode::DecryptionFailed
                };
                let message = match outcome.error {
                    Some(detail) if code == BackupErrorCode::DecryptionFailed => {
                        format!("{} ({})", code.user_message(), detail)
                    }
                    _ => code.user_message().to_string(),
                };
                let mut result = BackupResult::failed(code, message, started);
                result.is_encrypted = true;
                result.is_incremental = is_incremental;
                result.size_bytes = size_bytes;
                return Ok(result);
            }
            if let Some(decrypted) = outcome.decrypted_path {
                backup_path = decrypted;
            }
        }

        Ok(BackupResult {
            success: true,
            backup_path: Some(backup_path),
            error: None,
            error_code: None,
            duration_ms: elapsed_ms(started),
            is_incremental,
            size_bytes,
            is_encrypted,
        })
    }
}

impl BackupOrchestrator {
    async fn discard_decrypted(&self, dir: PathBuf) {
        let engine = Arc::clone(&self.engine);
        let target = dir.clone();
        match tokio::task::spawn_blocking(move || engine.cleanup(&target)).await {
            Ok(Ok(scrubbed)) => info!("Discarded {} decrypted file(s) after cancel", scrubbed),
            Ok(Err(e)) => warn!("Failed to discard {}: {}", dir.display(), e),
            Err(e) => warn!("Cleanup task for {} failed: {}", dir.display(), e),
        }
    }
}

fn cancelled(started: Instant) -> BackupResult {
    let code = BackupErrorCode::BackupCancelled;
    BackupResult::failed(code, code.user_message(), started)
}

/// The tool writes into `<output>/<device id>`; fall back to the output
/// directory itself when it holds the backup directly.
pub fn resolve_backup_dir(output_dir: &Path, device_id: &str) -> PathBuf {
    let nested = output_dir.join(device_id);
    if nested.is_dir() {
        nested
    } else {
        output_dir.to_path_buf()
    }
}

fn exit_code(status: &ExitStatus) -> Option<i32> {
    status.code().map(|code| normalize_exit_code(i64::from(code)))
}

fn send_signal(pid: Option<u32>, sig: Signal) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = signal::kill(Pid::from_raw(pid), sig) {
        debug!("Failed to send {:?} to {}: {}", sig, pid, e);
    }
}

async fn forward_output<R>(mut reader: R, tx: mpsc::Sender<Output>, wrap: fn(Vec<u8>) -> Output)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(wrap(buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Output stream closed: {}", e);
                break;
            }
        }
    }
}

/// Line splitting, progress parsing and diagnostic capture for one run.
struct OutputMonitor {
    started: Instant,
    parser: ProgressParser,
    stdout: OutputSplitter,
    stderr: OutputSplitter,
    diagnostics: String,
}

impl OutputMonitor {
    fn new(started: Instant) -> Self {
        Self {
            started,
            parser: ProgressParser::new(),
            stdout: OutputSplitter::new(),
            stderr: OutputSplitter::new(),
            diagnostics: String::new(),
        }
    }

    fn consume(&mut self, output: Output) -> Vec<BackupProgress> {
        let lines: Vec<(String, bool)> = match output {
            Output::Stdout(bytes) => self.stdout.push(&bytes).into_iter().map(|l| (l, false)).collect(),
            Output::Stderr(bytes) => self.stderr.push(&bytes).into_iter().map(|l| (l, true)).collect(),
        };
        lines
            .into_iter()
            .filter_map(|(line, is_stderr)| self.line(&line, is_stderr))
            .collect()
    }

    fn finish(&mut self) -> Vec<BackupProgress> {
        let mut rest = Vec::new();
        if let Some(line) = self.stdout.finish() {
            rest.extend(self.line(&line, false));
        }
        if let Some(line) = self.stderr.finish() {
            rest.extend(self.line(&line, true));
        }
        rest
    }

    fn line(&mut self, line: &str, is_stderr: bool) -> Option<BackupProgress> {
        debug!("tool: {}", line);
        if is_stderr || line.to_ascii_lowercase().contains("error") {
            self.record_diagnostic(line);
        }
        self.parser.parse_line(line, self.started.elapsed())
    }

    fn record_diagnostic(&mut self, line: &str) {
        if !self.diagnostics.is_empty() {
            self.diagnostics.push('\n');
        }
        self.diagnostics.push_str(line);
        if self.diagnostics.len() > MAX_DIAGNOSTIC_BYTES {
            let mut cut = self.diagnostics.len() - MAX_DIAGNOSTIC_BYTES;
            while !self.diagnostics.is_char_boundary(cut) {
                cut += 1;
            }
            self.diagnostics.drain(..cut);
        }
    }
}
