use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use crate::config::V2rayConfig;
use crate::convert;
use crate::engine::{self, LineKind};
use crate::error::{ConvertError, CoreError, Result};
use crate::logbook::{self, LogBook, LogRecord};
use crate::monitor::{PortMonitor, PortOutcome, WatchOptions};
use crate::profile::{ConfigKind, CoreType, ListenerPort, ProfileItem};
use crate::settings::SupervisorSettings;
use crate::store::ProfileStore;

const CONVERTED_CONFIG_NAME: &str = "config.yaml";
const GENERATED_CONFIG_NAME: &str = "config.json";
const IMPORTED_SOURCE_NAME: &str = "source.yaml";
const ENGINE_LOG_NAME: &str = "engine.log";
const STDERR_HEAD_LINES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for CoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoreState::Stopped => "stopped",
            CoreState::Starting => "starting",
            CoreState::Running => "running",
            CoreState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// What proved a port was listening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOrigin {
    Probe,
    EngineLog,
}

#[derive(Debug, Clone)]
pub enum CoreEvent {
    Log(LogRecord),
    State {
        profile_id: String,
        state: CoreState,
        reason: Option<String>,
    },
    PortActive {
        profile_id: String,
        port: u16,
        origin: ActivationOrigin,
    },
    PortTimeout {
        profile_id: String,
        port: u16,
    },
}

/// Result of [`CoreSupervisor::import_clash_profile`]. A failed conversion
/// still yields a usable custom profile.
#[derive(Debug)]
pub struct ImportOutcome {
    pub profile: ProfileItem,
    pub conversion_error: Option<ConvertError>,
}

struct TrackedCore {
    child: Child,
    pid: u32,
    generation: u64,
    ports: Vec<u16>,
}

#[derive(Default)]
struct StderrHead {
    lines: Vec<String>,
    closed: bool,
}

#[derive(Clone)]
struct StreamContext {
    profile_id: String,
    generation: u64,
    binary: String,
    core_type: CoreType,
    display_log: bool,
    stderr_head: Arc<Mutex<StderrHead>>,
}

struct Shared {
    settings: SupervisorSettings,
    store: Arc<ProfileStore>,
    monitor: PortMonitor,
    events: broadcast::Sender<CoreEvent>,
    logbook: Option<LogBook>,

    processes: Mutex<HashMap<String, TrackedCore>>,
    children: Mutex<HashMap<String, HashSet<u32>>>,
    binaries: Mutex<HashMap<String, String>>,
    launch_configs: Mutex<HashMap<String, String>>,
    states: Mutex<HashMap<String, CoreState>>,
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_generation: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Launches proxy engines for profiles and keeps their process, port and
/// lifecycle state. Cloning yields another handle to the same supervisor.
///
/// Lock order: `processes` before any other table or the store. No guard is
/// held across an await.
#[derive(Clone)]
pub struct CoreSupervisor {
    inner: Arc<Shared>,
}

impl CoreSupervisor {
    pub fn new(settings: SupervisorSettings, store: Arc<ProfileStore>) -> Self {
        let logbook = match LogBook::open(
            &settings.log_dir,
            ENGINE_LOG_NAME,
            logbook::parse_rotation(&settings.log_rotation),
            settings.log_keep,
        ) {
            Ok(book) => Some(book),
            Err(e) => {
                warn!("Engine log unavailable in {:?}: {}", settings.log_dir, e);
                None
            }
        };
        let (events, _) = broadcast::channel(settings.event_capacity.max(1));
        let monitor = PortMonitor::new(WatchOptions::from(&settings));

        Self {
            inner: Arc::new(Shared {
                settings,
                store,
                monitor,
                events,
                logbook,
                processes: Mutex::new(HashMap::new()),
                children: Mutex::new(HashMap::new()),
                binaries: Mutex::new(HashMap::new()),
                launch_configs: Mutex::new(HashMap::new()),
                states: Mutex::new(HashMap::new()),
                op_locks: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &Arc<ProfileStore> {
        &self.inner.store
    }

    pub fn monitor(&self) -> &PortMonitor {
        &self.inner.monitor
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.inner.events.subscribe()
    }

    fn publish(&self, event: CoreEvent) {
        // no receivers is fine
        let _ = self.inner.events.send(event);
    }

    fn emit_log(&self, text: String) {
        info!("{}", text);
        let record = LogRecord::now(text);
        if let Some(book) = &self.inner.logbook {
            book.append(&record);
        }
        self.publish(CoreEvent::Log(record));
    }

    fn set_state(&self, id: &str, state: CoreState, reason: Option<String>) {
        {
            let mut states = lock(&self.inner.states);
            if state == CoreState::Stopped {
                states.remove(id);
            } else {
                states.insert(id.to_string(), state);
            }
        }
        debug!("Profile {} is now {}", id, state);
        self.publish(CoreEvent::State {
            profile_id: id.to_string(),
            state,
            reason,
        });
    }

    fn op_lock(&self, id: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.inner.op_locks)
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    pub fn state(&self, id: &str) -> CoreState {
        lock(&self.inner.states)
            .get(id)
            .copied()
            .unwrap_or(CoreState::Stopped)
    }

    /// True while the tracked process for `id` has not exited.
    pub fn is_running(&self, id: &str) -> bool {
        let mut processes = lock(&self.inner.processes);
        match processes.get_mut(id) {
            Some(tracked) => matches!(tracked.child.try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn pid(&self, id: &str) -> Option<u32> {
        lock(&self.inner.processes).get(id).map(|t| t.pid)
    }

    pub fn running_profiles(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.inner.processes).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Config text the current process was launched with.
    pub fn launch_config(&self, id: &str) -> Option<String> {
        lock(&self.inner.launch_configs).get(id).cloned()
    }

    pub fn binary_name(&self, id: &str) -> Option<String> {
        lock(&self.inner.binaries).get(id).cloned()
    }

    fn is_tracked(&self, id: &str) -> bool {
        lock(&self.inner.processes).contains_key(id)
    }

    /// Drops every per-profile table entry except the process itself.
    /// Returns whether anything was left behind.
    fn forget(&self, id: &str) -> bool {
        let children = lock(&self.inner.children).remove(id).is_some();
        let binary = lock(&self.inner.binaries).remove(id).is_some();
        let config = lock(&self.inner.launch_configs).remove(id).is_some();
        children || binary || config
    }

    /// Starts the engine for profile `id`, restarting it if it already runs.
    pub async fn start(&self, id: &str) -> Result<()> {
        let op = self.op_lock(id);
        let _guard = op.lock().await;

        let profile = self
            .inner
            .store
            .get(id)
            .ok_or_else(|| CoreError::ProfileNotFound(id.to_string()))?;

        if self.is_tracked(id) {
            info!("Profile {} already running, restarting", id);
            self.stop_locked(id).await;
        }

        self.set_state(id, CoreState::Starting, None);
        let name = profile.display_name.clone();
        match self.launch(profile).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let leftover = lock(&self.inner.processes).remove(id);
                if let Some(mut tracked) = leftover {
                    let _ = tracked.child.kill();
                    let _ = tracked.child.wait();
                }
                self.forget(id);
                self.inner.store.clear_runtime_flags(id);
                self.emit_log(format!("Failed to start {}: {}", name, e));
                self.set_state(id, CoreState::Stopped, Some(e.to_string()));
                Err(e)
            }
        }
    }

    pub async fn start_selected(&self) -> Result<()> {
        let selected = self
            .inner
            .store
            .selected()
            .ok_or_else(|| CoreError::InvalidArgument("no profile selected".to_string()))?;
        self.start(&selected.id).await
    }

    async fn launch(&self, mut profile: ProfileItem) -> Result<()> {
        let settings = &self.inner.settings;
        let id = profile.id.clone();

        let exe = engine::resolve_binary(profile.core_type, &settings.bin_dir).ok_or_else(|| {
            CoreError::BinaryNotFound {
                core_type: profile.core_type,
                bin_dir: settings.bin_dir.clone(),
            }
        })?;
        let binary = exe
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| profile.core_type.to_string());

        let run_dir = settings.work_dir.join(&id);
        fs::create_dir_all(&run_dir).map_err(|source| CoreError::ConfigIo {
            path: run_dir.clone(),
            source,
        })?;

        let (config_path, config_text) = self.prepare_config(&mut profile, &run_dir)?;
        let invocation = engine::invocation(profile.core_type, &exe, &config_path, &run_dir);
        let ports = profile.declared_ports();

        info!("Launching {}", invocation.display());
        let mut child = invocation
            .command()
            .spawn()
            .map_err(|e| CoreError::ProcessSpawn {
                binary: binary.clone(),
                reason: e.to_string(),
            })?;
        let pid = child.id();
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        {
            let mut processes = lock(&self.inner.processes);
            processes.insert(
                id.clone(),
                TrackedCore {
                    child,
                    pid,
                    generation,
                    ports: ports.clone(),
                },
            );
            lock(&self.inner.binaries).insert(id.clone(), binary.clone());
            lock(&self.inner.launch_configs).insert(id.clone(), config_text);
            lock(&self.inner.children).insert(id.clone(), HashSet::new());
        }

        let ctx = StreamContext {
            profile_id: id.clone(),
            generation,
            binary: binary.clone(),
            core_type: profile.core_type,
            display_log: profile.display_log,
            stderr_head: Arc::new(Mutex::new(StderrHead::default())),
        };
        if let Some(out) = stdout {
            self.spawn_reader(out, ctx.clone(), false);
        }
        match stderr {
            Some(err) => self.spawn_reader(err, ctx.clone(), true),
            None => lock(&ctx.stderr_head).closed = true,
        }

        tokio::time::sleep(Duration::from_millis(settings.startup_grace_ms)).await;
        if let Some(status) = self.exit_status(&id, generation) {
            let head = self.stderr_head(&ctx.stderr_head).await;
            let reason = if head.is_empty() {
                format!("process exited immediately ({})", status)
            } else {
                format!("process exited immediately ({}): {}", status, head.join(" | "))
            };
            return Err(CoreError::ProcessSpawn { binary, reason });
        }

        let spawned = engine::descendants(pid);
        if !spawned.is_empty() {
            debug!("Engine {} spawned children {:?}", pid, spawned);
            lock(&self.inner.children)
                .entry(id.clone())
                .or_default()
                .extend(spawned);
        }

        self.set_state(&id, CoreState::Running, None);
        self.emit_log(format!(
            "Started {} with {} (pid {})",
            profile.display_name, binary, pid
        ));
        for port in ports {
            self.watch(&id, generation, port);
        }
        Ok(())
    }

    /// Writes or locates the config file the engine is launched with.
    fn prepare_config(&self, profile: &mut ProfileItem, run_dir: &Path) -> Result<(PathBuf, String)> {
        let settings = &self.inner.settings;

        if !profile.core_type.is_clash_family() {
            let port = profile.primary_port;
            if port == 0 {
                return Err(CoreError::InvalidArgument(format!(
                    "profile {} has no listening port",
                    profile.id
                )));
            }
            ensure_port_free(port)?;
            let path = run_dir.join(GENERATED_CONFIG_NAME);
            let text = V2rayConfig::single_port(port, profile.pre_socks_port, &settings.engine_log_level)
                .to_json()
                .map_err(|source| CoreError::ConfigParse {
                    path: path.clone(),
                    source,
                })?;
            fs::write(&path, &text).map_err(|source| CoreError::ConfigIo {
                path: path.clone(),
                source,
            })?;
            return Ok((path, text));
        }

        let (path, discovered) = match profile.config_kind {
            ConfigKind::ConvertedYaml => {
                let src = PathBuf::from(&profile.config_path);
                let dst = run_dir.join(CONVERTED_CONFIG_NAME);
                let start = if profile.primary_port == 0 {
                    settings.clash_start_port
                } else {
                    profile.primary_port
                };
                match convert::convert_file(&src, &dst, start) {
                    Ok(conversion) => (dst, conversion.listeners),
                    Err(e) => {
                        if !dst.exists() {
                            return Err(e.into());
                        }
                        self.emit_log(format!(
                            "Conversion of {} failed, running it unmodified: {}",
                            profile.config_path, e
                        ));
                        let found = discover_listeners(&dst);
                        (dst, found)
                    }
                }
            }
            ConfigKind::Custom => {
                let path = PathBuf::from(&profile.config_path);
                let found = if profile.listeners.is_empty() {
                    discover_listeners(&path)
                } else {
                    vec![]
                };
                (path, found)
            }
        };

        if !discovered.is_empty() {
            profile.listeners = discovered.clone();
            self.inner
                .store
                .update(&profile.id, move |item| item.listeners = discovered);
        }
        let text = fs::read_to_string(&path).map_err(|source| CoreError::ConfigIo {
            path: path.clone(),
            source,
        })?;
        Ok((path, text))
    }

    fn exit_status(&self, id: &str, generation: u64) -> Option<String> {
        let mut processes = lock(&self.inner.processes);
        match processes.get_mut(id) {
            Some(tracked) if tracked.generation == generation => match tracked.child.try_wait() {
                Ok(Some(status)) => Some(status.to_string()),
                Ok(None) => None,
                Err(e) => Some(e.to_string()),
            },
            _ => Some("no longer tracked".to_string()),
        }
    }

    async fn stderr_head(&self, head: &Arc<Mutex<StderrHead>>) -> Vec<String> {
        // give the reader a moment to drain what the dead process wrote
        for _ in 0..10 {
            if lock(head).closed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        lock(head).lines.clone()
    }

    fn watch(&self, id: &str, generation: u64, port: u16) {
        let this = self.clone();
        let Some(handle) = self
            .inner
            .monitor
            .watch_port(port, move |port| this.on_port_active(port))
        else {
            return;
        };

        let this = self.clone();
        let id = id.to_string();
        tokio::spawn(async move {
            if let Ok(PortOutcome::TimedOut { .. }) = handle.await {
                if this.is_current(&id, generation) {
                    this.publish(CoreEvent::PortTimeout {
                        profile_id: id,
                        port,
                    });
                } else {
                    debug!("Ignoring timeout on port {} from an old launch", port);
                }
            }
        });
    }

    fn is_current(&self, id: &str, generation: u64) -> bool {
        lock(&self.inner.processes)
            .get(id)
            .is_some_and(|t| t.generation == generation)
    }

    /// Marks `port` active on every tracked profile that declares it.
    fn on_port_active(&self, port: u16) {
        let processes = lock(&self.inner.processes);
        let owners: Vec<&String> = processes
            .iter()
            .filter(|(_, tracked)| tracked.ports.contains(&port))
            .map(|(id, _)| id)
            .collect();
        if owners.is_empty() {
            debug!("Port {} came up with no tracked owner", port);
        }
        for id in owners {
            self.inner.store.set_listener_active(id, port, true);
            self.publish(CoreEvent::PortActive {
                profile_id: id.clone(),
                port,
                origin: ActivationOrigin::Probe,
            });
        }
    }

    fn on_engine_listening(&self, ctx: &StreamContext, port: u16) {
        let processes = lock(&self.inner.processes);
        let declared = processes
            .get(&ctx.profile_id)
            .is_some_and(|t| t.generation == ctx.generation && t.ports.contains(&port));
        if !declared {
            return;
        }
        self.inner
            .store
            .set_listener_active(&ctx.profile_id, port, true);
        self.publish(CoreEvent::PortActive {
            profile_id: ctx.profile_id.clone(),
            port,
            origin: ActivationOrigin::EngineLog,
        });
    }

    fn spawn_reader<R: Read + Send + 'static>(&self, stream: R, ctx: StreamContext, is_stderr: bool) {
        let this = self.clone();
        std::thread::spawn(move || {
            let mut reader = BufReader::new(stream);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf) {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&buf);
                        let line = text.trim_end_matches(&['\r', '\n'][..]);
                        if line.is_empty() {
                            continue;
                        }
                        let handled = catch_unwind(AssertUnwindSafe(|| {
                            this.handle_line(&ctx, line, is_stderr)
                        }));
                        if handled.is_err() {
                            error!("Output handler for {} panicked", ctx.binary);
                        }
                    }
                    Err(e) => {
                        warn!("Reading output of {} failed: {}", ctx.binary, e);
                        break;
                    }
                }
            }

            if is_stderr {
                lock(&ctx.stderr_head).closed = true;
            } else if catch_unwind(AssertUnwindSafe(|| this.on_output_closed(&ctx))).is_err() {
                error!("Exit handler for {} panicked", ctx.binary);
            }
        });
    }

    fn handle_line(&self, ctx: &StreamContext, line: &str, is_stderr: bool) {
        let record = LogRecord::now(format!("[{}] {}", ctx.binary, line));
        if let Some(book) = &self.inner.logbook {
            book.append(&record);
        }

        let kind = engine::classify_line(ctx.core_type, line);
        match kind {
            LineKind::Listening(port) => self.on_engine_listening(ctx, port),
            LineKind::Fatal => warn!("{}", record.text),
            LineKind::Ignorable | LineKind::Info => {}
        }
        if is_stderr && kind != LineKind::Ignorable {
            let mut head = lock(&ctx.stderr_head);
            if head.lines.len() < STDERR_HEAD_LINES {
                head.lines.push(line.to_string());
            }
        }
        if ctx.display_log {
            self.publish(CoreEvent::Log(record));
        }
    }

    /// Runs when the engine's stdout closes. If the process exited on its own,
    /// its tracking is torn down as if it had been stopped.
    ///
    /// Runs on the reader thread and holds the profile's operation lock for
    /// the whole teardown, so a concurrent `start` or `stop` waits for it.
    fn on_output_closed(&self, ctx: &StreamContext) {
        let id = &ctx.profile_id;
        let op = self.op_lock(id);
        let _guard = op.blocking_lock();

        let mut status = None;
        for _ in 0..20 {
            {
                let mut processes = lock(&self.inner.processes);
                let Some(tracked) = processes.get_mut(id) else {
                    return;
                };
                if tracked.generation != ctx.generation {
                    return;
                }
                if let Ok(Some(exit)) = tracked.child.try_wait() {
                    processes.remove(id);
                    status = Some(exit);
                    break;
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let Some(status) = status else {
            debug!("{} closed stdout but is still running", ctx.binary);
            return;
        };

        let orphans = lock(&self.inner.children).remove(id).unwrap_or_default();
        let child_timeout = Duration::from_millis(self.inner.settings.child_stop_timeout_ms);
        for pid in orphans {
            engine::terminate_pid(pid, child_timeout);
        }
        self.forget(id);
        self.inner.store.clear_runtime_flags(id);
        let reason = format!("{} exited unexpectedly ({})", ctx.binary, status);
        self.emit_log(reason.clone());
        self.set_state(id, CoreState::Stopped, Some(reason));
    }

    /// Stops the engine for `id`. Does nothing if none is running.
    pub async fn stop(&self, id: &str) {
        let op = self.op_lock(id);
        let _guard = op.lock().await;
        self.stop_locked(id).await;
    }

    async fn stop_locked(&self, id: &str) {
        let tracked = lock(&self.inner.processes).remove(id);
        let Some(mut tracked) = tracked else {
            if self.forget(id) {
                self.inner.store.clear_runtime_flags(id);
            }
            return;
        };

        self.set_state(id, CoreState::Stopping, None);
        for port in &tracked.ports {
            self.inner.monitor.release(*port);
        }
        let mut aux = lock(&self.inner.children).remove(id).unwrap_or_default();
        let stop_timeout = Duration::from_millis(self.inner.settings.stop_timeout_ms);
        let child_timeout = Duration::from_millis(self.inner.settings.child_stop_timeout_ms);
        let pid = tracked.pid;

        let teardown = tokio::task::spawn_blocking(move || {
            // descendants must be collected before the parent dies
            aux.extend(engine::descendants(pid));
            terminate_child(&mut tracked.child, stop_timeout);
            for child_pid in aux {
                if !engine::terminate_pid(child_pid, child_timeout) {
                    warn!("Could not kill child process {}", child_pid);
                }
            }
        })
        .await;
        if let Err(e) = teardown {
            error!("Teardown of profile {} failed: {}", id, e);
        }

        let binary = lock(&self.inner.binaries)
            .get(id)
            .cloned()
            .unwrap_or_default();
        self.forget(id);
        self.inner.store.clear_runtime_flags(id);
        self.emit_log(format!("Stopped {} (pid {})", binary, pid));
        self.set_state(id, CoreState::Stopped, None);
    }

    /// Stops every tracked engine and resets all activation state.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = lock(&self.inner.processes).keys().cloned().collect();
        futures_util::future::join_all(ids.iter().map(|id| self.stop(id))).await;
        self.inner.monitor.clear();
        self.inner.store.clear_all_runtime_flags();
    }

    /// Stops the profile's engine, then deletes the profile and its work files.
    pub async fn remove_profile(&self, id: &str) {
        self.stop(id).await;
        self.inner.store.remove(id);
        let run_dir = self.inner.settings.work_dir.join(id);
        if run_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&run_dir) {
                warn!("Failed to remove {:?}: {}", run_dir, e);
            }
        }
        lock(&self.inner.op_locks).remove(id);
    }

    /// Copies a Clash config into the work directory and registers it as a
    /// converted profile. If it cannot be converted, it is kept as a custom
    /// profile with whatever ports can be found in it.
    pub fn import_clash_profile(
        &self,
        src: &Path,
        name: &str,
        core_type: CoreType,
        start_port: u16,
    ) -> Result<ImportOutcome> {
        if !core_type.is_clash_family() {
            return Err(CoreError::InvalidArgument(format!(
                "{} cannot run Clash configs",
                core_type
            )));
        }
        let start = if start_port == 0 {
            self.inner.settings.clash_start_port
        } else {
            start_port
        };
        let mut profile = ProfileItem::new(name, core_type, "", start);

        let run_dir = self.inner.settings.work_dir.join(&profile.id);
        fs::create_dir_all(&run_dir).map_err(|source| CoreError::ConfigIo {
            path: run_dir.clone(),
            source,
        })?;
        let source_copy = run_dir.join(IMPORTED_SOURCE_NAME);
        fs::copy(src, &source_copy).map_err(|source| CoreError::ConfigIo {
            path: src.to_path_buf(),
            source,
        })?;
        profile.config_path = source_copy.to_string_lossy().into_owned();

        let conversion_error =
            match convert::convert_file(&source_copy, &run_dir.join(CONVERTED_CONFIG_NAME), start) {
                Ok(conversion) => {
                    profile.config_kind = ConfigKind::ConvertedYaml;
                    profile.listeners = conversion.listeners;
                    None
                }
                Err(e) => {
                    warn!("Importing {:?} as a custom profile: {}", src, e);
                    profile.config_kind = ConfigKind::Custom;
                    profile.listeners = discover_listeners(&source_copy);
                    if let Some(first) = profile.listeners.first() {
                        profile.primary_port = first.port;
                    }
                    Some(e)
                }
            };

        let profile = self.inner.store.upsert(profile);
        info!(
            "Imported {} as {} with {} listener(s)",
            profile.display_name,
            profile.id,
            profile.listeners.len()
        );
        Ok(ImportOutcome {
            profile,
            conversion_error,
        })
    }

    /// Kills engine processes left over in `bin_dir` by a previous run.
    pub fn cleanup_orphans(&self) -> usize {
        let tracked: HashSet<u32> = lock(&self.inner.processes)
            .values()
            .map(|t| t.pid)
            .collect();
        let killed = engine::kill_orphans(&self.inner.settings.bin_dir, &tracked);
        if killed > 0 {
            info!("Killed {} orphan engine process(es)", killed);
        }
        killed
    }
}

fn ensure_port_free(port: u16) -> Result<()> {
    std::net::TcpListener::bind(("127.0.0.1", port))
        .map(drop)
        .map_err(|_| CoreError::PortUnavailable(port))
}

fn discover_listeners(path: &Path) -> Vec<ListenerPort> {
    match fs::read_to_string(path) {
        Ok(text) => convert::discover_ports(&text)
            .iter()
            .map(|p| p.to_listener())
            .collect(),
        Err(e) => {
            debug!("Cannot scan {:?} for ports: {}", path, e);
            vec![]
        }
    }
}

fn terminate_child(child: &mut Child, timeout: Duration) {
    let pid = child.id();
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if engine::signal_term(pid) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Engine {} exited gracefully ({})", pid, status);
                    return;
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(50)),
                Err(_) => break,
            }
        }
    }
    warn!("Engine {} did not exit, forcing kill", pid);
    let _ = child.kill();
    let _ = child.wait();
}
