use log::{debug, info, warn};
use regex::Regex;
use std::collections::{HashSet, VecDeque};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessStatus, System};

use crate::profile::CoreType;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Executable base names tried for each engine, in preference order.
pub fn candidates(core_type: CoreType) -> &'static [&'static str] {
    match core_type {
        CoreType::V2fly => &["wv2ray", "v2ray"],
        CoreType::Xray => &["xray", "wxray"],
        CoreType::Clash => &[
            "clash-windows-amd64-v3",
            "clash-windows-amd64",
            "clash-windows-386",
            "clash",
        ],
        CoreType::ClashMeta => &[
            "Clash.Meta-windows-amd64-compatible",
            "Clash.Meta-windows-amd64",
            "Clash.Meta-windows-386",
            "Clash.Meta",
            "mihomo-windows-amd64",
            "mihomo",
            "clash",
        ],
        CoreType::Custom => &["xray", "v2ray"],
    }
}

/// First candidate present in `bin_dir`.
pub fn resolve_binary(core_type: CoreType, bin_dir: &Path) -> Option<PathBuf> {
    let found = candidates(core_type)
        .iter()
        .map(|name| bin_dir.join(format!("{}{}", name, std::env::consts::EXE_SUFFIX)))
        .find(|path| path.is_file());
    match &found {
        Some(path) => debug!("Resolved {} engine to {:?}", core_type, path),
        None => debug!("No {} engine in {:?}", core_type, bin_dir),
    }
    found
}

/// Everything needed to launch one engine process.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: PathBuf,
}

/// Clash-family engines take `-f <config> -d <home>`; the rest take `-c <config>`.
pub fn invocation(core_type: CoreType, exe: &Path, config: &Path, home: &Path) -> Invocation {
    let args = if core_type.is_clash_family() {
        vec![
            OsString::from("-f"),
            config.as_os_str().to_owned(),
            OsString::from("-d"),
            home.as_os_str().to_owned(),
        ]
    } else {
        vec![OsString::from("-c"), config.as_os_str().to_owned()]
    };
    let working_dir = exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    Invocation {
        program: exe.to_path_buf(),
        args,
        working_dir,
    }
}

impl Invocation {
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }
        cmd
    }

    /// The command line as it would be typed, for logs.
    pub fn display(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    /// The engine reports a listener bound on this port.
    Listening(u16),
    Fatal,
    /// Shutdown noise that carries no information.
    Ignorable,
    Info,
}

fn clash_listening_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)listening at:?\s*\S*:(\d{1,5})").expect("valid clash listening regex")
    })
}

fn v2ray_listening_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)listening (?:tcp|udp) on \S*:(\d{1,5})")
            .expect("valid v2ray listening regex")
    })
}

fn fatal_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b(fatal|panic)\b|level=(error|fatal)").expect("valid fatal regex")
    })
}

const IGNORABLE_MARKERS: &[&str] = &["bolt.Close()", "use of closed network connection"];

/// Best-effort classification of one engine output line.
pub fn classify_line(core_type: CoreType, line: &str) -> LineKind {
    if IGNORABLE_MARKERS.iter().any(|m| line.contains(m)) {
        return LineKind::Ignorable;
    }
    let listening = if core_type.is_clash_family() {
        clash_listening_re()
    } else {
        v2ray_listening_re()
    };
    if let Some(port) = listening
        .captures(line)
        .and_then(|c| c[1].parse::<u16>().ok())
        .filter(|p| *p != 0)
    {
        return LineKind::Listening(port);
    }
    if fatal_re().is_match(line) {
        return LineKind::Fatal;
    }
    LineKind::Info
}

fn is_alive(sys: &System, pid: Pid) -> bool {
    sys.process(pid)
        .map(|p| p.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}

/// Every live process below `root` in the process tree.
pub fn descendants(root: u32) -> Vec<u32> {
    let mut sys = System::new();
    sys.refresh_processes();

    let mut found = Vec::new();
    let mut seen: HashSet<Pid> = HashSet::new();
    let mut queue = VecDeque::from([Pid::from_u32(root)]);
    while let Some(parent) = queue.pop_front() {
        for (pid, process) in sys.processes() {
            if process.parent() == Some(parent)
                && process.status() != ProcessStatus::Zombie
                && seen.insert(*pid)
            {
                found.push(pid.as_u32());
                queue.push_back(*pid);
            }
        }
    }
    found
}

pub fn is_pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let pid = Pid::from_u32(pid);
    sys.refresh_process(pid);
    is_alive(&sys, pid)
}

/// Asks `pid` to exit. Returns false where there is no polite signal.
pub fn signal_term(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let mut sys = System::new();
        let pid = Pid::from_u32(pid);
        sys.refresh_process(pid);
        sys.process(pid)
            .and_then(|p| p.kill_with(sysinfo::Signal::Term))
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Terminates a process the supervisor did not spawn directly: a polite
/// signal, up to `timeout` to comply, then a hard kill.
pub fn terminate_pid(pid: u32, timeout: Duration) -> bool {
    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_process(target);
    if !is_alive(&sys, target) {
        return true;
    }

    if signal_term(pid) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
            sys.refresh_process(target);
            if !is_alive(&sys, target) {
                debug!("Process {} exited after SIGTERM", pid);
                return true;
            }
        }
    }

    sys.refresh_process(target);
    match sys.process(target) {
        Some(process) if process.status() != ProcessStatus::Zombie => {
            warn!("Process {} did not exit, forcing kill", pid);
            process.kill()
        }
        _ => true,
    }
}

/// Kills leftover engine processes started from `bin_dir` by an earlier run.
pub fn kill_orphans(bin_dir: &Path, exclude: &HashSet<u32>) -> usize {
    let bin_canon = std::fs::canonicalize(bin_dir).unwrap_or_else(|_| bin_dir.to_path_buf());
    let mut sys = System::new();
    sys.refresh_processes();

    let mut killed = 0;
    for process in sys.processes().values() {
        if exclude.contains(&process.pid().as_u32())
            || process.status() == ProcessStatus::Zombie
        {
            continue;
        }
        let in_bin_dir = process
            .exe()
            .map(|e| {
                let exe = std::fs::canonicalize(e).unwrap_or_else(|_| e.to_path_buf());
                exe.parent() == Some(bin_canon.as_path())
            })
            .unwrap_or(false);
        if in_bin_dir {
            info!(
                "Killing orphan engine process (pid: {}, name: {})",
                process.pid(),
                process.name()
            );
            if process.kill_with(sysinfo::Signal::Kill).unwrap_or(false) {
                killed += 1;
            }
        }
    }
    killed
}
