/// Lifecycle of one supervised program: launch (directly or hosted in a
/// terminal), liveness, tree-wide graduated stop, window activation.
use crate::platform::Platform;
use crate::resolve::CommandSpec;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid as NixPid;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::process::Stdio;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tokio::process::{Child, Command};

/// Observable state of a managed program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessState {
    Stopped,
    Running,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "Stopped"),
            ProcessState::Running => write!(f, "Running"),
        }
    }
}

/// Result of a start request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    /// A live process already exists; nothing was spawned.
    AlreadyRunning { pid: u32 },
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The tree is gone. `forced` counts processes that needed SIGKILL.
    Stopped { forced: usize },
    NotRunning,
}

/// How long to wait for SIGTERM to take effect, and how often to look.
#[derive(Debug, Clone, Copy)]
pub struct StopPolicy {
    pub grace_period: Duration,
    pub poll: Duration,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(3),
            poll: Duration::from_millis(50),
        }
    }
}

/// Errors that can occur while launching a program.
#[derive(Debug)]
pub enum LaunchError {
    /// The executable (or interpreter) could not be spawned.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// Terminal hosting was requested but the platform has no terminal.
    TerminalUnavailable { platform: String },
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LaunchError::Spawn { program, source } => {
                write!(f, "failed to start {program}: {source}")
            }
            LaunchError::TerminalUnavailable { platform } => {
                write!(f, "no terminal emulator available on {platform}")
            }
        }
    }
}

impl std::error::Error for LaunchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LaunchError::Spawn { source, .. } => Some(source),
            LaunchError::TerminalUnavailable { .. } => None,
        }
    }
}

/// Owned OS process. Present iff the program is Running.
#[derive(Debug)]
struct Handle {
    child: Child,
    pid: u32,
}

/// One supervised program.
#[derive(Debug)]
pub struct ManagedProcess {
    name: String,
    spec: CommandSpec,
    hosted: bool,
    handle: Option<Handle>,
}

impl ManagedProcess {
    pub fn new(name: impl Into<String>, spec: CommandSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            hosted: false,
            handle: None,
        }
    }

    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Whether the last launch went through a terminal emulator.
    pub fn hosted(&self) -> bool {
        self.hosted
    }

    /// Pid of the owned process (the terminal emulator when hosted).
    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|h| h.pid)
    }

    /// Launch the program with `options` appended, unless it is already
    /// running.
    pub fn start(
        &mut self,
        options: &[String],
        hosted: bool,
        platform: &dyn Platform,
    ) -> Result<StartOutcome, LaunchError> {
        if self.check_status() == ProcessState::Running {
            if let Some(pid) = self.pid() {
                tracing::info!(program = %self.name, pid, "already running");
                return Ok(StartOutcome::AlreadyRunning { pid });
            }
        }

        let argv = self.spec.with_options(options);
        let argv = if hosted {
            platform
                .wrap_in_terminal(&argv)
                .ok_or_else(|| LaunchError::TerminalUnavailable {
                    platform: platform.name().to_string(),
                })?
        } else {
            argv
        };

        tracing::info!(
            program = %self.name,
            command = %shell_words::join(&argv),
            hosted,
            "executing command"
        );

        let Some((program, args)) = argv.split_first() else {
            return Err(LaunchError::Spawn {
                program: self.name.clone(),
                source: std::io::Error::other("empty command"),
            });
        };
        let spawn_error = |source| LaunchError::Spawn {
            program: program.clone(),
            source,
        };

        let mut command = Command::new(program);
        command.args(args).process_group(0); // Own group, away from our terminal's signals
        if !hosted {
            command.stdin(Stdio::null());
        }
        let child = command.spawn().map_err(spawn_error)?;
        let pid = child.id().ok_or_else(|| {
            spawn_error(std::io::Error::other("process exited before reporting a pid"))
        })?;

        tracing::info!(program = %self.name, pid, "process started");
        self.hosted = hosted;
        self.handle = Some(Handle { child, pid });
        Ok(StartOutcome::Started { pid })
    }

    /// Re-derive liveness from the OS. Never blocks.
    pub fn check_status(&mut self) -> ProcessState {
        let Some(handle) = self.handle.as_mut() else {
            return ProcessState::Stopped;
        };

        let alive = match handle.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::info!(program = %self.name, pid = handle.pid, %status, "process exited");
                false
            }
            Err(e) => {
                tracing::debug!(program = %self.name, error = %e, "try_wait failed, probing pid");
                pid_exists(handle.pid)
            }
        };

        if alive {
            ProcessState::Running
        } else {
            self.handle = None;
            ProcessState::Stopped
        }
    }

    /// Terminate the whole process tree: SIGTERM to every descendant, the
    /// root and its process group, wait up to the grace period, SIGKILL
    /// whatever is left.
    ///
    /// The group catches members whose parent already exited, which the
    /// parent-link walk can no longer reach.
    pub async fn stop(&mut self, policy: StopPolicy) -> StopOutcome {
        let Some(mut handle) = self.handle.take() else {
            tracing::info!(program = %self.name, "not running");
            return StopOutcome::NotRunning;
        };
        // Spawned with process_group(0), so the group id is the root pid.
        let pgid = handle.pid;

        let root_exited = matches!(handle.child.try_wait(), Ok(Some(_)));
        if root_exited {
            if !group_exists(pgid) {
                tracing::info!(program = %self.name, "process had already exited");
                return StopOutcome::Stopped { forced: 0 };
            }
            tracing::info!(program = %self.name, pgid, "root exited, stopping leftover group");
        }

        let mut table = ProcessTable::new();
        let mut targets = table.descendants(handle.pid);
        if !root_exited {
            targets.push(handle.pid);
        }
        tracing::debug!(program = %self.name, ?targets, pgid, "terminating process tree");

        for &pid in &targets {
            send_signal(pid, Signal::SIGTERM);
        }
        signal_group(pgid, Signal::SIGTERM);

        let deadline = Instant::now() + policy.grace_period;
        let mut alive = table.alive(&targets);
        let mut group_left = group_exists(pgid);
        while (!alive.is_empty() || group_left) && Instant::now() < deadline {
            tokio::time::sleep(policy.poll).await;
            let _ = handle.child.try_wait();
            alive = table.alive(&alive);
            group_left = group_exists(pgid);
        }

        for &pid in &alive {
            tracing::warn!(program = %self.name, pid, "did not exit after SIGTERM, killing");
            send_signal(pid, Signal::SIGKILL);
        }
        if group_left {
            tracing::warn!(program = %self.name, pgid, "group still populated, killing");
            signal_group(pgid, Signal::SIGKILL);
        }
        let forced = if alive.is_empty() && group_left {
            1
        } else {
            alive.len()
        };

        if root_exited {
            tracing::info!(program = %self.name, forced, "process group stopped");
            return StopOutcome::Stopped { forced };
        }
        match tokio::time::timeout(policy.grace_period.max(Duration::from_secs(1)), handle.child.wait())
            .await
        {
            Ok(Ok(status)) => {
                tracing::info!(program = %self.name, %status, forced, "process stopped")
            }
            Ok(Err(e)) => tracing::warn!(program = %self.name, error = %e, "failed to reap process"),
            Err(_) => tracing::warn!(program = %self.name, "timed out reaping process"),
        }

        StopOutcome::Stopped { forced }
    }

    /// Ask the desktop to raise this program's window. Advisory only.
    pub fn bring_to_front(&mut self, platform: &dyn Platform) {
        if self.check_status() != ProcessState::Running {
            tracing::info!(program = %self.name, "not running");
            return;
        }
        let Some(pid) = self.pid() else { return };
        match platform.activate_window(pid, self.hosted) {
            Ok(()) => tracing::debug!(program = %self.name, pid, "window activated"),
            Err(e) => tracing::debug!(program = %self.name, pid, error = %e, "window activation skipped"),
        }
    }
}

/// Snapshot of the system process table, for tree walks and liveness.
pub struct ProcessTable {
    system: System,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Every live descendant of `root`, parents before children.
    pub fn descendants(&mut self, root: u32) -> Vec<u32> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing(),
        );

        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for (pid, process) in self.system.processes() {
            if process.thread_kind().is_some() {
                continue;
            }
            if let Some(parent) = process.parent() {
                children
                    .entry(parent.as_u32())
                    .or_default()
                    .push(pid.as_u32());
            }
        }

        let mut seen = HashSet::from([root]);
        let mut queue = VecDeque::from([root]);
        let mut out = Vec::new();
        while let Some(pid) = queue.pop_front() {
            for &child in children.get(&pid).into_iter().flatten() {
                if seen.insert(child) {
                    out.push(child);
                    queue.push_back(child);
                }
            }
        }
        out
    }

    /// The subset of `pids` still alive. Zombies count as gone.
    pub fn alive(&mut self, pids: &[u32]) -> Vec<u32> {
        let wanted: Vec<Pid> = pids.iter().map(|&p| Pid::from_u32(p)).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&wanted),
            true,
            ProcessRefreshKind::nothing(),
        );
        pids.iter()
            .copied()
            .filter(|&pid| {
                self.system
                    .process(Pid::from_u32(pid))
                    .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
            })
            .collect()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `pid` names an existing process (signal 0 probe).
pub fn pid_exists(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(NixPid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => true,
    }
}

/// Whether any process (zombies included) still belongs to group `pgid`.
fn group_exists(pgid: u32) -> bool {
    let Ok(raw) = i32::try_from(pgid) else {
        return false;
    };
    if raw <= 1 {
        return false;
    }
    !matches!(killpg(NixPid::from_raw(raw), None), Err(Errno::ESRCH))
}

fn signal_group(pgid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    if raw <= 1 {
        return;
    }
    match killpg(NixPid::from_raw(raw), signal) {
        Ok(()) => {}
        Err(Errno::ESRCH) => tracing::debug!(pgid, %signal, "process group already gone"),
        Err(e) => tracing::warn!(pgid, %signal, error = %e, "failed to signal process group"),
    }
}

fn send_signal(pid: u32, signal: Signal) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw <= 0 {
        return;
    }
    match kill(NixPid::from_raw(raw), signal) {
        Ok(()) => {}
        Err(Errno::ESRCH) => tracing::debug!(pid, %signal, "process already gone"),
        Err(e) => tracing::warn!(pid, %signal, error = %e, "failed to send signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ResolverConfig;
    use crate::platform::{Headless, PlatformError};
    use crate::resolve::PathResolver;

    /// Runs "hosted" commands through `env`, so they behave like direct ones.
    struct EnvTerminal;

    impl Platform for EnvTerminal {
        fn name(&self) -> &str {
            "env-terminal"
        }

        fn activate_window(&self, _pid: u32, _hosted: bool) -> Result<(), PlatformError> {
            Err(PlatformError::Unsupported)
        }

        fn wrap_in_terminal(&self, argv: &[String]) -> Option<Vec<String>> {
            let mut wrapped = vec!["env".to_string()];
            wrapped.extend(argv.iter().cloned());
            Some(wrapped)
        }
    }

    fn managed(command: &str) -> ManagedProcess {
        let resolver = PathResolver::with_cwd("/".into(), ResolverConfig::default());
        ManagedProcess::new(command, resolver.resolve(command).unwrap())
    }

    fn quick_policy() -> StopPolicy {
        StopPolicy {
            grace_period: Duration::from_millis(500),
            poll: Duration::from_millis(20),
        }
    }

    fn opts(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    async fn wait_until_stopped(process: &mut ManagedProcess) -> bool {
        for _ in 0..100 {
            if process.check_status() == ProcessState::Stopped {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_start_then_status_running() {
        let mut p = managed("sleep");
        let outcome = p.start(&opts(&["30"]), false, &Headless).unwrap();
        let StartOutcome::Started { pid } = outcome else {
            panic!("expected Started, got {outcome:?}");
        };
        assert!(pid > 0);
        assert_eq!(p.pid(), Some(pid));
        assert_eq!(p.check_status(), ProcessState::Running);

        p.stop(quick_policy()).await;
    }

    #[tokio::test]
    async fn test_start_twice_keeps_single_process() {
        let mut p = managed("sleep");
        let first = p.start(&opts(&["30"]), false, &Headless).unwrap();
        let StartOutcome::Started { pid } = first else {
            panic!("expected Started");
        };

        let second = p.start(&opts(&["30"]), false, &Headless).unwrap();
        assert_eq!(second, StartOutcome::AlreadyRunning { pid });
        assert_eq!(p.pid(), Some(pid));

        p.stop(quick_policy()).await;
    }

    #[tokio::test]
    async fn test_stop_then_check_status_is_stopped() {
        let mut p = managed("sleep");
        p.start(&opts(&["30"]), false, &Headless).unwrap();
        let pid = p.pid().unwrap();

        let outcome = p.stop(quick_policy()).await;
        assert_eq!(outcome, StopOutcome::Stopped { forced: 0 });
        assert_eq!(p.check_status(), ProcessState::Stopped);
        assert_eq!(p.pid(), None);
        assert!(ProcessTable::new().alive(&[pid]).is_empty());
    }

    #[tokio::test]
    async fn test_stop_when_never_started() {
        let mut p = managed("sleep");
        assert_eq!(p.stop(quick_policy()).await, StopOutcome::NotRunning);
        assert_eq!(p.check_status(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_after_process_exited_on_its_own() {
        let mut p = managed("true");
        p.start(&[], false, &Headless).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = p.stop(quick_policy()).await;
        assert!(matches!(outcome, StopOutcome::Stopped { forced: 0 } | StopOutcome::NotRunning));
        assert_eq!(p.check_status(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_external_death_is_detected() {
        let mut p = managed("sleep");
        p.start(&opts(&["30"]), false, &Headless).unwrap();
        let pid = p.pid().unwrap();

        send_signal(pid, Signal::SIGKILL);
        assert!(wait_until_stopped(&mut p).await);
        assert_eq!(p.pid(), None);
    }

    #[tokio::test]
    async fn test_stop_kills_descendants() {
        let mut p = managed("sh -c 'sleep 60 & sleep 60 & wait'");
        p.start(&[], false, &Headless).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let root = p.pid().unwrap();
        let mut table = ProcessTable::new();
        let mut tree = table.descendants(root);
        assert!(tree.len() >= 2, "expected two sleep children, got {tree:?}");
        tree.push(root);

        p.stop(quick_policy()).await;
        assert_eq!(p.check_status(), ProcessState::Stopped);
        assert!(table.alive(&tree).is_empty());
    }

    #[tokio::test]
    async fn test_stop_force_kills_term_ignoring_tree() {
        // SIG_IGN survives exec, so the sleeps ignore SIGTERM too.
        let mut p = managed("sh -c 'trap \"\" TERM; sleep 60 & sleep 60 & wait'");
        p.start(&[], false, &Headless).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let root = p.pid().unwrap();
        let mut table = ProcessTable::new();
        let mut tree = table.descendants(root);
        tree.push(root);

        let policy = StopPolicy {
            grace_period: Duration::from_millis(300),
            poll: Duration::from_millis(20),
        };
        let StopOutcome::Stopped { forced } = p.stop(policy).await else {
            panic!("expected Stopped");
        };
        assert!(forced >= 1);
        assert_eq!(p.check_status(), ProcessState::Stopped);

        let mut survivors = table.alive(&tree);
        for _ in 0..50 {
            if survivors.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
            survivors = table.alive(&survivors);
        }
        assert!(survivors.is_empty(), "survivors: {survivors:?}");
    }

    /// Read a pid the child wrote to `path`, waiting for it to appear.
    async fn read_pid_file(path: &std::path::Path) -> u32 {
        for _ in 0..100 {
            if let Ok(text) = std::fs::read_to_string(path) {
                if let Ok(pid) = text.trim().parse() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no pid written to {}", path.display());
    }

    async fn wait_until_gone(table: &mut ProcessTable, pid: u32) -> bool {
        for _ in 0..50 {
            if table.alive(&[pid]).is_empty() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_stop_kills_orphaned_group_member() {
        // The subshell exits at once, so its sleep is reparented away from
        // the tree and only reachable through the process group.
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("orphan.pid");
        let script = format!(
            "(sleep 60 & echo $! > '{}'); sleep 60",
            pid_file.display()
        );
        let mut p = managed(&shell_words::join(["sh", "-c", script.as_str()]));
        p.start(&[], false, &Headless).unwrap();
        let orphan = read_pid_file(&pid_file).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut table = ProcessTable::new();
        assert!(!table.descendants(p.pid().unwrap()).contains(&orphan));

        p.stop(quick_policy()).await;
        assert_eq!(p.check_status(), ProcessState::Stopped);
        assert!(wait_until_gone(&mut table, orphan).await, "orphan {orphan} survived");
    }

    #[tokio::test]
    async fn test_stop_after_root_exit_kills_leftover_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("leftover.pid");
        let script = format!("sleep 60 & echo $! > '{}'", pid_file.display());
        let mut p = managed(&shell_words::join(["sh", "-c", script.as_str()]));
        p.start(&[], false, &Headless).unwrap();
        let leftover = read_pid_file(&pid_file).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let outcome = p.stop(quick_policy()).await;
        assert!(matches!(outcome, StopOutcome::Stopped { .. }));
        let mut table = ProcessTable::new();
        assert!(wait_until_gone(&mut table, leftover).await, "leftover {leftover} survived");
    }

    /// Hands the command off and exits, like a terminal launcher talking to
    /// an already-running instance.
    struct DetachingTerminal;

    impl Platform for DetachingTerminal {
        fn name(&self) -> &str {
            "detaching-terminal"
        }

        fn activate_window(&self, _pid: u32, _hosted: bool) -> Result<(), PlatformError> {
            Err(PlatformError::Unsupported)
        }

        fn wrap_in_terminal(&self, _argv: &[String]) -> Option<Vec<String>> {
            Some(vec!["true".to_string()])
        }
    }

    #[tokio::test]
    async fn test_hosted_liveness_follows_terminal_pid() {
        let mut p = managed("sleep");
        p.start(&opts(&["30"]), true, &DetachingTerminal).unwrap();
        assert!(p.hosted());
        // Only the terminal pid is owned: once it exits the program reads
        // as Stopped.
        assert!(wait_until_stopped(&mut p).await);
        assert_eq!(p.stop(quick_policy()).await, StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_launch_failure_leaves_stopped() {
        let mut p = managed("nonexistent-binary-xyz --flag");
        let err = p.start(&[], false, &Headless).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
        assert!(err.to_string().contains("failed to start nonexistent-binary-xyz"));
        assert_eq!(p.pid(), None);
        assert_eq!(p.check_status(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_hosted_without_terminal_is_launch_error() {
        let mut p = managed("sleep");
        let err = p.start(&opts(&["30"]), true, &Headless).unwrap_err();
        assert!(matches!(err, LaunchError::TerminalUnavailable { .. }));
        assert_eq!(p.check_status(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_hosted_launch_goes_through_wrapper() {
        let mut p = managed("sleep");
        p.start(&opts(&["30"]), true, &EnvTerminal).unwrap();
        assert!(p.hosted());
        assert_eq!(p.check_status(), ProcessState::Running);

        // Advisory failure is swallowed.
        p.bring_to_front(&EnvTerminal);

        p.stop(quick_policy()).await;
        assert_eq!(p.check_status(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_stop_spawns_new_process() {
        let mut p = managed("sleep");
        p.start(&opts(&["30"]), false, &Headless).unwrap();
        let first = p.pid().unwrap();
        p.stop(quick_policy()).await;

        let outcome = p.start(&opts(&["30"]), false, &Headless).unwrap();
        assert!(matches!(outcome, StartOutcome::Started { .. }));
        assert_ne!(p.pid(), Some(first));
        p.stop(quick_policy()).await;
    }

    #[test]
    fn test_pid_exists_for_self_and_bogus_pid() {
        assert!(pid_exists(std::process::id()));
        assert!(!pid_exists(u32::MAX));
    }
}
