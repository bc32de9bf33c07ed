//! Supervisor that keeps one OS worker process alive per step.
//!
//! Workers are separate processes so a crash in one step cannot take down
//! another. The manager polls liveness and relaunches any worker that has
//! exited; the message it was handling reappears after its lease expires.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use docpipe_shared::{DocPipeError, Result};
use tracing::{error, info, instrument, warn};

/// Program and leading arguments a worker process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerTarget {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl HandlerTarget {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// `<program> worker`, the entry point of a step worker.
    pub fn worker(program: impl Into<PathBuf>) -> Self {
        Self::new(program, vec!["worker".into()])
    }
}

/// Invocation arguments for the worker of `step`.
pub fn worker_args(step: &str, config_path: Option<&std::path::Path>) -> Vec<String> {
    let mut args = vec!["--step".to_string(), step.to_string()];
    if let Some(path) = config_path {
        args.push("--config".into());
        args.push(path.display().to_string());
    }
    args
}

/// A running worker process.
pub trait ProcessHandle: Send {
    fn name(&self) -> &str;
    fn id(&self) -> Option<u32>;
    fn is_alive(&mut self) -> bool;
    fn terminate(&mut self) -> Result<()>;
}

/// Starts worker processes.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(
        &self,
        name: &str,
        target: &HandlerTarget,
        args: &[String],
    ) -> Result<Box<dyn ProcessHandle>>;
}

// ---------------------------------------------------------------------------
// OS processes
// ---------------------------------------------------------------------------

/// Spawns real child processes via `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessSpawner;

struct OsProcess {
    name: String,
    child: Child,
}

impl ProcessSpawner for OsProcessSpawner {
    fn spawn(
        &self,
        name: &str,
        target: &HandlerTarget,
        args: &[String],
    ) -> Result<Box<dyn ProcessHandle>> {
        let child = Command::new(&target.program)
            .args(&target.args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit()) // worker logs go to the host's stderr
            .spawn()
            .map_err(|e| {
                DocPipeError::process(
                    name,
                    format!("failed to spawn {}: {e}", target.program.display()),
                )
            })?;

        info!(handler = name, pid = child.id(), "worker process started");
        Ok(Box::new(OsProcess {
            name: name.to_string(),
            child,
        }))
    }
}

impl ProcessHandle for OsProcess {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> Option<u32> {
        Some(self.child.id())
    }

    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(handler = %self.name, ?status, "worker process exited");
                false
            }
            // Status unknown: relaunching could leave two live workers.
            Err(e) => {
                warn!(handler = %self.name, "worker wait error, treating as alive: {e}");
                true
            }
        }
    }

    fn terminate(&mut self) -> Result<()> {
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        self.child
            .kill()
            .map_err(|e| DocPipeError::process(&self.name, format!("kill failed: {e}")))?;
        let _ = self.child.wait();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// One supervised worker.
#[derive(Default)]
pub struct HandlerInfo {
    pub handler: Option<String>,
    pub target_function: Option<HandlerTarget>,
    pub args: Option<Vec<String>>,
    pub process: Option<Box<dyn ProcessHandle>>,
    /// Relaunches after the first start.
    pub restarts: u32,
}

impl fmt::Debug for HandlerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerInfo")
            .field("handler", &self.handler)
            .field("target_function", &self.target_function)
            .field("args", &self.args)
            .field("pid", &self.process.as_ref().and_then(|p| p.id()))
            .field("restarts", &self.restarts)
            .finish()
    }
}

pub struct HandlerHostManager {
    pub handlers: Vec<HandlerInfo>,
    spawner: Arc<dyn ProcessSpawner>,
    poll_interval: Duration,
}

impl HandlerHostManager {
    pub fn new(spawner: Arc<dyn ProcessSpawner>, poll_interval: Duration) -> Self {
        Self {
            handlers: Vec::new(),
            spawner,
            poll_interval,
        }
    }

    /// Manager launching genuine OS processes.
    pub fn with_os_processes(poll_interval: Duration) -> Self {
        Self::new(Arc::new(OsProcessSpawner), poll_interval)
    }

    /// Register a worker; it is launched by [`start_all`](Self::start_all).
    pub fn add_handler(&mut self, name: impl Into<String>, target: HandlerTarget, args: Vec<String>) {
        self.handlers.push(HandlerInfo {
            handler: Some(name.into()),
            target_function: Some(target),
            args: Some(args),
            process: None,
            restarts: 0,
        });
    }

    /// Launch a fresh process for `name`. Used for first start and relaunch alike.
    pub fn restart_handler(
        &self,
        name: &str,
        target: &HandlerTarget,
        args: &[String],
    ) -> Result<Box<dyn ProcessHandle>> {
        self.spawner.spawn(name, target, args)
    }

    /// Launch every registered worker that has no process yet.
    pub fn start_all(&mut self) -> Result<()> {
        for index in 0..self.handlers.len() {
            if self.handlers[index].process.is_none() {
                let process = self.spawn_for(index)?;
                self.handlers[index].process = Some(process);
            }
        }
        Ok(())
    }

    fn spawn_for(&self, index: usize) -> Result<Box<dyn ProcessHandle>> {
        let info = &self.handlers[index];
        let name = info.handler.as_deref().unwrap_or("handler");
        let target = info
            .target_function
            .as_ref()
            .ok_or_else(|| DocPipeError::process(name, "no target to launch"))?;
        let args = info.args.as_deref().unwrap_or_default();
        self.restart_handler(name, target, args)
    }

    /// Relaunch every worker whose process is gone. Returns the relaunched names.
    ///
    /// A failed relaunch is logged and retried on the next poll.
    pub fn monitor_once(&mut self) -> Vec<String> {
        let mut restarted = Vec::new();
        for index in 0..self.handlers.len() {
            let alive = self.handlers[index]
                .process
                .as_mut()
                .is_some_and(|p| p.is_alive());
            if alive {
                continue;
            }

            let name = self.handlers[index]
                .handler
                .clone()
                .unwrap_or_else(|| "handler".into());
            match self.spawn_for(index) {
                Ok(process) => {
                    let info = &mut self.handlers[index];
                    info.process = Some(process);
                    info.restarts += 1;
                    warn!(handler = %name, restarts = info.restarts, "worker restarted");
                    restarted.push(name);
                }
                Err(e) => error!(handler = %name, error = %e, "worker restart failed"),
            }
        }
        restarted
    }

    /// Start every worker, then supervise until `shutdown` resolves.
    #[instrument(skip_all, fields(handlers = self.handlers.len()))]
    pub async fn run<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start_all()?;
        info!("supervising workers");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.poll_interval) => {
                    self.monitor_once();
                }
            }
        }

        self.shutdown_all();
        Ok(())
    }

    /// Terminate every live worker.
    pub fn shutdown_all(&mut self) {
        for info in &mut self.handlers {
            if let Some(mut process) = info.process.take() {
                if let Err(e) = process.terminate() {
                    warn!(handler = %process.name(), error = %e, "terminate failed");
                }
            }
        }
        info!("all workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Scripted process whose liveness the test flips.
    struct FakeProcess {
        name: String,
        id: u32,
        alive: Arc<AtomicBool>,
    }

    impl ProcessHandle for FakeProcess {
        fn name(&self) -> &str {
            &self.name
        }
        fn id(&self) -> Option<u32> {
            Some(self.id)
        }
        fn is_alive(&mut self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        fn terminate(&mut self) -> Result<()> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeSpawner {
        next_id: AtomicU32,
        launched: Mutex<Vec<(String, Vec<String>, Arc<AtomicBool>)>>,
    }

    impl ProcessSpawner for FakeSpawner {
        fn spawn(
            &self,
            name: &str,
            target: &HandlerTarget,
            args: &[String],
        ) -> Result<Box<dyn ProcessHandle>> {
            let alive = Arc::new(AtomicBool::new(true));
            let mut argv = target.args.clone();
            argv.extend_from_slice(args);
            self.launched
                .lock()
                .unwrap()
                .push((name.to_string(), argv, alive.clone()));
            Ok(Box::new(FakeProcess {
                name: name.to_string(),
                id: self.next_id.fetch_add(1, Ordering::SeqCst),
                alive,
            }))
        }
    }

    fn manager(spawner: Arc<FakeSpawner>) -> HandlerHostManager {
        let mut manager = HandlerHostManager::new(spawner, Duration::from_millis(5));
        for step in ["extract", "map"] {
            manager.add_handler(
                step,
                HandlerTarget::worker("/usr/bin/docpipe"),
                worker_args(step, None),
            );
        }
        manager
    }

    #[test]
    fn handler_info_defaults_are_empty() {
        let info = HandlerInfo::default();
        assert!(info.handler.is_none());
        assert!(info.target_function.is_none());
        assert!(info.args.is_none());
        assert!(info.process.is_none());
    }

    #[test]
    fn new_manager_has_no_handlers() {
        let manager = HandlerHostManager::new(Arc::new(FakeSpawner::default()), Duration::ZERO);
        assert!(manager.handlers.is_empty());
    }

    #[test]
    fn restart_handler_returns_started_process() {
        let spawner = Arc::new(FakeSpawner::default());
        let manager = manager(spawner.clone());
        let mut process = manager
            .restart_handler(
                "test_handler",
                &HandlerTarget::worker("docpipe"),
                &worker_args("extract", Some(std::path::Path::new("/etc/docpipe.toml"))),
            )
            .unwrap();
        assert_eq!(process.name(), "test_handler");
        assert!(process.is_alive());

        let launched = spawner.launched.lock().unwrap();
        assert_eq!(
            launched[0].1,
            vec!["worker", "--step", "extract", "--config", "/etc/docpipe.toml"]
        );
    }

    #[test]
    fn monitor_restarts_only_dead_workers() {
        let spawner = Arc::new(FakeSpawner::default());
        let mut manager = manager(spawner.clone());
        manager.start_all().unwrap();
        assert_eq!(spawner.launched.lock().unwrap().len(), 2);
        assert!(manager.monitor_once().is_empty());

        // kill the map worker
        spawner.launched.lock().unwrap()[1]
            .2
            .store(false, Ordering::SeqCst);

        assert_eq!(manager.monitor_once(), vec!["map".to_string()]);
        assert_eq!(manager.handlers[1].restarts, 1);
        assert_eq!(manager.handlers[0].restarts, 0);
        assert_eq!(spawner.launched.lock().unwrap().len(), 3);
        assert!(manager.monitor_once().is_empty());
    }

    #[test]
    fn shutdown_terminates_everything() {
        let spawner = Arc::new(FakeSpawner::default());
        let mut manager = manager(spawner.clone());
        manager.start_all().unwrap();
        manager.shutdown_all();

        assert!(manager.handlers.iter().all(|h| h.process.is_none()));
        assert!(
            spawner
                .launched
                .lock()
                .unwrap()
                .iter()
                .all(|(_, _, alive)| !alive.load(Ordering::SeqCst))
        );
    }

    #[tokio::test]
    async fn run_supervises_until_shutdown() {
        let spawner = Arc::new(FakeSpawner::default());
        let mut manager = manager(spawner.clone());

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let killer = spawner.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            killer.launched.lock().unwrap()[0]
                .2
                .store(false, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(());
        });

        manager
            .run(async {
                let _ = rx.await;
            })
            .await
            .unwrap();

        assert!(manager.handlers[0].restarts >= 1);
        assert!(manager.handlers.iter().all(|h| h.process.is_none()));
    }

    #[cfg(unix)]
    fn wait_until_exited(process: &mut dyn ProcessHandle) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while process.is_alive() {
            assert!(std::time::Instant::now() < deadline, "process never exited");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[cfg(unix)]
    #[test]
    fn os_process_exit_is_detected_and_relaunched() {
        let mut manager = HandlerHostManager::with_os_processes(Duration::from_millis(5));
        manager.add_handler(
            "extract",
            HandlerTarget::new("sh", vec!["-c".into(), "exit 1".into()]),
            Vec::new(),
        );
        manager.start_all().unwrap();

        let first_pid = manager.handlers[0].process.as_ref().and_then(|p| p.id());
        assert!(first_pid.is_some());
        wait_until_exited(manager.handlers[0].process.as_deref_mut().unwrap());

        assert_eq!(manager.monitor_once(), vec!["extract".to_string()]);
        assert_eq!(manager.handlers[0].restarts, 1);
        let second_pid = manager.handlers[0].process.as_ref().and_then(|p| p.id());
        assert_ne!(second_pid, first_pid);

        manager.shutdown_all();
        assert!(manager.handlers[0].process.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn os_process_terminate_kills_running_worker() {
        let mut process = OsProcessSpawner
            .spawn(
                "map",
                &HandlerTarget::new("sh", vec!["-c".into(), "sleep 30".into()]),
                &[],
            )
            .unwrap();
        assert!(process.is_alive());

        process.terminate().unwrap();
        assert!(!process.is_alive());
        process.terminate().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn os_process_survives_monitor_while_running() {
        let mut manager = HandlerHostManager::with_os_processes(Duration::from_millis(5));
        manager.add_handler(
            "map",
            HandlerTarget::new("sh", vec!["-c".into(), "sleep 30".into()]),
            Vec::new(),
        );
        manager.start_all().unwrap();

        assert!(manager.monitor_once().is_empty());
        assert_eq!(manager.handlers[0].restarts, 0);

        manager.shutdown_all();
        assert!(manager.handlers[0].process.is_none());
    }

    #[test]
    fn os_spawner_reports_missing_program() {
        let err = OsProcessSpawner
            .spawn(
                "extract",
                &HandlerTarget::worker("/nonexistent/docpipe-worker"),
                &[],
            )
            .err()
            .unwrap();
        assert!(matches!(err, DocPipeError::Process { .. }));
    }
}
