//! Filesystem watcher.
//!
//! Converts activity in the configured directory trees into filenames on
//! the scheduler's ingest queue. Every submission passes through a quiet
//! period so writers can finish before the pipeline picks the file up:
//! candidates sit in a due-time queue serviced by the watch loop and are
//! submitted once their quiet period elapses and they still exist as
//! regular files.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossbeam_channel::Sender;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecursiveMode, Watcher as _};
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::WatcherConfig;
use crate::control::{ControlRequest, ShutdownToken, POLL_INTERVAL};

/// Files queued for submission once their quiet period passes.
struct PendingFiles {
    wait: Duration,
    heap: BinaryHeap<Reverse<(Instant, PathBuf)>>,
    queued: HashSet<PathBuf>,
}

impl PendingFiles {
    fn new(wait: Duration) -> PendingFiles {
        PendingFiles {
            wait,
            heap: BinaryHeap::new(),
            queued: HashSet::new(),
        }
    }

    fn push(&mut self, path: PathBuf) {
        if self.queued.insert(path.clone()) {
            self.heap.push(Reverse((Instant::now() + self.wait, path)));
        }
    }

    /// Next file whose due time has passed, if any.
    fn pop_due(&mut self, now: Instant) -> Option<PathBuf> {
        let due = match self.heap.peek() {
            Some(Reverse((due, _))) => *due,
            None => return None,
        };
        if due > now {
            return None;
        }
        let Reverse((_, path)) = self.heap.pop().expect("peeked entry");
        self.queued.remove(&path);
        Some(path)
    }

    /// Bounded wait until the next entry is due.
    fn poll_timeout(&self, now: Instant) -> Duration {
        match self.heap.peek() {
            Some(Reverse((due, _))) => due.saturating_duration_since(now).min(POLL_INTERVAL),
            None => POLL_INTERVAL,
        }
    }
}

fn is_ignored(path: &Path, ignore_dirs: &[String]) -> bool {
    path.components().any(|component| {
        component
            .as_os_str()
            .to_str()
            .map(|name| ignore_dirs.iter().any(|ignored| ignored == name))
            .unwrap_or(false)
    })
}

/// One recursive sweep of a directory, queueing every regular file.
/// Used at startup for the configured roots and again for directories
/// that appear while watching, since files may land in them before the
/// watch attaches.
fn sweep_directory(root: &Path, ignore_dirs: &[String], pending: &mut PendingFiles) {
    let walk = WalkDir::new(root).into_iter().filter_entry(|entry| {
        !(entry.file_type().is_dir() && is_ignored(entry.path(), ignore_dirs))
    });
    for entry in walk {
        match entry {
            Ok(entry) if entry.file_type().is_file() => {
                debug!("queueing existing file <{}>", entry.path().display());
                pending.push(entry.path().to_path_buf());
            }
            Ok(_) => {}
            Err(err) => warn!("error while sweeping <{}>: {err}", root.display()),
        }
    }
}

fn is_eintr(err: &notify::Error) -> bool {
    err.to_string().contains("interrupted system call")
}

/// Run the watcher until shutdown. Fatal conditions are reported on the
/// request channel before returning.
pub fn run(
    config: WatcherConfig,
    ingest_tx: Sender<PathBuf>,
    requests_tx: Sender<ControlRequest>,
    shutdown: ShutdownToken,
) {
    if let Err(err) = watch_loop(&config, &ingest_tx, &shutdown) {
        error!("watcher cannot continue: {err:#}");
        let _ = requests_tx.send(ControlRequest::ThreadCannotContinue);
    }
    info!("watcher finished");
}

fn watch_loop(
    config: &WatcherConfig,
    ingest_tx: &Sender<PathBuf>,
    shutdown: &ShutdownToken,
) -> Result<()> {
    let roots = config.roots();
    if roots.is_empty() {
        anyhow::bail!("no watch directories were specified");
    }
    for root in &roots {
        if !root.is_dir() {
            anyhow::bail!(
                "watch directory does not exist or is not a directory: {}",
                root.display()
            );
        }
    }

    let (events_tx, events_rx) = mpsc::channel();
    let mut watcher =
        notify::recommended_watcher(events_tx).context("creating filesystem watcher")?;
    for root in &roots {
        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("watching {}", root.display()))?;
        info!("now watching <{}>", root.display());
    }

    let mut pending = PendingFiles::new(Duration::from_secs(config.file_wait_time));
    for root in &roots {
        sweep_directory(root, &config.ignore_dirs, &mut pending);
    }

    info!("watcher started successfully; waiting for events");

    loop {
        if shutdown.is_shutdown() {
            info!("watcher stopping on interrupt");
            return Ok(());
        }

        let now = Instant::now();
        while let Some(path) = pending.pop_due(now) {
            if path.is_file() {
                debug!("submitting <{}> to the scheduler", path.display());
                if !submit(ingest_tx, path, shutdown) {
                    // The scheduler is gone; shutdown is already underway.
                    return Ok(());
                }
            }
        }

        match events_rx.recv_timeout(pending.poll_timeout(Instant::now())) {
            Ok(Ok(event)) => handle_event(event, config, &mut pending),
            Ok(Err(err)) => {
                if is_eintr(&err) {
                    debug!("ignoring interrupted system call from the watch");
                } else {
                    return Err(err).context("filesystem watch error");
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                anyhow::bail!("filesystem watch channel closed unexpectedly");
            }
        }
    }
}

/// Send a due file to the scheduler, backing off while its queue is full
/// so shutdown can interrupt the wait. False means stop watching.
fn submit(ingest_tx: &Sender<PathBuf>, path: PathBuf, shutdown: &ShutdownToken) -> bool {
    let mut pending = path;
    loop {
        match ingest_tx.send_timeout(pending, POLL_INTERVAL) {
            Ok(()) => return true,
            Err(crossbeam_channel::SendTimeoutError::Timeout(path)) => {
                if shutdown.is_shutdown() {
                    return false;
                }
                pending = path;
            }
            Err(crossbeam_channel::SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

fn handle_event(event: Event, config: &WatcherConfig, pending: &mut PendingFiles) {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both))
            | EventKind::Any
    );
    if !relevant {
        return;
    }
    for path in event.paths {
        if is_ignored(&path, &config.ignore_dirs) {
            continue;
        }
        if path.is_dir() {
            // The recursive watch already covers the new directory; the
            // sweep catches files created before the watch attached.
            debug!("new directory <{}>; sweeping it", path.display());
            sweep_directory(&path, &config.ignore_dirs, pending);
        } else if path.is_file() {
            debug!("queueing <{}> after filesystem event", path.display());
            pending.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use std::thread;

    fn watcher_config(root: &Path, wait: u64) -> WatcherConfig {
        WatcherConfig {
            active: true,
            dir: Some(root.to_path_buf()),
            dirs: Vec::new(),
            ignore_dirs: vec!["skipme".to_string()],
            file_wait_time: wait,
        }
    }

    #[test]
    fn pending_files_respect_the_quiet_period() {
        let mut pending = PendingFiles::new(Duration::from_secs(60));
        pending.push(PathBuf::from("/a"));
        assert!(pending.pop_due(Instant::now()).is_none());
        assert!(pending
            .pop_due(Instant::now() + Duration::from_secs(61))
            .is_some());
    }

    #[test]
    fn pending_files_deduplicate_until_submitted() {
        let mut pending = PendingFiles::new(Duration::from_millis(0));
        pending.push(PathBuf::from("/a"));
        pending.push(PathBuf::from("/a"));
        let later = Instant::now() + Duration::from_millis(1);
        assert!(pending.pop_due(later).is_some());
        assert!(pending.pop_due(later).is_none());
        pending.push(PathBuf::from("/a"));
        assert!(pending.pop_due(Instant::now() + Duration::from_millis(1)).is_some());
    }

    #[test]
    fn ignored_directory_names_match_any_component() {
        let ignore = vec!["skipme".to_string()];
        assert!(is_ignored(Path::new("/data/skipme/x.dat"), &ignore));
        assert!(!is_ignored(Path::new("/data/keep/x.dat"), &ignore));
    }

    #[test]
    fn sweep_queues_existing_files_and_prunes_ignored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("run1")).unwrap();
        std::fs::create_dir_all(dir.path().join("skipme")).unwrap();
        std::fs::write(dir.path().join("run1/a.dat"), "abc").unwrap();
        std::fs::write(dir.path().join("skipme/b.dat"), "abc").unwrap();

        let mut pending = PendingFiles::new(Duration::from_millis(0));
        sweep_directory(dir.path(), &["skipme".to_string()], &mut pending);
        let later = Instant::now() + Duration::from_millis(1);
        let submitted = pending.pop_due(later).unwrap();
        assert!(submitted.ends_with("run1/a.dat"));
        assert!(pending.pop_due(later).is_none());
    }

    #[test]
    fn missing_root_is_fatal() {
        let (ingest_tx, _ingest_rx) = unbounded();
        let (requests_tx, requests_rx) = unbounded();
        let config = watcher_config(Path::new("/no/such/dir"), 0);
        run(config, ingest_tx, requests_tx, ShutdownToken::new());
        assert_eq!(
            requests_rx.try_recv().unwrap(),
            ControlRequest::ThreadCannotContinue
        );
    }

    #[test]
    fn live_events_reach_the_ingest_queue() {
        let dir = tempfile::tempdir().unwrap();
        let (ingest_tx, ingest_rx) = unbounded();
        let (requests_tx, _requests_rx) = unbounded();
        let shutdown = ShutdownToken::new();
        let config = watcher_config(dir.path(), 0);
        let watcher_shutdown = shutdown.clone();
        let handle = thread::spawn(move || run(config, ingest_tx, requests_tx, watcher_shutdown));

        // Give the watch a moment to attach, then drop a file into a new
        // subdirectory.
        thread::sleep(Duration::from_millis(300));
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("x.dat"), "abc").unwrap();

        let submitted = ingest_rx
            .recv_timeout(Duration::from_secs(10))
            .expect("file should be submitted");
        assert!(submitted.ends_with("sub/x.dat"));

        shutdown.shutdown();
        handle.join().unwrap();
    }
}
