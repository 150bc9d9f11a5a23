use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use crate::router::changed_filenames;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// A debounced change to a governed file.
#[derive(Debug, Clone)]
pub struct WatcherEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
}

/// The kind of file change detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// Watches data folders for changes to files with governed extensions.
/// Debounced events are sent through an mpsc channel to the sync loop.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    /// Handle to the background thread processing events
    _thread: std::thread::JoinHandle<()>,
    /// Receiver for debounced file change events
    pub event_rx: mpsc::Receiver<WatcherEvent>,
}

impl FileWatcher {
    /// Start watching `dirs` (non-recursively) for files whose extension is
    /// one of `extensions`. Debounced events (100ms) are available via
    /// `event_rx`. Missing folders are skipped with a warning.
    pub fn start(dirs: &[PathBuf], extensions: &[String]) -> Result<Self, notify::Error> {
        let (notify_tx, notify_rx) = mpsc::channel::<notify::Result<Event>>();
        let (event_tx, event_rx) = mpsc::channel::<WatcherEvent>();

        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = notify_tx.send(res);
            },
            Config::default(),
        )?;

        for dir in dirs {
            if dir.exists() {
                watcher.watch(dir, RecursiveMode::NonRecursive)?;
                log::debug!("Watching {}", dir.display());
            } else {
                log::warn!("Folder {} does not exist, not watching it", dir.display());
            }
        }

        let extensions: Vec<String> = extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();

        let thread = std::thread::spawn(move || {
            let debounce = Duration::from_millis(100);
            let mut pending: Vec<(PathBuf, ChangeKind)> = Vec::new();
            let mut last_event = Instant::now();

            loop {
                match notify_rx.recv_timeout(debounce) {
                    Ok(Ok(event)) => {
                        let kind = match event.kind {
                            EventKind::Create(_) => Some(ChangeKind::Created),
                            EventKind::Modify(_) => Some(ChangeKind::Modified),
                            EventKind::Remove(_) => Some(ChangeKind::Deleted),
                            _ => None,
                        };

                        if let Some(kind) = kind {
                            for path in event.paths {
                                if has_extension(&path, &extensions) {
                                    pending.push((path, kind));
                                }
                            }
                        }
                        last_event = Instant::now();
                    }
                    Ok(Err(e)) => {
                        log::warn!("File watcher error: {e}");
                    }
                    Err(mpsc::RecvTimeoutError::Timeout) => {
                        if !pending.is_empty() && last_event.elapsed() >= debounce {
                            // Keep the last change kind per path
                            let mut seen = HashMap::new();
                            for (path, kind) in pending.drain(..) {
                                seen.insert(path, kind);
                            }
                            for (path, kind) in seen {
                                if event_tx.send(WatcherEvent { path, kind }).is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        Ok(FileWatcher {
            _watcher: watcher,
            _thread: thread,
            event_rx,
        })
    }
}

/// Changed paths waiting for the next pass. Events arriving while a pass
/// runs collapse into one batch.
#[derive(Debug, Default)]
pub struct PendingChanges {
    paths: Vec<PathBuf>,
}

impl PendingChanges {
    /// Record an event. Deletions are ignored: a missing file has nothing to
    /// propagate.
    pub fn push(&mut self, event: &WatcherEvent) {
        if event.kind == ChangeKind::Deleted {
            return;
        }
        self.paths.push(event.path.clone());
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Take every pending file name, sorted and deduplicated, leaving the
    /// batch empty.
    pub fn drain(&mut self) -> Vec<String> {
        changed_filenames(&std::mem::take(&mut self.paths))
    }
}

/// Whether `path` has one of `extensions` (lower-case, without the dot).
fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}
