use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// File-system change under the mirror root, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorEvent {
    Saved(PathBuf),
    Created(PathBuf),
    Deleted(PathBuf),
    Renamed { from: PathBuf, to: PathBuf },
}

pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<MirrorEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for mapped in map_event(event) {
                let _ = tx.send(mapped);
            }
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

pub(crate) fn map_event(event: Event) -> Vec<MirrorEvent> {
    match event.kind {
        EventKind::Modify(ModifyKind::Name(mode)) => map_rename(mode, event.paths),
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Create(_) => event.paths.into_iter().map(MirrorEvent::Created).collect(),
        EventKind::Modify(_) => event.paths.into_iter().map(MirrorEvent::Saved).collect(),
        EventKind::Remove(_) => event.paths.into_iter().map(MirrorEvent::Deleted).collect(),
        _ => Vec::new(),
    }
}

// inotify reports each half of a rename before the paired `Both` event. Only
// the paired event is acted on; an unpaired half is left to reconciliation.
fn map_rename(mode: RenameMode, paths: Vec<PathBuf>) -> Vec<MirrorEvent> {
    match mode {
        RenameMode::From | RenameMode::To => Vec::new(),
        _ => {
            let mut paths = paths.into_iter();
            match (paths.next(), paths.next()) {
                (Some(from), Some(to)) => vec![MirrorEvent::Renamed { from, to }],
                (Some(path), None) if path.exists() => vec![MirrorEvent::Created(path)],
                (Some(path), None) => vec![MirrorEvent::Deleted(path)],
                _ => Vec::new(),
            }
        }
    }
}
