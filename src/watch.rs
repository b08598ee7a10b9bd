use anyhow::{Context, Result};
use log::warn;
use notify::event::ModifyKind;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::time::Duration;

/// Watches a script root and reports which units changed on disk.
pub struct UnitWatcher {
    _watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    root: PathBuf,
    extension: String,
}

impl UnitWatcher {
    pub fn new(root: impl AsRef<Path>, extension: &str, poll_interval: Duration) -> Result<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            anyhow::bail!("script root '{}' is not a directory", root.display());
        }
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })?;
        watcher
            .configure(NotifyConfig::default().with_compare_contents(false).with_poll_interval(poll_interval))
            .context("configure unit watcher")?;
        let root = normalize_watch_path(root);
        watcher.watch(&root, RecursiveMode::Recursive).with_context(|| format!("watch {}", root.display()))?;
        Ok(Self { _watcher: watcher, rx, root, extension: extension.trim_start_matches('.').to_string() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Unit names touched since the last call, deduplicated and sorted.
    pub fn drain_changed_units(&mut self) -> Vec<String> {
        let mut units = BTreeSet::new();
        while let Ok(event) = self.rx.try_recv() {
            match event {
                Ok(event) if is_relevant(&event.kind) => {
                    for path in event.paths {
                        let path = normalize_watch_path(&path);
                        if let Some(unit) = unit_name_for_path(&self.root, &path, &self.extension) {
                            units.insert(unit);
                        }
                    }
                }
                Ok(_) => {}
                Err(err) => warn!("[watch] unit watcher error: {err}"),
            }
        }
        units.into_iter().collect()
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Name(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Create(_)
            | EventKind::Remove(_)
    )
}

/// Maps `root/game/props.rhai` to `game.props`. Paths outside `root` or with another extension map to nothing.
pub fn unit_name_for_path(root: &Path, path: &Path, extension: &str) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    if relative.extension()?.to_str()? != extension.trim_start_matches('.') {
        return None;
    }
    let stem = relative.with_extension("");
    let mut parts = Vec::new();
    for component in stem.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("."))
}

fn normalize_watch_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else if let Ok(cwd) = env::current_dir() {
        cwd.join(path)
    } else {
        path.to_path_buf()
    };
    if let Ok(canonical) = fs::canonicalize(&absolute) {
        return canonical;
    }
    // Removed files cannot be canonicalized; resolve the parent instead.
    match (absolute.parent().map(fs::canonicalize), absolute.file_name()) {
        (Some(Ok(parent)), Some(name)) => parent.join(name),
        _ => absolute,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_script_maps_to_dotted_unit() {
        let root = Path::new("/proj/scripts");
        assert_eq!(
            unit_name_for_path(root, Path::new("/proj/scripts/game/props.rhai"), "rhai").as_deref(),
            Some("game.props")
        );
        assert_eq!(unit_name_for_path(root, Path::new("/proj/scripts/main.rhai"), ".rhai").as_deref(), Some("main"));
    }

    #[test]
    fn foreign_files_are_ignored() {
        let root = Path::new("/proj/scripts");
        assert_eq!(unit_name_for_path(root, Path::new("/proj/scripts/notes.txt"), "rhai"), None);
        assert_eq!(unit_name_for_path(root, Path::new("/elsewhere/main.rhai"), "rhai"), None);
        assert_eq!(unit_name_for_path(root, Path::new("/proj/scripts/game"), "rhai"), None);
    }

    #[test]
    fn watcher_rejects_missing_root() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("nope");
        assert!(UnitWatcher::new(&missing, "rhai", Duration::from_millis(50)).is_err());
    }
}
