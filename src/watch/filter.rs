// src/watch/filter.rs

//! The per-notification filter pipeline.
//!
//! [`EventFilter`] is synchronous and owns the dedup map outright; the
//! watcher's coordinating loop is its only caller, so the map needs no lock.
//! Stages run in a fixed order:
//!
//! 1. dedup on (path, kind) within the cutoff window
//! 2. suppress flag
//! 3. ignored operation kinds
//! 4. new-directory auto-registration (tree-walk mode)
//! 5. relevance: extension / exclusion (tree-walk) or exact path (file list)

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use notify::EventKind;
use notify::event::ModifyKind;

use crate::errors::Result;
use crate::fs::FileSystem;
use crate::types::OpKind;
use crate::watch::path_utils::{has_extension, relative_parent_str};
use crate::watch::patterns::ExcludeSet;
use crate::watch::register::is_excluded_dir;
use crate::watch::{WatchConfig, WatchError, WatchEvent};

/// Why a notification was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    Suppressed,
    IgnoredKind,
    /// A directory was created inside an excluded subtree (or is excluded
    /// itself), so it is neither registered nor forwarded.
    ExcludedDir,
    Irrelevant,
}

/// Result of running one notification through the pipeline.
#[derive(Debug)]
pub enum Verdict {
    Forward(WatchEvent),
    /// A new directory appeared; register it and swallow the notification.
    RegisterDir(PathBuf),
    Drop(DropReason),
    /// The pipeline could not decide (e.g. stat failed); report and move on.
    Failed(WatchError),
}

#[derive(Debug)]
enum Mode {
    Tree {
        ext: Option<String>,
        exclude: ExcludeSet,
    },
    Files(HashSet<PathBuf>),
}

/// Dedup + relevance state for a single watcher.
#[derive(Debug)]
pub struct EventFilter {
    root: PathBuf,
    mode: Mode,
    ignore: HashSet<OpKind>,
    cutoff: Duration,
    /// Last sighting per (path, kind). Never evicted: grows with the number of
    /// distinct paths touched during the watcher's lifetime.
    seen: HashMap<(PathBuf, OpKind), Instant>,
}

impl EventFilter {
    /// Build a filter for `config`, with `root` already resolved
    /// (canonicalized) by the caller.
    pub fn new(root: PathBuf, config: &WatchConfig) -> Result<Self> {
        let mode = if config.uses_file_list() {
            Mode::Files(config.files.iter().map(|f| root.join(f)).collect())
        } else {
            Mode::Tree {
                ext: config
                    .ext
                    .as_ref()
                    .map(|e| e.trim().trim_start_matches('.').to_string())
                    .filter(|e| !e.is_empty()),
                exclude: ExcludeSet::new(&config.exclude_dirs)?,
            }
        };

        Ok(Self {
            root,
            mode,
            ignore: config.ignore.iter().copied().collect(),
            cutoff: config.event_cutoff,
            seen: HashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Exclusion patterns in tree-walk mode (empty in file-list mode).
    pub fn exclude(&self) -> Option<&ExcludeSet> {
        match &self.mode {
            Mode::Tree { exclude, .. } => Some(exclude),
            Mode::Files(_) => None,
        }
    }

    /// Number of (path, kind) pairs remembered for dedup.
    pub fn dedup_entries(&self) -> usize {
        self.seen.len()
    }

    /// Run one notification through every stage.
    pub fn apply(
        &mut self,
        path: PathBuf,
        op: OpKind,
        now: Instant,
        suppressed: bool,
        fs: &dyn FileSystem,
    ) -> Verdict {
        if self.is_duplicate(&path, op, now) {
            return Verdict::Drop(DropReason::Duplicate);
        }

        if suppressed {
            return Verdict::Drop(DropReason::Suppressed);
        }

        if self.ignore.contains(&op) {
            return Verdict::Drop(DropReason::IgnoredKind);
        }

        match &self.mode {
            Mode::Tree { ext, exclude } => {
                // Directories show up as creates, or as renames when moved
                // in from elsewhere. Symlinked directories are not followed.
                if matches!(op, OpKind::Create | OpKind::Rename) && !fs.is_symlink(&path) {
                    let is_dir = match op {
                        OpKind::Create => fs.stat_is_dir(&path),
                        // The source side of a rename no longer exists.
                        _ => Ok(fs.is_dir(&path)),
                    };
                    match is_dir {
                        Ok(true) => {
                            if is_excluded_dir(&self.root, &path, exclude) {
                                return Verdict::Drop(DropReason::ExcludedDir);
                            }
                            return Verdict::RegisterDir(path);
                        }
                        Ok(false) => {}
                        Err(err) => {
                            return Verdict::Failed(WatchError::Stat {
                                path,
                                message: format!("{err:#}"),
                            });
                        }
                    }
                }

                if in_excluded_dir(&self.root, &path, exclude) {
                    return Verdict::Drop(DropReason::ExcludedDir);
                }

                let relevant = match ext {
                    None => true,
                    Some(ext) => has_extension(&path, ext),
                };
                if relevant {
                    Verdict::Forward(WatchEvent::new(path, op))
                } else {
                    Verdict::Drop(DropReason::Irrelevant)
                }
            }
            Mode::Files(files) => {
                if files.contains(&path) {
                    Verdict::Forward(WatchEvent::new(path, op))
                } else {
                    Verdict::Drop(DropReason::Irrelevant)
                }
            }
        }
    }

    /// Record the sighting and report whether the previous identical one was
    /// inside the cutoff window.
    fn is_duplicate(&mut self, path: &Path, op: OpKind, now: Instant) -> bool {
        let key = (path.to_path_buf(), op);
        let previous = self.seen.insert(key, now);
        match previous {
            Some(prev) => now.saturating_duration_since(prev) < self.cutoff,
            None => false,
        }
    }
}

fn in_excluded_dir(root: &Path, path: &Path, exclude: &ExcludeSet) -> bool {
    if exclude.is_empty() {
        return false;
    }
    match relative_parent_str(root, path) {
        Some(parent) => exclude.is_excluded(&parent),
        None => false,
    }
}

/// Fold a raw `notify` kind into an [`OpKind`].
///
/// Returns `None` for notifications that are not operations on the path
/// (access, "any", "other").
pub fn op_kind(kind: &EventKind) -> Option<OpKind> {
    match kind {
        EventKind::Create(_) => Some(OpKind::Create),
        EventKind::Remove(_) => Some(OpKind::Remove),
        EventKind::Modify(ModifyKind::Name(_)) => Some(OpKind::Rename),
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(OpKind::Chmod),
        EventKind::Modify(_) => Some(OpKind::Write),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use notify::event::{CreateKind, DataChange, MetadataKind, RenameMode};

    fn tree_config(ext: Option<&str>, exclude: &[&str]) -> WatchConfig {
        WatchConfig {
            dir: PathBuf::from("/proj"),
            ext: ext.map(str::to_string),
            exclude_dirs: exclude.iter().map(|s| s.to_string()).collect(),
            ..WatchConfig::default()
        }
    }

    fn tree_filter(ext: Option<&str>, exclude: &[&str]) -> EventFilter {
        EventFilter::new(PathBuf::from("/proj"), &tree_config(ext, exclude)).unwrap()
    }

    fn mock_tree() -> MockFileSystem {
        let fs = MockFileSystem::new();
        fs.add_file("/proj/a.js");
        fs.add_file("/proj/a.go");
        fs.add_file("/proj/tmp1/b.js");
        fs.add_dir("/proj/newdir");
        fs.add_dir("/proj/tmp2");
        fs
    }

    fn forwarded(v: &Verdict) -> bool {
        matches!(v, Verdict::Forward(_))
    }

    #[test]
    fn duplicates_within_cutoff_collapse_to_one() {
        let fs = mock_tree();
        let mut filter = tree_filter(None, &[]);
        let t0 = Instant::now();

        let verdicts: Vec<Verdict> = (0..5)
            .map(|i| {
                filter.apply(
                    PathBuf::from("/proj/a.js"),
                    OpKind::Write,
                    t0 + Duration::from_millis(i),
                    false,
                    &fs,
                )
            })
            .collect();

        assert_eq!(verdicts.iter().filter(|v| forwarded(v)).count(), 1);
        assert!(matches!(verdicts[1], Verdict::Drop(DropReason::Duplicate)));
    }

    #[test]
    fn notifications_beyond_cutoff_all_pass() {
        let fs = mock_tree();
        let mut filter = tree_filter(None, &[]);
        let t0 = Instant::now();

        let passed = (0..4)
            .map(|i| {
                filter.apply(
                    PathBuf::from("/proj/a.js"),
                    OpKind::Write,
                    t0 + Duration::from_millis(20 * i),
                    false,
                    &fs,
                )
            })
            .filter(forwarded)
            .count();

        assert_eq!(passed, 4);
    }

    #[test]
    fn same_path_different_kind_is_not_a_duplicate() {
        let fs = mock_tree();
        let mut filter = tree_filter(None, &[]);
        let t0 = Instant::now();

        let a = filter.apply(PathBuf::from("/proj/a.js"), OpKind::Write, t0, false, &fs);
        let b = filter.apply(PathBuf::from("/proj/a.js"), OpKind::Remove, t0, false, &fs);

        assert!(forwarded(&a));
        assert!(forwarded(&b));
        assert_eq!(filter.dedup_entries(), 2);
    }

    #[test]
    fn extension_filter_only_forwards_matching_files() {
        let fs = mock_tree();
        let mut filter = tree_filter(Some("js"), &[]);
        let now = Instant::now();

        let go = filter.apply(PathBuf::from("/proj/a.go"), OpKind::Write, now, false, &fs);
        let js = filter.apply(PathBuf::from("/proj/a.js"), OpKind::Write, now, false, &fs);

        assert!(matches!(go, Verdict::Drop(DropReason::Irrelevant)));
        match js {
            Verdict::Forward(ev) => {
                assert_eq!(ev.path, PathBuf::from("/proj/a.js"));
                assert_eq!(ev.op, OpKind::Write);
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn suppressed_notifications_are_dropped_but_still_recorded() {
        let fs = mock_tree();
        let mut filter = tree_filter(None, &[]);
        let t0 = Instant::now();

        let during = filter.apply(PathBuf::from("/proj/a.js"), OpKind::Write, t0, true, &fs);
        assert!(matches!(during, Verdict::Drop(DropReason::Suppressed)));

        // Right after clearing, an identical notification inside the window
        // is still a duplicate of the suppressed one.
        let echo = filter.apply(
            PathBuf::from("/proj/a.js"),
            OpKind::Write,
            t0 + Duration::from_millis(1),
            false,
            &fs,
        );
        assert!(matches!(echo, Verdict::Drop(DropReason::Duplicate)));

        let later = filter.apply(
            PathBuf::from("/proj/a.js"),
            OpKind::Write,
            t0 + Duration::from_millis(50),
            false,
            &fs,
        );
        assert!(forwarded(&later));
    }

    #[test]
    fn chmod_is_ignored_by_default() {
        let fs = mock_tree();
        let mut filter = tree_filter(None, &[]);

        let v = filter.apply(
            PathBuf::from("/proj/a.js"),
            OpKind::Chmod,
            Instant::now(),
            false,
            &fs,
        );
        assert!(matches!(v, Verdict::Drop(DropReason::IgnoredKind)));
    }

    #[test]
    fn created_directories_are_registered_not_forwarded() {
        let fs = mock_tree();
        let mut filter = tree_filter(None, &["tmp*"]);
        let now = Instant::now();

        let fresh = filter.apply(PathBuf::from("/proj/newdir"), OpKind::Create, now, false, &fs);
        let excluded = filter.apply(PathBuf::from("/proj/tmp2"), OpKind::Create, now, false, &fs);

        assert!(matches!(fresh, Verdict::RegisterDir(ref p) if p == Path::new("/proj/newdir")));
        assert!(matches!(excluded, Verdict::Drop(DropReason::ExcludedDir)));
    }

    #[test]
    fn directories_renamed_into_the_tree_are_registered() {
        let fs = mock_tree();
        let mut filter = tree_filter(None, &[]);
        let now = Instant::now();

        let moved_in = filter.apply(PathBuf::from("/proj/newdir"), OpKind::Rename, now, false, &fs);
        // The source side no longer exists: an ordinary rename event.
        let moved_out = filter.apply(PathBuf::from("/proj/old"), OpKind::Rename, now, false, &fs);

        assert!(matches!(moved_in, Verdict::RegisterDir(ref p) if p == Path::new("/proj/newdir")));
        assert!(forwarded(&moved_out));
    }

    #[test]
    fn symlinked_directories_are_not_registered() {
        let fs = mock_tree();
        fs.add_symlink("/proj/link", "/proj/newdir");
        let mut filter = tree_filter(None, &[]);

        let now = Instant::now();
        let v = filter.apply(PathBuf::from("/proj/link"), OpKind::Create, now, false, &fs);
        assert!(forwarded(&v));
    }

    #[test]
    fn files_under_excluded_dirs_never_pass() {
        let fs = mock_tree();
        let mut filter = tree_filter(None, &["tmp*"]);

        let v = filter.apply(
            PathBuf::from("/proj/tmp1/b.js"),
            OpKind::Write,
            Instant::now(),
            false,
            &fs,
        );
        assert!(matches!(v, Verdict::Drop(DropReason::ExcludedDir)));
    }

    #[test]
    fn failed_stat_surfaces_as_error() {
        let fs = mock_tree();
        let mut filter = tree_filter(None, &[]);

        let v = filter.apply(
            PathBuf::from("/proj/vanished.js"),
            OpKind::Create,
            Instant::now(),
            false,
            &fs,
        );
        assert!(matches!(v, Verdict::Failed(WatchError::Stat { .. })));
    }

    #[test]
    fn file_list_mode_requires_exact_match() {
        let fs = mock_tree();
        let config = WatchConfig {
            dir: PathBuf::from("/proj"),
            files: vec!["a.js".to_string()],
            ..WatchConfig::default()
        };
        let mut filter = EventFilter::new(PathBuf::from("/proj"), &config).unwrap();
        let now = Instant::now();

        let hit = filter.apply(PathBuf::from("/proj/a.js"), OpKind::Write, now, false, &fs);
        let miss = filter.apply(PathBuf::from("/proj/a.go"), OpKind::Write, now, false, &fs);
        let dir = filter.apply(PathBuf::from("/proj/newdir"), OpKind::Create, now, false, &fs);

        assert!(forwarded(&hit));
        assert!(matches!(miss, Verdict::Drop(DropReason::Irrelevant)));
        assert!(matches!(dir, Verdict::Drop(DropReason::Irrelevant)));
    }

    #[test]
    fn notify_kinds_fold_into_op_kinds() {
        assert_eq!(op_kind(&EventKind::Create(CreateKind::File)), Some(OpKind::Create));
        assert_eq!(
            op_kind(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(OpKind::Write)
        );
        assert_eq!(
            op_kind(&EventKind::Modify(ModifyKind::Name(RenameMode::Both))),
            Some(OpKind::Rename)
        );
        assert_eq!(
            op_kind(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions))),
            Some(OpKind::Chmod)
        );
        assert_eq!(op_kind(&EventKind::Any), None);
    }
}
