// src/watch/register.rs

//! Enumerating which directories a watcher registers with `notify`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::fs::FileSystem;
use crate::watch::path_utils::relative_str;
use crate::watch::patterns::ExcludeSet;

/// Collect `start` and every directory below it, skipping excluded subtrees.
/// Symbolic links are never followed.
///
/// Exclusion is evaluated on the path relative to `root`, so the same
/// patterns apply at startup (`start == root`) and when a directory created
/// later is registered (`start` somewhere below `root`).
pub fn collect_watch_dirs(
    fs: &dyn FileSystem,
    root: &Path,
    start: &Path,
    exclude: &ExcludeSet,
) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    let mut stack = vec![start.to_path_buf()];

    while let Some(dir) = stack.pop() {
        if is_excluded_dir(root, &dir, exclude) {
            continue;
        }

        for path in fs.read_dir(&dir)? {
            if fs.is_dir(&path) && !fs.is_symlink(&path) {
                stack.push(path);
            }
        }
        dirs.push(dir);
    }

    Ok(dirs)
}

/// Parent directories of an explicit file list, de-duplicated, in order.
pub fn file_list_dirs(root: &Path, files: &[String]) -> Vec<PathBuf> {
    let mut seen = HashSet::new();
    let mut dirs = Vec::new();

    for file in files {
        let path = root.join(file);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());
        if seen.insert(dir.clone()) {
            dirs.push(dir);
        }
    }

    dirs
}

/// Whether `dir` (somewhere under `root`) falls inside an excluded subtree.
pub fn is_excluded_dir(root: &Path, dir: &Path, exclude: &ExcludeSet) -> bool {
    if exclude.is_empty() {
        return false;
    }
    match relative_str(root, dir) {
        Some(rel) => exclude.is_excluded(&rel),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;

    fn sorted(mut v: Vec<PathBuf>) -> Vec<PathBuf> {
        v.sort();
        v
    }

    #[test]
    fn walks_all_subdirectories() {
        let fs = MockFileSystem::new();
        fs.add_file("./src/a.js");
        fs.add_file("./src/lib/b.js");
        fs.add_dir("./docs");

        let dirs = collect_watch_dirs(&fs, Path::new("."), Path::new("."), &ExcludeSet::empty())
            .unwrap();

        assert_eq!(
            sorted(dirs),
            vec![
                PathBuf::from("."),
                PathBuf::from("./docs"),
                PathBuf::from("./src"),
                PathBuf::from("./src/lib"),
            ]
        );
    }

    #[test]
    fn excluded_subtrees_are_skipped() {
        let fs = MockFileSystem::new();
        fs.add_file("./src/a.js");
        fs.add_file("./tmp1/x.js");
        fs.add_file("./tmpfoo/deep/y.js");
        fs.add_file("./node_modules/pkg/index.js");

        let exclude =
            ExcludeSet::new(&["tmp*".to_string(), "node_modules".to_string()]).unwrap();
        let dirs = collect_watch_dirs(&fs, Path::new("."), Path::new("."), &exclude).unwrap();

        assert_eq!(
            sorted(dirs),
            vec![PathBuf::from("."), PathBuf::from("./src")]
        );
    }

    #[test]
    fn symlinked_directories_are_not_walked() {
        let fs = MockFileSystem::new();
        fs.add_file("./a/x.js");
        fs.add_dir("./elsewhere/deep");
        fs.add_symlink("./a/up", ".");
        fs.add_symlink("./b", "./elsewhere");

        let dirs = collect_watch_dirs(&fs, Path::new("."), Path::new("."), &ExcludeSet::empty())
            .unwrap();

        assert_eq!(
            sorted(dirs),
            vec![
                PathBuf::from("."),
                PathBuf::from("./a"),
                PathBuf::from("./elsewhere"),
                PathBuf::from("./elsewhere/deep"),
            ]
        );
    }

    #[test]
    fn file_list_registers_each_parent_once() {
        let dirs = file_list_dirs(
            Path::new("/proj"),
            &[
                "foo/index.js".to_string(),
                "bar/main.js".to_string(),
                "foo/other.js".to_string(),
                "top.js".to_string(),
            ],
        );

        assert_eq!(
            dirs,
            vec![
                PathBuf::from("/proj/foo"),
                PathBuf::from("/proj/bar"),
                PathBuf::from("/proj"),
            ]
        );
    }
}
