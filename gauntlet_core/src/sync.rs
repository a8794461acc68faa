use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Name of the per-job subtree holding coverage traces.
pub const TRACES_DIR: &str = "traces";

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Job workdir {0:?} has no final path component")]
    NoWorkdirName(PathBuf),
    #[error("I/O error on {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> SyncError + '_ {
    move |source| SyncError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub files: usize,
    pub bytes: u64,
}

/// Removes `path` recursively. A missing path is not an error.
pub fn purge_dir(path: &Path) -> Result<(), SyncError> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path)(e)),
    }
}

pub fn ensure_dir(path: &Path) -> Result<(), SyncError> {
    fs::create_dir_all(path).map_err(io_err(path))
}

/// Copies `<workdir>/traces/**` to `<results>/<workdir name>/traces/**`.
///
/// Everything else in the workdir is ignored and the source is left in
/// place. Directories are only created on the destination side when a file
/// ends up inside them, so a job without traces leaves no trace behind.
pub fn sync_traces(workdir: &Path, results: &Path) -> Result<SyncStats, SyncError> {
    let name = workdir
        .file_name()
        .ok_or_else(|| SyncError::NoWorkdirName(workdir.to_path_buf()))?;
    let src = workdir.join(TRACES_DIR);
    let dst = results.join(name).join(TRACES_DIR);

    let mut stats = SyncStats::default();
    match fs::symlink_metadata(&src) {
        Ok(meta) if meta.is_dir() => copy_tree(&src, &dst, &mut stats)?,
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_err(&src)(e)),
    }
    Ok(stats)
}

fn copy_tree(src: &Path, dst: &Path, stats: &mut SyncStats) -> Result<(), SyncError> {
    let mut entries = fs::read_dir(src)
        .map_err(io_err(src))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err(src))?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type().map_err(io_err(&from))?;
        if file_type.is_dir() {
            copy_tree(&from, &to, stats)?;
        } else if file_type.is_file() {
            ensure_dir(dst)?;
            stats.bytes += fs::copy(&from, &to).map_err(io_err(&from))?;
            stats.files += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populate_workdir(root: &Path) -> PathBuf {
        let workdir = root.join("pngtopng-AFL++-60s-0");
        fs::create_dir_all(workdir.join("traces/afl/queue")).unwrap();
        fs::create_dir_all(workdir.join("traces/empty")).unwrap();
        fs::create_dir_all(workdir.join("queue")).unwrap();
        fs::write(workdir.join("traces/coverage.csv"), "0 10\n60 42\n").unwrap();
        fs::write(workdir.join("traces/afl/queue/id_0"), "1 1\n").unwrap();
        fs::write(workdir.join("queue/id_0"), "seed").unwrap();
        fs::write(workdir.join("stats"), "noise").unwrap();
        workdir
    }

    #[test]
    fn only_the_traces_subtree_is_copied() {
        let dir = TempDir::new().unwrap();
        let workdir = populate_workdir(dir.path());
        let results = dir.path().join("results");

        let stats = sync_traces(&workdir, &results).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.bytes, 11 + 4);

        let job_results = results.join("pngtopng-AFL++-60s-0");
        assert_eq!(
            fs::read_to_string(job_results.join("traces/coverage.csv")).unwrap(),
            "0 10\n60 42\n"
        );
        assert!(job_results.join("traces/afl/queue/id_0").is_file());
        assert!(!job_results.join("queue").exists());
        assert!(!job_results.join("stats").exists());
        assert!(
            !job_results.join("traces/empty").exists(),
            "empty directories should be pruned"
        );
    }

    #[test]
    fn source_is_preserved_and_sync_is_additive() {
        let dir = TempDir::new().unwrap();
        let workdir = populate_workdir(dir.path());
        let results = dir.path().join("results");
        let unrelated = results.join("other-job/traces/keep.csv");
        fs::create_dir_all(unrelated.parent().unwrap()).unwrap();
        fs::write(&unrelated, "1 1\n").unwrap();

        sync_traces(&workdir, &results).unwrap();
        sync_traces(&workdir, &results).unwrap();

        assert!(workdir.join("traces/coverage.csv").is_file());
        assert!(workdir.join("queue/id_0").is_file());
        assert!(unrelated.is_file());
    }

    #[test]
    fn workdir_without_traces_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let workdir = dir.path().join("job");
        fs::create_dir_all(&workdir).unwrap();
        let results = dir.path().join("results");

        assert_eq!(sync_traces(&workdir, &results).unwrap(), SyncStats::default());
        assert!(!results.join("job").exists());
    }

    #[test]
    fn purge_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join("stale");
        fs::create_dir_all(stale.join("nested")).unwrap();
        fs::write(stale.join("nested/file"), "x").unwrap();

        purge_dir(&stale).unwrap();
        assert!(!stale.exists());
        purge_dir(&stale).unwrap();
    }
}
