//! Best-effort disk space reclamation before large downloads or builds.
//!
//! Purges pip's download cache, then empties, removes and recreates each
//! configured temporary directory with its original permissions. Nothing in
//! here can fail the run: every error is logged and skipped, and deletion
//! keeps going past entries it cannot remove. Symlinked directories are
//! never touched.

use crate::command::CommandRunner;
use crate::error::InstallerError;
use crate::pip::{pip_command, PipCachePurgeArgs};
use crate::report::Reporter;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What a cleaning pass managed to do
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanSummary {
    pub pip_cache_purged: bool,
    /// Directories that were emptied, removed and recreated
    pub recreated: Vec<PathBuf>,
    /// Directories kept in place: symlinks, or some entries could not be removed
    pub skipped: Vec<PathBuf>,
    /// Entries that could not be deleted across all directories
    pub left_behind: usize,
}

pub struct CacheCleaner<'a, R: CommandRunner> {
    runner: &'a R,
    python: String,
    dirs: Vec<PathBuf>,
}

impl<'a, R: CommandRunner> CacheCleaner<'a, R> {
    pub fn new(runner: &'a R, python: &str, dirs: Vec<PathBuf>) -> Self {
        Self {
            runner,
            python: python.to_string(),
            dirs,
        }
    }

    /// Run one cleaning pass.
    ///
    /// Only an interrupt is returned as an error.
    pub fn clean(&self, reporter: &mut Reporter) -> Result<CleanSummary, InstallerError> {
        reporter.info("Cleaning pip cache...");
        let mut summary = CleanSummary::default();

        match self.runner.capture(&pip_command(&self.python, &PipCachePurgeArgs)) {
            Ok(output) if output.success() => summary.pip_cache_purged = true,
            Ok(output) => debug!("pip cache purge failed ({}): {}", output.status, output.stderr),
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) => warn!("pip cache purge could not run: {}", e),
        }

        for dir in &self.dirs {
            let Ok(meta) = fs::symlink_metadata(dir) else {
                continue;
            };
            // Neither the link nor its target is touched
            if meta.file_type().is_symlink() || !meta.is_dir() {
                debug!("Not cleaning {}: not a real directory", dir.display());
                summary.skipped.push(dir.clone());
                continue;
            }
            match recreate_dir(dir, meta.permissions()) {
                Ok(0) => summary.recreated.push(dir.clone()),
                Ok(left) => {
                    debug!("{} entries left behind in {}", left, dir.display());
                    summary.left_behind += left;
                    summary.skipped.push(dir.clone());
                }
                Err(e) => {
                    debug!("Could not recreate {}: {}", dir.display(), e);
                    summary.skipped.push(dir.clone());
                }
            }
        }

        reporter.success("Cache cleanup finished");
        Ok(summary)
    }
}

/// Empty `dir`, then remove it and create it again with the same mode
///
/// Returns how many entries could not be deleted. The directory itself is
/// only recreated when it was emptied completely.
fn recreate_dir(dir: &Path, permissions: fs::Permissions) -> io::Result<usize> {
    let left = empty_dir(dir, &mut remove_entry)?;
    if left > 0 {
        return Ok(left);
    }
    // An empty dir we may not remove (e.g. a root-owned /tmp) is as good as recreated
    if let Err(e) = fs::remove_dir(dir) {
        debug!("Keeping emptied {}: {}", dir.display(), e);
        return Ok(0);
    }
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, permissions)?;
    Ok(0)
}

/// Delete everything below `dir`, carrying on past entries that fail
///
/// Subdirectories are emptied before they are removed, so one stuck file only
/// pins its own ancestors. Symlinks are removed, never followed.
fn empty_dir<F>(dir: &Path, remove: &mut F) -> io::Result<usize>
where
    F: FnMut(&Path, bool) -> io::Result<()>,
{
    let mut left = 0;
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!("Unreadable entry in {}: {}", dir.display(), e);
                left += 1;
                continue;
            }
        };
        let path = entry.path();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);

        if is_dir {
            match empty_dir(&path, remove) {
                Ok(0) => {}
                Ok(n) => {
                    left += n + 1;
                    continue;
                }
                Err(e) => {
                    debug!("Cannot list {}: {}", path.display(), e);
                    left += 1;
                    continue;
                }
            }
        }
        if let Err(e) = remove(&path, is_dir) {
            debug!("Cannot remove {}: {}", path.display(), e);
            left += 1;
        }
    }
    Ok(left)
}

fn remove_entry(path: &Path, is_dir: bool) -> io::Result<()> {
    if is_dir {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    }
}
