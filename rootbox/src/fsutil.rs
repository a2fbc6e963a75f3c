//! Small filesystem helpers shared across the lifecycle phases.

use std::fs;
use std::io;
use std::path::Path;

use filetime::FileTime;

/// Create a directory and any missing parents; pre-existence is fine.
pub fn mkdir_if_absent(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Create an empty file if it does not exist; leave an existing one alone.
pub fn touch(path: &Path) -> io::Result<()> {
    fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(())
}

/// Recursively remove a tree; a missing tree is not an error.
pub fn rmtree_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Copy `src` to `dst`, preserving permissions and timestamps.
///
/// `dst` names the target file, not a directory.
pub fn copy_preserving(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst)?;
    let meta = fs::metadata(src)?;
    let atime = FileTime::from_last_access_time(&meta);
    let mtime = FileTime::from_last_modification_time(&meta);
    filetime::set_file_times(dst, atime, mtime)
}
