use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

pub const FILE_MODE: u32 = 0o644;
pub const DIR_MODE: u32 = 0o755;

/// `<path>.tmp.<nanos>.<pid>`, in the same directory so the final rename stays atomic.
pub fn tmp_path_next_to(path: &Path) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".tmp.{nanos}.{}", std::process::id()));
    PathBuf::from(name)
}

/// Writes `bytes` to a sibling temp file and renames it over `path`. The temp file is removed
/// on any failure, so readers only ever see the old or the new content.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    let tmp_path = tmp_path_next_to(path);
    let out = write_file(&tmp_path, bytes, mode).and_then(|()| fs::rename(&tmp_path, path));
    if out.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    out
}

pub fn write_file(path: &Path, bytes: &[u8], mode: u32) -> io::Result<()> {
    {
        let mut file = fs::File::create(path)?;
        file.write_all(bytes)?;
        let _ = file.sync_all();
    }
    chmod(path, mode)
}

pub fn ensure_dir(path: &Path, mode: u32) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path)?;
    chmod(path, mode)
}

#[cfg(unix)]
pub fn chmod(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn chmod(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
