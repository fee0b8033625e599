use std::{
    fs, io,
    path::{Path, PathBuf},
};

use crate::{
    domain::Server,
    fs_atomic::{DIR_MODE, FILE_MODE, ensure_dir, write_atomic},
};

pub const SNAPSHOT_FILE_NAME: &str = "servers.json";

#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    SerdeJson(serde_json::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::SerdeJson(e) => write!(f, "json error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::SerdeJson(e) => Some(e),
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::SerdeJson(value)
    }
}

/// On-disk copy of the last server list that was fetched and parsed successfully.
#[derive(Debug, Clone)]
pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn in_dir(cache_dir: &Path) -> Self {
        Self::new(cache_dir.join(SNAPSHOT_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when no snapshot has been written yet.
    pub fn load(&self) -> Result<Option<Vec<Server>>, StoreError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let servers: Vec<Server> = serde_json::from_slice(&bytes)?;
        Ok(Some(servers))
    }

    pub fn save(&self, servers: &[Server]) -> Result<(), StoreError> {
        if let Some(dir) = self.path.parent() {
            ensure_dir(dir, DIR_MODE)?;
        }
        let mut bytes = serde_json::to_vec_pretty(servers)?;
        bytes.push(b'\n');
        write_atomic(&self.path, &bytes, FILE_MODE)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::descriptor::Descriptor;

    #[test]
    fn missing_snapshot_loads_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::in_dir(tmp.path());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn save_load_roundtrip_preserves_server_fields() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::in_dir(&tmp.path().join("cache"));

        let raw = "vless://ec82bca8-1072-4682-822f-30306af408ea@1.2.3.4:443?type=tcp&security=reality&sni=outlook.office.com&pbk=K&sid=S&fp=chrome&flow=xtls-rprx-vision#NL";
        let servers = vec![Descriptor::parse(raw).unwrap().to_server(raw)];
        store.save(&servers).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, servers);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let file_mode = fs::metadata(store.path()).unwrap().permissions().mode() & 0o777;
            assert_eq!(file_mode, 0o644);
            let dir_mode = fs::metadata(tmp.path().join("cache"))
                .unwrap()
                .permissions()
                .mode()
                & 0o777;
            assert_eq!(dir_mode, 0o755);
        }
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonSnapshotStore::in_dir(tmp.path());
        fs::write(store.path(), b"{not json").unwrap();
        assert!(matches!(store.load(), Err(StoreError::SerdeJson(_))));
    }
}
