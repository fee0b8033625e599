use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    domain::Server,
    fs_atomic::{FILE_MODE, write_atomic},
    xray::{
        config_file::{ConfigFileError, OutboundEntry, ReplaceOutcome, XrayConfigFile},
        restart::{RestartError, Restarter},
    },
};

type ConfigWriter = fn(&Path, &[u8], u32) -> io::Result<()>;

const BACKUP_INFIX: &str = ".backup.";
const BACKUP_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

#[derive(Debug)]
pub enum SwitchError {
    Backup {
        path: PathBuf,
        source: io::Error,
    },
    Config(ConfigFileError),
    Write {
        path: PathBuf,
        source: io::Error,
    },
    RestartFailed(RestartError),
    RestartRetryFailed {
        first: RestartError,
        retry: RestartError,
    },
    Restore {
        backup: PathBuf,
        source: io::Error,
    },
    RestoreFailed {
        primary: Box<SwitchError>,
        restore: Box<SwitchError>,
    },
    NoBackup {
        config_path: PathBuf,
    },
}

impl std::fmt::Display for SwitchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backup { path, source } => write!(f, "backup {}: {source}", path.display()),
            Self::Config(e) => write!(f, "{e}"),
            Self::Write { path, source } => write!(f, "write {}: {source}", path.display()),
            Self::RestartFailed(e) => {
                write!(f, "restart failed, previous config restored: {e}")
            }
            Self::RestartRetryFailed { first, retry } => write!(
                f,
                "restart failed ({first}); previous config restored but restart failed again ({retry})"
            ),
            Self::Restore { backup, source } => {
                write!(f, "restore from {}: {source}", backup.display())
            }
            Self::RestoreFailed { primary, restore } => match primary.as_ref() {
                Self::RestartFailed(e) => {
                    write!(f, "restart failed ({e}); rollback also failed: {restore}")
                }
                primary => write!(f, "{primary}; rollback also failed: {restore}"),
            },
            Self::NoBackup { config_path } => {
                write!(f, "no backups found for {}", config_path.display())
            }
        }
    }
}

impl std::error::Error for SwitchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Backup { source, .. } => Some(source),
            Self::Config(e) => Some(e),
            Self::Write { source, .. } => Some(source),
            Self::RestartFailed(e) => Some(e),
            Self::RestartRetryFailed { retry, .. } => Some(retry),
            Self::Restore { source, .. } => Some(source),
            Self::RestoreFailed { primary, .. } => Some(primary.as_ref()),
            Self::NoBackup { .. } => None,
        }
    }
}

impl From<ConfigFileError> for SwitchError {
    fn from(value: ConfigFileError) -> Self {
        Self::Config(value)
    }
}

/// Owns the daemon config file. Every mutating operation is serialized by one mutex, so a
/// backup, rewrite and restart never interleave with another switch.
pub struct XrayConfigSwitcher {
    config_path: PathBuf,
    restarter: Arc<dyn Restarter>,
    write_config: ConfigWriter,
    lock: Mutex<()>,
}

impl XrayConfigSwitcher {
    pub fn new(config_path: PathBuf, restarter: Arc<dyn Restarter>) -> Self {
        Self {
            config_path,
            restarter,
            write_config: write_atomic,
            lock: Mutex::new(()),
        }
    }

    /// Swaps the writer used for the outbound rewrite. Restores always use [`write_atomic`].
    #[cfg(test)]
    fn with_config_writer(mut self, write_config: ConfigWriter) -> Self {
        self.write_config = write_config;
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub async fn get_current_config(&self) -> Result<XrayConfigFile, SwitchError> {
        let _guard = self.lock.lock().await;
        Ok(XrayConfigFile::read(&self.config_path)?)
    }

    /// Copies the live config to `<config>.backup.<yyyymmdd-hhmmss>.<pid>` (UTC).
    pub async fn backup(&self) -> Result<PathBuf, SwitchError> {
        let _guard = self.lock.lock().await;
        self.backup_locked()
    }

    /// Restores the newest backup by modification time. Does not restart the daemon.
    pub async fn restore(&self) -> Result<PathBuf, SwitchError> {
        let _guard = self.lock.lock().await;
        let newest = self
            .list_backups_locked()?
            .into_iter()
            .next()
            .ok_or_else(|| SwitchError::NoBackup {
                config_path: self.config_path.clone(),
            })?;
        self.restore_from_locked(&newest)?;
        Ok(newest)
    }

    pub async fn restore_from(&self, backup: &Path) -> Result<(), SwitchError> {
        let _guard = self.lock.lock().await;
        self.restore_from_locked(backup)
    }

    /// Backups of this config, newest first.
    pub async fn list_backups(&self) -> Result<Vec<PathBuf>, SwitchError> {
        let _guard = self.lock.lock().await;
        self.list_backups_locked()
    }

    pub async fn restart(&self) -> Result<(), RestartError> {
        let _guard = self.lock.lock().await;
        self.restarter.restart().await
    }

    /// Backs up, then rewrites the first proxy outbound. The daemon is not restarted.
    pub async fn replace_outbound(&self, server: &Server) -> Result<ReplaceOutcome, SwitchError> {
        let _guard = self.lock.lock().await;
        let backup = self.backup_locked()?;
        self.apply_locked(server, &backup)
    }

    /// Points the daemon at `server` and restarts it.
    ///
    /// Any failure after the backup leaves the config as it was on entry: the backup is
    /// restored, and when the restart was what failed the daemon is restarted once more on the
    /// old config. A successful retry still reports [`SwitchError::RestartFailed`].
    pub async fn update_and_restart(&self, server: &Server) -> Result<(), SwitchError> {
        let _guard = self.lock.lock().await;
        let backup = self.backup_locked()?;
        self.apply_locked(server, &backup)?;

        let first = match self.restarter.restart().await {
            Ok(()) => {
                info!(server_id = %server.id, restarter = self.restarter.name(), "daemon restarted");
                return Ok(());
            }
            Err(err) => err,
        };

        warn!(server_id = %server.id, error = %first, "restart failed, restoring previous config");
        if let Err(restore) = self.restore_from_locked(&backup) {
            return Err(SwitchError::RestoreFailed {
                primary: Box::new(SwitchError::RestartFailed(first)),
                restore: Box::new(restore),
            });
        }

        match self.restarter.restart().await {
            Ok(()) => {
                warn!("daemon restarted on the previous config");
                Err(SwitchError::RestartFailed(first))
            }
            Err(retry) => {
                warn!(error = %retry, "restart on the previous config failed too");
                Err(SwitchError::RestartRetryFailed { first, retry })
            }
        }
    }

    fn backup_locked(&self) -> Result<PathBuf, SwitchError> {
        let bytes = fs::read(&self.config_path).map_err(|source| SwitchError::Backup {
            path: self.config_path.clone(),
            source,
        })?;
        let path = self.backup_path();
        write_atomic(&path, &bytes, FILE_MODE).map_err(|source| SwitchError::Backup {
            path: path.clone(),
            source,
        })?;
        info!(backup = %path.display(), "config backed up");
        Ok(path)
    }

    fn backup_path(&self) -> PathBuf {
        let mut name = self.config_path.as_os_str().to_os_string();
        name.push(format!(
            "{BACKUP_INFIX}{}.{}",
            Utc::now().format(BACKUP_TIMESTAMP_FORMAT),
            std::process::id()
        ));
        PathBuf::from(name)
    }

    /// Load, replace, write. A load failure touched nothing; later failures restore `backup`.
    fn apply_locked(&self, server: &Server, backup: &Path) -> Result<ReplaceOutcome, SwitchError> {
        let mut config = XrayConfigFile::read(&self.config_path)?;

        let written = OutboundEntry::from_server(server)
            .and_then(|outbound| {
                let outcome = config.replace_outbound(&outbound)?;
                Ok((outcome, config.to_pretty_bytes()?))
            })
            .map_err(SwitchError::from)
            .and_then(|(outcome, bytes)| {
                (self.write_config)(&self.config_path, &bytes, FILE_MODE)
                    .map(|()| outcome)
                    .map_err(|source| SwitchError::Write {
                        path: self.config_path.clone(),
                        source,
                    })
            });

        match written {
            Ok(outcome) => {
                info!(server_id = %server.id, tag = %server.tag, ?outcome, "outbound replaced");
                Ok(outcome)
            }
            Err(err) => {
                warn!(server_id = %server.id, error = %err, "switch failed, restoring backup");
                match self.restore_from_locked(backup) {
                    Ok(()) => Err(err),
                    Err(restore) => Err(SwitchError::RestoreFailed {
                        primary: Box::new(err),
                        restore: Box::new(restore),
                    }),
                }
            }
        }
    }

    fn restore_from_locked(&self, backup: &Path) -> Result<(), SwitchError> {
        let restore_err = |source| SwitchError::Restore {
            backup: backup.to_path_buf(),
            source,
        };
        let bytes = fs::read(backup).map_err(restore_err)?;
        write_atomic(&self.config_path, &bytes, FILE_MODE).map_err(restore_err)?;
        warn!(backup = %backup.display(), "config restored from backup");
        Ok(())
    }

    fn list_backups_locked(&self) -> Result<Vec<PathBuf>, SwitchError> {
        let Some(file_name) = self.config_path.file_name() else {
            return Ok(Vec::new());
        };
        let prefix = format!("{}{BACKUP_INFIX}", file_name.to_string_lossy());
        let dir = match self.config_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let list_err = |source| SwitchError::Restore {
            backup: dir.join(format!("{prefix}*")),
            source,
        };

        let mut backups: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in fs::read_dir(&dir).map_err(list_err)? {
            let entry = entry.map_err(list_err)?;
            let name = entry.file_name().to_string_lossy().to_string();
            // Skip in-flight temp files of a backup being written.
            if !name.starts_with(&prefix) || name.contains(".tmp.") {
                continue;
            }
            let meta = entry.metadata().map_err(list_err)?;
            if !meta.is_file() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            backups.push((modified, entry.path()));
        }

        // Timestamps in names break mtime ties within the same second.
        backups.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
        Ok(backups.into_iter().map(|(_, path)| path).collect())
    }
}
