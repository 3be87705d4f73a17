use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::StoreError;

/// Échecs consécutifs pour une clé (adresse IP en général)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    pub attempts: u32,
    /// Secondes depuis l'epoch
    pub last_attempt: i64,
}

/// Document complet : clé -> enregistrement
pub type Records = BTreeMap<String, RateLimitRecord>;

/// Stockage des tentatives, lu et réécrit en entier.
pub trait RateLimitStore {
    /// Ne renvoie jamais d'erreur : un document absent ou illisible vaut un document vide.
    fn load(&self) -> Records;

    fn save(&self, records: &Records) -> Result<(), StoreError>;

    /// Lecture, modification et écriture dans une même section critique.
    /// Le document n'est réécrit que si `f` l'a modifié.
    fn update<R>(&self, f: impl FnOnce(&mut Records) -> R) -> Result<R, StoreError>;
}

/// Document JSON sur disque, `{"<ip>": {"attempts": n, "last_attempt": epoch}}`
pub struct JsonFileStore {
    path: PathBuf,
    guard: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl RateLimitStore for JsonFileStore {
    fn load(&self) -> Records {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Records::new(),
            Err(e) => {
                warn!(path = ?self.path, error = %e, "rate-limit store unreadable, treating as empty");
                return Records::new();
            }
        };

        // Un document vidé par l'ancienne page est un tableau vide
        if content.trim() == "[]" {
            return Records::new();
        }

        match serde_json::from_str(&content) {
            Ok(records) => records,
            Err(e) => {
                warn!(path = ?self.path, error = %e, "rate-limit store corrupt, treating as empty");
                Records::new()
            }
        }
    }

    fn save(&self, records: &Records) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        // Remplacement atomique : fichier temporaire puis renommage
        let json = serde_json::to_vec(records)?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }

    fn update<R>(&self, f: impl FnOnce(&mut Records) -> R) -> Result<R, StoreError> {
        // Un thread paniqué ne laisse pas le document dans un état partiel
        let _local = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let _file = FileLock::acquire(&self.lock_path()).map_err(|e| self.io_error(e))?;

        let mut records = self.load();
        let before = records.clone();
        let result = f(&mut records);
        if records != before {
            self.save(&records)?;
        }
        Ok(result)
    }
}

/// Verrou consultatif exclusif, relâché à la fermeture du fichier
struct FileLock {
    _file: File,
}

impl FileLock {
    fn acquire(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        lock_exclusive(&file)?;
        Ok(Self { _file: file })
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    loop {
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

// Ailleurs, seul le mutex du processus protège le document
#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

/// Stockage en mémoire, pour les tests
#[cfg(test)]
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Records>,
}

#[cfg(test)]
impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Records) -> Self {
        Self {
            records: Mutex::new(records),
        }
    }
}

#[cfg(test)]
impl RateLimitStore for MemoryStore {
    fn load(&self) -> Records {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn save(&self, records: &Records) -> Result<(), StoreError> {
        *self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = records.clone();
        Ok(())
    }

    fn update<R>(&self, f: impl FnOnce(&mut Records) -> R) -> Result<R, StoreError> {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(f(&mut records))
    }
}
