//! Where a participant's peer identity lives between runs.
//!
//! An identity survives a quick restart of the same process (so the relay
//! treats it as a reconnect rather than a new device) but not much longer.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use duet_proto::PeerId;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{Duration, OffsetDateTime};

pub const DEFAULT_IDENTITY_TTL: Duration = Duration::minutes(30);

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("identity record malformed: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("unable to determine cache directory")]
    NoCacheDir,
}

pub trait IdentityStore: Send + Sync {
    fn load(&self, room_id: &str) -> Result<Option<PeerId>, IdentityError>;
    fn save(&self, room_id: &str, peer_id: &PeerId) -> Result<(), IdentityError>;
    fn clear(&self, room_id: &str) -> Result<(), IdentityError>;
}

/// Loads the identity stored for `room_id`, minting and saving a fresh one
/// when none is stored.
pub fn resolve(store: &dyn IdentityStore, room_id: &str) -> Result<PeerId, IdentityError> {
    if let Some(existing) = store.load(room_id)? {
        tracing::debug!(room = room_id, peer = %existing, "restored peer identity");
        return Ok(existing);
    }
    let fresh = PeerId::generate();
    store.save(room_id, &fresh)?;
    tracing::debug!(room = room_id, peer = %fresh, "minted peer identity");
    Ok(fresh)
}

#[derive(Default)]
pub struct MemoryIdentityStore {
    entries: Mutex<HashMap<String, PeerId>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self, room_id: &str) -> Result<Option<PeerId>, IdentityError> {
        Ok(self.entries.lock().get(room_id).cloned())
    }

    fn save(&self, room_id: &str, peer_id: &PeerId) -> Result<(), IdentityError> {
        self.entries
            .lock()
            .insert(room_id.to_string(), peer_id.clone());
        Ok(())
    }

    fn clear(&self, room_id: &str) -> Result<(), IdentityError> {
        self.entries.lock().remove(room_id);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityRecord {
    peer_id: PeerId,
    #[serde(with = "time::serde::rfc3339")]
    saved_at: OffsetDateTime,
}

/// One JSON record per room, discarded once older than the TTL.
pub struct FileIdentityStore {
    dir: PathBuf,
    ttl: Duration,
}

impl FileIdentityStore {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    /// Store under the platform cache directory.
    pub fn in_cache_dir(ttl: Duration) -> Result<Self, IdentityError> {
        let dirs = ProjectDirs::from("", "", "duet").ok_or(IdentityError::NoCacheDir)?;
        Ok(Self::new(dirs.cache_dir().join("identities"), ttl))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, room_id: &str) -> PathBuf {
        let safe: String = room_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self, room_id: &str) -> Result<Option<PeerId>, IdentityError> {
        let path = self.path(room_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        let record: IdentityRecord = match serde_json::from_str(&raw) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "discarding unreadable identity record");
                fs::remove_file(&path)?;
                return Ok(None);
            }
        };
        if OffsetDateTime::now_utc() - record.saved_at > self.ttl {
            fs::remove_file(&path)?;
            return Ok(None);
        }
        Ok(Some(record.peer_id))
    }

    fn save(&self, room_id: &str, peer_id: &PeerId) -> Result<(), IdentityError> {
        fs::create_dir_all(&self.dir)?;
        let record = IdentityRecord {
            peer_id: peer_id.clone(),
            saved_at: OffsetDateTime::now_utc(),
        };
        let serialized = serde_json::to_string(&record)?;
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(self.path(room_id))?;
        file.write_all(serialized.as_bytes())?;
        Ok(())
    }

    fn clear(&self, room_id: &str) -> Result<(), IdentityError> {
        match fs::remove_file(self.path(room_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
