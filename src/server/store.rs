//! # Durable Store
//!
//! Four independent JSON files per chat server:
//!
//! ```text
//! <data_dir>/users.json          {"alice": ["2025-...", ...], ...}
//! <data_dir>/channels.json       ["general", ...]
//! <data_dir>/messages.json       [{src, dst, message, timestamp, clock}, ...]
//! <data_dir>/publications.json   [{channel, user, message, timestamp, clock}, ...]
//! ```
//!
//! Every mutation rewrites the whole file for that entity. Writes go to a
//! temporary sibling that is then renamed over the target, so a crash leaves
//! either the old or the new file. A file that exists but does not parse is
//! discarded with a warning and the entity starts empty.

use anyhow::{Context, Result};
use log::{error, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use crate::common::messages::{PrivateMessage, Publication};

/// Login history per user name.
pub type UserHistory = BTreeMap<String, Vec<String>>;

/// One JSON file holding a complete value of `T`.
#[derive(Debug, Clone)]
pub struct JsonFile<T> {
    path: PathBuf,
    _marker: PhantomData<T>,
}

impl<T> JsonFile<T>
where
    T: Serialize + DeserializeOwned + Default,
{
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the stored value. Missing, empty, unreadable, or unparsable files
    /// all yield `T::default()`; the last two are logged.
    pub fn load(&self) -> T {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return T::default(),
            Err(e) => {
                warn!(
                    "⚠️  Could not read {}, starting empty: {}",
                    self.path.display(),
                    e
                );
                return T::default();
            }
        };

        if content.trim().is_empty() {
            return T::default();
        }

        match serde_json::from_str(&content) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "⚠️  Corrupted file {}, resetting to empty: {}",
                    self.path.display(),
                    e
                );
                T::default()
            }
        }
    }

    /// Replace the stored value with `value`.
    pub fn save(&self, value: &T) -> Result<()> {
        let data = serde_json::to_vec_pretty(value)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file =
                File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
            file.write_all(&data)
                .with_context(|| format!("writing {}", tmp.display()))?;
            file.sync_all()
                .with_context(|| format!("syncing {}", tmp.display()))?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

/// Which entity file a mutation touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Users,
    Channels,
    Messages,
    Publications,
}

/// In-memory copy of everything a chat server persists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatState {
    pub users: UserHistory,
    /// Channel names in creation order
    pub channels: Vec<String>,
    pub messages: Vec<PrivateMessage>,
    pub publications: Vec<Publication>,
}

#[derive(Debug, Clone)]
pub struct ChatStore {
    users: JsonFile<UserHistory>,
    channels: JsonFile<Vec<String>>,
    messages: JsonFile<Vec<PrivateMessage>>,
    publications: JsonFile<Vec<Publication>>,
}

impl ChatStore {
    /// Open (creating if needed) the data directory.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("creating data directory {}", dir.display()))?;

        Ok(Self {
            users: JsonFile::new(dir.join("users.json")),
            channels: JsonFile::new(dir.join("channels.json")),
            messages: JsonFile::new(dir.join("messages.json")),
            publications: JsonFile::new(dir.join("publications.json")),
        })
    }

    pub fn load(&self) -> ChatState {
        ChatState {
            users: self.users.load(),
            channels: self.channels.load(),
            messages: self.messages.load(),
            publications: self.publications.load(),
        }
    }

    /// Rewrite the file for `entity` from `state`. Failures are logged, never
    /// returned: callers keep serving from memory.
    pub fn persist(&self, state: &ChatState, entity: Entity) {
        let result = match entity {
            Entity::Users => self.users.save(&state.users),
            Entity::Channels => self.channels.save(&state.channels),
            Entity::Messages => self.messages.save(&state.messages),
            Entity::Publications => self.publications.save(&state.publications),
        };
        if let Err(e) = result {
            error!("❌ Failed to persist {:?}: {:#}", entity, e);
        }
    }
}
