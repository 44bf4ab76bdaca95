//! On-disk layout of one session:
//!
//! ```text
//! sessions/<id>/session.json     metadata, replaced atomically
//! sessions/<id>/messages.jsonl   one message per line, append only
//! ```

use super::{Message, Session};
use crate::store;
use anyhow::Context;
use keel_core::{KeelError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const META_FILE: &str = "session.json";
const MESSAGES_FILE: &str = "messages.jsonl";

#[derive(Debug, Clone)]
pub(crate) struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.dir(id).join(META_FILE)
    }

    fn messages_path(&self, id: &str) -> PathBuf {
        self.dir(id).join(MESSAGES_FILE)
    }

    /// Ids of every session directory, unsorted
    pub fn ids(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_dir() && entry.path().join(META_FILE).exists() {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        Ok(ids)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.meta_path(id).exists()
    }

    pub fn read_meta(&self, id: &str) -> Result<Session> {
        let path = self.meta_path(id);
        match store::read_json::<Session>(&path) {
            Ok(Some(session)) => Ok(session),
            Ok(None) => Err(KeelError::SessionNotFound(id.to_string())),
            Err(e) => Err(KeelError::SessionCorruption {
                message: format!("{e:#}"),
                backup: None,
            }),
        }
    }

    pub fn write_meta(&self, session: &Session) -> Result<()> {
        store::write_json_atomic(&self.meta_path(&session.id), session)
            .map_err(|e| KeelError::Other(format!("{e:#}")))
    }

    /// Exclusive lock for read-modify-write of one session
    pub fn lock(&self, id: &str) -> Result<store::FileLock> {
        if !self.dir(id).is_dir() {
            return Err(KeelError::SessionNotFound(id.to_string()));
        }
        store::FileLock::acquire(&store::lock_path_for(&self.meta_path(id)))
            .map_err(|e| KeelError::Other(format!("{e:#}")))
    }

    pub fn append_message(&self, message: &Message) -> Result<()> {
        let path = self.messages_path(&message.session_id);
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))
            .map_err(|e| KeelError::Other(format!("{e:#}")))?;

        // A record cut short by a crash is dropped so it cannot end up
        // between two valid ones; a complete record only missing its
        // newline is kept
        if let Some((start, tail)) = unterminated_tail(&mut file)? {
            if serde_json::from_slice::<Message>(&tail).is_ok() {
                line.insert(0, '\n');
            } else {
                tracing::warn!(
                    session = %message.session_id,
                    "Dropping partial trailing record in {}",
                    path.display()
                );
                file.set_len(start)?;
            }
        }

        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    /// Load all messages, repairing a damaged tail.
    ///
    /// Malformed records at the end of the file (a write interrupted by a
    /// crash) are cut off. A malformed record followed by valid ones is not
    /// repairable: the file is copied aside and `SessionCorruption` returned.
    pub fn read_messages(&self, id: &str) -> Result<Vec<Message>> {
        let path = self.messages_path(id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        let mut first_bad: Option<(usize, usize)> = None;
        let mut offset = 0;
        for (index, raw) in data.split(|b| *b == b'\n').enumerate() {
            let start = offset;
            offset += raw.len() + 1;
            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<Message>(raw) {
                Ok(message) => {
                    if let Some((line, _)) = first_bad {
                        let backup = backup_corrupt(&path)?;
                        return Err(KeelError::SessionCorruption {
                            message: format!(
                                "session {id}: malformed record at line {} of {}",
                                line + 1,
                                path.display()
                            ),
                            backup: Some(backup),
                        });
                    }
                    messages.push(message);
                }
                Err(_) if first_bad.is_none() => first_bad = Some((index, start)),
                Err(_) => {}
            }
        }

        if let Some((line, start)) = first_bad {
            tracing::warn!(
                session = %id,
                line = line + 1,
                "Truncating malformed trailing records in {}",
                path.display()
            );
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len(start as u64)?;
            file.sync_all()?;
        }

        Ok(messages)
    }

    /// Delete the session directory once no append is in flight.
    pub fn remove(&self, id: &str) -> Result<()> {
        let dir = self.dir(id);
        let _lock = self.lock(id)?;
        fs::remove_dir_all(&dir)
            .with_context(|| format!("remove {}", dir.display()))
            .map_err(|e| KeelError::Other(format!("{e:#}")))
    }
}

/// Offset and bytes of the last line when the file does not end in a
/// newline.
fn unterminated_tail(file: &mut File) -> std::io::Result<Option<(u64, Vec<u8>)>> {
    let len = file.metadata()?.len();
    let mut tail = Vec::new();
    let mut pos = len;
    let mut buf = [0u8; 4096];
    while pos > 0 {
        let n = pos.min(buf.len() as u64) as usize;
        pos -= n as u64;
        file.seek(SeekFrom::Start(pos))?;
        file.read_exact(&mut buf[..n])?;
        if let Some(i) = buf[..n].iter().rposition(|b| *b == b'\n') {
            let start = pos + i as u64 + 1;
            tail.splice(0..0, buf[i + 1..n].iter().copied());
            return Ok((start < len).then_some((start, tail)));
        }
        tail.splice(0..0, buf[..n].iter().copied());
    }
    Ok((len > 0).then_some((0, tail)))
}

fn backup_corrupt(path: &Path) -> Result<PathBuf> {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| MESSAGES_FILE.to_string());
    let backup = path.with_file_name(format!("{file_name}.corrupt-{stamp}"));
    fs::copy(path, &backup)?;
    tracing::warn!("Preserved corrupt session log at {}", backup.display());
    Ok(backup)
}
