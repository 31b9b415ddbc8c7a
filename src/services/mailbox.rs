//! Voicemail mailbox storage
//!
//! One directory per extension under the voicemail root:
//!
//! ```text
//! voicemail/1001/greeting.wav
//! voicemail/1001/messages/<id>.wav
//! voicemail/1001/messages/<id>.meta.json
//! ```
//!
//! Recordings land in a scratch file inside the mailbox and are renamed
//! into place, so a half-written message is never visible. The filesystem
//! is the lock.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::media::wav::{self, WavAudio};
use crate::{Error, Result};

/// Sidecar metadata for one message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMeta {
    pub id: String,
    pub caller: String,
    pub received_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub seen: bool,
}

pub struct MailboxStore {
    root: PathBuf,
}

impl MailboxStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    fn mailbox_dir(&self, mailbox: &str) -> PathBuf {
        self.root.join(mailbox)
    }

    fn messages_dir(&self, mailbox: &str) -> PathBuf {
        self.mailbox_dir(mailbox).join("messages")
    }

    pub fn ensure_mailbox(&self, mailbox: &str) -> Result<()> {
        std::fs::create_dir_all(self.messages_dir(mailbox))?;
        Ok(())
    }

    /// Scratch path for an in-progress recording, same filesystem as the
    /// final location so the commit rename is atomic
    pub fn scratch_path(&self, mailbox: &str) -> Result<PathBuf> {
        self.ensure_mailbox(mailbox)?;
        Ok(self
            .mailbox_dir(mailbox)
            .join(format!(".tmp.{}.wav", Uuid::new_v4())))
    }

    /// Promote a finished scratch recording to a visible message
    pub fn commit_message(
        &self,
        mailbox: &str,
        scratch: &Path,
        caller: &str,
    ) -> Result<MessageMeta> {
        let audio = wav::read_wav(scratch)?;
        let meta = MessageMeta {
            id: Uuid::new_v4().to_string(),
            caller: caller.to_string(),
            received_at: Utc::now(),
            duration_ms: audio.duration_ms(),
            seen: false,
        };

        let messages = self.messages_dir(mailbox);
        std::fs::create_dir_all(&messages)?;

        let wav_path = messages.join(format!("{}.wav", meta.id));
        std::fs::rename(scratch, &wav_path)?;
        self.write_meta(mailbox, &meta)?;

        info!(
            "Voicemail for {} from {} ({} ms)",
            mailbox, caller, meta.duration_ms
        );
        Ok(meta)
    }

    /// Discard a scratch recording that will not be kept
    pub fn discard_scratch(&self, scratch: &Path) {
        if scratch.exists() {
            if let Err(e) = std::fs::remove_file(scratch) {
                warn!("Failed to remove scratch {}: {}", scratch.display(), e);
            }
        }
    }

    fn write_meta(&self, mailbox: &str, meta: &MessageMeta) -> Result<()> {
        let messages = self.messages_dir(mailbox);
        let tmp = messages.join(format!(".tmp.{}.meta.json", meta.id));
        let final_path = messages.join(format!("{}.meta.json", meta.id));
        std::fs::write(&tmp, serde_json::to_vec_pretty(meta)?)?;
        std::fs::rename(&tmp, &final_path)?;
        Ok(())
    }

    /// Messages sorted oldest first
    pub fn list_messages(&self, mailbox: &str) -> Result<Vec<MessageMeta>> {
        let messages = self.messages_dir(mailbox);
        if !messages.exists() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        for entry in std::fs::read_dir(&messages)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(".tmp.") || !name.ends_with(".meta.json") {
                continue;
            }
            match std::fs::read(entry.path())
                .map_err(Error::from)
                .and_then(|data| serde_json::from_slice::<MessageMeta>(&data).map_err(Error::from))
            {
                Ok(meta) => out.push(meta),
                Err(e) => {
                    warn!("Skipping unreadable meta {}: {}", name, e);
                }
            }
        }

        out.sort_by_key(|m| m.received_at);
        Ok(out)
    }

    /// (new, total) counts for the welcome announcement
    pub fn message_counts(&self, mailbox: &str) -> Result<(usize, usize)> {
        let messages = self.list_messages(mailbox)?;
        let new = messages.iter().filter(|m| !m.seen).count();
        Ok((new, messages.len()))
    }

    pub fn message_audio(&self, mailbox: &str, id: &str) -> Result<WavAudio> {
        wav::read_wav(self.messages_dir(mailbox).join(format!("{}.wav", id)))
    }

    pub fn mark_seen(&self, mailbox: &str, id: &str) -> Result<()> {
        let mut messages = self.list_messages(mailbox)?;
        let meta = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| Error::voicemail(format!("No message {} in {}", id, mailbox)))?;
        if !meta.seen {
            meta.seen = true;
            self.write_meta(mailbox, meta)?;
        }
        Ok(())
    }

    pub fn delete_message(&self, mailbox: &str, id: &str) -> Result<()> {
        let messages = self.messages_dir(mailbox);
        let wav_path = messages.join(format!("{}.wav", id));
        let meta_path = messages.join(format!("{}.meta.json", id));
        if !wav_path.exists() {
            return Err(Error::voicemail(format!("No message {} in {}", id, mailbox)));
        }
        std::fs::remove_file(&wav_path)?;
        let _ = std::fs::remove_file(&meta_path);
        debug!("Deleted voicemail {} from {}", id, mailbox);
        Ok(())
    }

    /// Custom greeting, when one has been recorded
    pub fn greeting(&self, mailbox: &str) -> Option<PathBuf> {
        let path = self.mailbox_dir(mailbox).join("greeting.wav");
        path.exists().then_some(path)
    }

    pub fn commit_greeting(&self, mailbox: &str, scratch: &Path) -> Result<()> {
        self.ensure_mailbox(mailbox)?;
        let final_path = self.mailbox_dir(mailbox).join("greeting.wav");
        std::fs::rename(scratch, final_path)?;
        info!("New greeting for mailbox {}", mailbox);
        Ok(())
    }

    pub fn delete_greeting(&self, mailbox: &str) -> Result<()> {
        let path = self.mailbox_dir(mailbox).join("greeting.wav");
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, MailboxStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = MailboxStore::new(dir.path());
        (dir, store)
    }

    fn record_message(store: &MailboxStore, mailbox: &str, caller: &str) -> MessageMeta {
        let scratch = store.scratch_path(mailbox).unwrap();
        wav::write_wav(&scratch, &vec![100i16; 8000]).unwrap();
        store.commit_message(mailbox, &scratch, caller).unwrap()
    }

    #[test]
    fn test_commit_and_list() {
        let (_dir, store) = store();
        let meta = record_message(&store, "1001", "1002");

        assert_eq!(meta.duration_ms, 1000);
        assert!(!meta.seen);

        let listed = store.list_messages("1001").unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, meta.id);
        assert_eq!(listed[0].caller, "1002");

        // The audio reads back
        let audio = store.message_audio("1001", &meta.id).unwrap();
        assert_eq!(audio.samples.len(), 8000);
    }

    #[test]
    fn test_no_scratch_visible_after_commit() {
        let (_dir, store) = store();
        record_message(&store, "1001", "1002");

        let mailbox_dir = store.mailbox_dir("1001");
        for entry in std::fs::read_dir(&mailbox_dir).unwrap() {
            let name = entry.unwrap().file_name();
            assert!(
                !name.to_string_lossy().starts_with(".tmp."),
                "scratch file left behind: {:?}",
                name
            );
        }
    }

    #[test]
    fn test_counts_and_mark_seen() {
        let (_dir, store) = store();
        let first = record_message(&store, "1001", "1002");
        record_message(&store, "1001", "1003");

        assert_eq!(store.message_counts("1001").unwrap(), (2, 2));

        store.mark_seen("1001", &first.id).unwrap();
        assert_eq!(store.message_counts("1001").unwrap(), (1, 2));

        // Seen flag survives a re-read
        let listed = store.list_messages("1001").unwrap();
        assert!(listed.iter().find(|m| m.id == first.id).unwrap().seen);
    }

    #[test]
    fn test_delete_message() {
        let (_dir, store) = store();
        let meta = record_message(&store, "1001", "1002");

        store.delete_message("1001", &meta.id).unwrap();
        assert!(store.list_messages("1001").unwrap().is_empty());
        assert!(store.delete_message("1001", &meta.id).is_err());
    }

    #[test]
    fn test_greeting_lifecycle() {
        let (_dir, store) = store();
        assert!(store.greeting("1001").is_none());

        let scratch = store.scratch_path("1001").unwrap();
        wav::write_wav(&scratch, &vec![50i16; 4000]).unwrap();
        store.commit_greeting("1001", &scratch).unwrap();

        let greeting = store.greeting("1001").unwrap();
        assert_eq!(wav::read_wav(greeting).unwrap().samples.len(), 4000);

        store.delete_greeting("1001").unwrap();
        assert!(store.greeting("1001").is_none());
    }

    #[test]
    fn test_empty_mailbox() {
        let (_dir, store) = store();
        assert!(store.list_messages("2002").unwrap().is_empty());
        assert_eq!(store.message_counts("2002").unwrap(), (0, 0));
    }

    #[test]
    fn test_discard_scratch() {
        let (_dir, store) = store();
        let scratch = store.scratch_path("1001").unwrap();
        wav::write_wav(&scratch, &vec![0i16; 100]).unwrap();
        assert!(scratch.exists());
        store.discard_scratch(&scratch);
        assert!(!scratch.exists());
    }
}
