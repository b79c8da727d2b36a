//! Append-only JSONL transcripts of conversations.
//!
//! One file per conversation id, one JSON object per line. Transcripts are a
//! write-only side channel: failures are logged and never surface to callers.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

use super::conversation::Message;

#[derive(Debug, Clone)]
pub struct Transcript {
    dir: PathBuf,
}

#[derive(Serialize)]
struct Line<'a> {
    conversation_id: &'a str,
    #[serde(flatten)]
    message: &'a Message,
}

impl Transcript {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the transcript file for a conversation.
    pub fn path_for(&self, conversation_id: &str) -> PathBuf {
        self.dir.join(format!("conversation_{conversation_id}.jsonl"))
    }

    pub(crate) fn record(&self, conversation_id: &str, message: &Message) {
        let path = self.path_for(conversation_id);
        if let Err(e) = self.write_line(&path, conversation_id, message) {
            warn!(path = %path.display(), error = %e, "Failed to write transcript line");
        }
    }

    fn write_line(
        &self,
        path: &Path,
        conversation_id: &str,
        message: &Message,
    ) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let mut line = serde_json::to_vec(&Line {
            conversation_id,
            message,
        })?;
        line.push(b'\n');

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&line)
    }
}
