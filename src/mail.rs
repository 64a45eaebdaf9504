//! Mail adapter interface.
//!
//! Raw mail fetching, OAuth handling, and signature/quote stripping happen
//! outside this crate. The pipeline consumes cleaned messages through this
//! trait: stable ids, normalized bodies, receive timestamps. Re-fetching
//! from a given cursor is permitted and must be idempotent on the provider
//! side.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::entities::EmailMessage;
use crate::error::{PipelineError, PipelineResult};
use crate::logging::log_debug;

/// Source of cleaned email messages.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailAdapter: Send + Sync {
    /// Fetch messages strictly after `after_id` in the provider's ordering.
    ///
    /// `None` means from the beginning. Returned messages are in fetch
    /// order; the daemon processes them in that order and never reorders.
    async fn fetch<'a>(&'a self, after_id: Option<&'a str>) -> PipelineResult<Vec<EmailMessage>>;
}

/// Mail adapter reading pre-cleaned messages from a local drop directory.
///
/// Each file under the directory is one JSON-encoded [`EmailMessage`];
/// ordering follows the lexicographic file name, and the message id doubles
/// as the cursor. This is the development adapter; production receivers
/// plug in behind the same trait.
#[derive(Debug, Clone)]
pub struct JsonDropAdapter {
    dir: PathBuf,
}

impl JsonDropAdapter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl MailAdapter for JsonDropAdapter {
    async fn fetch<'a>(&'a self, after_id: Option<&'a str>) -> PipelineResult<Vec<EmailMessage>> {
        let mut reader = match tokio::fs::read_dir(&self.dir).await {
            Ok(reader) => reader,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(PipelineError::network(
                    crate::error::service::MAIL,
                    format!("inbox directory unreadable: {e}"),
                    None,
                ))
            }
        };

        let mut files: Vec<PathBuf> = Vec::new();
        while let Some(dirent) = reader.next_entry().await.map_err(|e| {
            PipelineError::network(
                crate::error::service::MAIL,
                format!("inbox scan failed: {e}"),
                None,
            )
        })? {
            let path = dirent.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();

        let mut messages = Vec::new();
        let mut past_cursor = after_id.is_none();
        for path in files {
            let Some(message) =
                crate::internals::fs::read_json::<EmailMessage>(&path).await?
            else {
                continue;
            };
            if past_cursor {
                messages.push(message);
            } else if Some(message.message_id.as_str()) == after_id {
                past_cursor = true;
            }
        }
        log_debug!(
            after_id = after_id.unwrap_or("-"),
            fetched = messages.len(),
            "Inbox drop directory scanned"
        );
        Ok(messages)
    }
}
