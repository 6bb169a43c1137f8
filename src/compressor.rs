//! History compression.
//!
//! When the estimated token count crosses the configured fraction of the
//! context window, the oldest pairing-safe prefix is replaced with a
//! single user-role summary produced by the LLM. Call/response pairs are
//! never split, and repeated invocations over unchanged history are
//! no-ops.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::chat::Chat;
use crate::config::AgentConfig;
use crate::error::{DbRheoError, Result};
use crate::llm::{estimate_tokens, LlmRequest, LlmService, StreamEvent};
use crate::types::{AbortSignal, Content};

/// Instruction sent to the model to produce the summary. Treated as
/// configuration; hosts can override via `compression.prompt`.
const DEFAULT_COMPRESSION_PROMPT: &str =
    "Summarize the conversation so far in a compact form. Preserve every fact \
     about the database schema, the queries that were run with their outcomes, \
     and any decisions or open tasks. Reply with the summary only.";

/// Compresses chat history against a token budget.
pub struct HistoryCompressor {
    service: Arc<dyn LlmService>,
    config: Arc<AgentConfig>,
    /// History length right after the last compression; unchanged history
    /// is not compressed twice.
    last_compressed_len: Mutex<Option<usize>>,
}

impl HistoryCompressor {
    /// Creates a compressor over the given service.
    pub fn new(service: Arc<dyn LlmService>, config: Arc<AgentConfig>) -> Self {
        Self {
            service,
            config,
            last_compressed_len: Mutex::new(None),
        }
    }

    /// Compresses when the history crosses the threshold. Returns whether
    /// a compression happened.
    pub async fn maybe_compress(&self, chat: &mut Chat, signal: &AbortSignal) -> Result<bool> {
        if signal.is_tripped() {
            return Err(DbRheoError::Cancelled);
        }

        {
            let last = self.last_compressed_len.lock().await;
            if *last == Some(chat.len()) {
                return Ok(false);
            }
        }

        let tokens = match self.service.count_tokens(chat.history()).await {
            Ok(Some(count)) => count,
            _ => estimate_tokens(chat.history()),
        };
        let budget =
            (self.config.compression_threshold() * self.config.context_window() as f64) as u64;
        if tokens < budget {
            return Ok(false);
        }

        let keep = self.config.compression_keep_recent();
        let target = ((chat.len() as f64) * (1.0 - keep)).floor() as usize;
        let boundary = chat.safe_prefix_end(target);
        if boundary == 0 {
            debug!("No pairing-safe prefix to compress");
            return Ok(false);
        }

        let summary_text = self.summarize(&chat.history()[..boundary], signal).await?;
        let summary = Content::user_text(format!(
            "Summary of the earlier conversation:\n{summary_text}"
        ));
        chat.replace_prefix(boundary, summary);

        info!(
            compressed_contents = boundary,
            remaining = chat.len(),
            "Compressed history"
        );
        *self.last_compressed_len.lock().await = Some(chat.len());
        Ok(true)
    }

    async fn summarize(&self, prefix: &[Content], signal: &AbortSignal) -> Result<String> {
        let prompt = self
            .config
            .get_str("compression.prompt", DEFAULT_COMPRESSION_PROMPT);
        let mut history = prefix.to_vec();
        history.push(Content::user_text(prompt));

        let request = LlmRequest {
            history,
            ..Default::default()
        };
        let mut stream = self
            .service
            .stream(request, signal.clone())
            .await
            .map_err(|e| DbRheoError::compression(format!("summary request failed: {e}")))?;

        let mut summary = String::new();
        while let Some(event) = stream.next().await {
            match event {
                Ok(StreamEvent::TextDelta(delta)) => summary.push_str(&delta),
                Ok(_) => {}
                Err(e) => {
                    return Err(DbRheoError::compression(format!(
                        "summary stream failed: {e}"
                    )))
                }
            }
        }

        if summary.trim().is_empty() {
            return Err(DbRheoError::compression("summary came back empty"));
        }
        Ok(summary)
    }
}
