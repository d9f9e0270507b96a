//! Streaming chat completion.
//!
//! A [`CompletionProvider`] turns a list of [`ChatMessage`]s into a lazy
//! [`TokenStream`]. Nothing is read from the provider until the stream is
//! polled, and dropping the stream (or cancelling it through
//! [`cancellable`]) stops reading.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{ProviderError, RagError, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String, RagError>> + Send>>;

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Start a streamed completion. Errors here mean the request never started.
    async fn stream_chat(
        &self,
        model_id: &str,
        messages: Vec<ChatMessage>,
    ) -> Result<TokenStream, ProviderError>;
}

/// End `stream` as soon as `cancel` fires.
pub fn cancellable(stream: TokenStream, cancel: CancellationToken) -> TokenStream {
    Box::pin(stream.take_until(cancel.cancelled_owned()))
}

/// Fail `stream` with a generate timeout when no token arrives within `limit`.
pub fn with_idle_timeout(stream: TokenStream, limit: Duration) -> TokenStream {
    Box::pin(stream::unfold(Some(stream), move |state| async move {
        let mut tokens = state?;
        match tokio::time::timeout(limit, tokens.next()).await {
            Ok(Some(item)) => Some((item, Some(tokens))),
            Ok(None) => None,
            Err(_) => Some((
                Err(RagError::Timeout {
                    stage: Stage::Generate,
                    elapsed: limit,
                }),
                None,
            )),
        }
    }))
}

/// A retrieved passage handed to the model as context.
#[derive(Debug, Clone)]
pub struct ContextPassage {
    pub source: String,
    pub text: String,
}

const SYSTEM_PROMPT: &str = "You answer questions using only the provided context. \
If the context does not contain the answer, say that you do not know.";

/// Build the message list for a retrieval-augmented question.
pub fn build_rag_messages(question: &str, passages: &[ContextPassage]) -> Vec<ChatMessage> {
    let mut context = String::new();
    for (i, passage) in passages.iter().enumerate() {
        context.push_str(&format!("[{}] ({})\n{}\n\n", i + 1, passage.source, passage.text));
    }
    if context.is_empty() {
        context.push_str("(no relevant context found)\n");
    }

    vec![
        ChatMessage::system(SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Context:\n{}Question: {}",
            context,
            question.trim()
        )),
    ]
}
