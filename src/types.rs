//! Core conversation value types.
//!
//! Defines the content/part model shared by the chat history, the LLM
//! services, and the tool scheduler, plus the abort signal threaded through
//! every suspending operation.

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Role of a content entry in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// User input (human or a summary injected on their behalf).
    User,
    /// Model output (text and/or function calls).
    Model,
    /// Function results fed back to the model.
    Function,
}

impl Role {
    /// Returns the role as a string for API requests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
            Self::Function => "function",
        }
    }
}

/// A single part of a content entry.
///
/// Parts of different kinds may interleave within one model content; order
/// is preserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Plain text.
    Text { text: String },
    /// A structured request by the model to invoke a named tool.
    FunctionCall {
        id: String,
        name: String,
        args: serde_json::Value,
    },
    /// The paired result of a function call.
    FunctionResponse {
        id: String,
        name: String,
        response: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Part {
    /// Creates a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Creates a function call part.
    pub fn function_call(
        id: impl Into<String>,
        name: impl Into<String>,
        args: serde_json::Value,
    ) -> Self {
        Self::FunctionCall {
            id: id.into(),
            name: name.into(),
            args,
        }
    }

    /// Creates a successful function response part.
    pub fn function_response(
        id: impl Into<String>,
        name: impl Into<String>,
        response: serde_json::Value,
    ) -> Self {
        Self::FunctionResponse {
            id: id.into(),
            name: name.into(),
            response,
            error: None,
        }
    }

    /// Creates a failed function response part. The response payload still
    /// carries the structured error object so the model can reason over it.
    pub fn function_error(
        id: impl Into<String>,
        name: impl Into<String>,
        response: serde_json::Value,
        error: impl Into<String>,
    ) -> Self {
        Self::FunctionResponse {
            id: id.into(),
            name: name.into(),
            response,
            error: Some(error.into()),
        }
    }

    /// Returns the call id if this part is a function call.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::FunctionCall { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Returns the call id if this part is a function response.
    pub fn response_id(&self) -> Option<&str> {
        match self {
            Self::FunctionResponse { id, .. } => Some(id),
            _ => None,
        }
    }
}

/// An ordered list of parts attributed to one role.
///
/// Contents are append-only: once committed to history they are never
/// mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    /// Creates a content entry with the given role and parts.
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    /// Creates a user content entry from plain text.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Part::text(text)])
    }

    /// Creates a model content entry.
    pub fn model(parts: Vec<Part>) -> Self {
        Self::new(Role::Model, parts)
    }

    /// Creates a function content entry carrying responses.
    pub fn function(parts: Vec<Part>) -> Self {
        Self::new(Role::Function, parts)
    }

    /// Concatenates the text parts of this content.
    pub fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Returns the ids of all function calls in this content.
    pub fn call_ids(&self) -> Vec<&str> {
        self.parts.iter().filter_map(Part::call_id).collect()
    }

    /// Returns true if this content contains at least one function call.
    pub fn has_function_calls(&self) -> bool {
        self.parts
            .iter()
            .any(|p| matches!(p, Part::FunctionCall { .. }))
    }
}

/// A one-shot trip flag propagated through every suspending core operation.
///
/// Cloning is cheap; all clones observe the same flag. Once tripped the
/// signal stays tripped.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
}

impl AbortSignal {
    /// Creates a fresh, untripped signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trips the signal. Idempotent.
    pub fn trip(&self) {
        self.token.cancel();
    }

    /// Returns true once the signal has been tripped.
    pub fn is_tripped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Suspends until the signal trips. Returns immediately if already
    /// tripped.
    pub async fn tripped(&self) {
        self.token.cancelled().await;
    }

    /// Owned variant of [`AbortSignal::tripped`] for `'static` stream
    /// combinators.
    pub fn tripped_owned(&self) -> tokio_util::sync::WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }
}
