//! Conversation history container.
//!
//! Owns the ordered sequence of contents and enforces the pairing
//! invariant: every function call is answered by exactly one function
//! response appearing no earlier than the call, before the next user
//! content. History is mutated only between turns, by its owning client.

use std::collections::HashSet;

use crate::types::{Content, Part, Role};

/// The conversation history.
#[derive(Debug, Default, Clone)]
pub struct Chat {
    history: Vec<Content>,
}

impl Chat {
    /// Creates an empty chat.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing content sequence (restored sessions, tests).
    pub fn from_history(history: Vec<Content>) -> Self {
        Self { history }
    }

    /// The full history, oldest first.
    pub fn history(&self) -> &[Content] {
        &self.history
    }

    /// Number of contents.
    pub fn len(&self) -> usize {
        self.history.len()
    }

    /// True when no contents have been appended.
    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Appends a user content.
    pub fn push_user(&mut self, content: Content) {
        debug_assert_eq!(content.role, Role::User);
        self.history.push(content);
    }

    /// Appends a model content with no tool calls.
    pub fn push_model(&mut self, content: Content) {
        debug_assert_eq!(content.role, Role::Model);
        self.history.push(content);
    }

    /// Commits one completed turn atomically: the model content carrying
    /// the calls and the function content carrying their responses.
    pub fn record_turn(&mut self, model: Content, responses: Content) {
        debug_assert_eq!(model.role, Role::Model);
        debug_assert_eq!(responses.role, Role::Function);
        self.history.push(model);
        self.history.push(responses);
    }

    /// Ids of function calls that have no response yet.
    pub fn unresolved_call_ids(&self) -> Vec<String> {
        let mut open: Vec<String> = Vec::new();
        for content in &self.history {
            for part in &content.parts {
                match part {
                    Part::FunctionCall { id, .. } => open.push(id.clone()),
                    Part::FunctionResponse { id, .. } => open.retain(|o| o != id),
                    Part::Text { .. } => {}
                }
            }
        }
        open
    }

    /// Verifies the pairing invariant over the whole history.
    pub fn pairing_is_valid(&self) -> bool {
        let mut open: HashSet<String> = HashSet::new();
        let mut answered: HashSet<String> = HashSet::new();

        for content in &self.history {
            if content.role == Role::User && !open.is_empty() {
                // A user turn began while calls were unanswered.
                return false;
            }
            for part in &content.parts {
                match part {
                    Part::FunctionCall { id, .. } => {
                        if !open.insert(id.clone()) || answered.contains(id) {
                            return false;
                        }
                    }
                    Part::FunctionResponse { id, .. } => {
                        if !open.remove(id) {
                            // Response without a prior call, or a duplicate.
                            return false;
                        }
                        answered.insert(id.clone());
                    }
                    Part::Text { .. } => {}
                }
            }
        }
        true
    }

    /// The largest prefix length `<= target` that does not split a
    /// call/response pair. Returns 0 when no safe boundary exists.
    pub fn safe_prefix_end(&self, target: usize) -> usize {
        let target = target.min(self.history.len());
        for end in (1..=target).rev() {
            let mut open: HashSet<&str> = HashSet::new();
            for content in &self.history[..end] {
                for part in &content.parts {
                    match part {
                        Part::FunctionCall { id, .. } => {
                            open.insert(id);
                        }
                        Part::FunctionResponse { id, .. } => {
                            open.remove(id.as_str());
                        }
                        Part::Text { .. } => {}
                    }
                }
            }
            if open.is_empty() {
                return end;
            }
        }
        0
    }

    /// Replaces the first `end` contents with a single summary content.
    pub fn replace_prefix(&mut self, end: usize, summary: Content) {
        let end = end.min(self.history.len());
        let mut rebuilt = Vec::with_capacity(self.history.len() - end + 1);
        rebuilt.push(summary);
        rebuilt.extend(self.history.drain(end..));
        self.history = rebuilt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_and_response(id: &str) -> (Content, Content) {
        (
            Content::model(vec![Part::function_call(
                id,
                "sql_tool",
                serde_json::json!({}),
            )]),
            Content::function(vec![Part::function_response(
                id,
                "sql_tool",
                serde_json::json!({}),
            )]),
        )
    }

    #[test]
    fn test_record_turn_keeps_pairing_valid() {
        let mut chat = Chat::new();
        chat.push_user(Content::user_text("show users"));
        let (model, responses) = call_and_response("c1");
        chat.record_turn(model, responses);
        chat.push_user(Content::user_text("thanks"));

        assert!(chat.pairing_is_valid());
        assert!(chat.unresolved_call_ids().is_empty());
    }

    #[test]
    fn test_orphan_call_across_user_boundary_is_invalid() {
        let mut chat = Chat::new();
        chat.push_user(Content::user_text("show users"));
        chat.push_model(Content::model(vec![Part::function_call(
            "c1",
            "sql_tool",
            serde_json::json!({}),
        )]));
        chat.push_user(Content::user_text("hello?"));

        assert!(!chat.pairing_is_valid());
        assert_eq!(chat.unresolved_call_ids(), vec!["c1"]);
    }

    #[test]
    fn test_response_without_call_is_invalid() {
        let mut chat = Chat::new();
        chat.push_user(Content::user_text("hi"));
        chat.history.push(Content::function(vec![Part::function_response(
            "ghost",
            "sql_tool",
            serde_json::json!({}),
        )]));
        assert!(!chat.pairing_is_valid());
    }

    #[test]
    fn test_safe_prefix_never_splits_pairs() {
        let mut chat = Chat::new();
        chat.push_user(Content::user_text("one"));
        let (model, responses) = call_and_response("c1");
        chat.record_turn(model, responses);
        chat.push_user(Content::user_text("two"));

        // Prefix of 2 would orphan c1's call; the safe boundary steps back.
        assert_eq!(chat.safe_prefix_end(2), 1);
        // Prefix of 3 includes the full pair.
        assert_eq!(chat.safe_prefix_end(3), 3);
    }

    #[test]
    fn test_replace_prefix_with_summary() {
        let mut chat = Chat::new();
        chat.push_user(Content::user_text("one"));
        chat.push_model(Content::model(vec![Part::text("reply one")]));
        chat.push_user(Content::user_text("two"));

        chat.replace_prefix(2, Content::user_text("Summary of earlier conversation."));
        assert_eq!(chat.len(), 2);
        assert!(chat.history()[0]
            .joined_text()
            .contains("Summary of earlier conversation"));
        assert_eq!(chat.history()[1].joined_text(), "two");
        assert!(chat.pairing_is_valid());
    }

    #[test]
    fn test_safe_prefix_end_zero_when_everything_open() {
        let mut chat = Chat::new();
        chat.push_model(Content::model(vec![Part::function_call(
            "c1",
            "sql_tool",
            serde_json::json!({}),
        )]));
        assert_eq!(chat.safe_prefix_end(1), 0);
    }
}
