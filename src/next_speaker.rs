//! Next-speaker arbitration.
//!
//! After a turn finishes, decides whether the model should continue
//! without fresh user input. Implemented as a heuristic over the tail of
//! the history; the hard `max_turns` cap lives in the client.

use crate::types::{Content, Part, Role};

/// Who speaks next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextSpeaker {
    User,
    Model,
}

/// Phrases at the end of a model reply that signal it intends to keep
/// going.
const CONTINUATION_MARKERS: &[&str] = &[
    "i will now",
    "i'll now",
    "let me",
    "next, i",
    "next i",
    "one moment",
    "running that now",
];

/// Decides the next speaker from the history tail.
pub fn decide(history: &[Content]) -> NextSpeaker {
    let Some(last) = history.last() else {
        return NextSpeaker::User;
    };

    match last.role {
        // Tool responses were just appended: the model has not seen them
        // yet and must react.
        Role::Function => NextSpeaker::Model,

        Role::Model => {
            // Unanswered calls mean the model is mid-action.
            if last
                .parts
                .iter()
                .any(|p| matches!(p, Part::FunctionCall { .. }))
            {
                return NextSpeaker::Model;
            }

            let text = last.joined_text();
            let trimmed = text.trim_end();
            if trimmed.ends_with('?') {
                return NextSpeaker::User;
            }
            if trimmed.ends_with(':') {
                return NextSpeaker::Model;
            }
            let lowered = trimmed.to_lowercase();
            if CONTINUATION_MARKERS
                .iter()
                .any(|marker| lowered.ends_with(marker) || lowered.ends_with(&format!("{marker}.")))
            {
                return NextSpeaker::Model;
            }
            NextSpeaker::User
        }

        Role::User => NextSpeaker::Model,
    }
}
