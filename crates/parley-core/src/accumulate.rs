//! Delta accumulation.
//!
//! Folds the [`MessageDelta`]s of one message, in arrival order, into an
//! [`AccumulatedState`] and finalizes it into a [`Message`].
//!
//! # Merge rules
//!
//! - `role` and `id` are fixed by the first delta carrying them; a later
//!   delta carrying a different value is a [`ProtocolError`].
//! - `thinking` text is appended.
//! - In `contents`, the first part of a delta continues the tail part when
//!   both are text. Every other part is appended. Image and value parts are
//!   complete on arrival.
//! - In `tool_calls`, the first part of a delta continues the tail call when
//!   its id is absent or equal to the tail id: arguments are appended and a
//!   present name replaces the previous one. Otherwise it starts a new call.
//!
//! A rejected delta leaves the state untouched.
//!
//! # Example
//!
//! ```
//! use parley_core::{accumulate, finalize, MessageDelta, PartDelta, Role};
//!
//! let first = MessageDelta::text(Role::Assistant, "Hel");
//! let second = MessageDelta { contents: vec![PartDelta::text("lo")], ..Default::default() };
//!
//! let state = accumulate(None, first).unwrap();
//! let state = accumulate(Some(state), second).unwrap();
//! assert_eq!(finalize(&state).unwrap().text(), "Hello");
//! ```

use crate::delta::{MessageDelta, PartDelta};
use crate::error::ProtocolError;
use crate::message::{Message, Part, Role};

/// The in-progress value of a streaming message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccumulatedState {
    role: Option<Role>,
    id: Option<String>,
    thinking: Option<String>,
    contents: Vec<Part>,
    tool_calls: Vec<Part>,
}

impl AccumulatedState {
    /// Create an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one delta into this state.
    ///
    /// # Errors
    ///
    /// Returns a [`ProtocolError`] if the delta conflicts with the state. The
    /// state is not modified in that case.
    pub fn apply(&mut self, delta: MessageDelta) -> Result<(), ProtocolError> {
        self.validate(&delta)?;

        if self.role.is_none() {
            self.role = delta.role;
        }
        if self.id.is_none() {
            self.id = delta.id;
        }
        if let Some(thinking) = delta.thinking {
            self.thinking.get_or_insert_with(String::new).push_str(&thinking);
        }

        for (i, part) in delta.contents.into_iter().enumerate() {
            if i == 0 {
                if let (PartDelta::Text { text }, Some(Part::Text { text: tail })) =
                    (&part, self.contents.last_mut())
                {
                    tail.push_str(text);
                    continue;
                }
            }
            self.contents.push(part.into_part());
        }

        for (i, part) in delta.tool_calls.into_iter().enumerate() {
            if i == 0 {
                if let Some(Part::Function {
                    id: tail_id,
                    name: tail_name,
                    arguments: tail_args,
                }) = self.tool_calls.last_mut()
                {
                    if let PartDelta::Function {
                        id,
                        name,
                        arguments,
                    } = &part
                    {
                        if id.is_none() || id == tail_id {
                            if let Some(name) = name.as_ref().filter(|n| !n.is_empty()) {
                                tail_name.clone_from(name);
                            }
                            tail_args.push_str(arguments);
                            continue;
                        }
                    }
                }
            }
            self.tool_calls.push(part.into_part());
        }

        Ok(())
    }

    fn validate(&self, delta: &MessageDelta) -> Result<(), ProtocolError> {
        if let (Some(expected), Some(got)) = (self.role, delta.role) {
            if expected != got {
                return Err(ProtocolError::RoleMismatch { expected, got });
            }
        }
        if let (Some(expected), Some(got)) = (&self.id, &delta.id) {
            if expected != got {
                return Err(ProtocolError::IdMismatch {
                    expected: expected.clone(),
                    got: got.clone(),
                });
            }
        }
        if let Some(part) = delta
            .contents
            .iter()
            .find(|p| matches!(p, PartDelta::Function { .. }))
        {
            return Err(ProtocolError::UnexpectedPart {
                field: "contents",
                kind: part.kind(),
            });
        }
        if let Some(part) = delta
            .tool_calls
            .iter()
            .find(|p| !matches!(p, PartDelta::Function { .. }))
        {
            return Err(ProtocolError::UnexpectedPart {
                field: "tool_calls",
                kind: part.kind(),
            });
        }
        Ok(())
    }

    /// Return the role fixed so far, if any.
    #[must_use]
    pub const fn role(&self) -> Option<Role> {
        self.role
    }

    /// Return the content parts accumulated so far.
    #[must_use]
    pub fn contents(&self) -> &[Part] {
        &self.contents
    }

    /// Return the tool calls accumulated so far.
    #[must_use]
    pub fn tool_calls(&self) -> &[Part] {
        &self.tool_calls
    }

    /// Return the reasoning text accumulated so far.
    #[must_use]
    pub fn thinking(&self) -> Option<&str> {
        self.thinking.as_deref()
    }

    /// Produce the finalized message.
    ///
    /// Pure: calling it twice on the same state yields equal messages.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::MissingRole`] if no delta carried a role.
    pub fn finalize(&self) -> Result<Message, ProtocolError> {
        let role = self.role.ok_or(ProtocolError::MissingRole)?;
        Ok(self.to_message(role))
    }

    /// Render the in-progress state for display.
    ///
    /// Deltas that have not carried a role yet render as assistant output.
    #[must_use]
    pub fn snapshot(&self) -> Message {
        self.to_message(self.role.unwrap_or(Role::Assistant))
    }

    fn to_message(&self, role: Role) -> Message {
        Message {
            role,
            id: self.id.clone(),
            thinking: self.thinking.clone(),
            contents: self.contents.clone(),
            tool_calls: self.tool_calls.clone(),
        }
    }
}

/// Fold `delta` into `prior`.
///
/// With no prior state the delta becomes the initial state.
///
/// # Errors
///
/// Returns a [`ProtocolError`] if the delta conflicts with `prior`.
pub fn accumulate(
    prior: Option<AccumulatedState>,
    delta: MessageDelta,
) -> Result<AccumulatedState, ProtocolError> {
    let mut state = prior.unwrap_or_default();
    state.apply(delta)?;
    Ok(state)
}

/// Finalize an accumulated state into a [`Message`].
///
/// # Errors
///
/// Returns [`ProtocolError::MissingRole`] if no delta carried a role.
pub fn finalize(state: &AccumulatedState) -> Result<Message, ProtocolError> {
    state.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn text(s: &str) -> MessageDelta {
        MessageDelta {
            contents: vec![PartDelta::text(s)],
            ..MessageDelta::default()
        }
    }

    fn call(id: Option<&str>, name: Option<&str>, arguments: &str) -> MessageDelta {
        MessageDelta {
            tool_calls: vec![PartDelta::Function {
                id: id.map(str::to_string),
                name: name.map(str::to_string),
                arguments: arguments.to_string(),
            }],
            ..MessageDelta::default()
        }
    }

    fn fold(deltas: Vec<MessageDelta>) -> AccumulatedState {
        deltas
            .into_iter()
            .try_fold(None, |acc, d| accumulate(acc, d).map(Some))
            .unwrap()
            .unwrap()
    }

    #[test]
    fn text_concatenates_in_arrival_order() {
        let mut first = text("Hel");
        first.role = Some(Role::Assistant);
        let state = fold(vec![first.clone(), text("lo, "), text("world")]);
        assert_eq!(finalize(&state).unwrap().text(), "Hello, world");

        let shuffled = fold(vec![first, text("world"), text("lo, ")]);
        assert_ne!(finalize(&shuffled).unwrap().text(), "Hello, world");
    }

    #[test]
    fn finalize_is_pure() {
        let state = fold(vec![MessageDelta::text(Role::Assistant, "hi"), text("!")]);
        let a = finalize(&state).unwrap();
        let b = finalize(&state).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, Message::assistant("hi!"));
    }

    #[test]
    fn role_mismatch_leaves_state_untouched() {
        let mut state = fold(vec![MessageDelta::text(Role::Assistant, "partial")]);
        let before = state.clone();

        let err = state
            .apply(MessageDelta::text(Role::User, "intruder"))
            .unwrap_err();

        assert_eq!(
            err,
            ProtocolError::RoleMismatch {
                expected: Role::Assistant,
                got: Role::User
            }
        );
        assert_eq!(state, before);
    }

    #[test]
    fn role_may_arrive_late_but_is_required_to_finalize() {
        let state = fold(vec![text("x")]);
        assert_eq!(finalize(&state), Err(ProtocolError::MissingRole));
        assert_eq!(state.snapshot().role, Role::Assistant);

        let state = accumulate(
            Some(state),
            MessageDelta {
                role: Some(Role::Assistant),
                ..MessageDelta::default()
            },
        )
        .unwrap();
        assert_eq!(finalize(&state).unwrap().text(), "x");
    }

    #[test]
    fn kind_change_starts_new_part() {
        let state = fold(vec![
            MessageDelta::text(Role::Assistant, "before"),
            MessageDelta {
                contents: vec![PartDelta::Image { data: vec![7] }],
                ..MessageDelta::default()
            },
            text("after"),
            text(" more"),
        ]);
        assert_eq!(
            state.contents(),
            &[
                Part::text("before"),
                Part::image(vec![7]),
                Part::text("after more"),
            ]
        );
    }

    #[test]
    fn tool_call_fragments_merge_by_id() {
        let state = fold(vec![
            MessageDelta {
                role: Some(Role::Assistant),
                ..call(Some("call_1"), Some("web_search"), "{\"que")
            },
            call(None, None, "ry\":\"rust\"}"),
            call(Some("call_2"), Some("web_fetch"), "{}"),
        ]);
        assert_eq!(
            state.tool_calls(),
            &[
                Part::Function {
                    id: Some("call_1".into()),
                    name: "web_search".into(),
                    arguments: "{\"query\":\"rust\"}".into(),
                },
                Part::Function {
                    id: Some("call_2".into()),
                    name: "web_fetch".into(),
                    arguments: "{}".into(),
                },
            ]
        );
    }

    #[test]
    fn idless_fragments_extend_idless_call() {
        let state = fold(vec![
            call(None, Some("web_fetch"), "{\"url\":"),
            call(None, None, "\"https://a\"}"),
            call(Some("call_9"), Some("web_search"), "{}"),
        ]);
        assert_eq!(
            state.tool_calls(),
            &[
                Part::Function {
                    id: None,
                    name: "web_fetch".into(),
                    arguments: "{\"url\":\"https://a\"}".into(),
                },
                Part::Function {
                    id: Some("call_9".into()),
                    name: "web_search".into(),
                    arguments: "{}".into(),
                },
            ]
        );
    }

    #[test]
    fn misplaced_parts_are_rejected() {
        let mut state = AccumulatedState::new();
        let err = state
            .apply(MessageDelta {
                contents: vec![PartDelta::Function {
                    id: None,
                    name: Some("x".into()),
                    arguments: String::new(),
                }],
                ..MessageDelta::default()
            })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedPart { field: "contents", .. }));
        assert_eq!(state, AccumulatedState::new());
    }

    #[test]
    fn thinking_and_tool_id_accumulate() {
        let state = fold(vec![
            MessageDelta {
                role: Some(Role::Tool),
                id: Some("call_1".into()),
                thinking: Some("hmm".into()),
                ..MessageDelta::default()
            },
            MessageDelta {
                thinking: Some(" ok".into()),
                ..text("result")
            },
        ]);
        let msg = finalize(&state).unwrap();
        assert_eq!(msg.thinking.as_deref(), Some("hmm ok"));
        assert_eq!(msg.id.as_deref(), Some("call_1"));

        let mut state = state;
        let err = state
            .apply(MessageDelta {
                id: Some("call_2".into()),
                ..MessageDelta::default()
            })
            .unwrap_err();
        assert!(matches!(err, ProtocolError::IdMismatch { .. }));
    }
}
