//! Conversion of composer input into canonical messages.

use parley_core::{Message, Part, Role};
use serde::{Deserialize, Serialize};

use crate::error::RunPreconditionError;

/// One part of what the user typed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TurnContent {
    /// Plain text.
    Text {
        /// The text.
        text: String,
    },
    /// An inline image.
    Image {
        /// Encoded image bytes.
        data: Vec<u8>,
    },
}

/// Kind of a file attached to a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    /// An image file.
    Image,
    /// A text document.
    Document,
    /// Anything else.
    File,
}

/// A file attached to a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// File name.
    pub name: String,
    /// File kind.
    pub kind: AttachmentKind,
    /// File bytes.
    pub data: Vec<u8>,
}

/// A turn submitted by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendMessage {
    /// Composer content; the first part must be text.
    pub content: Vec<TurnContent>,
    /// Attached files.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl AppendMessage {
    /// A text-only turn.
    #[must_use]
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![TurnContent::Text { text: text.into() }],
            attachments: Vec::new(),
        }
    }

    /// Attach an image.
    #[must_use]
    pub fn with_image(mut self, name: impl Into<String>, data: Vec<u8>) -> Self {
        self.attachments.push(Attachment {
            name: name.into(),
            kind: AttachmentKind::Image,
            data,
        });
        self
    }

    /// Convert into a user message: image attachments first, then the text.
    ///
    /// Non-image attachments are dropped.
    ///
    /// # Errors
    ///
    /// Returns `RunPreconditionError::UnsupportedContent` unless the first
    /// content part is text.
    pub fn into_message(self) -> Result<Message, RunPreconditionError> {
        let text = match self.content.into_iter().next() {
            Some(TurnContent::Text { text }) => text,
            Some(TurnContent::Image { .. }) => {
                return Err(RunPreconditionError::UnsupportedContent(
                    "only text messages are supported".to_string(),
                ))
            }
            None => {
                return Err(RunPreconditionError::UnsupportedContent(
                    "message has no content".to_string(),
                ))
            }
        };

        let mut contents = Vec::with_capacity(self.attachments.len() + 1);
        for attachment in self.attachments {
            if attachment.kind == AttachmentKind::Image {
                contents.push(Part::image(attachment.data));
            } else {
                tracing::debug!(
                    name = %attachment.name,
                    kind = ?attachment.kind,
                    "Dropping non-image attachment"
                );
            }
        }
        contents.push(Part::text(text));

        Ok(Message::new(Role::User, contents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn images_come_before_text() {
        let mut turn = AppendMessage::text("what is this?").with_image("cat.png", vec![1, 2, 3]);
        turn.attachments.push(Attachment {
            name: "notes.txt".into(),
            kind: AttachmentKind::Document,
            data: b"notes".to_vec(),
        });

        let message = turn.into_message().unwrap();
        assert_eq!(message.role, Role::User);
        assert_eq!(
            message.contents,
            vec![Part::image(vec![1, 2, 3]), Part::text("what is this?")]
        );
    }

    #[test]
    fn first_part_must_be_text() {
        let turn = AppendMessage {
            content: vec![TurnContent::Image { data: vec![0] }],
            attachments: Vec::new(),
        };
        assert!(matches!(
            turn.into_message(),
            Err(RunPreconditionError::UnsupportedContent(_))
        ));
        assert!(AppendMessage::default().into_message().is_err());
    }
}
