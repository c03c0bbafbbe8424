//! Notifications for the toast surface, with the undo/retry actions it wires
//! back into the client.

use shared::domain::Collection;

use crate::journal::OpId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationLevel {
    Success,
    Error,
}

/// What a failed or undoable operation can be re-driven with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryTarget {
    Reorder(OpId),
    Delete { collection: Collection, id: String },
    Undo { collection: Collection, id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationAction {
    Undo { collection: Collection, id: String },
    Retry(RetryTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub action: Option<NotificationAction>,
}

impl Notification {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Success,
            message: message.into(),
            action: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Error,
            message: message.into(),
            action: None,
        }
    }

    pub fn with_action(mut self, action: NotificationAction) -> Self {
        self.action = Some(action);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Notification(Notification),
    /// An optimistic write was reverted to its pre-image.
    RolledBack { collection: Collection, op: OpId },
    /// A failed optimistic write had already been superseded; the slice was
    /// refetched instead of rolled back.
    Resynced { collection: Collection, op: OpId },
}
