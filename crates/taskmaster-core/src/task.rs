use std::fmt;

use serde::{Deserialize, Serialize};
use taskmaster_shared::TaskRecord;
use uuid::Uuid;

/// Store-assigned task key. The client never mints one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub(crate) fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub text: String,
    pub completed: bool,
}

impl Task {
    pub fn new(id: impl Into<String>, text: impl Into<String>, completed: bool) -> Self {
        Self {
            id: TaskId::new(id),
            text: text.into(),
            completed,
        }
    }
}

impl From<TaskRecord> for Task {
    fn from(record: TaskRecord) -> Self {
        Self {
            id: TaskId(record.id),
            text: record.document.text,
            completed: record.document.completed,
        }
    }
}

/// Authenticated user handle. Read-only for everything but the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

impl Identity {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            display_name: None,
            email: None,
        }
    }

    /// Short label for headers: display name, else email, else uid.
    pub fn label(&self) -> &str {
        self.display_name
            .as_deref()
            .or(self.email.as_deref())
            .unwrap_or(&self.uid)
    }
}

/// Whether `text` is acceptable as a new task.
pub fn is_submittable(text: &str) -> bool {
    !text.trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::{Identity, Task, TaskId, is_submittable};
    use taskmaster_shared::{TaskDocument, TaskRecord};

    #[test]
    fn blank_text_is_not_submittable() {
        assert!(!is_submittable(""));
        assert!(!is_submittable("   "));
        assert!(!is_submittable("\t\n"));
        assert!(is_submittable(" buy milk "));
    }

    #[test]
    fn record_conversion_keeps_every_field() {
        let record = TaskRecord {
            id: "a".to_string(),
            document: TaskDocument {
                text: "x".to_string(),
                completed: true,
            },
        };
        assert_eq!(Task::from(record), Task::new("a", "x", true));
    }

    #[test]
    fn generated_ids_are_distinct() {
        assert_ne!(TaskId::generate(), TaskId::generate());
    }

    #[test]
    fn label_prefers_display_name() {
        let mut identity = Identity::new("u1");
        assert_eq!(identity.label(), "u1");
        identity.email = Some("a@example.com".to_string());
        assert_eq!(identity.label(), "a@example.com");
        identity.display_name = Some("Ada".to_string());
        assert_eq!(identity.label(), "Ada");
    }
}
