use serde::{
  Deserialize,
  Serialize
};

pub const USERS_COLLECTION: &str =
  "users";
pub const TASKS_COLLECTION: &str =
  "tasks";

/// Path of the profile document for
/// `uid`.
pub fn profile_path(
  uid: &str
) -> String {
  format!("{USERS_COLLECTION}/{uid}")
}

/// Path of the task collection owned
/// by `uid`.
pub fn tasks_path(uid: &str) -> String {
  format!(
    "{USERS_COLLECTION}/{uid}/\
     {TASKS_COLLECTION}"
  )
}

/// Body of a task document as the
/// store keeps it. The id is the
/// document key, not a field.
#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
pub struct TaskDocument {
  pub text:      String,
  #[serde(default)]
  pub completed: bool
}

impl TaskDocument {
  pub fn new(text: String) -> Self {
    Self {
      text,
      completed: false
    }
  }
}

/// Merge payload for a completion
/// toggle. Carries the one field it
/// writes and nothing else.
#[derive(
  Debug,
  Clone,
  Copy,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
pub struct TaskCompletionPatch {
  pub completed: bool
}

/// One entry of a collection
/// snapshot.
#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
)]
pub struct TaskRecord {
  pub id:       String,
  #[serde(flatten)]
  pub document: TaskDocument
}

/// Merge payload written to
/// `users/<uid>` on sign-in.
#[derive(
  Debug,
  Clone,
  Serialize,
  Deserialize,
  PartialEq,
  Eq,
  Default,
)]
pub struct ProfilePatch {
  pub name:  Option<String>,
  pub email: Option<String>
}
