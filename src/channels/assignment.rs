#![expect(
    clippy::module_name_repetitions,
    reason = "Payload types are named after the channel they arrive on"
)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::Channel;

/// Grading status of an assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
#[non_exhaustive]
pub enum AssignmentStatus {
    /// Not submitted yet
    Todo,
    /// Submitted and waiting on the grader
    Grading,
    /// Graded as failed
    Incompleted,
    /// Graded as passed
    Completed,
    /// Unknown status from the server (captures the raw value for debugging).
    #[serde(untagged)]
    Unknown(String),
}

/// Payload of the `assignment:update` channel.
///
/// Only `id` is guaranteed. Anything else the server attaches is kept in `extra`.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentUpdate {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AssignmentStatus>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Channel for AssignmentUpdate {
    const NAME: &'static str = "assignment:update";

    type Payload = Self;
}
