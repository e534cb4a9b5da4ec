//! Event type tags and typed event encoding.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Type tags of the business events the project-management service emits.
pub mod event_types {
    pub const PROJECT_CREATED: &str = "project.created";
    pub const TASK_CREATED: &str = "task.created";
    pub const TASK_UPDATED: &str = "task.updated";
    pub const TASK_ASSIGNED: &str = "task.assigned";
    pub const SPRINT_STARTED: &str = "sprint.started";
    pub const SPRINT_COMPLETED: &str = "sprint.completed";
    pub const RELEASE_PUBLISHED: &str = "release.published";
    pub const COMMENT_ADDED: &str = "comment.added";

    /// Every built-in tag, in the order above.
    pub const ALL: &[&str] = &[
        PROJECT_CREATED,
        TASK_CREATED,
        TASK_UPDATED,
        TASK_ASSIGNED,
        SPRINT_STARTED,
        SPRINT_COMPLETED,
        RELEASE_PUBLISHED,
        COMMENT_ADDED,
    ];
}

/// A payload schema bound to one event type tag.
///
/// Payloads are encoded as JSON. The tag is what the worker uses to select
/// handlers, so it must be stable across releases.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct TaskAssigned { task_id: String, assignee_id: String }
///
/// impl DomainEvent for TaskAssigned {
///     const EVENT_TYPE: &'static str = event_types::TASK_ASSIGNED;
/// }
/// ```
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;

    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}
