//! Identifier newtypes shared across the broker and the agent runtime.
//!
//! Uuid-backed ids get a `generate()` constructor; string-backed ids are
//! validated at the boundary so a bare `String` never crosses into the
//! domain layer.

use nutype::nutype;
use uuid::Uuid;

/// Unique identifier for a task.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct TaskId(Uuid);

impl TaskId {
    /// Creates a new random task ID.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }

    /// Last eight hex characters, used to disambiguate task-scoped files.
    #[must_use]
    pub fn short(&self) -> String {
        let s = self.into_inner().simple().to_string();
        s[s.len() - 8..].to_string()
    }
}

/// Unique identifier for a project (channel ↔ workspace binding).
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct ProjectId(Uuid);

impl ProjectId {
    /// Creates a new random project ID.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Correlation id for deploy and path-validate round-trips.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct RequestId(Uuid);

impl RequestId {
    /// Creates a new random request ID.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Unique identifier for a sync workflow.
#[nutype(derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    From,
    Into
))]
pub struct WorkflowId(Uuid);

impl WorkflowId {
    /// Creates a new random workflow ID.
    #[must_use]
    pub fn generate() -> Self {
        Self::new(Uuid::new_v4())
    }
}

/// Agent identifier: a human-assigned name bound to one worker host.
///
/// The dispatch sentinel `auto` is *not* an agent id; it is modeled by
/// [`crate::domain::AgentSelector`].
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef,
        Deref
    )
)]
pub struct AgentId(String);

impl AgentId {
    /// Borrow the id as a plain string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self
    }
}

/// Named capability bundle selected by the user's command.
#[nutype(
    sanitize(trim, lowercase),
    validate(len_char_min = 1, len_char_max = 32),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef,
        Deref
    )
)]
pub struct BotName(String);

impl BotName {
    /// Borrow the name as a plain string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self
    }
}

/// Chat channel identifier as issued by the workspace.
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef,
        Deref
    )
)]
pub struct ChannelId(String);

impl ChannelId {
    /// Borrow the id as a plain string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self
    }
}

/// Chat user identifier as issued by the workspace.
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 64),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        Serialize,
        Deserialize,
        Display,
        TryFrom,
        Into,
        AsRef,
        Deref
    )
)]
pub struct ChatUserId(String);

impl ChatUserId {
    /// Borrow the id as a plain string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self
    }
}
