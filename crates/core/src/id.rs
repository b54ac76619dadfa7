use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier shared by every addressable BDI entity: goals, intentions,
/// coroutine tasks, agents and protocol events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueId(Uuid);

impl UniqueId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn valid(&self) -> bool {
        !self.0.is_nil()
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for UniqueId {
    fn default() -> Self {
        Self::nil()
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IntentionId(pub Uuid);

impl IntentionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for IntentionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for IntentionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "intention:{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

/// Handle to a goal instance. Two handles refer to the same desire when
/// their ids match; the name is carried for readability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalHandle {
    pub name: String,
    pub id: UniqueId,
}

impl GoalHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: UniqueId::random(),
        }
    }

    pub fn with_id(name: impl Into<String>, id: UniqueId) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

impl PartialEq for GoalHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for GoalHandle {}

impl std::hash::Hash for GoalHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for GoalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Handle to an agent or team living on some engine node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHandle {
    pub name: String,
    pub id: UniqueId,
}

impl AgentHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: UniqueId::random(),
        }
    }

    pub fn with_id(name: impl Into<String>, id: UniqueId) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

impl PartialEq for AgentHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for AgentHandle {}

impl std::hash::Hash for AgentHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for AgentHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Handle to a service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHandle {
    pub name: String,
    pub id: UniqueId,
}

impl ServiceHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: UniqueId::random(),
        }
    }
}

impl PartialEq for ServiceHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ServiceHandle {}

impl std::hash::Hash for ServiceHandle {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for ServiceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_ids_differ() {
        assert_ne!(UniqueId::random(), UniqueId::random());
        assert!(!UniqueId::nil().valid());
        assert!(UniqueId::random().valid());
    }

    #[test]
    fn goal_handles_compare_by_id() {
        let id = UniqueId::random();
        let a = GoalHandle::with_id("Deliver", id);
        let b = GoalHandle::with_id("DifferentName", id);
        assert_eq!(a, b);
        assert_ne!(a, GoalHandle::new("Deliver"));
    }

    #[test]
    fn unique_id_parse_round_trip() {
        let id = UniqueId::random();
        let parsed = UniqueId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }
}
