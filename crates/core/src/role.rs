use serde::{Deserialize, Serialize};

/// Read/write permissions for one shared belief set between a team and a
/// member holding the role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeliefSetAccess {
    /// The message schema shared through this channel.
    pub name: String,
    pub read: bool,
    pub write: bool,
}

/// A named capability grouping. Teams use roles to decide which members
/// may receive a delegated goal and which belief sets flow between member
/// and team.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub goals: Vec<String>,
    pub belief_sets: Vec<BeliefSetAccess>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            goals: Vec::new(),
            belief_sets: Vec::new(),
        }
    }

    pub fn handles_goal(&self, goal: &str) -> bool {
        self.goals.iter().any(|g| g == goal)
    }

    pub fn can_write(&self, belief_set: &str) -> bool {
        self.belief_sets
            .iter()
            .any(|b| b.name == belief_set && b.write)
    }

    pub fn can_read(&self, belief_set: &str) -> bool {
        self.belief_sets
            .iter()
            .any(|b| b.name == belief_set && b.read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_access_checks() {
        let mut role = Role::new("Courier");
        role.goals.push("Deliver".into());
        role.belief_sets.push(BeliefSetAccess {
            name: "Position".into(),
            read: true,
            write: false,
        });
        assert!(role.handles_goal("Deliver"));
        assert!(!role.handles_goal("Clean"));
        assert!(role.can_read("Position"));
        assert!(!role.can_write("Position"));
    }
}
