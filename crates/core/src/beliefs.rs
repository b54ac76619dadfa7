use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::field::FieldType;
use crate::id::AgentHandle;
use crate::message::Message;

/// A countable resource with hard bounds. A resource is violated when its
/// count leaves `[min, max]`. Locks are reference counted and re-entrant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    pub min: i64,
    pub max: i64,
    pub count: i64,
    locks: u32,
}

impl Resource {
    pub fn new(name: impl Into<String>, min: i64, max: i64) -> Self {
        let max = max.max(min);
        Self {
            name: name.into(),
            min,
            max,
            count: max,
            locks: 0,
        }
    }

    pub fn violated(&self) -> bool {
        self.count < self.min || self.count > self.max
    }

    pub fn locked(&self) -> bool {
        self.locks > 0
    }

    pub fn lock_count(&self) -> u32 {
        self.locks
    }

    fn lock(&mut self) {
        self.locks += 1;
        self.count -= 1;
    }

    fn unlock(&mut self) {
        if self.locks == 0 {
            tracing::warn!(resource = %self.name, "Unlock without matching lock");
            return;
        }
        self.locks -= 1;
        self.count += 1;
    }
}

/// The agent's world model: named messages, resources, and the layered
/// goal/agent overlay consulted during predicate evaluation so that goal
/// parameters shadow beliefs.
#[derive(Debug, Clone, Default)]
pub struct BeliefContext {
    messages: BTreeMap<String, Message>,
    resources: BTreeMap<String, Resource>,
    /// Replies from completed actions, visible to subsequent tasks of the
    /// owning intention. Most recent reply is consulted first.
    action_replies: Vec<Message>,
    /// The current goal's parameter message, layered over beliefs.
    goal_overlay: Option<Message>,
    /// The agent evaluating queries against this context.
    agent: Option<AgentHandle>,
}

impl BeliefContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exact-name message lookup in the backing store.
    pub fn message(&self, name: &str) -> Option<&Message> {
        self.messages.get(name)
    }

    pub fn message_mut(&mut self, name: &str) -> Option<&mut Message> {
        self.messages.get_mut(name)
    }

    pub fn message_names(&self) -> impl Iterator<Item = &String> {
        self.messages.keys()
    }

    /// Install or replace a named belief message. The message is value
    /// copied; later mutation of the caller's copy is not observed.
    pub fn set_message(&mut self, name: impl Into<String>, msg: Message) {
        self.messages.insert(name.into(), msg);
    }

    pub fn remove_message(&mut self, name: &str) -> Option<Message> {
        self.messages.remove(name)
    }

    /// Field lookup across the layered context: the goal overlay first,
    /// then action replies (most recent first), then belief messages.
    pub fn get<T: FieldType>(&self, field: &str) -> Option<T> {
        if let Some(goal) = &self.goal_overlay {
            if let Some(v) = goal.get::<T>(field) {
                return Some(v);
            }
        }
        for reply in self.action_replies.iter().rev() {
            if let Some(v) = reply.get::<T>(field) {
                return Some(v);
            }
        }
        self.messages.values().find_map(|msg| msg.get::<T>(field))
    }

    /// Write a single field into the named belief message, creating the
    /// message if absent.
    pub fn set_fact<T: FieldType>(&mut self, message: &str, field: impl Into<String>, value: T) {
        self.set_fact_value(message, field, value.into_value());
    }

    /// Untyped variant of [`BeliefContext::set_fact`], used by percept
    /// ingress where the value arrives already boxed.
    pub fn set_fact_value(
        &mut self,
        message: &str,
        field: impl Into<String>,
        value: crate::field::Value,
    ) {
        self.messages
            .entry(message.to_string())
            .or_insert_with(|| Message::new(message.to_string()))
            .set_value(field.into(), value);
    }

    /// Untyped variant of [`BeliefContext::get`], same layering rules.
    pub fn get_value(&self, field: &str) -> Option<crate::field::Value> {
        if let Some(goal) = &self.goal_overlay {
            if let Some(v) = goal.field(field) {
                return Some(v.clone());
            }
        }
        for reply in self.action_replies.iter().rev() {
            if let Some(v) = reply.field(field) {
                return Some(v.clone());
            }
        }
        self.messages
            .values()
            .find_map(|msg| msg.field(field).cloned())
    }

    pub fn add_action_reply(&mut self, reply: Message) {
        self.action_replies.push(reply);
    }

    pub fn action_replies(&self) -> &[Message] {
        &self.action_replies
    }

    pub fn set_action_replies(&mut self, replies: Vec<Message>) {
        self.action_replies = replies;
    }

    pub fn take_action_replies(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.action_replies)
    }

    pub fn clear_action_replies(&mut self) {
        self.action_replies.clear();
    }

    pub fn set_goal_context(&mut self, goal_msg: Option<Message>) {
        self.goal_overlay = goal_msg;
    }

    pub fn goal_context(&self) -> Option<&Message> {
        self.goal_overlay.as_ref()
    }

    pub fn set_agent_context(&mut self, agent: AgentHandle) {
        self.agent = Some(agent);
    }

    pub fn agent(&self) -> Option<&AgentHandle> {
        self.agent.as_ref()
    }

    pub fn add_resource(&mut self, resource: Resource) {
        self.resources.insert(resource.name.clone(), resource);
    }

    pub fn resource(&self, name: &str) -> Option<&Resource> {
        self.resources.get(name)
    }

    /// Re-entrant lock of the named resources. Unknown names are ignored
    /// with a warning so a missing resource commit cannot wedge execution.
    pub fn lock_resources(&mut self, names: &[String]) {
        for name in names {
            match self.resources.get_mut(name) {
                Some(res) => res.lock(),
                None => tracing::warn!(resource = %name, "Locking unknown resource"),
            }
        }
    }

    pub fn unlock_resources(&mut self, names: &[String]) {
        for name in names {
            if let Some(res) = self.resources.get_mut(name) {
                res.unlock();
            }
        }
    }

    /// Collect the names of violated resources; true when any exist.
    pub fn has_resource_violation(&self, violated: &mut Vec<String>) -> bool {
        violated.clear();
        for res in self.resources.values() {
            if res.violated() {
                violated.push(res.name.clone());
            }
        }
        !violated.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_shadows_beliefs() {
        let mut ctx = BeliefContext::new();
        ctx.set_fact("State", "count", 3u32);
        assert_eq!(ctx.get::<u32>("count"), Some(3));

        let mut goal = Message::new("Params");
        goal.set("count", 9u32);
        ctx.set_goal_context(Some(goal));
        assert_eq!(ctx.get::<u32>("count"), Some(9));

        ctx.set_goal_context(None);
        assert_eq!(ctx.get::<u32>("count"), Some(3));
    }

    #[test]
    fn action_replies_consulted_before_beliefs() {
        let mut ctx = BeliefContext::new();
        ctx.set_fact("State", "number", 1i32);
        let mut reply = Message::new("Reply");
        reply.set("number", 5i32);
        ctx.add_action_reply(reply);
        assert_eq!(ctx.get::<i32>("number"), Some(5));
    }

    #[test]
    fn resource_locks_are_reentrant_and_count_matched() {
        let mut ctx = BeliefContext::new();
        ctx.add_resource(Resource::new("BatteryLock", 0, 1));
        let locks = vec!["BatteryLock".to_string()];

        ctx.lock_resources(&locks);
        ctx.lock_resources(&locks);
        let mut violated = Vec::new();
        assert!(ctx.has_resource_violation(&mut violated));
        assert_eq!(violated, vec!["BatteryLock".to_string()]);

        ctx.unlock_resources(&locks);
        assert!(ctx.has_resource_violation(&mut violated));
        ctx.unlock_resources(&locks);
        assert!(!ctx.has_resource_violation(&mut violated));
        assert_eq!(ctx.resource("BatteryLock").unwrap().lock_count(), 0);
    }
}
