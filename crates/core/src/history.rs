//! Chat history: the append-only conversation log.
//!
//! Insertion order is conversation order. Nothing here reorders, dedups or
//! compacts entries; trimming for storage is the host's business.

use serde::{Deserialize, Serialize};

use crate::message::Message;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatHistory {
    messages: Vec<Message>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a history with messages restored by the host.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// A copy of the log. Mutating it does not touch the history.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    #[test]
    fn append_preserves_order() {
        let mut history = ChatHistory::new();
        history.append(Message::user("one"));
        history.append(Message::assistant("two"));
        history.append(Message::user("three"));

        let contents: Vec<_> = history
            .messages()
            .iter()
            .map(|m| m.content().to_string())
            .collect();
        assert_eq!(contents, ["one", "two", "three"]);
    }

    #[test]
    fn clear_then_append_leaves_one_entry() {
        let mut history = ChatHistory::new();
        history.append(Message::user("a"));
        history.append(Message::user("b"));
        history.clear();
        assert!(history.is_empty());

        history.append(Message::user("c"));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn returned_copy_is_detached() {
        let mut history = ChatHistory::new();
        history.append(Message::user("original"));

        let mut copy = history.messages();
        copy.push(Message::assistant("injected"));
        copy.clear();

        assert_eq!(history.len(), 1);
        assert_eq!(history.last().unwrap().content(), "original");
    }

    #[test]
    fn last_returns_most_recent() {
        let mut history = ChatHistory::new();
        assert!(history.last().is_none());
        history.append(Message::user("q"));
        history.append(Message::assistant("a"));
        assert_eq!(history.last().map(Message::role), Some(Role::Assistant));
    }
}
