//! Transcript accumulation for a live conversation
//!
//! Input (user) and output (agent) transcription fragments interleave on the
//! wire. Each role gets its own in-progress buffer; a buffer becomes an
//! immutable history entry only when the remote signals turn completion, or
//! when the session ends mid-turn.

use serde::{Deserialize, Serialize};

/// Who spoke a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    User,
    Agent,
}

impl Role {
    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Agent => "Agent",
        }
    }
}

/// One committed exchange unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub text: String,
}

/// Per-role fragment buffers plus the ordered committed history
#[derive(Debug, Clone, Default)]
pub struct TranscriptAccumulator {
    user: String,
    agent: String,
    history: Vec<ConversationTurn>,
    /// Count of fragments appended (for logging)
    fragment_count: u64,
}

impl TranscriptAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffer_mut(&mut self, role: Role) -> &mut String {
        match role {
            Role::User => &mut self.user,
            Role::Agent => &mut self.agent,
        }
    }

    /// Append a fragment to the in-progress buffer for `role`
    pub fn append_fragment(&mut self, role: Role, text: &str) {
        if text.is_empty() {
            return;
        }
        self.buffer_mut(role).push_str(text);
        self.fragment_count += 1;

        if self.fragment_count % 25 == 0 {
            log::debug!(
                "Transcript: {} fragments, {} turns committed",
                self.fragment_count,
                self.history.len()
            );
        }
    }

    /// Commit the buffer for `role` as a history entry
    ///
    /// Returns false (and leaves the buffer alone) when it is blank.
    pub fn commit_turn(&mut self, role: Role) -> bool {
        let buffer = self.buffer_mut(role);
        let text = buffer.trim().to_string();
        if text.is_empty() {
            return false;
        }
        buffer.clear();
        self.history.push(ConversationTurn { role, text });
        true
    }

    /// Commit whatever is pending for both roles, user first
    pub fn flush_pending(&mut self) -> usize {
        [Role::User, Role::Agent]
            .into_iter()
            .filter(|&role| self.commit_turn(role))
            .count()
    }

    /// Committed turns as `Role: text` lines, in commit order
    pub fn render_transcript(&self) -> String {
        self.history
            .iter()
            .map(|turn| format!("{}: {}", turn.role.label(), turn.text))
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    /// In-progress (uncommitted) text for `role`
    pub fn pending(&self, role: Role) -> &str {
        match role {
            Role::User => &self.user,
            Role::Agent => &self.agent,
        }
    }

    pub fn fragment_count(&self) -> u64 {
        self.fragment_count
    }

    pub fn reset(&mut self) {
        self.user.clear();
        self.agent.clear();
        self.history.clear();
        self.fragment_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_commit_in_order() {
        let mut acc = TranscriptAccumulator::new();
        acc.append_fragment(Role::User, "Na");
        acc.append_fragment(Role::User, "maste");
        assert!(acc.commit_turn(Role::User));
        acc.append_fragment(Role::Agent, "Hi");
        assert!(acc.commit_turn(Role::Agent));

        assert_eq!(acc.render_transcript(), "User: Namaste\nAgent: Hi");
    }

    #[test]
    fn interleaved_roles_keep_separate_buffers() {
        let mut acc = TranscriptAccumulator::new();
        acc.append_fragment(Role::User, "Loan ");
        acc.append_fragment(Role::Agent, "Ji, ");
        acc.append_fragment(Role::User, "chahiye");
        acc.append_fragment(Role::Agent, "bataiye");

        assert_eq!(acc.pending(Role::User), "Loan chahiye");
        assert_eq!(acc.pending(Role::Agent), "Ji, bataiye");
    }

    #[test]
    fn commit_of_blank_buffer_is_noop() {
        let mut acc = TranscriptAccumulator::new();
        assert!(!acc.commit_turn(Role::Agent));

        acc.append_fragment(Role::Agent, "   ");
        assert!(!acc.commit_turn(Role::Agent));
        assert!(acc.history().is_empty());
        assert_eq!(acc.render_transcript(), "");
    }

    #[test]
    fn commit_trims_and_clears() {
        let mut acc = TranscriptAccumulator::new();
        acc.append_fragment(Role::User, "  hello there ");
        acc.commit_turn(Role::User);

        assert_eq!(acc.history()[0].text, "hello there");
        assert_eq!(acc.pending(Role::User), "");
    }

    #[test]
    fn flush_commits_both_roles_once() {
        let mut acc = TranscriptAccumulator::new();
        acc.append_fragment(Role::Agent, "Okay");
        acc.append_fragment(Role::User, "Bye");

        assert_eq!(acc.flush_pending(), 2);
        assert_eq!(acc.render_transcript(), "User: Bye\nAgent: Okay");

        // Nothing left to flush
        assert_eq!(acc.flush_pending(), 0);
        assert_eq!(acc.history().len(), 2);
    }

    #[test]
    fn empty_fragments_are_not_counted() {
        let mut acc = TranscriptAccumulator::new();
        acc.append_fragment(Role::User, "");
        acc.append_fragment(Role::User, "a");
        assert_eq!(acc.fragment_count(), 1);
    }

    #[test]
    fn reset_clears_everything() {
        let mut acc = TranscriptAccumulator::new();
        acc.append_fragment(Role::User, "x");
        acc.commit_turn(Role::User);
        acc.append_fragment(Role::Agent, "y");

        acc.reset();

        assert!(acc.history().is_empty());
        assert_eq!(acc.pending(Role::Agent), "");
        assert_eq!(acc.fragment_count(), 0);
    }
}
