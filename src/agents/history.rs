// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Bounded conversation history for process-backed agents.
//!
//! CLIs without a native session receive the whole exchange as a transcript on
//! every turn, so both the number of entries and the size of each entry are
//! capped.

use std::collections::VecDeque;

use super::types::{HistoryEntry, HistoryRole};

/// Rolling transcript with per-entry condensation.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    entries: VecDeque<HistoryEntry>,
    max_entries: usize,
    max_entry_chars: usize,
}

impl ConversationHistory {
    pub fn new(max_entries: usize, max_entry_chars: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: max_entries.max(1),
            max_entry_chars,
        }
    }

    /// Seed from prior entries, keeping only the newest ones that fit.
    pub fn seeded(max_entries: usize, max_entry_chars: usize, initial: &[HistoryEntry]) -> Self {
        let mut history = Self::new(max_entries, max_entry_chars);
        for entry in initial {
            history.push(entry.role, &entry.text);
        }
        history
    }

    /// Append an entry, condensing it and evicting the oldest beyond the cap.
    pub fn push(&mut self, role: HistoryRole, text: &str) {
        let text = condense(text, self.max_entry_chars);
        self.entries.push_back(HistoryEntry { role, text });
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    pub fn push_user(&mut self, text: &str) {
        self.push(HistoryRole::User, text);
    }

    pub fn push_assistant(&mut self, text: &str) {
        if !text.trim().is_empty() {
            self.push(HistoryRole::Assistant, text);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Render as a plain-text transcript ending with an open assistant turn.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        if self.entries.len() > 1 {
            out.push_str("Continue this conversation. Earlier turns are included for context.\n\n");
        }
        for entry in &self.entries {
            let label = match entry.role {
                HistoryRole::User => "User",
                HistoryRole::Assistant => "Assistant",
            };
            out.push_str(label);
            out.push_str(":\n");
            out.push_str(&entry.text);
            out.push_str("\n\n");
        }
        out.push_str("Assistant:\n");
        out
    }
}

/// Shorten `text` to head + elision marker + tail when over `max_chars`.
pub fn condense(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if max_chars == 0 || total <= max_chars {
        return text.to_string();
    }

    let head_len = max_chars / 2;
    let tail_len = max_chars - head_len;
    let elided = total - head_len - tail_len;

    let head: String = text.chars().take(head_len).collect();
    let tail: String = text.chars().skip(total - tail_len).collect();
    format!("{}\n…[{} chars elided]…\n{}", head, elided, tail)
}
