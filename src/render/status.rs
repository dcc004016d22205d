//! Status message composition.

use std::collections::VecDeque;

use crate::config::StatusWindow;

/// Contents of the single status message a run keeps up to date: a header,
/// an ordered list of recent entries and, once interim text has been
/// committed, a body.
#[derive(Debug, Clone)]
pub struct StatusBoard {
    header: String,
    window: StatusWindow,
    entries: VecDeque<String>,
    body: String,
}

impl StatusBoard {
    pub fn new(header: impl Into<String>, window: StatusWindow) -> Self {
        Self {
            header: header.into(),
            window,
            entries: VecDeque::new(),
            body: String::new(),
        }
    }

    /// Record a status label, dropping entries that fall outside the window.
    pub fn push(&mut self, label: impl Into<String>) {
        self.entries.push_back(label.into());
        match self.window {
            StatusWindow::Rolling(n) => {
                while self.entries.len() > n {
                    self.entries.pop_front();
                }
            }
            StatusWindow::Trimmed { max_chars } => {
                while self.entries.len() > 1 && self.entries_chars() > max_chars {
                    self.entries.pop_front();
                }
            }
        }
    }

    /// Commit interim text to the body.
    pub fn append_body(&mut self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        if !self.body.is_empty() {
            self.body.push_str("\n\n");
        }
        self.body.push_str(text.trim_end());
    }

    pub fn has_body(&self) -> bool {
        !self.body.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.body.clear();
    }

    /// Render the message text.
    pub fn compose(&self) -> String {
        if self.entries.is_empty() {
            return if self.body.is_empty() {
                self.header.clone()
            } else {
                self.body.clone()
            };
        }

        let mut out = self.header.clone();
        for entry in &self.entries {
            out.push_str("\n• ");
            out.push_str(entry);
        }
        if !self.body.is_empty() {
            out.push_str("\n\n");
            out.push_str(&self.body);
        }
        out
    }

    /// Body length in characters once `text` is committed.
    pub fn body_chars_after(&self, text: &str) -> usize {
        let current = self.body.chars().count();
        if text.trim().is_empty() {
            return current;
        }
        let separator = if self.body.is_empty() { 0 } else { 2 };
        current + separator + text.trim_end().chars().count()
    }

    /// Render the message text in at most `max_chars` characters.
    ///
    /// The body is never cut while it fits on its own: the oldest entries go
    /// first, then the header.
    pub fn compose_within(&self, max_chars: usize) -> String {
        let full = self.compose();
        if full.chars().count() <= max_chars {
            return full;
        }

        let body_chars = if self.body.is_empty() {
            0
        } else {
            self.body.chars().count() + 2
        };
        let mut used = self.header.chars().count() + body_chars;
        if used > max_chars {
            let fallback = if self.body.is_empty() { &self.header } else { &self.body };
            return fallback.chars().take(max_chars).collect();
        }

        let mut kept = Vec::new();
        for entry in self.entries.iter().rev() {
            let cost = entry.chars().count() + 3;
            if used + cost > max_chars {
                break;
            }
            used += cost;
            kept.push(entry.as_str());
        }

        let mut out = self.header.clone();
        for entry in kept.iter().rev() {
            out.push_str("\n• ");
            out.push_str(entry);
        }
        if !self.body.is_empty() {
            out.push_str("\n\n");
            out.push_str(&self.body);
        }
        out
    }

    fn entries_chars(&self) -> usize {
        // "\n• " prefix per entry
        self.entries.iter().map(|e| e.chars().count() + 3).sum()
    }
}
