//! Bounded session context
//!
//! A session keeps at most `window_size` messages. When an append pushes it
//! over, the oldest excess messages are folded into a single summary entry.
//! Folding is truncation with counts: the summary remembers how many
//! messages it replaced, who wrote them, which platforms produced them, the
//! time span they covered and short excerpts of the most recent ones.
//!
//! ```text
//!  before append (window = 4):   [m1 m2 m3 m4]
//!  append m5, m6:                [m1 m2 m3 m4 m5 m6]
//!  fold:                 summary{m1,m2} + [m3 m4 m5 m6]
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MessageRole, PlatformId};

/// One message in a session's context
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    /// Arrival sequence number within the session, starting at 1
    pub seq: u64,
    /// Author role
    pub role: MessageRole,
    /// Message text
    pub content: String,
    /// Platform that produced the message (`None` for caller-supplied history)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<PlatformId>,
    /// Arrival time
    pub timestamp: DateTime<Utc>,
}

/// Synthetic entry standing in for folded messages
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSummary {
    /// Messages folded so far
    pub folded: u64,
    /// Highest sequence number folded
    pub through_seq: u64,
    /// Folded messages per role
    pub by_role: BTreeMap<MessageRole, u64>,
    /// Folded messages per platform (`caller` for caller-supplied history)
    pub by_platform: BTreeMap<String, u64>,
    /// Timestamp of the oldest folded message
    pub first_at: Option<DateTime<Utc>>,
    /// Timestamp of the newest folded message
    pub last_at: Option<DateTime<Utc>>,
    /// Short excerpts of the most recently folded messages, oldest first
    pub excerpts: Vec<String>,
}

impl ContextSummary {
    fn absorb(&mut self, message: &ContextMessage, excerpt_count: usize, excerpt_chars: usize) {
        self.folded += 1;
        self.through_seq = self.through_seq.max(message.seq);
        *self.by_role.entry(message.role).or_default() += 1;
        let source = message
            .platform
            .as_ref()
            .map_or_else(|| "caller".to_string(), ToString::to_string);
        *self.by_platform.entry(source).or_default() += 1;
        if self.first_at.is_none() {
            self.first_at = Some(message.timestamp);
        }
        self.last_at = Some(message.timestamp);

        if excerpt_count > 0 {
            self.excerpts
                .push(format!("{}: {}", message.role, excerpt(&message.content, excerpt_chars)));
            if self.excerpts.len() > excerpt_count {
                let excess = self.excerpts.len() - excerpt_count;
                self.excerpts.drain(..excess);
            }
        }
    }

    /// Render as a single transcript line block
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = format!("[summary] {} earlier messages folded", self.folded);

        let roles: Vec<String> = self.by_role.iter().map(|(r, n)| format!("{r}={n}")).collect();
        if !roles.is_empty() {
            let _ = write!(out, " (roles: {})", roles.join(", "));
        }
        let platforms: Vec<String> = self
            .by_platform
            .iter()
            .map(|(p, n)| format!("{p}={n}"))
            .collect();
        if !platforms.is_empty() {
            let _ = write!(out, " (sources: {})", platforms.join(", "));
        }
        if let (Some(first), Some(last)) = (self.first_at, self.last_at) {
            let _ = write!(out, " from {} to {}", first.to_rfc3339(), last.to_rfc3339());
        }
        for line in &self.excerpts {
            let _ = write!(out, "\n  … {line}");
        }
        out
    }
}

/// Truncate to `max` characters, marking the cut
fn excerpt(content: &str, max: usize) -> String {
    let flat: String = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        flat
    } else {
        let mut cut: String = flat.chars().take(max).collect();
        cut.push('…');
        cut
    }
}

/// Windowing parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowLimits {
    /// Maximum retained messages (summary entry not counted)
    pub window_size: usize,
    /// Excerpts kept in the summary
    pub excerpt_count: usize,
    /// Characters per excerpt
    pub excerpt_chars: usize,
}

/// A session's bounded, ordered context
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Summary of folded messages, if any were folded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ContextSummary>,
    /// Retained messages in arrival order
    pub messages: VecDeque<ContextMessage>,
    /// Sequence number of the last appended message
    #[serde(default)]
    pub last_seq: u64,
}

impl SessionContext {
    /// Retained entries, counting the summary as one
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len() + usize::from(self.summary.is_some())
    }

    /// Whether nothing has been appended yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages ever appended, folded or retained
    #[must_use]
    pub fn total_messages(&self) -> u64 {
        self.last_seq
    }

    /// Append in arrival order, then fold the oldest overflow
    pub fn append(
        &mut self,
        role: MessageRole,
        content: String,
        platform: Option<PlatformId>,
        timestamp: DateTime<Utc>,
        limits: WindowLimits,
    ) {
        self.last_seq += 1;
        self.messages.push_back(ContextMessage {
            seq: self.last_seq,
            role,
            content,
            platform,
            timestamp,
        });
        self.fold(limits);
    }

    fn fold(&mut self, limits: WindowLimits) {
        let window = limits.window_size.max(1);
        while self.messages.len() > window {
            let Some(oldest) = self.messages.pop_front() else {
                break;
            };
            self.summary
                .get_or_insert_with(ContextSummary::default)
                .absorb(&oldest, limits.excerpt_count, limits.excerpt_chars);
        }
    }

    /// Render the context as a plain-text transcript
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(summary) = &self.summary {
            out.push_str(&summary.render());
            out.push('\n');
        }
        for message in &self.messages {
            match &message.platform {
                Some(platform) => {
                    let _ = writeln!(out, "[{}@{}] {}", message.role, platform, message.content);
                }
                None => {
                    let _ = writeln!(out, "[{}] {}", message.role, message.content);
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn limits(window_size: usize) -> WindowLimits {
        WindowLimits {
            window_size,
            excerpt_count: 2,
            excerpt_chars: 8,
        }
    }

    fn push(ctx: &mut SessionContext, text: &str, platform: Option<&str>, window: usize) {
        ctx.append(
            MessageRole::User,
            text.to_string(),
            platform.map(PlatformId::from),
            Utc::now(),
            limits(window),
        );
    }

    #[test]
    fn test_appends_in_order() {
        let mut ctx = SessionContext::default();
        push(&mut ctx, "one", Some("alpha"), 10);
        push(&mut ctx, "two", Some("beta"), 10);
        let seqs: Vec<u64> = ctx.messages.iter().map(|m| m.seq).collect();
        assert_eq!(seqs, vec![1, 2]);
        assert!(ctx.summary.is_none());
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_overflow_folds_into_summary() {
        let mut ctx = SessionContext::default();
        for i in 1..=7 {
            push(&mut ctx, &format!("message {i}"), Some("alpha"), 4);
        }
        assert_eq!(ctx.messages.len(), 4);
        assert_eq!(ctx.len(), 5);
        assert_eq!(ctx.total_messages(), 7);

        let summary = ctx.summary.as_ref().unwrap();
        assert_eq!(summary.folded, 3);
        assert_eq!(summary.through_seq, 3);
        assert_eq!(summary.by_platform.get("alpha"), Some(&3));
        assert_eq!(summary.excerpts.len(), 2);
        assert_eq!(ctx.messages.front().unwrap().seq, 4);
    }

    #[test]
    fn test_caller_history_counted_as_caller() {
        let mut ctx = SessionContext::default();
        push(&mut ctx, "seed", None, 1);
        push(&mut ctx, "reply", Some("beta"), 1);
        let summary = ctx.summary.as_ref().unwrap();
        assert_eq!(summary.by_platform.get("caller"), Some(&1));
    }

    #[test]
    fn test_excerpt_truncates() {
        assert_eq!(excerpt("short", 8), "short");
        assert_eq!(excerpt("a  much\nlonger text", 8), "a much l…");
    }

    #[test]
    fn test_render_includes_summary_and_attribution() {
        let mut ctx = SessionContext::default();
        push(&mut ctx, "first", None, 2);
        push(&mut ctx, "second", Some("alpha"), 2);
        push(&mut ctx, "third", Some("beta"), 2);

        let text = ctx.render();
        assert!(text.starts_with("[summary] 1 earlier messages folded"));
        assert!(text.contains("[user@alpha] second"));
        assert!(text.contains("[user@beta] third"));
    }
}
