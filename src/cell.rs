//! The cell model: immutable prose cells and stateful executable cells.

use crate::hash::Hash;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A tagged variant: prose or executable code. Dispatch on the tag rather
/// than an open class hierarchy.
#[derive(Debug, Clone)]
pub enum Cell {
    Text(TextCell),
    Code(CodeCell),
}

impl Cell {
    /// Content-addressed identity of this cell.
    pub fn hash(&self) -> Hash {
        match self {
            Cell::Text(t) => t.hash,
            Cell::Code(c) => c.hash,
        }
    }

    pub fn as_code(&self) -> Option<&CodeCell> {
        match self {
            Cell::Code(c) => Some(c),
            Cell::Text(_) => None,
        }
    }

    pub fn as_code_mut(&mut self) -> Option<&mut CodeCell> {
        match self {
            Cell::Code(c) => Some(c),
            Cell::Text(_) => None,
        }
    }
}

/// A prose cell. Immutable after construction; its hash is its content hash.
#[derive(Debug, Clone)]
pub struct TextCell {
    pub hash: Hash,
    pub content: String,
}

impl TextCell {
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let hash = Hash::of_text(&content);
        Self { hash, content }
    }
}

/// A one-shot-per-round notification. `set_done` fires it; `reset` rearms
/// it for the next execution round. Safe to clone and await from a task
/// that does not otherwise hold a reference to the owning `Document`.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    notify: Arc<Notify>,
    fired: Arc<AtomicBool>,
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self {
            notify: Arc::new(Notify::new()),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl CompletionSignal {
    pub fn is_done(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Idempotent: firing an already-fired signal is a no-op.
    fn fire(&self) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    fn reset(&self) {
        self.fired.store(false, Ordering::Release);
    }

    /// Wait for this round's completion. Race-free against a concurrent
    /// `fire()`: the notification future is constructed before the second
    /// flag check, per `tokio::sync::Notify`'s documented pattern.
    pub async fn wait(&self) {
        if self.is_done() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_done() {
            return;
        }
        notified.await;
    }
}

/// An executable cell: author-declared flags, accumulated output, and the
/// runtime state driven by kernel messages.
#[derive(Debug, Clone)]
pub struct CodeCell {
    pub hash: Hash,
    pub code: String,
    pub flags: BTreeSet<String>,
    evaluating: bool,
    done: bool,
    pub stream: String,
    pub output: Option<BTreeMap<String, String>>,
    pub error: Option<String>,
    pub completion: CompletionSignal,
    /// Set only for a cell synthesized from a `j`-prefixed prose line. The
    /// renderer shows its rendered markdown instead of raw stream text;
    /// everything else (hashing, message handling) treats it like any
    /// other code cell.
    pub is_template: bool,
}

impl CodeCell {
    pub fn new(code: impl Into<String>, flags: BTreeSet<String>) -> Self {
        let code = code.into();
        let hash = Hash::of_code(&code);
        Self {
            hash,
            code,
            flags,
            evaluating: false,
            done: false,
            stream: String::new(),
            output: None,
            error: None,
            completion: CompletionSignal::default(),
            is_template: false,
        }
    }

    /// A synthesized cell for a `j<template>` prose line.
    pub fn new_template(code: impl Into<String>) -> Self {
        let mut cell = Self::new(code, BTreeSet::new());
        cell.is_template = true;
        cell
    }

    /// Cell equality per the content model: same hash *and* same flag set.
    pub fn equals(&self, other: &CodeCell) -> bool {
        self.hash == other.hash && self.flags == other.flags
    }

    pub fn is_evaluating(&self) -> bool {
        self.evaluating
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Begin a new execution round: clears accumulated state and rearms
    /// the completion signal.
    pub fn reset(&mut self) {
        self.evaluating = true;
        self.done = false;
        self.stream.clear();
        self.output = None;
        self.error = None;
        self.completion.reset();
    }

    /// `evaluating` and `done` are mutually exclusive; this is the only
    /// transition out of `evaluating`.
    pub fn set_done(&mut self) {
        if self.done {
            return;
        }
        self.evaluating = false;
        self.done = true;
        self.completion.fire();
    }

    /// Carriage-return overwrite semantics used by progress bars: a chunk
    /// beginning with `\r` replaces the last (possibly unterminated) line
    /// of accumulated stream text instead of appending after it.
    pub fn append_stream(&mut self, s: &str) {
        if let Some(rest) = s.strip_prefix('\r') {
            truncate_last_line(&mut self.stream);
            self.stream.push_str(rest);
        } else {
            self.stream.push_str(s);
        }
    }

    pub fn set_output(&mut self, data: BTreeMap<String, String>) {
        self.output = Some(data);
    }

    pub fn set_error(&mut self, html: String) {
        self.error = Some(html);
    }
}

/// Drop the final line (terminated or not) from `stream`, in place.
fn truncate_last_line(stream: &mut String) {
    let new_len = match stream.rfind('\n') {
        None => 0,
        Some(idx) if idx + 1 == stream.len() => {
            // stream ends with '\n': the last line is the one *ending* at
            // this newline, so look for the newline before that.
            match stream[..idx].rfind('\n') {
                None => 0,
                Some(idx2) => idx2 + 1,
            }
        }
        Some(idx) => idx + 1,
    };
    stream.truncate(new_len);
}

/// Extract a (mime, payload) pair from a `jupyter_protocol` media variant,
/// the representation used by `EXECUTE_RESULT`/`DISPLAY_DATA` content.
pub fn media_type_to_pair(mt: &jupyter_protocol::MediaType) -> (String, String) {
    use jupyter_protocol::MediaType;
    match mt {
        MediaType::Plain(s) => ("text/plain".to_string(), s.clone()),
        MediaType::Html(s) => ("text/html".to_string(), s.clone()),
        MediaType::Latex(s) => ("text/latex".to_string(), s.clone()),
        MediaType::Javascript(s) => ("application/javascript".to_string(), s.clone()),
        MediaType::Markdown(s) => ("text/markdown".to_string(), s.clone()),
        MediaType::Svg(s) => ("image/svg+xml".to_string(), s.clone()),
        MediaType::Png(s) => ("image/png".to_string(), s.clone()),
        MediaType::Jpeg(s) => ("image/jpeg".to_string(), s.clone()),
        MediaType::Json(v) => ("application/json".to_string(), v.to_string()),
        _ => ("application/octet-stream".to_string(), String::new()),
    }
}

/// Convert a `jupyter_protocol` media bundle into the MIME map `set_output` expects.
pub fn media_to_map(media: &jupyter_protocol::Media) -> BTreeMap<String, String> {
    media.content.iter().map(media_type_to_pair).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_stream_plain_concatenates() {
        let mut c = CodeCell::new("code", BTreeSet::new());
        c.append_stream("a");
        c.append_stream("b");
        assert_eq!(c.stream, "ab");
    }

    #[test]
    fn append_stream_carriage_return_overwrites_last_line() {
        let mut c = CodeCell::new("code", BTreeSet::new());
        c.append_stream("a\n");
        c.append_stream("\rb");
        assert_eq!(c.stream, "b");
    }

    #[test]
    fn append_stream_carriage_return_keeps_earlier_lines() {
        let mut c = CodeCell::new("code", BTreeSet::new());
        c.append_stream("first\nsecond");
        c.append_stream("\rthird");
        assert_eq!(c.stream, "first\nthird");
    }

    #[test]
    fn evaluating_and_done_are_mutually_exclusive() {
        let mut c = CodeCell::new("code", BTreeSet::new());
        c.reset();
        assert!(c.is_evaluating());
        assert!(!c.is_done());
        c.set_done();
        assert!(!c.is_evaluating());
        assert!(c.is_done());
    }

    #[test]
    fn set_done_is_idempotent() {
        let mut c = CodeCell::new("code", BTreeSet::new());
        c.reset();
        c.set_done();
        c.set_done();
        assert!(c.is_done());
    }

    #[tokio::test]
    async fn completion_fires_exactly_once_per_round() {
        let mut c = CodeCell::new("code", BTreeSet::new());
        c.reset();
        let signal = c.completion.clone();
        let waiter = tokio::spawn(async move {
            signal.wait().await;
        });
        c.set_done();
        waiter.await.unwrap();
        assert!(c.completion.is_done());
    }

    #[test]
    fn cell_equality_includes_flags() {
        let a = CodeCell::new("x", BTreeSet::new());
        let mut flags = BTreeSet::new();
        flags.insert("hide".to_string());
        let b = CodeCell::new("x", flags);
        assert_eq!(a.hash, b.hash);
        assert!(!a.equals(&b));
    }
}
