//! Diagnostic pipeline.
//!
//! All findings flow through a [`LineMessenger`]. Messages are interned in
//! a hash-consing table so that delayed messages can be stored, cloned and
//! compared as small integer sets inside abstract states; the messenger
//! buffers per function, keeps at most one identical message per source
//! line, and can discard a whole buffer when the refinement controller
//! restarts a run with more precision.

use indexmap::IndexSet;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

use palisade_ir::module::Loc;

/// How severe a finding is. Purely informational; the consumer decides
/// policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Severity {
    #[serde(rename = "info")]
    Info,
    #[serde(rename = "warning")]
    Warning,
    #[serde(rename = "error")]
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// One emitted finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Function the finding was reported in.
    pub function: String,
    pub file: String,
    pub line: u32,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = if self.file.is_empty() {
            "<unknown>"
        } else {
            &self.file
        };
        write!(
            f,
            "{}:{}: [{}] function {}: {}",
            file, self.line, self.severity, self.function, self.message
        )
    }
}

/// Interned message record: everything but the function name, which is a
/// property of the buffer, not of the message.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct LineRecord {
    file: String,
    line: u32,
    severity: Severity,
    message: String,
}

/// Id of an interned message. Stable for the lifetime of the messenger.
pub type MsgId = usize;

/// Buffers findings per function, interned and unique per source line.
pub struct LineMessenger {
    unique: bool,
    interner: IndexSet<LineRecord>,
    /// Message ids buffered for the current function.
    buffer: BTreeSet<MsgId>,
    /// Emission order for the non-unique mode, where duplicates matter.
    overflow: Vec<MsgId>,
    function: String,
    emitted: Vec<Diagnostic>,
}

impl LineMessenger {
    pub fn new(unique: bool) -> Self {
        LineMessenger {
            unique,
            interner: IndexSet::new(),
            buffer: BTreeSet::new(),
            overflow: Vec::new(),
            function: String::new(),
            emitted: Vec::new(),
        }
    }

    /// Flush the previous function's buffer and start a new one.
    pub fn start_function(&mut self, name: &str) {
        self.flush();
        self.function = name.to_string();
    }

    /// Intern a message without emitting it.
    pub fn intern(&mut self, severity: Severity, message: &str, loc: &Loc) -> MsgId {
        let record = LineRecord {
            file: loc.file.clone(),
            line: loc.line,
            severity,
            message: message.to_string(),
        };
        self.interner.insert_full(record).0
    }

    /// Buffer an interned message for emission at the next flush.
    pub fn emit_interned(&mut self, id: MsgId) {
        if self.unique {
            self.buffer.insert(id);
        } else {
            self.overflow.push(id);
        }
    }

    pub fn info(&mut self, message: &str, loc: &Loc) {
        let id = self.intern(Severity::Info, message, loc);
        self.emit_interned(id);
    }

    pub fn warning(&mut self, message: &str, loc: &Loc) {
        let id = self.intern(Severity::Warning, message, loc);
        self.emit_interned(id);
    }

    /// Discard everything buffered for the current function. Used when a
    /// run is restarted at higher precision: its findings may be spurious.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.overflow.clear();
    }

    /// Emit the current buffer, ordered by source position.
    pub fn flush(&mut self) {
        let mut ids: Vec<MsgId> = if self.unique {
            std::mem::take(&mut self.buffer).into_iter().collect()
        } else {
            std::mem::take(&mut self.overflow)
        };
        if self.unique {
            ids.sort_by(|a, b| self.interner[*a].cmp(&self.interner[*b]));
        }
        for id in ids {
            let record = &self.interner[id];
            self.emitted.push(Diagnostic {
                severity: record.severity,
                function: self.function.clone(),
                file: record.file.clone(),
                line: record.line,
                message: record.message.clone(),
            });
        }
    }

    /// Flush and hand back everything emitted so far.
    pub fn take(&mut self) -> Vec<Diagnostic> {
        self.flush();
        std::mem::take(&mut self.emitted)
    }
}

/// Delayed messages attached to one fresh variable inside an abstract
/// state.
///
/// The ids are interned in the owning [`LineMessenger`], so cloning and
/// comparing these (which happens on every state fork and every visited-set
/// lookup) touches only small integer sets. Emission happens on flush;
/// dropping the value discards the messages.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DelayedMessages {
    ids: BTreeSet<MsgId>,
}

impl DelayedMessages {
    pub fn push(&mut self, id: MsgId) {
        self.ids.insert(id);
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Emit every buffered message through the messenger.
    pub fn flush(&self, msg: &mut LineMessenger) {
        for &id in &self.ids {
            msg.emit_interned(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(line: u32) -> Loc {
        Loc {
            file: "test.c".into(),
            line,
        }
    }

    // ---------------------------------------------------------------
    // Uniqueness and ordering
    // ---------------------------------------------------------------

    #[test]
    fn duplicate_message_on_same_line_is_suppressed() {
        let mut msg = LineMessenger::new(true);
        msg.start_function("f");
        msg.info("has negative depth", &loc(10));
        msg.info("has negative depth", &loc(10));
        let out = msg.take();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message, "has negative depth");
    }

    #[test]
    fn same_message_on_different_lines_is_kept() {
        let mut msg = LineMessenger::new(true);
        msg.start_function("f");
        msg.info("has negative depth", &loc(10));
        msg.info("has negative depth", &loc(12));
        assert_eq!(msg.take().len(), 2);
    }

    #[test]
    fn flush_orders_by_source_position() {
        let mut msg = LineMessenger::new(true);
        msg.start_function("f");
        msg.info("later", &loc(20));
        msg.info("earlier", &loc(3));
        let out = msg.take();
        assert_eq!(out[0].line, 3);
        assert_eq!(out[1].line, 20);
    }

    #[test]
    fn non_unique_mode_keeps_duplicates_in_emission_order() {
        let mut msg = LineMessenger::new(false);
        msg.start_function("f");
        msg.info("m", &loc(1));
        msg.info("m", &loc(1));
        assert_eq!(msg.take().len(), 2);
    }

    // ---------------------------------------------------------------
    // Clear and per-function buffering
    // ---------------------------------------------------------------

    #[test]
    fn clear_discards_the_buffer() {
        let mut msg = LineMessenger::new(true);
        msg.start_function("f");
        msg.info("spurious", &loc(1));
        msg.clear();
        assert!(msg.take().is_empty());
    }

    #[test]
    fn start_function_flushes_previous_buffer() {
        let mut msg = LineMessenger::new(true);
        msg.start_function("f");
        msg.info("in f", &loc(1));
        msg.start_function("g");
        msg.info("in g", &loc(1));
        let out = msg.take();
        assert_eq!(out[0].function, "f");
        assert_eq!(out[1].function, "g");
    }

    // ---------------------------------------------------------------
    // Delayed messages
    // ---------------------------------------------------------------

    #[test]
    fn delayed_messages_emit_only_on_flush() {
        let mut msg = LineMessenger::new(true);
        msg.start_function("f");
        let id = msg.intern(Severity::Info, "unprotected variable x", &loc(5));
        let mut delayed = DelayedMessages::default();
        delayed.push(id);
        assert!(msg.take().is_empty());
        msg.start_function("f");
        delayed.flush(&mut msg);
        let out = msg.take();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].message, "unprotected variable x");
    }

    #[test]
    fn delayed_messages_compare_structurally() {
        let mut msg = LineMessenger::new(true);
        let a_id = msg.intern(Severity::Info, "m", &loc(5));
        let mut a = DelayedMessages::default();
        a.push(a_id);
        let mut b = DelayedMessages::default();
        b.push(a_id);
        assert_eq!(a, b);
        b.push(msg.intern(Severity::Info, "n", &loc(6)));
        assert_ne!(a, b);
    }

    #[test]
    fn interning_is_stable_for_identical_records() {
        let mut msg = LineMessenger::new(true);
        let a = msg.intern(Severity::Info, "m", &loc(5));
        let b = msg.intern(Severity::Info, "m", &loc(5));
        assert_eq!(a, b);
    }
}
