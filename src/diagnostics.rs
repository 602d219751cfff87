//! Finding collection and deduplication
//!
//! Findings are buffered per function as interned line records and
//! flushed in source order when the function is done; identical
//! (kind, location, text) records are emitted at most once per function
//! run. A refinement restart drops the buffer of the aborted run.
//!
//! Conditional messages live inside abstract states as sets of interned
//! record ids, so state hashing and comparison stay cheap.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Finding category; decides the output prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    /// Protection-stack balance.
    Balance,
    /// Unprotected fresh pointer.
    Unprotected,
    /// Analysis gave up (state explosion, unmodeled construct).
    Error,
}

impl Kind {
    fn prefix(self) -> &'static str {
        match self {
            Kind::Balance => "[BP]",
            Kind::Unprotected => "[UP]",
            Kind::Error => "[!]",
        }
    }
}

/// Interned message id, stable for the lifetime of a [`Reporter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MsgId(u32);

/// A conditional (delayed) message set, part of the abstract state.
pub type DelayedMessages = BTreeSet<MsgId>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LineRecord {
    pub file: String,
    pub line: u32,
    pub kind: Kind,
    pub message: String,
}

impl fmt::Display for LineRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{}: {}",
            self.kind.prefix(),
            self.file,
            self.line,
            self.message
        )
    }
}

/// An emitted finding, tagged with the function it was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub function: String,
    pub record: LineRecord,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.record)
    }
}

/// Per-module finding collector.
pub struct Reporter {
    records: Vec<LineRecord>,
    interned: HashMap<LineRecord, MsgId>,
    /// Buffer of the function currently being checked, ordered for
    /// deterministic output and deduplication.
    buffer: BTreeSet<MsgId>,
    current_function: String,
    current_file: String,
    findings: Vec<Finding>,
}

impl Reporter {
    pub fn new() -> Reporter {
        Reporter {
            records: Vec::new(),
            interned: HashMap::new(),
            buffer: BTreeSet::new(),
            current_function: String::new(),
            current_file: String::new(),
            findings: Vec::new(),
        }
    }

    /// Start buffering for a new function; flushes the previous one.
    pub fn begin_function(&mut self, function: &str, file: &str) {
        self.flush();
        self.current_function = function.to_string();
        self.current_file = file.to_string();
    }

    /// Drop everything buffered for the current function (used when a
    /// refinement restart supersedes the findings of an aborted run).
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Move the current buffer into the emitted findings, in record
    /// order.
    pub fn flush(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        let mut flushed: Vec<&LineRecord> = buffer.iter().map(|id| &self.records[id.0 as usize]).collect();
        flushed.sort();
        for record in flushed {
            self.findings.push(Finding {
                function: self.current_function.clone(),
                record: record.clone(),
            });
        }
    }

    pub fn intern(&mut self, kind: Kind, line: Option<u32>, message: String) -> MsgId {
        let record = LineRecord {
            file: self.current_file.clone(),
            line: line.unwrap_or(0),
            kind,
            message,
        };
        if let Some(id) = self.interned.get(&record) {
            return *id;
        }
        let id = MsgId(self.records.len() as u32);
        self.records.push(record.clone());
        self.interned.insert(record, id);
        id
    }

    /// Report a finding at a line; deduplicated within the function.
    pub fn info(&mut self, kind: Kind, line: Option<u32>, message: String) {
        let id = self.intern(kind, line, message);
        self.buffer.insert(id);
    }

    /// Emit a previously interned record (a flushed conditional
    /// message); same dedup filter as direct reports.
    pub fn emit_interned(&mut self, id: MsgId) {
        self.buffer.insert(id);
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn into_findings(mut self) -> Vec<Finding> {
        self.flush();
        self.findings
    }
}

impl Default for Reporter {
    fn default() -> Self {
        Reporter::new()
    }
}
