//! Size-bounded batches of entries.
//!
//! A batch body is a JSON array of serialized entries:
//!
//! ```text
//! [<entry>,<entry>,...,<entry>]
//! ```
//!
//! so its exact length is `2 + Σ len(entry) + (n - 1)`. The builder tracks
//! that length as entries are pushed and refuses any entry that would take it
//! past the configured ceiling.

use crate::spool::EntryRef;
use crate::types::EntryKind;

/// Length of a batch body with no entries: `[]`.
pub const EMPTY_BATCH_BYTES: usize = 2;

/// Result of offering one entry to a [`BatchBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    /// The entry is part of the batch.
    Added,
    /// The batch has no room for this entry; it waits for a later batch.
    Full,
    /// The entry could never fit in any batch on its own.
    Oversize,
}

/// A sealed batch, ready for the transport.
#[derive(Debug, Clone)]
pub struct Batch {
    kind: EntryKind,
    entries: Vec<EntryRef>,
    body: Vec<u8>,
}

impl Batch {
    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn subject(&self) -> &'static str {
        self.kind.batch_subject()
    }

    pub fn entries(&self) -> &[EntryRef] {
        &self.entries
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Accumulates entries of one kind under entry-count and byte ceilings.
#[derive(Debug)]
pub struct BatchBuilder {
    kind: EntryKind,
    max_entries: usize,
    max_bytes: usize,
    entries: Vec<EntryRef>,
    /// Body so far, without the closing bracket.
    body: Vec<u8>,
}

impl BatchBuilder {
    pub fn new(kind: EntryKind, max_entries: usize, max_bytes: usize) -> Self {
        let mut body = Vec::new();
        body.push(b'[');
        BatchBuilder {
            kind,
            max_entries,
            max_bytes,
            entries: Vec::new(),
            body,
        }
    }

    /// Length the body would have if sealed now.
    pub fn body_len(&self) -> usize {
        self.body.len() + 1
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if no further entry of any size can be added.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.max_entries
    }

    /// Offers an entry and its serialized form.
    ///
    /// `serialized` must be a complete JSON value; it is copied into the body
    /// verbatim.
    pub fn push(&mut self, entry_ref: EntryRef, serialized: &[u8]) -> Push {
        if serialized.len() + EMPTY_BATCH_BYTES > self.max_bytes {
            return Push::Oversize;
        }
        if self.is_full() {
            return Push::Full;
        }

        let separator = usize::from(!self.entries.is_empty());
        if self.body_len() + separator + serialized.len() > self.max_bytes {
            return Push::Full;
        }

        if separator == 1 {
            self.body.push(b',');
        }
        self.body.extend_from_slice(serialized);
        self.entries.push(entry_ref);
        Push::Added
    }

    /// Seals the batch. Returns `None` if nothing was added.
    pub fn finish(mut self) -> Option<Batch> {
        if self.entries.is_empty() {
            return None;
        }
        self.body.push(b']');
        Some(Batch {
            kind: self.kind,
            entries: self.entries,
            body: self.body,
        })
    }
}
