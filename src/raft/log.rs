use serde::{Deserialize, Serialize};

/// A log index. Starts at 1, indicates no entry if 0.
pub type Index = u64;

/// A leader term. Starts at 0 and increases monotonically.
pub type Term = u64;

/// A log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The entry index.
    pub index: Index,
    /// The term in which the entry was added.
    pub term: Term,
    /// The client command. Opaque to the simulator.
    pub command: String,
}

/// The Raft log: an ordered sequence of client commands replicated across
/// nodes. Kept in memory since simulation runs are ephemeral.
///
/// Invariants, asserted on every mutation:
///
/// * Entry indexes are contiguous starting at 1 (no gaps).
/// * Entry terms never decrease from the previous entry.
/// * The commit index never regresses and never exceeds the last index.
/// * Committed entries are never truncated.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RaftLog {
    /// The entries. Entry index i is stored at offset i - 1.
    entries: Vec<Entry>,
    /// The index of the last committed entry, or 0 if none.
    commit_index: Index,
}

impl RaftLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a command to the log in the given term, returning the entry's
    /// index.
    pub fn append(&mut self, term: Term, command: String) -> Index {
        let (last_index, last_term) = self.last();
        assert!(term >= last_term, "term regression {last_term} → {term}");
        let index = last_index + 1;
        self.entries.push(Entry { index, term, command });
        index
    }

    /// Returns the entry at the given index, if any.
    pub fn get(&self, index: Index) -> Option<&Entry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Returns true if the log contains an entry with the given index and
    /// term. Index 0 (the empty prefix) always matches.
    pub fn has(&self, index: Index, term: Term) -> bool {
        if index == 0 {
            return true;
        }
        self.get(index).map(|e| e.term == term).unwrap_or(false)
    }

    /// Returns the last entry's index and term, or (0, 0) if empty.
    pub fn last(&self) -> (Index, Term) {
        self.entries.last().map(|e| (e.index, e.term)).unwrap_or((0, 0))
    }

    /// Returns the number of entries.
    pub fn len(&self) -> Index {
        self.entries.len() as Index
    }

    /// Returns true if the log is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns all entries from the given index (inclusive) onward, cloned
    /// for sending. An index beyond the log yields an empty vector.
    pub fn entries_from(&self, index: Index) -> Vec<Entry> {
        assert!(index > 0, "entries_from index must be at least 1");
        self.entries.iter().skip(index as usize - 1).cloned().collect()
    }

    /// Returns all entries.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Splices replicated entries into the log after the given base index.
    /// Scans the incoming entries against the local log and truncates at the
    /// first conflict (same index, different term); entries already present
    /// are left untouched, making replays idempotent. Returns the index of
    /// the last incoming entry, or the base index if none.
    ///
    /// The caller must have verified that the base entry exists (the
    /// AppendEntries consistency check).
    pub fn splice(&mut self, base_index: Index, entries: Vec<Entry>) -> Index {
        assert!(base_index <= self.len(), "splice base {base_index} beyond log");
        if let Some(first) = entries.first() {
            assert_eq!(first.index, base_index + 1, "splice entries not contiguous with base");
        }

        let mut match_index = base_index;
        for entry in entries {
            assert_eq!(entry.index, match_index + 1, "splice entries have index gap");
            match self.get(entry.index) {
                // Existing identical entry, skip it.
                Some(existing) if existing.term == entry.term => {}
                // Conflict: truncate from here and take the incoming entry.
                Some(_) => {
                    assert!(
                        entry.index > self.commit_index,
                        "can't truncate committed entry {}",
                        entry.index
                    );
                    self.entries.truncate(entry.index as usize - 1);
                    self.entries.push(entry);
                }
                None => self.entries.push(entry),
            }
            match_index += 1;
        }
        match_index
    }

    /// Advances the commit index. Commits are monotonic and bounded by the
    /// last index.
    pub fn commit(&mut self, index: Index) {
        assert!(index >= self.commit_index, "commit regression {} → {index}", self.commit_index);
        assert!(index <= self.len(), "commit index {index} beyond log");
        self.commit_index = index;
    }

    /// Returns the commit index, or 0 if nothing is committed.
    pub fn commit_index(&self) -> Index {
        self.commit_index
    }
}
