//! Lists: historical replay plus live subscription on a topic.
//!
//! A list is bound to a topic and a match condition. Opening it replays
//! matching history into the list, then every subsequent append that
//! matches is delivered through the same materialization rule: an optional
//! callback may consume the entry itself, let the framework append it to
//! the list's `data`, or abort the append in progress.

use serde_json::Value;

use crate::codec::MetaRecord;
use crate::error::{Result, TrError};
use crate::matcher::{MatchCond, RecordKey};

/// Handle identifying an open list within its database.
pub type ListId = u64;

/// What a list callback wants done with a delivered entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListAction {
    /// The callback consumed the entry; the framework stores nothing.
    Handled,
    /// The framework appends the entry to the list's `data`.
    Materialize,
    /// Abort the operation that produced the entry with this status.
    Abort(i32),
}

/// One materialized record delivered to a list.
#[derive(Debug, Clone)]
pub struct ListEntry {
    /// Partition key of the record.
    pub key: RecordKey,
    /// Position of the record in its key's sequence.
    pub rowid: i64,
    /// The record's metadata.
    pub meta: MetaRecord,
    /// The record content; `None` when persisted without content.
    pub record: Option<Value>,
}

/// Materialization callback invoked per delivered entry.
pub type ListCallback = Box<dyn FnMut(&ListEntry) -> ListAction>;

/// How a list replays existing records when opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReplayOrder {
    /// Oldest first, starting at `from_rowid` or the first record.
    #[default]
    Forward,
    /// Newest first, starting at `to_rowid` or the last record.
    Backward,
}

/// Caller-facing description of a list to open.
pub struct ListSpec {
    /// Topic the list binds to.
    pub topic: String,
    /// Match condition (JSON filter object, `Null` matches everything).
    pub cond: Value,
    /// Replay direction for existing records.
    pub order: ReplayOrder,
    /// Optional materialization callback.
    pub callback: Option<ListCallback>,
}

impl ListSpec {
    /// Creates a spec matching every record of a topic, forward replay,
    /// no callback.
    pub fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            cond: Value::Null,
            order: ReplayOrder::Forward,
            callback: None,
        }
    }

    /// Sets the match condition.
    pub fn with_cond(mut self, cond: Value) -> Self {
        self.cond = cond;
        self
    }

    /// Sets the replay order.
    pub fn with_order(mut self, order: ReplayOrder) -> Self {
        self.order = order;
        self
    }

    /// Sets the materialization callback.
    pub fn with_callback(mut self, callback: ListCallback) -> Self {
        self.callback = Some(callback);
        self
    }
}

/// An open list registered on a topic.
pub struct List {
    id: ListId,
    cond: MatchCond,
    callback: Option<ListCallback>,
    /// Materialized entries, replay first, then live appends.
    pub data: Vec<ListEntry>,
}

impl List {
    /// Creates a list from a compiled condition.
    pub(crate) fn new(id: ListId, cond: MatchCond, callback: Option<ListCallback>) -> Self {
        Self {
            id,
            cond,
            callback,
            data: Vec::new(),
        }
    }

    /// The list's handle.
    pub fn id(&self) -> ListId {
        self.id
    }

    /// The list's compiled match condition.
    pub fn cond(&self) -> &MatchCond {
        &self.cond
    }

    /// Applies the materialization rule to an already-matched entry.
    ///
    /// # Errors
    ///
    /// Returns `TrError::ListAborted` if the callback aborts.
    pub(crate) fn deliver(&mut self, entry: ListEntry) -> Result<()> {
        let action = match &mut self.callback {
            Some(cb) => cb(&entry),
            None => ListAction::Materialize,
        };
        match action {
            ListAction::Handled => Ok(()),
            ListAction::Materialize => {
                self.data.push(entry);
                Ok(())
            }
            ListAction::Abort(status) => Err(TrError::ListAborted(status)),
        }
    }
}

impl std::fmt::Debug for List {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("List")
            .field("id", &self.id)
            .field("entries", &self.data.len())
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;

    fn entry(rowid: i64) -> ListEntry {
        ListEntry {
            key: RecordKey::Str("k".into()),
            rowid,
            meta: MetaRecord::new(100 + rowid as u64, 0, 0, 4),
            record: Some(json!({"v": rowid})),
        }
    }

    #[test]
    fn no_callback_materializes() {
        let cond = MatchCond::compile(&Value::Null).unwrap();
        let mut list = List::new(1, cond, None);
        list.deliver(entry(0)).unwrap();
        list.deliver(entry(1)).unwrap();
        assert_eq!(list.data.len(), 2);
        assert_eq!(list.data[1].rowid, 1);
    }

    #[test]
    fn handled_entries_are_not_stored() {
        let seen = Rc::new(Cell::new(0));
        let seen2 = seen.clone();
        let cond = MatchCond::compile(&Value::Null).unwrap();
        let mut list = List::new(
            1,
            cond,
            Some(Box::new(move |_| {
                seen2.set(seen2.get() + 1);
                ListAction::Handled
            })),
        );
        list.deliver(entry(0)).unwrap();
        assert_eq!(seen.get(), 1);
        assert!(list.data.is_empty());
    }

    #[test]
    fn abort_surfaces_status() {
        let cond = MatchCond::compile(&Value::Null).unwrap();
        let mut list = List::new(1, cond, Some(Box::new(|_| ListAction::Abort(-7))));
        match list.deliver(entry(0)) {
            Err(TrError::ListAborted(-7)) => {}
            other => panic!("expected ListAborted(-7), got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn callback_can_choose_per_entry() {
        let cond = MatchCond::compile(&Value::Null).unwrap();
        let mut list = List::new(
            1,
            cond,
            Some(Box::new(|e| {
                if e.rowid % 2 == 0 {
                    ListAction::Materialize
                } else {
                    ListAction::Handled
                }
            })),
        );
        for rowid in 0..4 {
            list.deliver(entry(rowid)).unwrap();
        }
        assert_eq!(list.data.len(), 2);
        assert!(list.data.iter().all(|e| e.rowid % 2 == 0));
    }
}
