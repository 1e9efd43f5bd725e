//! Tranlocal storage for one transaction.
//!
//! Small transactions (the common case) are scanned linearly; once the set
//! outgrows [`LINEAR_SCAN_LIMIT`] an `FxHashMap` index from ref id to slot is
//! built and maintained from then on.

use crate::tranlocal::TxEntry;
use rustc_hash::FxHashMap;
use tessera_core::RefId;

/// Entries scanned linearly before the hash index is built.
pub const LINEAR_SCAN_LIMIT: usize = 8;

pub(crate) struct TranlocalSet {
    entries: Vec<Box<dyn TxEntry>>,
    index: Option<FxHashMap<RefId, usize>>,
}

impl TranlocalSet {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        TranlocalSet {
            entries: Vec::with_capacity(capacity.min(LINEAR_SCAN_LIMIT)),
            index: None,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn position(&self, id: RefId) -> Option<usize> {
        match &self.index {
            Some(index) => index.get(&id).copied(),
            None => self.entries.iter().position(|e| e.ref_id() == id),
        }
    }

    pub(crate) fn push(&mut self, entry: Box<dyn TxEntry>) -> usize {
        let idx = self.entries.len();
        let id = entry.ref_id();
        self.entries.push(entry);

        match &mut self.index {
            Some(index) => {
                index.insert(id, idx);
            }
            None if self.entries.len() > LINEAR_SCAN_LIMIT => {
                let mut index =
                    FxHashMap::with_capacity_and_hasher(self.entries.len() * 2, Default::default());
                for (i, e) in self.entries.iter().enumerate() {
                    index.insert(e.ref_id(), i);
                }
                self.index = Some(index);
            }
            None => {}
        }
        idx
    }

    #[inline]
    pub(crate) fn get(&self, idx: usize) -> &dyn TxEntry {
        self.entries[idx].as_ref()
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, idx: usize) -> &mut dyn TxEntry {
        self.entries[idx].as_mut()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &dyn TxEntry> {
        self.entries.iter().map(|e| e.as_ref())
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn TxEntry>> {
        self.entries.iter_mut()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.index = None;
    }

    pub(crate) fn is_indexed(&self) -> bool {
        self.index.is_some()
    }
}
