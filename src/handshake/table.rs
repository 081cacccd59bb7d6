//! Dual-keyed table of pending handshakes
//!
//! Two ordered indices share ownership of each record: `by_tag` from the
//! moment a handshake exists, `by_cookie` once the responder has issued a
//! cookie. The record carries its own keys, so one `remove` call clears
//! whichever indices reference it.

use std::cell::RefCell;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::rc::Rc;

use crate::handshake::record::HandshakeRecord;
use crate::protocol::messages::{COOKIE_SIZE, TAG_SIZE};

pub type SharedRecord = Rc<RefCell<HandshakeRecord>>;

#[derive(Default)]
pub struct PendingTable {
    by_tag: BTreeMap<[u8; TAG_SIZE], SharedRecord>,
    by_cookie: BTreeMap<[u8; COOKIE_SIZE], SharedRecord>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert under a tag. If the tag is already present the existing
    /// record wins; the second element says whether `record` got in.
    pub fn insert_by_tag(
        &mut self,
        tag: [u8; TAG_SIZE],
        record: SharedRecord,
    ) -> (SharedRecord, bool) {
        match self.by_tag.entry(tag) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                record.borrow_mut().tag = tag;
                entry.insert(record.clone());
                (record, true)
            }
        }
    }

    /// Register a cookie for a record that already lives in `by_tag`.
    pub fn bind_cookie(&mut self, record: &SharedRecord, cookie: [u8; COOKIE_SIZE]) {
        debug_assert!(self.by_tag.contains_key(&record.borrow().tag));
        record.borrow_mut().cookie = Some(cookie);
        self.by_cookie.insert(cookie, record.clone());
    }

    pub fn find_by_tag(&self, tag: &[u8; TAG_SIZE]) -> Option<SharedRecord> {
        self.by_tag.get(tag).cloned()
    }

    pub fn find_by_cookie(&self, cookie: &[u8; COOKIE_SIZE]) -> Option<SharedRecord> {
        self.by_cookie.get(cookie).cloned()
    }

    /// Remove a record from whichever indices reference it. Idempotent;
    /// a key that meanwhile maps to a different record is left alone.
    pub fn remove(&mut self, record: &SharedRecord) {
        let (tag, cookie) = {
            let r = record.borrow();
            (r.tag, r.cookie)
        };
        if let Some(cookie) = cookie {
            if self
                .by_cookie
                .get(&cookie)
                .is_some_and(|r| Rc::ptr_eq(r, record))
            {
                self.by_cookie.remove(&cookie);
            }
        }
        if self
            .by_tag
            .get(&tag)
            .is_some_and(|r| Rc::ptr_eq(r, record))
        {
            self.by_tag.remove(&tag);
        }
    }

    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// Snapshot of the current tags, so callers can mutate the table while
    /// walking it.
    pub fn tags(&self) -> Vec<[u8; TAG_SIZE]> {
        self.by_tag.keys().copied().collect()
    }

    pub fn records(&self) -> impl Iterator<Item = &SharedRecord> {
        self.by_tag.values()
    }

    /// Drop every pending handshake.
    pub fn close(&mut self) {
        self.by_tag.clear();
        self.by_cookie.clear();
    }
}
