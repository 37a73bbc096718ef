//! Reverse mappings: which (pmap, virtual address) pairs translate to a physical page.
//!
//! Entries live in a slab and are indexed twice, by page and by pmap, so that both "unmap this
//! page everywhere" and "tear down this pmap" are proportional to the number of mappings
//! involved.

use alloc::{sync::Arc, vec::Vec};

use hashbrown::HashMap;
use slab::Slab;

use super::Pmap;
use crate::common::PmapId;
use crate::memory::{Frame, VirtualAddress};

pub type PvKey = usize;

#[derive(Debug)]
pub struct PvEntry {
    pub page: Frame,
    pub pmap: Arc<Pmap>,
    pub va: VirtualAddress,
}

#[derive(Debug, Default)]
pub struct PvTable {
    entries: Slab<PvEntry>,
    by_page: HashMap<Frame, Vec<PvKey>>,
    by_pmap: HashMap<PmapId, Vec<PvKey>>,
}

fn unlink(index: &mut Vec<PvKey>, key: PvKey) {
    if let Some(pos) = index.iter().position(|&k| k == key) {
        index.swap_remove(pos);
    }
}

impl PvTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn add(&mut self, page: Frame, pmap: &Arc<Pmap>, va: VirtualAddress) -> PvKey {
        debug_assert!(self.find(page, pmap.id(), va).is_none(), "duplicate pv entry");
        let key = self.entries.insert(PvEntry {
            page,
            pmap: Arc::clone(pmap),
            va,
        });
        self.by_page.entry(page).or_default().push(key);
        self.by_pmap.entry(pmap.id()).or_default().push(key);
        key
    }

    pub fn find(&self, page: Frame, pmap: PmapId, va: VirtualAddress) -> Option<PvKey> {
        self.by_page.get(&page)?.iter().copied().find(|&key| {
            let pv = &self.entries[key];
            pv.pmap.id() == pmap && pv.va == va
        })
    }

    pub fn get(&self, key: PvKey) -> &PvEntry {
        &self.entries[key]
    }

    pub fn remove(&mut self, key: PvKey) -> PvEntry {
        let pv = self.entries.remove(key);
        if let Some(index) = self.by_page.get_mut(&pv.page) {
            unlink(index, key);
            if index.is_empty() {
                self.by_page.remove(&pv.page);
            }
        }
        if let Some(index) = self.by_pmap.get_mut(&pv.pmap.id()) {
            unlink(index, key);
            if index.is_empty() {
                self.by_pmap.remove(&pv.pmap.id());
            }
        }
        pv
    }

    /// Keys of every mapping of `page`.
    pub fn of_page(&self, page: Frame) -> Vec<PvKey> {
        self.by_page.get(&page).cloned().unwrap_or_default()
    }

    /// Keys of every mapping owned by `pmap`.
    pub fn of_pmap(&self, pmap: PmapId) -> Vec<PvKey> {
        self.by_pmap.get(&pmap).cloned().unwrap_or_default()
    }
}
