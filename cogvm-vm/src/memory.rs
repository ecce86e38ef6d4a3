//! # Page memory
//!
//! The working set of a run: named pages holding JSON values, bounded by a
//! page count and an aggregate size budget. Writes that would break either
//! bound evict least-recently-used pages first. Eviction is planned before
//! anything changes, so a write that cannot fit leaves memory untouched.
//!
//! Evicted pages are handed back to the caller, which writes dirty ones to
//! the durable store.

use crate::error::{self, Result};
use crate::value::estimate_tokens;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};

/// A single memory page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    /// Page identifier
    pub id: String,
    /// Page content
    pub data: Value,
    /// Modified since it was last written to the durable store
    pub dirty: bool,
    /// Approximate size in tokens
    pub size_estimate: usize,
    /// Optional label from ALLOC
    #[serde(default)]
    pub label: Option<String>,
    /// Logical clock value of the last access
    #[serde(default)]
    pub last_access: u64,
}

impl Page {
    fn new(id: impl Into<String>, data: Value, label: Option<String>) -> Self {
        let size_estimate = estimate_tokens(&data);
        Self {
            id: id.into(),
            data,
            dirty: true,
            size_estimate,
            label,
            last_access: 0,
        }
    }
}

/// Bounded page table
#[derive(Debug, Clone)]
pub struct Memory {
    pages: HashMap<String, Page>,
    total_size: usize,
    max_pages: usize,
    budget: usize,
    /// Logical access clock, bumped on every touch
    clock: u64,
    /// Counter behind `page_N` ids
    next_alloc: u64,
}

impl Memory {
    /// Create memory with a page-count limit and a size budget
    pub fn new(max_pages: usize, budget: usize) -> Self {
        Self {
            pages: HashMap::new(),
            total_size: 0,
            max_pages,
            budget,
            clock: 0,
            next_alloc: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Sum of `size_estimate` over resident pages
    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn max_pages(&self) -> usize {
        self.max_pages
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pages.contains_key(id)
    }

    /// Read a page's value and mark it recently used
    pub fn get(&mut self, id: &str) -> Option<&Value> {
        self.clock += 1;
        let clock = self.clock;
        let page = self.pages.get_mut(id)?;
        page.last_access = clock;
        Some(&page.data)
    }

    /// Inspect a page without touching it
    pub fn page(&self, id: &str) -> Option<&Page> {
        self.pages.get(id)
    }

    /// Write a page, creating it if needed, and mark it dirty.
    ///
    /// Returns the pages evicted to make room. Neither `id` nor any page in
    /// `pinned` is ever evicted.
    pub fn store(&mut self, id: &str, data: Value, pinned: &HashSet<String>) -> Result<Vec<Page>> {
        let label = self.pages.get(id).and_then(|p| p.label.clone());
        let page = Page::new(id, data, label);
        self.put(page, pinned)
    }

    /// Insert a page read back from the durable store, clean
    pub fn insert_clean(&mut self, id: &str, data: Value, label: Option<String>, pinned: &HashSet<String>) -> Result<Vec<Page>> {
        let mut page = Page::new(id, data, label);
        page.dirty = false;
        self.put(page, pinned)
    }

    /// Allocate a fresh empty page with a `page_N` id
    pub fn alloc(&mut self, label: Option<String>, pinned: &HashSet<String>) -> Result<(String, Vec<Page>)> {
        let mut id = format!("page_{}", self.next_alloc);
        while self.pages.contains_key(&id) {
            self.next_alloc += 1;
            id = format!("page_{}", self.next_alloc);
        }
        let evicted = self.put(Page::new(id.clone(), Value::Null, label), pinned)?;
        self.next_alloc += 1;
        Ok((id, evicted))
    }

    /// Drop a page. Missing pages are fine.
    pub fn remove(&mut self, id: &str) -> Option<Page> {
        let page = self.pages.remove(id)?;
        self.total_size = self.total_size.saturating_sub(page.size_estimate);
        Some(page)
    }

    fn put(&mut self, mut page: Page, pinned: &HashSet<String>) -> Result<Vec<Page>> {
        let victims = self.plan_eviction(&page, pinned)?;
        let evicted: Vec<Page> = victims.iter().filter_map(|id| self.remove(id)).collect();

        self.remove(&page.id);
        self.clock += 1;
        page.last_access = self.clock;
        self.total_size += page.size_estimate;
        self.pages.insert(page.id.clone(), page);
        Ok(evicted)
    }

    /// Pick the least-recently-used victims that make `incoming` fit
    fn plan_eviction(&self, incoming: &Page, pinned: &HashSet<String>) -> Result<Vec<String>> {
        let replaced = self.pages.get(&incoming.id).map(|p| p.size_estimate);
        let mut count = self.pages.len() + usize::from(replaced.is_none());
        let mut size = self.total_size - replaced.unwrap_or(0) + incoming.size_estimate;

        let fits = |count: usize, size: usize| count <= self.max_pages && size <= self.budget;
        if fits(count, size) {
            return Ok(Vec::new());
        }

        let mut candidates: Vec<&Page> = self
            .pages
            .values()
            .filter(|p| p.id != incoming.id && !pinned.contains(&p.id))
            .collect();
        candidates.sort_by(|a, b| a.last_access.cmp(&b.last_access).then_with(|| a.id.cmp(&b.id)));

        let mut victims = Vec::new();
        for candidate in candidates {
            if fits(count, size) {
                break;
            }
            count -= 1;
            size -= candidate.size_estimate;
            victims.push(candidate.id.clone());
        }

        if !fits(count, size) {
            return Err(error::memory_exhausted(
                &incoming.id,
                incoming.size_estimate,
                self.budget,
                self.max_pages,
            ));
        }
        Ok(victims)
    }
}
