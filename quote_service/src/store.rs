//! In-memory quote store with an author index and a live-id set.
//!
//! All three structures live behind one `parking_lot::RwLock`, so a reader
//! never sees the primary map updated while an index is stale. Mutations take
//! the write half, queries the read half, and no guard escapes a method.

use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

use crate::model::{Quote, QuoteId};

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("quote not found")]
    NotFound,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Point-in-time counters reported by the health endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub live_records: usize,
    pub authors: usize,
    pub next_id: QuoteId,
}

/// Narrow storage interface the service layer depends on.
pub trait QuoteRepository: Send + Sync {
    /// Store a new quote under a freshly allocated id
    fn create(&self, author: &str, text: &str) -> Quote;

    /// Every live quote
    fn list_all(&self) -> Vec<Quote>;

    /// Live quotes whose author matches exactly; empty if the author is unknown
    fn list_by_author(&self, author: &str) -> Vec<Quote>;

    /// One live quote chosen uniformly at random
    fn random(&self) -> StoreResult<Quote>;

    /// Fetch a single quote by id
    fn get(&self, id: QuoteId) -> StoreResult<Quote>;

    /// Remove a quote from the store and every index
    fn delete(&self, id: QuoteId) -> StoreResult<()>;

    fn stats(&self) -> StoreStats;
}

#[derive(Debug)]
struct StoreState {
    records: HashMap<QuoteId, Quote>,
    author_index: HashMap<String, HashSet<QuoteId>>,
    live_ids: HashSet<QuoteId>,
    next_id: QuoteId,
}

impl StoreState {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            author_index: HashMap::new(),
            live_ids: HashSet::new(),
            next_id: 1,
        }
    }

    fn collect<'a>(&self, ids: impl Iterator<Item = &'a QuoteId>) -> Vec<Quote> {
        let mut quotes: Vec<Quote> = ids
            .filter_map(|id| self.records.get(id).cloned())
            .collect();
        quotes.sort_unstable_by_key(|q| q.id);
        quotes
    }
}

/// The process-wide quote store. Construct once and share via `Arc`.
#[derive(Debug)]
pub struct QuoteStore {
    state: RwLock<StoreState>,
}

impl Default for QuoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl QuoteStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.state.read().live_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Verify that the author index and live-id set agree with the primary map.
    #[cfg(test)]
    fn check_invariants(&self) -> Result<(), String> {
        let state = self.state.read();

        if state.live_ids.len() != state.records.len() {
            return Err(format!(
                "live set has {} ids but {} records exist",
                state.live_ids.len(),
                state.records.len()
            ));
        }

        for (id, quote) in &state.records {
            if quote.id != *id {
                return Err(format!("record keyed {} carries id {}", id, quote.id));
            }
            if !state.live_ids.contains(id) {
                return Err(format!("record {} missing from live set", id));
            }
            if *id >= state.next_id {
                return Err(format!("record {} not below next id {}", id, state.next_id));
            }
            let indexed = state
                .author_index
                .get(&quote.author)
                .map_or(false, |ids| ids.contains(id));
            if !indexed {
                return Err(format!("record {} missing from author index", id));
            }
        }

        for (author, ids) in &state.author_index {
            if ids.is_empty() {
                return Err(format!("empty index entry for author {:?}", author));
            }
            for id in ids {
                match state.records.get(id) {
                    Some(quote) if &quote.author == author => {}
                    Some(quote) => {
                        return Err(format!(
                            "id {} indexed under {:?} but authored by {:?}",
                            id, author, quote.author
                        ))
                    }
                    None => return Err(format!("index points at deleted id {}", id)),
                }
            }
        }

        Ok(())
    }
}

impl QuoteRepository for QuoteStore {
    fn create(&self, author: &str, text: &str) -> Quote {
        let mut state = self.state.write();

        let id = state.next_id;
        let quote = Quote {
            id,
            author: author.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        };

        state.records.insert(id, quote.clone());
        state
            .author_index
            .entry(author.to_string())
            .or_default()
            .insert(id);
        state.live_ids.insert(id);
        state.next_id += 1;

        debug!(id, author, "quote stored");
        quote
    }

    fn list_all(&self) -> Vec<Quote> {
        let state = self.state.read();
        state.collect(state.live_ids.iter())
    }

    fn list_by_author(&self, author: &str) -> Vec<Quote> {
        let state = self.state.read();
        match state.author_index.get(author) {
            Some(ids) => state.collect(ids.iter()),
            None => Vec::new(),
        }
    }

    fn random(&self) -> StoreResult<Quote> {
        let state = self.state.read();
        if state.live_ids.is_empty() {
            return Err(StoreError::NotFound);
        }

        // Ordinal walk over the set: O(live) but no dense id array to maintain.
        let ordinal = rand::thread_rng().gen_range(0..state.live_ids.len());
        state
            .live_ids
            .iter()
            .nth(ordinal)
            .and_then(|id| state.records.get(id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn get(&self, id: QuoteId) -> StoreResult<Quote> {
        self.state
            .read()
            .records
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn delete(&self, id: QuoteId) -> StoreResult<()> {
        let mut state = self.state.write();

        let quote = state.records.remove(&id).ok_or(StoreError::NotFound)?;

        let prune = match state.author_index.get_mut(&quote.author) {
            Some(ids) => {
                ids.remove(&id);
                ids.is_empty()
            }
            None => false,
        };
        if prune {
            state.author_index.remove(&quote.author);
        }
        state.live_ids.remove(&id);

        debug!(id, author = %quote.author, "quote deleted");
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        let state = self.state.read();
        StoreStats {
            live_records: state.live_ids.len(),
            authors: state.author_index.len(),
            next_id: state.next_id,
        }
    }
}
