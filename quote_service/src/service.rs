//! Service facade between the transport and the store.

use std::sync::Arc;
use tracing::instrument;

use crate::{
    model::{Quote, QuoteId, QuoteRequest},
    store::{QuoteRepository, StoreResult, StoreStats},
};

/// Forwards every call to the injected repository.
#[derive(Clone)]
pub struct QuoteService {
    repo: Arc<dyn QuoteRepository>,
}

impl QuoteService {
    pub fn new(repo: Arc<dyn QuoteRepository>) -> Self {
        Self { repo }
    }

    #[instrument(skip(self, request), fields(author = %request.author))]
    pub fn create_quote(&self, request: QuoteRequest) -> Quote {
        self.repo.create(&request.author, &request.quote)
    }

    pub fn all_quotes(&self) -> Vec<Quote> {
        self.repo.list_all()
    }

    pub fn quotes_by_author(&self, author: &str) -> Vec<Quote> {
        self.repo.list_by_author(author)
    }

    /// Listing entry point for `GET /quotes`: a missing or empty author lists everything.
    pub fn list_quotes(&self, author: Option<&str>) -> Vec<Quote> {
        match author {
            Some(author) if !author.is_empty() => self.quotes_by_author(author),
            _ => self.all_quotes(),
        }
    }

    pub fn random_quote(&self) -> StoreResult<Quote> {
        self.repo.random()
    }

    pub fn get_quote(&self, id: QuoteId) -> StoreResult<Quote> {
        self.repo.get(id)
    }

    #[instrument(skip(self))]
    pub fn delete_quote(&self, id: QuoteId) -> StoreResult<()> {
        self.repo.delete(id)
    }

    pub fn stats(&self) -> StoreStats {
        self.repo.stats()
    }
}
