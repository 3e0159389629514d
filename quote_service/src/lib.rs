//! Quote Service - Core Library
//!
//! An in-memory quote store with author and live-id indexes, served over HTTP
//! through a bounded worker pool.

pub mod cli;
pub mod dispatcher;
pub mod error;
pub mod middleware;
pub mod model;
pub mod server;
pub mod service;
pub mod settings;
pub mod store;
pub mod telemetry;

pub use dispatcher::{DispatchError, Dispatcher, DispatcherConfig};
pub use error::ApiError;
pub use model::{Quote, QuoteId, QuoteRequest};
pub use service::QuoteService;
pub use settings::Settings;
pub use store::{QuoteRepository, QuoteStore, StoreError};
