//! Shared data model and session bookkeeping for MemeForge: requests and
//! composition plans, chat input parsing, the event log, chat history and
//! the search-result index.

pub mod atomic_file;
pub mod chat;
pub mod events;
pub mod plan;
pub mod session;
