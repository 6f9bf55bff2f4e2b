pub mod history;
pub mod search_index;
pub mod summary;
