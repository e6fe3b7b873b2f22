//! Data models for bookshelf.

mod book;
mod events;

pub use book::{
    BOOK_KEY_PREFIX, Book, BookField, BookId, BookRecord, NewBook, ORDERING_INDEX_KEY,
};
pub use events::{ConnectionEvent, EventMeta};
