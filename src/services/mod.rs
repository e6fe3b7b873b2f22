//! Business logic services.
//!
//! Services sit between the HTTP layer and the storage backends.

mod books;

pub use books::BookStore;
