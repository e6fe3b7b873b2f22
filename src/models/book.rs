//! Book records and their key-value encoding.
//!
//! A book is stored as one hash at `Book:<id>` holding the fields
//! `id, title, rating, author, blurb`. The ordering index lives at `books`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Key prefix for per-book hashes.
pub const BOOK_KEY_PREFIX: &str = "Book:";

/// Key of the sorted set that orders books by creation time.
pub const ORDERING_INDEX_KEY: &str = "books";

/// Identifier assigned to a book when it is created.
///
/// Identifiers are millisecond timestamps rendered as decimal strings, so the
/// numeric value doubles as the ordering score.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookId(String);

impl BookId {
    /// Creates a book ID from any string.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates a book ID from a numeric identity.
    #[must_use]
    pub fn from_millis(millis: u64) -> Self {
        Self(millis.to_string())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the namespaced store key for this book.
    #[must_use]
    pub fn store_key(&self) -> String {
        format!("{BOOK_KEY_PREFIX}{}", self.0)
    }
}

impl fmt::Display for BookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for BookId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BookId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// The client-supplied fields of a book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BookField {
    /// Book title.
    Title,
    /// Free-form rating.
    Rating,
    /// Author name.
    Author,
    /// Short description.
    Blurb,
}

impl BookField {
    /// Returns all fields in their canonical order.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[Self::Title, Self::Rating, Self::Author, Self::Blurb]
    }

    /// Returns the hash field name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Rating => "rating",
            Self::Author => "author",
            Self::Blurb => "blurb",
        }
    }
}

impl fmt::Display for BookField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A create request as submitted by a client.
///
/// Every field is optional at the type level so that absent and empty
/// values are both reported by [`NewBook::validate`] instead of by the
/// deserializer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBook {
    /// Book title.
    #[serde(default)]
    pub title: Option<String>,
    /// Free-form rating.
    #[serde(default)]
    pub rating: Option<String>,
    /// Author name.
    #[serde(default)]
    pub author: Option<String>,
    /// Short description.
    #[serde(default)]
    pub blurb: Option<String>,
}

impl NewBook {
    /// Creates a request with every field set.
    #[must_use]
    pub fn new(
        title: impl Into<String>,
        rating: impl Into<String>,
        author: impl Into<String>,
        blurb: impl Into<String>,
    ) -> Self {
        Self {
            title: Some(title.into()),
            rating: Some(rating.into()),
            author: Some(author.into()),
            blurb: Some(blurb.into()),
        }
    }

    fn field(&self, field: BookField) -> Option<&str> {
        match field {
            BookField::Title => self.title.as_deref(),
            BookField::Rating => self.rating.as_deref(),
            BookField::Author => self.author.as_deref(),
            BookField::Blurb => self.blurb.as_deref(),
        }
    }

    /// Returns the fields that are absent or empty, in canonical order.
    #[must_use]
    pub fn missing_fields(&self) -> Vec<BookField> {
        BookField::all()
            .iter()
            .copied()
            .filter(|&f| self.field(f).is_none_or(str::is_empty))
            .collect()
    }

    /// Checks that every field is present and non-empty.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] listing every missing field.
    pub fn validate(&self) -> Result<()> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation { missing })
        }
    }

    /// Validates the request and binds it to an identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if any field is missing.
    pub fn into_book(self, id: BookId) -> Result<Book> {
        self.validate()?;
        Ok(Book {
            id,
            title: self.title.unwrap_or_default(),
            rating: self.rating.unwrap_or_default(),
            author: self.author.unwrap_or_default(),
            blurb: self.blurb.unwrap_or_default(),
        })
    }
}

/// A persisted book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    /// Store-assigned identifier.
    pub id: BookId,
    /// Book title.
    pub title: String,
    /// Free-form rating.
    pub rating: String,
    /// Author name.
    pub author: String,
    /// Short description.
    pub blurb: String,
}

impl Book {
    /// Encodes the book as hash field/value pairs, including its ID.
    #[must_use]
    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            ("id".to_string(), self.id.as_str().to_string()),
            (BookField::Title.as_str().to_string(), self.title.clone()),
            (BookField::Rating.as_str().to_string(), self.rating.clone()),
            (BookField::Author.as_str().to_string(), self.author.clone()),
            (BookField::Blurb.as_str().to_string(), self.blurb.clone()),
        ]
    }

    fn field_mut(&mut self, field: BookField) -> &mut String {
        match field {
            BookField::Title => &mut self.title,
            BookField::Rating => &mut self.rating,
            BookField::Author => &mut self.author,
            BookField::Blurb => &mut self.blurb,
        }
    }
}

/// A book read back from the store, with any decoding gaps made explicit.
///
/// A record is degraded when its hash is missing or lacks fields, which
/// happens when an index entry outlives its container. Missing fields are
/// left empty and listed in `missing_fields`; complete records serialize
/// exactly like a [`Book`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookRecord {
    /// The decoded book.
    #[serde(flatten)]
    pub book: Book,
    /// Set when any field could not be read back.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
    /// Fields absent from the stored hash.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_fields: Vec<BookField>,
}

impl BookRecord {
    /// Decodes a record from the hash read at `Book:<id>`.
    ///
    /// The ID always comes from the caller (the index entry or the requested
    /// key), never from the hash, so an empty hash still yields a record that
    /// can be traced back to its index entry.
    #[must_use]
    pub fn from_fields(id: BookId, mut fields: HashMap<String, String>) -> Self {
        let mut book = Book {
            id,
            title: String::new(),
            rating: String::new(),
            author: String::new(),
            blurb: String::new(),
        };
        let mut missing_fields = Vec::new();
        for &field in BookField::all() {
            match fields.remove(field.as_str()) {
                Some(value) => *book.field_mut(field) = value,
                None => missing_fields.push(field),
            }
        }
        Self {
            book,
            degraded: !missing_fields.is_empty(),
            missing_fields,
        }
    }

    /// Returns `true` if the record was reconstructed with gaps.
    #[must_use]
    pub const fn is_degraded(&self) -> bool {
        self.degraded
    }
}

impl From<Book> for BookRecord {
    fn from(book: Book) -> Self {
        Self {
            book,
            degraded: false,
            missing_fields: Vec::new(),
        }
    }
}
