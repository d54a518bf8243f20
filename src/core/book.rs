use crate::error::Result;
use serde::{Deserialize, Serialize};

/// The record type carried by the ledger: one catalogued book.
///
/// Books are plain values with structural equality; two entries with the
/// same fields are the same book as far as the chain is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    title: String,
    author: String,
    date: String,
    genre: String,
}

impl Book {
    pub fn new(title: &str, author: &str, date: &str, genre: &str) -> Book {
        Book {
            title: title.to_string(),
            author: author.to_string(),
            date: date.to_string(),
            genre: genre.to_string(),
        }
    }

    pub fn get_title(&self) -> &str {
        self.title.as_str()
    }

    pub fn get_author(&self) -> &str {
        self.author.as_str()
    }

    pub fn get_date(&self) -> &str {
        self.date.as_str()
    }

    pub fn get_genre(&self) -> &str {
        self.genre.as_str()
    }

    /// Canonical JSON rendering, stable field order. This string is the
    /// signing input for book transfers and feeds into transaction and
    /// block hashing, so it must stay byte-identical for equal books.
    pub fn canonical_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
