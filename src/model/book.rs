//! Book metadata supplied by the external metadata subsystem.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Read-only description of the book being searched for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BookMetadata {
    /// Identifier within the metadata provider.
    pub provider_id: String,
    /// Metadata provider name (hardcover, openlibrary, ...).
    pub provider: String,
    /// Canonical title.
    pub title: String,
    /// Cleaner title for release searches, when the provider offers one.
    #[serde(default)]
    pub search_title: Option<String>,
    /// Authors, primary author first.
    #[serde(default)]
    pub authors: Vec<String>,
    /// ISBN-10.
    #[serde(default)]
    pub isbn_10: Option<String>,
    /// ISBN-13.
    #[serde(default)]
    pub isbn_13: Option<String>,
    /// ISO 639-1 language code.
    #[serde(default)]
    pub language: Option<String>,
    /// Cover image URL.
    #[serde(default)]
    pub cover_url: Option<String>,
    /// Publication year.
    #[serde(default)]
    pub publish_year: Option<i32>,
    /// Localized titles keyed by language code.
    #[serde(default)]
    pub titles_by_language: HashMap<String, String>,
}

impl BookMetadata {
    /// Creates metadata with just a title and authors.
    #[must_use]
    pub fn new(title: impl Into<String>, authors: Vec<String>) -> Self {
        Self {
            title: title.into(),
            authors,
            ..Self::default()
        }
    }

    /// Preferred ISBN for exact lookups (ISBN-13 over ISBN-10).
    #[must_use]
    pub fn preferred_isbn(&self) -> Option<&str> {
        self.isbn_13
            .as_deref()
            .or(self.isbn_10.as_deref())
            .filter(|isbn| !isbn.trim().is_empty())
    }

    /// First author, trimmed to the first name in a comma separated list.
    #[must_use]
    pub fn primary_author(&self) -> Option<&str> {
        let first = self.authors.first()?;
        let primary = first.split(',').next().unwrap_or(first).trim();
        (!primary.is_empty()).then_some(primary)
    }

    /// Title used for searches: `search_title` when present, else `title`.
    #[must_use]
    pub fn query_title(&self) -> &str {
        self.search_title
            .as_deref()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or(&self.title)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preferred_isbn_prefers_13() {
        let mut book = BookMetadata::new("Dune", vec![]);
        book.isbn_10 = Some("0441013597".to_string());
        assert_eq!(book.preferred_isbn(), Some("0441013597"));
        book.isbn_13 = Some("9780441013593".to_string());
        assert_eq!(book.preferred_isbn(), Some("9780441013593"));
    }

    #[test]
    fn test_preferred_isbn_ignores_blank() {
        let mut book = BookMetadata::new("Dune", vec![]);
        book.isbn_13 = Some("  ".to_string());
        assert_eq!(book.preferred_isbn(), None);
    }

    #[test]
    fn test_primary_author_splits_comma_list() {
        let book = BookMetadata::new(
            "Good Omens",
            vec!["Terry Pratchett, Neil Gaiman".to_string()],
        );
        assert_eq!(book.primary_author(), Some("Terry Pratchett"));
        assert_eq!(BookMetadata::new("x", vec![]).primary_author(), None);
    }

    #[test]
    fn test_query_title_falls_back_to_title() {
        let mut book = BookMetadata::new("Dune (Dune Chronicles, #1)", vec![]);
        assert_eq!(book.query_title(), "Dune (Dune Chronicles, #1)");
        book.search_title = Some("Dune".to_string());
        assert_eq!(book.query_title(), "Dune");
    }
}
