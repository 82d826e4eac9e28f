//! Location record types
//!
//! A `LocationRecord` is one extracted point of interest produced by the
//! upstream location-extraction call and consumed by the image resolver.
//! The resolver treats `quote` as opaque; only `kind` and `image_query`
//! drive resolution strategy.

use serde::{Deserialize, Serialize};

/// Whether a location exists in the real world or only inside the book
///
/// Determines the resolution strategy: real locations are photo-searched,
/// fictional locations go through the generative cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LocationKind {
    #[default]
    Real,
    Fictional,
}

/// Origin of the user request (book title vs. place-name list)
///
/// Carried through to presentation; irrelevant to image resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PostcardMode {
    #[default]
    Book,
    Place,
}

/// One extracted point of interest
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
    /// Display name in the book's native language
    pub location: String,
    /// English display name (may equal `location`)
    #[serde(default)]
    pub location_en: String,
    /// Real vs. fictional, selects the resolution strategy
    #[serde(default, rename = "type")]
    pub kind: LocationKind,
    /// Associated text excerpt (opaque to the resolver)
    #[serde(default)]
    pub quote: String,
    /// Text used as search query or generation prompt
    #[serde(default)]
    pub image_query: String,
    /// Resolved image URL; empty until resolution completes
    #[serde(default)]
    pub image_url: String,
    /// Book vs. place origin
    #[serde(default)]
    pub mode: PostcardMode,
}

impl LocationRecord {
    /// Effective image query: the extracted query, or a synthesized
    /// "<english name> atmospheric cinematic" when extraction left it empty.
    pub fn effective_image_query(&self) -> String {
        if !self.image_query.trim().is_empty() {
            return self.image_query.clone();
        }
        let name = if self.location_en.trim().is_empty() {
            &self.location
        } else {
            &self.location_en
        };
        format!("{} atmospheric cinematic", name)
    }
}
