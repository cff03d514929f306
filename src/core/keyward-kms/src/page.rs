//! Opaque-marker pagination.
//!
//! Lists are sorted by a stable string key; a marker encodes the last key of
//! the previous page, so the same marker yields the same next page as long
//! as the underlying set is unchanged.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};

use crate::error::KmsError;

const MARKER_PREFIX: &str = "kw1:";

/// One page of results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Marker for the next page, if there is one.
    pub next_marker: Option<String>,
}

impl<T> Page<T> {
    /// Whether more items follow.
    pub fn truncated(&self) -> bool {
        self.next_marker.is_some()
    }
}

fn encode_marker(last: &str) -> String {
    URL_SAFE_NO_PAD.encode(format!("{MARKER_PREFIX}{last}"))
}

fn decode_marker(marker: &str) -> Result<String, KmsError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(marker)
        .map_err(|_| KmsError::InvalidMarker)?;
    let text = String::from_utf8(bytes).map_err(|_| KmsError::InvalidMarker)?;
    text.strip_prefix(MARKER_PREFIX)
        .map(str::to_string)
        .ok_or(KmsError::InvalidMarker)
}

/// Returns the page of `items` following `marker`.
pub fn paginate<T>(
    mut items: Vec<T>,
    sort_key: impl Fn(&T) -> String,
    marker: Option<&str>,
    limit: usize,
) -> Result<Page<T>, KmsError> {
    items.sort_by_key(|item| sort_key(item));

    if let Some(marker) = marker {
        let after = decode_marker(marker)?;
        items.retain(|item| sort_key(item) > after);
    }

    let next_marker = if items.len() > limit {
        items.truncate(limit);
        items.last().map(|item| encode_marker(&sort_key(item)))
    } else {
        None
    };

    Ok(Page { items, next_marker })
}
