//! Deterministic placeholder images
//!
//! The universal last-resort image source. Maps a query string to a stable
//! pseudo-random Picsum Photos URL via a seed derived from the query, so the
//! same query always yields the same image. Pure and total; every cascade
//! bottoms out here, which is why nothing in this module can fail.

const PLACEHOLDER_BASE_URL: &str = "https://picsum.photos";

/// 32-bit signed folding hash over the UTF-16 code units of `s`
///
/// Mirrors the seed scheme of the browser client (`h = h*31 + unit` with
/// wrapping arithmetic, absolute value taken) so placeholder URLs stay stable
/// across both implementations.
pub fn hash_seed(s: &str) -> u32 {
    let mut hash: i32 = 0;
    for unit in s.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(unit as i32);
    }
    hash.unsigned_abs()
}

/// Stable placeholder image URL for a query
pub fn placeholder_url(query: &str) -> String {
    format!("{}/seed/{}/600/400", PLACEHOLDER_BASE_URL, hash_seed(query))
}
