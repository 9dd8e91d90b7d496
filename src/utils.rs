use chrono::{DateTime, Utc};
use rand::Rng;

/// Anti-cache token for polling URLs: epoch milliseconds plus a random 0..1000 offset,
/// the same shape the portal's own dashboard script appends as `_=`.
pub fn cache_buster<R: Rng>(now: DateTime<Utc>, rng: &mut R) -> String {
    let offset: i64 = rng.random_range(0..1000);
    (now.timestamp_millis() + offset).to_string()
}
