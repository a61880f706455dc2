//! Correlation identifier generation.
//!
//! Format: `{label}-{unix millis}-{sequence}`. The sequence is a process-wide
//! monotonic counter, so two calls within the same millisecond still differ.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Generate a correlation identifier prefixed with `label`.
///
/// # Example
///
/// ```
/// use hachi_nio::generate_id;
///
/// let id = generate_id("HB");
/// assert!(id.starts_with("HB-"));
/// ```
pub fn generate_id(label: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);

    format!("{}-{}-{}", label, millis, seq)
}

/// Generate a random identifier for an accepted connection.
pub(crate) fn generate_peer_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_id_format() {
        let id = generate_id("REQ");
        let parts: Vec<&str> = id.split('-').collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "REQ");
        assert!(parts[1].parse::<u128>().is_ok());
        assert!(parts[2].parse::<u64>().is_ok());
    }

    #[test]
    fn test_generate_id_uniqueness_under_rapid_calls() {
        let ids: HashSet<String> = (0..10_000).map(|_| generate_id("X")).collect();
        assert_eq!(ids.len(), 10_000);
    }

    #[test]
    fn test_peer_ids_are_uuids() {
        let id = generate_peer_id();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_ne!(id, generate_peer_id());
    }
}
