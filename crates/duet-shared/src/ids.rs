use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;
use tracing::warn;

static FALLBACK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Generate a 128-bit random identifier as 32 hex characters.
///
/// Uses the operating system's secure random source. Only if that source
/// fails is a time-and-counter id produced instead; such ids are unique
/// within the process but predictable.
pub fn generate_secure_id() -> String {
    let mut bytes = [0u8; 16];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => hex::encode(bytes),
        Err(e) => {
            warn!(error = %e, "Secure random source unavailable, using fallback id");
            fallback_id()
        }
    }
}

fn fallback_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let count = FALLBACK_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:016x}{:016x}", nanos, splitmix64(nanos ^ count.rotate_left(32)))
}

// splitmix64 finalizer
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_secure_id_format() {
        let id = generate_secure_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_secure_ids_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_secure_id()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_fallback_ids_unique_and_sized() {
        let ids: HashSet<String> = (0..1000).map(|_| fallback_id()).collect();
        assert_eq!(ids.len(), 1000);
        assert!(ids.iter().all(|id| id.len() == 32));
    }
}
