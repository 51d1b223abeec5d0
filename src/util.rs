//! Small helpers shared by the supervisor and the registry.

use md5::{Digest, Md5};
use rand::Rng;

/// Length of generated listener identifiers
pub const LISTENER_ID_LEN: usize = 8;

/// Stable content hash used as a connection's identity.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Random lowercase hex string of `len` characters.
pub fn random_id(len: usize) -> String {
    let mut rng = rand::thread_rng();
    let mut bytes = vec![0u8; len.div_ceil(2)];
    rng.fill(bytes.as_mut_slice());

    let mut id: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    id.truncate(len);
    id
}

pub fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Source of registry scores (epoch milliseconds).
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_md5_hex() {
        assert_eq!(content_hash(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(content_hash(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn test_random_id_shape() {
        let id = random_id(LISTENER_ID_LEN);
        assert_eq!(id.len(), 8);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));

        assert_eq!(random_id(5).len(), 5);
        assert_ne!(random_id(16), random_id(16));
    }

    #[test]
    fn test_format_tcp_addr() {
        assert_eq!(format_tcp_addr("127.0.0.1", 1080), "127.0.0.1:1080");
        assert_eq!(format_tcp_addr("::1", 1080), "[::1]:1080");
        assert_eq!(format_tcp_addr("[::1]", 1080), "[::1]:1080");
    }

    #[test]
    fn test_system_clock_is_epoch_millis() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
