use std::collections::HashSet;

use parking_lot::Mutex;

/// One-time nonces for the internal-mode logout handshake.
///
/// A browser that is asked to re-authenticate after logout will call the
/// logout endpoint again with the same nonce; the first call records it,
/// the second call consumes it and completes the logout.
#[derive(Default)]
pub struct NonceStore {
    nonces: Mutex<HashSet<String>>,
}

impl NonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the nonce was already recorded (and consumes
    /// it); otherwise records it and returns `false`.
    pub fn take(&self, nonce: &str) -> bool {
        let mut nonces = self.nonces.lock();
        if nonces.remove(nonce) {
            true
        } else {
            nonces.insert(nonce.to_string());
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_call_with_same_nonce_completes() {
        let store = NonceStore::new();
        assert!(!store.take("n1"));
        assert!(store.take("n1"));
        // consumed, so a third call starts over
        assert!(!store.take("n1"));
    }

    #[test]
    fn distinct_nonces_are_independent() {
        let store = NonceStore::new();
        assert!(!store.take("a"));
        assert!(!store.take("b"));
        assert!(store.take("a"));
        assert!(store.take("b"));
    }
}
