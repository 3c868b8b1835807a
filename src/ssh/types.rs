//! SSH session phase and ID generation (spec §4.8).

use rand::Rng;

/// State machine driving a single SSH connection (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Opened,
    Interactive,
    Closing,
    Closed,
}

const SLUG_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SLUG_LEN: usize = 10;

/// Random HTTP slug assigned the first time a session acquires an HTTP
/// forwarding record (spec §4.8). Ten lowercase alphanumerics always
/// satisfies the length bound in `slug::classify` and is vanishingly
/// unlikely to collide with the forbidden list.
pub fn generate_http_slug() -> String {
    let mut rng = rand::thread_rng();
    (0..SLUG_LEN)
        .map(|_| SLUG_ALPHABET[rng.gen_range(0..SLUG_ALPHABET.len())] as char)
        .collect()
}

pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 8] = rng.gen();
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slug::{self, SlugVerdict};

    #[test]
    fn generated_slug_is_well_formed() {
        for _ in 0..50 {
            let slug = generate_http_slug();
            assert_eq!(slug.len(), SLUG_LEN);
            assert_eq!(slug::classify(&slug), SlugVerdict::Valid);
        }
    }

    #[test]
    fn session_ids_are_distinct() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_ne!(a, b);
    }
}
