//! Human readable resource identifiers, e.g. `user-x3k9qa`.

use std::sync::LazyLock;

use rand::RngCore;
use sha2::{Digest, Sha256};

const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz1234567890";
const CODE_LENGTH: u32 = 6;
// 36^6 codes. The multiplier is coprime with 36 so the mix is a bijection.
const SPACE: u64 = 36u64.pow(CODE_LENGTH);
const MULTIPLIER: u64 = 1_000_003;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

static SALT: LazyLock<u64> = LazyLock::new(|| fnv1a(&machine_id()));

/// Resource kind, used as identifier prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceId(&'static str);

pub const USER: ResourceId = ResourceId("user");
pub const POST: ResourceId = ResourceId("post");

impl ResourceId {
    /// Derive the identifier of the row numbered `counter`.
    pub fn new(&self, counter: u64) -> String {
        format!("{}-{}", self.0, encode(counter, *SALT))
    }
}

fn encode(counter: u64, salt: u64) -> String {
    let mixed = ((counter % SPACE) as u128 * MULTIPLIER as u128 + (salt % SPACE) as u128)
        % SPACE as u128;
    let mut mixed = mixed as u64;

    let mut code = [0u8; CODE_LENGTH as usize];
    for slot in code.iter_mut().rev() {
        *slot = ALPHABET[(mixed % ALPHABET.len() as u64) as usize];
        mixed /= ALPHABET.len() as u64;
    }

    // ALPHABET is ASCII.
    code.iter().map(|&b| b as char).collect()
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET, |hash, &b| {
        (hash ^ b as u64).wrapping_mul(FNV_PRIME)
    })
}

/// First bytes of a machine fingerprint.
fn machine_id() -> [u8; 3] {
    let mut id = [0u8; 3];

    let source = std::fs::read_to_string("/etc/machine-id")
        .ok()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty())
        .or_else(|| sysinfo::System::host_name().filter(|s| !s.is_empty()));

    match source {
        Some(source) => {
            let digest = Sha256::digest(source.as_bytes());
            id.copy_from_slice(&digest[..3]);
        },
        None => {
            tracing::warn!("no machine id nor hostname, using random resource id salt");
            rand::thread_rng().fill_bytes(&mut id);
        },
    }

    id
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_format() {
        let id = USER.new(42);
        let (prefix, code) = id.split_once('-').unwrap();
        assert_eq!(prefix, "user");
        assert_eq!(code.len(), 6);
        assert!(code.bytes().all(|b| ALPHABET.contains(&b)));
        assert!(POST.new(42).starts_with("post-"));
    }

    #[test]
    fn test_stable_and_unique() {
        assert_eq!(USER.new(7), USER.new(7));

        let codes: HashSet<String> = (0..10_000).map(|n| encode(n, 12345)).collect();
        assert_eq!(codes.len(), 10_000);
    }

    #[test]
    fn test_fnv1a() {
        assert_eq!(fnv1a(b""), FNV_OFFSET);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
    }
}
