use xxhash_rust::xxh3::xxh3_64;
use xxhash_rust::xxh3::Xxh3;

/// Stable hasher for identifiers that end up in storage paths and caches.
///
/// The hashes must be stable across runs, machines and versions, so the
/// default `std` hasher (randomly seeded) is not an option here.
pub type IdentifierHasher = Xxh3;

pub fn hash_string(s: &str) -> String {
  hash_bytes(s.as_bytes())
}

pub fn hash_bytes(s: &[u8]) -> String {
  format!("{:016x}", xxh3_64(s))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn is_stable() {
    assert_eq!(hash_string("react@18.2.0"), hash_string("react@18.2.0"));
    assert_ne!(hash_string("react@18.2.0"), hash_string("react@18.2.1"));
    assert_eq!(hash_string("").len(), 16);
  }
}
