use xxhash_rust::xxh3;

/// Derives a database-safe identifier from a readable composite name.
///
/// OVSDB identifiers referenced from match expressions must be alphanumeric
/// and start with a letter, and the readable names we build (`ns_policy`,
/// `ns.policy.ingress.0`) contain neither guarantee. The result is a fixed
/// 33-character string: a leading `a` followed by the 128-bit xxh3 of the
/// readable name in hex. The hash is pure, so the same readable name maps to
/// the same identifier across restarts.
pub fn hash_for_db(readable: &str) -> String {
    format!("a{:032x}", xxh3::xxh3_128(readable.as_bytes()))
}
