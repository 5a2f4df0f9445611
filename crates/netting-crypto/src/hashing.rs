use netting_core::{Lock, Locksroot, Secret};
use rand::RngCore;

/// BLAKE3 hash (32 bytes).
pub type Hash = [u8; 32];

/// Hash arbitrary data using BLAKE3.
pub fn hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Compute the Merkle root of a list of hashes.
///
/// Empty input yields the zero hash; a single element is its own root. An odd
/// element at any level is paired with itself.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return [0u8; 32];
    }

    let mut level: Vec<Hash> = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                let mut combined = [0u8; 64];
                combined[..32].copy_from_slice(&pair[0]);
                combined[32..].copy_from_slice(right);
                hash(&combined)
            })
            .collect();
    }
    level[0]
}

/// Root committing to a set of pending locks, independent of insertion order.
pub fn locksroot<'a, I>(locks: I) -> Locksroot
where
    I: IntoIterator<Item = &'a Lock>,
{
    let mut leaves: Vec<Hash> = locks.into_iter().map(Lock::digest).collect();
    leaves.sort_unstable();
    Locksroot(merkle_root(&leaves))
}

/// Fresh random secret for a new hashlock.
pub fn generate_secret() -> Secret {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    Secret(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netting_core::SecretHash;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(hash(b"netting"), hash(b"netting"));
        assert_ne!(hash(b"a"), hash(b"b"));
    }

    #[test]
    fn test_merkle_root_edge_cases() {
        assert_eq!(merkle_root(&[]), [0u8; 32]);
        let h = hash(b"only");
        assert_eq!(merkle_root(&[h]), h);
    }

    #[test]
    fn test_merkle_root_odd_count() {
        let a = hash(b"a");
        let b = hash(b"b");
        let c = hash(b"c");
        let mut ab = Vec::new();
        ab.extend_from_slice(&a);
        ab.extend_from_slice(&b);
        let mut cc = Vec::new();
        cc.extend_from_slice(&c);
        cc.extend_from_slice(&c);
        let mut top = Vec::new();
        top.extend_from_slice(&hash(&ab));
        top.extend_from_slice(&hash(&cc));
        assert_eq!(merkle_root(&[a, b, c]), hash(&top));
    }

    #[test]
    fn test_locksroot_is_order_independent() {
        let l1 = Lock::new(1, SecretHash([1u8; 32]), 10);
        let l2 = Lock::new(2, SecretHash([2u8; 32]), 10);
        let l3 = Lock::new(3, SecretHash([3u8; 32]), 12);
        assert_eq!(locksroot([&l1, &l2, &l3]), locksroot([&l3, &l1, &l2]));
        assert_ne!(locksroot([&l1, &l2]), locksroot([&l1, &l3]));
    }

    #[test]
    fn test_empty_locksroot_is_zero() {
        assert_eq!(locksroot(std::iter::empty::<&Lock>()), Locksroot::ZERO);
    }

    #[test]
    fn test_generate_secret_unique() {
        let a = generate_secret();
        let b = generate_secret();
        assert_ne!(a, b);
        assert_ne!(a.hashlock(), b.hashlock());
    }
}
