use std::fmt::Write;

use sha2::{Digest as ShaDigest, Sha512};

pub type Digest = [u8; 64];

pub trait Hashable {
    fn hash(&self) -> Digest;
}

pub fn digest_of(parts: &[&[u8]]) -> Digest {
    let mut hasher = Sha512::new();
    for part in parts {
        hasher.update(part);
    }
    let result = hasher.finalize();
    let mut digest = [0u8; 64];
    digest.copy_from_slice(&result[..]);
    digest
}

/// Short hex prefix of a digest, for logs and diagnostic dumps.
pub fn short_hex(digest: &Digest) -> String {
    let mut out = String::with_capacity(16);
    for byte in &digest[..8] {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
