//! Payload checksums attached to uploaded objects.
//!
//! Every payload gets a SHA-256 digest. Containers that allow it also get a
//! Tillich–Zémor hash: a product of 2x2 matrices over GF(2^127), one factor
//! per payload bit, which makes the hash of a concatenation equal to the
//! product of the parts' hashes.

use sha2::{Digest, Sha256};

/// `x^127 + x^63 + 1` without the leading term.
const REDUCTION: u128 = (1u128 << 63) | 1;
const FIELD_MASK: u128 = (1u128 << 127) - 1;

pub const TZ_HASH_LEN: usize = 64;

/// Multiply a field element by `x`.
fn mul_x(a: u128) -> u128 {
    let carry = (a >> 126) & 1 == 1;
    let shifted = (a << 1) & FIELD_MASK;
    if carry { shifted ^ REDUCTION } else { shifted }
}

#[cfg(test)]
fn gf_mul(mut a: u128, b: u128) -> u128 {
    let mut out = 0u128;
    for bit in 0..127 {
        if (b >> bit) & 1 == 1 {
            out ^= a;
        }
        a = mul_x(a);
    }
    out
}

/// Incremental Tillich–Zémor hasher. The state is the row-major matrix
/// `[[a, b], [c, d]]`.
#[derive(Clone, Debug)]
pub struct TzHasher {
    m: [u128; 4],
}

impl Default for TzHasher {
    fn default() -> Self {
        Self { m: [1, 0, 0, 1] }
    }
}

impl TzHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        let [mut a, mut b, mut c, mut d] = self.m;
        for byte in data {
            for shift in (0..8).rev() {
                let ax = mul_x(a);
                let cx = mul_x(c);
                if (byte >> shift) & 1 == 0 {
                    // M * [[x, 1], [1, 0]]
                    (a, b, c, d) = (ax ^ b, a, cx ^ d, c);
                } else {
                    // M * [[x, x + 1], [1, 1]]
                    (a, b, c, d) = (ax ^ b, ax ^ a ^ b, cx ^ d, cx ^ c ^ d);
                }
            }
        }
        self.m = [a, b, c, d];
    }

    pub fn finalize(&self) -> [u8; TZ_HASH_LEN] {
        let mut out = [0u8; TZ_HASH_LEN];
        for (chunk, element) in out.chunks_exact_mut(16).zip(self.m) {
            chunk.copy_from_slice(&element.to_be_bytes());
        }
        out
    }
}

/// Hash of `a ‖ b` given the hashes of `a` and `b`.
#[cfg(test)]
fn tz_concat(left: &[u8; TZ_HASH_LEN], right: &[u8; TZ_HASH_LEN]) -> [u8; TZ_HASH_LEN] {
    let parse = |raw: &[u8; TZ_HASH_LEN]| -> [u128; 4] {
        let mut m = [0u128; 4];
        for (element, chunk) in m.iter_mut().zip(raw.chunks_exact(16)) {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(chunk);
            *element = u128::from_be_bytes(bytes);
        }
        m
    };
    let [a, b, c, d] = parse(left);
    let [e, f, g, h] = parse(right);
    let product = TzHasher {
        m: [
            gf_mul(a, e) ^ gf_mul(b, g),
            gf_mul(a, f) ^ gf_mul(b, h),
            gf_mul(c, e) ^ gf_mul(d, g),
            gf_mul(c, f) ^ gf_mul(d, h),
        ],
    };
    product.finalize()
}

pub fn sha256_hex(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

pub fn tz_hex(payload: &[u8]) -> String {
    let mut hasher = TzHasher::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// SHA-256 and, when `homomorphic` is set, Tillich–Zémor checksums.
pub fn payload_checksums(payload: &[u8], homomorphic: bool) -> (String, Option<String>) {
    (sha256_hex(payload), homomorphic.then(|| tz_hex(payload)))
}
