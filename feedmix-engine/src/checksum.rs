// ---------------------------------------------------------------------------
// FNV-1a hashing
// ---------------------------------------------------------------------------
//
// Fast, stable, non-cryptographic 64-bit hash. Used for snapshot corruption
// detection, deterministic experiment bucketing and time-bucket seeds.
// Stable across processes and platforms, unlike `DefaultHasher`.
// ---------------------------------------------------------------------------

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Hash a byte slice with 64-bit FNV-1a.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
	let mut hash = FNV_OFFSET;
	for b in bytes {
		hash ^= *b as u64;
		hash = hash.wrapping_mul(FNV_PRIME);
	}
	hash
}

/// Hash several string parts, separated so `("ab", "c")` and `("a", "bc")`
/// do not collide.
pub fn fnv1a64_parts(parts: &[&str]) -> u64 {
	let mut hash = FNV_OFFSET;
	for (i, part) in parts.iter().enumerate() {
		if i > 0 {
			hash ^= 0x1f;
			hash = hash.wrapping_mul(FNV_PRIME);
		}
		for b in part.as_bytes() {
			hash ^= *b as u64;
			hash = hash.wrapping_mul(FNV_PRIME);
		}
	}
	hash
}

/// Hex rendering used for stored checksums.
pub fn checksum_hex(bytes: &[u8]) -> String {
	format!("{:016x}", fnv1a64(bytes))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn known_vectors() {
		assert_eq!(fnv1a64(b""), 0xcbf29ce484222325);
		assert_eq!(fnv1a64(b"a"), 0xaf63dc4c8601ec8c);
	}

	#[test]
	fn parts_are_separated() {
		assert_ne!(fnv1a64_parts(&["ab", "c"]), fnv1a64_parts(&["a", "bc"]));
		assert_eq!(fnv1a64_parts(&["abc"]), fnv1a64(b"abc"));
	}

	#[test]
	fn hex_is_fixed_width() {
		assert_eq!(checksum_hex(b"").len(), 16);
	}
}
