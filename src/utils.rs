// SPDX-License-Identifier: LGPL-3.0-only

pub mod alloc {
    #[must_use]
    pub fn vec_unique<T: Ord>(mut src: Vec<T>) -> Vec<T> {
        src.sort_unstable();
        src.dedup();
        src
    }
}

pub mod bytes {
    #[must_use]
    pub fn drop_by_value(data: &[u8], v: u8) -> Vec<u8> {
        data.iter().copied().filter(|b| *b != v).collect()
    }
}

pub mod biguint {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    pub static ZERO: Lazy<BigUint> = Lazy::new(|| BigUint::from(0u8));
    pub static ONE: Lazy<BigUint> = Lazy::new(|| BigUint::from(1u8));
    pub static TWO: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u8));

    /// `to_bytes_be_fixed` encodes the value as big-endian bytes, left-padded with zeroes to
    /// exactly `N` bytes.
    ///
    /// # Panics
    ///
    /// Panics if the value does not fit in `N` bytes.
    #[must_use]
    pub fn to_bytes_be_fixed<const N: usize>(v: &BigUint) -> [u8; N] {
        let encoded = v.to_bytes_be();
        assert!(encoded.len() <= N, "BUG: value does not fit in requested size");
        let mut result = [0u8; N];
        result[N - encoded.len()..].copy_from_slice(&encoded);
        result
    }
}

pub mod random {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;
    use ring::rand::{SecureRandom, SystemRandom};

    static RANDOM: Lazy<SystemRandom> = Lazy::new(SystemRandom::new);

    pub fn fill_secure_bytes(buffer: &mut [u8]) {
        (*RANDOM)
            .fill(buffer)
            .expect("Failed to produce random bytes for random bytes array.");
    }

    #[must_use]
    pub fn secure_bytes<const N: usize>() -> [u8; N] {
        let mut bytes = [0u8; N];
        fill_secure_bytes(&mut bytes);
        bytes
    }

    /// `secure_biguint` produces a uniformly random non-negative value of `len` bytes.
    #[must_use]
    pub fn secure_biguint(len: usize) -> BigUint {
        let mut bytes = vec![0u8; len];
        fill_secure_bytes(&mut bytes);
        let value = BigUint::from_bytes_be(&bytes);
        bytes.fill(0);
        value
    }
}

pub mod u32 {
    /// `nonzero` tests if provided value is a non-zero value. Returns `None` if it was zero or
    /// `Option<value>` if larger.
    #[must_use]
    pub fn nonzero(value: u32) -> Option<u32> {
        if value == 0 {
            None
        } else {
            Some(value)
        }
    }

    pub fn verify_nonzero<E>(value: u32, err: E) -> Result<u32, E> {
        nonzero(value).ok_or(err)
    }
}
