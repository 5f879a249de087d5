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
    pub fn any_nonzero(data: &[u8]) -> bool {
        data.iter().any(|b| *b != 0)
    }

    /// `concatenate` concatenates two byte-slices into a new byte-array.
    #[must_use]
    pub fn concatenate(v1: &[u8], v2: &[u8]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(v1.len() + v2.len());
        buffer.extend_from_slice(v1);
        buffer.extend_from_slice(v2);
        buffer
    }
}

pub mod u32 {
    /// `nonzero` tests if provided value is a non-zero value. Returns
    /// `None` if it was zero or `Some(value)` otherwise.
    #[must_use]
    pub fn nonzero(value: u32) -> Option<u32> {
        if value == 0 {
            None
        } else {
            Some(value)
        }
    }
}

/// `random` provides utils for the `ring::rand` secure random generator.
pub mod random {
    use once_cell::sync::Lazy;
    use ring::rand::{SecureRandom, SystemRandom};

    pub static RANDOM: Lazy<SystemRandom> = Lazy::new(SystemRandom::new);

    /// `secure_bytes` produces the specified number of secure random bytes
    /// as a byte-array.
    pub fn secure_bytes<const N: usize>() -> [u8; N] {
        let mut bytes = [0u8; N];
        RANDOM
            .fill(&mut bytes)
            .expect("BUG: system source of secure random data failed");
        bytes
    }

    /// `fill_secure_bytes` fills provided buffer with bytes from the
    /// (secure) random number generator.
    pub fn fill_secure_bytes(buffer: &mut [u8]) {
        RANDOM
            .fill(buffer)
            .expect("BUG: system source of secure random data failed");
    }
}
