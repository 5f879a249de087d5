// SPDX-License-Identifier: LGPL-3.0-only

use num_bigint::{BigInt, BigUint};

use crate::utils;

/// `CryptoError` represents errors from cryptographic verifications.
#[derive(Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// Verification failure of some cryptographic requirement.
    VerificationFailure(&'static str),
}

#[allow(non_snake_case)]
pub mod DH {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    use crate::utils;

    use super::CryptoError;

    /// GENERATOR (g): 2
    pub static GENERATOR: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u8));

    /// Modulus of the 1536-bit MODP group (RFC 3526, group 5) used by all
    /// OTR v2/v3 Diffie-Hellman operations.
    pub static MODULUS: Lazy<BigUint> = Lazy::new(|| {
        BigUint::from_bytes_be(&[
            0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xC9, 0x0F, 0xDA, 0xA2, 0x21, 0x68,
            0xC2, 0x34, 0xC4, 0xC6, 0x62, 0x8B, 0x80, 0xDC, 0x1C, 0xD1, 0x29, 0x02, 0x4E, 0x08,
            0x8A, 0x67, 0xCC, 0x74, 0x02, 0x0B, 0xBE, 0xA6, 0x3B, 0x13, 0x9B, 0x22, 0x51, 0x4A,
            0x08, 0x79, 0x8E, 0x34, 0x04, 0xDD, 0xEF, 0x95, 0x19, 0xB3, 0xCD, 0x3A, 0x43, 0x1B,
            0x30, 0x2B, 0x0A, 0x6D, 0xF2, 0x5F, 0x14, 0x37, 0x4F, 0xE1, 0x35, 0x6D, 0x6D, 0x51,
            0xC2, 0x45, 0xE4, 0x85, 0xB5, 0x76, 0x62, 0x5E, 0x7E, 0xC6, 0xF4, 0x4C, 0x42, 0xE9,
            0xA6, 0x37, 0xED, 0x6B, 0x0B, 0xFF, 0x5C, 0xB6, 0xF4, 0x06, 0xB7, 0xED, 0xEE, 0x38,
            0x6B, 0xFB, 0x5A, 0x89, 0x9F, 0xA5, 0xAE, 0x9F, 0x24, 0x11, 0x7C, 0x4B, 0x1F, 0xE6,
            0x49, 0x28, 0x66, 0x51, 0xEC, 0xE4, 0x5B, 0x3D, 0xC2, 0x00, 0x7C, 0xB8, 0xA1, 0x63,
            0xBF, 0x05, 0x98, 0xDA, 0x48, 0x36, 0x1C, 0x55, 0xD3, 0x9A, 0x69, 0x16, 0x3F, 0xA8,
            0xFD, 0x24, 0xCF, 0x5F, 0x83, 0x65, 0x5D, 0x23, 0xDC, 0xA3, 0xAD, 0x96, 0x1C, 0x62,
            0xF3, 0x56, 0x20, 0x85, 0x52, 0xBB, 0x9E, 0xD5, 0x29, 0x07, 0x70, 0x96, 0x96, 0x6D,
            0x67, 0x0C, 0x35, 0x4E, 0x4A, 0xBC, 0x98, 0x04, 0xF1, 0x74, 0x6C, 0x08, 0xCA, 0x23,
            0x73, 0x27, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
        ])
    });

    /// Modulus - 2
    pub static MODULUS_MINUS_TWO: Lazy<BigUint> = Lazy::new(|| &*MODULUS - 2u8);

    /// Q: the order of the subgroup, `(modulus - 1) / 2`. The exponents in
    /// the SMP zero-knowledge proofs are computed modulo this value.
    pub static Q: Lazy<BigUint> = Lazy::new(|| (&*MODULUS - 1u8) >> 1);

    /// Private-key length in bytes. OTR requires DH private keys of at
    /// least 320 bits.
    const PRIVATE_KEY_LEN: usize = 40;

    /// `SharedSecret` is the result of the DH key agreement.
    pub type SharedSecret = BigUint;

    pub fn verify_public_key(public_key: &BigUint) -> Result<(), CryptoError> {
        if public_key >= &*GENERATOR && public_key <= &*MODULUS_MINUS_TWO {
            Ok(())
        } else {
            Err(CryptoError::VerificationFailure(
                "DH public key fails verification.",
            ))
        }
    }

    #[derive(Clone)]
    pub struct Keypair {
        private: BigUint,
        pub public: BigUint,
    }

    impl Keypair {
        /// `generate` produces a new DH keypair with a 320-bit private
        /// exponent.
        #[must_use]
        pub fn generate() -> Keypair {
            let private =
                BigUint::from_bytes_be(&utils::random::secure_bytes::<PRIVATE_KEY_LEN>());
            let public = GENERATOR.modpow(&private, &MODULUS);
            Keypair { private, public }
        }

        /// `generate_shared_secret` computes the shared secret with the
        /// other party's public key.
        #[must_use]
        pub fn generate_shared_secret(&self, public_key: &BigUint) -> SharedSecret {
            public_key.modpow(&self.private, &MODULUS)
        }
    }
}

#[allow(non_snake_case)]
pub mod AES128 {
    use aes_ctr::{
        cipher::{generic_array::GenericArray, NewStreamCipher, SyncStreamCipher},
        Aes128Ctr,
    };

    use crate::utils;

    pub const KEY_LENGTH: usize = 16;

    #[derive(Clone)]
    pub struct Key(pub [u8; KEY_LENGTH]);

    impl Drop for Key {
        fn drop(&mut self) {
            self.0 = [0u8; KEY_LENGTH];
        }
    }

    impl Key {
        #[must_use]
        pub fn generate() -> Self {
            Self(utils::random::secure_bytes::<KEY_LENGTH>())
        }

        #[must_use]
        pub fn encrypt(&self, nonce: &[u8; 16], data: &[u8]) -> Vec<u8> {
            self.crypt(nonce, data)
        }

        #[must_use]
        pub fn decrypt(&self, nonce: &[u8; 16], data: &[u8]) -> Vec<u8> {
            self.crypt(nonce, data)
        }

        /// `crypt` provides both the encrypting and decrypting logic, as
        /// both are the same operation in counter mode.
        fn crypt(&self, nonce: &[u8; 16], data: &[u8]) -> Vec<u8> {
            let mut result = Vec::from(data);
            let key = GenericArray::from_slice(&self.0);
            let nonce = GenericArray::from_slice(nonce);
            let mut cipher = Aes128Ctr::new(key, nonce);
            cipher.apply_keystream(result.as_mut_slice());
            result
        }
    }
}

#[allow(non_snake_case)]
pub mod SHA1 {
    pub const DIGEST_LEN: usize = 20;

    pub fn digest(data: &[u8]) -> [u8; DIGEST_LEN] {
        let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, data);
        let mut result = [0u8; DIGEST_LEN];
        result.clone_from_slice(digest.as_ref());
        result
    }

    /// `hmac` calculates the HMAC-SHA1 value as used to authenticate data
    /// messages.
    pub fn hmac(key: &[u8], data: &[u8]) -> [u8; DIGEST_LEN] {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
        let digest = ring::hmac::sign(&key, data);
        let mut result = [0u8; DIGEST_LEN];
        result.clone_from_slice(digest.as_ref());
        result
    }
}

#[allow(non_snake_case)]
pub mod SHA256 {
    /// `digest` calculates the SHA256 digest value.
    pub fn digest(data: &[u8]) -> [u8; 32] {
        let digest = ring::digest::digest(&ring::digest::SHA256, data);
        let mut result = [0u8; 32];
        result.clone_from_slice(digest.as_ref());
        result
    }

    /// `digest_with_prefix` calculates the SHA256 digest over the data
    /// prefixed with a single version byte, as used throughout SMP.
    pub fn digest_with_prefix(b: u8, data: &[u8]) -> [u8; 32] {
        let mut bytes = Vec::with_capacity(data.len() + 1);
        bytes.push(b);
        bytes.extend_from_slice(data);
        digest(&bytes)
    }

    /// `hmac` calculates the SHA256-HMAC value, using key 'm1' as
    /// documented in the OTR spec.
    pub fn hmac(m1: &[u8], data: &[u8]) -> [u8; 32] {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, m1);
        let digest = ring::hmac::sign(&key, data);
        let mut result = [0u8; 32];
        result.clone_from_slice(digest.as_ref());
        result
    }

    /// `hmac160` calculates the first 160 bits of the SHA256-HMAC value,
    /// using key 'm2' as documented in the OTR spec.
    pub fn hmac160(m2: &[u8], data: &[u8]) -> [u8; 20] {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, m2);
        let digest = ring::hmac::sign(&key, data);
        let mut result = [0u8; 20];
        result.clone_from_slice(&digest.as_ref()[..20]);
        result
    }
}

/// `OTR` contains the OTR-protocol-specific key derivations.
#[allow(non_snake_case)]
pub mod OTR {
    use super::{AES128, SHA256};

    pub const SSID_LEN: usize = 8;
    pub type SSID = [u8; SSID_LEN];

    /// `AKESecrets` are the secrets derived from the shared secret
    /// established during the AKE.
    pub struct AKESecrets {
        pub ssid: SSID,
        pub c: AES128::Key,
        pub cp: AES128::Key,
        pub m1: [u8; 32],
        pub m1p: [u8; 32],
        pub m2: [u8; 32],
        pub m2p: [u8; 32],
    }

    impl Drop for AKESecrets {
        fn drop(&mut self) {
            self.ssid = [0u8; 8];
            self.m1 = [0u8; 32];
            self.m1p = [0u8; 32];
            self.m2 = [0u8; 32];
            self.m2p = [0u8; 32];
        }
    }

    impl AKESecrets {
        /// Derive the shared secrets used by OTR v2/v3 from the MPI-encoded
        /// shared secret of the DH key exchange.
        #[must_use]
        pub fn derive(secbytes: &[u8]) -> AKESecrets {
            let h2secret0 = h2(0x00, secbytes);
            let h2secret1 = h2(0x01, secbytes);
            AKESecrets {
                ssid: h2secret0[..8]
                    .try_into()
                    .expect("BUG: incorrect digest slice length"),
                c: AES128::Key(
                    h2secret1[..16]
                        .try_into()
                        .expect("BUG: incorrect digest slice length"),
                ),
                cp: AES128::Key(
                    h2secret1[16..]
                        .try_into()
                        .expect("BUG: incorrect digest slice length"),
                ),
                m1: h2(0x02, secbytes),
                m2: h2(0x03, secbytes),
                m1p: h2(0x04, secbytes),
                m2p: h2(0x05, secbytes),
            }
        }
    }

    fn h2(b: u8, secbytes: &[u8]) -> [u8; 32] {
        SHA256::digest_with_prefix(b, secbytes)
    }
}

#[allow(non_snake_case)]
pub mod DSA {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;

    use crate::encoding::OTREncoder;
    use crate::utils;

    use super::{is_probable_prime, modinverse, CryptoError, SHA1};

    pub const SIGNATURE_LEN: usize = 40;
    /// DSA signature in IEEE-P1363 representation: `r` and `s`, each 20
    /// bytes big-endian.
    pub type Signature = [u8; SIGNATURE_LEN];

    pub const FINGERPRINT_LEN: usize = 20;
    pub type Fingerprint = [u8; FINGERPRINT_LEN];

    const P_BIT_LENGTH: u64 = 1024;
    const Q_BIT_LENGTH: u64 = 160;

    /// Shared DSA domain parameters. Generating the 1024/160-bit domain is
    /// by far the most expensive operation in this module, so it is done
    /// once per process; individual keypairs are cheap.
    static PARAMS: Lazy<Parameters> = Lazy::new(Parameters::generate);

    #[derive(Clone)]
    struct Parameters {
        p: BigUint,
        q: BigUint,
        g: BigUint,
    }

    impl Parameters {
        fn generate() -> Parameters {
            log::debug!("Generating DSA domain parameters.");
            let q = generate_prime(Q_BIT_LENGTH);
            let two_q: BigUint = &q << 1;
            let p = loop {
                let mut bytes = [0u8; (P_BIT_LENGTH / 8) as usize];
                utils::random::fill_secure_bytes(&mut bytes);
                bytes[0] |= 0x80;
                let x = BigUint::from_bytes_be(&bytes);
                // p = x - (x mod 2q) + 1, such that p = 1 (mod 2q)
                let candidate = &x - (&x % &two_q) + 1u8;
                if candidate.bits() == P_BIT_LENGTH && is_probable_prime(&candidate) {
                    break candidate;
                }
            };
            let e = (&p - 1u8) / &q;
            let mut h = BigUint::from(2u8);
            let g = loop {
                let g = h.modpow(&e, &p);
                if g > BigUint::from(1u8) {
                    break g;
                }
                h += 1u8;
            };
            log::debug!("DSA domain parameters generated.");
            Parameters { p, q, g }
        }
    }

    fn generate_prime(bits: u64) -> BigUint {
        loop {
            let mut bytes = vec![0u8; (bits / 8) as usize];
            utils::random::fill_secure_bytes(&mut bytes);
            bytes[0] |= 0x80;
            let len = bytes.len();
            bytes[len - 1] |= 0x01;
            let candidate = BigUint::from_bytes_be(&bytes);
            if is_probable_prime(&candidate) {
                return candidate;
            }
        }
    }

    #[derive(Clone)]
    pub struct Keypair {
        private: BigUint,
        public: PublicKey,
    }

    impl Keypair {
        /// `generate` produces a keypair on the shared domain parameters.
        #[must_use]
        pub fn generate() -> Keypair {
            let params = PARAMS.clone();
            let x = random_in_group(&params.q);
            let y = params.g.modpow(&x, &params.p);
            Keypair {
                private: x,
                public: PublicKey {
                    p: params.p,
                    q: params.q,
                    g: params.g,
                    y,
                },
            }
        }

        #[must_use]
        pub fn public_key(&self) -> PublicKey {
            self.public.clone()
        }

        /// `sign` signs the 32-byte value M. Per OTR, M is taken modulo q
        /// instead of being truncated as described in FIPS-186, and it is
        /// not hashed again.
        #[must_use]
        pub fn sign(&self, content: &[u8; 32]) -> Signature {
            let q = &self.public.q;
            let z = BigUint::from_bytes_be(content) % q;
            loop {
                let k = random_in_group(q);
                let r = self.public.g.modpow(&k, &self.public.p) % q;
                if r == BigUint::from(0u8) {
                    continue;
                }
                let kinv = match modinverse(&k, q) {
                    Some(inv) => inv,
                    None => continue,
                };
                let s = (&kinv * ((&z + &self.private * &r) % q)) % q;
                if s == BigUint::from(0u8) {
                    continue;
                }
                let mut signature = [0u8; SIGNATURE_LEN];
                into_fixed(&mut signature[..20], &r);
                into_fixed(&mut signature[20..], &s);
                return signature;
            }
        }
    }

    #[derive(Clone)]
    pub struct PublicKey {
        pub p: BigUint,
        pub q: BigUint,
        pub g: BigUint,
        pub y: BigUint,
    }

    impl PublicKey {
        pub fn verify(&self, signature: &Signature, content: &[u8; 32]) -> Result<(), CryptoError> {
            let r = BigUint::from_bytes_be(&signature[..20]);
            let s = BigUint::from_bytes_be(&signature[20..]);
            let zero = BigUint::from(0u8);
            if r == zero || r >= self.q || s == zero || s >= self.q {
                return Err(CryptoError::VerificationFailure(
                    "DSA signature components out of range.",
                ));
            }
            let w = modinverse(&s, &self.q).ok_or(CryptoError::VerificationFailure(
                "DSA signature: no inverse for s.",
            ))?;
            let z = BigUint::from_bytes_be(content) % &self.q;
            let u1 = (&z * &w) % &self.q;
            let u2 = (&r * &w) % &self.q;
            let v = ((self.g.modpow(&u1, &self.p) * self.y.modpow(&u2, &self.p)) % &self.p) % &self.q;
            if v == r {
                Ok(())
            } else {
                Err(CryptoError::VerificationFailure(
                    "DSA signature fails verification.",
                ))
            }
        }

        /// `fingerprint` is the SHA-1 hash of the byte-level public key
        /// representation, excluding the leading public-key-type field.
        #[must_use]
        pub fn fingerprint(&self) -> Fingerprint {
            SHA1::digest(
                &OTREncoder::new()
                    .write_mpi(&self.p)
                    .write_mpi(&self.q)
                    .write_mpi(&self.g)
                    .write_mpi(&self.y)
                    .to_vec(),
            )
        }

        /// `fingerprint_hex` renders the fingerprint for host display.
        #[must_use]
        pub fn fingerprint_hex(&self) -> String {
            hex::encode(self.fingerprint())
        }
    }

    /// Random value in `[1, q)`.
    fn random_in_group(q: &BigUint) -> BigUint {
        let zero = BigUint::from(0u8);
        loop {
            let mut bytes = vec![0u8; ((q.bits() + 7) / 8) as usize];
            utils::random::fill_secure_bytes(&mut bytes);
            let v = BigUint::from_bytes_be(&bytes);
            if v > zero && &v < q {
                return v;
            }
        }
    }

    fn into_fixed(dst: &mut [u8], v: &BigUint) {
        let bytes = v.to_bytes_be();
        assert!(dst.len() >= bytes.len());
        let start = dst.len() - bytes.len();
        dst[start..].copy_from_slice(&bytes);
    }
}

pub mod constant {
    use super::CryptoError;

    /// `verify` compares two byte-slices in constant time.
    pub fn verify(expected: &[u8], actual: &[u8]) -> Result<(), CryptoError> {
        ring::constant_time::verify_slices_are_equal(expected, actual).map_err(|_| {
            CryptoError::VerificationFailure("Data does not match the expected value.")
        })
    }
}

/// `modinverse` computes the modular multiplicative inverse of `a` modulo
/// `m` with the extended Euclidean algorithm, or `None` if none exists.
pub(crate) fn modinverse(a: &BigUint, m: &BigUint) -> Option<BigUint> {
    let zero = BigInt::from(0u8);
    let one = BigInt::from(1u8);
    let modulus = BigInt::from(m.clone());
    let mut t = zero.clone();
    let mut newt = one.clone();
    let mut r = modulus.clone();
    let mut newr = BigInt::from(a % m);
    while newr != zero {
        let quotient = &r / &newr;
        let tmp = &t - &quotient * &newt;
        t = newt;
        newt = tmp;
        let tmp = &r - &quotient * &newr;
        r = newr;
        newr = tmp;
    }
    if r != one {
        return None;
    }
    if t < zero {
        t += &modulus;
    }
    t.to_biguint()
}

const SMALL_PRIMES: [u32; 54] = [
    2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37, 41, 43, 47, 53, 59, 61, 67, 71, 73, 79, 83, 89,
    97, 101, 103, 107, 109, 113, 127, 131, 137, 139, 149, 151, 157, 163, 167, 173, 179, 181, 191,
    193, 197, 199, 211, 223, 227, 229, 233, 239, 241, 251,
];

const MILLER_RABIN_ROUNDS: usize = 40;

/// `is_probable_prime` tests primality with trial division by small primes
/// followed by Miller-Rabin with random witnesses.
pub(crate) fn is_probable_prime(n: &BigUint) -> bool {
    let one = BigUint::from(1u8);
    let two = BigUint::from(2u8);
    if n <= &one {
        return false;
    }
    for p in SMALL_PRIMES {
        let p = BigUint::from(p);
        if n == &p {
            return true;
        }
        if n % &p == BigUint::from(0u8) {
            return false;
        }
    }
    let n_minus_one = n - &one;
    let s = n_minus_one
        .trailing_zeros()
        .expect("BUG: n-1 of an odd n must have trailing zeros");
    let d = &n_minus_one >> s;
    'witness: for _ in 0..MILLER_RABIN_ROUNDS {
        let a = random_witness(n);
        let mut x = a.modpow(&d, n);
        if x == one || x == n_minus_one {
            continue;
        }
        for _ in 1..s {
            x = x.modpow(&two, n);
            if x == n_minus_one {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Random Miller-Rabin witness in `[2, n-2]`.
fn random_witness(n: &BigUint) -> BigUint {
    let bound = n - 3u8;
    let len = ((bound.bits() + 7) / 8) as usize;
    loop {
        let mut bytes = vec![0u8; len];
        utils::random::fill_secure_bytes(&mut bytes);
        let v = BigUint::from_bytes_be(&bytes);
        if v <= bound {
            return v + 2u8;
        }
    }
}
