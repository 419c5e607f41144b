// SPDX-License-Identifier: LGPL-3.0-only

pub(crate) mod dh {
    use num_bigint::BigUint;
    use once_cell::sync::Lazy;
    use zeroize::Zeroize;

    use crate::utils::{self, biguint::ONE, biguint::TWO};

    use super::CryptoError;

    /// `PRIVATE_KEY_LENGTH` is the number of bytes for a DH private key: 320 bits.
    const PRIVATE_KEY_LENGTH: usize = 40;

    /// GENERATOR (g): 2
    pub static GENERATOR: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u8));

    /// Modulus: the 1536-bit MODP group.
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

    static MODULUS_MINUS_TWO: Lazy<BigUint> = Lazy::new(|| &*MODULUS - &*TWO);

    /// Q is the order of the subgroup generated by `GENERATOR`: `(p-1)/2`.
    pub static Q: Lazy<BigUint> = Lazy::new(|| (&*MODULUS - &*ONE) >> 1usize);

    /// `verify_public_key` requires the group element to lie in `[2, p-2]`.
    pub fn verify_public_key(public_key: &BigUint) -> Result<(), CryptoError> {
        if public_key >= &*TWO && public_key <= &*MODULUS_MINUS_TWO {
            Ok(())
        } else {
            Err(CryptoError::VerificationFailure(
                "DH public key fails verification.",
            ))
        }
    }

    /// `verify_exponent` requires the exponent to lie in `[1, q)`.
    pub fn verify_exponent(exponent: &BigUint) -> Result<(), CryptoError> {
        if exponent >= &*ONE && exponent < &*Q {
            Ok(())
        } else {
            Err(CryptoError::VerificationFailure(
                "exponent is outside of the expected range.",
            ))
        }
    }

    /// `inverse` computes the modular inverse of a group element, using Fermat's little theorem.
    pub fn inverse(x: &BigUint) -> BigUint {
        x.modpow(&MODULUS_MINUS_TWO, &MODULUS)
    }

    pub type SharedSecret = BigUint;

    #[derive(Clone)]
    pub struct Keypair {
        private: BigUint,
        pub public: BigUint,
    }

    impl Drop for Keypair {
        fn drop(&mut self) {
            self.private.zeroize();
        }
    }

    impl Keypair {
        pub fn generate() -> Self {
            let private = utils::random::secure_biguint(PRIVATE_KEY_LENGTH);
            let public = GENERATOR.modpow(&private, &MODULUS);
            Self { private, public }
        }

        pub fn generate_shared_secret(&self, public_key: &BigUint) -> SharedSecret {
            public_key.modpow(&self.private, &MODULUS)
        }
    }

}

pub(crate) mod aes128 {
    use aes_ctr::{
        cipher::{generic_array::GenericArray, NewStreamCipher, SyncStreamCipher},
        Aes128Ctr,
    };

    use crate::utils;

    #[derive(Clone)]
    pub struct Key(pub [u8; 16]);

    impl Drop for Key {
        fn drop(&mut self) {
            self.0.fill(0);
        }
    }

    impl Key {
        pub fn generate() -> Self {
            Self(utils::random::secure_bytes::<16>())
        }

        pub fn encrypt(&self, nonce: &[u8; 16], data: &[u8]) -> Vec<u8> {
            self.crypt(nonce, data)
        }

        pub fn decrypt(&self, nonce: &[u8; 16], data: &[u8]) -> Vec<u8> {
            self.crypt(nonce, data)
        }

        /// crypt provides both encrypting and decrypting logic.
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

pub(crate) mod sha1 {
    pub fn digest(data: &[u8]) -> [u8; 20] {
        let digest = ring::digest::digest(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY, data);
        let mut result = [0u8; 20];
        result.clone_from_slice(digest.as_ref());
        result
    }

    /// hmac calculates the SHA1-HMAC value, as used for authenticating data messages.
    pub fn hmac(key: &[u8], data: &[u8]) -> [u8; 20] {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, key);
        let digest = ring::hmac::sign(&key, data);
        let mut result = [0u8; 20];
        result.clone_from_slice(digest.as_ref());
        result
    }
}

pub(crate) mod sha256 {
    /// digest calculates the SHA256 digest value.
    pub fn digest(data: &[u8]) -> [u8; 32] {
        let digest = ring::digest::digest(&ring::digest::SHA256, data);
        let mut result = [0u8; 32];
        result.clone_from_slice(digest.as_ref());
        result
    }

    /// hmac calculates the SHA256-HMAC value, using key 'm1' as documented for OTRv3.
    pub fn hmac(m1: &[u8], data: &[u8]) -> [u8; 32] {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, m1);
        let digest = ring::hmac::sign(&key, data);
        let mut result = [0u8; 32];
        result.clone_from_slice(digest.as_ref());
        result
    }

    /// hmac160 calculates the first 160 bits of the SHA256-HMAC value, using key 'm2' as documented
    /// for OTRv3.
    pub fn hmac160(m2: &[u8], data: &[u8]) -> [u8; 20] {
        let key = ring::hmac::Key::new(ring::hmac::HMAC_SHA256, m2);
        let digest = ring::hmac::sign(&key, data);
        let mut result = [0u8; 20];
        result.clone_from_slice(&digest.as_ref()[..20]);
        result
    }
}

pub(crate) mod constant {
    use num_bigint::BigUint;

    use super::CryptoError;

    /// `verify_bytes` compares two byte-slices in constant time.
    pub fn verify_bytes(data1: &[u8], data2: &[u8]) -> Result<(), CryptoError> {
        ring::constant_time::verify_slices_are_equal(data1, data2).or(Err(
            CryptoError::VerificationFailure("verification of equality failed"),
        ))
    }

    pub fn verify_biguint(v1: &BigUint, v2: &BigUint) -> Result<(), CryptoError> {
        verify_bytes(&v1.to_bytes_be(), &v2.to_bytes_be())
    }
}

/// DSA long-term identity keys as used by OTR version 2 and 3.
pub mod dsa {
    use ::dsa::{Components, KeySize, SigningKey, VerifyingKey};
    use num_bigint::BigUint;
    use rand::rngs::OsRng;
    use signature::hazmat::{PrehashSigner, PrehashVerifier};

    use crate::{encoding::OTREncoder, worker};

    use super::{sha1, CryptoError};

    /// `Fingerprint` is the SHA-1 hash over the encoded public key.
    pub type Fingerprint = [u8; 20];

    const Q_BITS: usize = 160;

    /// `Parameters` are the DSA domain parameters `(p, q, g)`. Keypairs generated with the same
    /// parameters only differ in their private key.
    #[derive(Clone)]
    pub struct Parameters(Components);

    impl Parameters {
        #[allow(deprecated)]
        #[must_use]
        pub fn generate() -> Self {
            Self(Components::generate(&mut OsRng, KeySize::DSA_1024_160))
        }
    }

    /// `TEST_PARAMETERS` are shared domain parameters for tests, as parameter generation is slow.
    #[cfg(test)]
    pub(crate) static TEST_PARAMETERS: once_cell::sync::Lazy<Parameters> =
        once_cell::sync::Lazy::new(Parameters::generate);

    pub struct Keypair {
        sk: SigningKey,
    }

    impl Keypair {
        /// `generate` generates fresh domain parameters and a keypair. This is expensive. See
        /// `generate_offloaded` for running it on a separate thread.
        #[must_use]
        pub fn generate() -> Self {
            Self::generate_with(&Parameters::generate())
        }

        #[must_use]
        pub fn generate_with(params: &Parameters) -> Self {
            Self {
                sk: SigningKey::generate(&mut OsRng, params.0.clone()),
            }
        }

        /// `generate_offloaded` generates a keypair on a worker thread.
        #[must_use]
        pub fn generate_offloaded() -> worker::Pending<Keypair> {
            worker::offload(Keypair::generate)
        }

        /// `from_components` restores a keypair from its components, e.g. from persistent storage.
        pub fn from_components(
            p: BigUint,
            q: BigUint,
            g: BigUint,
            y: BigUint,
            x: BigUint,
        ) -> Result<Self, CryptoError> {
            let public = PublicKey::from_components(p, q, g, y)?;
            let sk = SigningKey::from_components(public.vk, x).or(Err(
                CryptoError::VerificationFailure("invalid DSA private key"),
            ))?;
            Ok(Self { sk })
        }

        #[must_use]
        pub fn public_key(&self) -> PublicKey {
            PublicKey {
                vk: self.sk.verifying_key().clone(),
            }
        }

        #[must_use]
        pub fn q(&self) -> &BigUint {
            self.sk.verifying_key().components().q()
        }

        /// `sign` signs the 20-byte prehash value as-is. It is the caller's responsibility to
        /// reduce the message to a 20-byte value.
        pub(crate) fn sign(&self, prehash: &[u8; 20]) -> Result<Signature, CryptoError> {
            self.sk
                .sign_prehash(prehash)
                .map(Signature)
                .or(Err(CryptoError::VerificationFailure(
                    "failed to produce DSA signature",
                )))
        }
    }

    #[derive(Clone)]
    pub struct PublicKey {
        vk: VerifyingKey,
    }

    impl std::fmt::Debug for PublicKey {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("PublicKey")
                .field("fingerprint", &hex::encode(self.fingerprint()))
                .finish()
        }
    }

    impl PartialEq for PublicKey {
        fn eq(&self, other: &Self) -> bool {
            self.p() == other.p()
                && self.q() == other.q()
                && self.g() == other.g()
                && self.y() == other.y()
        }
    }

    impl Eq for PublicKey {}

    impl PublicKey {
        /// `from_components` constructs a public key. Only 160-bit `q` is accepted, as OTR
        /// signatures are fixed at 20-byte `r` and `s` values.
        pub fn from_components(
            p: BigUint,
            q: BigUint,
            g: BigUint,
            y: BigUint,
        ) -> Result<Self, CryptoError> {
            if q.bits() != Q_BITS {
                return Err(CryptoError::VerificationFailure(
                    "DSA parameter q must be 160 bits",
                ));
            }
            let components = Components::from_components(p, q, g).or(Err(
                CryptoError::VerificationFailure("invalid DSA domain parameters"),
            ))?;
            let vk = VerifyingKey::from_components(components, y).or(Err(
                CryptoError::VerificationFailure("invalid DSA public key"),
            ))?;
            Ok(Self { vk })
        }

        #[must_use]
        pub fn p(&self) -> &BigUint {
            self.vk.components().p()
        }

        #[must_use]
        pub fn q(&self) -> &BigUint {
            self.vk.components().q()
        }

        #[must_use]
        pub fn g(&self) -> &BigUint {
            self.vk.components().g()
        }

        #[must_use]
        pub fn y(&self) -> &BigUint {
            self.vk.y()
        }

        /// `fingerprint` is the SHA-1 hash of the public key encoding, excluding the key type.
        #[must_use]
        pub fn fingerprint(&self) -> Fingerprint {
            sha1::digest(
                &OTREncoder::new()
                    .write_mpi(self.p())
                    .write_mpi(self.q())
                    .write_mpi(self.g())
                    .write_mpi(self.y())
                    .to_vec(),
            )
        }

        pub(crate) fn verify(
            &self,
            signature: &Signature,
            prehash: &[u8; 20],
        ) -> Result<(), CryptoError> {
            self.vk
                .verify_prehash(prehash, &signature.0)
                .or(Err(CryptoError::VerificationFailure(
                    "DSA signature verification failed",
                )))
        }
    }

    #[derive(Debug, Clone)]
    pub struct Signature(::dsa::Signature);

    impl Signature {
        pub(crate) fn from_components(r: BigUint, s: BigUint) -> Result<Self, CryptoError> {
            ::dsa::Signature::from_components(r, s)
                .map(Signature)
                .or(Err(CryptoError::VerificationFailure(
                    "invalid DSA signature components",
                )))
        }

        pub(crate) fn r(&self) -> &BigUint {
            self.0.r()
        }

        pub(crate) fn s(&self) -> &BigUint {
            self.0.s()
        }
    }

    /// `format_fingerprint` renders the fingerprint in the customary human-readable form: five
    /// groups of 8 upper-case hexadecimal characters.
    #[must_use]
    pub fn format_fingerprint(fingerprint: &Fingerprint) -> String {
        let encoded = hex::encode_upper(fingerprint);
        encoded
            .as_bytes()
            .chunks(8)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<String>>()
            .join(" ")
    }

}

pub(crate) mod otr {
    use std::convert::TryInto;

    use num_bigint::BigUint;

    use crate::{encoding::OTREncoder, SSID};

    use super::{aes128, dh, sha1, sha256};

    /// `AKESecrets` are the secrets derived from the shared secret during the AKE.
    pub struct AKESecrets {
        pub ssid: SSID,
        pub c: aes128::Key,
        pub cp: aes128::Key,
        pub m1: [u8; 32],
        pub m2: [u8; 32],
        pub m1p: [u8; 32],
        pub m2p: [u8; 32],
    }

    impl Drop for AKESecrets {
        fn drop(&mut self) {
            self.ssid.fill(0);
            self.m1.fill(0);
            self.m2.fill(0);
            self.m1p.fill(0);
            self.m2p.fill(0);
        }
    }

    impl AKESecrets {
        /// Derive the shared secrets used by OTRv3 that are based on the shared secret from the DH
        /// key exchange. `secbytes` is the MPI-encoded shared secret.
        pub fn derive(secbytes: &[u8]) -> AKESecrets {
            let h2secret0 = h2(0x00, secbytes);
            let h2secret1 = h2(0x01, secbytes);
            AKESecrets {
                ssid: h2secret0[..8].try_into().expect("BUG: slice of 8 bytes"),
                c: aes128::Key(h2secret1[..16].try_into().expect("BUG: slice of 16 bytes")),
                cp: aes128::Key(h2secret1[16..].try_into().expect("BUG: slice of 16 bytes")),
                m1: h2(0x02, secbytes),
                m2: h2(0x03, secbytes),
                m1p: h2(0x04, secbytes),
                m2p: h2(0x05, secbytes),
            }
        }
    }

    fn h2(b: u8, secbytes: &[u8]) -> [u8; 32] {
        let mut bytes = vec![b];
        bytes.extend_from_slice(secbytes);
        let digest = sha256::digest(&bytes);
        bytes.fill(0);
        digest
    }

    /// `DataSecrets` are the keys for one pairing of our DH keypair and their DH public key.
    pub struct DataSecrets {
        pub sending_aes: aes128::Key,
        pub sending_mac: [u8; 20],
        pub receiving_aes: aes128::Key,
        pub receiving_mac: [u8; 20],
        pub extra_symmetric_key: [u8; 32],
    }

    impl Drop for DataSecrets {
        fn drop(&mut self) {
            self.sending_mac.fill(0);
            self.receiving_mac.fill(0);
            self.extra_symmetric_key.fill(0);
        }
    }

    impl DataSecrets {
        /// `derive` derives the data message keys. The party with the larger public key uses
        /// `0x01` for sending and `0x02` for receiving, the other party the reverse.
        pub fn derive(ours: &dh::Keypair, theirs: &BigUint) -> DataSecrets {
            let s = ours.generate_shared_secret(theirs);
            let secbytes = OTREncoder::new().write_mpi(&s).to_vec();
            let (sendbyte, recvbyte) = if ours.public > *theirs {
                (0x01, 0x02)
            } else {
                (0x02, 0x01)
            };
            let sending_aes = aes128::Key(
                h1(sendbyte, &secbytes)[..16]
                    .try_into()
                    .expect("BUG: slice of 16 bytes"),
            );
            let receiving_aes = aes128::Key(
                h1(recvbyte, &secbytes)[..16]
                    .try_into()
                    .expect("BUG: slice of 16 bytes"),
            );
            let sending_mac = sha1::digest(&sending_aes.0);
            let receiving_mac = sha1::digest(&receiving_aes.0);
            let mut extra = vec![0xffu8];
            extra.extend_from_slice(&secbytes);
            let extra_symmetric_key = sha256::digest(&extra);
            extra.fill(0);
            DataSecrets {
                sending_aes,
                sending_mac,
                receiving_aes,
                receiving_mac,
                extra_symmetric_key,
            }
        }
    }

    fn h1(b: u8, secbytes: &[u8]) -> [u8; 20] {
        let mut bytes = vec![b];
        bytes.extend_from_slice(secbytes);
        let digest = sha1::digest(&bytes);
        bytes.fill(0);
        digest
    }

    #[cfg(test)]
    mod tests {
        use super::DataSecrets;
        use crate::crypto::dh;

        #[test]
        fn test_data_secrets_mirror() {
            let alice = dh::Keypair::generate();
            let bob = dh::Keypair::generate();
            let a = DataSecrets::derive(&alice, &bob.public);
            let b = DataSecrets::derive(&bob, &alice.public);
            assert_eq!(a.sending_aes.0, b.receiving_aes.0);
            assert_eq!(a.receiving_aes.0, b.sending_aes.0);
            assert_eq!(a.sending_mac, b.receiving_mac);
            assert_eq!(a.receiving_mac, b.sending_mac);
            assert_ne!(a.sending_aes.0, a.receiving_aes.0);
            assert_eq!(a.extra_symmetric_key, b.extra_symmetric_key);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    VerificationFailure(&'static str),
}
