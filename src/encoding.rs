// SPDX-License-Identifier: LGPL-3.0-only

//! Binary encoding of OTR's primitive types: BYTE, SHORT, INT, DATA, MPI, CTR, MAC, public keys,
//! signatures and TLV records. All multi-byte integers are big-endian.

#![allow(clippy::trivially_copy_pass_by_ref)]

use bitflags::bitflags;
use num_bigint::BigUint;

use crate::{
    crypto::dsa,
    instancetag::{verify, InstanceTag},
    utils, OTRError, TLVType,
};

bitflags! {
    /// Flags carried in the header of a data message.
    pub struct MessageFlags: u8 {
        /// The receiver should not report the message if it cannot be decrypted. Used for
        /// messages without user content, such as control TLVs.
        const IGNORE_UNREADABLE = 0b0000_0001;
    }
}

/// Length of the transmitted (top) half of the counter.
pub const CTR_LEN: usize = 8;
/// Length of a data message MAC (HMAC-SHA1).
pub const MAC_LEN: usize = 20;
/// DSA-1024/160 signatures encode `r` and `s` in 20 bytes each.
const SIGNATURE_COMPONENT_LEN: usize = 20;
/// Public key type for DSA, the only type defined.
const PUBLIC_KEY_TYPE_DSA: u16 = 0;

/// `TLV` is a type-length-value record, as carried in the plaintext of a data message.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::upper_case_acronyms)]
pub struct TLV(pub TLVType, pub Vec<u8>);

/// `OTRDecoder` reads OTR-encoded values from a borrowed buffer. Input originates from the other
/// party, so every read is fallible: a short buffer results in `IncompleteMessage`.
pub struct OTRDecoder<'a>(&'a [u8]);

impl Drop for OTRDecoder<'_> {
    fn drop(&mut self) {
        if !self.0.is_empty() {
            log::warn!("Decoder discarded with {} unread bytes.", self.0.len());
        }
    }
}

impl<'a> OTRDecoder<'a> {
    pub fn new(content: &'a [u8]) -> Self {
        Self(content)
    }

    /// `take` consumes the next `n` bytes.
    fn take(&mut self, n: usize) -> Result<&'a [u8], OTRError> {
        if self.0.len() < n {
            return Err(OTRError::IncompleteMessage);
        }
        let (head, tail) = self.0.split_at(n);
        self.0 = tail;
        Ok(head)
    }

    /// `read` consumes a fixed number of bytes.
    pub fn read<const N: usize>(&mut self) -> Result<[u8; N], OTRError> {
        let mut buffer = [0u8; N];
        buffer.copy_from_slice(self.take(N)?);
        Ok(buffer)
    }

    pub fn read_u8(&mut self) -> Result<u8, OTRError> {
        Ok(self.read::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, OTRError> {
        self.read().map(u16::from_be_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, OTRError> {
        self.read().map(u32::from_be_bytes)
    }

    /// `read_instance_tag` reads an instance tag, rejecting tags in the reserved range.
    pub fn read_instance_tag(&mut self) -> Result<InstanceTag, OTRError> {
        let tag = self.read_u32()?;
        log::trace!("instance tag: {tag:#x}");
        verify(tag).or(Err(OTRError::ProtocolViolation("Illegal instance tag.")))
    }

    /// `read_data` reads a length-prefixed byte sequence (DATA).
    pub fn read_data(&mut self) -> Result<Vec<u8>, OTRError> {
        let len = self.read_u32()? as usize;
        log::trace!("DATA of {len} bytes");
        Ok(self.take(len)?.to_vec())
    }

    /// `read_mpi` reads a multi-precision integer. Zero-length encodes `0`.
    pub fn read_mpi(&mut self) -> Result<BigUint, OTRError> {
        let len = self.read_u32()? as usize;
        log::trace!("MPI of {len} bytes");
        if len == 0 {
            return Ok((*utils::biguint::ZERO).clone());
        }
        Ok(BigUint::from_bytes_be(self.take(len)?))
    }

    /// `read_mpi_sequence` reads a count followed by that many MPIs, as used in SMP messages.
    pub fn read_mpi_sequence(&mut self) -> Result<Vec<BigUint>, OTRError> {
        let count = self.read_u32()?;
        log::trace!("sequence of {count} MPIs");
        (0..count).map(|_| self.read_mpi()).collect()
    }

    pub fn read_ctr(&mut self) -> Result<[u8; CTR_LEN], OTRError> {
        self.read()
    }

    pub fn read_mac(&mut self) -> Result<[u8; MAC_LEN], OTRError> {
        self.read()
    }

    /// `read_public_key` reads a DSA public key: key type followed by `p`, `q`, `g`, `y`.
    pub fn read_public_key(&mut self) -> Result<dsa::PublicKey, OTRError> {
        if self.read_u16()? != PUBLIC_KEY_TYPE_DSA {
            return Err(OTRError::ProtocolViolation(
                "Unsupported/invalid public key type.",
            ));
        }
        let (p, q, g, y) = (
            self.read_mpi()?,
            self.read_mpi()?,
            self.read_mpi()?,
            self.read_mpi()?,
        );
        dsa::PublicKey::from_components(p, q, g, y).map_err(OTRError::CryptographicViolation)
    }

    pub fn read_dsa_signature(&mut self) -> Result<dsa::Signature, OTRError> {
        let r = BigUint::from_bytes_be(self.take(SIGNATURE_COMPONENT_LEN)?);
        let s = BigUint::from_bytes_be(self.take(SIGNATURE_COMPONENT_LEN)?);
        dsa::Signature::from_components(r, s).map_err(OTRError::CryptographicViolation)
    }

    /// `read_tlv` reads a single TLV record.
    pub fn read_tlv(&mut self) -> Result<TLV, OTRError> {
        if self.0.len() < 4 {
            return Err(OTRError::IncompleteMessage);
        }
        let typ = u16::from_be_bytes([self.0[0], self.0[1]]);
        let len = u16::from_be_bytes([self.0[2], self.0[3]]) as usize;
        if self.0.len() - 4 < len {
            // leave the buffer untouched
            return Err(OTRError::IncompleteMessage);
        }
        self.0 = &self.0[4..];
        Ok(TLV(typ, self.take(len)?.to_vec()))
    }

    /// `read_tlvs` reads TLV records until the buffer is exhausted. A truncated final record is
    /// dropped.
    pub fn read_tlvs(&mut self) -> Vec<TLV> {
        let mut tlvs = Vec::new();
        while !self.0.is_empty() {
            if let Ok(tlv) = self.read_tlv() {
                tlvs.push(tlv);
                continue;
            }
            log::warn!("Dropping truncated TLV: {} trailing bytes.", self.0.len());
            self.0 = &[];
        }
        tlvs
    }

    /// `read_bytes_null_terminated` reads up to the next NUL byte, or the end of the buffer. The
    /// NUL byte is consumed but not returned.
    pub fn read_bytes_null_terminated(&mut self) -> Vec<u8> {
        let end = self.0.iter().position(|b| *b == 0);
        let bytes = self.0[..end.unwrap_or(self.0.len())].to_vec();
        self.0 = match end {
            Some(i) => &self.0[i + 1..],
            None => &[],
        };
        bytes
    }

    /// `done` finishes decoding. Fails if unread bytes remain.
    pub fn done(self) -> Result<(), OTRError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(OTRError::ProtocolViolation("data remaining in buffer"))
        }
    }
}

/// `OTREncodable` is implemented by message types that serialize themselves with `OTREncoder`.
pub trait OTREncodable {
    fn encode(&self, encoder: &mut OTREncoder);
}

/// `OTREncoder` builds an OTR-encoded byte sequence. Methods chain.
#[derive(Default)]
pub struct OTREncoder {
    buffer: Vec<u8>,
}

impl OTREncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `write` appends raw bytes, without length prefix.
    pub fn write(&mut self, raw_bytes: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(raw_bytes);
        self
    }

    pub fn write_encodable(&mut self, encodable: &dyn OTREncodable) -> &mut Self {
        encodable.encode(self);
        self
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.write(&[v])
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.write(&v.to_be_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.write(&v.to_be_bytes())
    }

    pub fn write_data(&mut self, v: &[u8]) -> &mut Self {
        let len = u32::try_from(v.len()).expect("BUG: DATA exceeds maximum length");
        self.write_u32(len).write(v)
    }

    /// `write_mpi` writes the minimum-length encoding of `v`. Fingerprints depend on the absence
    /// of leading zero bytes.
    pub fn write_mpi(&mut self, v: &BigUint) -> &mut Self {
        if *v == *utils::biguint::ZERO {
            return self.write_u32(0);
        }
        let encoded = v.to_bytes_be();
        debug_assert_ne!(0, encoded[0]);
        self.write_data(&encoded)
    }

    pub fn write_mpi_sequence(&mut self, mpis: &[&BigUint]) -> &mut Self {
        let count = u32::try_from(mpis.len()).expect("BUG: too many MPIs");
        self.write_u32(count);
        for mpi in mpis {
            self.write_mpi(mpi);
        }
        self
    }

    pub fn write_ctr(&mut self, v: &[u8; CTR_LEN]) -> &mut Self {
        self.write(v)
    }

    pub fn write_mac(&mut self, v: &[u8; MAC_LEN]) -> &mut Self {
        self.write(v)
    }

    pub fn write_public_key(&mut self, key: &dsa::PublicKey) -> &mut Self {
        self.write_u16(PUBLIC_KEY_TYPE_DSA)
            .write_mpi(key.p())
            .write_mpi(key.q())
            .write_mpi(key.g())
            .write_mpi(key.y())
    }

    pub fn write_signature(&mut self, sig: &dsa::Signature) -> &mut Self {
        let r = utils::biguint::to_bytes_be_fixed::<SIGNATURE_COMPONENT_LEN>(sig.r());
        let s = utils::biguint::to_bytes_be_fixed::<SIGNATURE_COMPONENT_LEN>(sig.s());
        self.write(&r).write(&s)
    }

    pub fn write_tlv(&mut self, tlv: &TLV) -> &mut Self {
        let len = u16::try_from(tlv.1.len()).expect("BUG: TLV value exceeds maximum length");
        self.write_u16(tlv.0).write_u16(len).write(&tlv.1)
    }

    pub fn write_bytes_null_terminated(&mut self, data: &[u8]) -> &mut Self {
        self.write(data).write_u8(0)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer.clone()
    }
}
