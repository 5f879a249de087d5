// SPDX-License-Identifier: LGPL-3.0-only

use bitflags::bitflags;
use num_bigint::BigUint;

use crate::{
    crypto::DSA,
    instancetag::{verify_instance_tag, InstanceTag},
    OTRError, TLV,
};

/// Length of the counter value carried on the wire: the top half of the
/// 16-byte AES-CTR counter.
pub const CTR_LEN: usize = 8;
pub type CTR = [u8; CTR_LEN];

/// Length of the (truncated) HMAC-SHA1 authenticator of data messages.
pub const MAC_LEN: usize = 20;
pub type MAC = [u8; MAC_LEN];

bitflags! {
    /// `MessageFlags` are the flags set on OTR-encoded data messages.
    pub struct MessageFlags: u8 {
        /// FLAG_IGNORE_UNREADABLE indicates that the message may be
        /// silently dropped if it cannot be read. Typically set on control
        /// messages that carry no user content.
        const IGNORE_UNREADABLE = 0b0000_0001;
    }
}

pub trait OTREncodable {
    fn encode(&self, encoder: &mut OTREncoder);
}

/// `OTRDecoder` contains the logic for reading OTR data types from a
/// byte-buffer.
pub struct OTRDecoder<'a>(&'a [u8]);

impl<'a> OTRDecoder<'a> {
    pub fn new(content: &'a [u8]) -> Self {
        Self(content)
    }

    /// `read_u8` reads a single byte from the buffer.
    pub fn read_u8(&mut self) -> Result<u8, OTRError> {
        if self.0.is_empty() {
            return Err(OTRError::IncompleteMessage);
        }
        let value = self.0[0];
        self.0 = &self.0[1..];
        Ok(value)
    }

    /// `read_u16` reads a short value (2 bytes, big-endian) from the
    /// buffer.
    pub fn read_u16(&mut self) -> Result<u16, OTRError> {
        if self.0.len() < 2 {
            return Err(OTRError::IncompleteMessage);
        }
        let value = u16::from_be_bytes([self.0[0], self.0[1]]);
        self.0 = &self.0[2..];
        Ok(value)
    }

    /// `read_u32` reads an integer value (4 bytes, big-endian) from the
    /// buffer.
    pub fn read_u32(&mut self) -> Result<u32, OTRError> {
        if self.0.len() < 4 {
            return Err(OTRError::IncompleteMessage);
        }
        let value = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        self.0 = &self.0[4..];
        Ok(value)
    }

    pub fn read_instance_tag(&mut self) -> Result<InstanceTag, OTRError> {
        verify_instance_tag(self.read_u32()?)
    }

    /// `read_data` reads variable-length data from the buffer.
    pub fn read_data(&mut self) -> Result<Vec<u8>, OTRError> {
        let len = self.read_u32()? as usize;
        if self.0.len() < len {
            return Err(OTRError::IncompleteMessage);
        }
        let data = Vec::from(&self.0[..len]);
        self.0 = &self.0[len..];
        Ok(data)
    }

    /// `read_mpi` reads an MPI from the buffer.
    pub fn read_mpi(&mut self) -> Result<BigUint, OTRError> {
        let len = self.read_u32()? as usize;
        if self.0.len() < len {
            return Err(OTRError::IncompleteMessage);
        }
        let mpi = BigUint::from_bytes_be(&self.0[..len]);
        self.0 = &self.0[len..];
        Ok(mpi)
    }

    /// `read_mpi_sequence` reads a sequence of MPI values as defined by
    /// SMP: a count followed by that many MPIs.
    pub fn read_mpi_sequence(&mut self) -> Result<Vec<BigUint>, OTRError> {
        let len = self.read_u32()? as usize;
        let mut mpis = Vec::new();
        for _ in 0..len {
            mpis.push(self.read_mpi()?);
        }
        Ok(mpis)
    }

    /// `read_ctr` reads a counter value from the buffer.
    pub fn read_ctr(&mut self) -> Result<CTR, OTRError> {
        if self.0.len() < CTR_LEN {
            return Err(OTRError::IncompleteMessage);
        }
        let mut ctr: CTR = [0; CTR_LEN];
        ctr.copy_from_slice(&self.0[..CTR_LEN]);
        self.0 = &self.0[CTR_LEN..];
        Ok(ctr)
    }

    /// `read_mac` reads a MAC value from the buffer.
    pub fn read_mac(&mut self) -> Result<MAC, OTRError> {
        if self.0.len() < MAC_LEN {
            return Err(OTRError::IncompleteMessage);
        }
        let mut mac: MAC = [0; MAC_LEN];
        mac.copy_from_slice(&self.0[..MAC_LEN]);
        self.0 = &self.0[MAC_LEN..];
        Ok(mac)
    }

    /// `read_public_key` reads a DSA public key from the buffer.
    pub fn read_public_key(&mut self) -> Result<DSA::PublicKey, OTRError> {
        let pktype = self.read_u16()?;
        if pktype != 0u16 {
            return Err(OTRError::ProtocolViolation(
                "Unsupported or invalid public key type.",
            ));
        }
        Ok(DSA::PublicKey {
            p: self.read_mpi()?,
            q: self.read_mpi()?,
            g: self.read_mpi()?,
            y: self.read_mpi()?,
        })
    }

    /// `read_signature` reads a DSA signature (IEEE-P1363 format) from the
    /// buffer.
    pub fn read_signature(&mut self) -> Result<DSA::Signature, OTRError> {
        if self.0.len() < DSA::SIGNATURE_LEN {
            return Err(OTRError::IncompleteMessage);
        }
        let mut sig: DSA::Signature = [0; DSA::SIGNATURE_LEN];
        sig.copy_from_slice(&self.0[..DSA::SIGNATURE_LEN]);
        self.0 = &self.0[DSA::SIGNATURE_LEN..];
        Ok(sig)
    }

    /// `read_tlv` reads a single type-length-value record from the buffer.
    pub fn read_tlv(&mut self) -> Result<TLV, OTRError> {
        let typ = self.read_u16()?;
        let len = self.read_u16()? as usize;
        if self.0.len() < len {
            return Err(OTRError::IncompleteMessage);
        }
        let data = Vec::from(&self.0[..len]);
        self.0 = &self.0[len..];
        Ok(TLV(typ, data))
    }

    /// `read_tlvs` consumes the remainder of the buffer as a sequence of
    /// TLV records.
    pub fn read_tlvs(&mut self) -> Result<Vec<TLV>, OTRError> {
        let mut tlvs = Vec::new();
        while !self.0.is_empty() {
            tlvs.push(self.read_tlv()?);
        }
        Ok(tlvs)
    }

    /// `read_bytes_null_terminated` reads bytes up to the next NUL byte,
    /// or the remainder of the buffer if no NUL is present. The NUL itself
    /// is consumed but not returned.
    pub fn read_bytes_null_terminated(&mut self) -> Vec<u8> {
        match self.0.iter().position(|b| *b == 0) {
            Some(idx) => {
                let content = Vec::from(&self.0[..idx]);
                self.0 = &self.0[idx + 1..];
                content
            }
            None => {
                let content = Vec::from(self.0);
                self.0 = &self.0[self.0.len()..];
                content
            }
        }
    }

    /// `done` verifies that the buffer is fully consumed.
    pub fn done(&self) -> Result<(), OTRError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(OTRError::ProtocolViolation("Data remaining in buffer."))
        }
    }
}

/// `OTREncoder` assembles OTR data types into a byte-buffer.
pub struct OTREncoder {
    buffer: Vec<u8>,
}

impl OTREncoder {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub fn write_encodable(&mut self, encodable: &dyn OTREncodable) -> &mut Self {
        encodable.encode(self);
        self
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.buffer.push(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.buffer.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.buffer.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_data(&mut self, v: &[u8]) -> &mut Self {
        assert!(v.len() <= u32::MAX as usize);
        self.write_u32(v.len() as u32);
        self.buffer.extend_from_slice(v);
        self
    }

    pub fn write_mpi(&mut self, v: &BigUint) -> &mut Self {
        self.write_data(&v.to_bytes_be())
    }

    /// `write_mpi_sequence` writes a sequence of MPI values in the format
    /// defined by SMP: num_mpis, mpi1, mpi2, …
    pub fn write_mpi_sequence(&mut self, mpis: &[&BigUint]) -> &mut Self {
        assert!(mpis.len() <= u32::MAX as usize);
        self.write_u32(mpis.len() as u32);
        for mpi in mpis {
            self.write_mpi(mpi);
        }
        self
    }

    pub fn write_ctr(&mut self, v: &CTR) -> &mut Self {
        self.buffer.extend_from_slice(v);
        self
    }

    pub fn write_mac(&mut self, v: &MAC) -> &mut Self {
        self.buffer.extend_from_slice(v);
        self
    }

    pub fn write_public_key(&mut self, key: &DSA::PublicKey) -> &mut Self {
        self.write_u16(0u16)
            .write_mpi(&key.p)
            .write_mpi(&key.q)
            .write_mpi(&key.g)
            .write_mpi(&key.y)
    }

    pub fn write_signature(&mut self, sig: &DSA::Signature) -> &mut Self {
        self.buffer.extend_from_slice(sig);
        self
    }

    pub fn write_tlv(&mut self, tlv: &TLV) -> &mut Self {
        assert!(tlv.1.len() <= u16::MAX as usize);
        self.write_u16(tlv.0).write_u16(tlv.1.len() as u16);
        self.buffer.extend_from_slice(&tlv.1);
        self
    }

    pub fn write_bytes_null_terminated(&mut self, data: &[u8]) -> &mut Self {
        self.buffer.extend_from_slice(data);
        self.buffer.push(0u8);
        self
    }

    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.buffer.clone()
    }
}

impl Default for OTREncoder {
    fn default() -> Self {
        Self::new()
    }
}
