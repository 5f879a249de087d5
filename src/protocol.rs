// SPDX-License-Identifier: LGPL-3.0-only

use crate::{
    ake::CryptographicMaterial,
    crypto::{constant, DH, DSA, SHA1},
    encoding::{MessageFlags, OTRDecoder, OTREncoder, CTR, CTR_LEN},
    instancetag::InstanceTag,
    keymanager::KeyManager,
    messages::{self, DataMessage},
    smp::SMPContext,
    OTRError, ProtocolStatus, Version, TLV,
};

/// TLV type 0: padding, to be ignored on receipt.
pub const TLV_TYPE_PADDING: u16 = 0;
/// TLV type 1: the sender has ended the confidential session.
pub const TLV_TYPE_DISCONNECTED: u16 = 1;

/// `ProtocolState` is the messaging state of one session instance. The
/// encrypted state owns everything that exists only while a confidential
/// session is established: the key matrix and the SMP sub-machine.
pub enum ProtocolState {
    Plaintext,
    Encrypted(Box<EncryptedState>),
    Finished,
}

impl ProtocolState {
    #[must_use]
    pub fn status(&self) -> ProtocolStatus {
        match self {
            ProtocolState::Plaintext => ProtocolStatus::Plaintext,
            ProtocolState::Encrypted(_) => ProtocolStatus::Encrypted,
            ProtocolState::Finished => ProtocolStatus::Finished,
        }
    }
}

/// `EncryptedState` holds the cryptographic state of an established
/// confidential session and implements the data-message paths.
pub struct EncryptedState {
    version: Version,
    our_tag: InstanceTag,
    their_tag: InstanceTag,
    keys: KeyManager,
    pub smp: SMPContext,
}

impl EncryptedState {
    /// `new` derives the initial session state from the AKE result.
    #[must_use]
    pub fn new(
        material: CryptographicMaterial,
        our_tag: InstanceTag,
        their_tag: InstanceTag,
        our_fingerprint: DSA::Fingerprint,
    ) -> Self {
        let smp = SMPContext::new(
            material.ssid,
            our_fingerprint,
            material.their_dsa.fingerprint(),
        );
        Self {
            version: material.version,
            our_tag,
            their_tag,
            keys: KeyManager::new(material.our_dh, material.their_dh),
            smp,
        }
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// `encrypt_message` produces a data message for the payload: the
    /// UTF-8 bytes of the plaintext, optionally followed by a NUL byte and
    /// TLV records.
    pub fn encrypt_message(&mut self, flags: MessageFlags, payload: &[u8]) -> DataMessage {
        let next_dh = self.keys.most_recent().local_public().clone();
        let cell = self.keys.encryption_keys();
        let ctr = cell.next_sending_ctr();
        let ciphertext = cell.sending_aes_key().encrypt(&nonce(&ctr), payload);
        let mut message = DataMessage {
            flags,
            sender_keyid: cell.local_keyid(),
            receiver_keyid: cell.remote_keyid(),
            dh_y: next_dh,
            ctr,
            encrypted: ciphertext,
            authenticator: [0u8; 20],
            revealed: Vec::new(),
        };
        let authenticator_data = messages::encode_authenticator_data(
            self.version,
            self.our_tag,
            self.their_tag,
            &message,
        );
        message.authenticator = SHA1::hmac(&cell.sending_mac_key(), &authenticator_data);
        // The reveal field is not part of the authenticated portion, so
        // draining the old MAC keys after computing the MAC is safe.
        message.revealed = self.keys.collect_old_mac_keys();
        message
    }

    /// `decrypt_message` authenticates and decrypts an inbound data
    /// message, rotating the key matrix when the message acknowledges new
    /// key ids. Returns the raw decrypted payload, TLV records included.
    pub fn decrypt_message(
        &mut self,
        sender: InstanceTag,
        receiver: InstanceTag,
        message: &DataMessage,
    ) -> Result<Vec<u8>, OTRError> {
        let version = self.version;
        let receiving_aes_key = {
            let cell = self
                .keys
                .find(message.receiver_keyid, message.sender_keyid)
                .ok_or(OTRError::UnreadableMessage)?;
            // Verify the received MAC against a locally calculated one.
            let authenticator_data =
                messages::encode_authenticator_data(version, sender, receiver, message);
            let expected = SHA1::hmac(&cell.receiving_mac_key(), &authenticator_data);
            constant::verify(&expected, &message.authenticator)
                .or(Err(OTRError::UnreadableMessage))?;
            // Mark the receiving MAC key as used, to be revealed after
            // rotation.
            cell.register_used_receiving_mac_key();
            cell.receiving_aes_key()
        };
        // "This should monotonically increase (as a big-endian value) for
        //  each message sent with the same (sender keyid, recipient keyid)
        //  pair, and must not be all 0x00."
        self.keys
            .verify_receiving_ctr(message.receiver_keyid, message.sender_keyid, &message.ctr)?;
        let payload = receiving_aes_key.decrypt(&nonce(&message.ctr), &message.encrypted);
        // Rotate keys if the message acknowledges the most recent ids.
        if self.keys.most_recent().local_keyid() == message.receiver_keyid {
            self.keys.rotate_local_keys();
        }
        if self.keys.most_recent().remote_keyid() == message.sender_keyid {
            if DH::verify_public_key(&message.dh_y).is_ok() {
                self.keys.rotate_remote_keys(message.dh_y.clone());
            } else {
                log::warn!("Ignoring invalid next-DH public key in data message.");
            }
        }
        Ok(payload)
    }
}

/// `split_plaintext_payload` splits a decrypted data-message payload into
/// the message text and the TLV records following the first NUL byte.
pub fn split_plaintext_payload(payload: &[u8]) -> Result<(Vec<u8>, Vec<TLV>), OTRError> {
    match payload.iter().position(|b| *b == 0) {
        None => Ok((Vec::from(payload), Vec::new())),
        Some(idx) => {
            let content = Vec::from(&payload[..idx]);
            let tlvs = OTRDecoder::new(&payload[idx + 1..]).read_tlvs()?;
            Ok((content, tlvs))
        }
    }
}

/// `assemble_plaintext_payload` is the sending-side counterpart: message
/// text, then a NUL byte and the TLV records if any are supplied.
#[must_use]
pub fn assemble_plaintext_payload(content: &[u8], tlvs: &[TLV]) -> Vec<u8> {
    assert!(
        !content.contains(&0u8),
        "NUL bytes in the message content would be interpreted as the TLV separator"
    );
    if tlvs.is_empty() {
        return Vec::from(content);
    }
    let mut encoder = OTREncoder::new();
    let mut payload = Vec::from(content);
    payload.push(0u8);
    for tlv in tlvs {
        encoder.write_tlv(tlv);
    }
    payload.extend(encoder.to_vec());
    payload
}

/// The wire carries only the top half of the 16-byte AES-CTR counter; the
/// lower 8 bytes are zero at the start of every message.
fn nonce(ctr: &CTR) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[..CTR_LEN].copy_from_slice(ctr);
    nonce
}

#[cfg(test)]
mod tests {
    use crate::ake::CryptographicMaterial;
    use crate::crypto::{DH, DSA};
    use crate::encoding::MessageFlags;
    use crate::{OTRError, ProtocolStatus, Version, TLV};

    use super::{
        assemble_plaintext_payload, split_plaintext_payload, EncryptedState, ProtocolState,
        TLV_TYPE_DISCONNECTED,
    };

    #[test]
    fn test_status_mapping() {
        assert_eq!(ProtocolStatus::Plaintext, ProtocolState::Plaintext.status());
        assert_eq!(ProtocolStatus::Finished, ProtocolState::Finished.status());
    }

    #[test]
    fn test_payload_without_tlvs() {
        let payload = assemble_plaintext_payload(b"hello world", &[]);
        assert_eq!(b"hello world".to_vec(), payload);
        let (content, tlvs) = split_plaintext_payload(&payload).unwrap();
        assert_eq!(b"hello world".to_vec(), content);
        assert!(tlvs.is_empty());
    }

    #[test]
    fn test_payload_with_tlvs() {
        let disconnect = TLV(TLV_TYPE_DISCONNECTED, Vec::new());
        let payload = assemble_plaintext_payload(b"", &[disconnect.clone()]);
        let (content, tlvs) = split_plaintext_payload(&payload).unwrap();
        assert!(content.is_empty());
        assert_eq!(vec![disconnect], tlvs);
    }

    fn paired_states() -> (EncryptedState, EncryptedState) {
        let alice_dh = DH::Keypair::generate();
        let bob_dh = DH::Keypair::generate();
        let alice_dsa = DSA::Keypair::generate();
        let bob_dsa = DSA::Keypair::generate();
        let ssid = [9u8; 8];
        let alice = EncryptedState::new(
            CryptographicMaterial {
                version: Version::V3,
                ssid,
                our_dh: alice_dh.clone(),
                their_dh: bob_dh.public.clone(),
                their_dsa: bob_dsa.public_key(),
            },
            0x100,
            0x200,
            alice_dsa.public_key().fingerprint(),
        );
        let bob = EncryptedState::new(
            CryptographicMaterial {
                version: Version::V3,
                ssid,
                our_dh: bob_dh,
                their_dh: alice_dh.public,
                their_dsa: alice_dsa.public_key(),
            },
            0x200,
            0x100,
            bob_dsa.public_key().fingerprint(),
        );
        (alice, bob)
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let (mut alice, mut bob) = paired_states();
        let message = alice.encrypt_message(MessageFlags::empty(), b"top secret");
        let payload = bob.decrypt_message(0x100, 0x200, &message).unwrap();
        assert_eq!(b"top secret".to_vec(), payload);
    }

    #[test]
    fn test_replayed_message_is_unreadable() {
        let (mut alice, mut bob) = paired_states();
        let m1 = alice.encrypt_message(MessageFlags::empty(), b"first");
        let m2 = alice.encrypt_message(MessageFlags::empty(), b"second");
        assert!(bob.decrypt_message(0x100, 0x200, &m1).is_ok());
        assert!(matches!(
            bob.decrypt_message(0x100, 0x200, &m1),
            Err(OTRError::UnreadableMessage)
        ));
        // later messages still decrypt after the replay was rejected
        assert_eq!(
            b"second".to_vec(),
            bob.decrypt_message(0x100, 0x200, &m2).unwrap()
        );
    }

    #[test]
    fn test_tampered_message_is_unreadable() {
        let (mut alice, mut bob) = paired_states();
        let mut message = alice.encrypt_message(MessageFlags::empty(), b"first");
        message.encrypted[0] ^= 0x01;
        assert!(matches!(
            bob.decrypt_message(0x100, 0x200, &message),
            Err(OTRError::UnreadableMessage)
        ));
    }

    #[test]
    fn test_continued_conversation_ratchets() {
        let (mut alice, mut bob) = paired_states();
        // several rounds back and forth so that both sides ratchet local
        // and remote keys multiple times
        for round in 0..4u8 {
            let content = vec![b'a' + round; 8];
            let to_bob = alice.encrypt_message(MessageFlags::empty(), &content);
            assert_eq!(
                content,
                bob.decrypt_message(0x100, 0x200, &to_bob).unwrap()
            );
            let reply = vec![b'z' - round; 8];
            let to_alice = bob.encrypt_message(MessageFlags::empty(), &reply);
            assert_eq!(
                reply,
                alice.decrypt_message(0x200, 0x100, &to_alice).unwrap()
            );
        }
    }

    #[test]
    fn test_used_mac_keys_are_revealed_eventually() {
        let (mut alice, mut bob) = paired_states();
        let mut revealed = Vec::new();
        for _ in 0..4u8 {
            let to_bob = alice.encrypt_message(MessageFlags::empty(), b"ping");
            bob.decrypt_message(0x100, 0x200, &to_bob).unwrap();
            let to_alice = bob.encrypt_message(MessageFlags::empty(), b"pong");
            revealed.extend_from_slice(&to_alice.revealed);
            alice.decrypt_message(0x200, 0x100, &to_alice).unwrap();
        }
        assert!(!revealed.is_empty());
        assert_eq!(0, revealed.len() % 20);
    }
}
