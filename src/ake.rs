// SPDX-License-Identifier: LGPL-3.0-only

use std::rc::Rc;

use num_bigint::BigUint;

use crate::{
    crypto::{constant, CryptoError, AES128, DH, DSA, OTR::AKESecrets, OTR::SSID, SHA256},
    encoding::{OTRDecoder, OTREncodable, OTREncoder, MAC},
    messages::EncodedMessageType,
    utils, Host, OTRError, SessionID, Version,
};

/// `AKEContext` is the state machine of the authenticated key exchange:
/// the four-message handshake that establishes the initial shared secret
/// of a confidential session.
pub struct AKEContext {
    session: SessionID,
    host: Rc<dyn Host>,
    version: Version,
    state: AKEState,
}

impl AKEContext {
    pub fn new(host: Rc<dyn Host>, session: SessionID) -> Self {
        Self {
            session,
            host,
            version: Version::V3,
            state: AKEState::None,
        }
    }

    #[must_use]
    pub fn version(&self) -> Version {
        self.version
    }

    /// `set_version` fixes the protocol version this exchange is performed
    /// under. The AKE payloads are identical for versions 2 and 3; the
    /// version decides the envelope and ends up in the produced key
    /// material.
    pub fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    /// `reset` drops any AKE state in progress.
    pub fn reset(&mut self) {
        self.state = AKEState::None;
    }

    /// `initiate` starts the exchange at the given version by producing a
    /// DH-Commit message.
    pub fn initiate(&mut self, version: Version) -> EncodedMessageType {
        log::info!("Initiating AKE.");
        self.version = version;
        let keypair = DH::Keypair::generate();
        let r = AES128::Key::generate();
        let gxmpi = OTREncoder::new().write_mpi(&keypair.public).to_vec();
        let gx_encrypted = r.encrypt(&[0; 16], &gxmpi);
        let gx_hashed = SHA256::digest(&gxmpi).to_vec();
        // Send the D-H Commit message and await the D-H Key message.
        self.state = AKEState::AwaitingDHKey(AwaitingDHKey {
            our_dh_keypair: Rc::new(keypair),
            r,
        });
        EncodedMessageType::DHCommit(DHCommitMessage {
            gx_encrypted,
            gx_hashed,
        })
    }

    /// `transfer` clones this `AKEContext`, specifically for the case that
    /// another client instance must be able to adopt an exchange the
    /// master initiated with receiver-tag ZERO. Only the AwaitingDHKey
    /// state is eligible: later states are already bound to one peer.
    pub fn transfer(&self) -> Result<AKEContext, AKEError> {
        match &self.state {
            AKEState::AwaitingDHKey(state) => Ok(Self {
                session: self.session.clone(),
                host: Rc::clone(&self.host),
                version: self.version,
                state: AKEState::AwaitingDHKey(AwaitingDHKey {
                    our_dh_keypair: Rc::clone(&state.our_dh_keypair),
                    r: state.r.clone(),
                }),
            }),
            AKEState::None
            | AKEState::AwaitingRevealSignature(_)
            | AKEState::AwaitingSignature(_) => Err(AKEError::IncorrectState),
        }
    }

    pub fn handle_dhcommit(
        &mut self,
        msg: DHCommitMessage,
    ) -> Result<EncodedMessageType, AKEError> {
        let (result, transition) = match &self.state {
            AKEState::None => Self::handle_dhcommit_from_initial(msg),
            AKEState::AwaitingDHKey(state) => {
                // This is the trickiest transition in the whole protocol.
                // It indicates that you have already sent a D-H Commit
                // message to your correspondent, but that he either didn't
                // receive it, or just didn't receive it yet, and has sent
                // you one as well. The symmetry is broken by comparing the
                // hashed gx you sent in your D-H Commit message with the
                // one you received, considered as 32-byte unsigned
                // big-endian values.
                let gxmpi = OTREncoder::new()
                    .write_mpi(&state.our_dh_keypair.public)
                    .to_vec();
                let our_gxmpi_hashed = SHA256::digest(&gxmpi);
                let our_hash = BigUint::from_bytes_be(&our_gxmpi_hashed);
                let their_hash = BigUint::from_bytes_be(&msg.gx_hashed);
                if our_hash > their_hash {
                    // Ignore the incoming D-H Commit message, but resend
                    // your own D-H Commit message.
                    let our_gx_encrypted = state.r.encrypt(&[0u8; 16], &gxmpi);
                    let dhcommit = EncodedMessageType::DHCommit(DHCommitMessage {
                        gx_encrypted: our_gx_encrypted,
                        gx_hashed: Vec::from(our_gxmpi_hashed),
                    });
                    (Ok(dhcommit), None)
                } else {
                    // Forget your old gx value that you sent (encrypted)
                    // earlier, and pretend you are in AUTHSTATE_NONE:
                    // reply with a D-H Key message and transition to
                    // AUTHSTATE_AWAITING_REVEALSIG.
                    Self::handle_dhcommit_from_initial(msg)
                }
            }
            AKEState::AwaitingRevealSignature(state) => {
                // Retransmit your D-H Key message (the same one as you
                // sent when you entered AUTHSTATE_AWAITING_REVEALSIG).
                // Forget the old D-H Commit message, and use this new one
                // instead.
                let dhkey = EncodedMessageType::DHKey(DHKeyMessage {
                    gy: state.our_dh_keypair.public.clone(),
                });
                (
                    Ok(dhkey),
                    Some(AKEState::AwaitingRevealSignature(AwaitingRevealSignature {
                        our_dh_keypair: Rc::clone(&state.our_dh_keypair),
                        gx_encrypted: msg.gx_encrypted,
                        gx_hashed: msg.gx_hashed,
                    })),
                )
            }
            AKEState::AwaitingSignature(_) => {
                // Reply with a new D-H Key message, and transition to
                // AUTHSTATE_AWAITING_REVEALSIG.
                Self::handle_dhcommit_from_initial(msg)
            }
        };
        if let Some(state) = transition {
            self.state = state;
        }
        result
    }

    fn handle_dhcommit_from_initial(
        msg: DHCommitMessage,
    ) -> (Result<EncodedMessageType, AKEError>, Option<AKEState>) {
        // Reply with a D-H Key message, and transition to
        // AUTHSTATE_AWAITING_REVEALSIG.
        let keypair = DH::Keypair::generate();
        let dhkey = EncodedMessageType::DHKey(DHKeyMessage {
            gy: keypair.public.clone(),
        });
        (
            Ok(dhkey),
            Some(AKEState::AwaitingRevealSignature(AwaitingRevealSignature {
                our_dh_keypair: Rc::new(keypair),
                gx_encrypted: msg.gx_encrypted,
                gx_hashed: msg.gx_hashed,
            })),
        )
    }

    pub fn handle_dhkey(&mut self, msg: DHKeyMessage) -> Result<EncodedMessageType, AKEError> {
        const KEYID_B: u32 = 1;
        let (result, transition) = match &self.state {
            AKEState::None | AKEState::AwaitingRevealSignature(_) => {
                // Ignore the message.
                return Err(AKEError::MessageIgnored);
            }
            AKEState::AwaitingDHKey(state) => {
                DH::verify_public_key(&msg.gy).map_err(AKEError::CryptographicViolation)?;
                // Reply with a Reveal Signature message and transition to
                // AUTHSTATE_AWAITING_SIG.
                let s = state.our_dh_keypair.generate_shared_secret(&msg.gy);
                let secrets = AKESecrets::derive(&OTREncoder::new().write_mpi(&s).to_vec());
                let dsa_keypair = self.host.local_keypair(&self.session);
                let pub_b = dsa_keypair.public_key();
                let m_b = SHA256::hmac(
                    &secrets.m1,
                    &OTREncoder::new()
                        .write_mpi(&state.our_dh_keypair.public)
                        .write_mpi(&msg.gy)
                        .write_public_key(&pub_b)
                        .write_u32(KEYID_B)
                        .to_vec(),
                );
                // "This is the signature, using the private part of the
                //  key pubB, of the 32-byte MB (taken modulo q instead of
                //  being truncated (as described in FIPS-186), and not
                //  hashed again)."
                let sig_b = dsa_keypair.sign(&m_b);
                let x_b = OTREncoder::new()
                    .write_public_key(&pub_b)
                    .write_u32(KEYID_B)
                    .write_signature(&sig_b)
                    .to_vec();
                let enc_b = secrets.c.encrypt(&[0; 16], &x_b);
                let mac_enc_b =
                    SHA256::hmac160(&secrets.m2, &OTREncoder::new().write_data(&enc_b).to_vec());
                let reveal_sig_message = RevealSignatureMessage {
                    key: state.r.clone(),
                    signature_encrypted: enc_b,
                    signature_mac: mac_enc_b,
                };
                (
                    Ok(EncodedMessageType::RevealSignature(
                        reveal_sig_message.clone(),
                    )),
                    Some(AKEState::AwaitingSignature(AwaitingSignature {
                        our_dh_keypair: Rc::clone(&state.our_dh_keypair),
                        gy: msg.gy,
                        s,
                        previous_message: reveal_sig_message,
                    })),
                )
            }
            AKEState::AwaitingSignature(state) => {
                if state.gy != msg.gy {
                    // Ignore the message.
                    return Err(AKEError::MessageIgnored);
                }
                // The D-H Key message is a retransmit: resend the Reveal
                // Signature message we produced earlier.
                (
                    Ok(EncodedMessageType::RevealSignature(
                        state.previous_message.clone(),
                    )),
                    None,
                )
            }
        };
        if let Some(state) = transition {
            self.state = state;
        }
        result
    }

    pub fn handle_reveal_signature(
        &mut self,
        msg: RevealSignatureMessage,
    ) -> Result<(CryptographicMaterial, EncodedMessageType), AKEError> {
        const KEYID_A: u32 = 1;
        let (result, transition) = match &self.state {
            AKEState::None | AKEState::AwaitingDHKey(_) | AKEState::AwaitingSignature(_) => {
                // Ignore the message.
                return Err(AKEError::MessageIgnored);
            }
            AKEState::AwaitingRevealSignature(state) => {
                log::debug!("Start handling RevealSignatureMessage.");
                // Use the received value of r to decrypt the value of gx
                // received in the D-H Commit message, and verify the hash
                // therein. Decrypt the encrypted signature, and verify the
                // signature and the MACs. If everything checks out:
                // - Reply with a Signature message.
                // - Transition authstate to AUTHSTATE_NONE.
                // - Transition msgstate to MSGSTATE_ENCRYPTED.
                let gxmpi = msg.key.decrypt(&[0; 16], &state.gx_encrypted);
                let gxmpihash = SHA256::digest(&gxmpi);
                constant::verify(&gxmpihash, &state.gx_hashed)
                    .map_err(AKEError::CryptographicViolation)?;

                // Verify the acquired g^x value.
                let gx = OTRDecoder::new(&gxmpi)
                    .read_mpi()
                    .or(Err(AKEError::DataProcessing(
                        "Failed to read MPI from revealed gxmpi",
                    )))?;
                DH::verify_public_key(&gx).map_err(AKEError::CryptographicViolation)?;

                // Validate the encrypted signature using the MAC based on
                // m2, ensuring the signature content is unchanged.
                let s = state.our_dh_keypair.generate_shared_secret(&gx);
                let secrets = AKESecrets::derive(&OTREncoder::new().write_mpi(&s).to_vec());
                let expected_signature_mac = SHA256::hmac160(
                    &secrets.m2,
                    &OTREncoder::new()
                        .write_data(&msg.signature_encrypted)
                        .to_vec(),
                );
                constant::verify(&expected_signature_mac, &msg.signature_mac)
                    .map_err(AKEError::CryptographicViolation)?;

                // Acquire the peer's identity material from the encrypted
                // X_B and verify the signature over M_B.
                let x_b = secrets.c.decrypt(&[0; 16], &msg.signature_encrypted);
                let mut decoder = OTRDecoder::new(&x_b);
                let pub_b = decoder.read_public_key().or(Err(AKEError::DataProcessing(
                    "Failed to read public key from X_B",
                )))?;
                let keyid_b = decoder.read_u32().or(Err(AKEError::DataProcessing(
                    "Failed to read keyid from X_B",
                )))?;
                if utils::u32::nonzero(keyid_b).is_none() {
                    return Err(AKEError::DataProcessing(
                        "keyid_b is zero, must be non-zero value",
                    ));
                }
                let sig_b = decoder.read_signature().or(Err(AKEError::DataProcessing(
                    "Failed to read signature from X_B",
                )))?;
                let m_b = SHA256::hmac(
                    &secrets.m1,
                    &OTREncoder::new()
                        .write_mpi(&gx)
                        .write_mpi(&state.our_dh_keypair.public)
                        .write_public_key(&pub_b)
                        .write_u32(keyid_b)
                        .to_vec(),
                );
                pub_b
                    .verify(&sig_b, &m_b)
                    .map_err(AKEError::CryptographicViolation)?;

                // Construct our own signature message in response.
                let keypair = self.host.local_keypair(&self.session);
                let m_a = SHA256::hmac(
                    &secrets.m1p,
                    &OTREncoder::new()
                        .write_mpi(&state.our_dh_keypair.public)
                        .write_mpi(&gx)
                        .write_public_key(&keypair.public_key())
                        .write_u32(KEYID_A)
                        .to_vec(),
                );
                let sig_m_a = keypair.sign(&m_a);
                let x_a = OTREncoder::new()
                    .write_public_key(&keypair.public_key())
                    .write_u32(KEYID_A)
                    .write_signature(&sig_m_a)
                    .to_vec();
                let encrypted_signature = secrets.cp.encrypt(&[0; 16], &x_a);
                let encrypted_mac = SHA256::hmac160(
                    &secrets.m2p,
                    &OTREncoder::new().write_data(&encrypted_signature).to_vec(),
                );
                (
                    Ok((
                        CryptographicMaterial {
                            version: self.version,
                            ssid: secrets.ssid,
                            our_dh: (*state.our_dh_keypair).clone(),
                            their_dh: gx,
                            their_dsa: pub_b,
                        },
                        EncodedMessageType::Signature(SignatureMessage {
                            signature_encrypted: encrypted_signature,
                            signature_mac: encrypted_mac,
                        }),
                    )),
                    AKEState::None,
                )
            }
        };
        self.state = transition;
        result
    }

    pub fn handle_signature(
        &mut self,
        msg: SignatureMessage,
    ) -> Result<CryptographicMaterial, AKEError> {
        let (result, transition) = match &self.state {
            AKEState::None | AKEState::AwaitingDHKey(_) | AKEState::AwaitingRevealSignature(_) => {
                // Ignore the message.
                return Err(AKEError::MessageIgnored);
            }
            AKEState::AwaitingSignature(state) => {
                log::debug!("Start handling SignatureMessage.");
                let SignatureMessage {
                    signature_encrypted,
                    signature_mac,
                } = msg;
                // Decrypt the encrypted signature and verify the signature
                // and the MACs. If everything checks out:
                // - Transition authstate to AUTHSTATE_NONE.
                // - Transition msgstate to MSGSTATE_ENCRYPTED.
                let secrets = AKESecrets::derive(&OTREncoder::new().write_mpi(&state.s).to_vec());
                let mac = SHA256::hmac160(
                    &secrets.m2p,
                    &OTREncoder::new().write_data(&signature_encrypted).to_vec(),
                );
                constant::verify(&signature_mac, &mac).map_err(AKEError::CryptographicViolation)?;
                let x_a = secrets.cp.decrypt(&[0; 16], &signature_encrypted);
                let mut decoder = OTRDecoder::new(&x_a);
                let pub_a = decoder.read_public_key().or(Err(AKEError::DataProcessing(
                    "Failed to read public key from X_A",
                )))?;
                let keyid_a = decoder.read_u32().or(Err(AKEError::DataProcessing(
                    "Failed to read keyid from X_A",
                )))?;
                if utils::u32::nonzero(keyid_a).is_none() {
                    return Err(AKEError::DataProcessing(
                        "keyid_a is zero, must be a non-zero value",
                    ));
                }
                let sig_m_a = decoder.read_signature().or(Err(AKEError::DataProcessing(
                    "Failed to read signature from X_A",
                )))?;
                let m_a = SHA256::hmac(
                    &secrets.m1p,
                    &OTREncoder::new()
                        .write_mpi(&state.gy)
                        .write_mpi(&state.our_dh_keypair.public)
                        .write_public_key(&pub_a)
                        .write_u32(keyid_a)
                        .to_vec(),
                );
                pub_a
                    .verify(&sig_m_a, &m_a)
                    .map_err(AKEError::CryptographicViolation)?;
                (
                    Ok(CryptographicMaterial {
                        version: self.version,
                        ssid: secrets.ssid,
                        our_dh: (*state.our_dh_keypair).clone(),
                        their_dh: state.gy.clone(),
                        their_dsa: pub_a,
                    }),
                    AKEState::None,
                )
            }
        };
        self.state = transition;
        result
    }
}

/// `CryptographicMaterial` contains the cryptographic material acquired
/// during the AKE. The AKE always uses keyid 1 for both parties, so there
/// is no point in including the ids.
pub struct CryptographicMaterial {
    pub version: Version,
    pub ssid: SSID,
    pub our_dh: DH::Keypair,
    pub their_dh: BigUint,
    pub their_dsa: DSA::PublicKey,
}

/// `AKEState` represents the available/recognized AKE states.
enum AKEState {
    /// No AKE is in progress.
    None,
    /// A D-H Commit message was sent; awaiting the D-H Key reply.
    AwaitingDHKey(AwaitingDHKey),
    /// A D-H Key message was sent; awaiting the Reveal Signature reply.
    AwaitingRevealSignature(AwaitingRevealSignature),
    /// A Reveal Signature message was sent; awaiting the Signature reply.
    AwaitingSignature(AwaitingSignature),
}

struct AwaitingDHKey {
    r: AES128::Key,
    our_dh_keypair: Rc<DH::Keypair>,
}

struct AwaitingRevealSignature {
    our_dh_keypair: Rc<DH::Keypair>,
    gx_encrypted: Vec<u8>,
    gx_hashed: Vec<u8>,
}

struct AwaitingSignature {
    our_dh_keypair: Rc<DH::Keypair>,
    gy: BigUint,
    s: DH::SharedSecret,
    previous_message: RevealSignatureMessage,
}

/// `AKEError` contains the variants of errors produced during the AKE.
#[derive(Debug)]
pub enum AKEError {
    /// AKE message processing produced an error due to a cryptographic
    /// violation.
    CryptographicViolation(CryptoError),
    /// AKE message ignored because it arrived in violation of the
    /// protocol.
    MessageIgnored,
    /// AKE message input is incomplete or otherwise non-conforming.
    DataProcessing(&'static str),
    /// Incorrect AKE state for the requested operation.
    IncorrectState,
}

pub struct DHCommitMessage {
    pub gx_encrypted: Vec<u8>,
    pub gx_hashed: Vec<u8>,
}

impl DHCommitMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<DHCommitMessage, OTRError> {
        Ok(DHCommitMessage {
            gx_encrypted: decoder.read_data()?,
            gx_hashed: decoder.read_data()?,
        })
    }
}

impl OTREncodable for DHCommitMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_data(&self.gx_encrypted)
            .write_data(&self.gx_hashed);
    }
}

pub struct DHKeyMessage {
    pub gy: BigUint,
}

impl DHKeyMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<DHKeyMessage, OTRError> {
        Ok(DHKeyMessage {
            gy: decoder.read_mpi()?,
        })
    }
}

impl OTREncodable for DHKeyMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder.write_mpi(&self.gy);
    }
}

#[derive(Clone)]
pub struct RevealSignatureMessage {
    pub key: AES128::Key,
    pub signature_encrypted: Vec<u8>,
    pub signature_mac: MAC,
}

impl RevealSignatureMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<RevealSignatureMessage, OTRError> {
        Ok(RevealSignatureMessage {
            key: AES128::Key(decoder.read_data()?.try_into().or(Err(
                OTRError::ProtocolViolation("Invalid format for 128-bit AES key."),
            ))?),
            signature_encrypted: decoder.read_data()?,
            signature_mac: decoder.read_mac()?,
        })
    }
}

impl OTREncodable for RevealSignatureMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_data(&self.key.0)
            .write_data(&self.signature_encrypted)
            .write_mac(&self.signature_mac);
    }
}

pub struct SignatureMessage {
    pub signature_encrypted: Vec<u8>,
    pub signature_mac: MAC,
}

impl SignatureMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<SignatureMessage, OTRError> {
        Ok(SignatureMessage {
            signature_encrypted: decoder.read_data()?,
            signature_mac: decoder.read_mac()?,
        })
    }
}

impl OTREncodable for SignatureMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_data(&self.signature_encrypted)
            .write_mac(&self.signature_mac);
    }
}
