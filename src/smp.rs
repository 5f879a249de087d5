// SPDX-License-Identifier: LGPL-3.0-only

use num_bigint::{BigInt, BigUint};
use num_integer::Integer;

use crate::{
    crypto::{modinverse, DH, DSA, OTR::SSID, SHA256},
    encoding::{OTRDecoder, OTREncoder},
    utils, OTRError, TLV,
};

/// TLV for initiating SMP.
const TLV_TYPE_SMP_MESSAGE_1: u16 = 2;
const TLV_TYPE_SMP_MESSAGE_2: u16 = 3;
const TLV_TYPE_SMP_MESSAGE_3: u16 = 4;
const TLV_TYPE_SMP_MESSAGE_4: u16 = 5;
const TLV_TYPE_SMP_ABORT: u16 = 6;
/// TLV similar to message 1 but includes a user-specified question
/// (null-terminated) in the payload.
const TLV_TYPE_SMP_MESSAGE_1Q: u16 = 7;

/// Length in bytes of the random exponents: 1536-bit values, like the
/// group modulus.
const EXPONENT_LEN: usize = 192;

/// `is_smp_tlv` checks whether a TLV is part of the SMP sub-protocol and
/// must therefore be consumed by the `SMPContext`.
#[must_use]
pub fn is_smp_tlv(tlv: &TLV) -> bool {
    (TLV_TYPE_SMP_MESSAGE_1..=TLV_TYPE_SMP_MESSAGE_1Q).contains(&tlv.0)
}

/// `SMPEvent` reports the outcome of processing an SMP TLV, for the
/// session to translate into host notifications.
#[derive(Debug, PartialEq, Eq)]
pub enum SMPEvent {
    None,
    /// The other party initiated SMP; the user must provide the shared
    /// secret. Carries the accompanying question, possibly empty.
    SecretRequested(Vec<u8>),
    /// The protocol completed and the secrets matched.
    Succeeded,
    /// The protocol completed but the secrets did not match.
    Failed,
    /// The exchange was aborted, by request or from a protocol violation.
    Aborted,
}

/// `SMPContext` runs the Socialist Millionaires Protocol: a zero-knowledge
/// equality test between two secrets known to the two parties, carried in
/// band over TLVs 2–7.
pub struct SMPContext {
    ssid: SSID,
    our_fingerprint: DSA::Fingerprint,
    their_fingerprint: DSA::Fingerprint,
    state: SMPState,
}

impl SMPContext {
    #[must_use]
    pub fn new(
        ssid: SSID,
        our_fingerprint: DSA::Fingerprint,
        their_fingerprint: DSA::Fingerprint,
    ) -> Self {
        Self {
            ssid,
            our_fingerprint,
            their_fingerprint,
            state: SMPState::Expect1,
        }
    }

    /// `in_progress` reports whether an SMP exchange is under way.
    #[must_use]
    pub fn in_progress(&self) -> bool {
        !matches!(self.state, SMPState::Expect1)
    }

    /// `initiate` starts SMP with the shared secret, optionally posing a
    /// question to the other party.
    pub fn initiate(&mut self, question: &[u8], secret: &[u8]) -> Result<TLV, OTRError> {
        if !matches!(self.state, SMPState::Expect1) {
            return Err(OTRError::SMPInProgress);
        }
        let g1 = &*DH::GENERATOR;
        let p = &*DH::MODULUS;
        let x = compute_secret(
            &self.our_fingerprint,
            &self.their_fingerprint,
            &self.ssid,
            secret,
        );
        let (a2, a3) = (random_exponent(), random_exponent());
        let g2a = g1.modpow(&a2, p);
        let g3a = g1.modpow(&a3, p);
        let (r2, r3) = (random_exponent(), random_exponent());
        let c2 = hash1(1, &g1.modpow(&r2, p));
        let d2 = zk_response(&r2, &a2, &c2);
        let c3 = hash1(2, &g1.modpow(&r3, p));
        let d3 = zk_response(&r3, &a3, &c3);

        let mut typ = TLV_TYPE_SMP_MESSAGE_1;
        let mut encoder = OTREncoder::new();
        if !question.is_empty() {
            typ = TLV_TYPE_SMP_MESSAGE_1Q;
            encoder.write_bytes_null_terminated(question);
        }
        let payload = encoder
            .write_mpi_sequence(&[&g2a, &c2, &d2, &g3a, &c3, &d3])
            .to_vec();
        self.state = SMPState::Expect2 { x, a2, a3 };
        Ok(TLV(typ, payload))
    }

    /// `respond` continues an exchange the other party initiated, with the
    /// local user's secret. The question is informational only; it does
    /// not contribute to the computation.
    pub fn respond(&mut self, _question: &[u8], secret: &[u8]) -> Result<TLV, OTRError> {
        let (g2a, g3a) = match &self.state {
            SMPState::ExpectSecret { g2a, g3a, .. } => (g2a.clone(), g3a.clone()),
            _ => {
                return Err(OTRError::SMPViolation(
                    "No SMP initiation pending a response.",
                ))
            }
        };
        let g1 = &*DH::GENERATOR;
        let p = &*DH::MODULUS;
        // responding, so the other party is the initiator
        let y = compute_secret(
            &self.their_fingerprint,
            &self.our_fingerprint,
            &self.ssid,
            secret,
        );
        let (b2, b3) = (random_exponent(), random_exponent());
        let (r2, r3, r4, r5, r6) = (
            random_exponent(),
            random_exponent(),
            random_exponent(),
            random_exponent(),
            random_exponent(),
        );
        let g2b = g1.modpow(&b2, p);
        let g3b = g1.modpow(&b3, p);
        let c2 = hash1(3, &g1.modpow(&r2, p));
        let d2 = zk_response(&r2, &b2, &c2);
        let c3 = hash1(4, &g1.modpow(&r3, p));
        let d3 = zk_response(&r3, &b3, &c3);
        let g2 = g2a.modpow(&b2, p);
        let g3 = g3a.modpow(&b3, p);
        let pb = g3.modpow(&r4, p);
        let qb = (g1.modpow(&r4, p) * g2.modpow(&y, p)) % p;
        let cp = hash2(
            5,
            &g3.modpow(&r5, p),
            &((g1.modpow(&r5, p) * g2.modpow(&r6, p)) % p),
        );
        let d5 = zk_response(&r5, &r4, &cp);
        let d6 = zk_response(&r6, &y, &cp);
        let payload = OTREncoder::new()
            .write_mpi_sequence(&[&g2b, &c2, &d2, &g3b, &c3, &d3, &pb, &qb, &cp, &d5, &d6])
            .to_vec();
        self.state = SMPState::Expect3 {
            g3a,
            g2,
            g3,
            b3,
            pb,
            qb,
        };
        Ok(TLV(TLV_TYPE_SMP_MESSAGE_2, payload))
    }

    /// `abort` indiscriminately resets the SMP state and produces the
    /// abort TLV to send.
    pub fn abort(&mut self) -> TLV {
        self.state = SMPState::Expect1;
        TLV(TLV_TYPE_SMP_ABORT, Vec::new())
    }

    /// `handle` processes one SMP TLV. Protocol violations do not error:
    /// they reset the state machine and answer with an abort TLV, so a
    /// misbehaving peer cannot break the data-message path.
    pub fn handle(&mut self, tlv: &TLV) -> (Option<TLV>, SMPEvent) {
        assert!(is_smp_tlv(tlv));
        if tlv.0 == TLV_TYPE_SMP_ABORT {
            log::info!("SMP exchange aborted by other party.");
            self.state = SMPState::Expect1;
            return (None, SMPEvent::Aborted);
        }
        match self.process(tlv) {
            Ok((reply, event)) => (reply, event),
            Err(violation) => {
                log::warn!("SMP message rejected: {violation}; aborting exchange.");
                (Some(self.abort()), SMPEvent::Aborted)
            }
        }
    }

    fn process(&mut self, tlv: &TLV) -> Result<(Option<TLV>, SMPEvent), &'static str> {
        match (tlv.0, &self.state) {
            (TLV_TYPE_SMP_MESSAGE_1 | TLV_TYPE_SMP_MESSAGE_1Q, SMPState::Expect1) => {
                self.process_message1(tlv)
            }
            (TLV_TYPE_SMP_MESSAGE_2, SMPState::Expect2 { .. }) => self.process_message2(tlv),
            (TLV_TYPE_SMP_MESSAGE_3, SMPState::Expect3 { .. }) => self.process_message3(tlv),
            (TLV_TYPE_SMP_MESSAGE_4, SMPState::Expect4 { .. }) => self.process_message4(tlv),
            _ => Err("SMP message arrived in unexpected state"),
        }
    }

    fn process_message1(&mut self, tlv: &TLV) -> Result<(Option<TLV>, SMPEvent), &'static str> {
        let g1 = &*DH::GENERATOR;
        let p = &*DH::MODULUS;
        let mut decoder = OTRDecoder::new(&tlv.1);
        let question = if tlv.0 == TLV_TYPE_SMP_MESSAGE_1Q {
            decoder.read_bytes_null_terminated()
        } else {
            Vec::new()
        };
        let mpis = decoder
            .read_mpi_sequence()
            .or(Err("Malformed MPI sequence in SMP message 1"))?;
        let [g2a, c2, d2, g3a, c3, d3]: [BigUint; 6] =
            mpis.try_into().or(Err("Unexpected number of MPI values"))?;
        verify_group_element(&g2a)?;
        verify_group_element(&g3a)?;
        // knowledge of a2: c2 = hash(1, g1^D2 * g2a^c2)
        verify_hash(
            &c2,
            &hash1(1, &((g1.modpow(&d2, p) * g2a.modpow(&c2, p)) % p)),
        )?;
        // knowledge of a3: c3 = hash(2, g1^D3 * g3a^c3)
        verify_hash(
            &c3,
            &hash1(2, &((g1.modpow(&d3, p) * g3a.modpow(&c3, p)) % p)),
        )?;
        self.state = SMPState::ExpectSecret {
            g2a,
            g3a,
            question: question.clone(),
        };
        Ok((None, SMPEvent::SecretRequested(question)))
    }

    fn process_message2(&mut self, tlv: &TLV) -> Result<(Option<TLV>, SMPEvent), &'static str> {
        let (x, a2, a3) = match &self.state {
            SMPState::Expect2 { x, a2, a3 } => (x.clone(), a2.clone(), a3.clone()),
            _ => panic!("BUG: state verified before dispatch"),
        };
        let g1 = &*DH::GENERATOR;
        let p = &*DH::MODULUS;
        let mpis = OTRDecoder::new(&tlv.1)
            .read_mpi_sequence()
            .or(Err("Malformed MPI sequence in SMP message 2"))?;
        let [g2b, c2, d2, g3b, c3, d3, pb, qb, cp, d5, d6]: [BigUint; 11] =
            mpis.try_into().or(Err("Unexpected number of MPI values"))?;
        verify_group_element(&g2b)?;
        verify_group_element(&g3b)?;
        verify_group_element(&pb)?;
        verify_group_element(&qb)?;
        verify_hash(
            &c2,
            &hash1(3, &((g1.modpow(&d2, p) * g2b.modpow(&c2, p)) % p)),
        )?;
        verify_hash(
            &c3,
            &hash1(4, &((g1.modpow(&d3, p) * g3b.modpow(&c3, p)) % p)),
        )?;
        let g2 = g2b.modpow(&a2, p);
        let g3 = g3b.modpow(&a3, p);
        // proof that Pb and Qb were formed consistently:
        // cp = hash(5, g3^D5 * Pb^cp, g1^D5 * g2^D6 * Qb^cp)
        verify_hash(
            &cp,
            &hash2(
                5,
                &((g3.modpow(&d5, p) * pb.modpow(&cp, p)) % p),
                &((g1.modpow(&d5, p) * g2.modpow(&d6, p) * qb.modpow(&cp, p)) % p),
            ),
        )?;
        let (r4, r5, r6, r7) = (
            random_exponent(),
            random_exponent(),
            random_exponent(),
            random_exponent(),
        );
        let pa = g3.modpow(&r4, p);
        let qa = (g1.modpow(&r4, p) * g2.modpow(&x, p)) % p;
        let cp_a = hash2(
            6,
            &g3.modpow(&r5, p),
            &((g1.modpow(&r5, p) * g2.modpow(&r6, p)) % p),
        );
        let d5_a = zk_response(&r5, &r4, &cp_a);
        let d6_a = zk_response(&r6, &x, &cp_a);
        let qa_qb = divide(&qa, &qb)?;
        let ra = qa_qb.modpow(&a3, p);
        let cr = hash2(7, &g1.modpow(&r7, p), &qa_qb.modpow(&r7, p));
        let d7 = zk_response(&r7, &a3, &cr);
        let payload = OTREncoder::new()
            .write_mpi_sequence(&[&pa, &qa, &cp_a, &d5_a, &d6_a, &ra, &cr, &d7])
            .to_vec();
        let pa_pb = divide(&pa, &pb)?;
        self.state = SMPState::Expect4 {
            g3b,
            pa_pb,
            qa_qb,
            a3,
        };
        Ok((
            Some(TLV(TLV_TYPE_SMP_MESSAGE_3, payload)),
            SMPEvent::None,
        ))
    }

    fn process_message3(&mut self, tlv: &TLV) -> Result<(Option<TLV>, SMPEvent), &'static str> {
        let (g3a, g2, g3, b3, pb, qb) = match &self.state {
            SMPState::Expect3 {
                g3a,
                g2,
                g3,
                b3,
                pb,
                qb,
            } => (
                g3a.clone(),
                g2.clone(),
                g3.clone(),
                b3.clone(),
                pb.clone(),
                qb.clone(),
            ),
            _ => panic!("BUG: state verified before dispatch"),
        };
        let g1 = &*DH::GENERATOR;
        let p = &*DH::MODULUS;
        let mpis = OTRDecoder::new(&tlv.1)
            .read_mpi_sequence()
            .or(Err("Malformed MPI sequence in SMP message 3"))?;
        let [pa, qa, cp, d5, d6, ra, cr, d7]: [BigUint; 8] =
            mpis.try_into().or(Err("Unexpected number of MPI values"))?;
        verify_group_element(&pa)?;
        verify_group_element(&qa)?;
        verify_group_element(&ra)?;
        verify_hash(
            &cp,
            &hash2(
                6,
                &((g3.modpow(&d5, p) * pa.modpow(&cp, p)) % p),
                &((g1.modpow(&d5, p) * g2.modpow(&d6, p) * qa.modpow(&cp, p)) % p),
            ),
        )?;
        let qa_qb = divide(&qa, &qb)?;
        verify_hash(
            &cr,
            &hash2(
                7,
                &((g1.modpow(&d7, p) * g3a.modpow(&cr, p)) % p),
                &((qa_qb.modpow(&d7, p) * ra.modpow(&cr, p)) % p),
            ),
        )?;
        let r7 = random_exponent();
        let rb = qa_qb.modpow(&b3, p);
        let cr_b = hash2(8, &g1.modpow(&r7, p), &qa_qb.modpow(&r7, p));
        let d7_b = zk_response(&r7, &b3, &cr_b);
        let payload = OTREncoder::new()
            .write_mpi_sequence(&[&rb, &cr_b, &d7_b])
            .to_vec();
        // Compare Rab against Pa / Pb to learn whether the secrets match.
        let rab = ra.modpow(&b3, p);
        let pa_pb = divide(&pa, &pb)?;
        let event = if rab == pa_pb {
            log::info!("SMP exchange completed: secrets match.");
            SMPEvent::Succeeded
        } else {
            log::info!("SMP exchange completed: secrets do not match.");
            SMPEvent::Failed
        };
        self.state = SMPState::Expect1;
        Ok((Some(TLV(TLV_TYPE_SMP_MESSAGE_4, payload)), event))
    }

    fn process_message4(&mut self, tlv: &TLV) -> Result<(Option<TLV>, SMPEvent), &'static str> {
        let (g3b, pa_pb, qa_qb, a3) = match &self.state {
            SMPState::Expect4 {
                g3b,
                pa_pb,
                qa_qb,
                a3,
            } => (g3b.clone(), pa_pb.clone(), qa_qb.clone(), a3.clone()),
            _ => panic!("BUG: state verified before dispatch"),
        };
        let g1 = &*DH::GENERATOR;
        let p = &*DH::MODULUS;
        let mpis = OTRDecoder::new(&tlv.1)
            .read_mpi_sequence()
            .or(Err("Malformed MPI sequence in SMP message 4"))?;
        let [rb, cr, d7]: [BigUint; 3] =
            mpis.try_into().or(Err("Unexpected number of MPI values"))?;
        verify_group_element(&rb)?;
        verify_hash(
            &cr,
            &hash2(
                8,
                &((g1.modpow(&d7, p) * g3b.modpow(&cr, p)) % p),
                &((qa_qb.modpow(&d7, p) * rb.modpow(&cr, p)) % p),
            ),
        )?;
        let rab = rb.modpow(&a3, p);
        let event = if rab == pa_pb {
            log::info!("SMP exchange completed: secrets match.");
            SMPEvent::Succeeded
        } else {
            log::info!("SMP exchange completed: secrets do not match.");
            SMPEvent::Failed
        };
        self.state = SMPState::Expect1;
        Ok((None, event))
    }
}

/// `compute_secret` derives the actual SMP input value from the session
/// and the user-provided secret. Plain concatenation, no length prefixes.
fn compute_secret(
    initiator: &DSA::Fingerprint,
    responder: &DSA::Fingerprint,
    ssid: &SSID,
    secret: &[u8],
) -> BigUint {
    let mut buffer = Vec::with_capacity(1 + 20 + 20 + 8 + secret.len());
    buffer.push(0x01);
    buffer.extend_from_slice(initiator);
    buffer.extend_from_slice(responder);
    buffer.extend_from_slice(ssid);
    buffer.extend_from_slice(secret);
    BigUint::from_bytes_be(&SHA256::digest(&buffer))
}

fn hash1(version: u8, mpi1: &BigUint) -> BigUint {
    BigUint::from_bytes_be(&SHA256::digest_with_prefix(
        version,
        &OTREncoder::new().write_mpi(mpi1).to_vec(),
    ))
}

fn hash2(version: u8, mpi1: &BigUint, mpi2: &BigUint) -> BigUint {
    BigUint::from_bytes_be(&SHA256::digest_with_prefix(
        version,
        &OTREncoder::new().write_mpi(mpi1).write_mpi(mpi2).to_vec(),
    ))
}

/// `zk_response` computes the response value of a zero-knowledge proof:
/// `r - x*c`, taken modulo `(p-1)/2`.
fn zk_response(r: &BigUint, x: &BigUint, c: &BigUint) -> BigUint {
    let q = BigInt::from(DH::Q.clone());
    let result = (BigInt::from(r.clone()) - BigInt::from(x.clone()) * BigInt::from(c.clone()))
        .mod_floor(&q);
    result
        .to_biguint()
        .expect("BUG: floor-mod by a positive modulus must be non-negative")
}

/// `divide` computes `a / b` in the group, i.e. `a * b^-1 mod p`.
fn divide(a: &BigUint, b: &BigUint) -> Result<BigUint, &'static str> {
    let p = &*DH::MODULUS;
    let inverse = modinverse(b, p).ok_or("Value has no inverse in the group")?;
    Ok((a * inverse) % p)
}

fn verify_group_element(v: &BigUint) -> Result<(), &'static str> {
    DH::verify_public_key(v).or(Err("Value is not a valid group element"))
}

fn verify_hash(expected: &BigUint, actual: &BigUint) -> Result<(), &'static str> {
    if expected == actual {
        Ok(())
    } else {
        Err("Zero-knowledge proof fails verification")
    }
}

fn random_exponent() -> BigUint {
    let mut bytes = [0u8; EXPONENT_LEN];
    utils::random::fill_secure_bytes(&mut bytes);
    BigUint::from_bytes_be(&bytes)
}

enum SMPState {
    /// No exchange in progress; an SMP 1 message is acceptable.
    Expect1,
    /// The other party initiated; the local user's secret is needed
    /// before the exchange can continue.
    ExpectSecret {
        g2a: BigUint,
        g3a: BigUint,
        #[allow(dead_code)]
        question: Vec<u8>,
    },
    Expect2 {
        x: BigUint,
        a2: BigUint,
        a3: BigUint,
    },
    Expect3 {
        g3a: BigUint,
        g2: BigUint,
        g3: BigUint,
        b3: BigUint,
        pb: BigUint,
        qb: BigUint,
    },
    Expect4 {
        g3b: BigUint,
        pa_pb: BigUint,
        qa_qb: BigUint,
        a3: BigUint,
    },
}

#[cfg(test)]
mod tests {
    use super::{is_smp_tlv, SMPContext, SMPEvent};
    use crate::TLV;

    fn contexts() -> (SMPContext, SMPContext) {
        let ssid = [1, 2, 3, 4, 5, 6, 7, 8];
        let alice_fp = [0xaa; 20];
        let bob_fp = [0xbb; 20];
        (
            SMPContext::new(ssid, alice_fp, bob_fp),
            SMPContext::new(ssid, bob_fp, alice_fp),
        )
    }

    fn run_exchange(
        alice: &mut SMPContext,
        bob: &mut SMPContext,
        alice_secret: &[u8],
        bob_secret: &[u8],
    ) -> (SMPEvent, SMPEvent) {
        let smp1 = alice.initiate(b"question", alice_secret).unwrap();
        let (reply, event) = bob.handle(&smp1);
        assert!(reply.is_none());
        assert_eq!(SMPEvent::SecretRequested(b"question".to_vec()), event);
        let smp2 = bob.respond(b"question", bob_secret).unwrap();
        let (smp3, event) = alice.handle(&smp2);
        assert_eq!(SMPEvent::None, event);
        let (smp4, bob_event) = bob.handle(&smp3.unwrap());
        let (none, alice_event) = alice.handle(&smp4.unwrap());
        assert!(none.is_none());
        assert!(!alice.in_progress());
        assert!(!bob.in_progress());
        (alice_event, bob_event)
    }

    #[test]
    fn test_smp_succeeds_on_matching_secrets() {
        let (mut alice, mut bob) = contexts();
        let (alice_event, bob_event) = run_exchange(&mut alice, &mut bob, b"blue", b"blue");
        assert_eq!(SMPEvent::Succeeded, alice_event);
        assert_eq!(SMPEvent::Succeeded, bob_event);
    }

    #[test]
    fn test_smp_fails_on_mismatching_secrets() {
        let (mut alice, mut bob) = contexts();
        let (alice_event, bob_event) = run_exchange(&mut alice, &mut bob, b"blue", b"red");
        assert_eq!(SMPEvent::Failed, alice_event);
        assert_eq!(SMPEvent::Failed, bob_event);
    }

    #[test]
    fn test_smp_without_question() {
        let (mut alice, mut bob) = contexts();
        let smp1 = alice.initiate(b"", b"blue").unwrap();
        let (_, event) = bob.handle(&smp1);
        assert_eq!(SMPEvent::SecretRequested(Vec::new()), event);
    }

    #[test]
    fn test_initiate_twice_is_refused() {
        let (mut alice, _) = contexts();
        alice.initiate(b"", b"blue").unwrap();
        assert!(alice.initiate(b"", b"blue").is_err());
        assert!(alice.in_progress());
    }

    #[test]
    fn test_respond_without_initiation_is_refused() {
        let (_, mut bob) = contexts();
        assert!(bob.respond(b"", b"blue").is_err());
    }

    #[test]
    fn test_abort_resets_exchange() {
        let (mut alice, mut bob) = contexts();
        let smp1 = alice.initiate(b"", b"blue").unwrap();
        let _ = bob.handle(&smp1);
        assert!(bob.in_progress());
        let abort = bob.abort();
        assert!(!bob.in_progress());
        let (reply, event) = alice.handle(&abort);
        assert!(reply.is_none());
        assert_eq!(SMPEvent::Aborted, event);
        assert!(!alice.in_progress());
    }

    #[test]
    fn test_unexpected_message_answered_with_abort() {
        let (mut alice, mut bob) = contexts();
        let smp1 = alice.initiate(b"", b"blue").unwrap();
        // deliver SMP 1 to the initiator itself: wrong state
        let (reply, event) = alice.handle(&smp1);
        assert_eq!(SMPEvent::Aborted, event);
        assert!(reply.is_some());
        assert!(!alice.in_progress());
        // garbage payload aborts instead of erroring out
        let garbage = TLV(3, b"garbage".to_vec());
        alice.initiate(b"", b"blue").unwrap();
        let (reply, event) = alice.handle(&garbage);
        assert_eq!(SMPEvent::Aborted, event);
        assert!(reply.is_some());
        let _ = bob;
    }

    #[test]
    fn test_is_smp_tlv() {
        assert!(!is_smp_tlv(&TLV(0, Vec::new())));
        assert!(!is_smp_tlv(&TLV(1, Vec::new())));
        for typ in 2..=7u16 {
            assert!(is_smp_tlv(&TLV(typ, Vec::new())));
        }
        assert!(!is_smp_tlv(&TLV(8, Vec::new())));
    }
}
