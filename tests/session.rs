// SPDX-License-Identifier: LGPL-3.0-only

//! End-to-end tests: two session engines talking to each other through an
//! in-memory host/transport.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use otrcore::crypto::DSA;
use otrcore::{Host, OTRError, Policy, ProtocolStatus, Session, SessionEventListener, SessionID};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Event {
    Error(Vec<u8>),
    Unencrypted(Vec<u8>),
    Unreadable,
    Finished,
    RequireEncryption,
    FromAnotherInstance,
    MultipleInstances,
    SecretRequested(Vec<u8>),
    Verified,
    Unverified,
}

struct TestHost {
    policy: Cell<Policy>,
    keypair: DSA::Keypair,
    max_fragment: Cell<usize>,
    outbound: RefCell<VecDeque<Vec<u8>>>,
    events: RefCell<Vec<Event>>,
}

impl TestHost {
    fn new(policy: Policy) -> Rc<Self> {
        Rc::new(Self {
            policy: Cell::new(policy),
            keypair: DSA::Keypair::generate(),
            max_fragment: Cell::new(usize::MAX),
            outbound: RefCell::new(VecDeque::new()),
            events: RefCell::new(Vec::new()),
        })
    }

    fn drain(&self) -> Vec<Vec<u8>> {
        self.outbound.borrow_mut().drain(..).collect()
    }

    fn has_event(&self, event: &Event) -> bool {
        self.events.borrow().iter().any(|e| e == event)
    }

    fn count_event(&self, event: &Event) -> usize {
        self.events.borrow().iter().filter(|e| *e == event).count()
    }
}

impl Host for TestHost {
    fn inject_message(&self, _session: &SessionID, message: &[u8]) {
        self.outbound.borrow_mut().push_back(Vec::from(message));
    }

    fn policy(&self, _session: &SessionID) -> Policy {
        self.policy.get()
    }

    fn local_keypair(&self, _session: &SessionID) -> DSA::Keypair {
        self.keypair.clone()
    }

    fn max_fragment_size(&self, _session: &SessionID) -> usize {
        self.max_fragment.get()
    }

    fn show_error(&self, _session: &SessionID, error: &[u8]) {
        self.events.borrow_mut().push(Event::Error(Vec::from(error)));
    }

    fn unencrypted_message_received(&self, _session: &SessionID, content: &[u8]) {
        self.events
            .borrow_mut()
            .push(Event::Unencrypted(Vec::from(content)));
    }

    fn unreadable_message_received(&self, _session: &SessionID) {
        self.events.borrow_mut().push(Event::Unreadable);
    }

    fn finished_session_message(&self, _session: &SessionID, _content: &[u8]) {
        self.events.borrow_mut().push(Event::Finished);
    }

    fn require_encrypted_message(&self, _session: &SessionID, _content: &[u8]) {
        self.events.borrow_mut().push(Event::RequireEncryption);
    }

    fn message_from_another_instance(&self, _session: &SessionID) {
        self.events.borrow_mut().push(Event::FromAnotherInstance);
    }

    fn multiple_instances_detected(&self, _session: &SessionID) {
        self.events.borrow_mut().push(Event::MultipleInstances);
    }

    fn ask_for_secret(&self, _session: &SessionID, question: &[u8]) {
        self.events
            .borrow_mut()
            .push(Event::SecretRequested(Vec::from(question)));
    }

    fn verify(&self, _session: &SessionID, _fingerprint: &DSA::Fingerprint) {
        self.events.borrow_mut().push(Event::Verified);
    }

    fn unverify(&self, _session: &SessionID, _fingerprint: &DSA::Fingerprint) {
        self.events.borrow_mut().push(Event::Unverified);
    }
}

#[derive(Default)]
struct TestListener {
    events: RefCell<Vec<&'static str>>,
}

impl SessionEventListener for TestListener {
    fn session_status_changed(&self, _session: &SessionID) {
        self.events.borrow_mut().push("status");
    }

    fn multiple_instances_detected(&self, _session: &SessionID) {
        self.events.borrow_mut().push("instances");
    }

    fn outgoing_session_changed(&self, _session: &SessionID) {
        self.events.borrow_mut().push("outgoing");
    }
}

/// Shuttle protocol-internal traffic between the two parties until both
/// transport queues run dry. Returns the messages surfaced to each user.
fn pump(
    alice: &mut Session,
    alice_host: &TestHost,
    bob: &mut Session,
    bob_host: &TestHost,
) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mut alice_received = Vec::new();
    let mut bob_received = Vec::new();
    loop {
        let mut progress = false;
        for frame in alice_host.drain() {
            progress = true;
            if let Some(content) = bob.transform_receiving(&frame).unwrap() {
                bob_received.push(content);
            }
        }
        for frame in bob_host.drain() {
            progress = true;
            if let Some(content) = alice.transform_receiving(&frame).unwrap() {
                alice_received.push(content);
            }
        }
        if !progress {
            break;
        }
    }
    (alice_received, bob_received)
}

fn new_pair(
    alice_policy: Policy,
    bob_policy: Policy,
) -> (Session, Rc<TestHost>, Session, Rc<TestHost>) {
    let alice_host = TestHost::new(alice_policy);
    let bob_host = TestHost::new(bob_policy);
    let alice = Session::new(
        alice_host.clone() as Rc<dyn Host>,
        SessionID::new("alice@network", "bob@network", "test"),
    );
    let bob = Session::new(
        bob_host.clone() as Rc<dyn Host>,
        SessionID::new("bob@network", "alice@network", "test"),
    );
    (alice, alice_host, bob, bob_host)
}

fn establish(
    alice_policy: Policy,
    bob_policy: Policy,
) -> (Session, Rc<TestHost>, Session, Rc<TestHost>) {
    let (mut alice, alice_host, mut bob, bob_host) = new_pair(alice_policy, bob_policy);
    alice.start_session().unwrap();
    pump(&mut alice, &alice_host, &mut bob, &bob_host);
    assert_eq!(ProtocolStatus::Encrypted, alice.status());
    assert_eq!(ProtocolStatus::Encrypted, bob.status());
    (alice, alice_host, bob, bob_host)
}

fn deliver(session: &mut Session, frames: &[Vec<u8>]) -> Option<Vec<u8>> {
    let mut result = None;
    for frame in frames {
        if let Some(content) = session.transform_receiving(frame).unwrap() {
            result = Some(content);
        }
    }
    result
}

#[test]
fn test_clean_v3_ake_and_roundtrip() {
    let (mut alice, alice_host, mut bob, bob_host) = new_pair(
        Policy::ALLOW_V3 | Policy::REQUIRE_ENCRYPTION,
        Policy::ALLOW_V3,
    );
    // sending while unencrypted is withheld; a query goes out instead
    let frames = alice.transform_sending(b"hello", &[]).unwrap();
    assert!(frames.is_empty());
    assert!(alice_host.has_event(&Event::RequireEncryption));
    let queued = alice_host.outbound.borrow();
    assert!(queued.iter().any(|f| f.starts_with(b"?OTRv3?")));
    drop(queued);
    // after four AKE messages both sessions are encrypted
    pump(&mut alice, &alice_host, &mut bob, &bob_host);
    assert_eq!(ProtocolStatus::Encrypted, alice.status());
    assert_eq!(ProtocolStatus::Encrypted, bob.status());
    assert!(alice.remote_public_key().is_some());
    // and the actual message goes through
    let frames = alice.transform_sending(b"hello", &[]).unwrap();
    assert_eq!(1, frames.len());
    assert!(frames[0].starts_with(b"?OTR:"));
    assert_eq!(Some(b"hello".to_vec()), deliver(&mut bob, &frames));
}

#[test]
fn test_no_remote_key_in_plaintext() {
    let (alice, _, _, _) = new_pair(Policy::ALLOW_V3, Policy::ALLOW_V3);
    assert_eq!(ProtocolStatus::Plaintext, alice.status());
    assert!(alice.remote_public_key().is_none());
}

#[test]
fn test_whitespace_tagged_offer_starts_ake() {
    let (mut alice, alice_host, mut bob, bob_host) =
        new_pair(Policy::OPPORTUNISTIC, Policy::OPPORTUNISTIC);
    let frames = alice.transform_sending(b"hi there", &[]).unwrap();
    assert_eq!(1, frames.len());
    // the message carries a whitespace tag and still reads normally
    assert_eq!(Some(b"hi there".to_vec()), deliver(&mut bob, &frames));
    pump(&mut alice, &alice_host, &mut bob, &bob_host);
    assert_eq!(ProtocolStatus::Encrypted, alice.status());
    assert_eq!(ProtocolStatus::Encrypted, bob.status());
}

#[test]
fn test_plain_session_when_otr_disabled() {
    let (mut alice, _, _, _) = new_pair(Policy::ALLOW_V1, Policy::ALLOW_V3);
    // ALLOW_V1 alone does not count; input passes through untouched
    assert_eq!(
        Some(b"?OTRv3? hello".to_vec()),
        alice.transform_receiving(b"?OTRv3? hello").unwrap()
    );
}

#[test]
fn test_v2_fallback_negotiation() {
    let (mut alice, alice_host, mut bob, bob_host) = new_pair(
        Policy::ALLOW_V2,
        Policy::ALLOW_V2 | Policy::ALLOW_V3,
    );
    alice.start_session().unwrap();
    {
        let queued = alice_host.outbound.borrow();
        assert!(queued.iter().any(|f| f.starts_with(b"?OTRv2?")));
    }
    pump(&mut alice, &alice_host, &mut bob, &bob_host);
    assert_eq!(ProtocolStatus::Encrypted, alice.status());
    assert_eq!(ProtocolStatus::Encrypted, bob.status());
    let frames = alice.transform_sending(b"legacy but encrypted", &[]).unwrap();
    assert_eq!(Some(b"legacy but encrypted".to_vec()), deliver(&mut bob, &frames));
    let frames = bob.transform_sending(b"ack", &[]).unwrap();
    assert_eq!(Some(b"ack".to_vec()), deliver(&mut alice, &frames));
}

#[test]
fn test_long_conversation_ratchets() {
    let (mut alice, _alice_host, mut bob, _bob_host) =
        establish(Policy::ALLOW_V3, Policy::ALLOW_V3);
    for round in 0..6u8 {
        let ping = format!("ping {round}").into_bytes();
        let frames = alice.transform_sending(&ping, &[]).unwrap();
        assert_eq!(Some(ping), deliver(&mut bob, &frames));
        let pong = format!("pong {round}").into_bytes();
        let frames = bob.transform_sending(&pong, &[]).unwrap();
        assert_eq!(Some(pong), deliver(&mut alice, &frames));
    }
}

#[test]
fn test_fragmentation_roundtrip() {
    let (mut alice, alice_host, mut bob, _bob_host) =
        establish(Policy::ALLOW_V3, Policy::ALLOW_V3);
    alice_host.max_fragment.set(150);
    let content: Vec<u8> = std::iter::repeat(b'x').take(400).collect();
    let frames = alice.transform_sending(&content, &[]).unwrap();
    assert!(frames.len() > 1);
    for frame in &frames {
        assert!(frame.len() <= 150);
        assert!(frame.starts_with(b"?OTR|"));
    }
    assert_eq!(Some(content), deliver(&mut bob, &frames));
}

#[test]
fn test_fragments_out_of_order_rejected() {
    let (mut alice, alice_host, mut bob, _bob_host) =
        establish(Policy::ALLOW_V3, Policy::ALLOW_V3);
    alice_host.max_fragment.set(150);
    let content: Vec<u8> = std::iter::repeat(b'y').take(400).collect();
    let mut frames = alice.transform_sending(&content, &[]).unwrap();
    assert!(frames.len() >= 3);
    // permute: deliver the second fragment first
    frames.swap(0, 1);
    assert_eq!(None, deliver(&mut bob, &frames));
    // the session survives and later messages still arrive
    alice_host.max_fragment.set(usize::MAX);
    let frames = alice.transform_sending(b"still alive", &[]).unwrap();
    assert_eq!(Some(b"still alive".to_vec()), deliver(&mut bob, &frames));
}

#[test]
fn test_replayed_data_message_rejected() {
    let (mut alice, _alice_host, mut bob, bob_host) =
        establish(Policy::ALLOW_V3, Policy::ALLOW_V3);
    let frames = alice.transform_sending(b"m1", &[]).unwrap();
    assert_eq!(Some(b"m1".to_vec()), deliver(&mut bob, &frames));
    // replaying the very same frame must not decrypt a second time
    assert_eq!(None, deliver(&mut bob, &frames));
    assert!(bob_host.has_event(&Event::Unreadable));
    // the sender is notified through an OTR error message
    let error_frames = bob_host.drain();
    assert!(error_frames
        .iter()
        .any(|f| f.starts_with(b"?OTR Error:")));
    assert_eq!(ProtocolStatus::Encrypted, bob.status());
    // the conversation continues unharmed
    let frames = alice.transform_sending(b"m2", &[]).unwrap();
    assert_eq!(Some(b"m2".to_vec()), deliver(&mut bob, &frames));
}

#[test]
fn test_end_session_disconnect_tlv() {
    let (mut alice, alice_host, mut bob, bob_host) =
        establish(Policy::ALLOW_V3, Policy::ALLOW_V3);
    alice.end_session().unwrap();
    assert_eq!(ProtocolStatus::Plaintext, alice.status());
    // the disconnect travels as an injected data message
    pump(&mut alice, &alice_host, &mut bob, &bob_host);
    assert_eq!(ProtocolStatus::Finished, bob.status());
    // sending from a finished session is refused and reported
    let frames = bob.transform_sending(b"anything", &[]).unwrap();
    assert!(frames.is_empty());
    assert!(bob_host.has_event(&Event::Finished));
}

#[test]
fn test_refresh_session_reestablishes() {
    let (mut alice, alice_host, mut bob, bob_host) =
        establish(Policy::ALLOW_V3, Policy::ALLOW_V3);
    alice.refresh_session().unwrap();
    pump(&mut alice, &alice_host, &mut bob, &bob_host);
    assert_eq!(ProtocolStatus::Encrypted, alice.status());
    assert_eq!(ProtocolStatus::Encrypted, bob.status());
    let frames = alice.transform_sending(b"fresh keys", &[]).unwrap();
    assert_eq!(Some(b"fresh keys".to_vec()), deliver(&mut bob, &frames));
}

#[test]
fn test_unencrypted_message_warning_in_encrypted_session() {
    let (_alice, _alice_host, mut bob, bob_host) =
        establish(Policy::ALLOW_V3, Policy::ALLOW_V3);
    let received = bob.transform_receiving(b"plaintext sneaking by").unwrap();
    assert_eq!(Some(b"plaintext sneaking by".to_vec()), received);
    assert!(bob_host.has_event(&Event::Unencrypted(b"plaintext sneaking by".to_vec())));
}

#[test]
fn test_error_message_surfaces_and_starts_ake() {
    let (mut alice, alice_host, _bob, _bob_host) = new_pair(
        Policy::ALLOW_V3 | Policy::ERROR_START_AKE,
        Policy::ALLOW_V3,
    );
    let received = alice
        .transform_receiving(b"?OTR Error: something went wrong")
        .unwrap();
    assert_eq!(None, received);
    assert!(alice_host.has_event(&Event::Error(b" something went wrong".to_vec())));
    let queued = alice_host.drain();
    assert!(queued.iter().any(|f| f.starts_with(b"?OTRv3?")));
}

#[test]
fn test_smp_success() {
    let (mut alice, alice_host, mut bob, bob_host) =
        establish(Policy::ALLOW_V3, Policy::ALLOW_V3);
    alice.init_smp(b"colour", b"blue").unwrap();
    assert!(alice.is_smp_in_progress());
    pump(&mut alice, &alice_host, &mut bob, &bob_host);
    assert!(bob_host.has_event(&Event::SecretRequested(b"colour".to_vec())));
    bob.respond_smp(b"colour", b"blue").unwrap();
    let (alice_texts, bob_texts) = pump(&mut alice, &alice_host, &mut bob, &bob_host);
    // SMP runs entirely in band; no text surfaces on either side
    assert!(alice_texts.is_empty());
    assert!(bob_texts.is_empty());
    assert!(alice_host.has_event(&Event::Verified));
    assert!(bob_host.has_event(&Event::Verified));
    assert!(!alice.is_smp_in_progress());
    assert!(!bob.is_smp_in_progress());
}

#[test]
fn test_smp_mismatch() {
    let (mut alice, alice_host, mut bob, bob_host) =
        establish(Policy::ALLOW_V3, Policy::ALLOW_V3);
    alice.init_smp(b"colour", b"blue").unwrap();
    pump(&mut alice, &alice_host, &mut bob, &bob_host);
    bob.respond_smp(b"colour", b"red").unwrap();
    pump(&mut alice, &alice_host, &mut bob, &bob_host);
    assert!(alice_host.has_event(&Event::Unverified));
    assert!(bob_host.has_event(&Event::Unverified));
    assert!(!alice.is_smp_in_progress());
    assert!(!bob.is_smp_in_progress());
}

#[test]
fn test_smp_requires_encrypted_session() {
    let (mut alice, _, _, _) = new_pair(Policy::ALLOW_V3, Policy::ALLOW_V3);
    assert!(matches!(
        alice.init_smp(b"q", b"secret"),
        Err(OTRError::IncorrectState(_))
    ));
}

#[test]
fn test_second_client_instance_gets_own_slave() {
    // alice is logged in twice; bob's master session is pinned to the
    // first login and a slave grows for the second
    let (mut alice1, alice1_host, mut bob, bob_host) =
        establish(Policy::ALLOW_V3, Policy::ALLOW_V3);
    let listener = Rc::new(TestListener::default());
    bob.add_listener(listener.clone() as Rc<dyn SessionEventListener>);
    let alice2_host = TestHost::new(Policy::ALLOW_V3);
    let mut alice2 = Session::new(
        alice2_host.clone() as Rc<dyn Host>,
        SessionID::new("alice@network", "bob@network", "test"),
    );
    alice2.start_session().unwrap();
    pump(&mut alice2, &alice2_host, &mut bob, &bob_host);
    assert_eq!(ProtocolStatus::Encrypted, alice2.status());
    assert!(bob_host.has_event(&Event::MultipleInstances));
    assert!(listener.events.borrow().contains(&"instances"));
    assert_eq!(2, bob.instances().len());
    // the slave is encrypted, independently of the master
    assert_eq!(
        ProtocolStatus::Encrypted,
        bob.status_of(alice2.sender_instance_tag())
    );
    // direct outgoing traffic at the second login
    assert!(bob.set_outgoing_instance(alice2.sender_instance_tag()));
    assert!(listener.events.borrow().contains(&"outgoing"));
    let frames = bob.transform_sending(b"to the second login", &[]).unwrap();
    assert_eq!(
        Some(b"to the second login".to_vec()),
        deliver(&mut alice2, &frames)
    );
    // the first login cannot read frames addressed to the second
    assert_eq!(None, deliver(&mut alice1, &frames));
    assert!(alice1_host.has_event(&Event::FromAnotherInstance));
}

#[test]
fn test_unpinned_master_isolates_data_from_unknown_instance() {
    let bob_host = TestHost::new(Policy::ALLOW_V3);
    let mut bob = Session::new(
        bob_host.clone() as Rc<dyn Host>,
        SessionID::new("bob@network", "alice@network", "test"),
    );
    let own = bob.sender_instance_tag();
    // a data message from an unknown instance spawns a slave, which
    // cannot read it either
    assert_eq!(
        None,
        bob.transform_receiving(&crafted_data_frame(0xaaaa_aaaa, own))
            .unwrap()
    );
    assert!(bob_host.has_event(&Event::MultipleInstances));
    assert!(bob_host.has_event(&Event::Unreadable));
    assert_eq!(2, bob.instances().len());
    // a DH-Key from yet another instance spawns a second slave
    assert_eq!(
        None,
        bob.transform_receiving(&crafted_dhkey_frame(0xbbbb_bbbb, own))
            .unwrap()
    );
    assert_eq!(3, bob.instances().len());
    assert!(bob_host.count_event(&Event::MultipleInstances) >= 2);
}

#[test]
fn test_status_events_fire_only_on_change() {
    let (mut alice, alice_host, mut bob, bob_host) =
        new_pair(Policy::ALLOW_V3, Policy::ALLOW_V3);
    let listener = Rc::new(TestListener::default());
    alice.add_listener(listener.clone() as Rc<dyn SessionEventListener>);
    alice.start_session().unwrap();
    pump(&mut alice, &alice_host, &mut bob, &bob_host);
    let after_ake = listener.events.borrow().len();
    assert_eq!(1, after_ake); // Plaintext -> Encrypted, exactly once
    // ending twice only fires one transition
    alice.end_session().unwrap();
    alice.end_session().unwrap();
    assert_eq!(after_ake + 1, listener.events.borrow().len());
}

// Hand-crafted encoded frames for exercising the instance router with
// traffic that no honest session would produce.

fn envelope(payload: &[u8]) -> Vec<u8> {
    let mut frame = b"?OTR:".to_vec();
    frame.extend(base64::encode(payload).into_bytes());
    frame.push(b'.');
    frame
}

fn crafted_data_frame(sender: u32, receiver: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&3u16.to_be_bytes());
    payload.push(0x03); // data message
    payload.extend_from_slice(&sender.to_be_bytes());
    payload.extend_from_slice(&receiver.to_be_bytes());
    payload.push(0); // flags
    payload.extend_from_slice(&1u32.to_be_bytes()); // sender keyid
    payload.extend_from_slice(&1u32.to_be_bytes()); // recipient keyid
    payload.extend_from_slice(&4u32.to_be_bytes()); // MPI: next DH
    payload.extend_from_slice(&[0, 0, 0, 2]);
    payload.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1]); // counter
    payload.extend_from_slice(&16u32.to_be_bytes()); // encrypted payload
    payload.extend_from_slice(&[0u8; 16]);
    payload.extend_from_slice(&[0u8; 20]); // authenticator
    payload.extend_from_slice(&0u32.to_be_bytes()); // revealed
    envelope(&payload)
}

fn crafted_dhkey_frame(sender: u32, receiver: u32) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&3u16.to_be_bytes());
    payload.push(0x0a); // DH-Key message
    payload.extend_from_slice(&sender.to_be_bytes());
    payload.extend_from_slice(&receiver.to_be_bytes());
    payload.extend_from_slice(&4u32.to_be_bytes()); // MPI: gy
    payload.extend_from_slice(&[0, 0, 0, 2]);
    envelope(&payload)
}
