// SPDX-License-Identifier: LGPL-3.0-only

//! Off-the-Record Messaging, protocol versions 2 and 3.
//!
//! The crate converts a bidirectional stream of plaintext application
//! strings into authenticated, confidential, deniable messages exchanged
//! over an untrusted instant-messaging transport. The entry point is
//! [`Session`]: one per conversation, fed with raw transport strings on
//! receive and application text on send. Everything the engine needs from
//! the client — transport access, policy, the long-term keypair — is
//! acquired through the [`Host`] trait.

use std::rc::Rc;

use bitflags::bitflags;

mod ake;
pub mod crypto;
mod encoding;
mod fragment;
mod instancetag;
mod keymanager;
mod messages;
mod protocol;
mod session;
mod smp;
mod utils;

pub use crate::ake::AKEError;
pub use crate::encoding::MessageFlags;
pub use crate::instancetag::{InstanceTag, INSTANCE_ZERO};
pub use crate::session::Session;

use crate::crypto::CryptoError;
use crate::crypto::DSA;

/// `SessionID` identifies a single conversation: local account, remote
/// contact and the messaging protocol (transport network) they meet on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionID {
    account: String,
    user: String,
    protocol: String,
}

impl SessionID {
    pub fn new(account: &str, user: &str, protocol: &str) -> Self {
        Self {
            account: account.to_owned(),
            user: user.to_owned(),
            protocol: protocol.to_owned(),
        }
    }

    #[must_use]
    pub fn account(&self) -> &str {
        &self.account
    }

    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }
}

/// `OTRError` is the enum containing the various errors that can occur.
#[derive(Debug)]
pub enum OTRError {
    /// Message contained invalid data according to the OTR protocol.
    ProtocolViolation(&'static str),
    /// Message payload is incomplete. The message cannot be reconstructed
    /// from the received bytes.
    IncompleteMessage,
    /// An encoded message arrived for a protocol version this crate does
    /// not implement.
    UnsupportedVersion(u16),
    /// Encrypted message is unreadable: the session keys or the MAC do not
    /// check out, or the counter regressed.
    UnreadableMessage,
    /// Violation of cryptographic requirements.
    CryptographicViolation(CryptoError),
    /// Error while processing an AKE message.
    AuthenticationError(AKEError),
    /// An operation was requested in a protocol state that does not
    /// support it.
    IncorrectState(&'static str),
    /// The current policy prohibits the requested operation.
    PolicyRestriction(&'static str),
    /// None of the protocol versions offered by the other party are
    /// allowed by policy.
    NoAcceptableVersion,
    /// SMP is already in progress; a new exchange cannot be initiated.
    SMPInProgress,
    /// SMP state does not allow the requested operation.
    SMPViolation(&'static str),
}

/// `Version` contains the protocol versions that can occur on the wire.
///
/// Version 1 is recognized in query strings and whitespace tags for
/// backwards compatibility but is never negotiated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    V2,
    V3,
    Unsupported(u16),
}

bitflags! {
    /// `Policy` defines the session policy bit-flags.
    ///
    /// The policy is owned by the host application and read on demand; the
    /// engine carries no configuration of its own.
    pub struct Policy: u32 {
        /// Allow version 1 of the OTR protocol to be used. Recognized for
        /// backwards compatibility; a v1 session is never opened.
        const ALLOW_V1 = 0b0000_0001;
        /// Allow version 2 of the OTR protocol to be used.
        const ALLOW_V2 = 0b0000_0010;
        /// Allow version 3 of the OTR protocol to be used.
        const ALLOW_V3 = 0b0000_0100;
        /// Refuse to send unencrypted messages.
        const REQUIRE_ENCRYPTION = 0b0000_1000;
        /// Advertise support for OTR using the whitespace tag.
        const SEND_WHITESPACE_TAG = 0b0001_0000;
        /// Start the OTR AKE when a whitespace tag is received.
        const WHITESPACE_START_AKE = 0b0010_0000;
        /// Start the OTR AKE when an OTR Error Message is received.
        const ERROR_START_AKE = 0b0100_0000;

        const OPPORTUNISTIC = Self::ALLOW_V2.bits | Self::ALLOW_V3.bits
            | Self::SEND_WHITESPACE_TAG.bits | Self::WHITESPACE_START_AKE.bits
            | Self::ERROR_START_AKE.bits;
        const ALWAYS = Self::ALLOW_V2.bits | Self::ALLOW_V3.bits
            | Self::REQUIRE_ENCRYPTION.bits | Self::WHITESPACE_START_AKE.bits
            | Self::ERROR_START_AKE.bits;
    }
}

impl Policy {
    /// `allows` checks whether a concrete wire version is enabled by this
    /// policy. Version 1 never qualifies.
    #[must_use]
    pub fn allows(&self, version: Version) -> bool {
        match version {
            Version::V2 => self.contains(Policy::ALLOW_V2),
            Version::V3 => self.contains(Policy::ALLOW_V3),
            Version::Unsupported(_) => false,
        }
    }

    /// `viable_versions` lists the negotiable versions in descending
    /// preference order.
    #[must_use]
    pub fn viable_versions(&self) -> Vec<Version> {
        let mut versions = Vec::with_capacity(2);
        if self.contains(Policy::ALLOW_V3) {
            versions.push(Version::V3);
        }
        if self.contains(Policy::ALLOW_V2) {
            versions.push(Version::V2);
        }
        versions
    }
}

/// `ProtocolStatus` indicates the messaging state of a conversation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolStatus {
    /// Messages travel unencrypted.
    Plaintext,
    /// A confidential session is established: messages are encrypted and
    /// authenticated.
    Encrypted,
    /// The other party ended the confidential session; nothing can be sent
    /// until the local side starts or resets the session.
    Finished,
}

/// `TLV` is a type-length-value record appended to data messages to carry
/// control signals in band.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TLV(pub u16, pub Vec<u8>);

/// `Host` is the callback interface into the messaging client.
///
/// `inject_message`, `policy` and `local_keypair` must be provided; the
/// notification callbacks default to no-ops so a minimal client stays
/// small.
pub trait Host {
    /// Inject a message into the transport stream: protocol-internal
    /// traffic that is of no interest to the user. Transport send is
    /// assumed non-blocking; a blocking transport is the host's concern.
    fn inject_message(&self, session: &SessionID, message: &[u8]);

    /// Current policy for the conversation. Read on demand, never cached.
    fn policy(&self, session: &SessionID) -> Policy;

    /// The long-term DSA keypair identifying the local account.
    fn local_keypair(&self, session: &SessionID) -> DSA::Keypair;

    /// Maximum transport frame size. Outbound OTR-encoded messages larger
    /// than this are fragmented. `usize::MAX` disables fragmentation.
    fn max_fragment_size(&self, session: &SessionID) -> usize {
        let _ = session;
        usize::MAX
    }

    /// Reply text for the OTR error message sent when an inbound data
    /// message cannot be authenticated or decrypted.
    fn reply_for_unreadable_message(&self, session: &SessionID) -> Vec<u8> {
        let _ = session;
        Vec::from("You transmitted an unreadable encrypted message.")
    }

    /// Human-readable text appended to emitted query messages for clients
    /// that do not speak OTR.
    fn fallback_message(&self, session: &SessionID) -> Vec<u8> {
        let _ = session;
        Vec::from("An Off-the-Record conversation has been requested.")
    }

    /// An OTR error message arrived; display its content to the user.
    fn show_error(&self, session: &SessionID, error: &[u8]) {
        let _ = (session, error);
    }

    /// Display an alert produced by the engine.
    fn show_alert(&self, session: &SessionID, message: &[u8]) {
        let _ = (session, message);
    }

    /// A message arrived unencrypted although the conversation state or
    /// policy expects encryption.
    fn unencrypted_message_received(&self, session: &SessionID, content: &[u8]) {
        let _ = (session, content);
    }

    /// An inbound data message could not be authenticated or decrypted.
    fn unreadable_message_received(&self, session: &SessionID) {
        let _ = session;
    }

    /// A message cannot be sent because the session is finished.
    fn finished_session_message(&self, session: &SessionID, content: &[u8]) {
        let _ = (session, content);
    }

    /// A message was withheld because policy requires encryption; an AKE
    /// has been initiated in its stead.
    fn require_encrypted_message(&self, session: &SessionID, content: &[u8]) {
        let _ = (session, content);
    }

    /// A message addressed to a different instance of this account was
    /// discarded.
    fn message_from_another_instance(&self, session: &SessionID) {
        let _ = session;
    }

    /// The remote contact turns out to be logged in from multiple
    /// locations.
    fn multiple_instances_detected(&self, session: &SessionID) {
        let _ = session;
    }

    /// The other party initiated SMP; ask the user for the shared secret
    /// so that `respond_smp` can be called. `question` may be empty.
    fn ask_for_secret(&self, session: &SessionID, question: &[u8]) {
        let _ = (session, question);
    }

    /// SMP concluded successfully; the identity behind `fingerprint` is
    /// verified.
    fn verify(&self, session: &SessionID, fingerprint: &DSA::Fingerprint) {
        let _ = (session, fingerprint);
    }

    /// SMP concluded with mismatching secrets; any verification for
    /// `fingerprint` should be revoked.
    fn unverify(&self, session: &SessionID, fingerprint: &DSA::Fingerprint) {
        let _ = (session, fingerprint);
    }
}

/// `SessionEventListener` receives session lifecycle events. Listeners
/// registered on a master session also receive the events of its slave
/// instances.
pub trait SessionEventListener {
    /// The protocol status of the conversation changed.
    fn session_status_changed(&self, session: &SessionID);

    /// A new remote instance was detected.
    fn multiple_instances_detected(&self, session: &SessionID) {
        let _ = session;
    }

    /// The selected outgoing instance changed.
    fn outgoing_session_changed(&self, session: &SessionID) {
        let _ = session;
    }
}

/// Shared, non-owning handle to a session's listener list. Slave instances
/// publish their events into the master's list through this handle.
pub(crate) type ListenerList = Rc<std::cell::RefCell<Vec<Rc<dyn SessionEventListener>>>>;
