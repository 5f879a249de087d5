// SPDX-License-Identifier: LGPL-3.0-only

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::{
    ake::AKEContext,
    ake::CryptographicMaterial,
    crypto::DSA,
    encoding::MessageFlags,
    fragment::{self, Assembler, FragmentError},
    instancetag::{self, InstanceTag, INSTANCE_ZERO},
    messages::{self, DataMessage, EncodedMessage, EncodedMessageType, MessageType},
    protocol::{self, EncryptedState, ProtocolState, TLV_TYPE_DISCONNECTED, TLV_TYPE_PADDING},
    smp::{self, SMPEvent},
    Host, ListenerList, OTRError, Policy, ProtocolStatus, SessionEventListener, SessionID,
    Version, TLV,
};

/// `Session` is one side of a single conversation: the entry point for
/// inbound transport strings and outbound application text.
///
/// A `Session` is always a master. Remote instances beyond the one the
/// master is pinned to are managed as slave instances behind the scenes
/// and addressed by their instance tag.
pub struct Session {
    session: SessionID,
    host: Rc<dyn Host>,
    listeners: ListenerList,
    assembler: Assembler,
    core: Instance,
    slaves: HashMap<InstanceTag, Instance>,
    selected: Option<InstanceTag>,
}

impl Session {
    pub fn new(host: Rc<dyn Host>, session: SessionID) -> Self {
        let listeners: ListenerList = Rc::new(RefCell::new(Vec::new()));
        let core = Instance::new_master(session.clone(), Rc::clone(&host), Rc::clone(&listeners));
        Self {
            session,
            host,
            listeners,
            assembler: Assembler::new(),
            core,
            slaves: HashMap::new(),
            selected: None,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &SessionID {
        &self.session
    }

    /// The local sender instance tag of this client.
    #[must_use]
    pub fn sender_instance_tag(&self) -> InstanceTag {
        self.core.sender_tag
    }

    pub fn add_listener(&self, listener: Rc<dyn SessionEventListener>) {
        let mut listeners = self.listeners.borrow_mut();
        if !listeners.iter().any(|l| Rc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Rc<dyn SessionEventListener>) {
        self.listeners
            .borrow_mut()
            .retain(|l| !Rc::ptr_eq(l, listener));
    }

    /// `status` reports the protocol status of the conversation: of the
    /// selected outgoing instance if one is selected, of the master
    /// otherwise.
    #[must_use]
    pub fn status(&self) -> ProtocolStatus {
        self.target_ref().state.status()
    }

    /// `status_of` reports the status of the instance with the given tag,
    /// falling back to the master's own status for unknown tags.
    #[must_use]
    pub fn status_of(&self, tag: InstanceTag) -> ProtocolStatus {
        if tag == self.core.receiver_tag {
            self.core.state.status()
        } else {
            self.slaves
                .get(&tag)
                .map_or(self.core.state.status(), |slave| slave.state.status())
        }
    }

    /// `remote_public_key` is the long-term public key of the other party,
    /// known once a confidential session has been established.
    #[must_use]
    pub fn remote_public_key(&self) -> Option<DSA::PublicKey> {
        self.target_ref().remote_public_key.clone()
    }

    #[must_use]
    pub fn remote_public_key_of(&self, tag: InstanceTag) -> Option<DSA::PublicKey> {
        if tag == self.core.receiver_tag {
            self.core.remote_public_key.clone()
        } else {
            self.slaves
                .get(&tag)
                .map_or_else(|| self.core.remote_public_key.clone(), |slave| {
                    slave.remote_public_key.clone()
                })
        }
    }

    /// `instances` lists the known instances of the conversation: the
    /// master first, then every slave.
    #[must_use]
    pub fn instances(&self) -> Vec<InstanceTag> {
        let mut tags = Vec::with_capacity(1 + self.slaves.len());
        tags.push(self.core.receiver_tag);
        tags.extend(self.slaves.keys());
        tags
    }

    /// `set_outgoing_instance` selects the remote instance that outgoing
    /// traffic is directed at. Selecting the master's own receiver tag
    /// deselects any slave.
    pub fn set_outgoing_instance(&mut self, tag: InstanceTag) -> bool {
        if tag == self.core.receiver_tag {
            self.selected = None;
            fire(&self.listeners, |l| {
                l.outgoing_session_changed(&self.session);
            });
            true
        } else if self.slaves.contains_key(&tag) {
            self.selected = Some(tag);
            fire(&self.listeners, |l| {
                l.outgoing_session_changed(&self.session);
            });
            true
        } else {
            self.selected = None;
            false
        }
    }

    /// `outgoing_instance` is the tag of the instance outgoing traffic is
    /// directed at.
    #[must_use]
    pub fn outgoing_instance(&self) -> InstanceTag {
        self.selected.unwrap_or(self.core.receiver_tag)
    }

    /// `transform_receiving` processes one raw inbound transport string.
    /// Returns the plaintext to surface to the user, or `None` when the
    /// input was protocol-internal, incomplete or discarded.
    pub fn transform_receiving(&mut self, content: &[u8]) -> Result<Option<Vec<u8>>, OTRError> {
        let policy = self.host.policy(&self.session);
        if !policy.contains(Policy::ALLOW_V2) && !policy.contains(Policy::ALLOW_V3) {
            // ALLOW_V1 alone does not open sessions, so OTR is effectively
            // off; hand the message through untouched.
            return Ok(Some(Vec::from(content)));
        }
        let content = if fragment::match_fragment(content) {
            let result = match fragment::parse(content) {
                Ok(frag) => {
                    if frag.receiver != INSTANCE_ZERO && frag.receiver != self.core.sender_tag {
                        Err(FragmentError::UnknownInstance)
                    } else {
                        self.assembler.accumulate(frag)
                    }
                }
                Err(error) => Err(error),
            };
            match result {
                Ok(assembled) => assembled,
                Err(FragmentError::IncompleteResult) => return Ok(None),
                Err(FragmentError::UnknownInstance) => {
                    log::debug!("Fragment for another instance of this account; discarding.");
                    self.host.message_from_another_instance(&self.session);
                    return Ok(None);
                }
                Err(FragmentError::InvalidFragment) => {
                    log::warn!("An invalid message fragment was discarded.");
                    return Ok(None);
                }
            }
        } else {
            Vec::from(content)
        };
        let parsed = match messages::parse(&content) {
            Ok(parsed) => parsed,
            Err(error) => {
                log::warn!("Invalid message discarded: {error:?}");
                return Ok(None);
            }
        };
        // A whitespace offer is accepted by any OTR activity from the
        // peer; plain messages reject an outstanding offer.
        match &parsed {
            MessageType::Plaintext(_) | MessageType::Tagged(_, _) => {
                if self.core.offer == OfferStatus::Sent {
                    self.core.offer = OfferStatus::Rejected;
                }
            }
            MessageType::Error(_) | MessageType::Query(_) | MessageType::Encoded(_) => {
                self.core.offer = OfferStatus::Accepted;
            }
        }
        match parsed {
            MessageType::Encoded(msg) => self.dispatch_encoded(policy, msg),
            MessageType::Error(error) => {
                self.core.handle_error(policy, &error);
                Ok(None)
            }
            MessageType::Query(versions) => {
                log::debug!("Received a query message.");
                if let Some(version) = select_version(policy, &versions) {
                    self.respond_with_commit(version);
                } else {
                    log::debug!("No mutually acceptable protocol version offered; ignoring.");
                }
                Ok(None)
            }
            MessageType::Tagged(versions, cleaned) => {
                log::debug!("Received a plaintext message carrying a whitespace tag.");
                self.warn_if_unencrypted(policy, &cleaned);
                if policy.contains(Policy::WHITESPACE_START_AKE) {
                    if let Some(version) = select_version(policy, &versions) {
                        self.respond_with_commit(version);
                    }
                }
                Ok(Some(cleaned))
            }
            MessageType::Plaintext(message) => {
                self.warn_if_unencrypted(policy, &message);
                Ok(Some(message))
            }
        }
    }

    /// `transform_sending` converts application text (and optional TLVs)
    /// into zero or more transport frames for the application to send.
    pub fn transform_sending(
        &mut self,
        content: &[u8],
        tlvs: &[TLV],
    ) -> Result<Vec<Vec<u8>>, OTRError> {
        let policy = self.host.policy(&self.session);
        self.target_mut().transform_sending(policy, content, tlvs)
    }

    /// `start_session` initiates an OTR session by sending a query
    /// message. A no-op when the session is already encrypted.
    pub fn start_session(&mut self) -> Result<(), OTRError> {
        let policy = self.host.policy(&self.session);
        self.target_mut().start(policy)
    }

    /// `end_session` locally ends the session, notifying the other party
    /// with a DISCONNECTED TLV when a confidential session is active.
    pub fn end_session(&mut self) -> Result<(), OTRError> {
        self.target_mut().end()
    }

    /// `refresh_session` ends the session and immediately starts a new
    /// AKE.
    pub fn refresh_session(&mut self) -> Result<(), OTRError> {
        self.end_session()?;
        self.start_session()
    }

    pub fn init_smp(&mut self, question: &[u8], secret: &[u8]) -> Result<(), OTRError> {
        self.target_mut().init_smp(question, secret)
    }

    pub fn respond_smp(&mut self, question: &[u8], secret: &[u8]) -> Result<(), OTRError> {
        self.target_mut().respond_smp(question, secret)
    }

    /// `respond_smp_for` responds on the instance addressed by `tag`,
    /// falling back to the regular target when the tag is unknown.
    pub fn respond_smp_for(
        &mut self,
        tag: InstanceTag,
        question: &[u8],
        secret: &[u8],
    ) -> Result<(), OTRError> {
        if tag != self.core.receiver_tag {
            if let Some(slave) = self.slaves.get_mut(&tag) {
                return slave.respond_smp(question, secret);
            }
        }
        self.target_mut().respond_smp(question, secret)
    }

    pub fn abort_smp(&mut self) -> Result<(), OTRError> {
        self.target_mut().abort_smp()
    }

    #[must_use]
    pub fn is_smp_in_progress(&self) -> bool {
        self.target_ref().smp_in_progress()
    }

    /// The instance that delegating operations act on: the selected slave
    /// for a version 3 master with a selection, the master itself
    /// otherwise.
    fn target_mut(&mut self) -> &mut Instance {
        match self.selected {
            Some(tag)
                if self.core.version == Some(Version::V3) && self.slaves.contains_key(&tag) =>
            {
                self.slaves
                    .get_mut(&tag)
                    .expect("BUG: presence checked above")
            }
            _ => &mut self.core,
        }
    }

    fn target_ref(&self) -> &Instance {
        match self.selected {
            Some(tag)
                if self.core.version == Some(Version::V3) && self.slaves.contains_key(&tag) =>
            {
                self.slaves.get(&tag).expect("BUG: presence checked above")
            }
            _ => &self.core,
        }
    }

    fn warn_if_unencrypted(&self, policy: Policy, content: &[u8]) {
        match self.status() {
            ProtocolStatus::Encrypted | ProtocolStatus::Finished => {
                self.host.unencrypted_message_received(&self.session, content);
            }
            ProtocolStatus::Plaintext => {
                if policy.contains(Policy::REQUIRE_ENCRYPTION) {
                    self.host.unencrypted_message_received(&self.session, content);
                }
            }
        }
    }

    /// Route an inbound encoded message: discard traffic for other
    /// clients, pin the first instance that addresses us, and hand
    /// traffic from further instances to their own slave.
    fn dispatch_encoded(
        &mut self,
        policy: Policy,
        msg: EncodedMessage,
    ) -> Result<Option<Vec<u8>>, OTRError> {
        if !policy.allows(msg.version) {
            log::debug!("Encoded message for a version disallowed by policy; ignoring.");
            return Ok(None);
        }
        if msg.version == Version::V3 {
            if msg.sender == INSTANCE_ZERO {
                log::warn!("Encoded message without sender instance tag; ignoring.");
                return Ok(None);
            }
            let is_dhcommit = matches!(msg.message, EncodedMessageType::DHCommit(_));
            if msg.receiver != self.core.sender_tag
                && !(is_dhcommit && msg.receiver == INSTANCE_ZERO)
            {
                log::debug!(
                    "Received an encoded message with a receiver instance tag that is different from ours; ignoring."
                );
                self.host.message_from_another_instance(&self.session);
                return Ok(None);
            }
            if self.core.receiver_tag == INSTANCE_ZERO {
                self.core.set_receiver_tag(msg.sender);
                if matches!(msg.message, EncodedMessageType::Data(_)) {
                    // A data message from a peer we have no established
                    // state with: isolate the instance in its own slave.
                    return self.dispatch_to_slave(msg);
                }
            } else if msg.sender != self.core.receiver_tag {
                return self.dispatch_to_slave(msg);
            }
        }
        self.core.handle_encoded(msg)
    }

    fn dispatch_to_slave(&mut self, msg: EncodedMessage) -> Result<Option<Vec<u8>>, OTRError> {
        let tag = msg.sender;
        if !self.slaves.contains_key(&tag) {
            log::debug!(
                "Received an encoded message from a new instance. The contact may be logged in from multiple locations."
            );
            let mut slave = Instance::new_slave(
                self.session.clone(),
                Rc::clone(&self.host),
                Rc::clone(&self.listeners),
                self.core.sender_tag,
                tag,
            );
            if matches!(msg.message, EncodedMessageType::DHKey(_)) {
                // The D-H Key replies to a commit the master sent with
                // receiver tag ZERO; the slave adopts the exchange.
                match self.core.ake.transfer() {
                    Ok(context) => slave.ake = context,
                    Err(error) => {
                        log::debug!("Master AKE state is not transferable: {error:?}");
                    }
                }
            }
            self.slaves.insert(tag, slave);
            self.host.multiple_instances_detected(&self.session);
            fire(&self.listeners, |l| {
                l.multiple_instances_detected(&self.session);
            });
        }
        self.slaves
            .get_mut(&tag)
            .expect("BUG: slave ensured above")
            .handle_encoded(msg)
    }

    /// Answer a query or whitespace offer with a D-H Commit at the
    /// negotiated version. For version 3, every existing slave's AKE
    /// context is replaced so that any in-flight instance can adopt the
    /// exchange.
    fn respond_with_commit(&mut self, version: Version) {
        log::debug!("Responding with D-H Commit message at version {version:?}.");
        let commit = self.core.ake.initiate(version);
        self.core.version = Some(version);
        if version == Version::V3 {
            for slave in self.slaves.values_mut() {
                slave.ake.reset();
                match self.core.ake.transfer() {
                    Ok(context) => slave.ake = context,
                    Err(error) => log::debug!("Master AKE state not transferable: {error:?}"),
                }
            }
        }
        self.core.inject_encoded(commit);
    }
}

fn select_version(policy: Policy, offered: &[Version]) -> Option<Version> {
    if offered.contains(&Version::V3) && policy.contains(Policy::ALLOW_V3) {
        Some(Version::V3)
    } else if offered.contains(&Version::V2) && policy.contains(Policy::ALLOW_V2) {
        Some(Version::V2)
    } else {
        None
    }
}

fn fire(listeners: &ListenerList, notify: impl Fn(&dyn SessionEventListener)) {
    // iterate over a snapshot so listeners never run under the borrow
    let snapshot: Vec<Rc<dyn SessionEventListener>> = listeners.borrow().clone();
    for listener in snapshot {
        notify(&*listener);
    }
}

/// `OfferStatus` tracks the lifetime of a whitespace-tag offer attached
/// to outgoing plaintext.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OfferStatus {
    Idle,
    Sent,
    Accepted,
    Rejected,
}

/// `Instance` is the per-remote-instance session core: protocol state,
/// AKE context and bookkeeping for exactly one communication partner.
struct Instance {
    session: SessionID,
    host: Rc<dyn Host>,
    listeners: ListenerList,
    master: bool,
    sender_tag: InstanceTag,
    receiver_tag: InstanceTag,
    version: Option<Version>,
    offer: OfferStatus,
    state: ProtocolState,
    ake: AKEContext,
    remote_public_key: Option<DSA::PublicKey>,
}

impl Instance {
    fn new_master(session: SessionID, host: Rc<dyn Host>, listeners: ListenerList) -> Self {
        let ake = AKEContext::new(Rc::clone(&host), session.clone());
        Self {
            session,
            host,
            listeners,
            master: true,
            sender_tag: instancetag::random_tag(),
            receiver_tag: INSTANCE_ZERO,
            version: None,
            offer: OfferStatus::Idle,
            state: ProtocolState::Plaintext,
            ake,
            remote_public_key: None,
        }
    }

    fn new_slave(
        session: SessionID,
        host: Rc<dyn Host>,
        listeners: ListenerList,
        sender_tag: InstanceTag,
        receiver_tag: InstanceTag,
    ) -> Self {
        let ake = AKEContext::new(Rc::clone(&host), session.clone());
        Self {
            session,
            host,
            listeners,
            master: false,
            sender_tag,
            receiver_tag,
            version: Some(Version::V3),
            offer: OfferStatus::Idle,
            state: ProtocolState::Plaintext,
            ake,
            remote_public_key: None,
        }
    }

    fn set_receiver_tag(&mut self, tag: InstanceTag) {
        if !self.master {
            // a slave's receiver tag never changes
            return;
        }
        log::debug!("Pinning receiver instance tag {tag:08x}.");
        self.receiver_tag = tag;
    }

    /// Replace the protocol state, firing the status-changed event iff
    /// the status value actually changes.
    fn transition(&mut self, state: ProtocolState) {
        let previous = self.state.status();
        self.state = state;
        let current = self.state.status();
        if current != previous {
            log::info!("Session status changed: {previous:?} -> {current:?}");
            fire(&self.listeners, |l| l.session_status_changed(&self.session));
        }
    }

    /// Enter the encrypted state with the cryptographic material the AKE
    /// produced.
    fn secure(&mut self, material: CryptographicMaterial) {
        let our_fingerprint = self
            .host
            .local_keypair(&self.session)
            .public_key()
            .fingerprint();
        self.remote_public_key = Some(material.their_dsa.clone());
        self.version = Some(material.version);
        let state =
            EncryptedState::new(material, self.sender_tag, self.receiver_tag, our_fingerprint);
        self.ake.reset();
        self.transition(ProtocolState::Encrypted(Box::new(state)));
        log::info!("Gone secure.");
    }

    fn handle_encoded(&mut self, msg: EncodedMessage) -> Result<Option<Vec<u8>>, OTRError> {
        match msg.message {
            EncodedMessageType::Data(data) => {
                self.handle_data_message(msg.sender, msg.receiver, &data)
            }
            EncodedMessageType::DHCommit(message) => {
                self.version = Some(msg.version);
                self.ake.set_version(msg.version);
                match self.ake.handle_dhcommit(message) {
                    Ok(response) => self.inject_encoded(response),
                    Err(error) => log::debug!("D-H Commit message not processed: {error:?}"),
                }
                Ok(None)
            }
            EncodedMessageType::DHKey(message) => {
                match self.ake.handle_dhkey(message) {
                    Ok(response) => self.inject_encoded(response),
                    Err(error) => log::debug!("D-H Key message not processed: {error:?}"),
                }
                Ok(None)
            }
            EncodedMessageType::RevealSignature(message) => {
                match self.ake.handle_reveal_signature(message) {
                    Ok((material, response)) => {
                        self.inject_encoded(response);
                        self.secure(material);
                    }
                    Err(error) => {
                        log::debug!("Reveal Signature message not processed: {error:?}");
                    }
                }
                Ok(None)
            }
            EncodedMessageType::Signature(message) => {
                match self.ake.handle_signature(message) {
                    Ok(material) => self.secure(material),
                    Err(error) => log::debug!("Signature message not processed: {error:?}"),
                }
                Ok(None)
            }
        }
    }

    fn handle_data_message(
        &mut self,
        sender: InstanceTag,
        receiver: InstanceTag,
        message: &DataMessage,
    ) -> Result<Option<Vec<u8>>, OTRError> {
        log::debug!("Received a data message.");
        let decrypted = match &mut self.state {
            ProtocolState::Encrypted(state) => state.decrypt_message(sender, receiver, message),
            // Data messages are unreadable outside of an encrypted
            // session: the keys are long gone or never existed.
            ProtocolState::Plaintext | ProtocolState::Finished => Err(OTRError::UnreadableMessage),
        };
        let payload = match decrypted {
            Ok(payload) => payload,
            Err(OTRError::UnreadableMessage) => {
                if message.flags.contains(MessageFlags::IGNORE_UNREADABLE) {
                    log::debug!("Dropped an unreadable message that is flagged ignorable.");
                } else {
                    log::debug!("Message cannot be read; replying with an OTR error message.");
                    self.host.unreadable_message_received(&self.session);
                    let reply = self.host.reply_for_unreadable_message(&self.session);
                    self.host.inject_message(
                        &self.session,
                        &messages::serialize_message(&MessageType::Error(reply)),
                    );
                }
                return Ok(None);
            }
            Err(error) => return Err(error),
        };
        let (content, tlvs) = match protocol::split_plaintext_payload(&payload) {
            Ok(split) => split,
            Err(error) => {
                log::warn!("Discarding data message with malformed payload: {error:?}");
                return Ok(None);
            }
        };
        if tlvs.iter().any(|tlv| tlv.0 == TLV_TYPE_DISCONNECTED) {
            log::info!("Other party ended the confidential session.");
            self.transition(ProtocolState::Finished);
            return Ok(None);
        }
        let mut claimed = false;
        for tlv in &tlvs {
            if tlv.0 == TLV_TYPE_PADDING {
                continue;
            }
            if smp::is_smp_tlv(tlv) {
                claimed = true;
                self.handle_smp_tlv(tlv);
            }
        }
        if claimed {
            // SMP TLVs travel with empty message bodies; nothing to
            // surface to the user.
            return Ok(None);
        }
        Ok(Some(content))
    }

    fn handle_smp_tlv(&mut self, tlv: &TLV) {
        let (reply, event) = match &mut self.state {
            ProtocolState::Encrypted(state) => state.smp.handle(tlv),
            ProtocolState::Plaintext | ProtocolState::Finished => return,
        };
        match event {
            SMPEvent::None => {}
            SMPEvent::SecretRequested(question) => {
                self.host.ask_for_secret(&self.session, &question);
            }
            SMPEvent::Succeeded => {
                if let Some(fingerprint) = self.their_fingerprint() {
                    self.host.verify(&self.session, &fingerprint);
                }
            }
            SMPEvent::Failed => {
                if let Some(fingerprint) = self.their_fingerprint() {
                    self.host.unverify(&self.session, &fingerprint);
                }
            }
            SMPEvent::Aborted => log::debug!("SMP exchange aborted."),
        }
        if let Some(reply) = reply {
            self.send_smp_tlv(&reply);
        }
    }

    fn their_fingerprint(&self) -> Option<DSA::Fingerprint> {
        self.remote_public_key
            .as_ref()
            .map(DSA::PublicKey::fingerprint)
    }

    fn handle_error(&mut self, policy: Policy, error: &[u8]) {
        log::debug!("Received an OTR error message.");
        self.host.show_error(&self.session, error);
        if policy.contains(Policy::ERROR_START_AKE) {
            log::debug!("Policy dictates that an error message starts the AKE.");
            self.send_query(policy);
        }
    }

    fn transform_sending(
        &mut self,
        policy: Policy,
        content: &[u8],
        tlvs: &[TLV],
    ) -> Result<Vec<Vec<u8>>, OTRError> {
        match self.state.status() {
            ProtocolStatus::Plaintext => {
                if policy.contains(Policy::REQUIRE_ENCRYPTION) {
                    // Policy forbids sending this unencrypted: withhold
                    // the message and negotiate a session instead.
                    self.start(policy)?;
                    self.host.require_encrypted_message(&self.session, content);
                    Ok(Vec::new())
                } else if policy.contains(Policy::SEND_WHITESPACE_TAG)
                    && self.offer != OfferStatus::Rejected
                {
                    self.offer = OfferStatus::Sent;
                    let versions = policy.viable_versions();
                    Ok(vec![messages::serialize_message(&MessageType::Tagged(
                        versions,
                        Vec::from(content),
                    ))])
                } else {
                    Ok(vec![messages::serialize_message(&MessageType::Plaintext(
                        Vec::from(content),
                    ))])
                }
            }
            ProtocolStatus::Encrypted => {
                self.encrypted_frames(MessageFlags::empty(), content, tlvs)
            }
            ProtocolStatus::Finished => {
                // "Inform the user that the message cannot be sent at
                //  this time."
                self.host.finished_session_message(&self.session, content);
                Ok(Vec::new())
            }
        }
    }

    /// Encrypt content and TLVs into a data message, serialized and
    /// fragmented into transport frames.
    fn encrypted_frames(
        &mut self,
        flags: MessageFlags,
        content: &[u8],
        tlvs: &[TLV],
    ) -> Result<Vec<Vec<u8>>, OTRError> {
        let payload = protocol::assemble_plaintext_payload(content, tlvs);
        let (version, message) = match &mut self.state {
            ProtocolState::Encrypted(state) => {
                (state.version(), state.encrypt_message(flags, &payload))
            }
            ProtocolState::Plaintext | ProtocolState::Finished => {
                return Err(OTRError::IncorrectState(
                    "Encrypting messages requires an established session.",
                ))
            }
        };
        let serialized = messages::encode_message(
            version,
            self.sender_tag,
            self.receiver_tag,
            EncodedMessageType::Data(message),
        );
        let max_size = self.host.max_fragment_size(&self.session);
        fragment::fragment(version, self.sender_tag, self.receiver_tag, max_size, &serialized)
    }

    fn start(&mut self, policy: Policy) -> Result<(), OTRError> {
        if self.state.status() == ProtocolStatus::Encrypted {
            return Ok(());
        }
        if !policy.contains(Policy::ALLOW_V2) && !policy.contains(Policy::ALLOW_V3) {
            return Err(OTRError::PolicyRestriction(
                "Policy does not allow any supported protocol version.",
            ));
        }
        log::info!("Starting OTR session: sending query message.");
        self.send_query(policy);
        Ok(())
    }

    fn end(&mut self) -> Result<(), OTRError> {
        match self.state.status() {
            ProtocolStatus::Encrypted => {
                let frames = self.encrypted_frames(
                    MessageFlags::empty(),
                    b"",
                    &[TLV(TLV_TYPE_DISCONNECTED, Vec::new())],
                )?;
                for frame in frames {
                    self.host.inject_message(&self.session, &frame);
                }
                self.remote_public_key = None;
                self.transition(ProtocolState::Plaintext);
            }
            ProtocolStatus::Finished => {
                self.remote_public_key = None;
                self.transition(ProtocolState::Plaintext);
            }
            ProtocolStatus::Plaintext => {}
        }
        Ok(())
    }

    fn init_smp(&mut self, question: &[u8], secret: &[u8]) -> Result<(), OTRError> {
        let tlv = match &mut self.state {
            ProtocolState::Encrypted(state) => state.smp.initiate(question, secret)?,
            ProtocolState::Plaintext | ProtocolState::Finished => {
                return Err(OTRError::IncorrectState(
                    "SMP requires an established session.",
                ))
            }
        };
        self.send_smp_tlv(&tlv);
        Ok(())
    }

    fn respond_smp(&mut self, question: &[u8], secret: &[u8]) -> Result<(), OTRError> {
        let tlv = match &mut self.state {
            ProtocolState::Encrypted(state) => state.smp.respond(question, secret)?,
            ProtocolState::Plaintext | ProtocolState::Finished => {
                return Err(OTRError::IncorrectState(
                    "SMP requires an established session.",
                ))
            }
        };
        self.send_smp_tlv(&tlv);
        Ok(())
    }

    fn abort_smp(&mut self) -> Result<(), OTRError> {
        let tlv = match &mut self.state {
            ProtocolState::Encrypted(state) => state.smp.abort(),
            ProtocolState::Plaintext | ProtocolState::Finished => {
                return Err(OTRError::IncorrectState(
                    "SMP requires an established session.",
                ))
            }
        };
        self.send_smp_tlv(&tlv);
        Ok(())
    }

    fn smp_in_progress(&self) -> bool {
        match &self.state {
            ProtocolState::Encrypted(state) => state.smp.in_progress(),
            ProtocolState::Plaintext | ProtocolState::Finished => false,
        }
    }

    fn send_smp_tlv(&mut self, tlv: &TLV) {
        // SMP carriers are control messages without user content, hence
        // flagged ignorable.
        match self.encrypted_frames(
            MessageFlags::IGNORE_UNREADABLE,
            b"",
            std::slice::from_ref(tlv),
        ) {
            Ok(frames) => {
                for frame in frames {
                    self.host.inject_message(&self.session, &frame);
                }
            }
            Err(error) => log::warn!("Failed to send SMP message: {error:?}"),
        }
    }

    fn send_query(&self, policy: Policy) {
        let versions = policy.viable_versions();
        if versions.is_empty() {
            return;
        }
        let mut message = messages::serialize_message(&MessageType::Query(versions));
        message.push(b' ');
        message.extend(self.host.fallback_message(&self.session));
        self.host.inject_message(&self.session, &message);
    }

    fn inject_encoded(&self, message: EncodedMessageType) {
        let version = self.ake.version();
        // A D-H Commit message answers a query, which is plain text and
        // carries no instance tag: it is broadcast with receiver ZERO so
        // that any instance of the contact may pick up the exchange.
        let receiver = if matches!(message, EncodedMessageType::DHCommit(_)) {
            INSTANCE_ZERO
        } else {
            self.receiver_tag
        };
        let serialized = messages::encode_message(version, self.sender_tag, receiver, message);
        let max_size = self.host.max_fragment_size(&self.session);
        match fragment::fragment(version, self.sender_tag, receiver, max_size, &serialized) {
            Ok(frames) => {
                for frame in frames {
                    self.host.inject_message(&self.session, &frame);
                }
            }
            Err(error) => {
                log::warn!("Failed to fragment message to the host-provided maximum size: {error:?}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{Policy, Version};

    use super::select_version;

    #[test]
    fn test_select_version_prefers_v3() {
        let policy = Policy::ALLOW_V2 | Policy::ALLOW_V3;
        assert_eq!(
            Some(Version::V3),
            select_version(policy, &[Version::V2, Version::V3])
        );
        assert_eq!(Some(Version::V2), select_version(policy, &[Version::V2]));
        assert_eq!(None, select_version(policy, &[]));
    }

    #[test]
    fn test_select_version_respects_policy() {
        assert_eq!(
            Some(Version::V2),
            select_version(Policy::ALLOW_V2, &[Version::V2, Version::V3])
        );
        assert_eq!(
            None,
            select_version(Policy::ALLOW_V1, &[Version::V2, Version::V3])
        );
    }
}
