// SPDX-License-Identifier: LGPL-3.0-only

use num_bigint::BigUint;
use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::{
    ake,
    encoding::{MessageFlags, OTRDecoder, OTREncodable, OTREncoder, CTR, MAC},
    instancetag::{InstanceTag, INSTANCE_ZERO},
    keymanager::KeyID,
    utils, OTRError, Version,
};

const OTR_ERROR_PREFIX: &[u8] = b"?OTR Error:";
const OTR_QUERY_PREFIX: &[u8] = b"?OTRv";
const OTR_ENCODED_PREFIX: &[u8] = b"?OTR:";
const OTR_ENCODED_SUFFIX: &[u8] = b".";

const OTR_DH_COMMIT_TYPE_CODE: u8 = 0x02;
const OTR_DH_KEY_TYPE_CODE: u8 = 0x0a;
const OTR_REVEAL_SIGNATURE_TYPE_CODE: u8 = 0x11;
const OTR_SIGNATURE_TYPE_CODE: u8 = 0x12;
const OTR_DATA_TYPE_CODE: u8 = 0x03;

static QUERY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\?OTR\??(:?v(\d*))?\?").expect("BUG: failed to compile hard-coded regex-pattern.")
});
const QUERY_GROUP_VERSIONS: usize = 1;
static WHITESPACE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r" \t  \t\t\t\t \t \t \t  ((?:[ \t]{8})*)")
        .expect("BUG: failed to compile hard-coded regex-pattern.")
});
const WHITESPACE_GROUP_TAGS: usize = 1;
const WHITESPACE_PREFIX: &[u8] = b" \t  \t\t\t\t \t \t \t  ";
const WHITESPACE_TAG_OTRV1: &[u8] = b" \t \t  \t ";
const WHITESPACE_TAG_OTRV2: &[u8] = b"  \t\t  \t ";
const WHITESPACE_TAG_OTRV3: &[u8] = b"  \t\t  \t\t";

pub fn parse(data: &[u8]) -> Result<MessageType, OTRError> {
    if data.starts_with(OTR_ENCODED_PREFIX) && data.ends_with(OTR_ENCODED_SUFFIX) {
        let start = OTR_ENCODED_PREFIX.len();
        let end = data.len() - OTR_ENCODED_SUFFIX.len();
        parse_encoded_message(&data[start..end])
    } else {
        Ok(parse_plain_message(data))
    }
}

fn parse_encoded_message(data: &[u8]) -> Result<MessageType, OTRError> {
    let data = base64::decode(data).or(Err(OTRError::ProtocolViolation(
        "Invalid message content: content cannot be decoded from base64.",
    )))?;
    let mut decoder = OTRDecoder::new(&data);
    let version: Version = match decoder.read_u16()? {
        0u16 => {
            return Err(OTRError::ProtocolViolation(
                "A protocol version must be provided.",
            ))
        }
        2u16 => Version::V2,
        3u16 => Version::V3,
        version => return Err(OTRError::UnsupportedVersion(version)),
    };
    let message_type = decoder.read_u8()?;
    // Version 2 encoded messages carry no instance tags in their header.
    let (sender, receiver) = if version == Version::V3 {
        (decoder.read_instance_tag()?, decoder.read_instance_tag()?)
    } else {
        (INSTANCE_ZERO, INSTANCE_ZERO)
    };
    let encoded = parse_encoded_content(message_type, &mut decoder)?;
    decoder.done()?;
    Ok(MessageType::Encoded(EncodedMessage {
        version,
        sender,
        receiver,
        message: encoded,
    }))
}

fn parse_encoded_content(
    message_type: u8,
    decoder: &mut OTRDecoder,
) -> Result<EncodedMessageType, OTRError> {
    match message_type {
        OTR_DH_COMMIT_TYPE_CODE => Ok(EncodedMessageType::DHCommit(
            ake::DHCommitMessage::decode(decoder)?,
        )),
        OTR_DH_KEY_TYPE_CODE => Ok(EncodedMessageType::DHKey(ake::DHKeyMessage::decode(
            decoder,
        )?)),
        OTR_REVEAL_SIGNATURE_TYPE_CODE => Ok(EncodedMessageType::RevealSignature(
            ake::RevealSignatureMessage::decode(decoder)?,
        )),
        OTR_SIGNATURE_TYPE_CODE => Ok(EncodedMessageType::Signature(
            ake::SignatureMessage::decode(decoder)?,
        )),
        OTR_DATA_TYPE_CODE => Ok(EncodedMessageType::Data(DataMessage::decode(decoder)?)),
        _ => Err(OTRError::ProtocolViolation(
            "Invalid or unknown message type.",
        )),
    }
}

fn parse_plain_message(data: &[u8]) -> MessageType {
    if data.starts_with(OTR_ERROR_PREFIX) {
        // `?OTR Error:` prefix must start at the beginning of the message
        // to avoid people messing with OTR in normal plaintext messages.
        return MessageType::Error(Vec::from(&data[OTR_ERROR_PREFIX.len()..]));
    }
    if let Some(caps) = QUERY_PATTERN.captures(data) {
        let versions = match caps.get(QUERY_GROUP_VERSIONS) {
            None => Vec::new(),
            Some(versions) => versions
                .as_bytes()
                .iter()
                .map(|v| {
                    match v {
                        // '1' is not actually allowed according to the OTR
                        // spec: version 1 has its own query syntax, which
                        // this pattern does not produce.
                        b'1' => Version::Unsupported(1u16),
                        b'2' => Version::V2,
                        b'3' => Version::V3,
                        // Any other character in the versions string maps
                        // to a placeholder value that clearly stands out.
                        _ => Version::Unsupported(u16::MAX),
                    }
                })
                .filter(|v| match v {
                    Version::V2 | Version::V3 => true,
                    Version::Unsupported(_) => false,
                })
                .collect(),
        };
        return MessageType::Query(versions);
    }
    if let Some(caps) = WHITESPACE_PATTERN.captures(data) {
        let cleaned = WHITESPACE_PATTERN.replace_all(data, b"".as_ref()).to_vec();
        let cap = caps
            .get(WHITESPACE_GROUP_TAGS)
            .expect("BUG: hard-coded regex should include capture group");
        return MessageType::Tagged(parse_whitespace_tags(cap.as_bytes()), cleaned);
    }
    MessageType::Plaintext(data.to_vec())
}

fn parse_whitespace_tags(data: &[u8]) -> Vec<Version> {
    let mut result = Vec::new();
    for i in (0..data.len()).step_by(8) {
        match &data[i..i + 8] {
            WHITESPACE_TAG_OTRV1 => result.push(Version::Unsupported(1)),
            WHITESPACE_TAG_OTRV2 => result.push(Version::V2),
            WHITESPACE_TAG_OTRV3 => result.push(Version::V3),
            _ => { /* ignore unknown tags */ }
        }
    }
    result
}

pub enum MessageType {
    Error(Vec<u8>),
    Plaintext(Vec<u8>),
    Tagged(Vec<Version>, Vec<u8>),
    Query(Vec<Version>),
    Encoded(EncodedMessage),
}

pub struct EncodedMessage {
    pub version: Version,
    pub sender: InstanceTag,
    pub receiver: InstanceTag,
    pub message: EncodedMessageType,
}

impl OTREncodable for EncodedMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_u16(encode_version(self.version))
            .write_u8(match self.message {
                EncodedMessageType::DHCommit(_) => OTR_DH_COMMIT_TYPE_CODE,
                EncodedMessageType::DHKey(_) => OTR_DH_KEY_TYPE_CODE,
                EncodedMessageType::RevealSignature(_) => OTR_REVEAL_SIGNATURE_TYPE_CODE,
                EncodedMessageType::Signature(_) => OTR_SIGNATURE_TYPE_CODE,
                EncodedMessageType::Data(_) => OTR_DATA_TYPE_CODE,
            });
        if self.version == Version::V3 {
            encoder.write_u32(self.sender).write_u32(self.receiver);
        }
        encoder.write_encodable(match &self.message {
            EncodedMessageType::DHCommit(msg) => msg,
            EncodedMessageType::DHKey(msg) => msg,
            EncodedMessageType::RevealSignature(msg) => msg,
            EncodedMessageType::Signature(msg) => msg,
            EncodedMessageType::Data(msg) => msg,
        });
    }
}

/// `EncodedMessageType` represents the OTR-encoded message structures in
/// use by OTR v2/v3.
#[allow(clippy::large_enum_variant)]
pub enum EncodedMessageType {
    /// DH-Commit-message in the AKE-process.
    DHCommit(ake::DHCommitMessage),
    /// DH-Key-message in the AKE-process.
    DHKey(ake::DHKeyMessage),
    /// RevealSignature-message in the AKE-process.
    RevealSignature(ake::RevealSignatureMessage),
    /// Signature-message in the AKE-process.
    Signature(ake::SignatureMessage),
    /// (Encrypted) data-message.
    Data(DataMessage),
}

pub struct DataMessage {
    pub flags: MessageFlags,
    pub sender_keyid: KeyID,
    pub receiver_keyid: KeyID,
    /// The next DH public key of the sender.
    pub dh_y: BigUint,
    // OTR-spec:
    //   "The initial counter is a 16-byte value whose first 8 bytes
    //    are the above "top half of counter init" value, and whose last 8
    //    bytes are all 0x00."
    pub ctr: CTR,
    pub encrypted: Vec<u8>,
    pub authenticator: MAC,
    /// `revealed` contains recent keys, previously used for
    /// authentication, that should now become public.
    pub revealed: Vec<u8>,
}

impl DataMessage {
    fn decode(decoder: &mut OTRDecoder) -> Result<Self, OTRError> {
        let flags = MessageFlags::from_bits(decoder.read_u8()?)
            .ok_or(OTRError::ProtocolViolation("Invalid message flags"))?;
        let sender_keyid = utils::u32::nonzero(decoder.read_u32()?)
            .ok_or(OTRError::ProtocolViolation("Invalid KeyID: cannot be 0"))?;
        let receiver_keyid = utils::u32::nonzero(decoder.read_u32()?)
            .ok_or(OTRError::ProtocolViolation("Invalid KeyID: cannot be 0"))?;
        let dh_y = decoder.read_mpi()?;
        let ctr = decoder.read_ctr()?;
        let encrypted = decoder.read_data()?;
        let authenticator = decoder.read_mac()?;
        let revealed = decoder.read_data()?;
        Ok(Self {
            flags,
            sender_keyid,
            receiver_keyid,
            dh_y,
            ctr,
            encrypted,
            authenticator,
            revealed,
        })
    }
}

impl OTREncodable for DataMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_u8(self.flags.bits())
            .write_u32(self.sender_keyid)
            .write_u32(self.receiver_keyid)
            .write_mpi(&self.dh_y)
            .write_ctr(&self.ctr)
            .write_data(&self.encrypted)
            .write_mac(&self.authenticator)
            .write_data(&self.revealed);
    }
}

pub fn encode_message(
    version: Version,
    sender: InstanceTag,
    receiver: InstanceTag,
    message: EncodedMessageType,
) -> Vec<u8> {
    serialize_message(&MessageType::Encoded(EncodedMessage {
        version,
        sender,
        receiver,
        message,
    }))
}

/// `serialize_message` (straight-forwardly) serializes provided message
/// into a byte-sequence.
pub fn serialize_message(msg: &MessageType) -> Vec<u8> {
    let mut buffer = Vec::<u8>::new();
    match msg {
        MessageType::Error(error) => {
            buffer.extend_from_slice(OTR_ERROR_PREFIX);
            buffer.extend(error);
            buffer
        }
        MessageType::Plaintext(message) => {
            buffer.extend(message);
            buffer
        }
        MessageType::Tagged(versions, message) => {
            assert!(!versions.is_empty());
            buffer.extend_from_slice(WHITESPACE_PREFIX);
            for v in utils::alloc::vec_unique(versions.clone()) {
                match v {
                    Version::V2 => buffer.extend_from_slice(WHITESPACE_TAG_OTRV2),
                    Version::V3 => buffer.extend_from_slice(WHITESPACE_TAG_OTRV3),
                    Version::Unsupported(_) => {
                        panic!("BUG: unsupported versions should be avoided.")
                    }
                }
            }
            buffer.extend(message);
            buffer
        }
        MessageType::Query(versions) => {
            assert!(!versions.is_empty());
            // Each version listed at most once. (Version 1 has deviating
            // syntax and is no longer supported.)
            buffer.extend_from_slice(OTR_QUERY_PREFIX);
            for v in utils::alloc::vec_unique(versions.clone()) {
                match v {
                    Version::V2 => buffer.push(b'2'),
                    Version::V3 => buffer.push(b'3'),
                    Version::Unsupported(_) => {
                        panic!("BUG: unsupported version should be avoided.")
                    }
                }
            }
            buffer.push(b'?');
            buffer
        }
        MessageType::Encoded(encoded_message) => {
            buffer.extend_from_slice(OTR_ENCODED_PREFIX);
            buffer.extend(
                base64::encode(OTREncoder::new().write_encodable(encoded_message).to_vec())
                    .into_bytes(),
            );
            buffer.extend_from_slice(OTR_ENCODED_SUFFIX);
            buffer
        }
    }
}

/// `encode_authenticator_data` serializes the authenticated portion `T` of
/// a data message, over which the HMAC is computed. For version 3 the
/// instance tags are part of `T`; for version 2 they are not.
pub fn encode_authenticator_data(
    version: Version,
    sender: InstanceTag,
    receiver: InstanceTag,
    message: &DataMessage,
) -> Vec<u8> {
    let mut encoder = OTREncoder::new();
    encoder
        .write_u16(encode_version(version))
        .write_u8(OTR_DATA_TYPE_CODE);
    if version == Version::V3 {
        encoder.write_u32(sender).write_u32(receiver);
    }
    encoder
        .write_u8(message.flags.bits())
        .write_u32(message.sender_keyid)
        .write_u32(message.receiver_keyid)
        .write_mpi(&message.dh_y)
        .write_ctr(&message.ctr)
        .write_data(&message.encrypted)
        .to_vec()
}

fn encode_version(version: Version) -> u16 {
    match version {
        Version::V2 => 2,
        Version::V3 => 3,
        Version::Unsupported(_) => panic!("BUG: unsupported version"),
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use crate::encoding::MessageFlags;
    use crate::instancetag::INSTANCE_ZERO;
    use crate::Version;

    use super::{
        encode_message, parse, serialize_message, DataMessage, EncodedMessageType, MessageType,
    };

    #[test]
    fn parse_empty_message() {
        match parse(b"").unwrap() {
            MessageType::Plaintext(content) => assert_eq!(b"", content.as_slice()),
            _ => panic!("Incorrect message type received."),
        }
    }

    #[test]
    fn parse_hello_world_message() {
        match parse(b"Hello world! Greetings from <undisclosed location>").unwrap() {
            MessageType::Plaintext(content) => assert_eq!(
                b"Hello world! Greetings from <undisclosed location>".as_ref(),
                content.as_slice()
            ),
            _ => panic!("Incorrect message type received."),
        }
    }

    #[test]
    fn parse_message_false_query_tag() {
        match parse(b"?OTRv Hello world!").unwrap() {
            MessageType::Plaintext(content) => {
                assert_eq!(b"?OTRv Hello world!".as_ref(), content.as_slice());
            }
            _ => panic!("Incorrect message type received."),
        }
    }

    #[test]
    fn parse_message_false_query_tag_2() {
        match parse(b"OTRv3? Hello world!").unwrap() {
            MessageType::Plaintext(content) => {
                assert_eq!(b"OTRv3? Hello world!".as_ref(), content.as_slice());
            }
            _ => panic!("Incorrect message type received."),
        }
    }

    #[test]
    fn parse_query_message_otrv1_format() {
        match parse(b"?OTR?").unwrap() {
            MessageType::Query(versions) => assert!(versions.is_empty()),
            _ => panic!("Unexpected message type."),
        }
    }

    #[test]
    fn parse_query_message_empty() {
        match parse(b"?OTRv?").unwrap() {
            MessageType::Query(versions) => assert!(versions.is_empty()),
            _ => panic!("Unexpected message type."),
        }
    }

    #[test]
    fn parse_query_message_v1_illegal() {
        match parse(b"?OTRv1?").unwrap() {
            MessageType::Query(versions) => assert!(versions.is_empty()),
            _ => panic!("Unexpected message type."),
        }
    }

    #[test]
    fn parse_query_message_v2() {
        match parse(b"?OTRv2?").unwrap() {
            MessageType::Query(versions) => assert_eq!(vec![Version::V2], versions),
            _ => panic!("Unexpected message type."),
        }
    }

    #[test]
    fn parse_query_message_v23() {
        match parse(b"?OTRv23?").unwrap() {
            MessageType::Query(versions) => assert_eq!(vec![Version::V2, Version::V3], versions),
            _ => panic!("Unexpected message type."),
        }
    }

    #[test]
    fn parse_query_message_v234() {
        match parse(b"?OTRv234?").unwrap() {
            MessageType::Query(versions) => assert_eq!(vec![Version::V2, Version::V3], versions),
            _ => panic!("Unexpected message type."),
        }
    }

    #[test]
    fn parse_query_message_v34() {
        match parse(b"?OTRv34?").unwrap() {
            MessageType::Query(versions) => assert_eq!(vec![Version::V3], versions),
            _ => panic!("Unexpected message type."),
        }
    }

    #[test]
    fn parse_tagged_message_no_versions() {
        match parse(b"Hello \t  \t\t\t\t \t \t \t   world!").unwrap() {
            MessageType::Tagged(versions, content) => {
                assert_eq!(0, versions.len());
                assert_eq!(b"Hello world!", content.as_slice());
            }
            _ => panic!("Unexpected message type."),
        }
    }

    #[test]
    fn parse_tagged_message_versions_v1v2() {
        match parse(b"Hello \t  \t\t\t\t \t \t \t   \t \t  \t   \t\t  \t  world!").unwrap() {
            MessageType::Tagged(versions, content) => {
                assert_eq!(vec![Version::Unsupported(1), Version::V2], versions);
                assert_eq!(b"Hello world!", content.as_slice());
            }
            _ => panic!("Unexpected message type."),
        }
    }

    #[test]
    fn parse_tagged_message_versions_v3() {
        match parse(b"Hello \t  \t\t\t\t \t \t \t    \t\t  \t\t world!").unwrap() {
            MessageType::Tagged(versions, content) => {
                assert_eq!(vec![Version::V3], versions);
                assert_eq!(b"Hello world!", content.as_slice());
            }
            _ => panic!("Unexpected message type."),
        }
    }

    #[test]
    fn parse_error_message() {
        match parse(b"?OTR Error: You transmitted an unreadable encrypted message.").unwrap() {
            MessageType::Error(error) => assert_eq!(
                b" You transmitted an unreadable encrypted message.".as_ref(),
                error.as_slice()
            ),
            _ => panic!("Unexpected message type."),
        }
    }

    #[test]
    fn serialize_query_message() {
        assert_eq!(
            b"?OTRv23?".to_vec(),
            serialize_message(&MessageType::Query(vec![Version::V3, Version::V2]))
        );
    }

    #[test]
    fn serialize_tagged_message_strips_to_roundtrip() {
        let serialized = serialize_message(&MessageType::Tagged(
            vec![Version::V2, Version::V3],
            b"Hi there".to_vec(),
        ));
        match parse(&serialized).unwrap() {
            MessageType::Tagged(versions, content) => {
                assert_eq!(vec![Version::V2, Version::V3], versions);
                assert_eq!(b"Hi there".to_vec(), content);
            }
            _ => panic!("Unexpected message type."),
        }
    }

    fn dummy_data_message() -> DataMessage {
        DataMessage {
            flags: MessageFlags::empty(),
            sender_keyid: 1,
            receiver_keyid: 2,
            dh_y: BigUint::from(0x1234_5678u32),
            ctr: [0, 0, 0, 0, 0, 0, 0, 1],
            encrypted: b"ciphertextbytes".to_vec(),
            authenticator: [0x5a; 20],
            revealed: Vec::new(),
        }
    }

    #[test]
    fn encoded_data_message_roundtrip_v3() {
        let serialized = encode_message(
            Version::V3,
            0x0000_0100,
            0x0000_0200,
            EncodedMessageType::Data(dummy_data_message()),
        );
        assert!(serialized.starts_with(b"?OTR:"));
        assert!(serialized.ends_with(b"."));
        match parse(&serialized).unwrap() {
            MessageType::Encoded(msg) => {
                assert_eq!(Version::V3, msg.version);
                assert_eq!(0x100, msg.sender);
                assert_eq!(0x200, msg.receiver);
                match msg.message {
                    EncodedMessageType::Data(data) => {
                        assert_eq!(1, data.sender_keyid);
                        assert_eq!(2, data.receiver_keyid);
                        assert_eq!(b"ciphertextbytes".to_vec(), data.encrypted);
                        assert_eq!([0x5a; 20], data.authenticator);
                    }
                    _ => panic!("Unexpected encoded message type."),
                }
            }
            _ => panic!("Unexpected message type."),
        }
    }

    #[test]
    fn encoded_data_message_roundtrip_v2_has_no_tags() {
        let serialized = encode_message(
            Version::V2,
            0x0000_0100,
            0x0000_0200,
            EncodedMessageType::Data(dummy_data_message()),
        );
        match parse(&serialized).unwrap() {
            MessageType::Encoded(msg) => {
                assert_eq!(Version::V2, msg.version);
                assert_eq!(INSTANCE_ZERO, msg.sender);
                assert_eq!(INSTANCE_ZERO, msg.receiver);
            }
            _ => panic!("Unexpected message type."),
        }
    }

    #[test]
    fn parse_corrupt_base64_fails() {
        assert!(parse(b"?OTR:not&&base64!!!.").is_err());
    }

    #[test]
    fn parse_unsupported_version_fails() {
        // version 1 header in an encoded message
        let payload = base64::encode([0u8, 1, 2].as_ref());
        let mut message = b"?OTR:".to_vec();
        message.extend(payload.into_bytes());
        message.push(b'.');
        assert!(parse(&message).is_err());
    }
}
