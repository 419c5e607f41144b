// SPDX-License-Identifier: LGPL-3.0-only

use num_bigint::BigUint;
use once_cell::sync::Lazy;
use regex::bytes::Regex;

use crate::{
    ake,
    encoding::{MessageFlags, OTRDecoder, OTREncodable, OTREncoder, TLV, CTR_LEN, MAC_LEN},
    instancetag::{InstanceTag, INSTANCE_ZERO},
    utils, OTRError, Version,
};

const OTR_USE_INFORMATION_MESSAGE: &[u8] = b"An Off-The-Record conversation has been requested.";

const OTR_ERROR_PREFIX: &[u8] = b"?OTR Error:";
const OTR_QUERY_PREFIX: &[u8] = b"?OTRv";
const OTR_ENCODED_PREFIX: &[u8] = b"?OTR:";
const OTR_ENCODED_SUFFIX: &[u8] = b".";

const OTR_DH_COMMIT_TYPE_CODE: u8 = 0x02;
const OTR_DH_KEY_TYPE_CODE: u8 = 0x0a;
const OTR_REVEAL_SIGNATURE_TYPE_CODE: u8 = 0x11;
const OTR_SIGNATURE_TYPE_CODE: u8 = 0x12;
/// OTR encoded message type code for OTRv2 + OTRv3 data messages.
const OTR_DATA_TYPE_CODE: u8 = 0x03;

static QUERY_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\?OTR(?:(\?)(?:v([0-9]*)\?)?|v([0-9]*)\?)")
        .expect("BUG: failed to compile hard-coded regex-pattern.")
});
const QUERY_GROUP_V1: usize = 1;
const QUERY_GROUP_VERSIONS_AFTER_V1: usize = 2;
const QUERY_GROUP_VERSIONS: usize = 3;
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
        if end < start {
            return Err(OTRError::IncompleteMessage);
        }
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
    log::trace!("decoding encoded message of type {message_type:#04x}");
    let message = match message_type {
        OTR_DH_COMMIT_TYPE_CODE => {
            EncodedMessageType::DHCommit(ake::DHCommitMessage::decode(decoder)?)
        }
        OTR_DH_KEY_TYPE_CODE => EncodedMessageType::DHKey(ake::DHKeyMessage::decode(decoder)?),
        OTR_REVEAL_SIGNATURE_TYPE_CODE => {
            EncodedMessageType::RevealSignature(ake::RevealSignatureMessage::decode(decoder)?)
        }
        OTR_SIGNATURE_TYPE_CODE => {
            EncodedMessageType::Signature(ake::SignatureMessage::decode(decoder)?)
        }
        OTR_DATA_TYPE_CODE => EncodedMessageType::Data(DataMessage::decode(decoder)?),
        _ => {
            return Err(OTRError::ProtocolViolation(
                "Invalid or unknown message type.",
            ))
        }
    };
    Ok(message)
}

fn parse_plain_message(data: &[u8]) -> MessageType {
    if data.starts_with(OTR_ERROR_PREFIX) {
        // `?OTR Error:` prefix must start at beginning of message to avoid people messing with OTR
        // in normal plaintext messages.
        return MessageType::Error(Vec::from(&data[OTR_ERROR_PREFIX.len()..]));
    }
    if let Some(caps) = (*QUERY_PATTERN).captures(data) {
        let mut versions = Vec::new();
        if caps.get(QUERY_GROUP_V1).is_some() {
            versions.push(Version::Unsupported(1));
        }
        for group in [QUERY_GROUP_VERSIONS_AFTER_V1, QUERY_GROUP_VERSIONS] {
            if let Some(digits) = caps.get(group) {
                versions.extend(digits.as_bytes().iter().map(|v| match v {
                    // '1' is not a valid way to express version 1. It is ignored as
                    // version 1 is never negotiated anyways.
                    b'2' => Version::V2,
                    b'3' => Version::V3,
                    other => Version::Unsupported(u16::from(other - b'0')),
                }));
            }
        }
        return MessageType::Query(filter_supported(versions));
    }
    if let Some(caps) = (*WHITESPACE_PATTERN).captures(data) {
        let cap = caps
            .get(WHITESPACE_GROUP_TAGS)
            .expect("BUG: hard-coded regex should include capture group");
        let versions = filter_supported(parse_whitespace_tags(cap.as_bytes()));
        let cleaned = (*WHITESPACE_PATTERN)
            .replace(data, b"".as_ref())
            .to_vec();
        return MessageType::Tagged(versions, cleaned);
    }
    MessageType::Plaintext(data.to_vec())
}

fn filter_supported(versions: Vec<Version>) -> Vec<Version> {
    utils::alloc::vec_unique(
        versions
            .into_iter()
            .filter(|v| matches!(v, Version::V2 | Version::V3))
            .collect(),
    )
}

fn parse_whitespace_tags(data: &[u8]) -> Vec<Version> {
    data.chunks_exact(8)
        .filter_map(|tag| match tag {
            WHITESPACE_TAG_OTRV1 => Some(Version::Unsupported(1)),
            WHITESPACE_TAG_OTRV2 => Some(Version::V2),
            WHITESPACE_TAG_OTRV3 => Some(Version::V3),
            _ => None,
        })
        .collect()
}

#[allow(clippy::large_enum_variant)]
pub enum MessageType {
    Error(Vec<u8>),
    Plaintext(Vec<u8>),
    Tagged(Vec<Version>, Vec<u8>),
    Query(Vec<Version>),
    Encoded(EncodedMessage),
}

/// `EncodedMessage` is the OTR-encoded message envelope. For version 2, `sender` and `receiver`
/// are not part of the encoding and are always `INSTANCE_ZERO`.
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
            .write_u8(self.message.type_code());
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

/// `EncodedMessageType` is the body of an OTR-encoded message: one of the four AKE messages or a
/// data message.
pub enum EncodedMessageType {
    DHCommit(ake::DHCommitMessage),
    DHKey(ake::DHKeyMessage),
    RevealSignature(ake::RevealSignatureMessage),
    Signature(ake::SignatureMessage),
    Data(DataMessage),
}

impl EncodedMessageType {
    fn type_code(&self) -> u8 {
        match self {
            Self::DHCommit(_) => OTR_DH_COMMIT_TYPE_CODE,
            Self::DHKey(_) => OTR_DH_KEY_TYPE_CODE,
            Self::RevealSignature(_) => OTR_REVEAL_SIGNATURE_TYPE_CODE,
            Self::Signature(_) => OTR_SIGNATURE_TYPE_CODE,
            Self::Data(_) => OTR_DATA_TYPE_CODE,
        }
    }
}

#[derive(Clone)]
pub struct DataMessage {
    pub flags: MessageFlags,
    pub sender_keyid: KeyID,
    pub receiver_keyid: KeyID,
    pub dh_y: BigUint,
    // OTRv3 protocol documentation:
    //   "The initial counter is a 16-byte value whose first 8 bytes
    //    are the above "top half of counter init" value, and whose last 8
    //    bytes are all 0x00."
    pub ctr: [u8; CTR_LEN],
    pub encrypted: Vec<u8>,
    pub authenticator: [u8; MAC_LEN],
    /// revealed contains recent keys, previously used for authentication, that should now become public.
    pub revealed: Vec<u8>,
}

pub type KeyID = u32;

impl DataMessage {
    fn decode(decoder: &mut OTRDecoder) -> Result<Self, OTRError> {
        let flags = MessageFlags::from_bits(decoder.read_u8()?)
            .ok_or(OTRError::ProtocolViolation("Invalid message flags"))?;
        let sender_keyid = utils::u32::verify_nonzero(
            decoder.read_u32()?,
            OTRError::ProtocolViolation("Invalid KeyID: cannot be 0"),
        )?;
        let receiver_keyid = utils::u32::verify_nonzero(
            decoder.read_u32()?,
            OTRError::ProtocolViolation("Invalid KeyID: cannot be 0"),
        )?;
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

/// `serialize_message` produces the textual form of a message, as it is transmitted.
pub fn serialize_message(msg: &MessageType) -> Vec<u8> {
    match msg {
        MessageType::Error(error) => [OTR_ERROR_PREFIX, error.as_slice()].concat(),
        MessageType::Plaintext(message) => message.clone(),
        MessageType::Tagged(versions, message) => {
            let mut buffer = [message.as_slice(), WHITESPACE_PREFIX].concat();
            for version in supported_once(versions) {
                buffer.extend_from_slice(match version {
                    Version::V2 => WHITESPACE_TAG_OTRV2,
                    _ => WHITESPACE_TAG_OTRV3,
                });
            }
            buffer
        }
        MessageType::Query(versions) => {
            let mut buffer = OTR_QUERY_PREFIX.to_vec();
            for version in supported_once(versions) {
                buffer.push(if version == Version::V2 { b'2' } else { b'3' });
            }
            buffer.extend_from_slice(b"? ");
            buffer.extend_from_slice(OTR_USE_INFORMATION_MESSAGE);
            buffer
        }
        MessageType::Encoded(encoded_message) => {
            let content = OTREncoder::new().write_encodable(encoded_message).to_vec();
            [
                OTR_ENCODED_PREFIX,
                base64::encode(content).as_bytes(),
                OTR_ENCODED_SUFFIX,
            ]
            .concat()
        }
    }
}

/// `supported_once` lists each version once, in ascending order. Versions we cannot advertise are
/// a bug.
fn supported_once(versions: &[Version]) -> Vec<Version> {
    assert!(!versions.is_empty(), "BUG: at least one version is required");
    let versions = utils::alloc::vec_unique(versions.to_vec());
    assert!(
        versions.iter().all(|v| matches!(v, Version::V2 | Version::V3)),
        "BUG: only supported versions can be advertised"
    );
    versions
}

/// `encode_authenticator_data` produces the bytes covered by the data message MAC: the envelope
/// header and all fields up to and including the encrypted message.
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

/// `encode_payload` produces the plaintext of a data message: the (NUL-free) message, followed by
/// a NUL-byte and TLVs if any TLVs are present. Fails if any TLV value is too long to encode.
pub fn encode_payload(content: &[u8], tlvs: &[TLV]) -> Result<Vec<u8>, OTRError> {
    if let Some(tlv) = tlvs.iter().find(|tlv| tlv.1.len() > usize::from(u16::MAX)) {
        return Err(OTRError::TLVTooLong(tlv.1.len()));
    }
    let mut encoder = OTREncoder::new();
    let content = utils::bytes::drop_by_value(content, 0);
    if tlvs.is_empty() {
        encoder.write(&content);
    } else {
        encoder.write_bytes_null_terminated(&content);
        for tlv in tlvs {
            encoder.write_tlv(tlv);
        }
    }
    Ok(encoder.to_vec())
}

/// `parse_payload` splits the decrypted plaintext into the human-readable message and TLVs.
pub fn parse_payload(payload: &[u8]) -> (Vec<u8>, Vec<TLV>) {
    let mut decoder = OTRDecoder::new(payload);
    let content = decoder.read_bytes_null_terminated();
    let tlvs = decoder.read_tlvs();
    (content, tlvs)
}

pub fn encode_version(version: Version) -> u16 {
    match version {
        Version::None => 0,
        Version::V2 => 2,
        Version::V3 => 3,
        Version::Unsupported(_) => panic!("BUG: unsupported version"),
    }
}

#[cfg(test)]
mod tests {
    use num_bigint::BigUint;

    use crate::{
        ake::DHKeyMessage,
        encoding::{MessageFlags, TLV},
        Version,
    };

    use super::{
        encode_payload, parse, parse_payload, serialize_message, DataMessage, EncodedMessage,
        EncodedMessageType, MessageType,
    };

    #[test]
    fn test_parse_plaintext() {
        assert!(matches!(parse(b"Hello world!").unwrap(), MessageType::Plaintext(m) if m == b"Hello world!"));
        assert!(matches!(parse(b"").unwrap(), MessageType::Plaintext(m) if m.is_empty()));
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(parse(b"?OTR Error:Something went wrong").unwrap(),
            MessageType::Error(m) if m == b"Something went wrong"));
    }

    #[test]
    fn test_parse_query_variants() {
        let cases: &[(&[u8], Vec<Version>)] = &[
            (b"?OTR?", vec![]),
            (b"?OTRv2?", vec![Version::V2]),
            (b"?OTRv23?", vec![Version::V2, Version::V3]),
            (b"?OTR?v2?", vec![Version::V2]),
            (b"?OTRv24?", vec![Version::V2]),
            (b"?OTRv?", vec![]),
            (b"Hey ?OTRv3? let's talk", vec![Version::V3]),
        ];
        for (input, expected) in cases {
            match parse(input).unwrap() {
                MessageType::Query(versions) => assert_eq!(expected, &versions),
                _ => panic!("Expected query message"),
            }
        }
    }

    #[test]
    fn test_parse_not_a_query() {
        assert!(matches!(parse(b"?OTRv23").unwrap(), MessageType::Plaintext(_)));
        assert!(matches!(parse(b"?OTR").unwrap(), MessageType::Plaintext(_)));
    }

    #[test]
    fn test_query_roundtrip() {
        let serialized = serialize_message(&MessageType::Query(vec![Version::V3, Version::V2]));
        assert!(serialized.starts_with(b"?OTRv23? "));
        match parse(&serialized).unwrap() {
            MessageType::Query(versions) => assert_eq!(vec![Version::V2, Version::V3], versions),
            _ => panic!("Expected query message"),
        }
    }

    #[test]
    fn test_parse_whitespace_tagged() {
        let serialized = serialize_message(&MessageType::Tagged(
            vec![Version::V2, Version::V3],
            Vec::from("Hello"),
        ));
        match parse(&serialized).unwrap() {
            MessageType::Tagged(versions, content) => {
                assert_eq!(vec![Version::V2, Version::V3], versions);
                assert_eq!(b"Hello".to_vec(), content);
            }
            _ => panic!("Expected whitespace-tagged message"),
        }
    }

    #[test]
    fn test_parse_whitespace_tag_in_middle() {
        let mut message = Vec::from("Hi ");
        message.extend_from_slice(super::WHITESPACE_PREFIX);
        message.extend_from_slice(super::WHITESPACE_TAG_OTRV1);
        message.extend_from_slice(super::WHITESPACE_TAG_OTRV3);
        message.extend_from_slice(b"there");
        match parse(&message).unwrap() {
            MessageType::Tagged(versions, content) => {
                assert_eq!(vec![Version::V3], versions);
                assert_eq!(b"Hi there".to_vec(), content);
            }
            _ => panic!("Expected whitespace-tagged message"),
        }
    }

    #[test]
    fn test_encoded_message_v2_has_no_instance_tags() {
        let msg = EncodedMessage {
            version: Version::V2,
            sender: 0,
            receiver: 0,
            message: EncodedMessageType::DHKey(DHKeyMessage {
                gy: BigUint::from(12345u32),
            }),
        };
        let serialized = serialize_message(&MessageType::Encoded(msg));
        let decoded = base64::decode(&serialized[5..serialized.len() - 1]).unwrap();
        assert_eq!(&[0u8, 2, 0x0a, 0, 0, 0, 2, 0x30, 0x39], decoded.as_slice());
        match parse(&serialized).unwrap() {
            MessageType::Encoded(EncodedMessage {
                version: Version::V2,
                sender: 0,
                receiver: 0,
                message: EncodedMessageType::DHKey(msg),
            }) => assert_eq!(BigUint::from(12345u32), msg.gy),
            _ => panic!("Expected DH-Key message"),
        }
    }

    #[test]
    fn test_encoded_data_message_v3() {
        let msg = EncodedMessage {
            version: Version::V3,
            sender: 0x100,
            receiver: 0x1234_5678,
            message: EncodedMessageType::Data(DataMessage {
                flags: MessageFlags::IGNORE_UNREADABLE,
                sender_keyid: 2,
                receiver_keyid: 1,
                dh_y: BigUint::from(0xabcdefu32),
                ctr: [0, 0, 0, 0, 0, 0, 0, 1],
                encrypted: Vec::from("encrypted"),
                authenticator: [7u8; 20],
                revealed: Vec::new(),
            }),
        };
        let serialized = serialize_message(&MessageType::Encoded(msg));
        match parse(&serialized).unwrap() {
            MessageType::Encoded(EncodedMessage {
                version: Version::V3,
                sender: 0x100,
                receiver: 0x1234_5678,
                message: EncodedMessageType::Data(msg),
            }) => {
                assert_eq!(MessageFlags::IGNORE_UNREADABLE, msg.flags);
                assert_eq!(2, msg.sender_keyid);
                assert_eq!(1, msg.receiver_keyid);
                assert_eq!(b"encrypted".to_vec(), msg.encrypted);
            }
            _ => panic!("Expected data message"),
        }
    }

    #[test]
    fn test_parse_encoded_rejects_bad_content() {
        assert!(parse(b"?OTR:AAEC.").is_err());
        assert!(parse(b"?OTR:%%%.").is_err());
        assert!(matches!(
            parse(b"?OTR:AAQK."),
            Err(crate::OTRError::UnsupportedVersion(4))
        ));
    }

    #[test]
    fn test_payload_with_tlvs() {
        let payload =
            encode_payload(b"Hel\0lo", &[TLV(1, Vec::new()), TLV(8, vec![1, 2, 3, 4])]).unwrap();
        let (content, tlvs) = parse_payload(&payload);
        assert_eq!(b"Hello".to_vec(), content);
        assert_eq!(vec![TLV(1, Vec::new()), TLV(8, vec![1, 2, 3, 4])], tlvs);
    }

    #[test]
    fn test_payload_without_tlvs() {
        let payload = encode_payload(b"Hello", &[]).unwrap();
        assert_eq!(b"Hello".to_vec(), payload);
        let (content, tlvs) = parse_payload(&payload);
        assert_eq!(b"Hello".to_vec(), content);
        assert!(tlvs.is_empty());
    }

    #[test]
    fn test_payload_with_oversized_tlv() {
        let tlvs = [TLV(0, Vec::new()), TLV(8, vec![0u8; 65536])];
        assert!(matches!(
            encode_payload(b"Hello", &tlvs),
            Err(crate::OTRError::TLVTooLong(65536))
        ));
        assert!(encode_payload(b"", &[TLV(8, vec![0u8; 65535])]).is_ok());
    }
}
