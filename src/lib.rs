// SPDX-License-Identifier: LGPL-3.0-only

#![deny(unused_must_use)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::fmt;

use bitflags::bitflags;

extern crate aes_ctr;
extern crate base64;
extern crate bitflags;
extern crate hex;
extern crate num_bigint;
extern crate num_integer;
extern crate once_cell;
extern crate regex;
extern crate ring;

mod ake;
mod encoding;
mod fragment;
mod keymanager;
mod messages;
mod protocol;
mod smp;
mod utils;
mod wire;

pub mod crypto;
pub mod event;
pub mod instancetag;
pub mod outbox;
pub mod session;
pub mod worker;

pub use ake::AKEError;
pub use crypto::{dsa, CryptoError};
pub use event::{Direction, Event, SMPEvent, Severity, Status};
pub use session::{Config, Session};
pub use smp::SMPRole;

/// `OTRError` is the enum containing the various errors that can occur.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OTRError {
    /// Message contained invalid data according to the OTR protocol.
    ProtocolViolation(&'static str),
    /// Message payload is incomplete. The message cannot be reconstructed from the received bytes.
    IncompleteMessage,
    /// Encrypted message is unreadable due to loss of keys and/or wrong protocol state.
    UnreadableMessage,
    /// An OTR message was received that is intended for a different instance (client).
    MessageForOtherInstance,
    /// No acceptable version available in proposed protocol versions.
    NoAcceptableVersion,
    UnsupportedVersion(u16),
    /// Operation is not possible in the current protocol state.
    IncorrectState(&'static str),
    /// Violation of cryptographic or mathematical requirement for correct/secure operation.
    CryptographicViolation(CryptoError),
    /// (AKE) `AuthenticationError` indicates that there was an error during AKE.
    AuthenticationError(AKEError),
    /// Data message refers to keys that are neither the current nor the previous keys.
    NotLatestKeys,
    /// Data message counter is not strictly larger than the last accepted counter.
    CounterReplay,
    /// Sending counter is exhausted for the current key pair. Keys must be rotated first.
    RekeyRequired,
    /// (SMP) an SMP exchange is in progress.
    SMPInProgress,
    PolicyRestriction(&'static str),
    /// Plaintext message received while policy or protocol state expects encryption.
    UnencryptedMessage,
    IllegalInstanceTag(u32),
    /// Configured fragment size does not leave room for any payload.
    FragmentSizeTooSmall,
    /// Message would require more fragments than can be numbered.
    TooManyFragments,
    /// Data of the given length does not fit in the 16-bit length field of a TLV.
    TLVTooLong(usize),
    /// Error message received from the other party.
    PeerError(Vec<u8>),
    /// Offloaded work did not produce a result.
    OffloadFailed,
}

impl fmt::Display for OTRError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolViolation(reason) => write!(f, "protocol violation: {reason}"),
            Self::IncompleteMessage => f.write_str("incomplete message"),
            Self::UnreadableMessage => f.write_str("unreadable message"),
            Self::MessageForOtherInstance => f.write_str("message intended for other instance"),
            Self::NoAcceptableVersion => f.write_str("no acceptable protocol version"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol version: {v}"),
            Self::IncorrectState(reason) => write!(f, "incorrect state: {reason}"),
            Self::CryptographicViolation(CryptoError::VerificationFailure(reason)) => {
                write!(f, "cryptographic verification failed: {reason}")
            }
            Self::AuthenticationError(err) => write!(f, "authentication failed: {err:?}"),
            Self::NotLatestKeys => f.write_str("not of latest keys"),
            Self::CounterReplay => f.write_str("counter must be strictly increasing"),
            Self::RekeyRequired => f.write_str("rekey required"),
            Self::SMPInProgress => f.write_str("SMP already in progress"),
            Self::PolicyRestriction(reason) => write!(f, "restricted by policy: {reason}"),
            Self::UnencryptedMessage => f.write_str("received message was not encrypted"),
            Self::IllegalInstanceTag(tag) => write!(f, "illegal instance tag: {tag:#x}"),
            Self::FragmentSizeTooSmall => f.write_str("fragment size too small"),
            Self::TooManyFragments => f.write_str("message requires too many fragments"),
            Self::TLVTooLong(len) => write!(f, "too long for a TLV: {len} bytes"),
            Self::PeerError(content) => {
                write!(f, "error from peer: {}", String::from_utf8_lossy(content))
            }
            Self::OffloadFailed => f.write_str("offloaded work produced no result"),
        }
    }
}

impl std::error::Error for OTRError {}

#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum ProtocolStatus {
    Plaintext,
    Encrypted,
    Finished,
}

/// `Version` contains the various supported OTR protocol versions.
#[derive(Debug, PartialOrd, Ord, PartialEq, Eq, Clone, Copy)]
pub enum Version {
    None,
    // V1 is recognized in queries and whitespace tags, but never negotiated.
    V2,
    V3,
    Unsupported(u16),
}

bitflags! {
    /// `Policy` bit-flags can be set to indicate how OTR should respond to certain events related
    /// to messaging and the OTR protocol.
    pub struct Policy: u32 {
        /// Allow version 2 of the OTR protocol to be used.
        const ALLOW_V2 = 0b0000_0010;
        /// Allow version 3 of the OTR protocol to be used.
        const ALLOW_V3 = 0b0000_0100;
        /// Refuse to send unencrypted messages.
        const REQUIRE_ENCRYPTION = 0b0000_1000;
        /// Advertise your support of OTR using the whitespace tag.
        const SEND_WHITESPACE_TAG = 0b0001_0000;
        /// Start the OTR AKE when you receive a whitespace tag.
        const WHITESPACE_START_AKE = 0b0010_0000;
        /// Start the OTR AKE when you receive an OTR Error Message.
        const ERROR_START_AKE = 0b0100_0000;
    }
}

/// `TLV_TYPE_0_PADDING` is the TLV that can be used to introduce arbitrary-length padding to an
/// encrypted message.
pub const TLV_TYPE_0_PADDING: TLVType = 0;

/// `TLV_TYPE_1_DISCONNECT` is the TLV that signals a disconnect.
pub const TLV_TYPE_1_DISCONNECT: TLVType = 1;

/// `TLV_TYPE_8_EXTRA_SYMMETRIC_KEY` announces use of the extra symmetric key. The payload starts
/// with a 4-byte usage indicator, followed by usage-specific data.
pub const TLV_TYPE_8_EXTRA_SYMMETRIC_KEY: TLVType = 8;

/// `TLVType` is an alias for an u16 value. The values are not restricted. Therefore define the type.
pub type TLVType = u16;

/// `SSID` is the secure session id: derived from the shared secret, used to verify the session
/// out-of-band and during SMP.
pub type SSID = [u8; 8];
