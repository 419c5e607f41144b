// SPDX-License-Identifier: LGPL-3.0-only

//! Fragmentation of OTR-encoded messages for transports with a limited message size, and the
//! reassembly of received fragments.

use std::fmt::Debug;

use once_cell::sync::Lazy;
use regex::bytes::{Captures, Regex};

use crate::{
    encoding::{OTREncodable, OTREncoder},
    instancetag::{self, InstanceTag, INSTANCE_ZERO},
    OTRError, Version,
};

const OTR_FRAGMENT_V2_PREFIX: &[u8] = b"?OTR,";
const OTR_FRAGMENT_V3_PREFIX: &[u8] = b"?OTR|";
const OTR_FRAGMENT_SUFFIX: &[u8] = b",";

/// `OTRV2_OVERHEAD` is the number of bytes of a version 2 fragment that are not payload:
/// `?OTR,` + `kkkkk,nnnnn,` + `,`.
pub const OTRV2_OVERHEAD: usize = 18;
/// `OTRV3_OVERHEAD` is the number of bytes of a version 3 fragment that are not payload: the
/// version 2 overhead plus two 8-digit hexadecimal instance tags and their separators.
pub const OTRV3_OVERHEAD: usize = 36;

/// Version 2: `?OTR,k,n,piece,`
static FRAGMENT_V2_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\?OTR,(\d{1,5}),(\d{1,5}),([A-Za-z0-9\+/=\?:\.]+),$")
        .expect("BUG: failed to compile hard-coded regex-pattern.")
});

/// Version 3: `?OTR|sender|receiver,k,n,piece,` with hexadecimal instance tags. Leading zeroes are
/// permitted for all numbers.
static FRAGMENT_V3_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^\?OTR\|([0-9a-fA-F]{1,8})\|([0-9a-fA-F]{1,8}),(\d{1,5}),(\d{1,5}),([A-Za-z0-9\+/=\?:\.]+),$",
    )
    .expect("BUG: failed to compile hard-coded regex-pattern.")
});

/// `match_fragment` is a quick check whether content looks like a fragment of either version.
pub fn match_fragment(content: &[u8]) -> bool {
    (content.starts_with(OTR_FRAGMENT_V2_PREFIX) || content.starts_with(OTR_FRAGMENT_V3_PREFIX))
        && content.ends_with(OTR_FRAGMENT_SUFFIX)
}

/// `parse` parses a fragment of either version. Returns `None` for anything that does not
/// strictly conform, including numbers out of range and illegal instance tags.
pub fn parse(content: &[u8]) -> Option<Fragment> {
    let (version, sender, receiver, captures, first) =
        if let Some(captures) = FRAGMENT_V3_PATTERN.captures(content) {
            let sender = instancetag::verify(number(&captures, 1, 16)?).ok()?;
            let receiver = instancetag::verify(number(&captures, 2, 16)?).ok()?;
            (Version::V3, sender, receiver, captures, 3)
        } else {
            let captures = FRAGMENT_V2_PATTERN.captures(content)?;
            (Version::V2, INSTANCE_ZERO, INSTANCE_ZERO, captures, 1)
        };
    Some(Fragment {
        version,
        sender,
        receiver,
        part: u16::try_from(number(&captures, first, 10)?).ok()?,
        total: u16::try_from(number(&captures, first + 1, 10)?).ok()?,
        payload: captures.get(first + 2)?.as_bytes().to_vec(),
    })
}

fn number(captures: &Captures, group: usize, radix: u32) -> Option<u32> {
    let digits = std::str::from_utf8(captures.get(group)?.as_bytes()).ok()?;
    u32::from_str_radix(digits, radix).ok()
}

/// `verify` checks that the fragment describes a valid position in a valid partitioning.
pub fn verify(fragment: &Fragment) -> Result<(), FragmentError> {
    if fragment.part == 0 || fragment.part > fragment.total || fragment.payload.is_empty() {
        return Err(FragmentError::InvalidData);
    }
    Ok(())
}

/// `fragment` splits content into fragments no larger than `max_size`, including the fragment
/// envelope.
pub fn fragment(
    max_size: usize,
    version: Version,
    sender: InstanceTag,
    receiver: InstanceTag,
    content: &[u8],
) -> Result<Vec<Fragment>, OTRError> {
    let overhead = match version {
        Version::V2 => OTRV2_OVERHEAD,
        Version::V3 => OTRV3_OVERHEAD,
        Version::None | Version::Unsupported(_) => {
            panic!("BUG: fragmentation requires a supported protocol version")
        }
    };
    if max_size <= overhead {
        return Err(OTRError::FragmentSizeTooSmall);
    }
    let chunks = content.chunks(max_size - overhead);
    let total = u16::try_from(chunks.len()).or(Err(OTRError::TooManyFragments))?;
    Ok(chunks
        .zip(1..=total)
        .map(|(payload, part)| Fragment {
            version,
            sender,
            receiver,
            part,
            total,
            payload: payload.to_vec(),
        })
        .collect())
}

pub struct Fragment {
    pub version: Version,
    pub sender: InstanceTag,
    pub receiver: InstanceTag,
    part: u16,
    total: u16,
    payload: Vec<u8>,
}

impl Fragment {
    /// `follows` indicates whether this fragment is the continuation of the partial message.
    fn follows(&self, partial: &Partial) -> bool {
        self.version == partial.version
            && self.sender == partial.sender
            && self.receiver == partial.receiver
            && self.total == partial.total
            && self.part == partial.last + 1
    }
}

impl Debug for Fragment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fragment")
            .field("version", &self.version)
            .field("sender", &self.sender)
            .field("receiver", &self.receiver)
            .field("part", &self.part)
            .field("total", &self.total)
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .finish()
    }
}

impl OTREncodable for Fragment {
    fn encode(&self, encoder: &mut OTREncoder) {
        debug_assert!(verify(self).is_ok());
        // `k` and `n` are zero-padded to 5 digits, instance tags to 8 hexadecimal digits.
        let header = match self.version {
            Version::V2 => format!("?OTR,{:05},{:05},", self.part, self.total),
            Version::V3 => format!(
                "?OTR|{:08x}|{:08x},{:05},{:05},",
                self.sender, self.receiver, self.part, self.total
            ),
            Version::None | Version::Unsupported(_) => {
                panic!("BUG: fragment with unsupported protocol version")
            }
        };
        encoder
            .write(header.as_bytes())
            .write(&self.payload)
            .write(OTR_FRAGMENT_SUFFIX);
    }
}

/// `Partial` is a message of which the first `last` fragments have been received.
struct Partial {
    version: Version,
    sender: InstanceTag,
    receiver: InstanceTag,
    total: u16,
    last: u16,
    content: Vec<u8>,
}

/// `Assembler` reassembles fragments that arrive in order. A single message is assembled at a
/// time: any fragment that does not continue the partial message discards it.
pub struct Assembler {
    partial: Option<Partial>,
}

impl Assembler {
    pub fn new() -> Self {
        Self { partial: None }
    }

    /// `assemble` processes the next fragment. Returns the message once the final fragment
    /// arrives, `IncompleteResult` while more fragments are expected.
    pub fn assemble(&mut self, fragment: &Fragment) -> Result<Vec<u8>, FragmentError> {
        if let Err(err) = verify(fragment) {
            self.partial = None;
            return Err(err);
        }
        let mut partial = match self.partial.take() {
            _ if fragment.part == 1 => Partial {
                version: fragment.version,
                sender: fragment.sender,
                receiver: fragment.receiver,
                total: fragment.total,
                last: 0,
                content: Vec::new(),
            },
            Some(partial) if fragment.follows(&partial) => partial,
            Some(_) | None => {
                log::debug!("Fragment {}/{} out of sequence.", fragment.part, fragment.total);
                return Err(FragmentError::UnexpectedFragment);
            }
        };
        partial.last = fragment.part;
        partial.content.extend_from_slice(&fragment.payload);
        if partial.last == partial.total {
            return Ok(partial.content);
        }
        self.partial = Some(partial);
        Err(FragmentError::IncompleteResult)
    }

    /// `reset` discards the partial message, if any.
    pub fn reset(&mut self) {
        self.partial = None;
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FragmentError {
    /// Fragment numbering is invalid or the payload is empty.
    InvalidData,
    /// More fragments are needed to complete the message.
    IncompleteResult,
    /// Fragment does not continue the partial message. The partial message is discarded.
    UnexpectedFragment,
}
