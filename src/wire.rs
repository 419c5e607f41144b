// SPDX-License-Identifier: LGPL-3.0-only

use crate::{
    encoding::OTREncoder,
    fragment::{self, Assembler, FragmentError},
    instancetag::{InstanceTag, INSTANCE_ZERO},
    messages::{self, EncodedMessage, MessageType},
    OTRError, Version,
};

/// `Receiver` classifies incoming raw messages, reassembling fragmented messages on the way.
pub struct Receiver {
    assembler: Assembler,
}

impl Receiver {
    pub fn new() -> Self {
        Self {
            assembler: Assembler::new(),
        }
    }

    /// `receive` processes a raw message. `Ok(None)` indicates that a fragment was accepted, but
    /// the message is not yet complete, or the fragment was dropped.
    pub fn receive(
        &mut self,
        raw: &[u8],
        our_tag: InstanceTag,
    ) -> Result<Option<MessageType>, OTRError> {
        if !fragment::match_fragment(raw) {
            return messages::parse(raw).map(Some);
        }
        let Some(fragment) = fragment::parse(raw) else {
            log::warn!("Dropping malformed fragment.");
            self.assembler.reset();
            return Ok(None);
        };
        if fragment.version == Version::V3
            && fragment.receiver != INSTANCE_ZERO
            && fragment.receiver != our_tag
        {
            log::debug!("Ignoring fragment intended for other instance.");
            return Err(OTRError::MessageForOtherInstance);
        }
        match self.assembler.assemble(&fragment) {
            Ok(assembled) => {
                log::debug!("Fragmented message reassembled.");
                // Reassembled content is never processed as fragment again.
                if fragment::match_fragment(&assembled) {
                    log::warn!("Dropping reassembled message that is itself a fragment.");
                    return Ok(None);
                }
                messages::parse(&assembled).map(Some)
            }
            Err(FragmentError::IncompleteResult) => Ok(None),
            Err(err) => {
                log::warn!("Dropping unexpected fragment: {err:?}");
                Ok(None)
            }
        }
    }
}

/// `wrap` serializes the encoded message and, if `max_size` is non-zero and the message exceeds
/// it, fragments the serialized message.
pub fn wrap(message: EncodedMessage, max_size: usize) -> Result<Vec<Vec<u8>>, OTRError> {
    let (version, sender, receiver) = (message.version, message.sender, message.receiver);
    let content = messages::serialize_message(&MessageType::Encoded(message));
    if max_size == 0 || content.len() <= max_size {
        return Ok(vec![content]);
    }
    Ok(
        fragment::fragment(max_size, version, sender, receiver, &content)?
            .iter()
            .map(|f| OTREncoder::new().write_encodable(f).to_vec())
            .collect(),
    )
}
