// SPDX-License-Identifier: LGPL-3.0-only

use crate::{
    ake::CryptographicMaterial,
    crypto::dsa,
    encoding::{MessageFlags, TLV},
    instancetag::InstanceTag,
    keymanager::KeyManager,
    messages::{encode_payload, parse_payload, DataMessage, EncodedMessageType},
    smp::SMPContext,
    OTRError, ProtocolStatus, Version, SSID, TLV_TYPE_1_DISCONNECT,
};

/// `ProtocolState` is the message state of a session: plaintext, encrypted or finished.
pub trait ProtocolState {
    fn status(&self) -> ProtocolStatus;
    fn version(&self) -> Version;
    /// `handle` processes a received data message. The second element of the result is the state
    /// to transition to, if any.
    fn handle(
        &mut self,
        msg: &DataMessage,
    ) -> (Result<Received, OTRError>, Option<Box<dyn ProtocolState>>);
    fn secure(
        &self,
        material: CryptographicMaterial,
        our_instance: InstanceTag,
        their_instance: InstanceTag,
        our_fingerprint: dsa::Fingerprint,
    ) -> Box<EncryptedState> {
        Box::new(EncryptedState::new(
            material,
            our_instance,
            their_instance,
            our_fingerprint,
        ))
    }
    /// `finish` ends the protocol state, producing the disconnect message to send if the state was
    /// encrypted.
    fn finish(&mut self) -> (Option<EncodedMessageType>, Box<PlaintextState>);
    /// `prepare` produces the data message for the content and TLVs.
    fn prepare(
        &mut self,
        flags: MessageFlags,
        content: &[u8],
        tlvs: &[TLV],
    ) -> Result<EncodedMessageType, OTRError>;
    fn smp(&mut self) -> Result<&mut SMPContext, OTRError>;
    fn ssid(&self) -> Option<SSID>;
    fn their_fingerprint(&self) -> Option<dsa::Fingerprint>;
    /// `extra_key` is the extra symmetric key of the session used for sending.
    fn extra_key(&self) -> Result<[u8; 32], OTRError>;
}

/// `Received` is the content of a decrypted data message.
pub struct Received {
    pub content: Vec<u8>,
    pub tlvs: Vec<TLV>,
    /// `extra_key` is the extra symmetric key of the session the message was received on.
    pub extra_key: [u8; 32],
}

impl Drop for Received {
    fn drop(&mut self) {
        self.content.fill(0);
        self.extra_key.fill(0);
    }
}

pub fn new_state() -> Box<dyn ProtocolState> {
    Box::new(PlaintextState {})
}

pub struct PlaintextState {}

impl ProtocolState for PlaintextState {
    fn status(&self) -> ProtocolStatus {
        ProtocolStatus::Plaintext
    }

    fn version(&self) -> Version {
        Version::None
    }

    fn handle(
        &mut self,
        _msg: &DataMessage,
    ) -> (Result<Received, OTRError>, Option<Box<dyn ProtocolState>>) {
        (Err(OTRError::UnreadableMessage), None)
    }

    fn finish(&mut self) -> (Option<EncodedMessageType>, Box<PlaintextState>) {
        (None, Box::new(PlaintextState {}))
    }

    fn prepare(
        &mut self,
        _flags: MessageFlags,
        _content: &[u8],
        _tlvs: &[TLV],
    ) -> Result<EncodedMessageType, OTRError> {
        Err(OTRError::IncorrectState(
            "Encrypted messages can only be sent in encrypted state.",
        ))
    }

    fn smp(&mut self) -> Result<&mut SMPContext, OTRError> {
        Err(OTRError::IncorrectState(
            "SMP is only available in encrypted state.",
        ))
    }

    fn ssid(&self) -> Option<SSID> {
        None
    }

    fn their_fingerprint(&self) -> Option<dsa::Fingerprint> {
        None
    }

    fn extra_key(&self) -> Result<[u8; 32], OTRError> {
        Err(OTRError::IncorrectState(
            "Extra symmetric key is only available in encrypted state.",
        ))
    }
}

pub struct EncryptedState {
    version: Version,
    our_instance: InstanceTag,
    their_instance: InstanceTag,
    ssid: SSID,
    our_fingerprint: dsa::Fingerprint,
    their_dsa: dsa::PublicKey,
    keys: KeyManager,
    smp: Option<SMPContext>,
}

impl Drop for EncryptedState {
    fn drop(&mut self) {
        self.ssid.fill(0);
    }
}

impl EncryptedState {
    fn new(
        material: CryptographicMaterial,
        our_instance: InstanceTag,
        their_instance: InstanceTag,
        our_fingerprint: dsa::Fingerprint,
    ) -> Self {
        let CryptographicMaterial {
            version,
            ssid,
            our_dh,
            their_dh,
            their_keyid,
            their_dsa,
        } = material;
        Self {
            version,
            our_instance,
            their_instance,
            ssid,
            our_fingerprint,
            their_dsa,
            keys: KeyManager::new(our_dh, their_keyid, their_dh),
            smp: None,
        }
    }
}

impl ProtocolState for EncryptedState {
    fn status(&self) -> ProtocolStatus {
        ProtocolStatus::Encrypted
    }

    fn version(&self) -> Version {
        self.version
    }

    fn handle(
        &mut self,
        msg: &DataMessage,
    ) -> (Result<Received, OTRError>, Option<Box<dyn ProtocolState>>) {
        let mut opened =
            match self
                .keys
                .open(self.version, self.their_instance, self.our_instance, msg)
            {
                Ok(opened) => opened,
                Err(err) => return (Err(err), None),
            };
        let (content, tlvs) = parse_payload(&opened.plaintext);
        let received = Received {
            content,
            tlvs,
            extra_key: std::mem::take(&mut opened.extra_key),
        };
        if received.tlvs.iter().any(|tlv| tlv.0 == TLV_TYPE_1_DISCONNECT) {
            log::info!("Other party ended the encrypted session.");
            return (Ok(received), Some(Box::new(FinishedState {})));
        }
        (Ok(received), None)
    }

    fn finish(&mut self) -> (Option<EncodedMessageType>, Box<PlaintextState>) {
        let disconnect = self.prepare(
            MessageFlags::IGNORE_UNREADABLE,
            b"",
            &[TLV(TLV_TYPE_1_DISCONNECT, Vec::new())],
        );
        match disconnect {
            Ok(msg) => (Some(msg), Box::new(PlaintextState {})),
            Err(err) => {
                log::warn!("Failed to produce disconnect message: {err}");
                (None, Box::new(PlaintextState {}))
            }
        }
    }

    fn prepare(
        &mut self,
        flags: MessageFlags,
        content: &[u8],
        tlvs: &[TLV],
    ) -> Result<EncodedMessageType, OTRError> {
        let mut payload = encode_payload(content, tlvs)?;
        let result = self.keys.seal(
            self.version,
            self.our_instance,
            self.their_instance,
            flags,
            &payload,
        );
        payload.fill(0);
        Ok(EncodedMessageType::Data(result?))
    }

    fn smp(&mut self) -> Result<&mut SMPContext, OTRError> {
        let (ssid, ours, theirs) = (self.ssid, self.our_fingerprint, self.their_dsa.fingerprint());
        Ok(self
            .smp
            .get_or_insert_with(|| SMPContext::new(ssid, ours, theirs)))
    }

    fn ssid(&self) -> Option<SSID> {
        Some(self.ssid)
    }

    fn their_fingerprint(&self) -> Option<dsa::Fingerprint> {
        Some(self.their_dsa.fingerprint())
    }

    fn extra_key(&self) -> Result<[u8; 32], OTRError> {
        self.keys.sending_extra_key()
    }
}

/// `FinishedState` indicates that the other party ended the encrypted session. No messages can be
/// sent until the session is ended locally, or a new encrypted session is established.
pub struct FinishedState {}

impl ProtocolState for FinishedState {
    fn status(&self) -> ProtocolStatus {
        ProtocolStatus::Finished
    }

    fn version(&self) -> Version {
        Version::None
    }

    fn handle(
        &mut self,
        _msg: &DataMessage,
    ) -> (Result<Received, OTRError>, Option<Box<dyn ProtocolState>>) {
        (Err(OTRError::UnreadableMessage), None)
    }

    fn finish(&mut self) -> (Option<EncodedMessageType>, Box<PlaintextState>) {
        (None, Box::new(PlaintextState {}))
    }

    fn prepare(
        &mut self,
        _flags: MessageFlags,
        _content: &[u8],
        _tlvs: &[TLV],
    ) -> Result<EncodedMessageType, OTRError> {
        Err(OTRError::IncorrectState(
            "Session is finished. End the session before sending.",
        ))
    }

    fn smp(&mut self) -> Result<&mut SMPContext, OTRError> {
        Err(OTRError::IncorrectState(
            "SMP is only available in encrypted state.",
        ))
    }

    fn ssid(&self) -> Option<SSID> {
        None
    }

    fn their_fingerprint(&self) -> Option<dsa::Fingerprint> {
        None
    }

    fn extra_key(&self) -> Result<[u8; 32], OTRError> {
        Err(OTRError::IncorrectState(
            "Extra symmetric key is only available in encrypted state.",
        ))
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        crypto::{dh, dsa},
        encoding::{MessageFlags, TLV},
        messages::EncodedMessageType,
        ProtocolStatus, TLV_TYPE_1_DISCONNECT,
    };

    use super::{new_state, EncryptedState, ProtocolState};
    use crate::ake::CryptographicMaterial;

    fn keypair() -> dsa::Keypair {
        dsa::Keypair::generate_with(&dsa::TEST_PARAMETERS)
    }

    fn pair() -> (Box<EncryptedState>, Box<EncryptedState>) {
        let alice_dsa = keypair();
        let bob_dsa = keypair();
        let alice_dh = dh::Keypair::generate();
        let bob_dh = dh::Keypair::generate();
        let ssid = [7u8; 8];
        let (alice_public, bob_public) = (alice_dh.public.clone(), bob_dh.public.clone());
        let alice = new_state().secure(
            CryptographicMaterial {
                version: crate::Version::V3,
                ssid,
                our_dh: alice_dh,
                their_dh: bob_public,
                their_keyid: 1,
                their_dsa: bob_dsa.public_key(),
            },
            0x100,
            0x200,
            alice_dsa.public_key().fingerprint(),
        );
        let bob = new_state().secure(
            CryptographicMaterial {
                version: crate::Version::V3,
                ssid,
                our_dh: bob_dh,
                their_dh: alice_public,
                their_keyid: 1,
                their_dsa: alice_dsa.public_key(),
            },
            0x200,
            0x100,
            bob_dsa.public_key().fingerprint(),
        );
        (alice, bob)
    }

    fn data(msg: EncodedMessageType) -> crate::messages::DataMessage {
        match msg {
            EncodedMessageType::Data(msg) => msg,
            _ => panic!("Expected data message"),
        }
    }

    #[test]
    fn test_plaintext_state_refuses_encryption() {
        let mut state = new_state();
        assert_eq!(ProtocolStatus::Plaintext, state.status());
        assert!(state
            .prepare(MessageFlags::empty(), b"hello", &[])
            .is_err());
        assert!(state.smp().is_err());
        assert!(state.ssid().is_none());
    }

    #[test]
    fn test_encrypted_exchange_with_tlvs() {
        let (mut alice, mut bob) = pair();
        let msg = data(
            alice
                .prepare(
                    MessageFlags::empty(),
                    b"hello",
                    &[TLV(0, vec![0, 0, 0])],
                )
                .unwrap(),
        );
        let (result, transition) = bob.handle(&msg);
        assert!(transition.is_none());
        let received = result.unwrap();
        assert_eq!(b"hello".as_slice(), received.content.as_slice());
        assert_eq!(vec![TLV(0, vec![0, 0, 0])], received.tlvs);
        assert_eq!(alice.extra_key().unwrap(), received.extra_key);
    }

    #[test]
    fn test_disconnect_finishes_session() {
        let (mut alice, mut bob) = pair();
        let (disconnect, state) = alice.finish();
        assert_eq!(ProtocolStatus::Plaintext, state.status());
        let msg = data(disconnect.unwrap());
        assert!(msg.flags.contains(MessageFlags::IGNORE_UNREADABLE));
        let (result, transition) = bob.handle(&msg);
        let received = result.unwrap();
        assert!(received
            .tlvs
            .iter()
            .any(|tlv| tlv.0 == TLV_TYPE_1_DISCONNECT));
        let mut finished = transition.unwrap();
        assert_eq!(ProtocolStatus::Finished, finished.status());
        assert!(finished.prepare(MessageFlags::empty(), b"hi", &[]).is_err());
    }

    #[test]
    fn test_smp_context_created_lazily() {
        let (mut alice, _) = pair();
        assert!(!alice.smp().unwrap().in_progress());
        alice.smp().unwrap().initiate(b"secret", None).unwrap();
        assert!(alice.smp().unwrap().in_progress());
    }
}
