// SPDX-License-Identifier: LGPL-3.0-only

use num_bigint::BigUint;

use crate::{
    crypto::{constant, dh, otr::DataSecrets, sha1},
    encoding::{MessageFlags, CTR_LEN, MAC_LEN},
    instancetag::InstanceTag,
    messages::{encode_authenticator_data, DataMessage, KeyID},
    OTRError, Version,
};

/// `NUM_KEYS` is the number of keys per party that are maintained before rotating away and
/// forgetting them forever.
const NUM_KEYS: usize = 2;

/// `KeyManager` maintains both our keypairs and received public keys from the other party, and
/// the DH sessions derived from every pairing of these keys.
///
/// Our keypairs: `our_keyid` identifies our most recent keypair, which is advertised as `next_dh`
/// but not yet acknowledged by the other party. `our_keyid - 1` is our previous keypair, which is
/// used for sending.
///
/// Their public keys: `their_keyid` identifies their most recent public key, `their_keyid - 1`
/// their previous public key, if known.
pub struct KeyManager {
    our_keyid: KeyID,
    our_current: dh::Keypair,
    our_previous: dh::Keypair,
    their_keyid: KeyID,
    their_current: BigUint,
    their_previous: Option<BigUint>,
    /// `sessions` is indexed by `[our_keyid % 2][their_keyid % 2]`.
    sessions: [[Option<DHSession>; NUM_KEYS]; NUM_KEYS],
    /// `old_mac_keys` are used receiving MAC keys that are retired and ready to be revealed.
    old_mac_keys: Vec<u8>,
}

impl Drop for KeyManager {
    fn drop(&mut self) {
        self.old_mac_keys.fill(0);
    }
}

impl KeyManager {
    /// `new` creates the key manager from the keys established in the AKE. The AKE keypair is
    /// registered as our previous keypair (keyid 1) and a fresh keypair is generated for keyid 2.
    pub fn new(ake_keypair: dh::Keypair, their_keyid: KeyID, their_public: BigUint) -> Self {
        assert_ne!(0, their_keyid);
        let mut manager = Self {
            our_keyid: 2,
            our_current: dh::Keypair::generate(),
            our_previous: ake_keypair,
            their_keyid,
            their_current: their_public,
            their_previous: None,
            sessions: [[None, None], [None, None]],
            old_mac_keys: Vec::new(),
        };
        manager.install(manager.our_keyid, manager.their_keyid);
        manager.install(manager.our_keyid - 1, manager.their_keyid);
        manager
    }

    /// `seal` encrypts and authenticates the payload, producing the data message to send.
    pub fn seal(
        &mut self,
        version: Version,
        sender: InstanceTag,
        receiver: InstanceTag,
        flags: MessageFlags,
        plaintext: &[u8],
    ) -> Result<DataMessage, OTRError> {
        let our_keyid = self.our_keyid - 1;
        let their_keyid = self.their_keyid;
        let next_dh = self.our_current.public.clone();
        let session = self.session_mut(our_keyid, their_keyid)?;
        // OTRv3 protocol, specifically about top-8-bytes CTR value in Data Message:
        // "This should monotonically increase (as a big-endian value) for
        // each message sent with the same (sender keyid, recipient keyid)
        // pair, and must not be all 0x00."
        let ctr = session
            .send_ctr
            .checked_add(1)
            .ok_or(OTRError::RekeyRequired)?;
        session.send_ctr = ctr;
        let ctr = ctr.to_be_bytes();
        let encrypted = session
            .secrets
            .sending_aes
            .encrypt(&nonce(&ctr), plaintext);
        let mut message = DataMessage {
            flags,
            sender_keyid: our_keyid,
            receiver_keyid: their_keyid,
            dh_y: next_dh,
            ctr,
            encrypted,
            authenticator: [0u8; MAC_LEN],
            revealed: Vec::new(),
        };
        message.authenticator = sha1::hmac(
            &session.secrets.sending_mac,
            &encode_authenticator_data(version, sender, receiver, &message),
        );
        message.revealed = std::mem::take(&mut self.old_mac_keys);
        Ok(message)
    }

    /// `open` verifies and decrypts a received data message. All verification happens before any
    /// state is modified. Upon success, keys are rotated as acknowledged by the message.
    pub fn open(
        &mut self,
        version: Version,
        sender: InstanceTag,
        receiver: InstanceTag,
        message: &DataMessage,
    ) -> Result<Opened, OTRError> {
        let recipient_keyid = message.receiver_keyid;
        let sender_keyid = message.sender_keyid;
        if recipient_keyid != self.our_keyid && recipient_keyid != self.our_keyid - 1 {
            return Err(OTRError::NotLatestKeys);
        }
        if sender_keyid != self.their_keyid
            && (self.their_previous.is_none() || sender_keyid != self.their_keyid - 1)
        {
            return Err(OTRError::NotLatestKeys);
        }
        let session = self.session_mut(recipient_keyid, sender_keyid)?;
        let ctr = u64::from_be_bytes(message.ctr);
        if ctr <= session.recv_ctr {
            return Err(OTRError::CounterReplay);
        }
        let authenticator = sha1::hmac(
            &session.secrets.receiving_mac,
            &encode_authenticator_data(version, sender, receiver, message),
        );
        constant::verify_bytes(&authenticator, &message.authenticator)
            .map_err(OTRError::CryptographicViolation)?;
        dh::verify_public_key(&message.dh_y).map_err(OTRError::CryptographicViolation)?;
        let rotate_ours = recipient_keyid == self.our_keyid;
        let rotate_theirs = sender_keyid == self.their_keyid;
        if (rotate_ours && self.our_keyid == KeyID::MAX)
            || (rotate_theirs && self.their_keyid == KeyID::MAX)
        {
            return Err(OTRError::ProtocolViolation("key ids exhausted"));
        }
        let session = self.session_mut(recipient_keyid, sender_keyid)?;
        let plaintext = session
            .secrets
            .receiving_aes
            .decrypt(&nonce(&message.ctr), &message.encrypted);
        session.recv_ctr = ctr;
        session.recv_mac_used = true;
        let extra_key = session.secrets.extra_symmetric_key;
        if rotate_ours {
            self.rotate_ours();
        }
        if rotate_theirs {
            self.rotate_theirs(message.dh_y.clone());
        }
        Ok(Opened {
            plaintext,
            extra_key,
        })
    }

    /// `sending_extra_key` is the extra symmetric key of the session that is used for sending.
    pub fn sending_extra_key(&self) -> Result<[u8; 32], OTRError> {
        let session = self.sessions[slot(self.our_keyid - 1)][slot(self.their_keyid)]
            .as_ref()
            .ok_or(OTRError::NotLatestKeys)?;
        Ok(session.secrets.extra_symmetric_key)
    }

    fn rotate_ours(&mut self) {
        self.our_keyid += 1;
        log::debug!("Rotating our DH keypair: new keyid {}", self.our_keyid);
        self.our_previous = std::mem::replace(&mut self.our_current, dh::Keypair::generate());
        self.install(self.our_keyid, self.their_keyid);
        if self.their_previous.is_some() {
            self.install(self.our_keyid, self.their_keyid - 1);
        }
    }

    fn rotate_theirs(&mut self, next: BigUint) {
        self.their_keyid += 1;
        log::debug!("Rotating their DH public key: new keyid {}", self.their_keyid);
        self.their_previous = Some(std::mem::replace(&mut self.their_current, next));
        self.install(self.our_keyid, self.their_keyid);
        self.install(self.our_keyid - 1, self.their_keyid);
    }

    /// `install` derives the session for the specified pairing of keys. If a session is replaced
    /// of which the receiving MAC key was used, that MAC key is scheduled for revealing.
    fn install(&mut self, our_keyid: KeyID, their_keyid: KeyID) {
        let ours = if our_keyid == self.our_keyid {
            &self.our_current
        } else {
            &self.our_previous
        };
        let theirs = if their_keyid == self.their_keyid {
            &self.their_current
        } else {
            self.their_previous
                .as_ref()
                .expect("BUG: previous public key must be known to install session")
        };
        let secrets = DataSecrets::derive(ours, theirs);
        let replaced = self.sessions[slot(our_keyid)][slot(their_keyid)].replace(DHSession {
            our_keyid,
            their_keyid,
            secrets,
            send_ctr: 0,
            recv_ctr: 0,
            recv_mac_used: false,
        });
        if let Some(old) = replaced {
            if old.recv_mac_used {
                self.old_mac_keys
                    .extend_from_slice(&old.secrets.receiving_mac);
            }
        }
    }

    fn session_mut(
        &mut self,
        our_keyid: KeyID,
        their_keyid: KeyID,
    ) -> Result<&mut DHSession, OTRError> {
        match &mut self.sessions[slot(our_keyid)][slot(their_keyid)] {
            Some(session)
                if session.our_keyid == our_keyid && session.their_keyid == their_keyid =>
            {
                Ok(session)
            }
            _ => Err(OTRError::NotLatestKeys),
        }
    }
}

fn slot(keyid: KeyID) -> usize {
    keyid as usize % NUM_KEYS
}

/// `nonce` constructs the full counter value: the top half transmitted in the message, the bottom
/// half all zeroes.
fn nonce(ctr: &[u8; CTR_LEN]) -> [u8; 16] {
    let mut nonce = [0u8; 16];
    nonce[..CTR_LEN].copy_from_slice(ctr);
    nonce
}

pub struct Opened {
    pub plaintext: Vec<u8>,
    pub extra_key: [u8; 32],
}

impl Drop for Opened {
    fn drop(&mut self) {
        self.plaintext.fill(0);
        self.extra_key.fill(0);
    }
}

/// `DHSession` is the derived key material for one pairing of our keypair and their public key.
struct DHSession {
    our_keyid: KeyID,
    their_keyid: KeyID,
    secrets: DataSecrets,
    send_ctr: u64,
    recv_ctr: u64,
    recv_mac_used: bool,
}

impl Drop for DHSession {
    fn drop(&mut self) {
        self.send_ctr = 0;
        self.recv_ctr = 0;
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        crypto::dh,
        crypto::sha1,
        encoding::{MessageFlags, MAC_LEN},
        messages::{encode_authenticator_data, DataMessage, KeyID},
        OTRError, Version,
    };

    use super::{nonce, slot, KeyManager};

    const ALICE_TAG: u32 = 0x100;
    const BOB_TAG: u32 = 0x200;

    fn managers() -> (KeyManager, KeyManager) {
        let alice = dh::Keypair::generate();
        let bob = dh::Keypair::generate();
        let alice_public = alice.public.clone();
        let bob_public = bob.public.clone();
        (
            KeyManager::new(alice, 1, bob_public),
            KeyManager::new(bob, 1, alice_public),
        )
    }

    fn alice_to_bob(alice: &mut KeyManager, content: &[u8]) -> DataMessage {
        alice
            .seal(
                Version::V3,
                ALICE_TAG,
                BOB_TAG,
                MessageFlags::empty(),
                content,
            )
            .unwrap()
    }

    fn bob_to_alice(bob: &mut KeyManager, content: &[u8]) -> DataMessage {
        bob.seal(Version::V3, BOB_TAG, ALICE_TAG, MessageFlags::empty(), content)
            .unwrap()
    }

    fn bob_opens(bob: &mut KeyManager, msg: &DataMessage) -> Result<Vec<u8>, OTRError> {
        bob.open(Version::V3, ALICE_TAG, BOB_TAG, msg)
            .map(|opened| opened.plaintext.clone())
    }

    fn alice_opens(alice: &mut KeyManager, msg: &DataMessage) -> Result<Vec<u8>, OTRError> {
        alice
            .open(Version::V3, BOB_TAG, ALICE_TAG, msg)
            .map(|opened| opened.plaintext.clone())
    }

    #[test]
    fn test_conversation_with_rotation() {
        let (mut alice, mut bob) = managers();
        for i in 0..5u8 {
            let msg = alice_to_bob(&mut alice, &[b'a', i]);
            assert_eq!(vec![b'a', i], bob_opens(&mut bob, &msg).unwrap());
            let msg = bob_to_alice(&mut bob, &[b'b', i]);
            assert_eq!(vec![b'b', i], alice_opens(&mut alice, &msg).unwrap());
        }
        assert!(alice.our_keyid > 2);
        assert!(bob.our_keyid > 2);
    }

    #[test]
    fn test_extra_symmetric_key_agreement() {
        let (mut alice, mut bob) = managers();
        let expected = alice.sending_extra_key().unwrap();
        let msg = alice_to_bob(&mut alice, b"file");
        let opened = bob.open(Version::V3, ALICE_TAG, BOB_TAG, &msg).unwrap();
        assert_eq!(expected, opened.extra_key);
    }

    #[test]
    fn test_replay_rejected() {
        let (mut alice, mut bob) = managers();
        let msg = alice_to_bob(&mut alice, b"hello");
        assert_eq!(b"hello".to_vec(), bob_opens(&mut bob, &msg).unwrap());
        assert_eq!(Err(OTRError::CounterReplay), bob_opens(&mut bob, &msg));
    }

    #[test]
    fn test_counter_gaps_accepted() {
        let (mut alice, mut bob) = managers();
        let m1 = alice_to_bob(&mut alice, b"1");
        let m2 = alice_to_bob(&mut alice, b"2");
        let m3 = alice_to_bob(&mut alice, b"3");
        assert_eq!(b"1".to_vec(), bob_opens(&mut bob, &m1).unwrap());
        assert_eq!(b"3".to_vec(), bob_opens(&mut bob, &m3).unwrap());
        assert_eq!(Err(OTRError::CounterReplay), bob_opens(&mut bob, &m2));
    }

    #[test]
    fn test_bad_mac_leaves_state_untouched() {
        let (mut alice, mut bob) = managers();
        let msg = alice_to_bob(&mut alice, b"hello");
        let mut tampered = msg.clone();
        tampered.encrypted[0] ^= 0xff;
        assert!(matches!(
            bob_opens(&mut bob, &tampered),
            Err(OTRError::CryptographicViolation(_))
        ));
        let mut tampered = msg.clone();
        tampered.authenticator = [0u8; MAC_LEN];
        assert!(matches!(
            bob_opens(&mut bob, &tampered),
            Err(OTRError::CryptographicViolation(_))
        ));
        assert_eq!(b"hello".to_vec(), bob_opens(&mut bob, &msg).unwrap());
    }

    #[test]
    fn test_old_keys_rejected() {
        let (mut alice, mut bob) = managers();
        let early = alice_to_bob(&mut alice, b"early");
        for _ in 0..3 {
            let msg = alice_to_bob(&mut alice, b"ping");
            bob_opens(&mut bob, &msg).unwrap();
            let msg = bob_to_alice(&mut bob, b"pong");
            alice_opens(&mut alice, &msg).unwrap();
        }
        assert_eq!(1, early.sender_keyid);
        assert!(bob.their_keyid > 2);
        assert_eq!(Err(OTRError::NotLatestKeys), bob_opens(&mut bob, &early));
    }

    #[test]
    fn test_old_mac_keys_revealed() {
        let (mut alice, mut bob) = managers();
        for _ in 0..3 {
            let msg = alice_to_bob(&mut alice, b"ping");
            bob_opens(&mut bob, &msg).unwrap();
            let msg = bob_to_alice(&mut bob, b"pong");
            alice_opens(&mut alice, &msg).unwrap();
        }
        let msg = alice_to_bob(&mut alice, b"reveal");
        assert!(!msg.revealed.is_empty());
        assert_eq!(0, msg.revealed.len() % MAC_LEN);
        let msg = alice_to_bob(&mut alice, b"nothing left");
        assert!(msg.revealed.is_empty());
    }

    #[test]
    fn test_unknown_recipient_keyid() {
        let (mut alice, mut bob) = managers();
        let mut msg = alice_to_bob(&mut alice, b"hello");
        msg.receiver_keyid = 5;
        assert_eq!(Err(OTRError::NotLatestKeys), bob_opens(&mut bob, &msg));
    }

    #[test]
    fn test_exhausted_send_counter_requires_rekey() {
        let (mut alice, _) = managers();
        alice.sessions[slot(1)][slot(1)].as_mut().unwrap().send_ctr = u64::MAX;
        let result = alice.seal(
            Version::V3,
            ALICE_TAG,
            BOB_TAG,
            MessageFlags::empty(),
            b"hello",
        );
        assert!(matches!(result, Err(OTRError::RekeyRequired)));
        assert_eq!(
            u64::MAX,
            alice.sessions[slot(1)][slot(1)].as_ref().unwrap().send_ctr
        );
    }

    #[test]
    fn test_exhausted_key_ids_leave_state_untouched() {
        let alice = dh::Keypair::generate();
        let bob = dh::Keypair::generate();
        let mut bob = KeyManager::new(bob, KeyID::MAX, alice.public.clone());
        let session = bob.sessions[slot(1)][slot(KeyID::MAX)].as_ref().unwrap();
        let ctr = 1u64.to_be_bytes();
        let mut msg = DataMessage {
            flags: MessageFlags::empty(),
            sender_keyid: KeyID::MAX,
            receiver_keyid: 1,
            dh_y: dh::Keypair::generate().public.clone(),
            ctr,
            encrypted: session.secrets.receiving_aes.encrypt(&nonce(&ctr), b"hello"),
            authenticator: [0u8; MAC_LEN],
            revealed: Vec::new(),
        };
        msg.authenticator = sha1::hmac(
            &session.secrets.receiving_mac,
            &encode_authenticator_data(Version::V3, ALICE_TAG, BOB_TAG, &msg),
        );
        assert_eq!(
            Err(OTRError::ProtocolViolation("key ids exhausted")),
            bob_opens(&mut bob, &msg)
        );
        assert_eq!(KeyID::MAX, bob.their_keyid);
        assert_eq!(2, bob.our_keyid);
        let session = bob.sessions[slot(1)][slot(KeyID::MAX)].as_ref().unwrap();
        assert_eq!(0, session.recv_ctr);
        assert!(!session.recv_mac_used);
    }
}
