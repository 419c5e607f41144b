// SPDX-License-Identifier: LGPL-3.0-only

use std::{
    collections::VecDeque,
    rc::Rc,
    time::{Duration, Instant},
};

use crate::{
    ake::{AKEContext, AKEError, CryptographicMaterial},
    crypto::dsa,
    encoding::{MessageFlags, OTREncoder, TLV},
    event::{Direction, Event, SMPEvent, Severity, Status},
    fragment::{OTRV2_OVERHEAD, OTRV3_OVERHEAD},
    instancetag::{self, InstanceTag, INSTANCE_ZERO},
    messages::{self, DataMessage, EncodedMessage, EncodedMessageType, MessageType},
    outbox::Outbox,
    protocol::{self, ProtocolState},
    smp::{self, SMPOutcome},
    utils, wire, OTRError, Policy, ProtocolStatus, Version, SSID, TLV_TYPE_1_DISCONNECT,
    TLV_TYPE_8_EXTRA_SYMMETRIC_KEY,
};

/// `GENERIC_ERROR` is sent to the other party instead of the detailed error, unless debugging.
const GENERIC_ERROR: &[u8] = b"An OTR error has occurred.";

/// `Config` contains the configuration for a session.
#[derive(Debug, Clone)]
pub struct Config {
    pub policy: Policy,
    /// `fragment_size` is the maximum size of a single transmitted message. Larger OTR-encoded
    /// messages are fragmented. `0` disables fragmentation.
    pub fragment_size: usize,
    /// `send_interval` is the minimum delay between transmissions.
    pub send_interval: Duration,
    /// `instance_tag` is our instance tag. A random tag is generated if absent.
    pub instance_tag: Option<InstanceTag>,
    /// `debug` sends detailed error messages to the other party.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: Policy::ALLOW_V2 | Policy::ALLOW_V3,
            fragment_size: 0,
            send_interval: Duration::ZERO,
            instance_tag: None,
            debug: false,
        }
    }
}

/// `Session` is a conversation with a single other party. All processing is synchronous: results
/// are queued as events (`poll_event`) and as messages for transmission (`transmit`).
pub struct Session {
    policy: Policy,
    fragment_size: usize,
    debug: bool,
    our_tag: InstanceTag,
    /// `their_tag` is the other party's instance tag, `INSTANCE_ZERO` until learned.
    their_tag: InstanceTag,
    keypair: Rc<dsa::Keypair>,
    receiver: wire::Receiver,
    ake: AKEContext,
    state: Box<dyn ProtocolState>,
    /// `stored` contains plaintext messages waiting for an encrypted session.
    stored: Vec<Vec<u8>>,
    /// `whitespace_tagging` indicates whether plaintext messages are tagged. Tagging stops once
    /// plaintext is received from the other party.
    whitespace_tagging: bool,
    events: VecDeque<Event>,
    outbox: Outbox,
}

impl Drop for Session {
    fn drop(&mut self) {
        for message in &mut self.stored {
            message.fill(0);
        }
    }
}

impl Session {
    /// `new` creates a session. The configuration is validated: at least one protocol version must
    /// be allowed, a configured instance tag must be valid and the fragment size must leave room
    /// for content.
    pub fn new(config: Config, keypair: Rc<dsa::Keypair>) -> Result<Self, OTRError> {
        if !config
            .policy
            .intersects(Policy::ALLOW_V2 | Policy::ALLOW_V3)
        {
            return Err(OTRError::PolicyRestriction(
                "At least one protocol version must be allowed.",
            ));
        }
        let our_tag = match config.instance_tag {
            Some(tag) => {
                instancetag::verify_own(tag).or(Err(OTRError::IllegalInstanceTag(tag)))?
            }
            None => instancetag::random_tag(),
        };
        let overhead = if config.policy.contains(Policy::ALLOW_V3) {
            OTRV3_OVERHEAD
        } else {
            OTRV2_OVERHEAD
        };
        if config.fragment_size > 0 && config.fragment_size <= overhead {
            return Err(OTRError::FragmentSizeTooSmall);
        }
        log::debug!("New session with instance tag {our_tag:#010x}");
        Ok(Self {
            policy: config.policy,
            fragment_size: config.fragment_size,
            debug: config.debug,
            our_tag,
            their_tag: INSTANCE_ZERO,
            ake: AKEContext::new(Rc::clone(&keypair)),
            keypair,
            receiver: wire::Receiver::new(),
            state: protocol::new_state(),
            stored: Vec::new(),
            whitespace_tagging: config.policy.contains(Policy::SEND_WHITESPACE_TAG),
            events: VecDeque::new(),
            outbox: Outbox::new(config.send_interval),
        })
    }

    pub fn status(&self) -> ProtocolStatus {
        self.state.status()
    }

    pub fn instance_tag(&self) -> InstanceTag {
        self.our_tag
    }

    /// `fingerprint` is the fingerprint of our long-term public key.
    pub fn fingerprint(&self) -> dsa::Fingerprint {
        self.keypair.public_key().fingerprint()
    }

    /// `their_fingerprint` is the fingerprint of the other party's long-term public key, as
    /// authenticated in the current encrypted session.
    pub fn their_fingerprint(&self) -> Option<dsa::Fingerprint> {
        self.state.their_fingerprint()
    }

    pub fn ssid(&self) -> Option<SSID> {
        self.state.ssid()
    }

    pub fn poll_event(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// `transmit` releases the next message for transmission, if the send interval allows.
    pub fn transmit(&mut self, now: Instant) -> Option<Vec<u8>> {
        self.outbox.poll(now)
    }

    /// `next_transmit` returns the earliest moment at which `transmit` releases a message.
    pub fn next_transmit(&self, now: Instant) -> Option<Instant> {
        self.outbox.next_deadline(now)
    }

    /// `receive` processes a message received from the other party. Malformed input is dropped.
    pub fn receive(&mut self, raw: &[u8]) {
        let message = match self.receiver.receive(raw, self.our_tag) {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(OTRError::MessageForOtherInstance) => {
                log::debug!("Ignoring message for other instance.");
                return;
            }
            Err(err) => {
                log::warn!("Dropping unreadable message: {err}");
                return;
            }
        };
        match message {
            MessageType::Error(error) => {
                log::info!("Received OTR error message.");
                self.push_error(Severity::Error, OTRError::PeerError(error));
                if self.policy.contains(Policy::ERROR_START_AKE) {
                    self.send_query();
                }
            }
            MessageType::Plaintext(content) => self.handle_plaintext(content),
            MessageType::Tagged(versions, content) => {
                if !content.is_empty() {
                    self.handle_plaintext(content);
                }
                if self.policy.contains(Policy::WHITESPACE_START_AKE) {
                    match self.select_version(&versions) {
                        Ok(version) => self.start_ake(version),
                        Err(err) => log::debug!("Whitespace tag ignored: {err}"),
                    }
                }
            }
            MessageType::Query(versions) => match self.select_version(&versions) {
                Ok(version) => self.start_ake(version),
                Err(err) => {
                    log::info!("Query message ignored: {err}");
                    self.push_error(Severity::Warn, err);
                }
            },
            MessageType::Encoded(message) => self.handle_encoded(message),
        }
    }

    /// `send` sends a message to the other party. The message is encrypted if an encrypted
    /// session is established.
    pub fn send(&mut self, content: &[u8]) -> Result<(), OTRError> {
        let content = utils::bytes::drop_by_value(content, 0);
        match self.state.status() {
            ProtocolStatus::Plaintext => {
                if self.policy.contains(Policy::REQUIRE_ENCRYPTION) {
                    log::info!("Encryption required: storing message and querying for OTR.");
                    let first = self.stored.is_empty();
                    self.stored.push(content);
                    if first {
                        self.send_query();
                    }
                    return Ok(());
                }
                let message = if self.whitespace_tagging {
                    MessageType::Tagged(self.allowed_versions(), content)
                } else {
                    MessageType::Plaintext(content)
                };
                self.outbox.push(messages::serialize_message(&message));
                Ok(())
            }
            ProtocolStatus::Encrypted => {
                let message = self.state.prepare(MessageFlags::empty(), &content, &[])?;
                self.send_encoded(self.state.version(), message)
            }
            ProtocolStatus::Finished => {
                self.stored.push(content);
                Err(OTRError::IncorrectState(
                    "The other party ended the encrypted session. End the session first.",
                ))
            }
        }
    }

    /// `send_query` sends a query message offering all allowed protocol versions.
    pub fn send_query(&mut self) {
        let query = MessageType::Query(self.allowed_versions());
        self.outbox.push(messages::serialize_message(&query));
        self.events.push_back(Event::Status(Status::SendQuery));
    }

    /// `initiate_ake` starts the AKE with the most preferred allowed protocol version.
    pub fn initiate_ake(&mut self) {
        let version = if self.policy.contains(Policy::ALLOW_V3) {
            Version::V3
        } else {
            Version::V2
        };
        self.start_ake(version);
    }

    /// `end` ends the encrypted session. If encrypted, the other party is notified.
    pub fn end(&mut self) -> Result<(), OTRError> {
        let previous = self.state.status();
        let version = self.state.version();
        let (disconnect, state) = self.state.finish();
        self.state = state;
        self.ake.reset();
        if previous != ProtocolStatus::Plaintext {
            log::info!("Ending session.");
            self.events.push_back(Event::Status(Status::EndOtr));
        }
        match disconnect {
            Some(message) => self.send_encoded(version, message),
            None => Ok(()),
        }
    }

    /// `smp_secret` provides our secret for SMP. If the other party initiated SMP, this answers
    /// the question. Otherwise, a new exchange is initiated, aborting any exchange in progress.
    pub fn smp_secret(&mut self, secret: &[u8], question: Option<&[u8]>) -> Result<(), OTRError> {
        let smp = self.state.smp()?;
        let aborted = !smp.awaiting_secret() && smp.in_progress();
        let tlvs = if smp.awaiting_secret() {
            vec![smp.respond(secret)?]
        } else if aborted {
            smp::verify_question(question)?;
            let abort = smp.abort();
            vec![abort, smp.initiate(secret, question)?]
        } else {
            vec![smp.initiate(secret, question)?]
        };
        self.send_tlvs(tlvs)?;
        if aborted {
            self.events.push_back(Event::Smp(SMPEvent::Abort));
        }
        Ok(())
    }

    pub fn smp_abort(&mut self) -> Result<(), OTRError> {
        let tlv = self.state.smp()?.abort();
        self.send_tlvs(vec![tlv])?;
        self.events.push_back(Event::Smp(SMPEvent::Abort));
        Ok(())
    }

    /// `send_extra_symmetric_key` announces use of the extra symmetric key to the other party. The
    /// key is delivered in a `File` event.
    pub fn send_extra_symmetric_key(&mut self, usage: u32, usedata: &[u8]) -> Result<(), OTRError> {
        let key = self.state.extra_key()?;
        let tlv = TLV(
            TLV_TYPE_8_EXTRA_SYMMETRIC_KEY,
            OTREncoder::new().write_u32(usage).write(usedata).to_vec(),
        );
        self.send_tlvs(vec![tlv])?;
        self.events.push_back(Event::File {
            direction: Direction::Send,
            key,
            usage,
            usedata: usedata.to_vec(),
        });
        Ok(())
    }

    fn allowed_versions(&self) -> Vec<Version> {
        let mut versions = Vec::new();
        if self.policy.contains(Policy::ALLOW_V2) {
            versions.push(Version::V2);
        }
        if self.policy.contains(Policy::ALLOW_V3) {
            versions.push(Version::V3);
        }
        versions
    }

    fn select_version(&self, versions: &[Version]) -> Result<Version, OTRError> {
        if versions.contains(&Version::V3) && self.policy.contains(Policy::ALLOW_V3) {
            Ok(Version::V3)
        } else if versions.contains(&Version::V2) && self.policy.contains(Policy::ALLOW_V2) {
            Ok(Version::V2)
        } else {
            Err(OTRError::NoAcceptableVersion)
        }
    }

    fn version_allowed(&self, version: Version) -> bool {
        match version {
            Version::V2 => self.policy.contains(Policy::ALLOW_V2),
            Version::V3 => self.policy.contains(Policy::ALLOW_V3),
            Version::None | Version::Unsupported(_) => false,
        }
    }

    fn start_ake(&mut self, version: Version) {
        let message = self.ake.initiate(version);
        self.events.push_back(Event::Status(Status::AkeInit));
        if let Err(err) = self.send_encoded(version, message) {
            self.push_error(Severity::Error, err);
        }
    }

    fn handle_plaintext(&mut self, content: Vec<u8>) {
        self.whitespace_tagging = false;
        let unexpected = self.state.status() != ProtocolStatus::Plaintext
            || self.policy.contains(Policy::REQUIRE_ENCRYPTION);
        self.events.push_back(Event::Ui {
            message: content,
            encrypted: false,
        });
        if unexpected {
            log::warn!("Received unencrypted message.");
            self.push_error(Severity::Warn, OTRError::UnencryptedMessage);
        }
    }

    fn handle_encoded(&mut self, message: EncodedMessage) {
        if !self.version_allowed(message.version) {
            log::info!("Dropping message: protocol version {:?} not allowed.", message.version);
            return;
        }
        if message.version == Version::V3 && !self.accept_instance(&message) {
            return;
        }
        if let EncodedMessageType::Data(msg) = &message.message {
            self.handle_data(msg);
            return;
        }
        match self.handle_ake(message.version, message.message) {
            Ok(()) => {}
            Err(OTRError::AuthenticationError(AKEError::MessageIgnored)) => {
                log::debug!("AKE message ignored.");
            }
            Err(err) => {
                log::info!("AKE failed: {err}");
                self.push_error(Severity::Error, err);
            }
        }
    }

    fn handle_ake(&mut self, version: Version, message: EncodedMessageType) -> Result<(), OTRError> {
        match message {
            EncodedMessageType::DHCommit(msg) => {
                let reply = self
                    .ake
                    .handle_dhcommit(version, msg)
                    .map_err(OTRError::AuthenticationError)?;
                self.send_encoded(version, reply)
            }
            EncodedMessageType::DHKey(msg) => {
                let reply = self
                    .ake
                    .handle_dhkey(msg)
                    .map_err(OTRError::AuthenticationError)?;
                self.send_encoded(version, reply)
            }
            EncodedMessageType::RevealSignature(msg) => {
                let (material, reply) = self
                    .ake
                    .handle_reveal_signature(msg)
                    .map_err(OTRError::AuthenticationError)?;
                // The signature message precedes any stored messages.
                self.send_encoded(version, reply)?;
                self.secure(material)
            }
            EncodedMessageType::Signature(msg) => {
                let material = self
                    .ake
                    .handle_signature(msg)
                    .map_err(OTRError::AuthenticationError)?;
                self.secure(material)
            }
            EncodedMessageType::Data(_) => panic!("BUG: data messages are not part of the AKE"),
        }
    }

    /// `accept_instance` verifies the instance tags of a v3 message, learning the other party's
    /// instance tag if not yet known.
    fn accept_instance(&mut self, message: &EncodedMessage) -> bool {
        if instancetag::verify_own(message.sender).is_err() {
            log::warn!("Dropping message with illegal sender tag {:#x}", message.sender);
            return false;
        }
        if message.receiver == INSTANCE_ZERO {
            if !matches!(message.message, EncodedMessageType::DHCommit(_)) {
                log::debug!("Dropping message without receiver tag.");
                return false;
            }
        } else if message.receiver != self.our_tag {
            log::debug!("Ignoring message for other instance.");
            return false;
        }
        if message.sender == self.their_tag {
            return true;
        }
        let restart = matches!(message.message, EncodedMessageType::DHCommit(_))
            && self.state.status() != ProtocolStatus::Encrypted;
        if self.their_tag == INSTANCE_ZERO || restart {
            log::debug!("Other party's instance tag: {:#010x}", message.sender);
            self.their_tag = message.sender;
            true
        } else {
            log::debug!("Ignoring message from other instance {:#x}", message.sender);
            false
        }
    }

    fn secure(&mut self, material: CryptographicMaterial) -> Result<(), OTRError> {
        let (our_tag, their_tag) = if material.version == Version::V3 {
            (self.our_tag, self.their_tag)
        } else {
            (INSTANCE_ZERO, INSTANCE_ZERO)
        };
        let fingerprint = self.fingerprint();
        self.state = self.state.secure(material, our_tag, their_tag, fingerprint);
        self.whitespace_tagging = false;
        log::info!("AKE completed: session is encrypted.");
        self.events.push_back(Event::Status(Status::AkeSuccess));
        let mut failure = None;
        for mut content in std::mem::take(&mut self.stored) {
            let result = self
                .state
                .prepare(MessageFlags::empty(), &content, &[])
                .and_then(|message| self.send_encoded(self.state.version(), message));
            content.fill(0);
            if let Err(err) = result {
                log::warn!("Failed to send stored message: {err}");
                failure.get_or_insert(err);
            }
        }
        failure.map_or(Ok(()), Err)
    }

    fn handle_data(&mut self, msg: &DataMessage) {
        let (result, transition) = self.state.handle(msg);
        if let Some(transition) = transition {
            self.state = transition;
        }
        let mut received = match result {
            Ok(received) => received,
            Err(err) => {
                if msg.flags.contains(MessageFlags::IGNORE_UNREADABLE) {
                    log::debug!("Ignoring unreadable message: {err}");
                    return;
                }
                log::info!("Unreadable data message: {err}");
                self.send_error(&err);
                self.push_error(Severity::Error, err);
                return;
            }
        };
        if !received.content.is_empty() {
            self.events.push_back(Event::Ui {
                message: std::mem::take(&mut received.content),
                encrypted: true,
            });
        }
        for tlv in &received.tlvs {
            match tlv.0 {
                TLV_TYPE_1_DISCONNECT => {
                    self.events.push_back(Event::Status(Status::EndOtr));
                }
                TLV_TYPE_8_EXTRA_SYMMETRIC_KEY => {
                    if tlv.1.len() < 4 {
                        log::warn!("Dropping extra symmetric key TLV without usage.");
                        continue;
                    }
                    let (usage, usedata) = tlv.1.split_at(4);
                    self.events.push_back(Event::File {
                        direction: Direction::Receive,
                        key: received.extra_key,
                        usage: u32::from_be_bytes([usage[0], usage[1], usage[2], usage[3]]),
                        usedata: usedata.to_vec(),
                    });
                }
                _ if smp::is_smp_tlv(tlv) => self.handle_smp(tlv),
                _ => log::trace!("Ignoring TLV of type {}", tlv.0),
            }
        }
    }

    fn handle_smp(&mut self, tlv: &TLV) {
        let outcome = match self.state.smp() {
            Ok(smp) => smp.handle(tlv),
            Err(err) => {
                log::info!("Ignoring SMP message: {err}");
                return;
            }
        };
        let (reply, event) = match outcome {
            SMPOutcome::Question(question) => (None, Some(SMPEvent::Question(question))),
            SMPOutcome::Reply(reply) => (Some(reply), None),
            SMPOutcome::Finished {
                trusted,
                role,
                reply,
            } => (reply, Some(SMPEvent::Trust { trusted, role })),
            SMPOutcome::Aborted(reply) => (reply, Some(SMPEvent::Abort)),
        };
        if let Some(reply) = reply {
            if let Err(err) = self.send_tlvs(vec![reply]) {
                self.push_error(Severity::Error, err);
            }
        }
        if let Some(event) = event {
            self.events.push_back(Event::Smp(event));
        }
    }

    fn send_tlvs(&mut self, tlvs: Vec<TLV>) -> Result<(), OTRError> {
        let message = self
            .state
            .prepare(MessageFlags::IGNORE_UNREADABLE, b"", &tlvs)?;
        self.send_encoded(self.state.version(), message)
    }

    fn send_encoded(&mut self, version: Version, message: EncodedMessageType) -> Result<(), OTRError> {
        let (sender, receiver) = if version == Version::V3 {
            (self.our_tag, self.their_tag)
        } else {
            (INSTANCE_ZERO, INSTANCE_ZERO)
        };
        let pieces = wire::wrap(
            EncodedMessage {
                version,
                sender,
                receiver,
                message,
            },
            self.fragment_size,
        )?;
        for piece in pieces {
            self.outbox.push(piece);
        }
        Ok(())
    }

    /// `send_error` sends an OTR error message. The details are only disclosed when debugging.
    fn send_error(&mut self, err: &OTRError) {
        let mut text = b" ".to_vec();
        if self.debug {
            text.extend_from_slice(err.to_string().as_bytes());
        } else {
            text.extend_from_slice(GENERIC_ERROR);
        }
        self.outbox
            .push(messages::serialize_message(&MessageType::Error(text)));
    }

    fn push_error(&mut self, severity: Severity, error: OTRError) {
        self.events.push_back(Event::Error { severity, error });
    }
}

#[cfg(test)]
mod tests {
    use std::{rc::Rc, time::Instant};

    use crate::{
        crypto::dsa,
        event::{Direction, Event, SMPEvent, Severity, Status},
        smp::SMPRole,
        OTRError, Policy, ProtocolStatus,
    };

    use super::{Config, Session};

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn session(config: Config) -> Session {
        let keypair = dsa::Keypair::generate_with(&dsa::TEST_PARAMETERS);
        Session::new(config, Rc::new(keypair)).unwrap()
    }

    fn with_policy(policy: Policy) -> Config {
        Config {
            policy,
            ..Config::default()
        }
    }

    /// `converse` delivers messages in both directions until both parties are silent.
    fn converse(a: &mut Session, b: &mut Session) {
        loop {
            let mut delivered = false;
            while let Some(message) = a.transmit(Instant::now()) {
                b.receive(&message);
                delivered = true;
            }
            while let Some(message) = b.transmit(Instant::now()) {
                a.receive(&message);
                delivered = true;
            }
            if !delivered {
                break;
            }
        }
    }

    fn drain(s: &mut Session) -> Vec<Event> {
        std::iter::from_fn(|| s.poll_event()).collect()
    }

    fn established() -> (Session, Session) {
        init();
        let mut alice = session(Config::default());
        let mut bob = session(Config::default());
        alice.initiate_ake();
        converse(&mut alice, &mut bob);
        assert_eq!(ProtocolStatus::Encrypted, alice.status());
        assert_eq!(ProtocolStatus::Encrypted, bob.status());
        drain(&mut alice);
        drain(&mut bob);
        (alice, bob)
    }

    fn ui(message: &[u8], encrypted: bool) -> Event {
        Event::Ui {
            message: message.to_vec(),
            encrypted,
        }
    }

    #[test]
    fn test_ake_and_encrypted_hello() {
        init();
        let mut alice = session(Config::default());
        let mut bob = session(Config::default());
        alice.initiate_ake();
        converse(&mut alice, &mut bob);
        assert_eq!(ProtocolStatus::Encrypted, alice.status());
        assert_eq!(ProtocolStatus::Encrypted, bob.status());
        assert!(alice.ssid().is_some());
        assert_eq!(alice.ssid(), bob.ssid());
        assert_eq!(Some(bob.fingerprint()), alice.their_fingerprint());
        assert_eq!(Some(alice.fingerprint()), bob.their_fingerprint());
        assert!(drain(&mut alice).contains(&Event::Status(Status::AkeSuccess)));
        assert!(drain(&mut bob).contains(&Event::Status(Status::AkeSuccess)));

        alice.send(b"hello").unwrap();
        converse(&mut alice, &mut bob);
        assert_eq!(vec![ui(b"hello", true)], drain(&mut bob));
    }

    #[test]
    fn test_conversation_with_key_rotation() {
        let (mut alice, mut bob) = established();
        for i in 0..5u8 {
            alice.send(&[b'a', b'0' + i]).unwrap();
            converse(&mut alice, &mut bob);
            assert_eq!(vec![ui(&[b'a', b'0' + i], true)], drain(&mut bob));
            bob.send(&[b'b', b'0' + i]).unwrap();
            converse(&mut alice, &mut bob);
            assert_eq!(vec![ui(&[b'b', b'0' + i], true)], drain(&mut alice));
        }
    }

    #[test]
    fn test_query_starts_ake() {
        init();
        let mut alice = session(Config::default());
        let mut bob = session(with_policy(Policy::ALLOW_V2));
        alice.send_query();
        assert_eq!(vec![Event::Status(Status::SendQuery)], drain(&mut alice));
        converse(&mut alice, &mut bob);
        assert_eq!(ProtocolStatus::Encrypted, alice.status());
        assert_eq!(ProtocolStatus::Encrypted, bob.status());
        assert_eq!(alice.ssid(), bob.ssid());
        alice.send(b"over version 2").unwrap();
        converse(&mut alice, &mut bob);
        assert!(drain(&mut bob).contains(&ui(b"over version 2", true)));
    }

    #[test]
    fn test_simultaneous_initiation() {
        init();
        let mut alice = session(Config::default());
        let mut bob = session(Config::default());
        alice.initiate_ake();
        bob.initiate_ake();
        let alice_commit = alice.transmit(Instant::now()).unwrap();
        let bob_commit = bob.transmit(Instant::now()).unwrap();
        alice.receive(&bob_commit);
        bob.receive(&alice_commit);
        converse(&mut alice, &mut bob);
        assert_eq!(ProtocolStatus::Encrypted, alice.status());
        assert_eq!(ProtocolStatus::Encrypted, bob.status());
        assert_eq!(alice.ssid(), bob.ssid());
    }

    #[test]
    fn test_replayed_message_rejected() {
        let (mut alice, mut bob) = established();
        alice.send(b"hello").unwrap();
        let message = alice.transmit(Instant::now()).unwrap();
        bob.receive(&message);
        assert_eq!(vec![ui(b"hello", true)], drain(&mut bob));
        bob.receive(&message);
        assert_eq!(
            vec![Event::Error {
                severity: Severity::Error,
                error: OTRError::CounterReplay,
            }],
            drain(&mut bob)
        );
        let reply = bob.transmit(Instant::now()).unwrap();
        assert_eq!(b"?OTR Error: An OTR error has occurred.".to_vec(), reply);
    }

    #[test]
    fn test_detailed_error_when_debugging() {
        init();
        let mut alice = session(Config::default());
        let mut bob = session(Config {
            debug: true,
            ..Config::default()
        });
        alice.initiate_ake();
        converse(&mut alice, &mut bob);
        alice.send(b"hello").unwrap();
        let message = alice.transmit(Instant::now()).unwrap();
        bob.receive(&message);
        bob.receive(&message);
        let reply = bob.transmit(Instant::now()).unwrap();
        assert!(reply.starts_with(b"?OTR Error: counter must be strictly increasing"));
        alice.receive(&reply);
        assert!(matches!(
            drain(&mut alice).last(),
            Some(Event::Error {
                error: OTRError::PeerError(_),
                ..
            })
        ));
    }

    #[test]
    fn test_old_keys_rejected() {
        let (mut alice, mut bob) = established();
        alice.send(b"delayed").unwrap();
        let delayed = alice.transmit(Instant::now()).unwrap();
        alice.send(b"first").unwrap();
        converse(&mut alice, &mut bob);
        bob.send(b"second").unwrap();
        converse(&mut alice, &mut bob);
        alice.send(b"third").unwrap();
        converse(&mut alice, &mut bob);
        drain(&mut bob);
        bob.receive(&delayed);
        assert_eq!(
            vec![Event::Error {
                severity: Severity::Error,
                error: OTRError::NotLatestKeys,
            }],
            drain(&mut bob)
        );
    }

    #[test]
    fn test_fragmented_conversation() {
        init();
        let config = Config {
            fragment_size: 100,
            ..Config::default()
        };
        let mut alice = session(config.clone());
        let mut bob = session(config);
        alice.initiate_ake();
        let mut pieces = 0;
        while let Some(message) = alice.transmit(Instant::now()) {
            assert!(message.len() <= 100);
            assert!(message.starts_with(b"?OTR|"));
            bob.receive(&message);
            pieces += 1;
        }
        assert!(pieces > 1);
        converse(&mut alice, &mut bob);
        assert_eq!(ProtocolStatus::Encrypted, bob.status());
        alice.send(b"hello in pieces").unwrap();
        converse(&mut alice, &mut bob);
        assert!(drain(&mut bob).contains(&ui(b"hello in pieces", true)));
    }

    #[test]
    fn test_end_session() {
        let (mut alice, mut bob) = established();
        alice.end().unwrap();
        assert_eq!(ProtocolStatus::Plaintext, alice.status());
        assert_eq!(vec![Event::Status(Status::EndOtr)], drain(&mut alice));
        converse(&mut alice, &mut bob);
        assert_eq!(ProtocolStatus::Finished, bob.status());
        assert_eq!(vec![Event::Status(Status::EndOtr)], drain(&mut bob));
        assert!(matches!(
            bob.send(b"anyone there?"),
            Err(OTRError::IncorrectState(_))
        ));
        bob.end().unwrap();
        assert_eq!(ProtocolStatus::Plaintext, bob.status());
        assert!(bob.transmit(Instant::now()).is_none());
    }

    #[test]
    fn test_data_message_while_plaintext() {
        let (mut alice, mut bob) = established();
        bob.end().unwrap();
        assert!(bob.transmit(Instant::now()).is_some());
        drain(&mut bob);
        alice.send(b"hello").unwrap();
        let message = alice.transmit(Instant::now()).unwrap();
        bob.receive(&message);
        assert_eq!(
            vec![Event::Error {
                severity: Severity::Error,
                error: OTRError::UnreadableMessage,
            }],
            drain(&mut bob)
        );
        assert!(bob
            .transmit(Instant::now())
            .unwrap()
            .starts_with(b"?OTR Error:"));
    }

    #[test]
    fn test_smp_through_sessions() {
        let (mut alice, mut bob) = established();
        alice
            .smp_secret(b"the answer", Some(b"What is the answer?"))
            .unwrap();
        converse(&mut alice, &mut bob);
        assert_eq!(
            vec![Event::Smp(SMPEvent::Question(Some(
                b"What is the answer?".to_vec()
            )))],
            drain(&mut bob)
        );
        bob.smp_secret(b"the answer", None).unwrap();
        converse(&mut alice, &mut bob);
        assert_eq!(
            vec![Event::Smp(SMPEvent::Trust {
                trusted: true,
                role: SMPRole::Answered,
            })],
            drain(&mut bob)
        );
        assert_eq!(
            vec![Event::Smp(SMPEvent::Trust {
                trusted: true,
                role: SMPRole::Asked,
            })],
            drain(&mut alice)
        );
    }

    #[test]
    fn test_smp_mismatched_secrets() {
        let (mut alice, mut bob) = established();
        alice.smp_secret(b"Nightwish", None).unwrap();
        converse(&mut alice, &mut bob);
        assert_eq!(
            vec![Event::Smp(SMPEvent::Question(None))],
            drain(&mut bob)
        );
        bob.smp_secret(b"DragonForce", None).unwrap();
        converse(&mut alice, &mut bob);
        assert!(drain(&mut bob).contains(&Event::Smp(SMPEvent::Trust {
            trusted: false,
            role: SMPRole::Answered,
        })));
        assert!(drain(&mut alice).contains(&Event::Smp(SMPEvent::Trust {
            trusted: false,
            role: SMPRole::Asked,
        })));
    }

    #[test]
    fn test_smp_abort() {
        let (mut alice, mut bob) = established();
        alice.smp_secret(b"secret", None).unwrap();
        converse(&mut alice, &mut bob);
        drain(&mut bob);
        alice.smp_abort().unwrap();
        assert_eq!(vec![Event::Smp(SMPEvent::Abort)], drain(&mut alice));
        converse(&mut alice, &mut bob);
        assert_eq!(vec![Event::Smp(SMPEvent::Abort)], drain(&mut bob));
        // A fresh exchange succeeds after the abort.
        alice.smp_secret(b"secret", None).unwrap();
        converse(&mut alice, &mut bob);
        bob.smp_secret(b"secret", None).unwrap();
        converse(&mut alice, &mut bob);
        assert!(drain(&mut alice).contains(&Event::Smp(SMPEvent::Trust {
            trusted: true,
            role: SMPRole::Asked,
        })));
    }

    #[test]
    fn test_smp_requires_encryption() {
        init();
        let mut alice = session(Config::default());
        assert!(matches!(
            alice.smp_secret(b"secret", None),
            Err(OTRError::IncorrectState(_))
        ));
        assert!(alice.smp_abort().is_err());
    }

    #[test]
    fn test_extra_symmetric_key() {
        let (mut alice, mut bob) = established();
        alice.send_extra_symmetric_key(1, b"file.txt").unwrap();
        converse(&mut alice, &mut bob);
        let sent = drain(&mut alice);
        let received = drain(&mut bob);
        let (
            [Event::File {
                direction: Direction::Send,
                key: sent_key,
                usage: 1,
                usedata: sent_data,
            }],
            [Event::File {
                direction: Direction::Receive,
                key: received_key,
                usage: 1,
                usedata: received_data,
            }],
        ) = (sent.as_slice(), received.as_slice())
        else {
            panic!("Expected file events, got {sent:?} and {received:?}");
        };
        assert_eq!(sent_key, received_key);
        assert_eq!(b"file.txt".as_slice(), sent_data.as_slice());
        assert_eq!(sent_data, received_data);
    }

    #[test]
    fn test_require_encryption_stores_message() {
        init();
        let mut alice = session(with_policy(
            Policy::ALLOW_V3 | Policy::REQUIRE_ENCRYPTION,
        ));
        let mut bob = session(Config::default());
        alice.send(b"confidential").unwrap();
        assert_eq!(vec![Event::Status(Status::SendQuery)], drain(&mut alice));
        converse(&mut alice, &mut bob);
        assert_eq!(ProtocolStatus::Encrypted, alice.status());
        assert!(drain(&mut bob).contains(&ui(b"confidential", true)));
    }

    #[test]
    fn test_plaintext_while_encrypted_warns() {
        let (_, mut bob) = established();
        bob.receive(b"psst, not encrypted");
        assert_eq!(
            vec![
                ui(b"psst, not encrypted", false),
                Event::Error {
                    severity: Severity::Warn,
                    error: OTRError::UnencryptedMessage,
                },
            ],
            drain(&mut bob)
        );
    }

    #[test]
    fn test_whitespace_tag_starts_ake() {
        init();
        let mut alice = session(with_policy(
            Policy::ALLOW_V2 | Policy::ALLOW_V3 | Policy::SEND_WHITESPACE_TAG,
        ));
        let mut bob = session(with_policy(
            Policy::ALLOW_V3 | Policy::WHITESPACE_START_AKE,
        ));
        alice.send(b"hi").unwrap();
        let tagged = alice.transmit(Instant::now()).unwrap();
        assert!(tagged.starts_with(b"hi \t  \t\t\t\t \t \t \t  "));
        bob.receive(&tagged);
        assert!(drain(&mut bob).contains(&ui(b"hi", false)));
        converse(&mut alice, &mut bob);
        assert_eq!(ProtocolStatus::Encrypted, alice.status());
        assert_eq!(ProtocolStatus::Encrypted, bob.status());
    }

    #[test]
    fn test_error_message_starts_ake() {
        init();
        let mut alice = session(with_policy(
            Policy::ALLOW_V3 | Policy::ERROR_START_AKE,
        ));
        let mut bob = session(Config::default());
        alice.receive(b"?OTR Error: You are not using OTR.");
        assert_eq!(
            vec![
                Event::Error {
                    severity: Severity::Error,
                    error: OTRError::PeerError(b" You are not using OTR.".to_vec()),
                },
                Event::Status(Status::SendQuery),
            ],
            drain(&mut alice)
        );
        converse(&mut alice, &mut bob);
        assert_eq!(ProtocolStatus::Encrypted, bob.status());
    }

    #[test]
    fn test_message_for_other_instance_ignored() {
        init();
        let mut alice = session(Config::default());
        let mut bob = session(Config::default());
        let mut carol = session(Config::default());
        alice.initiate_ake();
        converse(&mut alice, &mut bob);
        alice.send(b"for bob").unwrap();
        let message = alice.transmit(Instant::now()).unwrap();
        carol.receive(&message);
        assert!(drain(&mut carol).is_empty());
        assert!(carol.transmit(Instant::now()).is_none());
    }

    #[test]
    fn test_config_validation() {
        init();
        let keypair = Rc::new(dsa::Keypair::generate_with(&dsa::TEST_PARAMETERS));
        assert!(matches!(
            Session::new(with_policy(Policy::REQUIRE_ENCRYPTION), Rc::clone(&keypair)),
            Err(OTRError::PolicyRestriction(_))
        ));
        assert!(matches!(
            Session::new(
                Config {
                    instance_tag: Some(0x42),
                    ..Config::default()
                },
                Rc::clone(&keypair)
            ),
            Err(OTRError::IllegalInstanceTag(0x42))
        ));
        assert!(matches!(
            Session::new(
                Config {
                    fragment_size: 36,
                    ..Config::default()
                },
                Rc::clone(&keypair)
            ),
            Err(OTRError::FragmentSizeTooSmall)
        ));
        let session = Session::new(
            Config {
                policy: Policy::ALLOW_V2,
                fragment_size: 20,
                instance_tag: Some(0x1234),
                ..Config::default()
            },
            keypair,
        )
        .unwrap();
        assert_eq!(0x1234, session.instance_tag());
    }

    #[test]
    fn test_send_interval_paces_transmission() {
        init();
        let mut alice = session(Config {
            send_interval: std::time::Duration::from_millis(500),
            ..Config::default()
        });
        alice.send(b"one").unwrap();
        alice.send(b"two").unwrap();
        let now = Instant::now();
        assert_eq!(Some(b"one".to_vec()), alice.transmit(now));
        assert_eq!(None, alice.transmit(now));
        let next = alice.next_transmit(now).unwrap();
        assert!(next > now);
        assert_eq!(Some(b"two".to_vec()), alice.transmit(next));
    }

    #[test]
    fn test_oversized_extra_symmetric_key_rejected() {
        let (mut alice, _) = established();
        assert_eq!(
            Err(OTRError::TLVTooLong(70_004)),
            alice.send_extra_symmetric_key(1, &vec![0u8; 70_000])
        );
        assert!(drain(&mut alice).is_empty());
        assert_eq!(None, alice.transmit(Instant::now()));
    }

    #[test]
    fn test_oversized_smp_question_rejected() {
        let (mut alice, mut bob) = established();
        let question = vec![b'q'; 70_000];
        assert!(matches!(
            alice.smp_secret(b"secret", Some(&question)),
            Err(OTRError::TLVTooLong(_))
        ));
        assert_eq!(None, alice.transmit(Instant::now()));
        // An exchange in progress survives a rejected restart.
        alice.smp_secret(b"secret", None).unwrap();
        converse(&mut alice, &mut bob);
        assert_eq!(vec![Event::Smp(SMPEvent::Question(None))], drain(&mut bob));
        assert!(matches!(
            alice.smp_secret(b"other", Some(&question)),
            Err(OTRError::TLVTooLong(_))
        ));
        assert!(drain(&mut alice).is_empty());
        assert_eq!(None, alice.transmit(Instant::now()));
        bob.smp_secret(b"secret", None).unwrap();
        converse(&mut alice, &mut bob);
        assert!(drain(&mut alice).contains(&Event::Smp(SMPEvent::Trust {
            trusted: true,
            role: SMPRole::Asked,
        })));
    }

    #[test]
    fn test_smp_restart_reports_abort() {
        let (mut alice, mut bob) = established();
        alice.smp_secret(b"first", None).unwrap();
        converse(&mut alice, &mut bob);
        drain(&mut bob);
        alice.smp_secret(b"second", None).unwrap();
        assert_eq!(vec![Event::Smp(SMPEvent::Abort)], drain(&mut alice));
        converse(&mut alice, &mut bob);
        let events = drain(&mut bob);
        assert!(events.contains(&Event::Smp(SMPEvent::Abort)));
        assert!(events.contains(&Event::Smp(SMPEvent::Question(None))));
    }

    #[test]
    fn test_stored_messages_flushed_despite_failure() {
        init();
        let mut alice = session(Config {
            policy: Policy::ALLOW_V3 | Policy::REQUIRE_ENCRYPTION,
            fragment_size: 37,
            ..Config::default()
        });
        let mut bob = session(Config::default());
        // Too large to be sent in single-byte fragments.
        alice.send(&vec![b'x'; 60_000]).unwrap();
        alice.send(b"small").unwrap();
        converse(&mut alice, &mut bob);
        assert_eq!(ProtocolStatus::Encrypted, alice.status());
        assert!(drain(&mut alice).contains(&Event::Error {
            severity: Severity::Error,
            error: OTRError::TooManyFragments,
        }));
        assert!(drain(&mut bob).contains(&ui(b"small", true)));
    }

    #[test]
    fn test_query_without_acceptable_version() {
        init();
        let mut bob = session(with_policy(Policy::ALLOW_V2));
        bob.receive(b"?OTRv3?");
        assert_eq!(
            vec![Event::Error {
                severity: Severity::Warn,
                error: OTRError::NoAcceptableVersion,
            }],
            drain(&mut bob)
        );
        assert_eq!(None, bob.transmit(Instant::now()));
    }
}
