// SPDX-License-Identifier: LGPL-3.0-only

//! The authenticated key exchange (AKE) of OTR versions 2 and 3. The party that initiates sends a
//! commitment to its DH public key, the other party answers with its DH public key, after which
//! both parties reveal and authenticate their long-term identities.

use std::rc::Rc;

use num_bigint::BigUint;
use num_integer::Integer;

use crate::{
    crypto::{aes128, constant, dh, dsa, otr::AKESecrets, sha256, CryptoError},
    encoding::{OTRDecoder, OTREncodable, OTREncoder, MAC_LEN},
    messages::{EncodedMessageType, KeyID},
    utils, OTRError, Version, SSID,
};

/// `AKE_KEYID` is the key id used by both parties for the DH keypair established in the AKE.
const AKE_KEYID: KeyID = 1;

/// Counter value for the AES-CTR encryptions within the AKE.
const ZERO_CTR: [u8; 16] = [0u8; 16];

pub struct AKEContext {
    version: Version,
    keypair: Rc<dsa::Keypair>,
    state: AKEState,
}

impl AKEContext {
    pub fn new(keypair: Rc<dsa::Keypair>) -> Self {
        Self {
            version: Version::None,
            keypair,
            state: AKEState::None,
        }
    }

    /// `reset` abandons any AKE in progress.
    pub fn reset(&mut self) {
        self.state = AKEState::None;
    }

    /// `initiate` starts a new AKE, abandoning any AKE in progress. Returns the D-H Commit message.
    pub fn initiate(&mut self, version: Version) -> EncodedMessageType {
        log::info!("Initiating AKE for protocol version {version:?}.");
        let our_dh_keypair = Rc::new(dh::Keypair::generate());
        let r = aes128::Key::generate();
        let dhcommit = commitment(&our_dh_keypair, &r);
        self.version = version;
        self.state = AKEState::AwaitingDHKey(AwaitingDHKey { r, our_dh_keypair });
        EncodedMessageType::DHCommit(dhcommit)
    }

    /// `handle_dhcommit` answers a D-H Commit message with our D-H Key message. If we committed
    /// too, the larger commitment hash wins: the winner retransmits its D-H Commit message.
    pub fn handle_dhcommit(
        &mut self,
        version: Version,
        msg: DHCommitMessage,
    ) -> Result<EncodedMessageType, AKEError> {
        if let AKEState::AwaitingDHKey(state) = &self.state {
            let ours = commitment(&state.our_dh_keypair, &state.r);
            if BigUint::from_bytes_be(&ours.gx_hashed) > BigUint::from_bytes_be(&msg.gx_hashed) {
                log::debug!("Simultaneous AKE initiation: our commitment wins.");
                return Ok(EncodedMessageType::DHCommit(ours));
            }
            log::debug!("Simultaneous AKE initiation: their commitment wins.");
        }
        // A repeated D-H Commit gets the same D-H Key message as before.
        let our_dh_keypair = match &self.state {
            AKEState::AwaitingRevealSignature(state) => Rc::clone(&state.our_dh_keypair),
            _ => Rc::new(dh::Keypair::generate()),
        };
        let dhkey = DHKeyMessage {
            gy: our_dh_keypair.public.clone(),
        };
        self.version = version;
        self.state = AKEState::AwaitingRevealSignature(AwaitingRevealSignature {
            our_dh_keypair,
            gx_encrypted: msg.gx_encrypted,
            gx_hashed: msg.gx_hashed,
        });
        Ok(EncodedMessageType::DHKey(dhkey))
    }

    /// `handle_dhkey` answers the D-H Key message with the Reveal Signature message, revealing
    /// the key for our commitment together with our authenticated identity.
    pub fn handle_dhkey(&mut self, msg: DHKeyMessage) -> Result<EncodedMessageType, AKEError> {
        let state = match &self.state {
            AKEState::AwaitingDHKey(state) => state,
            AKEState::AwaitingSignature(state) if state.gy == msg.gy => {
                log::debug!("Repeated D-H Key message: retransmitting Reveal Signature message.");
                return Ok(EncodedMessageType::RevealSignature(
                    state.previous_message.clone(),
                ));
            }
            _ => return Err(AKEError::MessageIgnored),
        };
        dh::verify_public_key(&msg.gy).map_err(AKEError::CryptographicViolation)?;
        let s = state.our_dh_keypair.generate_shared_secret(&msg.gy);
        let secrets = derive_secrets(&s);
        let (signature_encrypted, signature_mac) = sign_identity(
            &self.keypair,
            &IdentityKeys::initiator(&secrets),
            &state.our_dh_keypair.public,
            &msg.gy,
        )?;
        let reveal = RevealSignatureMessage {
            key: state.r.clone(),
            signature_encrypted,
            signature_mac,
        };
        log::debug!("Identity signed, awaiting Signature message.");
        self.state = AKEState::AwaitingSignature(AwaitingSignature {
            our_dh_keypair: Rc::clone(&state.our_dh_keypair),
            gy: msg.gy,
            s,
            previous_message: reveal.clone(),
        });
        Ok(EncodedMessageType::RevealSignature(reveal))
    }

    /// `handle_reveal_signature` opens the commitment, authenticates the other party and answers
    /// with the Signature message. Completes the AKE for the responding party.
    pub fn handle_reveal_signature(
        &mut self,
        msg: RevealSignatureMessage,
    ) -> Result<(CryptographicMaterial, EncodedMessageType), AKEError> {
        let AKEState::AwaitingRevealSignature(state) = &self.state else {
            return Err(AKEError::MessageIgnored);
        };
        let gxmpi = msg.key.decrypt(&ZERO_CTR, &state.gx_encrypted);
        constant::verify_bytes(&sha256::digest(&gxmpi), &state.gx_hashed)
            .map_err(AKEError::CryptographicViolation)?;
        let gx = decode_committed_key(&gxmpi)?;
        dh::verify_public_key(&gx).map_err(AKEError::CryptographicViolation)?;
        log::debug!("Commitment opened and verified.");
        let secrets = derive_secrets(&state.our_dh_keypair.generate_shared_secret(&gx));
        let (their_dsa, their_keyid) = verify_identity(
            &IdentityKeys::initiator(&secrets),
            &gx,
            &state.our_dh_keypair.public,
            &msg.signature_encrypted,
            &msg.signature_mac,
        )?;
        let (signature_encrypted, signature_mac) = sign_identity(
            &self.keypair,
            &IdentityKeys::responder(&secrets),
            &state.our_dh_keypair.public,
            &gx,
        )?;
        let material = CryptographicMaterial {
            version: self.version,
            ssid: secrets.ssid,
            our_dh: (*state.our_dh_keypair).clone(),
            their_dh: gx,
            their_keyid,
            their_dsa,
        };
        self.state = AKEState::None;
        Ok((
            material,
            EncodedMessageType::Signature(SignatureMessage {
                signature_encrypted,
                signature_mac,
            }),
        ))
    }

    /// `handle_signature` authenticates the other party. Completes the AKE for the initiating
    /// party.
    pub fn handle_signature(
        &mut self,
        msg: SignatureMessage,
    ) -> Result<CryptographicMaterial, AKEError> {
        let AKEState::AwaitingSignature(state) = &self.state else {
            return Err(AKEError::MessageIgnored);
        };
        let secrets = derive_secrets(&state.s);
        let (their_dsa, their_keyid) = verify_identity(
            &IdentityKeys::responder(&secrets),
            &state.gy,
            &state.our_dh_keypair.public,
            &msg.signature_encrypted,
            &msg.signature_mac,
        )?;
        let material = CryptographicMaterial {
            version: self.version,
            ssid: secrets.ssid,
            our_dh: (*state.our_dh_keypair).clone(),
            their_dh: state.gy.clone(),
            their_keyid,
            their_dsa,
        };
        self.state = AKEState::None;
        Ok(material)
    }
}

/// `commitment` produces the D-H Commit message: our DH public key encrypted with `r`, and its
/// hash.
fn commitment(our_dh_keypair: &dh::Keypair, r: &aes128::Key) -> DHCommitMessage {
    let gxmpi = OTREncoder::new().write_mpi(&our_dh_keypair.public).to_vec();
    DHCommitMessage {
        gx_encrypted: r.encrypt(&ZERO_CTR, &gxmpi),
        gx_hashed: sha256::digest(&gxmpi).to_vec(),
    }
}

fn decode_committed_key(gxmpi: &[u8]) -> Result<BigUint, AKEError> {
    let mut decoder = OTRDecoder::new(gxmpi);
    let gx = decoder
        .read_mpi()
        .or(Err(AKEError::DataProcessing("Failed to read committed DH public key")))?;
    decoder
        .done()
        .or(Err(AKEError::DataProcessing("data left over in gxmpi")))?;
    Ok(gx)
}

fn derive_secrets(s: &dh::SharedSecret) -> AKESecrets {
    AKESecrets::derive(&OTREncoder::new().write_mpi(s).to_vec())
}

/// `IdentityKeys` are the keys that protect one party's identity: the party sending the Reveal
/// Signature message uses `c`, `m1`, `m2`, the party sending the Signature message uses the primed
/// keys.
struct IdentityKeys<'a> {
    encryption: &'a aes128::Key,
    signed_mac: &'a [u8; 32],
    encrypted_mac: &'a [u8; 32],
}

impl<'a> IdentityKeys<'a> {
    fn initiator(secrets: &'a AKESecrets) -> Self {
        Self {
            encryption: &secrets.c,
            signed_mac: &secrets.m1,
            encrypted_mac: &secrets.m2,
        }
    }

    fn responder(secrets: &'a AKESecrets) -> Self {
        Self {
            encryption: &secrets.cp,
            signed_mac: &secrets.m1p,
            encrypted_mac: &secrets.m2p,
        }
    }
}

/// `identity_mac` computes `M = MAC(signer DH, verifier DH, signer public key, signer keyid)`.
fn identity_mac(
    keys: &IdentityKeys,
    signer_dh: &BigUint,
    verifier_dh: &BigUint,
    public_key: &dsa::PublicKey,
    keyid: KeyID,
) -> [u8; 32] {
    sha256::hmac(
        keys.signed_mac,
        &OTREncoder::new()
            .write_mpi(signer_dh)
            .write_mpi(verifier_dh)
            .write_public_key(public_key)
            .write_u32(keyid)
            .to_vec(),
    )
}

fn encrypted_mac(keys: &IdentityKeys, encrypted: &[u8]) -> [u8; MAC_LEN] {
    sha256::hmac160(
        keys.encrypted_mac,
        &OTREncoder::new().write_data(encrypted).to_vec(),
    )
}

/// `sign_identity` signs our identity and returns it encrypted, together with its MAC.
fn sign_identity(
    keypair: &dsa::Keypair,
    keys: &IdentityKeys,
    our_dh: &BigUint,
    their_dh: &BigUint,
) -> Result<(Vec<u8>, [u8; MAC_LEN]), AKEError> {
    let public_key = keypair.public_key();
    let m = identity_mac(keys, our_dh, their_dh, &public_key, AKE_KEYID);
    let signature = keypair
        .sign(&prehash(&m, keypair.q()))
        .map_err(AKEError::CryptographicViolation)?;
    let x = OTREncoder::new()
        .write_public_key(&public_key)
        .write_u32(AKE_KEYID)
        .write_signature(&signature)
        .to_vec();
    let encrypted = keys.encryption.encrypt(&ZERO_CTR, &x);
    let mac = encrypted_mac(keys, &encrypted);
    Ok((encrypted, mac))
}

/// `verify_identity` checks the MAC of the encrypted identity, decrypts it and verifies the
/// signature. Returns the other party's public key and keyid.
fn verify_identity(
    keys: &IdentityKeys,
    their_dh: &BigUint,
    our_dh: &BigUint,
    encrypted: &[u8],
    mac: &[u8; MAC_LEN],
) -> Result<(dsa::PublicKey, KeyID), AKEError> {
    constant::verify_bytes(&encrypted_mac(keys, encrypted), mac)
        .map_err(AKEError::CryptographicViolation)?;
    let x = keys.encryption.decrypt(&ZERO_CTR, encrypted);
    let (public_key, keyid, signature) = decode_identity(&x)?;
    let m = identity_mac(keys, their_dh, our_dh, &public_key, keyid);
    public_key
        .verify(&signature, &prehash(&m, public_key.q()))
        .map_err(AKEError::CryptographicViolation)?;
    log::debug!("Identity of other party verified.");
    Ok((public_key, keyid))
}

/// `decode_identity` reads the decrypted identity: public key, keyid and signature.
fn decode_identity(x: &[u8]) -> Result<(dsa::PublicKey, KeyID, dsa::Signature), AKEError> {
    let mut decoder = OTRDecoder::new(x);
    let public_key = decoder
        .read_public_key()
        .or(Err(AKEError::DataProcessing("Failed to read public key")))?;
    let keyid = decoder
        .read_u32()
        .or(Err(AKEError::DataProcessing("Failed to read keyid")))?;
    utils::u32::verify_nonzero(keyid, AKEError::DataProcessing("keyid must be non-zero"))?;
    let signature = decoder
        .read_dsa_signature()
        .or(Err(AKEError::DataProcessing("Failed to read signature")))?;
    decoder
        .done()
        .or(Err(AKEError::DataProcessing("data left over in identity")))?;
    Ok((public_key, keyid, signature))
}

/// `prehash` reduces the 32-byte MAC modulo `q`. OTR signs this value directly, without
/// truncation or further hashing.
fn prehash(m: &[u8; 32], q: &BigUint) -> [u8; 20] {
    utils::biguint::to_bytes_be_fixed::<20>(&BigUint::from_bytes_be(m).mod_floor(q))
}

/// `CryptographicMaterial` is the result of a successful AKE.
pub struct CryptographicMaterial {
    pub version: Version,
    pub ssid: SSID,
    pub our_dh: dh::Keypair,
    pub their_dh: BigUint,
    pub their_keyid: KeyID,
    pub their_dsa: dsa::PublicKey,
}

enum AKEState {
    None,
    AwaitingDHKey(AwaitingDHKey),
    AwaitingRevealSignature(AwaitingRevealSignature),
    AwaitingSignature(AwaitingSignature),
}

struct AwaitingDHKey {
    r: aes128::Key,
    our_dh_keypair: Rc<dh::Keypair>,
}

struct AwaitingRevealSignature {
    our_dh_keypair: Rc<dh::Keypair>,
    gx_encrypted: Vec<u8>,
    gx_hashed: Vec<u8>,
}

struct AwaitingSignature {
    our_dh_keypair: Rc<dh::Keypair>,
    gy: BigUint,
    s: dh::SharedSecret,
    previous_message: RevealSignatureMessage,
}

pub struct DHCommitMessage {
    pub gx_encrypted: Vec<u8>,
    pub gx_hashed: Vec<u8>,
}

impl DHCommitMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<Self, OTRError> {
        let gx_encrypted = decoder.read_data()?;
        let gx_hashed = decoder.read_data()?;
        Ok(Self {
            gx_encrypted,
            gx_hashed,
        })
    }
}

impl OTREncodable for DHCommitMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_data(&self.gx_encrypted)
            .write_data(&self.gx_hashed);
    }
}

pub struct DHKeyMessage {
    pub gy: BigUint,
}

impl DHKeyMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<Self, OTRError> {
        decoder.read_mpi().map(|gy| Self { gy })
    }
}

impl OTREncodable for DHKeyMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder.write_mpi(&self.gy);
    }
}

#[derive(Clone)]
pub struct RevealSignatureMessage {
    pub key: aes128::Key,
    pub signature_encrypted: Vec<u8>,
    pub signature_mac: [u8; MAC_LEN],
}

impl Drop for RevealSignatureMessage {
    fn drop(&mut self) {
        self.signature_encrypted.fill(0);
        self.signature_mac.fill(0);
    }
}

impl RevealSignatureMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<Self, OTRError> {
        let key: [u8; 16] = decoder.read_data()?.try_into().or(Err(
            OTRError::ProtocolViolation("Revealed key is not a 128-bit AES key."),
        ))?;
        let signature_encrypted = decoder.read_data()?;
        let signature_mac = decoder.read_mac()?;
        Ok(Self {
            key: aes128::Key(key),
            signature_encrypted,
            signature_mac,
        })
    }
}

impl OTREncodable for RevealSignatureMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_data(&self.key.0)
            .write_data(&self.signature_encrypted)
            .write_mac(&self.signature_mac);
    }
}

pub struct SignatureMessage {
    pub signature_encrypted: Vec<u8>,
    pub signature_mac: [u8; MAC_LEN],
}

impl SignatureMessage {
    pub fn decode(decoder: &mut OTRDecoder) -> Result<Self, OTRError> {
        let signature_encrypted = decoder.read_data()?;
        let signature_mac = decoder.read_mac()?;
        Ok(Self {
            signature_encrypted,
            signature_mac,
        })
    }
}

impl OTREncodable for SignatureMessage {
    fn encode(&self, encoder: &mut OTREncoder) {
        encoder
            .write_data(&self.signature_encrypted)
            .write_mac(&self.signature_mac);
    }
}

/// `AKEError` contains the errors produced during the AKE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AKEError {
    /// A cryptographic check failed, e.g. a MAC, signature or DH public key.
    CryptographicViolation(CryptoError),
    /// The message is not expected in the current state and is ignored.
    MessageIgnored,
    /// Message content could not be read.
    DataProcessing(&'static str),
}
