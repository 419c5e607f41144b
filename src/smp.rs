// SPDX-License-Identifier: LGPL-3.0-only

use num_bigint::BigUint;
use num_integer::Integer;
use zeroize::Zeroize;

use crate::{
    crypto::{constant, dh, dsa, sha256},
    encoding::{OTRDecoder, OTREncoder, TLV},
    utils, OTRError, TLVType, SSID,
};

const TLV_SMP_MESSAGE_1: TLVType = 2;
const TLV_SMP_MESSAGE_2: TLVType = 3;
const TLV_SMP_MESSAGE_3: TLVType = 4;
const TLV_SMP_MESSAGE_4: TLVType = 5;
const TLV_SMP_ABORT: TLVType = 6;
/// `TLV_SMP_MESSAGE_1Q` is SMP message 1 preceded by a null-terminated user-specified question.
const TLV_SMP_MESSAGE_1Q: TLVType = 7;

/// Random exponents are 1536 bits, same size as the modulus.
const EXPONENT_LENGTH: usize = 192;

const SMP_SECRET_VERSION: u8 = 1;

/// `MAX_QUESTION_LEN` leaves room in TLV 7 for the NUL-terminator and six MPIs of at most
/// `EXPONENT_LENGTH` bytes each.
const MAX_QUESTION_LEN: usize = u16::MAX as usize - 1 - 4 - 6 * (4 + EXPONENT_LENGTH);

/// `verify_question` checks that the question fits in SMP message 1 together with the MPIs.
pub fn verify_question(question: Option<&[u8]>) -> Result<(), OTRError> {
    match question {
        Some(question) if question.len() > MAX_QUESTION_LEN => {
            Err(OTRError::TLVTooLong(question.len()))
        }
        _ => Ok(()),
    }
}

pub fn is_smp_tlv(tlv: &TLV) -> bool {
    tlv.0 == TLV_SMP_MESSAGE_1
        || tlv.0 == TLV_SMP_MESSAGE_1Q
        || tlv.0 == TLV_SMP_MESSAGE_2
        || tlv.0 == TLV_SMP_MESSAGE_3
        || tlv.0 == TLV_SMP_MESSAGE_4
        || tlv.0 == TLV_SMP_ABORT
}

/// `SMPContext` is the state of the Socialist Millionaire's Protocol for one encrypted session.
pub struct SMPContext {
    state: State,
    ssid: SSID,
    our_fp: dsa::Fingerprint,
    their_fp: dsa::Fingerprint,
}

impl Drop for SMPContext {
    fn drop(&mut self) {
        self.ssid.fill(0);
        self.our_fp.fill(0);
        self.their_fp.fill(0);
    }
}

/// `SMPOutcome` is the result of processing an SMP TLV.
#[derive(Debug)]
pub enum SMPOutcome {
    /// The peer initiated SMP. The secret is to be provided through `respond`.
    Question(Option<Vec<u8>>),
    /// Intermediate step, the TLV is to be sent to the peer.
    Reply(TLV),
    Finished {
        trusted: bool,
        role: SMPRole,
        reply: Option<TLV>,
    },
    /// SMP was aborted. If present, the abort TLV must be sent to the peer.
    Aborted(Option<TLV>),
}

/// `SMPRole` indicates our side in a completed SMP exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SMPRole {
    /// We asked the question, i.e. we initiated the exchange.
    Asked,
    /// We answered.
    Answered,
}

impl SMPRole {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Asked => "asked",
            Self::Answered => "answered",
        }
    }
}

#[allow(non_snake_case)]
impl SMPContext {
    pub fn new(ssid: SSID, our_fp: dsa::Fingerprint, their_fp: dsa::Fingerprint) -> Self {
        Self {
            state: State::Expect1,
            ssid,
            our_fp,
            their_fp,
        }
    }

    pub fn in_progress(&self) -> bool {
        !matches!(self.state, State::Expect1)
    }

    pub fn awaiting_secret(&self) -> bool {
        matches!(self.state, State::AwaitingSecret { .. })
    }

    /// `initiate` starts a new SMP exchange, optionally accompanied by a question for the peer.
    pub fn initiate(&mut self, secret: &[u8], question: Option<&[u8]>) -> Result<TLV, OTRError> {
        if self.in_progress() {
            return Err(OTRError::SMPInProgress);
        }
        verify_question(question)?;
        log::debug!("Initiating SMP.");
        let g = &*dh::GENERATOR;
        let p = &*dh::MODULUS;
        let x = compute_secret(&self.our_fp, &self.their_fp, &self.ssid, secret);
        let a2 = random_exponent();
        let a3 = random_exponent();
        let r2 = random_exponent();
        let r3 = random_exponent();
        let g2a = g.modpow(&a2, p);
        let g3a = g.modpow(&a3, p);
        let c2 = hash(1, &g.modpow(&r2, p), None);
        let D2 = subtract(&r2, &a2, &c2);
        let c3 = hash(2, &g.modpow(&r3, p), None);
        let D3 = subtract(&r3, &a3, &c3);
        let mpis = OTREncoder::new()
            .write_mpi_sequence(&[&g2a, &c2, &D2, &g3a, &c3, &D3])
            .to_vec();
        let tlv = match question {
            Some(question) => TLV(
                TLV_SMP_MESSAGE_1Q,
                OTREncoder::new()
                    .write_bytes_null_terminated(&utils::bytes::drop_by_value(question, 0))
                    .write(&mpis)
                    .to_vec(),
            ),
            None => TLV(TLV_SMP_MESSAGE_1, mpis),
        };
        self.state = State::Expect2 { x, a2, a3 };
        Ok(tlv)
    }

    /// `respond` answers the peer's SMP initiation with our secret, producing SMP message 2.
    pub fn respond(&mut self, secret: &[u8]) -> Result<TLV, OTRError> {
        let State::AwaitingSecret { g2a, g3a } = &self.state else {
            return Err(OTRError::IncorrectState("no SMP exchange awaiting our secret"));
        };
        let g2a = g2a.clone();
        let g3a = g3a.clone();
        log::debug!("Responding to SMP initiation.");
        let g = &*dh::GENERATOR;
        let p = &*dh::MODULUS;
        let y = compute_secret(&self.their_fp, &self.our_fp, &self.ssid, secret);
        let b2 = random_exponent();
        let b3 = random_exponent();
        let r2 = random_exponent();
        let r3 = random_exponent();
        let r4 = random_exponent();
        let r5 = random_exponent();
        let r6 = random_exponent();
        let g2b = g.modpow(&b2, p);
        let g3b = g.modpow(&b3, p);
        let c2 = hash(3, &g.modpow(&r2, p), None);
        let D2 = subtract(&r2, &b2, &c2);
        let c3 = hash(4, &g.modpow(&r3, p), None);
        let D3 = subtract(&r3, &b3, &c3);
        let g2 = g2a.modpow(&b2, p);
        let g3 = g3a.modpow(&b3, p);
        let Pb = g3.modpow(&r4, p);
        let Qb = (g.modpow(&r4, p) * g2.modpow(&y, p)).mod_floor(p);
        let cP = hash(
            5,
            &g3.modpow(&r5, p),
            Some(&(g.modpow(&r5, p) * g2.modpow(&r6, p)).mod_floor(p)),
        );
        let D5 = subtract(&r5, &r4, &cP);
        let D6 = subtract(&r6, &y, &cP);
        let smp2 = OTREncoder::new()
            .write_mpi_sequence(&[&g2b, &c2, &D2, &g3b, &c3, &D3, &Pb, &Qb, &cP, &D5, &D6])
            .to_vec();
        self.state = State::Expect3 {
            g3a,
            g2,
            g3,
            b3,
            Pb,
            Qb,
        };
        Ok(TLV(TLV_SMP_MESSAGE_2, smp2))
    }

    /// `abort` resets the protocol state and produces the abort TLV for the peer.
    pub fn abort(&mut self) -> TLV {
        log::info!("Aborting SMP.");
        self.state = State::Expect1;
        TLV(TLV_SMP_ABORT, Vec::new())
    }

    /// `handle` processes an SMP TLV received from the peer. Any failure resets the state and
    /// produces the abort TLV.
    pub fn handle(&mut self, tlv: &TLV) -> SMPOutcome {
        if tlv.0 == TLV_SMP_ABORT {
            log::info!("SMP aborted by peer.");
            self.state = State::Expect1;
            return SMPOutcome::Aborted(None);
        }
        match self.dispatch(tlv) {
            Ok(outcome) => outcome,
            Err(err) => {
                log::info!("SMP failed, aborting: {err}");
                SMPOutcome::Aborted(Some(self.abort()))
            }
        }
    }

    fn dispatch(&mut self, tlv: &TLV) -> Result<SMPOutcome, OTRError> {
        match tlv.0 {
            TLV_SMP_MESSAGE_1 | TLV_SMP_MESSAGE_1Q => self.handle_message_1(tlv),
            TLV_SMP_MESSAGE_2 => self.handle_message_2(tlv).map(SMPOutcome::Reply),
            TLV_SMP_MESSAGE_3 => self.handle_message_3(tlv),
            TLV_SMP_MESSAGE_4 => self.handle_message_4(tlv),
            _ => panic!("BUG: unsupported TLV type for SMP: {}", tlv.0),
        }
    }

    fn handle_message_1(&mut self, tlv: &TLV) -> Result<SMPOutcome, OTRError> {
        if self.in_progress() {
            return Err(OTRError::ProtocolViolation(
                "Received SMP message 1 while exchange in progress",
            ));
        }
        let mut dec = OTRDecoder::new(&tlv.1);
        let question = if tlv.0 == TLV_SMP_MESSAGE_1Q {
            Some(dec.read_bytes_null_terminated())
        } else {
            None
        };
        let mpis = read_mpis(&mut dec, 6)?;
        dec.done()?;
        let (g2a, c2, D2, g3a, c3, D3) = (&mpis[0], &mpis[1], &mpis[2], &mpis[3], &mpis[4], &mpis[5]);
        verify_elements(&[g2a, g3a])?;
        verify_exponents(&[D2, D3])?;
        let g = &*dh::GENERATOR;
        let p = &*dh::MODULUS;
        constant::verify_biguint(
            c2,
            &hash(1, &(g.modpow(D2, p) * g2a.modpow(c2, p)).mod_floor(p), None),
        )
        .map_err(OTRError::CryptographicViolation)?;
        constant::verify_biguint(
            c3,
            &hash(2, &(g.modpow(D3, p) * g3a.modpow(c3, p)).mod_floor(p), None),
        )
        .map_err(OTRError::CryptographicViolation)?;
        self.state = State::AwaitingSecret {
            g2a: g2a.clone(),
            g3a: g3a.clone(),
        };
        Ok(SMPOutcome::Question(question))
    }

    fn handle_message_2(&mut self, tlv: &TLV) -> Result<TLV, OTRError> {
        let State::Expect2 { x, a2, a3 } = &self.state else {
            return Err(OTRError::ProtocolViolation(
                "Expected to receive SMP message 2",
            ));
        };
        let x = x.clone();
        let a2 = a2.clone();
        let a3 = a3.clone();
        let mut dec = OTRDecoder::new(&tlv.1);
        let mpis = read_mpis(&mut dec, 11)?;
        dec.done()?;
        let (g2b, c2, D2, g3b, c3, D3) = (&mpis[0], &mpis[1], &mpis[2], &mpis[3], &mpis[4], &mpis[5]);
        let (Pb, Qb, cP, D5, D6) = (&mpis[6], &mpis[7], &mpis[8], &mpis[9], &mpis[10]);
        verify_elements(&[g2b, g3b, Pb, Qb])?;
        verify_exponents(&[D2, D3, D5, D6])?;
        let g = &*dh::GENERATOR;
        let p = &*dh::MODULUS;
        constant::verify_biguint(
            c2,
            &hash(3, &(g.modpow(D2, p) * g2b.modpow(c2, p)).mod_floor(p), None),
        )
        .map_err(OTRError::CryptographicViolation)?;
        constant::verify_biguint(
            c3,
            &hash(4, &(g.modpow(D3, p) * g3b.modpow(c3, p)).mod_floor(p), None),
        )
        .map_err(OTRError::CryptographicViolation)?;
        let g2 = g2b.modpow(&a2, p);
        let g3 = g3b.modpow(&a3, p);
        constant::verify_biguint(
            cP,
            &hash(
                5,
                &(g3.modpow(D5, p) * Pb.modpow(cP, p)).mod_floor(p),
                Some(&(g.modpow(D5, p) * g2.modpow(D6, p) * Qb.modpow(cP, p)).mod_floor(p)),
            ),
        )
        .map_err(OTRError::CryptographicViolation)?;
        // Produce SMP message 3.
        let r4 = random_exponent();
        let r5 = random_exponent();
        let r6 = random_exponent();
        let r7 = random_exponent();
        let Pa = g3.modpow(&r4, p);
        let Qa = (g.modpow(&r4, p) * g2.modpow(&x, p)).mod_floor(p);
        let cP = hash(
            6,
            &g3.modpow(&r5, p),
            Some(&(g.modpow(&r5, p) * g2.modpow(&r6, p)).mod_floor(p)),
        );
        let D5 = subtract(&r5, &r4, &cP);
        let D6 = subtract(&r6, &x, &cP);
        let PaPb = (&Pa * dh::inverse(Pb)).mod_floor(p);
        let QaQb = (&Qa * dh::inverse(Qb)).mod_floor(p);
        let Ra = QaQb.modpow(&a3, p);
        let cR = hash(7, &g.modpow(&r7, p), Some(&QaQb.modpow(&r7, p)));
        let D7 = subtract(&r7, &a3, &cR);
        let smp3 = OTREncoder::new()
            .write_mpi_sequence(&[&Pa, &Qa, &cP, &D5, &D6, &Ra, &cR, &D7])
            .to_vec();
        self.state = State::Expect4 {
            g3b: g3b.clone(),
            PaPb,
            QaQb,
            a3,
        };
        Ok(TLV(TLV_SMP_MESSAGE_3, smp3))
    }

    fn handle_message_3(&mut self, tlv: &TLV) -> Result<SMPOutcome, OTRError> {
        let State::Expect3 {
            g3a,
            g2,
            g3,
            b3,
            Pb,
            Qb,
        } = &self.state
        else {
            return Err(OTRError::ProtocolViolation(
                "Expected to receive SMP message 3",
            ));
        };
        let g3a = g3a.clone();
        let g2 = g2.clone();
        let g3 = g3.clone();
        let b3 = b3.clone();
        let Pb = Pb.clone();
        let Qb = Qb.clone();
        let mut dec = OTRDecoder::new(&tlv.1);
        let mpis = read_mpis(&mut dec, 8)?;
        dec.done()?;
        let (Pa, Qa, cP, D5, D6) = (&mpis[0], &mpis[1], &mpis[2], &mpis[3], &mpis[4]);
        let (Ra, cR, D7) = (&mpis[5], &mpis[6], &mpis[7]);
        verify_elements(&[Pa, Qa, Ra])?;
        verify_exponents(&[D5, D6, D7])?;
        let g = &*dh::GENERATOR;
        let p = &*dh::MODULUS;
        constant::verify_biguint(
            cP,
            &hash(
                6,
                &(g3.modpow(D5, p) * Pa.modpow(cP, p)).mod_floor(p),
                Some(&(g.modpow(D5, p) * g2.modpow(D6, p) * Qa.modpow(cP, p)).mod_floor(p)),
            ),
        )
        .map_err(OTRError::CryptographicViolation)?;
        let QaQb = (Qa * dh::inverse(&Qb)).mod_floor(p);
        constant::verify_biguint(
            cR,
            &hash(
                7,
                &(g.modpow(D7, p) * g3a.modpow(cR, p)).mod_floor(p),
                Some(&(QaQb.modpow(D7, p) * Ra.modpow(cR, p)).mod_floor(p)),
            ),
        )
        .map_err(OTRError::CryptographicViolation)?;
        // Produce SMP message 4.
        let r7 = random_exponent();
        let Rb = QaQb.modpow(&b3, p);
        let cR = hash(8, &g.modpow(&r7, p), Some(&QaQb.modpow(&r7, p)));
        let D7 = subtract(&r7, &b3, &cR);
        let smp4 = OTREncoder::new()
            .write_mpi_sequence(&[&Rb, &cR, &D7])
            .to_vec();
        // Conclude the protocol by verifying if the secrets are equal.
        let PaPb = (Pa * dh::inverse(&Pb)).mod_floor(p);
        let trusted = constant::verify_biguint(&Ra.modpow(&b3, p), &PaPb).is_ok();
        self.state = State::Expect1;
        log::info!("SMP completed: trusted: {trusted}");
        Ok(SMPOutcome::Finished {
            trusted,
            role: SMPRole::Answered,
            reply: Some(TLV(TLV_SMP_MESSAGE_4, smp4)),
        })
    }

    fn handle_message_4(&mut self, tlv: &TLV) -> Result<SMPOutcome, OTRError> {
        let State::Expect4 {
            g3b,
            PaPb,
            QaQb,
            a3,
        } = &self.state
        else {
            return Err(OTRError::ProtocolViolation(
                "Expected to receive SMP message 4",
            ));
        };
        let g3b = g3b.clone();
        let PaPb = PaPb.clone();
        let QaQb = QaQb.clone();
        let a3 = a3.clone();
        let mut dec = OTRDecoder::new(&tlv.1);
        let mpis = read_mpis(&mut dec, 3)?;
        dec.done()?;
        let (Rb, cR, D7) = (&mpis[0], &mpis[1], &mpis[2]);
        verify_elements(&[Rb])?;
        verify_exponents(&[D7])?;
        let g = &*dh::GENERATOR;
        let p = &*dh::MODULUS;
        constant::verify_biguint(
            cR,
            &hash(
                8,
                &(g.modpow(D7, p) * g3b.modpow(cR, p)).mod_floor(p),
                Some(&(QaQb.modpow(D7, p) * Rb.modpow(cR, p)).mod_floor(p)),
            ),
        )
        .map_err(OTRError::CryptographicViolation)?;
        let trusted = constant::verify_biguint(&Rb.modpow(&a3, p), &PaPb).is_ok();
        self.state = State::Expect1;
        log::info!("SMP completed: trusted: {trusted}");
        Ok(SMPOutcome::Finished {
            trusted,
            role: SMPRole::Asked,
            reply: None,
        })
    }
}

fn compute_secret(
    initiator: &dsa::Fingerprint,
    responder: &dsa::Fingerprint,
    ssid: &SSID,
    secret: &[u8],
) -> BigUint {
    let mut secretbytes = OTREncoder::new()
        .write_u8(SMP_SECRET_VERSION)
        .write(initiator)
        .write(responder)
        .write(ssid)
        .write(secret)
        .to_vec();
    let digest = sha256::digest(&secretbytes);
    secretbytes.fill(0);
    BigUint::from_bytes_be(&digest)
}

fn hash(version: u8, mpi1: &BigUint, mpi2: Option<&BigUint>) -> BigUint {
    let mut encoder = OTREncoder::new();
    encoder.write_u8(version).write_mpi(mpi1);
    if let Some(mpi2) = mpi2 {
        encoder.write_mpi(mpi2);
    }
    BigUint::from_bytes_be(&sha256::digest(&encoder.to_vec()))
}

/// `subtract` computes `r - a*c mod q`.
fn subtract(r: &BigUint, a: &BigUint, c: &BigUint) -> BigUint {
    let q = &*dh::Q;
    (r.mod_floor(q) + q - (a * c).mod_floor(q)).mod_floor(q)
}

fn random_exponent() -> BigUint {
    utils::random::secure_biguint(EXPONENT_LENGTH)
}

fn read_mpis(dec: &mut OTRDecoder, expected: usize) -> Result<Vec<BigUint>, OTRError> {
    let mpis = dec.read_mpi_sequence()?;
    if mpis.len() == expected {
        Ok(mpis)
    } else {
        Err(OTRError::ProtocolViolation(
            "Unexpected number of MPIs in SMP message",
        ))
    }
}

fn verify_elements(elements: &[&BigUint]) -> Result<(), OTRError> {
    for e in elements {
        dh::verify_public_key(e).map_err(OTRError::CryptographicViolation)?;
    }
    Ok(())
}

fn verify_exponents(exponents: &[&BigUint]) -> Result<(), OTRError> {
    for e in exponents {
        dh::verify_exponent(e).map_err(OTRError::CryptographicViolation)?;
    }
    Ok(())
}

#[allow(non_snake_case)]
enum State {
    Expect1,
    AwaitingSecret {
        g2a: BigUint,
        g3a: BigUint,
    },
    Expect2 {
        x: BigUint,
        a2: BigUint,
        a3: BigUint,
    },
    Expect3 {
        g3a: BigUint,
        g2: BigUint,
        g3: BigUint,
        b3: BigUint,
        Pb: BigUint,
        Qb: BigUint,
    },
    Expect4 {
        g3b: BigUint,
        PaPb: BigUint,
        QaQb: BigUint,
        a3: BigUint,
    },
}

impl Drop for State {
    fn drop(&mut self) {
        match self {
            Self::Expect1 | Self::AwaitingSecret { .. } => {}
            Self::Expect2 { x, a2, a3 } => {
                x.zeroize();
                a2.zeroize();
                a3.zeroize();
            }
            Self::Expect3 { b3, .. } => b3.zeroize(),
            Self::Expect4 { a3, .. } => a3.zeroize(),
        }
    }
}
