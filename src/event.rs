// SPDX-License-Identifier: LGPL-3.0-only

use crate::{smp::SMPRole, OTRError};

/// `Event` is a notification for the host application. Events are queued by the session and
/// retrieved with `Session::poll_event`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Status(Status),
    /// An error occurred. The session already handled it according to protocol.
    Error {
        severity: Severity,
        error: OTRError,
    },
    /// `Ui` carries a message for the user. `encrypted` indicates if it arrived over a
    /// confidential session.
    Ui { message: Vec<u8>, encrypted: bool },
    Smp(SMPEvent),
    /// The extra symmetric key was announced (`Send`) or received (`Receive`) for the indicated
    /// usage.
    File {
        direction: Direction,
        key: [u8; 32],
        usage: u32,
        usedata: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// A query message was sent to initiate OTR.
    SendQuery,
    /// The authenticated key exchange started.
    AkeInit,
    /// The authenticated key exchange succeeded, the session is encrypted.
    AkeSuccess,
    /// The encrypted session ended, locally or by the other party.
    EndOtr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// `Warn` indicates a recoverable condition, such as an unencrypted message.
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SMPEvent {
    /// The other party initiated SMP, optionally with a question. Answer with
    /// `Session::smp_secret`.
    Question(Option<Vec<u8>>),
    /// SMP completed.
    Trust { trusted: bool, role: SMPRole },
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}
