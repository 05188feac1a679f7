//! Sun RPC (RFC 5531) call and reply envelopes.
//!
//! No I/O happens here; this is pure data transformation. Procedure
//! arguments and results are opaque bytes appended to / taken from the end of
//! the envelope.
//!
//! # Wire format
//!
//! All words are **big-endian** 32-bit quantities.
//!
//! ```text
//!  call:   xid | CALL(0) | rpcvers(2) | prog | vers | proc | cred | verf | args…
//!  reply:  xid | REPLY(1) | MSG_ACCEPTED(0) | verf | accept_stat | results…
//!                         | MSG_DENIED(1)   | reject_stat | mismatch_info / auth_stat
//! ```
//!
//! `cred` and `verf` are each `flavor | length | body (padded)`.

use crate::error::RpcError;
use crate::xdr::{self, Reader};

pub const RPC_VERSION: u32 = 2;

pub const MSG_CALL: u32 = 0;
pub const MSG_REPLY: u32 = 1;

const MSG_ACCEPTED: u32 = 0;
const MSG_DENIED: u32 = 1;

const ACCEPT_SUCCESS: u32 = 0;
const ACCEPT_PROG_UNAVAIL: u32 = 1;
const ACCEPT_PROG_MISMATCH: u32 = 2;
const ACCEPT_PROC_UNAVAIL: u32 = 3;
const ACCEPT_GARBAGE_ARGS: u32 = 4;
const ACCEPT_SYSTEM_ERR: u32 = 5;

const REJECT_RPC_MISMATCH: u32 = 0;
const REJECT_AUTH_ERROR: u32 = 1;

pub const AUTH_NONE: u32 = 0;
pub const AUTH_UNIX: u32 = 1;

/// `auth_stat` value for a credential the server cannot parse or accept.
pub const AUTH_BADCRED: u32 = 1;

/// Upper bound on an opaque_auth body.
pub const MAX_AUTH_BYTES: usize = 400;
/// Upper bound on an AUTH_UNIX machine name.
pub const MAX_MACHINE_NAME: usize = 255;
/// Supplementary groups carried in an AUTH_UNIX credential.
pub const MAX_GROUPS: usize = 16;

/// Length of the fixed call header up to and including `proc`.
const CALL_PREFIX_LEN: usize = 6 * 4;

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// AUTH_UNIX credential body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUnix {
    pub stamp: u32,
    pub machine_name: String,
    pub uid: u32,
    pub gid: u32,
    pub gids: Vec<u32>,
}

/// Caller identity attached to every call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    #[default]
    None,
    Unix(AuthUnix),
}

impl Credentials {
    /// AUTH_UNIX credentials; the machine name and group list are clipped to
    /// the protocol limits.
    pub fn unix(machine_name: &str, uid: u32, gid: u32, gids: &[u32]) -> Self {
        let mut name = machine_name.to_string();
        if name.len() > MAX_MACHINE_NAME {
            let mut cut = MAX_MACHINE_NAME;
            while !name.is_char_boundary(cut) {
                cut -= 1;
            }
            name.truncate(cut);
        }
        Credentials::Unix(AuthUnix {
            stamp: 0,
            machine_name: name,
            uid,
            gid,
            gids: gids.iter().copied().take(MAX_GROUPS).collect(),
        })
    }

    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Credentials::None => {
                xdr::put_u32(out, AUTH_NONE);
                xdr::put_u32(out, 0);
            }
            Credentials::Unix(au) => {
                let mut body = Vec::with_capacity(64);
                xdr::put_u32(&mut body, au.stamp);
                xdr::put_opaque(&mut body, au.machine_name.as_bytes());
                xdr::put_u32(&mut body, au.uid);
                xdr::put_u32(&mut body, au.gid);
                xdr::put_u32(&mut body, au.gids.len() as u32);
                for g in &au.gids {
                    xdr::put_u32(&mut body, *g);
                }
                xdr::put_u32(out, AUTH_UNIX);
                xdr::put_opaque(out, &body);
            }
        }
    }
}

/// A raw `opaque_auth` as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpaqueAuth {
    pub flavor: u32,
    pub body: Vec<u8>,
}

impl OpaqueAuth {
    fn read(r: &mut Reader<'_>) -> Result<Self, RpcError> {
        let flavor = r.u32()?;
        let body = r.opaque(MAX_AUTH_BYTES)?.to_vec();
        Ok(Self { flavor, body })
    }
}

// ---------------------------------------------------------------------------
// Client side
// ---------------------------------------------------------------------------

/// Build a complete call message. The verifier is always AUTH_NONE.
pub fn encode_call(
    xid: u32,
    program: u32,
    version: u32,
    procedure: u32,
    cred: &Credentials,
    args: &[u8],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(CALL_PREFIX_LEN + 2 * 8 + 96 + args.len());
    for word in [xid, MSG_CALL, RPC_VERSION, program, version, procedure] {
        xdr::put_u32(&mut out, word);
    }
    cred.encode(&mut out);
    Credentials::None.encode(&mut out);
    out.extend_from_slice(args);
    out
}

/// Peek at the xid of a reply. Returns `None` when the message is too short
/// or is not a reply at all.
pub fn reply_xid(msg: &[u8]) -> Option<u32> {
    let mut r = Reader::new(msg);
    let xid = r.u32().ok()?;
    match r.u32().ok()? {
        MSG_REPLY => Some(xid),
        _ => None,
    }
}

/// Decode a reply envelope and return the procedure results.
///
/// With `status_word` set the first result word is a procedure status
/// (as in every NFS reply); a non-zero status becomes [`RpcError::Server`]
/// and is stripped from the returned payload.
pub fn decode_reply(msg: &[u8], status_word: bool) -> Result<Vec<u8>, RpcError> {
    let mut r = Reader::new(msg);
    let _xid = r.u32()?;
    let mtype = r.u32()?;
    if mtype != MSG_REPLY {
        return Err(RpcError::Malformed(format!("message type {mtype} is not a reply")));
    }

    match r.u32()? {
        MSG_DENIED => match r.u32()? {
            REJECT_RPC_MISMATCH => {
                let low = r.u32()?;
                let high = r.u32()?;
                Err(RpcError::RpcMismatch { low, high })
            }
            REJECT_AUTH_ERROR => Err(RpcError::AuthRejected(r.u32()?)),
            other => Err(RpcError::Malformed(format!("unknown reject_stat {other}"))),
        },
        MSG_ACCEPTED => {
            // Verifier is not cached; skip it.
            OpaqueAuth::read(&mut r)?;
            match r.u32()? {
                ACCEPT_SUCCESS => {
                    if status_word {
                        let status = r.u32()?;
                        if status != 0 {
                            return Err(RpcError::Server(status));
                        }
                    }
                    Ok(r.rest().to_vec())
                }
                ACCEPT_PROG_UNAVAIL => Err(RpcError::ProgramUnavailable),
                ACCEPT_PROG_MISMATCH => {
                    let low = r.u32()?;
                    let high = r.u32()?;
                    Err(RpcError::ProgramMismatch { low, high })
                }
                ACCEPT_PROC_UNAVAIL => Err(RpcError::ProcedureUnavailable),
                ACCEPT_GARBAGE_ARGS => Err(RpcError::GarbageArgs),
                ACCEPT_SYSTEM_ERR => Err(RpcError::SystemError),
                other => Err(RpcError::Server(other)),
            }
        }
        other => Err(RpcError::Malformed(format!("unknown reply_stat {other}"))),
    }
}

// ---------------------------------------------------------------------------
// Server side
// ---------------------------------------------------------------------------

/// Parsed fixed part of an incoming call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub procedure: u32,
    pub cred: OpaqueAuth,
    pub verf: OpaqueAuth,
}

impl CallHeader {
    /// Decode the AUTH_UNIX body, if that is the credential flavor.
    pub fn unix_credentials(&self) -> Option<AuthUnix> {
        if self.cred.flavor != AUTH_UNIX {
            return None;
        }
        let mut r = Reader::new(&self.cred.body);
        let stamp = r.u32().ok()?;
        let name = r.opaque(MAX_MACHINE_NAME).ok()?;
        let uid = r.u32().ok()?;
        let gid = r.u32().ok()?;
        let ngroups = r.u32().ok()? as usize;
        if ngroups > MAX_GROUPS {
            return None;
        }
        let gids = (0..ngroups).map(|_| r.u32()).collect::<Result<Vec<_>, _>>().ok()?;
        Some(AuthUnix {
            stamp,
            machine_name: String::from_utf8_lossy(name).into_owned(),
            uid,
            gid,
            gids,
        })
    }
}

/// Why an accepted call could not be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStat {
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
}

/// Why a call was refused outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectStat {
    RpcMismatch { low: u32, high: u32 },
    AuthError(u32),
}

/// Outcome of parsing an incoming call.
#[derive(Debug)]
pub enum IncomingCall<'a> {
    /// A well-formed call and its procedure arguments.
    Call(CallHeader, &'a [u8]),
    /// Parsed far enough to answer, but must be refused.
    Reject { xid: u32, stat: RejectStat },
}

/// Parse a call message. Garbage that cannot even be answered is an error
/// and should be dropped by the caller.
pub fn decode_call(msg: &[u8]) -> Result<IncomingCall<'_>, RpcError> {
    let mut r = Reader::new(msg);
    let xid = r.u32()?;
    let mtype = r.u32()?;
    if mtype != MSG_CALL {
        return Err(RpcError::Malformed(format!("message type {mtype} is not a call")));
    }
    let rpcvers = r.u32()?;
    if rpcvers != RPC_VERSION {
        return Ok(IncomingCall::Reject {
            xid,
            stat: RejectStat::RpcMismatch {
                low: RPC_VERSION,
                high: RPC_VERSION,
            },
        });
    }
    let program = r.u32()?;
    let version = r.u32()?;
    let procedure = r.u32()?;
    let cred = OpaqueAuth::read(&mut r)?;
    let verf = OpaqueAuth::read(&mut r)?;
    if cred.flavor != AUTH_NONE && cred.flavor != AUTH_UNIX {
        return Ok(IncomingCall::Reject {
            xid,
            stat: RejectStat::AuthError(AUTH_BADCRED),
        });
    }
    let header = CallHeader {
        xid,
        program,
        version,
        procedure,
        cred,
        verf,
    };
    Ok(IncomingCall::Call(header, r.rest()))
}

fn accepted_prefix(xid: u32, stat: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 * 4);
    for word in [xid, MSG_REPLY, MSG_ACCEPTED, AUTH_NONE, 0, stat] {
        xdr::put_u32(&mut out, word);
    }
    out
}

/// Successful reply carrying `results`.
pub fn encode_success(xid: u32, results: &[u8]) -> Vec<u8> {
    let mut out = accepted_prefix(xid, ACCEPT_SUCCESS);
    out.extend_from_slice(results);
    out
}

/// Accepted-but-failed reply.
pub fn encode_accept_error(xid: u32, stat: AcceptStat) -> Vec<u8> {
    match stat {
        AcceptStat::ProgUnavail => accepted_prefix(xid, ACCEPT_PROG_UNAVAIL),
        AcceptStat::ProgMismatch { low, high } => {
            let mut out = accepted_prefix(xid, ACCEPT_PROG_MISMATCH);
            xdr::put_u32(&mut out, low);
            xdr::put_u32(&mut out, high);
            out
        }
        AcceptStat::ProcUnavail => accepted_prefix(xid, ACCEPT_PROC_UNAVAIL),
        AcceptStat::GarbageArgs => accepted_prefix(xid, ACCEPT_GARBAGE_ARGS),
        AcceptStat::SystemErr => accepted_prefix(xid, ACCEPT_SYSTEM_ERR),
    }
}

/// Denied reply.
pub fn encode_denied(xid: u32, stat: RejectStat) -> Vec<u8> {
    let mut out = Vec::with_capacity(6 * 4);
    for word in [xid, MSG_REPLY, MSG_DENIED] {
        xdr::put_u32(&mut out, word);
    }
    match stat {
        RejectStat::RpcMismatch { low, high } => {
            xdr::put_u32(&mut out, REJECT_RPC_MISMATCH);
            xdr::put_u32(&mut out, low);
            xdr::put_u32(&mut out, high);
        }
        RejectStat::AuthError(auth_stat) => {
            xdr::put_u32(&mut out, REJECT_AUTH_ERROR);
            xdr::put_u32(&mut out, auth_stat);
        }
    }
    out
}
