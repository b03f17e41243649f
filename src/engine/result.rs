use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use crate::engine::{EngineId, PingTarget};
use crate::icmp::{EchoReply, EchoStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// The destination answered.
    Ok,
    /// A router on the way answered because the TTL ran out.
    TimeExceeded,
    NoReply,
    /// The transport failed or the destination was reported unreachable.
    Error,
}

impl From<&EchoStatus> for ResultCode {
    fn from(status: &EchoStatus) -> Self {
        match status {
            EchoStatus::Reply => ResultCode::Ok,
            EchoStatus::TtlExpired => ResultCode::TimeExceeded,
            EchoStatus::TimedOut => ResultCode::NoReply,
            EchoStatus::Unreachable(_) | EchoStatus::Failed(_) => ResultCode::Error,
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultCode::Ok => write!(f, "Ok"),
            ResultCode::TimeExceeded => write!(f, "TimeExceeded"),
            ResultCode::NoReply => write!(f, "NoReply"),
            ResultCode::Error => write!(f, "Error"),
        }
    }
}

/// Outcome of one probe. Immutable once built.
#[derive(Debug, Clone)]
pub struct PingResult {
    sequence_id: u64,
    code: ResultCode,
    responder: Option<IpAddr>,
    epoch: SystemTime,
    round_trip: Duration,
    target: Option<Weak<PingTarget>>,
    hop: Option<u8>,
}

impl PingResult {
    pub(crate) fn from_reply(
        sequence_id: u64,
        reply: &EchoReply,
        epoch: SystemTime,
        target: Option<Weak<PingTarget>>,
        hop: Option<u8>,
    ) -> Self {
        let code = ResultCode::from(&reply.status);
        Self {
            sequence_id,
            code,
            responder: if code == ResultCode::NoReply { None } else { reply.responder },
            epoch,
            round_trip: reply.elapsed,
            target,
            hop,
        }
    }

    pub(crate) fn no_reply(
        sequence_id: u64,
        epoch: SystemTime,
        waited: Duration,
        target: Option<Weak<PingTarget>>,
        hop: Option<u8>,
    ) -> Self {
        Self {
            sequence_id,
            code: ResultCode::NoReply,
            responder: None,
            epoch,
            round_trip: waited,
            target,
            hop,
        }
    }

    /// Unique among all results of the engine that produced it.
    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn code(&self) -> ResultCode {
        self.code
    }

    pub fn responder(&self) -> Option<IpAddr> {
        self.responder
    }

    /// Wall clock time the request was issued.
    pub fn epoch(&self) -> SystemTime {
        self.epoch
    }

    pub fn round_trip(&self) -> Duration {
        self.round_trip
    }

    /// The target this result belongs to, if it was a continuous-mode probe
    /// and the target is still alive.
    pub fn target(&self) -> Option<Arc<PingTarget>> {
        self.target.as_ref().and_then(Weak::upgrade)
    }

    /// TTL used for a hop-sequence probe; `None` for continuous-mode probes.
    pub fn hop(&self) -> Option<u8> {
        self.hop
    }
}

/// A result published by a running engine.
#[derive(Debug, Clone)]
pub struct PingEvent {
    pub engine: EngineId,
    pub result: PingResult,
}
