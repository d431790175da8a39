//! Command frames and notification classification
//!
//! Both directions are table driven: a frame template per (generation,
//! action), a status profile per generation and an ack code per
//! (generation, result). Adding a generation is a data change.

use data_encoding::{HEXLOWER, HEXUPPER, HEXUPPER_PERMISSIVE};

use crate::{Generation, ProtoError};

/// Logical command sent to a lock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockAction {
    CheckStatus,
    TurnDown,
    TurnUp,
    Reset,
}

impl LockAction {
    /// Turn commands start a verification cycle, the others do not
    pub fn is_turn(self) -> bool {
        matches!(self, Self::TurnDown | Self::TurnUp)
    }
}

/// An action in flight together with the key it was written with.
///
/// Equality is by (action, key), which is how a notification is correlated
/// with the write that caused it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingAction {
    pub action: LockAction,
    pub secret_key: String,
}

impl PendingAction {
    pub fn new(action: LockAction, secret_key: &str) -> Self {
        Self {
            action,
            secret_key: secret_key.to_string(),
        }
    }
}

/// Physical position of the lock, from a status response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockStatus {
    Down,
    Up,
}

/// Outcome of a turn command, from its ack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleResult {
    Unlocked,
    Locked,
}

impl HandleResult {
    /// Status string a Gen2 verification check is matched against
    pub fn expected_status(self) -> &'static str {
        match self {
            Self::Unlocked => "UNLOCKED",
            Self::Locked => "LOCKED",
        }
    }

    /// Position the lock should be in after this outcome
    pub fn lock_status(self) -> LockStatus {
        match self {
            Self::Unlocked => LockStatus::Down,
            Self::Locked => LockStatus::Up,
        }
    }

    /// Device ack code for this result, lower-case hex
    pub fn ack_code(self, generation: Generation) -> &'static str {
        ACK_CODES
            .iter()
            .find(|(g, r, _)| *g == generation && *r == self)
            .map(|(_, _, code)| *code)
            .unwrap_or_default()
    }

    pub fn from_ack_code(code: &str, generation: Generation) -> Option<Self> {
        ACK_CODES
            .iter()
            .find(|(g, _, c)| *g == generation && *c == code)
            .map(|(_, r, _)| *r)
    }
}

static ACK_CODES: [(Generation, HandleResult, &str); 4] = [
    (Generation::Gen1, HandleResult::Unlocked, "019e"),
    (Generation::Gen1, HandleResult::Locked, "01ae"),
    (Generation::Gen2, HandleResult::Unlocked, "140101"),
    (Generation::Gen2, HandleResult::Locked, "140102"),
];

enum FrameTemplate {
    Fixed(&'static str),
    Keyed {
        prefix: &'static str,
        suffix: &'static str,
    },
}

const GEN2_SUFFIX: &str = "45B80A";

static FRAME_TEMPLATES: [(Generation, LockAction, FrameTemplate); 7] = [
    (Generation::Gen1, LockAction::CheckStatus, FrameTemplate::Fixed("0103100C000480CA")),
    (Generation::Gen1, LockAction::TurnDown, FrameTemplate::Fixed("01106008000102000106DE")),
    (Generation::Gen1, LockAction::TurnUp, FrameTemplate::Fixed("0110600700010200010621")),
    (Generation::Gen1, LockAction::Reset, FrameTemplate::Fixed("01106005000102000107C3")),
    (
        Generation::Gen2,
        LockAction::CheckStatus,
        FrameTemplate::Keyed { prefix: "4444544314FF140201", suffix: GEN2_SUFFIX },
    ),
    (
        Generation::Gen2,
        LockAction::TurnDown,
        FrameTemplate::Keyed { prefix: "4444544314FF140101", suffix: GEN2_SUFFIX },
    ),
    (
        Generation::Gen2,
        LockAction::TurnUp,
        FrameTemplate::Keyed { prefix: "4444544314FF140102", suffix: GEN2_SUFFIX },
    ),
];

/// Where the status field sits in the hex rendering of a notification
#[derive(Debug, Clone, Copy)]
enum StatusSpan {
    Fixed { start: usize, end: usize },
    /// From `start` up to `trailer` characters before the end
    Trimmed { start: usize, trailer: usize },
}

impl StatusSpan {
    fn extract(self, hex: &str) -> Option<&str> {
        let (start, end) = match self {
            Self::Fixed { start, end } => (start, end),
            Self::Trimmed { start, trailer } => (start, hex.len().checked_sub(trailer)?),
        };
        if start > end {
            return None;
        }
        hex.get(start..end)
    }
}

/// How a numeric status field becomes a lock position
#[derive(Debug, Clone, Copy)]
enum StatusRule {
    /// Even is down, odd is up
    Parity,
    /// The device does not say; trust the preceding ack
    Expectation,
}

impl StatusRule {
    fn decide(self, value: u64, expectation: Option<HandleResult>) -> LockStatus {
        match self {
            Self::Parity if value % 2 == 0 => LockStatus::Down,
            Self::Parity => LockStatus::Up,
            Self::Expectation if expectation == Some(HandleResult::Unlocked) => LockStatus::Down,
            Self::Expectation => LockStatus::Up,
        }
    }
}

struct StatusProfile {
    span: StatusSpan,
    rule: StatusRule,
}

/// Indexed in `Generation` order
static STATUS_PROFILES: [StatusProfile; 2] = [
    StatusProfile {
        span: StatusSpan::Fixed { start: 10, end: 14 },
        rule: StatusRule::Parity,
    },
    StatusProfile {
        span: StatusSpan::Trimmed { start: 12, trailer: 22 },
        rule: StatusRule::Expectation,
    },
];

fn status_profile(generation: Generation) -> &'static StatusProfile {
    match generation {
        Generation::Gen1 => &STATUS_PROFILES[0],
        Generation::Gen2 => &STATUS_PROFILES[1],
    }
}

/// Encoded command, ready to be written to the lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame(Vec<u8>);

impl CommandFrame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn to_hex(&self) -> String {
        HEXUPPER.encode(&self.0)
    }
}

/// Encode an action for a generation. Gen1 frames ignore the key.
pub fn encode(
    action: LockAction,
    generation: Generation,
    secret_key: &str,
) -> Result<CommandFrame, ProtoError> {
    let template = FRAME_TEMPLATES
        .iter()
        .find(|(g, a, _)| *g == generation && *a == action)
        .map(|(_, _, t)| t)
        .ok_or(ProtoError::UnsupportedAction { action, generation })?;

    let hex = match template {
        FrameTemplate::Fixed(hex) => hex.to_string(),
        FrameTemplate::Keyed { prefix, suffix } => format!("{prefix}{secret_key}{suffix}"),
    };

    HEXUPPER_PERMISSIVE
        .decode(hex.as_bytes())
        .map(CommandFrame)
        .map_err(|_| ProtoError::InvalidFrame(hex))
}

/// Carve the generation specific status field out of a hex payload
pub fn status_field(payload_hex: &str, generation: Generation) -> Option<&str> {
    status_profile(generation).span.extract(payload_hex)
}

/// Result of classifying one notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    Status(LockStatus),
    HandleAck(HandleResult),
    Unclassified(Anomaly),
    /// Nothing outstanding, device chatter
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnomalyKind {
    /// Payload shorter than the status span
    ShortPayload,
    /// Status is neither an ack code nor a number
    UnknownStatus,
    /// Status is well formed but of the wrong kind for the pending action
    UnexpectedStatus,
    /// Status response with no turn command being verified
    NotVerifying,
    /// Pending action has no response rule
    NoResponseRule,
}

impl AnomalyKind {
    /// Whether the response still answers the outstanding write
    pub fn concludes_exchange(self) -> bool {
        matches!(self, Self::NotVerifying | Self::NoResponseRule)
    }
}

/// A notification that could not be turned into a result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub status: String,
    pub payload_hex: String,
}

impl std::fmt::Display for Anomaly {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} (status {:?}, payload {})",
            self.kind, self.status, self.payload_hex
        )
    }
}

/// Classify a notification payload against the pending action.
///
/// `awaiting_handle_ack` is the latched "turn in flight" flag: status
/// responses only count while a turn command is being verified.
/// `expectation` is the outcome of that turn's ack, which is all a Gen2
/// status response can be decided by.
pub fn decode_notification(
    payload: &[u8],
    generation: Generation,
    pending: Option<LockAction>,
    awaiting_handle_ack: bool,
    expectation: Option<HandleResult>,
) -> Classified {
    let Some(action) = pending else {
        return Classified::Ignored;
    };

    let payload_hex = HEXLOWER.encode(payload);
    let profile = status_profile(generation);
    let Some(status) = profile.span.extract(&payload_hex) else {
        return anomaly(AnomalyKind::ShortPayload, "", &payload_hex);
    };

    let number = status.parse::<u64>().ok();
    let ack = HandleResult::from_ack_code(status, generation);

    match action {
        LockAction::CheckStatus => match (awaiting_handle_ack, number, ack) {
            (false, _, _) => anomaly(AnomalyKind::NotVerifying, status, &payload_hex),
            (true, Some(value), _) => Classified::Status(profile.rule.decide(value, expectation)),
            (true, None, Some(_)) => anomaly(AnomalyKind::UnexpectedStatus, status, &payload_hex),
            (true, None, None) => anomaly(AnomalyKind::UnknownStatus, status, &payload_hex),
        },
        LockAction::TurnDown | LockAction::TurnUp => match (ack, number) {
            (Some(result), _) => Classified::HandleAck(result),
            (None, Some(_)) => anomaly(AnomalyKind::UnexpectedStatus, status, &payload_hex),
            (None, None) => anomaly(AnomalyKind::UnknownStatus, status, &payload_hex),
        },
        LockAction::Reset => anomaly(AnomalyKind::NoResponseRule, status, &payload_hex),
    }
}

fn anomaly(kind: AnomalyKind, status: &str, payload_hex: &str) -> Classified {
    Classified::Unclassified(Anomaly {
        kind,
        status: status.to_string(),
        payload_hex: payload_hex.to_string(),
    })
}
