use chrono::{DateTime, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type inside the engine.
pub type Ms = i64;

/// Wire format for meeting times. No offset: all instants are naive.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Parse `YYYY-MM-DDTHH:MM:SS` into comparable milliseconds.
///
/// The input must be exactly the canonical form: chrono alone tolerates
/// leading spaces and unpadded fields, so the parse has to round-trip.
pub fn parse_timestamp(s: &str) -> Option<Ms> {
    let naive = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok()?;
    if naive.format(TIMESTAMP_FORMAT).to_string() != s {
        return None;
    }
    Some(naive.and_utc().timestamp_millis())
}

/// Inverse of [`parse_timestamp`]. Sub-second precision is dropped.
pub fn format_timestamp(ms: Ms) -> String {
    match DateTime::from_timestamp_millis(ms) {
        Some(dt) => dt.naive_utc().format(TIMESTAMP_FORMAT).to_string(),
        None => ms.to_string(),
    }
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Touching endpoints do not overlap: `[10, 11)` and `[11, 12)` are disjoint.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvitationStatus {
    Pending,
    Accepted,
    Rejected,
}

impl InvitationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvitationStatus::Pending => "pending",
            InvitationStatus::Accepted => "accepted",
            InvitationStatus::Rejected => "rejected",
        }
    }
}

/// An invitee's answer. Decoded at the request boundary; there is no
/// "unknown" variant, so nothing unrecognized reaches the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationResponse {
    Accept,
    Reject,
}

impl InvitationResponse {
    pub fn from_wire(s: &str) -> Option<Self> {
        match s {
            "accept" => Some(InvitationResponse::Accept),
            "reject" => Some(InvitationResponse::Reject),
            _ => None,
        }
    }

    pub fn status(self) -> InvitationStatus {
        match self {
            InvitationResponse::Accept => InvitationStatus::Accepted,
            InvitationResponse::Reject => InvitationStatus::Rejected,
        }
    }
}

// ── Engine state ─────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrganizationState {
    pub id: Ulid,
    pub name: String,
    /// Creation sequence number, used to list in natural order.
    pub seq: u64,
    pub users: Vec<Ulid>,
    pub events: Vec<Ulid>,
}

#[derive(Debug, Clone)]
pub struct EventState {
    pub id: Ulid,
    pub organization_id: Ulid,
    pub name: String,
    pub seq: u64,
    /// Insertion-ordered, no duplicates.
    pub participants: Vec<Ulid>,
    pub meetings: Vec<Ulid>,
}

/// One of a user's meetings as seen by the conflict checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeetingSlot {
    pub meeting_id: Ulid,
    pub span: Span,
    /// Mirrors `MeetingState::scheduled`; only confirmed slots block.
    pub scheduled: bool,
}

#[derive(Debug, Clone)]
pub struct UserState {
    pub id: Ulid,
    pub organization_id: Ulid,
    pub name: String,
    pub seq: u64,
    pub events: Vec<Ulid>,
    /// Creation order. Exactly one per meeting the user is invited to.
    pub invitations: Vec<Ulid>,
    /// All meetings the user is invited to, sorted by `span.start`.
    pub slots: Vec<MeetingSlot>,
}

impl UserState {
    pub fn new(id: Ulid, organization_id: Ulid, name: String, seq: u64) -> Self {
        Self {
            id,
            organization_id,
            name,
            seq,
            events: Vec::new(),
            invitations: Vec::new(),
            slots: Vec::new(),
        }
    }

    /// Insert slot maintaining sort order by span.start.
    pub fn insert_slot(&mut self, slot: MeetingSlot) {
        let pos = self
            .slots
            .binary_search_by_key(&slot.span.start, |s| s.span.start)
            .unwrap_or_else(|e| e);
        self.slots.insert(pos, slot);
    }

    pub fn set_scheduled(&mut self, meeting_id: Ulid, scheduled: bool) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.meeting_id == meeting_id) {
            slot.scheduled = scheduled;
        }
    }

    /// Return only slots whose span overlaps the query window.
    /// Uses binary search to skip slots starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &MeetingSlot> {
        // Everything at index >= right_bound starts at or after query.end → can't overlap.
        let right_bound = self.slots.partition_point(|s| s.span.start < query.end);
        self.slots[..right_bound]
            .iter()
            .filter(move |s| s.span.end > query.start)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    pub id: Ulid,
    pub user_id: Ulid,
    pub meeting_id: Ulid,
    pub status: InvitationStatus,
}

#[derive(Debug, Clone)]
pub struct MeetingState {
    pub id: Ulid,
    pub event_id: Ulid,
    pub span: Span,
    pub seq: u64,
    /// Fixed at creation; same order as `invitations`.
    pub participants: Vec<Ulid>,
    pub invitations: Vec<Invitation>,
    pub scheduled: bool,
}

impl MeetingState {
    /// Quorum if invitation `id` were answered with `status`: every
    /// invitation accepted.
    pub fn all_accepted_with(&self, id: Ulid, status: InvitationStatus) -> bool {
        self.invitations.iter().all(|i| {
            let s = if i.id == id { status } else { i.status };
            s == InvitationStatus::Accepted
        })
    }

    pub fn invitation_mut(&mut self, id: Ulid) -> Option<&mut Invitation> {
        self.invitations.iter_mut().find(|i| i.id == id)
    }
}

/// The change types, flat with no nesting. This is the WAL record format.
/// Every multi-entity mutation is a single record so it commits or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    OrganizationCreated {
        id: Ulid,
        name: String,
    },
    UserCreated {
        id: Ulid,
        organization_id: Ulid,
        name: String,
    },
    EventCreated {
        id: Ulid,
        organization_id: Ulid,
        name: String,
    },
    ParticipantAdded {
        event_id: Ulid,
        user_id: Ulid,
    },
    MeetingCreated {
        id: Ulid,
        event_id: Ulid,
        span: Span,
        /// `(invitation_id, user_id)` in participant order.
        invitations: Vec<(Ulid, Ulid)>,
    },
    InvitationAnswered {
        id: Ulid,
        meeting_id: Ulid,
        status: InvitationStatus,
        /// The meeting's `scheduled` flag after this answer.
        scheduled: bool,
    },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationInfo {
    pub id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub id: Ulid,
    pub organization_id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub id: Ulid,
    pub organization_id: Ulid,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeetingInfo {
    pub id: Ulid,
    pub event_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub scheduled: bool,
    pub participants: Vec<Ulid>,
}

impl From<&MeetingState> for MeetingInfo {
    fn from(ms: &MeetingState) -> Self {
        Self {
            id: ms.id,
            event_id: ms.event_id,
            start: ms.span.start,
            end: ms.span.end,
            scheduled: ms.scheduled,
            participants: ms.participants.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvitationInfo {
    pub id: Ulid,
    pub user_id: Ulid,
    pub meeting_id: Ulid,
    pub status: InvitationStatus,
}

impl From<&Invitation> for InvitationInfo {
    fn from(i: &Invitation) -> Self {
        Self {
            id: i.id,
            user_id: i.user_id,
            meeting_id: i.meeting_id,
            status: i.status,
        }
    }
}
