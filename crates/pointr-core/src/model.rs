// Session-scoped records: stories, participants, votes and the voting phase.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

pub type StoryId = Uuid;
pub type ParticipantId = Uuid;
pub type VoteId = Uuid;

/// Point values a participant may cast.
pub const VOTE_OPTIONS: [u32; 6] = [1, 2, 3, 5, 8, 13];

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Opaque session identifier. Sessions have no registration step; a
/// session exists as soon as any record references its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Parse a user-supplied session id. Surrounding whitespace is dropped;
    /// blank input is rejected.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyInput { field: "session id" });
        }
        Ok(SessionId(trimmed.to_string()))
    }

    /// Mint a fresh session id for a brand-new session.
    pub fn generate() -> Self {
        SessionId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A work item being estimated. `points` stays `None` until a round on
/// the story closes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub id: StoryId,
    pub session_id: SessionId,
    pub title: String,
    pub points: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub session_id: SessionId,
    pub display_name: String,
}

/// One participant's estimate for one story. At most one row exists per
/// `(story_id, participant_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub id: VoteId,
    pub session_id: SessionId,
    pub story_id: StoryId,
    pub participant_id: ParticipantId,
    pub points: u32,
}

/// Session-wide voting flag plus the story currently being voted on.
///
/// Invariant: `voting_active` implies `active_story_id` names an existing
/// story of the same session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingPhase {
    pub session_id: SessionId,
    pub voting_active: bool,
    pub active_story_id: Option<StoryId>,
}

impl VotingPhase {
    pub fn idle(session_id: SessionId) -> Self {
        VotingPhase {
            session_id,
            voting_active: false,
            active_story_id: None,
        }
    }

    /// The story under vote, if a round is active.
    pub fn active_story(&self) -> Option<StoryId> {
        if self.voting_active {
            self.active_story_id
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Change events
// ---------------------------------------------------------------------------

/// Entity types; each one is a separate change-feed topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Story,
    Participant,
    Vote,
    Phase,
}

impl EntityKind {
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Story,
        EntityKind::Participant,
        EntityKind::Vote,
        EntityKind::Phase,
    ];
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Story => "story",
            EntityKind::Participant => "participant",
            EntityKind::Vote => "vote",
            EntityKind::Phase => "voting phase",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "record", rename_all = "snake_case")]
pub enum Entity {
    Story(Story),
    Participant(Participant),
    Vote(Vote),
    Phase(VotingPhase),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::Story(_) => EntityKind::Story,
            Entity::Participant(_) => EntityKind::Participant,
            Entity::Vote(_) => EntityKind::Vote,
            Entity::Phase(_) => EntityKind::Phase,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            Entity::Story(s) => &s.session_id,
            Entity::Participant(p) => &p.session_id,
            Entity::Vote(v) => &v.session_id,
            Entity::Phase(p) => &p.session_id,
        }
    }
}

/// A committed mutation as seen by change-feed subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub entity: Entity,
}

impl ChangeEvent {
    pub fn insert(entity: Entity) -> Self {
        ChangeEvent {
            kind: ChangeKind::Insert,
            entity,
        }
    }

    pub fn update(entity: Entity) -> Self {
        ChangeEvent {
            kind: ChangeKind::Update,
            entity,
        }
    }

    pub fn delete(entity: Entity) -> Self {
        ChangeEvent {
            kind: ChangeKind::Delete,
            entity,
        }
    }
}
