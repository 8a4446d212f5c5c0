// SQLite-backed session store.
//
// The store is the source of truth for stories, participants, votes and the
// voting phase. Every committed mutation is published on the change feed
// while the connection lock is still held, so subscribers of one topic see
// events in commit order.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{SessionError, SessionResult, ValidationError};
use crate::feed::{ChangeFeed, Subscription};
use crate::model::{
    ChangeEvent, Entity, EntityKind, Participant, ParticipantId, SessionId, Story, StoryId, Vote,
    VotingPhase, VOTE_OPTIONS,
};
use crate::names;

// ---------------------------------------------------------------------------
// SessionBackend
// ---------------------------------------------------------------------------

/// Everything the client side needs from the infrastructure: scoped
/// reads, the mutating operations, and change-feed subscription.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// Return the session's phase, creating the idle default if absent.
    async fn get_or_create_phase(&self, session: &SessionId) -> SessionResult<VotingPhase>;

    async fn list_stories(&self, session: &SessionId) -> SessionResult<Vec<Story>>;

    async fn list_participants(&self, session: &SessionId) -> SessionResult<Vec<Participant>>;

    async fn list_votes(&self, session: &SessionId, story: StoryId) -> SessionResult<Vec<Vote>>;

    async fn get_participant(
        &self,
        session: &SessionId,
        id: ParticipantId,
    ) -> SessionResult<Option<Participant>>;

    async fn add_story(&self, session: &SessionId, title: &str) -> SessionResult<Story>;

    /// Rename `id` if it exists in the session, otherwise create a new
    /// participant.
    async fn upsert_participant(
        &self,
        session: &SessionId,
        id: Option<ParticipantId>,
        name: &str,
    ) -> SessionResult<Participant>;

    async fn cast_vote(
        &self,
        session: &SessionId,
        story: StoryId,
        participant: ParticipantId,
        points: u32,
    ) -> SessionResult<Vote>;

    /// Point the phase at `story`, replacing any round already running.
    async fn start_voting(&self, session: &SessionId, story: StoryId)
        -> SessionResult<VotingPhase>;

    /// Publish `final_points` on `story` and return the phase to idle, as
    /// one atomic write.
    async fn close_voting(
        &self,
        session: &SessionId,
        story: StoryId,
        final_points: u32,
    ) -> SessionResult<(Story, VotingPhase)>;

    fn subscribe(&self, session: &SessionId, kind: EntityKind) -> Subscription;
}

// ---------------------------------------------------------------------------
// SessionStore
// ---------------------------------------------------------------------------

pub struct SessionStore {
    conn: Mutex<Connection>,
    feed: Arc<ChangeFeed>,
}

impl SessionStore {
    /// Open (or create) a store at `path` and ensure all tables exist. Pass
    /// `":memory:"` for an ephemeral database.
    pub fn open(path: &str, feed: Arc<ChangeFeed>) -> SessionResult<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;
             PRAGMA foreign_keys = ON;",
        )?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS stories (
                id         BLOB PRIMARY KEY,
                session_id TEXT NOT NULL,
                title      TEXT NOT NULL,
                title_key  TEXT NOT NULL,
                points     INTEGER,
                created_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                UNIQUE(session_id, title_key)
            );

            CREATE TABLE IF NOT EXISTS participants (
                id           BLOB PRIMARY KEY,
                session_id   TEXT NOT NULL,
                display_name TEXT NOT NULL,
                name_key     TEXT NOT NULL,
                created_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                UNIQUE(session_id, name_key)
            );

            CREATE TABLE IF NOT EXISTS votes (
                id             BLOB PRIMARY KEY,
                session_id     TEXT NOT NULL,
                story_id       BLOB NOT NULL REFERENCES stories(id),
                participant_id BLOB NOT NULL REFERENCES participants(id),
                points         INTEGER NOT NULL,
                UNIQUE(story_id, participant_id)
            );

            CREATE TABLE IF NOT EXISTS voting_phases (
                session_id      TEXT PRIMARY KEY,
                voting_active   INTEGER NOT NULL DEFAULT 0,
                active_story_id BLOB REFERENCES stories(id)
            );

            CREATE INDEX IF NOT EXISTS idx_votes_story ON votes(session_id, story_id);
            ",
        )?;

        info!("session store opened at {path}");
        Ok(Self {
            conn: Mutex::new(conn),
            feed,
        })
    }

    /// In-memory store with its own feed; the usual fixture for tests.
    pub fn in_memory() -> SessionResult<Self> {
        Self::open(":memory:", Arc::new(ChangeFeed::default()))
    }

    pub fn feed(&self) -> &Arc<ChangeFeed> {
        &self.feed
    }

    fn conn(&self) -> SessionResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SessionError::transport("database lock poisoned"))
    }

    fn publish(&self, event: ChangeEvent) {
        let kind = event.kind;
        let entity = event.entity.kind();
        let receivers = self.feed.publish(event);
        debug!("published {kind:?} {entity} to {receivers} subscribers");
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn read_phase(conn: &Connection, session: &SessionId) -> rusqlite::Result<Option<VotingPhase>> {
    conn.query_row(
        "SELECT voting_active, active_story_id FROM voting_phases WHERE session_id = ?1",
        params![session.as_str()],
        |row| {
            Ok(VotingPhase {
                session_id: session.clone(),
                voting_active: row.get(0)?,
                active_story_id: row.get(1)?,
            })
        },
    )
    .optional()
}

fn read_story(conn: &Connection, session: &SessionId, id: StoryId) -> rusqlite::Result<Option<Story>> {
    conn.query_row(
        "SELECT id, title, points FROM stories WHERE session_id = ?1 AND id = ?2",
        params![session.as_str(), id],
        |row| {
            Ok(Story {
                id: row.get(0)?,
                session_id: session.clone(),
                title: row.get(1)?,
                points: row.get(2)?,
            })
        },
    )
    .optional()
}

fn read_participants(conn: &Connection, session: &SessionId) -> rusqlite::Result<Vec<Participant>> {
    let mut stmt = conn.prepare(
        "SELECT id, display_name FROM participants WHERE session_id = ?1 ORDER BY rowid",
    )?;
    let rows = stmt.query_map(params![session.as_str()], |row| {
        Ok(Participant {
            id: row.get(0)?,
            session_id: session.clone(),
            display_name: row.get(1)?,
        })
    })?;
    rows.collect()
}

fn participant_exists(conn: &Connection, session: &SessionId, id: ParticipantId) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM participants WHERE session_id = ?1 AND id = ?2)",
        params![session.as_str(), id],
        |row| row.get(0),
    )
}

fn require_text(raw: &str, field: &'static str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyInput { field });
    }
    Ok(trimmed.to_string())
}

// ---------------------------------------------------------------------------
// SessionBackend for SessionStore
// ---------------------------------------------------------------------------

#[async_trait]
impl SessionBackend for SessionStore {
    async fn get_or_create_phase(&self, session: &SessionId) -> SessionResult<VotingPhase> {
        let conn = self.conn()?;
        let created = conn.execute(
            "INSERT INTO voting_phases (session_id, voting_active, active_story_id)
             VALUES (?1, 0, NULL)
             ON CONFLICT(session_id) DO NOTHING",
            params![session.as_str()],
        )?;

        let phase = read_phase(&conn, session)?
            .ok_or_else(|| SessionError::not_found(EntityKind::Phase, session))?;
        if created == 1 {
            debug!("initialized voting phase for session {session}");
            self.publish(ChangeEvent::insert(Entity::Phase(phase.clone())));
        }
        Ok(phase)
    }

    async fn list_stories(&self, session: &SessionId) -> SessionResult<Vec<Story>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, title, points FROM stories WHERE session_id = ?1 ORDER BY rowid")?;
        let stories = stmt
            .query_map(params![session.as_str()], |row| {
                Ok(Story {
                    id: row.get(0)?,
                    session_id: session.clone(),
                    title: row.get(1)?,
                    points: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(stories)
    }

    async fn list_participants(&self, session: &SessionId) -> SessionResult<Vec<Participant>> {
        let conn = self.conn()?;
        Ok(read_participants(&conn, session)?)
    }

    async fn list_votes(&self, session: &SessionId, story: StoryId) -> SessionResult<Vec<Vote>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, participant_id, points FROM votes
             WHERE session_id = ?1 AND story_id = ?2 ORDER BY rowid",
        )?;
        let votes = stmt
            .query_map(params![session.as_str(), story], |row| {
                Ok(Vote {
                    id: row.get(0)?,
                    session_id: session.clone(),
                    story_id: story,
                    participant_id: row.get(1)?,
                    points: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(votes)
    }

    async fn get_participant(
        &self,
        session: &SessionId,
        id: ParticipantId,
    ) -> SessionResult<Option<Participant>> {
        let conn = self.conn()?;
        let participant = conn
            .query_row(
                "SELECT display_name FROM participants WHERE session_id = ?1 AND id = ?2",
                params![session.as_str(), id],
                |row| {
                    Ok(Participant {
                        id,
                        session_id: session.clone(),
                        display_name: row.get(0)?,
                    })
                },
            )
            .optional()?;
        Ok(participant)
    }

    async fn add_story(&self, session: &SessionId, title: &str) -> SessionResult<Story> {
        let title = require_text(title, "story title")?;
        let title_key = names::name_key(&title);
        let conn = self.conn()?;

        let taken: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM stories WHERE session_id = ?1 AND title_key = ?2)",
            params![session.as_str(), title_key],
            |row| row.get(0),
        )?;
        if taken {
            return Err(ValidationError::DuplicateTitle { title }.into());
        }

        let story = Story {
            id: Uuid::new_v4(),
            session_id: session.clone(),
            title,
            points: None,
        };
        conn.execute(
            "INSERT INTO stories (id, session_id, title, title_key, points)
             VALUES (?1, ?2, ?3, ?4, NULL)",
            params![story.id, session.as_str(), story.title, title_key],
        )?;

        info!("story \"{}\" added to session {session}", story.title);
        self.publish(ChangeEvent::insert(Entity::Story(story.clone())));
        Ok(story)
    }

    async fn upsert_participant(
        &self,
        session: &SessionId,
        id: Option<ParticipantId>,
        name: &str,
    ) -> SessionResult<Participant> {
        let name = require_text(name, "name")?;
        let conn = self.conn()?;

        let existing = read_participants(&conn, session)?;
        let own_id = id.filter(|id| existing.iter().any(|p| p.id == *id));
        let roster = existing.iter().map(|p| (p.id, p.display_name.as_str()));

        if !names::is_name_available(roster.clone(), &name, own_id) {
            let suggestion = names::suggest_name(roster, &name, own_id);
            return Err(ValidationError::NameTaken { name, suggestion }.into());
        }

        let name_key = names::name_key(&name);
        let participant = Participant {
            id: own_id.unwrap_or_else(Uuid::new_v4),
            session_id: session.clone(),
            display_name: name,
        };
        if own_id.is_some() {
            conn.execute(
                "UPDATE participants SET display_name = ?1, name_key = ?2
                 WHERE session_id = ?3 AND id = ?4",
                params![participant.display_name, name_key, session.as_str(), participant.id],
            )?;
            info!(
                "participant {} renamed to \"{}\" in session {session}",
                participant.id, participant.display_name
            );
            self.publish(ChangeEvent::update(Entity::Participant(participant.clone())));
        } else {
            conn.execute(
                "INSERT INTO participants (id, session_id, display_name, name_key)
                 VALUES (?1, ?2, ?3, ?4)",
                params![participant.id, session.as_str(), participant.display_name, name_key],
            )?;
            info!(
                "\"{}\" joined session {session} as {}",
                participant.display_name, participant.id
            );
            self.publish(ChangeEvent::insert(Entity::Participant(participant.clone())));
        }
        Ok(participant)
    }

    async fn cast_vote(
        &self,
        session: &SessionId,
        story: StoryId,
        participant: ParticipantId,
        points: u32,
    ) -> SessionResult<Vote> {
        if !VOTE_OPTIONS.contains(&points) {
            return Err(ValidationError::InvalidPoints { points }.into());
        }
        let conn = self.conn()?;

        if read_story(&conn, session, story)?.is_none() {
            return Err(SessionError::not_found(EntityKind::Story, story));
        }
        if !participant_exists(&conn, session, participant)? {
            return Err(SessionError::not_found(EntityKind::Participant, participant));
        }

        let fresh_id = Uuid::new_v4();
        let id: Uuid = conn.query_row(
            "INSERT INTO votes (id, session_id, story_id, participant_id, points)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(story_id, participant_id) DO UPDATE SET points = excluded.points
             RETURNING id",
            params![fresh_id, session.as_str(), story, participant, points],
            |row| row.get(0),
        )?;

        let vote = Vote {
            id,
            session_id: session.clone(),
            story_id: story,
            participant_id: participant,
            points,
        };
        debug!("participant {participant} voted {points} on story {story}");
        if id == fresh_id {
            self.publish(ChangeEvent::insert(Entity::Vote(vote.clone())));
        } else {
            self.publish(ChangeEvent::update(Entity::Vote(vote.clone())));
        }
        Ok(vote)
    }

    async fn start_voting(
        &self,
        session: &SessionId,
        story: StoryId,
    ) -> SessionResult<VotingPhase> {
        let conn = self.conn()?;
        if read_story(&conn, session, story)?.is_none() {
            return Err(SessionError::not_found(EntityKind::Story, story));
        }

        let previous = read_phase(&conn, session)?;
        conn.execute(
            "INSERT INTO voting_phases (session_id, voting_active, active_story_id)
             VALUES (?1, 1, ?2)
             ON CONFLICT(session_id) DO UPDATE SET
                voting_active   = 1,
                active_story_id = excluded.active_story_id",
            params![session.as_str(), story],
        )?;

        if let Some(replaced) = previous.as_ref().and_then(VotingPhase::active_story) {
            if replaced != story {
                info!("session {session}: round on story {replaced} replaced by story {story}");
            }
        }
        info!("session {session}: voting started on story {story}");

        let phase = VotingPhase {
            session_id: session.clone(),
            voting_active: true,
            active_story_id: Some(story),
        };
        if previous.is_some() {
            self.publish(ChangeEvent::update(Entity::Phase(phase.clone())));
        } else {
            self.publish(ChangeEvent::insert(Entity::Phase(phase.clone())));
        }
        Ok(phase)
    }

    async fn close_voting(
        &self,
        session: &SessionId,
        story: StoryId,
        final_points: u32,
    ) -> SessionResult<(Story, VotingPhase)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        let updated = tx.execute(
            "UPDATE stories SET points = ?1 WHERE session_id = ?2 AND id = ?3",
            params![final_points, session.as_str(), story],
        )?;
        if updated == 0 {
            // Dropping the transaction rolls it back.
            return Err(SessionError::not_found(EntityKind::Story, story));
        }
        tx.execute(
            "INSERT INTO voting_phases (session_id, voting_active, active_story_id)
             VALUES (?1, 0, NULL)
             ON CONFLICT(session_id) DO UPDATE SET
                voting_active   = 0,
                active_story_id = NULL",
            params![session.as_str()],
        )?;

        let closed = read_story(&tx, session, story)?
            .ok_or_else(|| SessionError::not_found(EntityKind::Story, story))?;
        tx.commit()?;

        info!(
            "session {session}: voting closed on \"{}\" at {final_points} points",
            closed.title
        );
        let phase = VotingPhase::idle(session.clone());
        self.publish(ChangeEvent::update(Entity::Story(closed.clone())));
        self.publish(ChangeEvent::update(Entity::Phase(phase.clone())));
        Ok((closed, phase))
    }

    fn subscribe(&self, session: &SessionId, kind: EntityKind) -> Subscription {
        self.feed.subscribe(session, kind)
    }
}
