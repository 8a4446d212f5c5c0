// Voting rounds: the Idle / Voting(story) state machine, the "all voted"
// gate, and closing a round with the consensus value.

use std::collections::HashSet;
use std::sync::Arc;

use thiserror::Error;
use tracing::{info, warn};

use crate::consensus::compute_consensus;
use crate::error::{SessionResult, ValidationError};
use crate::model::{SessionId, Story, StoryId, Vote, VotingPhase};
use crate::store::SessionBackend;

// ---------------------------------------------------------------------------
// PhaseState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseState {
    Idle,
    Voting(StoryId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("no voting round is in progress")]
    NotVoting,
}

impl From<TransitionError> for ValidationError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::NotVoting => ValidationError::NotVoting,
        }
    }
}

impl PhaseState {
    /// Starting is always allowed. From `Voting(s)` it simply retargets
    /// the round; the old story keeps whatever points it had.
    pub fn start(self, story: StoryId) -> PhaseState {
        PhaseState::Voting(story)
    }

    /// End the current round, yielding the story it was on.
    pub fn end(self) -> Result<(StoryId, PhaseState), TransitionError> {
        match self {
            PhaseState::Voting(story) => Ok((story, PhaseState::Idle)),
            PhaseState::Idle => Err(TransitionError::NotVoting),
        }
    }

    pub fn active_story(self) -> Option<StoryId> {
        match self {
            PhaseState::Voting(story) => Some(story),
            PhaseState::Idle => None,
        }
    }
}

impl From<&VotingPhase> for PhaseState {
    fn from(phase: &VotingPhase) -> Self {
        match phase.active_story() {
            Some(story) => PhaseState::Voting(story),
            None => PhaseState::Idle,
        }
    }
}

// ---------------------------------------------------------------------------
// RoundStatus
// ---------------------------------------------------------------------------

/// Progress of the active round against the live participant count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundStatus {
    pub story: StoryId,
    pub voted: usize,
    pub participants: usize,
}

impl RoundStatus {
    /// Count distinct voters among `votes` for `story`.
    pub fn tally(story: StoryId, votes: &[Vote], participants: usize) -> Self {
        let voted = votes
            .iter()
            .filter(|v| v.story_id == story)
            .map(|v| v.participant_id)
            .collect::<HashSet<_>>()
            .len();
        RoundStatus {
            story,
            voted,
            participants,
        }
    }

    /// The round may close once every current participant has voted. The
    /// participant count is read live, so someone joining mid-round blocks
    /// closing again until they vote.
    pub fn is_complete(&self) -> bool {
        self.participants > 0 && self.voted == self.participants
    }
}

// ---------------------------------------------------------------------------
// VotingStateMachine
// ---------------------------------------------------------------------------

/// Drives phase transitions for one session against the store. Holds no
/// state of its own; every call reads what the store reports now.
pub struct VotingStateMachine {
    backend: Arc<dyn SessionBackend>,
    session: SessionId,
}

impl VotingStateMachine {
    pub fn new(backend: Arc<dyn SessionBackend>, session: SessionId) -> Self {
        Self { backend, session }
    }

    pub async fn state(&self) -> SessionResult<PhaseState> {
        let phase = self.backend.get_or_create_phase(&self.session).await?;
        Ok(PhaseState::from(&phase))
    }

    pub async fn start_voting(&self, story: StoryId) -> SessionResult<PhaseState> {
        let phase = self.backend.start_voting(&self.session, story).await?;
        Ok(PhaseState::from(&phase))
    }

    /// Votes and participants for the active round, or `None` when idle.
    pub async fn round_status(&self) -> SessionResult<Option<RoundStatus>> {
        let Some(story) = self.state().await?.active_story() else {
            return Ok(None);
        };
        let votes = self.backend.list_votes(&self.session, story).await?;
        let participants = self.backend.list_participants(&self.session).await?;
        Ok(Some(RoundStatus::tally(story, &votes, participants.len())))
    }

    /// Close whichever round the phase currently names, publishing the
    /// consensus of its votes.
    pub async fn end_voting(&self) -> SessionResult<Story> {
        let (story, _) = self.state().await?.end().map_err(ValidationError::from)?;

        let votes = self.backend.list_votes(&self.session, story).await?;
        let participants = self.backend.list_participants(&self.session).await?;
        let status = RoundStatus::tally(story, &votes, participants.len());
        if !status.is_complete() {
            warn!(
                "session {}: end requested with {}/{} votes",
                self.session, status.voted, status.participants
            );
            return Err(ValidationError::RoundIncomplete {
                voted: status.voted,
                participants: status.participants,
            }
            .into());
        }

        let points: Vec<u32> = votes.iter().map(|v| v.points).collect();
        let final_points = compute_consensus(&points);
        info!(
            "session {}: consensus {final_points} from {} votes",
            self.session,
            points.len()
        );
        let (closed, _) = self
            .backend
            .close_voting(&self.session, story, final_points)
            .await?;
        Ok(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStore;
    use uuid::Uuid;

    fn setup() -> (Arc<SessionStore>, VotingStateMachine, SessionId) {
        let store = Arc::new(SessionStore::in_memory().unwrap());
        let session = SessionId::parse("s").unwrap();
        let machine = VotingStateMachine::new(store.clone(), session.clone());
        (store, machine, session)
    }

    #[test]
    fn pure_transitions() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let state = PhaseState::Idle.start(a);
        assert_eq!(state, PhaseState::Voting(a));
        let state = state.start(b);
        assert_eq!(state, PhaseState::Voting(b));
        assert_eq!(state.end(), Ok((b, PhaseState::Idle)));
        assert_eq!(PhaseState::Idle.end(), Err(TransitionError::NotVoting));
    }

    #[test]
    fn gate_needs_every_participant() {
        let story = Uuid::new_v4();
        let vote = |participant| Vote {
            id: Uuid::new_v4(),
            session_id: SessionId::parse("s").unwrap(),
            story_id: story,
            participant_id: participant,
            points: 3,
        };
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        assert!(!RoundStatus::tally(story, &[], 0).is_complete());
        assert!(!RoundStatus::tally(story, &[vote(a)], 2).is_complete());
        assert!(RoundStatus::tally(story, &[vote(a), vote(b)], 2).is_complete());
        // A third participant joining re-blocks the round.
        assert!(!RoundStatus::tally(story, &[vote(a), vote(b)], 3).is_complete());
    }

    #[tokio::test]
    async fn full_round_publishes_consensus() {
        let (store, machine, s) = setup();
        let a = store.upsert_participant(&s, None, "A").await.unwrap();
        let b = store.upsert_participant(&s, None, "B").await.unwrap();
        let story = store.add_story(&s, "Login flow").await.unwrap();

        assert_eq!(machine.state().await.unwrap(), PhaseState::Idle);
        machine.start_voting(story.id).await.unwrap();
        store.cast_vote(&s, story.id, a.id, 3).await.unwrap();
        let status = machine.round_status().await.unwrap().unwrap();
        assert!(!status.is_complete());

        store.cast_vote(&s, story.id, b.id, 8).await.unwrap();
        assert!(machine.round_status().await.unwrap().unwrap().is_complete());

        let closed = machine.end_voting().await.unwrap();
        // mean 5.5 -> 5
        assert_eq!(closed.points, Some(5));
        assert_eq!(machine.state().await.unwrap(), PhaseState::Idle);
        assert_eq!(machine.round_status().await.unwrap(), None);
    }

    #[tokio::test]
    async fn end_voting_rejected_until_everyone_voted() {
        let (store, machine, s) = setup();
        let a = store.upsert_participant(&s, None, "A").await.unwrap();
        store.upsert_participant(&s, None, "B").await.unwrap();
        let story = store.add_story(&s, "Login flow").await.unwrap();
        machine.start_voting(story.id).await.unwrap();
        store.cast_vote(&s, story.id, a.id, 3).await.unwrap();

        let err = machine.end_voting().await.unwrap_err();
        assert_eq!(
            err.as_validation(),
            Some(&ValidationError::RoundIncomplete {
                voted: 1,
                participants: 2
            })
        );
        assert_eq!(machine.state().await.unwrap(), PhaseState::Voting(story.id));
    }

    #[tokio::test]
    async fn end_voting_while_idle_is_rejected() {
        let (_store, machine, _s) = setup();
        let err = machine.end_voting().await.unwrap_err();
        assert_eq!(err.as_validation(), Some(&ValidationError::NotVoting));
    }

    #[tokio::test]
    async fn end_voting_closes_the_story_the_phase_names() {
        let (store, machine, s) = setup();
        let a = store.upsert_participant(&s, None, "A").await.unwrap();
        let x = store.add_story(&s, "X").await.unwrap();
        let y = store.add_story(&s, "Y").await.unwrap();

        machine.start_voting(x.id).await.unwrap();
        store.cast_vote(&s, x.id, a.id, 13).await.unwrap();
        // Someone else retargets the round before it closes.
        machine.start_voting(y.id).await.unwrap();
        store.cast_vote(&s, y.id, a.id, 2).await.unwrap();

        let closed = machine.end_voting().await.unwrap();
        assert_eq!(closed.id, y.id);
        assert_eq!(closed.points, Some(2));

        let stories = store.list_stories(&s).await.unwrap();
        let x_now = stories.iter().find(|st| st.id == x.id).unwrap();
        assert_eq!(x_now.points, None, "the replaced round is orphaned");
    }
}
