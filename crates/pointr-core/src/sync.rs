// Per-client synchronization: a local replica of one session, optimistic
// user actions, and reconciliation of change-feed events into the replica.
//
// The replica is advisory. It may be stale at any moment and is repaired
// by the next matching feed event or by a full resync; nothing is rolled
// back when a store call fails.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ErrorCategory, SessionError, SessionResult, ValidationError};
use crate::feed::{FeedError, Subscription};
use crate::model::{
    ChangeEvent, ChangeKind, Entity, EntityKind, Participant, ParticipantId, SessionId, Story,
    StoryId, Vote, VotingPhase, VOTE_OPTIONS,
};
use crate::names;
use crate::refs::ParticipantRefs;
use crate::store::SessionBackend;
use crate::voting::{RoundStatus, VotingStateMachine};

// ---------------------------------------------------------------------------
// UserAction
// ---------------------------------------------------------------------------

/// Everything a participant can ask for from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserAction {
    /// Join the session, or rename if already joined.
    Join { name: String },
    AddStory { title: String },
    StartVoting { story_id: StoryId },
    /// Pick an estimate locally; nothing is sent until `SubmitVote`.
    SelectPoints { points: u32 },
    SubmitVote,
    EndVoting,
    DismissError,
}

impl UserAction {
    /// Phrase used in "Failed to ..." messages.
    fn verb(&self, joined: bool) -> &'static str {
        match self {
            UserAction::Join { .. } if joined => "update your name",
            UserAction::Join { .. } => "join the session",
            UserAction::AddStory { .. } => "add story",
            UserAction::StartVoting { .. } => "start voting",
            UserAction::SelectPoints { .. } => "select an estimate",
            UserAction::SubmitVote => "submit vote",
            UserAction::EndVoting => "end voting",
            UserAction::DismissError => "dismiss the error",
        }
    }
}

/// Turn a failed action into the one line shown to the user.
fn user_message(error: &SessionError, verb: &str) -> String {
    match error.category() {
        ErrorCategory::Validation => error.to_string(),
        ErrorCategory::NotFound => match error {
            SessionError::NotFound { entity, .. } => {
                format!("That {entity} no longer exists. Failed to {verb}.")
            }
            _ => format!("Failed to {verb}."),
        },
        ErrorCategory::Transport => format!("Failed to {verb}. Please try again."),
    }
}

// ---------------------------------------------------------------------------
// Replica
// ---------------------------------------------------------------------------

/// Local copy of one session's records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Replica {
    pub stories: Vec<Story>,
    pub participants: Vec<Participant>,
    pub votes: Vec<Vote>,
    pub phase: Option<VotingPhase>,
}

/// Replace the item with the same id, or append it. `false` if the replica
/// already held exactly this item.
fn upsert_by_id<T, F>(items: &mut Vec<T>, item: &T, id: F) -> bool
where
    T: Clone + PartialEq,
    F: Fn(&T) -> Uuid,
{
    let key = id(item);
    match items.iter_mut().find(|existing| id(&**existing) == key) {
        Some(existing) if *existing == *item => false,
        Some(existing) => {
            *existing = item.clone();
            true
        }
        None => {
            items.push(item.clone());
            true
        }
    }
}

fn remove_by_id<T, F>(items: &mut Vec<T>, target: Uuid, id: F) -> bool
where
    F: Fn(&T) -> Uuid,
{
    let before = items.len();
    items.retain(|item| id(item) != target);
    items.len() != before
}

impl Replica {
    /// Reconcile one feed event by entity id. Applying the same event twice
    /// is a no-op; returns whether anything changed.
    pub fn apply(&mut self, event: &ChangeEvent) -> bool {
        let delete = event.kind == ChangeKind::Delete;
        match &event.entity {
            Entity::Story(story) if delete => remove_by_id(&mut self.stories, story.id, |s| s.id),
            Entity::Story(story) => upsert_by_id(&mut self.stories, story, |s| s.id),
            Entity::Participant(p) if delete => remove_by_id(&mut self.participants, p.id, |p| p.id),
            Entity::Participant(p) => upsert_by_id(&mut self.participants, p, |p| p.id),
            Entity::Vote(vote) if delete => remove_by_id(&mut self.votes, vote.id, |v| v.id),
            Entity::Vote(vote) => upsert_by_id(&mut self.votes, vote, |v| v.id),
            Entity::Phase(_) if delete => self.phase.take().is_some(),
            Entity::Phase(phase) => {
                if self.phase.as_ref() == Some(phase) {
                    false
                } else {
                    self.phase = Some(phase.clone());
                    true
                }
            }
        }
    }

    /// Swap in the authoritative vote list for `story`.
    pub fn replace_votes_for(&mut self, story: StoryId, votes: Vec<Vote>) -> bool {
        let mut merged: Vec<Vote> = self
            .votes
            .iter()
            .filter(|v| v.story_id != story)
            .cloned()
            .collect();
        merged.extend(votes);
        if merged == self.votes {
            return false;
        }
        self.votes = merged;
        true
    }

    pub fn active_story(&self) -> Option<StoryId> {
        self.phase.as_ref().and_then(VotingPhase::active_story)
    }

    pub fn story(&self, id: StoryId) -> Option<&Story> {
        self.stories.iter().find(|s| s.id == id)
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == id)
    }

    pub fn votes_for(&self, story: StoryId) -> Vec<Vote> {
        self.votes
            .iter()
            .filter(|v| v.story_id == story)
            .cloned()
            .collect()
    }

    fn vote_of(&self, story: StoryId, participant: ParticipantId) -> Option<&Vote> {
        self.votes
            .iter()
            .find(|v| v.story_id == story && v.participant_id == participant)
    }

    /// The "all voted" gate evaluated on local data.
    pub fn round_status(&self) -> Option<RoundStatus> {
        let story = self.active_story()?;
        Some(RoundStatus::tally(
            story,
            &self.votes,
            self.participants.len(),
        ))
    }
}

// ---------------------------------------------------------------------------
// ClientView
// ---------------------------------------------------------------------------

/// What the presentation layer renders: the replica snapshot plus the
/// client's own selection and the single error slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientView {
    pub session_id: SessionId,
    pub me: Option<Participant>,
    pub stories: Vec<Story>,
    pub participants: Vec<Participant>,
    pub voting_active: bool,
    pub active_story: Option<Story>,
    /// Votes on the active story only.
    pub votes: Vec<Vote>,
    pub vote_options: Vec<u32>,
    pub selected_points: Option<u32>,
    pub can_end_voting: bool,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Feed subscriptions
// ---------------------------------------------------------------------------

struct FeedSubscriptions {
    stories: Subscription,
    participants: Subscription,
    votes: Subscription,
    phase: Subscription,
}

impl FeedSubscriptions {
    fn attach(backend: &dyn SessionBackend, session: &SessionId) -> Self {
        Self {
            stories: backend.subscribe(session, EntityKind::Story),
            participants: backend.subscribe(session, EntityKind::Participant),
            votes: backend.subscribe(session, EntityKind::Vote),
            phase: backend.subscribe(session, EntityKind::Phase),
        }
    }

    async fn next(&mut self) -> Result<ChangeEvent, FeedError> {
        tokio::select! {
            event = self.stories.recv() => event,
            event = self.participants.recv() => event,
            event = self.votes.recv() => event,
            event = self.phase.recv() => event,
        }
    }
}

async fn next_change(feed: &mut Option<FeedSubscriptions>) -> Result<ChangeEvent, FeedError> {
    match feed {
        Some(feed) => feed.next().await,
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// ClientSyncAdapter
// ---------------------------------------------------------------------------

pub struct ClientSyncAdapter {
    backend: Arc<dyn SessionBackend>,
    voting: VotingStateMachine,
    refs: Arc<dyn ParticipantRefs>,
    session: SessionId,
    replica: Replica,
    me: Option<ParticipantId>,
    selected_points: Option<u32>,
    error: Option<String>,
    feed: Option<FeedSubscriptions>,
}

impl ClientSyncAdapter {
    /// Bootstrap a client for `session`: open the feed, load a full
    /// snapshot, and recognize a returning participant from `refs`.
    pub async fn connect(
        backend: Arc<dyn SessionBackend>,
        session: SessionId,
        refs: Arc<dyn ParticipantRefs>,
    ) -> SessionResult<Self> {
        let mut adapter = ClientSyncAdapter {
            voting: VotingStateMachine::new(backend.clone(), session.clone()),
            backend,
            refs,
            session,
            replica: Replica::default(),
            me: None,
            selected_points: None,
            error: None,
            feed: None,
        };
        adapter.resync().await?;
        adapter.recognize_returning_participant().await;
        info!(
            "client attached to session {} ({} stories, {} participants)",
            adapter.session,
            adapter.replica.stories.len(),
            adapter.replica.participants.len()
        );
        Ok(adapter)
    }

    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn me(&self) -> Option<&Participant> {
        self.me.and_then(|id| self.replica.participant(id))
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn dismiss_error(&mut self) {
        self.error = None;
    }

    /// Replace the replica with a fresh snapshot.
    ///
    /// Subscriptions are opened before the snapshot is read, so nothing
    /// committed in between is lost; events already reflected in the
    /// snapshot may arrive again and reconcile as no-ops.
    pub async fn resync(&mut self) -> SessionResult<()> {
        self.feed = None;
        let feed = FeedSubscriptions::attach(self.backend.as_ref(), &self.session);
        let snapshot = self.snapshot().await;
        self.feed = Some(feed);
        self.replica = snapshot?;
        debug!("session {} resynced", self.session);
        Ok(())
    }

    async fn snapshot(&self) -> SessionResult<Replica> {
        let stories = self.backend.list_stories(&self.session).await?;
        let participants = self.backend.list_participants(&self.session).await?;
        let phase = self.backend.get_or_create_phase(&self.session).await?;
        let votes = match phase.active_story() {
            Some(story) => self.backend.list_votes(&self.session, story).await?,
            None => Vec::new(),
        };
        Ok(Replica {
            stories,
            participants,
            votes,
            phase: Some(phase),
        })
    }

    /// Adopt the participant id remembered for this session, if it still
    /// resolves. A reference to a participant that is gone is forgotten;
    /// one the store could not check is kept for the next attach.
    async fn recognize_returning_participant(&mut self) {
        let stored = match self.refs.load(&self.session) {
            Ok(Some(id)) => id,
            Ok(None) => return,
            Err(e) => {
                warn!("failed to read participant reference: {e:#}");
                return;
            }
        };

        match self.backend.get_participant(&self.session, stored).await {
            Ok(Some(participant)) => {
                info!(
                    "recognized returning participant \"{}\"",
                    participant.display_name
                );
                self.me = Some(participant.id);
                self.replica
                    .apply(&ChangeEvent::update(Entity::Participant(participant)));
            }
            Ok(None) => {
                debug!("stored participant {stored} no longer exists");
                self.forget_me();
            }
            Err(e) => {
                // Unreachable store says nothing about the participant; keep
                // the reference for the next attach.
                warn!("failed to look up stored participant {stored}: {e}");
            }
        }
    }

    fn forget_me(&mut self) {
        self.me = None;
        if let Err(e) = self.refs.forget(&self.session) {
            warn!("failed to clear participant reference: {e:#}");
        }
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    /// Perform one user action. Any failure is turned into the error-slot
    /// message and also returned; the adapter stays usable either way.
    pub async fn dispatch(&mut self, action: UserAction) -> SessionResult<()> {
        let verb = action.verb(self.me.is_some());
        if !matches!(action, UserAction::SelectPoints { .. }) {
            self.error = None;
        }

        if let Err(e) = self.precheck(&action) {
            warn!("session {}: cannot {verb}: {e}", self.session);
            self.error = Some(user_message(&e, verb));
            return Err(e);
        }

        let result = match action {
            UserAction::Join { name } => self.join(&name).await,
            UserAction::AddStory { title } => self.add_story(&title).await,
            UserAction::StartVoting { story_id } => self.start_voting(story_id).await,
            UserAction::SelectPoints { points } => self.select_points(points),
            UserAction::SubmitVote => self.submit_vote().await,
            UserAction::EndVoting => self.end_voting().await,
            UserAction::DismissError => Ok(()),
        };

        if let Err(e) = &result {
            warn!("session {}: failed to {verb}: {e}", self.session);
            self.error = Some(user_message(e, verb));
            if e.category() != ErrorCategory::Transport {
                // The store rejected the write, so it can tell us what is
                // true now.
                if let Err(resync_err) = self.resync().await {
                    debug!("resync after rejected action failed: {resync_err}");
                }
            }
        }
        result
    }

    /// Rejections decided on local state alone. Nothing here touches the
    /// store, so a failure leaves the replica as it was.
    fn precheck(&self, action: &UserAction) -> SessionResult<()> {
        match action {
            UserAction::Join { name } if name.trim().is_empty() => {
                Err(ValidationError::EmptyInput { field: "name" }.into())
            }
            UserAction::AddStory { title } => {
                let titles = self.replica.stories.iter().map(|s| s.title.as_str());
                if names::is_title_taken(titles, title) {
                    return Err(ValidationError::DuplicateTitle {
                        title: title.trim().to_string(),
                    }
                    .into());
                }
                Ok(())
            }
            UserAction::SelectPoints { points } if !VOTE_OPTIONS.contains(points) => {
                Err(ValidationError::InvalidPoints { points: *points }.into())
            }
            UserAction::SubmitVote => self.vote_target().map(|_| ()).map_err(Into::into),
            UserAction::EndVoting => self.round_gate().map_err(Into::into),
            _ => Ok(()),
        }
    }

    /// Who votes, on which story, with which points.
    fn vote_target(&self) -> Result<(ParticipantId, StoryId, u32), ValidationError> {
        let me = self.me.ok_or(ValidationError::NotJoined)?;
        let story = self.replica.active_story().ok_or(ValidationError::NotVoting)?;
        let points = self.selected_points.ok_or(ValidationError::NoSelection)?;
        Ok((me, story, points))
    }

    /// The "all voted" gate on the replica.
    fn round_gate(&self) -> Result<(), ValidationError> {
        let status = self.replica.round_status().ok_or(ValidationError::NotVoting)?;
        if !status.is_complete() {
            return Err(ValidationError::RoundIncomplete {
                voted: status.voted,
                participants: status.participants,
            });
        }
        Ok(())
    }

    async fn join(&mut self, name: &str) -> SessionResult<()> {
        let name = name.trim();

        if let Some(mine) = self.me.and_then(|id| self.replica.participant(id)).cloned() {
            let renamed = Participant {
                display_name: name.to_string(),
                ..mine
            };
            self.replica
                .apply(&ChangeEvent::update(Entity::Participant(renamed)));
        }

        let participant = self
            .backend
            .upsert_participant(&self.session, self.me, name)
            .await?;
        self.replica.apply(&ChangeEvent::update(Entity::Participant(
            participant.clone(),
        )));

        if self.me != Some(participant.id) {
            self.me = Some(participant.id);
            if let Err(e) = self.refs.save(&self.session, participant.id) {
                warn!("failed to remember participant id: {e:#}");
            }
        }
        Ok(())
    }

    async fn add_story(&mut self, title: &str) -> SessionResult<()> {
        let story = self.backend.add_story(&self.session, title).await?;
        self.replica.apply(&ChangeEvent::insert(Entity::Story(story)));
        Ok(())
    }

    async fn start_voting(&mut self, story: StoryId) -> SessionResult<()> {
        let optimistic = VotingPhase {
            session_id: self.session.clone(),
            voting_active: true,
            active_story_id: Some(story),
        };
        self.replica.apply(&ChangeEvent::update(Entity::Phase(optimistic)));
        self.selected_points = None;

        self.voting.start_voting(story).await?;
        // The round is open either way; the next vote event or resync fills
        // in anything missed here.
        if let Err(e) = self.refresh_votes(story).await {
            warn!("failed to load votes for story {story}: {e}");
        }
        Ok(())
    }

    fn select_points(&mut self, points: u32) -> SessionResult<()> {
        self.selected_points = Some(points);
        Ok(())
    }

    async fn submit_vote(&mut self) -> SessionResult<()> {
        let (me, story, points) = self.vote_target()?;

        if let Some(existing) = self.replica.vote_of(story, me).cloned() {
            let revised = Vote { points, ..existing };
            self.replica.apply(&ChangeEvent::update(Entity::Vote(revised)));
        }

        let vote = self
            .backend
            .cast_vote(&self.session, story, me, points)
            .await?;
        self.replica.apply(&ChangeEvent::update(Entity::Vote(vote)));
        self.selected_points = None;
        Ok(())
    }

    async fn end_voting(&mut self) -> SessionResult<()> {
        self.round_gate()?;

        self.replica.apply(&ChangeEvent::update(Entity::Phase(VotingPhase::idle(
            self.session.clone(),
        ))));
        self.selected_points = None;

        let closed = self.voting.end_voting().await?;
        self.replica.apply(&ChangeEvent::update(Entity::Story(closed)));
        Ok(())
    }

    async fn refresh_votes(&mut self, story: StoryId) -> SessionResult<bool> {
        let votes = self.backend.list_votes(&self.session, story).await?;
        Ok(self.replica.replace_votes_for(story, votes))
    }

    // ------------------------------------------------------------------
    // Feed reconciliation
    // ------------------------------------------------------------------

    /// Fold one feed event into the replica. Returns whether the view
    /// changed.
    pub async fn handle_event(&mut self, event: ChangeEvent) -> bool {
        if event.entity.session_id() != &self.session {
            return false;
        }
        let before = self.replica.active_story();
        let mut changed = self.replica.apply(&event);

        if let (ChangeKind::Delete, Entity::Participant(p)) = (event.kind, &event.entity) {
            if self.me == Some(p.id) {
                info!("own participant was removed from session {}", self.session);
                self.forget_me();
            }
        }

        let after = self.replica.active_story();
        if after != before {
            self.selected_points = None;
            if let Some(story) = after {
                // Votes cast before this client saw the phase change only
                // arrive through a fresh read.
                match self.refresh_votes(story).await {
                    Ok(refreshed) => changed |= refreshed,
                    Err(e) => warn!("failed to load votes for story {story}: {e}"),
                }
            }
        }
        changed
    }

    /// Wait for the next feed event.
    pub async fn next_change(&mut self) -> Result<ChangeEvent, FeedError> {
        next_change(&mut self.feed).await
    }

    pub fn view(&self) -> ClientView {
        let active_story = self
            .replica
            .active_story()
            .and_then(|id| self.replica.story(id))
            .cloned();
        let votes = active_story
            .as_ref()
            .map(|s| self.replica.votes_for(s.id))
            .unwrap_or_default();

        ClientView {
            session_id: self.session.clone(),
            me: self.me().cloned(),
            stories: self.replica.stories.clone(),
            participants: self.replica.participants.clone(),
            voting_active: self.replica.active_story().is_some(),
            active_story,
            votes,
            vote_options: VOTE_OPTIONS.to_vec(),
            selected_points: self.selected_points,
            can_end_voting: self
                .replica
                .round_status()
                .is_some_and(|status| status.is_complete()),
            error: self.error.clone(),
        }
    }

    // ------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------

    /// Serve one client until its action channel closes.
    ///
    /// Listens on the action channel and the change feed with
    /// `tokio::select!` and pushes a fresh [`ClientView`] through `views`
    /// after every change. Subscriptions are released when this returns.
    pub async fn run(
        mut self,
        mut actions: mpsc::Receiver<UserAction>,
        views: mpsc::Sender<ClientView>,
    ) -> anyhow::Result<()> {
        info!("client loop started for session {}", self.session);
        if views.send(self.view()).await.is_err() {
            return Ok(());
        }

        loop {
            tokio::select! {
                action = actions.recv() => {
                    match action {
                        Some(UserAction::DismissError) => self.dismiss_error(),
                        Some(action) => {
                            // Failures already sit in the error slot.
                            let _ = self.dispatch(action).await;
                        }
                        None => {
                            info!("action channel closed, leaving session {}", self.session);
                            break;
                        }
                    }
                }

                change = next_change(&mut self.feed) => {
                    match change {
                        Ok(event) => {
                            if !self.handle_event(event).await {
                                continue;
                            }
                        }
                        Err(FeedError::Lagged(missed)) => {
                            warn!("missed {missed} change events, resyncing session {}", self.session);
                            if let Err(e) = self.resync().await {
                                warn!("resync failed, keeping stale replica: {e}");
                            }
                        }
                        Err(FeedError::Closed) => {
                            info!("change feed for session {} closed", self.session);
                            break;
                        }
                    }
                }
            }

            if views.send(self.view()).await.is_err() {
                debug!("view receiver dropped");
                break;
            }
        }

        self.feed = None;
        info!("client loop exiting for session {}", self.session);
        Ok(())
    }
}
