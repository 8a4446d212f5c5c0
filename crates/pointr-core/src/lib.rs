// Library root for the planning-poker engine: the session store and its
// change feed, name rules, the voting state machine, consensus, and the
// per-client sync adapter.

pub mod consensus;
pub mod error;
pub mod feed;
pub mod model;
pub mod names;
pub mod refs;
pub mod store;
pub mod sync;
pub mod voting;

pub use consensus::compute_consensus;
pub use error::{ErrorCategory, SessionError, SessionResult, ValidationError};
pub use feed::{ChangeFeed, FeedError, Subscription};
pub use model::{
    ChangeEvent, ChangeKind, Entity, EntityKind, Participant, SessionId, Story, Vote, VotingPhase,
    VOTE_OPTIONS,
};
pub use refs::{FileRefs, MemoryRefs, ParticipantRefs};
pub use store::{SessionBackend, SessionStore};
pub use sync::{ClientSyncAdapter, ClientView, UserAction};
pub use voting::VotingStateMachine;
