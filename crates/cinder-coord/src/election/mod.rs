//! Leader election over distributed locks.

mod context;
mod handler;
mod worker;

pub use context::{FollowerContext, LeaderChangeListener, LeaderContext};
pub use handler::{Candidate, CandidateHandler, ElectionEvent, LeaderFuture};
pub use worker::{ElectionHandle, ElectionWorker};
