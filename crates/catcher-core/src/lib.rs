pub mod catchers;
pub mod claim;
pub mod classify;
pub mod config;
pub mod context;
pub mod coordination;
pub mod engine;
pub mod error;
pub mod interrupt;
pub mod ledger;
pub mod listing;
pub mod models;
pub mod query;
pub mod reconcile;
pub mod reporter;
pub mod scanner;
pub mod store;
pub mod throttle;
pub mod traits;
pub mod util;
pub mod watchdog;

#[cfg(test)]
pub mod testutil;

pub use classify::{Verdict, classify};
pub use config::EngineConfig;
pub use context::{Origin, RunState};
pub use engine::{Engine, EngineHandle, EngineParts, EngineStats};
pub use error::AppError;
pub use interrupt::{ChallengeState, ProbeSurface};
pub use models::{ClaimGroupId, ClaimRecord, GroupKey, HttpReply, ItemDescriptor, Signal};
pub use reporter::{ActivityLog, EngineEvent, EngineReporter, TracingReporter};
pub use store::FileStore;
pub use traits::{
    Accept, ChallengeSurface, Fetcher, GroupResolver, NullSignalService, SharedStore,
    SignalService, StaticGroup,
};
