pub mod config;
pub mod constants;
pub mod error;
pub mod feed;
pub mod identity;
pub mod models;
pub mod nostr;
pub mod runtime;
pub mod store;
pub mod submit;
pub mod sync;
pub mod threads;
pub mod tracing_setup;

pub use config::CoreConfig;
pub use error::{BijaError, BijaResult, ValidationError};
pub use identity::{LoginRequest, LoginState, SaveKey};
pub use runtime::{CoreHandle, CoreRuntime, FollowingPage, MessageThreadPage, ProfilePage};
pub use submit::NoteSubmission;
pub use sync::{PollPage, SyncResult};
