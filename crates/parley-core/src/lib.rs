//! Conversation state for one-to-one chat over a hosted backend.
//!
//! Everything that talks to the outside world goes through the traits in
//! [`backend`]; the rest of the crate is the state the client keeps on top.

pub mod attachment;
pub mod backend;
pub mod blog;
pub mod buffer;
pub mod compose;
pub mod config;
pub mod directory;
pub mod error;
pub mod handoff;
pub mod message;
pub mod render;
pub mod session;
pub mod signup;
pub mod sync;

pub use backend::{AuthProvider, Backend, ChangeFeed, ObjectStore, RelationalStore, Subscription};
pub use config::{SyncConfig, UploadFailurePolicy};
pub use error::{AuthError, BackendError, SendError};
pub use message::Message;
pub use session::{ChatSession, SessionEvent};
pub use sync::{SyncState, Synchronizer};
