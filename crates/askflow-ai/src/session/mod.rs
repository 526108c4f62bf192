//! Session lifecycle: question in, canonical events out

mod manager;
mod state;

pub use manager::{SessionConfig, SessionManager};
pub use state::{Session, SessionOutcome, SessionState};
