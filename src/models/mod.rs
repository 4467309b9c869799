//! Data models
//!
//! This module contains the data structures used throughout the Tandem session service:
//! - Session state held in the ephemeral cache (`Session`, `SessionPayload`)
//! - Durable session rows and their read model (`SessionRecord`, `SessionSummary`)
//! - The credential owner (`User`)

mod session;
mod user;

pub use session::{display_ip, Session, SessionPayload, SessionRecord, SessionState, SessionSummary};
pub use user::{normalize_email, CreateUserInput, User};
