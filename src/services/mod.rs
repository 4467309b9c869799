//! Services layer - Business logic
//!
//! - `session`: the per-request session state machine and its shared service
//! - `deferred`: side effects run after the response
//! - `csrf`: identifier and token generation
//! - `password`: Argon2 credential checks

pub mod csrf;
pub mod deferred;
pub mod password;
pub mod session;

pub use csrf::{generate_csrf_token, generate_session_id, is_well_formed_id, tokens_match};
pub use deferred::{DeferredExecutor, DeferredTask, DeferredTaskQueue, FlushReport};
pub use password::{hash_password, verify_password};
pub use session::{ClientInfo, SessionError, SessionManager, SessionService};
