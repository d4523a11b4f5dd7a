//! devicetoken Server - axum HTTP surface
//!
//! Wraps every route in the authentication middleware and exposes the token
//! lifecycle and device management endpoints.

pub mod error;
pub mod http;
pub mod middleware;
pub mod session;
pub mod state;

pub use error::ApiError;
pub use http::create_router;
pub use middleware::{authenticate, extract_credentials, ForceRotation};
pub use session::{CookieSessions, NoSessions, SessionProvider, SESSION_COOKIE};
pub use state::AppState;
