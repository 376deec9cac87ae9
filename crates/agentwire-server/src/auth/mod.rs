//! Handshake authentication and session management.

pub mod handshake;
pub mod session;
pub mod verifier;

pub use handshake::{Authenticator, Established, HandshakeError, HandshakeState, negotiate_version};
pub use session::{Session, SessionStore};
pub use verifier::{AuthError, JwtVerifier, TokenVerifier, VerifiedToken};
