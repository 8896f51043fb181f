pub mod auth_gate;
pub mod nonce_store;

pub use auth_gate::{AuthGate, AuthMode, LogoutOutcome, UserResponse};
pub use nonce_store::NonceStore;
