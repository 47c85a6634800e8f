//! Shared types for the IdleHands workspace: the error enum, the config
//! tree, chat/stream wire types, and the vault/lens seams.

pub mod cancel;
pub mod chat;
pub mod config;
pub mod error;
pub mod stream;
pub mod tokens;
pub mod trifecta;

pub use cancel::CancelToken;
pub use error::{Error, FailureKind, Result};
