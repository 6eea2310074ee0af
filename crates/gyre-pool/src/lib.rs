//! Scoped API key pool with failure sidelining and time-based reactivation.
//!
//! A [`KeyPool`] holds an immutable, ordered list of API keys and tracks
//! their availability independently per *scope* (an upstream `host|path`
//! pair). Keys that fail under one scope are sidelined for a configurable
//! duration without affecting any other scope, and move back into rotation
//! either through a background sweep or a just-in-time check during
//! acquisition.
//!
//! # Components
//!
//! - [`pool`] — the pool itself: acquisition, sidelining, reactivation
//! - [`error`] — pool error kinds

pub mod error;
pub mod pool;

pub use error::{PoolError, Result};
pub use pool::{scope_key, KeyLease, KeyPool, ScopeSnapshot};
