//! Stratus State Management
//!
//! Persists the identifiers and attributes of converged resources between
//! runs, with an advisory lock so two applies never interleave.
//!
//! # Example
//!
//! ```ignore
//! use stratus_state::{create_backend, StateFile};
//!
//! let backend = create_backend("local", None)?;
//! let lock = backend.acquire_lock("apply").await?;
//! let mut state = backend.read_state().await?.unwrap_or_default();
//!
//! // ... apply effects, recording each outcome ...
//!
//! state.increment_serial();
//! backend.write_state(&state).await?;
//! backend.release_lock(&lock).await?;
//! ```

pub mod backend;
pub mod backends;
pub mod lock;
pub mod state;

pub use backend::{BackendError, BackendResult, StateBackend};
pub use backends::{LocalBackend, create_backend};
pub use lock::LockInfo;
pub use state::{ResourceState, StateFile};
