//! Backend implementations for state storage

mod local;

use std::path::PathBuf;

pub use local::LocalBackend;

use crate::backend::{BackendError, BackendResult, StateBackend};

/// Create a backend by type name
///
/// Only `local` exists today; `path` defaults to `stratus.state.json`.
pub fn create_backend(
    backend_type: &str,
    path: Option<PathBuf>,
) -> BackendResult<Box<dyn StateBackend>> {
    match backend_type {
        "local" => Ok(Box::new(match path {
            Some(path) => LocalBackend::new(path),
            None => LocalBackend::default(),
        })),
        other => Err(BackendError::UnsupportedBackend(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_backend_is_rejected() {
        match create_backend("s3", None) {
            Err(BackendError::UnsupportedBackend(name)) => assert_eq!(name, "s3"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn local_backend_uses_given_path() {
        assert!(create_backend("local", Some(PathBuf::from("custom.json"))).is_ok());
    }
}
