//! Typed error hierarchy for the manager's subsystems.
//!
//! Handlers need to distinguish a handful of failure classes to map them to
//! the right HTTP status (409 for uniqueness, 404 for missing rows, 422 for
//! repo validation). Everything else flows through `anyhow` with context.

use thiserror::Error;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("A project with this name already exists")]
    DuplicateName,

    #[error("A project with this port already exists")]
    DuplicatePort,

    #[error("Project not found")]
    NotFound,

    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from git acquisition and validation.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("URL must start with https://")]
    UrlScheme,

    #[error("URL must end with .git")]
    UrlSuffix,

    #[error("git executable is not available")]
    GitUnavailable,

    #[error("Repository not accessible: {0}")]
    NotAccessible(String),

    #[error("invalid or expired token")]
    TokenInvalid,

    #[error("provider API returned status {0}")]
    TokenUnreachable(u16),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_messages_name_the_field() {
        assert!(StoreError::DuplicateName.to_string().contains("name"));
        assert!(StoreError::DuplicatePort.to_string().contains("port"));
    }

    #[test]
    fn store_error_wraps_rusqlite() {
        let err: StoreError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }

    #[test]
    fn git_error_url_variants_are_distinct() {
        assert!(matches!(GitError::UrlScheme, GitError::UrlScheme));
        assert!(GitError::UrlScheme.to_string().contains("https://"));
        assert!(GitError::UrlSuffix.to_string().contains(".git"));
    }

    #[test]
    fn git_error_token_unreachable_carries_status() {
        let err = GitError::TokenUnreachable(503);
        assert!(err.to_string().contains("503"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::NotFound);
        assert_std_error(&GitError::TokenInvalid);
    }
}
