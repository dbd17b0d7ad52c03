//! Error type shared by the store traits, the apply engine and the router.

use std::fmt;

use thiserror::Error;

use crate::{Gvk, ObjectKey};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{gvk} {key} not found")]
    NotFound { gvk: Gvk, key: ObjectKey },

    #[error("{gvk} {key} already exists")]
    AlreadyExists { gvk: Gvk, key: ObjectKey },

    /// Optimistic-concurrency or other write conflict reported by the store.
    #[error("conflict on {gvk} {key}: {message}")]
    Conflict { gvk: Gvk, key: ObjectKey, message: String },

    /// The object exists but is managed by a different owner.
    #[error("ownership conflict on {gvk} {key}: {message}")]
    OwnershipConflict { gvk: Gvk, key: ObjectKey, message: String },

    #[error("invalid selector {selector:?}: {message}")]
    InvalidSelector { selector: String, message: String },

    #[error("invalid object: {0}")]
    InvalidObject(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("watch {gvk}: {message}")]
    Watch { gvk: Gvk, message: String },

    #[error("backend error: {0}")]
    Backend(String),

    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },

    #[error(transparent)]
    Aggregate(#[from] MultiError),
}

impl Error {
    pub fn backend(err: impl fmt::Display) -> Self {
        Error::Backend(err.to_string())
    }

    /// Wrap with a prefix while keeping the kind checks (`is_not_found`, ...) working.
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context { context: context.into(), source: Box::new(self) }
    }

    fn root(&self) -> &Error {
        match self {
            Error::Context { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self.root(), Error::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self.root(), Error::Conflict { .. })
    }
}

/// Collected failures of a multi-object operation. Never empty.
#[derive(Debug)]
pub struct MultiError(Vec<Error>);

impl MultiError {
    pub fn errors(&self) -> &[Error] {
        &self.0
    }

    pub fn into_errors(self) -> Vec<Error> {
        self.0
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

/// Fold a batch of results into one: `Ok` when all succeeded, the single error
/// when exactly one failed, otherwise an [`Error::Aggregate`]. Nested aggregates are flattened.
pub fn aggregate<I>(results: I) -> Result<()>
where
    I: IntoIterator<Item = Result<()>>,
{
    let mut errs = Vec::new();
    for res in results {
        match res {
            Ok(()) => {}
            Err(Error::Aggregate(multi)) => errs.extend(multi.0),
            Err(e) => errs.push(e),
        }
    }
    match errs.len() {
        0 => Ok(()),
        1 => Err(errs.remove(0)),
        _ => Err(Error::Aggregate(MultiError(errs))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nf(name: &str) -> Error {
        Error::NotFound { gvk: Gvk::new("", "v1", "ConfigMap"), key: ObjectKey::new("ns", name) }
    }

    #[test]
    fn aggregate_flattens_and_unwraps_single() {
        assert!(aggregate(vec![Ok(()), Ok(())]).is_ok());

        let single = aggregate(vec![Ok(()), Err(nf("a"))]).unwrap_err();
        assert!(single.is_not_found());

        let inner = aggregate(vec![Err(nf("a")), Err(nf("b"))]);
        let outer = aggregate(vec![inner, Err(Error::Backend("boom".into()))]).unwrap_err();
        match outer {
            Error::Aggregate(m) => assert_eq!(m.errors().len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn context_keeps_kind() {
        let err = nf("a").context("failed to get");
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "failed to get: v1/ConfigMap ns/a not found");
    }
}
