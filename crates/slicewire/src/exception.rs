//! User-exception marshalling.
//!
//! An exception travels as its type-id string followed by one slice per
//! level of its inheritance chain, most-derived first. A receiver that does
//! not recognize the most-derived type skips that slice and retries with the
//! next type id, so an older peer can still surface the closest base
//! exception it understands.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;

use crate::error::{MarshalError, Result};
use crate::stream::Stream;

/// A user-defined exception carried inside a reply message.
///
/// `marshal` writes, for each level of the inheritance chain starting at the
/// most-derived type: the level's type-id string, then one slice
/// (`start_write_slice` / fields / `end_write_slice`). `unmarshal` mirrors
/// that, except the first slice's type id has already been consumed by the
/// dispatch loop in [`Stream::throw_exception`]; base-slice type ids are
/// read (and discarded) by the implementation itself.
pub trait UserException: fmt::Debug + fmt::Display + Send + Sync {
    /// Wire type identifier of the most-derived slice.
    fn type_id(&self) -> &str;

    fn marshal(&self, stream: &mut Stream<'_>) -> Result<()>;

    fn unmarshal(&mut self, stream: &mut Stream<'_>) -> Result<()>;

    /// Downcasting hook so the invoking layer can match concrete types.
    fn as_any(&self) -> &dyn Any;
}

/// Creates a default-initialized exception ready for `unmarshal`.
pub type ExceptionFactory = fn() -> Box<dyn UserException>;

/// Type-id to factory map consulted while decoding a marshalled exception.
/// This is the exception-factory collaborator seam: the stream owns the
/// slice walking, the registry owns type resolution.
#[derive(Debug, Default)]
pub struct ExceptionRegistry {
    factories: HashMap<String, ExceptionFactory>,
}

impl ExceptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, type_id: impl Into<String>, factory: ExceptionFactory) {
        self.factories.insert(type_id.into(), factory);
    }

    pub fn lookup(&self, type_id: &str) -> Option<ExceptionFactory> {
        self.factories.get(type_id).copied()
    }
}

impl Stream<'_> {
    /// Marshal a user exception: type ids and slices, most-derived first.
    pub fn write_exception(&mut self, ex: &dyn UserException) -> Result<()> {
        ex.marshal(self)
    }

    /// Decode a marshalled user exception.
    ///
    /// This call never produces a value: a clean decode yields
    /// [`MarshalError::UserError`] carrying the reconstructed exception,
    /// which the invoking layer raises to its caller. Slices whose type id
    /// has no registered factory are skipped until a known type is found;
    /// when the data runs out the result is
    /// [`MarshalError::UnknownUserException`] naming the most-derived type.
    /// Wire corruption encountered along the way is reported as the usual
    /// error kinds.
    pub fn throw_exception(&mut self, registry: &ExceptionRegistry) -> MarshalError {
        let most_derived = match self.read_string() {
            Ok(id) => id,
            Err(err) => return err,
        };
        let mut type_id = most_derived.clone();
        loop {
            if let Some(factory) = registry.lookup(&type_id) {
                let mut ex = factory();
                return match ex.unmarshal(self) {
                    Ok(()) => MarshalError::UserError(ex),
                    Err(err) => err,
                };
            }
            tracing::debug!(%type_id, "no exception factory, skipping slice");
            if let Err(err) = self.skip_slice() {
                return err;
            }
            if self.pos() >= self.read_limit() {
                return MarshalError::UnknownUserException {
                    type_id: most_derived,
                };
            }
            match self.read_string() {
                Ok(next) => type_id = next,
                // Slices exhausted without a match; what follows is not a
                // type id.
                Err(_) => {
                    return MarshalError::UnknownUserException {
                        type_id: most_derived,
                    }
                }
            }
        }
    }
}
