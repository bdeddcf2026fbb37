use crate::library::BoxedError;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{self, Display, Formatter};

/// Type erased, serializable error which retains the error chain information
///
/// This error is used to retain information about errors and their causes when
/// sending an `Err(_)` over the wire. The requesting side does not know about
/// the concrete error types of the responding side, it can however embed this
/// error in its own errors and display meaningful information to API consumers.
///
/// When the Error from which this is created contains another BlackboxError in its
/// source chain, it will be consumed and integrated so that one nicely formatted
/// stacktrace can be provided at the top-most level.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(transparent)]
pub struct BlackboxError(Vec<String>);

impl BlackboxError {
    /// Creates a new instance from any error type
    ///
    /// Due to std providing default implementations for the `From<T> where T: T` trait,
    /// we can't both implement `Error` and `From<Error>` and have to decide on one.
    pub fn new<E: Error + 'static>(e: E) -> Self {
        (&e as &(dyn Error + 'static)).into()
    }

    /// Creates a new instance from a boxed error type
    pub fn from_boxed(e: BoxedError) -> Self {
        (e.as_ref() as &(dyn Error + 'static)).into()
    }

    /// Creates an instance with a single cause
    pub fn from_message(message: impl Into<String>) -> Self {
        Self(vec![message.into()])
    }

    /// Prepends a higher-level description to the list of causes
    pub fn context(mut self, message: impl Into<String>) -> Self {
        self.0.insert(0, message.into());
        self
    }

    /// Outermost cause, if any
    pub fn summary(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Borrows the underlying list of causes, outermost first
    pub fn causes(&self) -> &[String] {
        &self.0
    }

    /// Consumes the error and returns the underlying list of causes
    pub fn into_causes(self) -> Vec<String> {
        self.0
    }
}

impl Error for BlackboxError {}

impl Display for BlackboxError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut causes = self.0.iter();

        match causes.next() {
            Some(first) => write!(f, "{}", first)?,
            None => return write!(f, "unknown error"),
        }

        for cause in causes {
            write!(f, ": {}", cause)?;
        }

        Ok(())
    }
}

impl From<&(dyn Error + 'static)> for BlackboxError {
    fn from(e: &(dyn Error + 'static)) -> Self {
        let mut source: Option<&(dyn Error + 'static)> = Some(e);
        let mut causes: Vec<String> = Vec::new();

        while let Some(error) = source {
            // Integrate any child BlackboxErrors and use ToString for anything else
            if let Some(blackbox_error) = error.downcast_ref::<BlackboxError>() {
                let mut child_causes = blackbox_error.0.clone();
                causes.append(&mut child_causes);
            } else {
                causes.push(error.to_string());
            }

            source = error.source();
        }

        Self(causes)
    }
}
