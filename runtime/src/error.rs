/*
 *   Copyright (c) 2024 The weave-rt Authors
 *
 *   Licensed under the Apache License, Version 2.0 (the "License");
 *   you may not use this file except in compliance with the License.
 *   You may obtain a copy of the License at
 *
 *   http://www.apache.org/licenses/LICENSE-2.0
 *
 *   Unless required by applicable law or agreed to in writing, software
 *   distributed under the License is distributed on an "AS IS" BASIS,
 *   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *   See the License for the specific language governing permissions and
 *   limitations under the License.
 */

use std::{fmt, rc::Rc, time::Duration};

/// A rejection reason. The source system allows a promise to reject with either a
/// thrown error or an arbitrary value; this is the typed equivalent: either a real
/// `Error` (preserved with its original type via `dyn Error`) or an opaque value that
/// only ever had a string form to begin with.
///
/// Not `Send`/`Sync` on purpose — the whole runtime lives on one thread.
#[derive(Clone)]
pub enum Rejection {
    Error(Rc<dyn std::error::Error>),
    Opaque(Rc<str>),
}

impl Rejection {
    pub fn from_error<E: std::error::Error + 'static>(error: E) -> Self {
        Rejection::Error(Rc::new(error))
    }

    pub fn from_display<T: fmt::Display>(value: T) -> Self {
        Rejection::Opaque(Rc::from(value.to_string()))
    }

    /// The string form of the reason, regardless of which variant it is. Used by
    /// `any()`'s aggregate error and by unhandled-rejection diagnostics.
    pub fn message(&self) -> String {
        match self {
            Rejection::Error(e) => e.to_string(),
            Rejection::Opaque(s) => s.to_string(),
        }
    }
}

impl fmt::Debug for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::Error(e) => write!(f, "Rejection::Error({e})"),
            Rejection::Opaque(s) => write!(f, "Rejection::Opaque({s})"),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.message()) }
}

impl From<RuntimeError> for Rejection {
    fn from(error: RuntimeError) -> Self { Rejection::from_error(error) }
}

/// Errors surfaced at the runtime's external boundary. `thiserror` gives each
/// variant a typed, matchable shape instead of collapsing everything into one
/// string-carrying struct — rejection reasons stay sum-typed all the way out.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("operation was cancelled")]
    Cancellation,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("await called outside of a coroutine")]
    NotInCoroutine,

    #[error("chaining cycle: a promise cannot adopt itself")]
    ChainingCycle,

    #[error("no promises were provided")]
    NoPromises,

    #[error("all {} promise(s) rejected", .reasons.len())]
    Aggregate { reasons: Vec<Rejection> },

    #[error("{0}")]
    Rejected(Rejection),
}

impl RuntimeError {
    pub fn aggregate(reasons: Vec<Rejection>) -> Self { RuntimeError::Aggregate { reasons } }
}

/// What `run()` and friends return: either the root promise's resolved value, or
/// the runtime error that surfaced its failure.
pub type RunResult<T> = Result<T, RuntimeError>;

/// What a promise settles with internally: a reference-counted value (cheap to hand to
/// every registered handler) or a rejection reason.
pub type Settled<T> = Result<Rc<T>, Rejection>;
