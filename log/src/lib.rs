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

//! Tracing setup for `weave_rt`'s event loop diagnostics.
//!
//! `weave_rt` itself only depends on the `tracing` facade (spans/events), never on a
//! particular subscriber — that choice belongs to the embedder. This crate is that
//! choice, made easy: a small, composable [`TracingConfig`] plus two initialization
//! entry points, one process-global and one thread-local (handy for tests that each
//! want their own capture).
//!
//! Logging is **disabled by default**. Nothing is printed unless one of the
//! `try_initialize_*` functions is called with a level other than
//! [`tracing_core::LevelFilter::OFF`].

mod error;
mod tracing_config;
mod tracing_init;

pub use error::LogError;
pub use tracing_config::{DisplayTarget, TracingConfig, WriterConfig};
pub use tracing_init::{file_log, try_initialize_logging_global, try_initialize_logging_thread_local};
