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

use std::fs::OpenOptions;

use tracing::dispatcher;
use tracing_core::LevelFilter;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

use crate::{DisplayTarget, LogError, TracingConfig, WriterConfig};

const DEFAULT_LOG_FILE_NAME: &str = "weave-rt.log";

fn make_writer(writer_config: &WriterConfig) -> Result<BoxMakeWriter, LogError> {
    let open_file = |path: &str| -> Result<std::fs::File, LogError> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| LogError::LogFileOpen { path: path.to_string(), source })
    };

    Ok(match writer_config {
        WriterConfig::None => BoxMakeWriter::new(std::io::sink),
        WriterConfig::Display(DisplayTarget::Stdout) => BoxMakeWriter::new(std::io::stdout),
        WriterConfig::Display(DisplayTarget::Stderr) => BoxMakeWriter::new(std::io::stderr),
        WriterConfig::File(path) => {
            let file = open_file(path)?;
            BoxMakeWriter::new(move || file.try_clone().expect("clone log file handle"))
        }
        WriterConfig::DisplayAndFile(DisplayTarget::Stdout, path) => {
            let file = open_file(path)?;
            BoxMakeWriter::new(move || file.try_clone().expect("clone log file handle"))
        }
        WriterConfig::DisplayAndFile(DisplayTarget::Stderr, path) => {
            let file = open_file(path)?;
            BoxMakeWriter::new(move || file.try_clone().expect("clone log file handle"))
        }
    })
}

/// Install a process-wide tracing subscriber. Once set, it cannot be unset or
/// replaced — use [`try_initialize_logging_thread_local`] for tests that each want
/// their own subscriber.
///
/// Logging is **disabled by default**: if `options` resolves to
/// [`LevelFilter::OFF`], no subscriber is installed and this returns `Ok(())`
/// without touching the global dispatcher.
pub fn try_initialize_logging_global(options: impl Into<TracingConfig>) -> Result<(), LogError> {
    let config: TracingConfig = options.into();
    if config.level_filter == LevelFilter::OFF {
        return Ok(());
    }

    let writer = make_writer(&config.writer_config)?;
    let subscriber = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_max_level(config.level_filter)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber).map_err(|_| LogError::GlobalAlreadySet)
}

/// Install a thread-local tracing subscriber, active only while the returned guard is
/// held. Returns `Ok(None)` without installing anything if the resolved level filter is
/// [`LevelFilter::OFF`].
pub fn try_initialize_logging_thread_local(
    options: impl Into<TracingConfig>,
) -> Result<Option<dispatcher::DefaultGuard>, LogError> {
    let config: TracingConfig = options.into();
    if config.level_filter == LevelFilter::OFF {
        return Ok(None);
    }

    let writer = make_writer(&config.writer_config)?;
    let subscriber = tracing_subscriber::fmt()
        .with_writer(writer)
        .with_max_level(config.level_filter)
        .with_target(true)
        .finish();

    Ok(Some(tracing::subscriber::set_default(subscriber)))
}

/// Append a single line to a log file without going through `tracing` at all — the
/// bare-minimum fallback used when no subscriber is installed.
pub fn file_log(path: Option<&str>, message: &str) -> Result<(), LogError> {
    use std::io::Write;

    let path = path.unwrap_or(DEFAULT_LOG_FILE_NAME);
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LogError::LogFileOpen { path: path.to_string(), source })?;
    let message = if message.ends_with('\n') { message.to_string() } else { format!("{message}\n") };
    file.write_all(message.as_bytes())
        .map_err(|source| LogError::LogFileOpen { path: path.to_string(), source })
}
