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

use std::ops::Add;

use tracing_core::LevelFilter;

/// Where formatted events are written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisplayTarget {
    Stdout,
    Stderr,
}

/// Where the subscriber writes. Composable via [`Add`] — the right-hand side wins on
/// conflict, matching the "higher specificity clobbers" merge rule used throughout
/// this crate's config types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterConfig {
    None,
    Display(DisplayTarget),
    File(String),
    DisplayAndFile(DisplayTarget, String),
}

impl Default for WriterConfig {
    fn default() -> Self { WriterConfig::Display(DisplayTarget::Stdout) }
}

impl WriterConfig {
    fn display(&self) -> Option<DisplayTarget> {
        match self {
            WriterConfig::Display(d) | WriterConfig::DisplayAndFile(d, _) => Some(d.clone()),
            WriterConfig::None | WriterConfig::File(_) => None,
        }
    }

    fn file(&self) -> Option<String> {
        match self {
            WriterConfig::File(f) | WriterConfig::DisplayAndFile(_, f) => Some(f.clone()),
            WriterConfig::None | WriterConfig::Display(_) => None,
        }
    }
}

impl Add for WriterConfig {
    type Output = Self;

    /// Merge two writer configs. `rhs` has higher specificity: a field set on `rhs`
    /// always overwrites the same field on `self`; an unset (`None`-ish) field never
    /// overwrites one that was set.
    fn add(self, rhs: Self) -> Self::Output {
        if matches!(self, WriterConfig::None) {
            return rhs;
        }
        if matches!(rhs, WriterConfig::None) {
            return self;
        }

        let display = rhs.display().or_else(|| self.display());
        let file = rhs.file().or_else(|| self.file());

        match (display, file) {
            (Some(d), Some(f)) => WriterConfig::DisplayAndFile(d, f),
            (Some(d), None) => WriterConfig::Display(d),
            (None, Some(f)) => WriterConfig::File(f),
            (None, None) => WriterConfig::None,
        }
    }
}

/// Composable tracing configuration: a level filter plus a writer target.
///
/// ```
/// use weave_log::{TracingConfig, WriterConfig, DisplayTarget};
/// use tracing_core::LevelFilter;
///
/// let config: TracingConfig = LevelFilter::DEBUG.into();
/// let with_file: TracingConfig = WriterConfig::File("weave.log".to_string()).into();
/// let combined = config + with_file;
/// assert_eq!(combined.level_filter, LevelFilter::DEBUG);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracingConfig {
    pub level_filter: LevelFilter,
    pub writer_config: WriterConfig,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level_filter: LevelFilter::OFF,
            writer_config: WriterConfig::default(),
        }
    }
}

impl Add for TracingConfig {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            level_filter: self.level_filter.max(rhs.level_filter),
            writer_config: self.writer_config + rhs.writer_config,
        }
    }
}

impl From<LevelFilter> for TracingConfig {
    fn from(level_filter: LevelFilter) -> Self {
        Self { level_filter, writer_config: WriterConfig::default() }
    }
}

impl From<tracing::Level> for TracingConfig {
    fn from(level: tracing::Level) -> Self { LevelFilter::from_level(level).into() }
}

impl From<WriterConfig> for TracingConfig {
    fn from(writer_config: WriterConfig) -> Self {
        Self { level_filter: LevelFilter::DEBUG, writer_config }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn writer_config_none_is_identity() {
        let none = WriterConfig::None;
        let stdout = WriterConfig::Display(DisplayTarget::Stdout);
        assert_eq!(none.clone() + stdout.clone(), stdout);
        assert_eq!(stdout.clone() + none, stdout);
    }

    #[test]
    fn writer_config_rhs_wins_on_same_kind() {
        let stdout = WriterConfig::Display(DisplayTarget::Stdout);
        let stderr = WriterConfig::Display(DisplayTarget::Stderr);
        assert_eq!(stdout + stderr.clone(), stderr);
    }

    #[test]
    fn writer_config_display_and_file_compose() {
        let stdout = WriterConfig::Display(DisplayTarget::Stdout);
        let file = WriterConfig::File("a.log".to_string());
        assert_eq!(
            stdout + file,
            WriterConfig::DisplayAndFile(DisplayTarget::Stdout, "a.log".to_string())
        );
    }

    #[test]
    fn tracing_config_add_takes_max_level() {
        let a: TracingConfig = LevelFilter::INFO.into();
        let b: TracingConfig = LevelFilter::TRACE.into();
        assert_eq!((a + b).level_filter, LevelFilter::TRACE);
    }
}
