//! Colour output for the operator binary
//!
//! Honours `NO_COLOR` and `--no-color`, and falls back to plain text when
//! stdout is not a terminal.

use std::io::IsTerminal;

use colored::{ColoredString, Colorize};

use crate::plugin::state::PluginState;

/// Manages colour output for the CLI application
#[derive(Debug, Clone)]
pub struct ColourManager {
    enabled: bool,
}

impl ColourManager {
    /// Detect colour support from the environment
    pub fn new() -> Self {
        let no_color = std::env::var_os("NO_COLOR").map_or(false, |v| !v.is_empty());
        Self::with_colours(!no_color && std::io::stdout().is_terminal())
    }

    /// Create a ColourManager with explicit colour control
    pub fn with_colours(enabled: bool) -> Self {
        Self { enabled }
    }

    /// `--no-color` overrides detection
    pub fn from_args(no_color_flag: bool) -> Self {
        if no_color_flag {
            Self::with_colours(false)
        } else {
            Self::new()
        }
    }

    pub fn colours_enabled(&self) -> bool {
        self.enabled
    }

    pub fn error(&self, text: &str) -> ColoredString {
        self.paint(text, |t| t.red())
    }

    pub fn warning(&self, text: &str) -> ColoredString {
        self.paint(text, |t| t.yellow())
    }

    pub fn info(&self, text: &str) -> ColoredString {
        self.paint(text, |t| t.blue())
    }

    pub fn success(&self, text: &str) -> ColoredString {
        self.paint(text, |t| t.green())
    }

    pub fn highlight(&self, text: &str) -> ColoredString {
        self.paint(text, |t| t.cyan().bold())
    }

    /// Colour a lifecycle state by how healthy it is
    pub fn state(&self, state: PluginState) -> ColoredString {
        let text = state.as_str();
        match state {
            PluginState::Running => self.success(text),
            PluginState::Failed => self.error(text),
            PluginState::Paused | PluginState::Stopping | PluginState::Stopped => self.warning(text),
            _ => self.info(text),
        }
    }

    fn paint(&self, text: &str, style: impl Fn(&str) -> ColoredString) -> ColoredString {
        if self.enabled {
            style(text)
        } else {
            text.normal()
        }
    }
}

impl Default for ColourManager {
    fn default() -> Self {
        Self::new()
    }
}
