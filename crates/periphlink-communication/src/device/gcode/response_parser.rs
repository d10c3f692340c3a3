//! G-code Response Parser
//!
//! Classifies lines sent back by a Marlin-style motion controller and
//! extracts coordinates from position reports such as
//! `X:10.00 Y:20.00 Z:5.00 E:0.00 Count X:800 Y:1600 Z:2000`.

use crate::communication::LineClass;
use periphlink_core::Position;

/// Status chatter that never belongs to a response block
pub const DEFAULT_IGNORE_PREFIXES: &[&str] = &["echo:busy: processing", "echo:SD "];

/// Line that ends every response block
pub const DEFAULT_SUCCESS_TOKEN: &str = "ok";

/// Parse the leading `X:<f> Y:<f> Z:<f>` of a position report
///
/// The line is tokenized on spaces and colons; tokens 0, 2 and 4 must name
/// the X, Y and Z axes (case-insensitive) and tokens 1, 3 and 5 must parse
/// as numbers.
pub fn parse_position(line: &str) -> Option<Position> {
    let tokens: Vec<&str> = line
        .split([' ', ':'])
        .filter(|t| !t.is_empty())
        .take(6)
        .collect();
    if tokens.len() < 6 {
        return None;
    }

    let axes_ok = ["x", "y", "z"]
        .iter()
        .enumerate()
        .all(|(i, axis)| tokens[i * 2].eq_ignore_ascii_case(axis));
    if !axes_ok {
        return None;
    }

    let x = tokens[1].parse::<f64>().ok()?;
    let y = tokens[3].parse::<f64>().ok()?;
    let z = tokens[5].parse::<f64>().ok()?;
    Some(Position::new(x, y, z))
}

/// Classifies controller output lines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcodeResponseClassifier {
    ignore_prefixes: Vec<String>,
    success_token: String,
}

impl Default for GcodeResponseClassifier {
    fn default() -> Self {
        Self {
            ignore_prefixes: DEFAULT_IGNORE_PREFIXES.iter().map(|p| p.to_string()).collect(),
            success_token: DEFAULT_SUCCESS_TOKEN.to_string(),
        }
    }
}

impl GcodeResponseClassifier {
    /// Create a classifier with the default prefixes and token
    pub fn new() -> Self {
        Self::default()
    }

    /// Add prefixes of lines to ignore
    pub fn with_ignore_prefixes(mut self, prefixes: impl IntoIterator<Item = String>) -> Self {
        self.ignore_prefixes.extend(prefixes);
        self
    }

    /// Replace the terminating token
    pub fn with_success_token(mut self, token: impl Into<String>) -> Self {
        self.success_token = token.into();
        self
    }

    /// Role of `line` in the conversation
    ///
    /// Checked in order: ignored prefixes, position report, success token.
    pub fn classify(&self, line: &str) -> LineClass {
        let line = line.trim_end_matches(['\r', '\n']);
        if self.ignore_prefixes.iter().any(|p| line.starts_with(p.as_str())) {
            LineClass::Ignore
        } else if parse_position(line).is_some() {
            LineClass::Partial
        } else if line.starts_with(self.success_token.as_str()) {
            LineClass::End
        } else {
            LineClass::Unknown
        }
    }
}
