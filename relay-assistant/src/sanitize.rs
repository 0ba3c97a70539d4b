//! Prompt sanitization ahead of any assistant invocation.

use std::fmt;
use std::ops::Deref;
use thiserror::Error;

/// Upper bound on prompt length, in characters.
pub const MAX_PROMPT_CHARS: usize = 4000;

/// Characters that carry meaning to a shell and are never forwarded.
const STRIPPED_CHARS: [char; 3] = ['$', '`', '\\'];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SanitizeError {
    #[error("message is empty after sanitization")]
    Empty,
}

/// Prompt text that passed [`sanitize`]. Non-empty, at most
/// [`MAX_PROMPT_CHARS`] characters, free of `$`, backtick and backslash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SanitizedMessage(String);

impl SanitizedMessage {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn char_count(&self) -> usize {
        self.0.chars().count()
    }
}

impl Deref for SanitizedMessage {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl fmt::Display for SanitizedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn sanitize(raw: &str) -> Result<SanitizedMessage, SanitizeError> {
    let stripped: String = raw.chars().filter(|c| !STRIPPED_CHARS.contains(c)).collect();
    let trimmed = stripped.trim();
    let bounded: String = trimmed.chars().take(MAX_PROMPT_CHARS).collect();
    if bounded.is_empty() {
        return Err(SanitizeError::Empty);
    }
    Ok(SanitizedMessage(bounded))
}
