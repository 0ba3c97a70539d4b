//! Assistant bridge for the relay.
//!
//! Prompts are sanitized into a [`SanitizedMessage`], then answered by the
//! in-process SDK path or, failing that, by spawning the assistant CLI.

mod cli;
mod error;
mod invoker;
mod sanitize;
mod sdk;

pub use cli::{CliConfig, CliInvoker, extract_reply};
pub use error::{AssistantError, ErrorCategory, Result, SdkError};
pub use invoker::{AssistantInvoker, AssistantReply, Provenance, SdkOutcome};
pub use sanitize::{MAX_PROMPT_CHARS, SanitizeError, SanitizedMessage, sanitize};
pub use sdk::{AssistantSdk, MessagesApiSdk, SdkEvent, SdkEventStream, SdkRequest};
