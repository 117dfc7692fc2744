//! Command model: wire templates and the patterns that classify replies.
//!
//! A [`Command`] is pure data. It knows how to expand its template into the
//! bytes to put on the wire ([`Command::bytes`]) and how to judge an incoming
//! buffer against its success and failure patterns. It never does I/O.
//!
//! Commands are usually described in configuration as a [`CommandSpec`] and
//! compiled once:
//!
//! ```
//! use stream_arbiter::{Arg, CommandSpec};
//!
//! let set_freq = CommandSpec {
//!     name: "FREQ".to_string(),
//!     timeout_ms: 500,
//!     template: "FREQ %d\r".to_string(),
//!     validation: r"FREQ [0-9]{1,6}\r".to_string(),
//!     success: r"OK\r".to_string(),
//!     failure: r"ERR[0-9]*\r".to_string(),
//!     description: "Set the carrier frequency in kHz".to_string(),
//! }
//! .compile()
//! .unwrap();
//!
//! assert_eq!(set_freq.bytes(&[Arg::from(1440)]).unwrap(), b"FREQ 1440\r");
//! assert!(set_freq.bytes(&[Arg::from(12345678)]).is_err());
//! ```

mod set;
mod template;

pub use set::CommandSet;
pub use template::{expand, Arg};

use std::fmt;
use std::ops::Range;
use std::time::Duration;

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{CommandError, EngineError};

/// A pattern that can never match anything; the default failure pattern.
pub const NEVER_MATCHES: &str = r"\b\B";

fn never_matches() -> String {
    NEVER_MATCHES.to_string()
}

/// Uncompiled, serializable description of a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Base form of the command, usually without arguments (`WTF` for
    /// `WTF403.00\r\n`).
    pub name: String,
    /// Time allowed for a reply before the command is considered failed.
    pub timeout_ms: u64,
    /// printf-style template expanded with the caller's arguments.
    pub template: String,
    /// Pattern the whole expanded template must match.
    pub validation: String,
    /// Pattern matching good/affirmative replies anywhere in the buffer.
    pub success: String,
    /// Pattern matching bad/negative replies anywhere in the buffer.
    #[serde(default = "never_matches")]
    pub failure: String,
    #[serde(default)]
    pub description: String,
}

impl CommandSpec {
    /// Compile the three patterns and produce an immutable [`Command`].
    ///
    /// # Errors
    ///
    /// Returns `CommandError::InvalidPattern` naming the first pattern that
    /// fails to compile.
    pub fn compile(&self) -> Result<Command, CommandError> {
        let pattern = |field: &'static str, expr: &str| {
            Regex::new(expr).map_err(|source| CommandError::InvalidPattern {
                command: self.name.clone(),
                field,
                source,
            })
        };

        Ok(Command {
            timeout: Duration::from_millis(self.timeout_ms),
            validation: pattern("validation", &format!("^(?:{})$", self.validation))?,
            success: pattern("success", &self.success)?,
            failure: pattern("failure", &self.failure)?,
            spec: self.clone(),
        })
    }
}

impl TryFrom<CommandSpec> for Command {
    type Error = CommandError;

    fn try_from(spec: CommandSpec) -> Result<Self, Self::Error> {
        spec.compile()
    }
}

/// A compiled command. Cheap to clone; the patterns are shared.
#[derive(Debug, Clone)]
pub struct Command {
    spec: CommandSpec,
    timeout: Duration,
    validation: Regex,
    success: Regex,
    failure: Regex,
}

/// Outcome of judging a reply buffer at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Verdict {
    /// Still waiting for a timeout, failure match or success match.
    Unformed,
    TimedOut,
    Failed,
    /// The success pattern matched this span of the buffer.
    Matched(Range<usize>),
}

impl Command {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn template(&self) -> &str {
        &self.spec.template
    }

    pub fn description(&self) -> &str {
        &self.spec.description
    }

    pub fn success(&self) -> &Regex {
        &self.success
    }

    pub fn failure(&self) -> &Regex {
        &self.failure
    }

    /// The uncompiled form this command was built from.
    pub fn spec(&self) -> &CommandSpec {
        &self.spec
    }

    /// Expand the template with `args` into the bytes to write on the wire.
    ///
    /// # Errors
    ///
    /// - `EngineError::Args` if there are too few or too many arguments, or
    ///   one has the wrong type for its verb
    /// - `EngineError::Format` if the expanded text does not fully match the
    ///   validation pattern
    ///
    /// Both carry the expanded text for diagnostics.
    pub fn bytes(&self, args: &[Arg]) -> Result<Vec<u8>, EngineError> {
        let formed = template::expand(&self.spec.template, args);
        if formed.contains(template::BAD_VERB) {
            return Err(EngineError::Args { formed });
        }
        if !self.validation.is_match(formed.as_bytes()) {
            return Err(EngineError::Format { formed });
        }
        Ok(formed.into_bytes())
    }

    /// Judge `buffer` after `elapsed` time waiting for a reply.
    ///
    /// Rules apply in fixed priority: deadline, then failure pattern, then
    /// success pattern. A match arriving in the same poll the deadline passes
    /// is a timeout.
    pub(crate) fn classify(&self, buffer: &[u8], elapsed: Duration) -> Verdict {
        if elapsed > self.timeout {
            Verdict::TimedOut
        } else if self.failure.is_match(buffer) {
            Verdict::Failed
        } else if let Some(found) = self.success.find(buffer) {
            Verdict::Matched(found.range())
        } else {
            Verdict::Unformed
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sanitize = |s: &str| s.replace('\r', "\\r").replace('\n', "\\n");
        write!(
            f,
            "{}: {:?} Template:\"{}\" Validation:\"{}\" Success:\"{}\" Failure:\"{}\"",
            self.spec.name,
            self.timeout,
            sanitize(&self.spec.template),
            sanitize(&self.spec.validation),
            sanitize(&self.spec.success),
            sanitize(&self.spec.failure),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec(template: &str, validation: &str) -> CommandSpec {
        CommandSpec {
            name: "test".to_string(),
            timeout_ms: 5_000,
            template: template.to_string(),
            validation: validation.to_string(),
            success: "[a-z]{1,}\n".to_string(),
            failure: "[0-9]{1,}\n".to_string(),
            description: String::new(),
        }
    }

    #[test]
    fn test_bytes_formats_clean_arguments() {
        let cmd = spec("MOV %d,%s\r", r"MOV [0-9]+,[A-Z]+\r").compile().unwrap();
        let bytes = cmd.bytes(&[Arg::from(12), Arg::from("UP")]).unwrap();
        assert_eq!(bytes, b"MOV 12,UP\r".to_vec());
    }

    #[test]
    fn test_bytes_zero_argument_template() {
        let cmd = spec("\r", "\r").compile().unwrap();
        assert_eq!(cmd.bytes(&[]).unwrap(), b"\r".to_vec());
    }

    #[test]
    fn test_bytes_argument_mismatch_keeps_formed_text() {
        let cmd = spec("%d", ".*").compile().unwrap();
        match cmd.bytes(&[Arg::from("hello")]) {
            Err(EngineError::Args { formed }) => assert_eq!(formed, "%!d(str=hello)"),
            other => panic!("expected Args error, got {other:?}"),
        }

        let needs_arg = spec("Req Arg, No Arg %d\r", ".*").compile().unwrap();
        assert!(matches!(needs_arg.bytes(&[]), Err(EngineError::Args { .. })));
        assert!(matches!(
            needs_arg.bytes(&[Arg::from(1), Arg::from(2)]),
            Err(EngineError::Args { .. })
        ));
    }

    #[test]
    fn test_bytes_oversized_width_is_argument_error() {
        for template in ["SET %99999999999999999999d\r", "SET %.2000000f\r"] {
            let cmd = spec(template, ".*").compile().unwrap();
            match cmd.bytes(&[Arg::from(1.5)]) {
                Err(EngineError::Args { formed }) => assert!(formed.contains("%!(BAD"), "{formed}"),
                other => panic!("{template:?}: expected Args error, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_bytes_format_violation() {
        let cmd = spec("SET %d\r", r"SET [0-9]\r").compile().unwrap();
        assert!(cmd.bytes(&[Arg::from(7)]).is_ok());
        match cmd.bytes(&[Arg::from(42)]) {
            Err(EngineError::Format { formed }) => assert_eq!(formed, "SET 42\r"),
            other => panic!("expected Format error, got {other:?}"),
        }
    }

    #[test]
    fn test_validation_must_match_whole_text() {
        let cmd = spec("XSET 1\r\n", r"SET [0-9]").compile().unwrap();
        assert!(matches!(cmd.bytes(&[]), Err(EngineError::Format { .. })));
    }

    #[test]
    fn test_invalid_pattern_names_field() {
        let mut bad = spec("x", "x");
        bad.success = "([".to_string();
        match bad.compile() {
            Err(CommandError::InvalidPattern { command, field, .. }) => {
                assert_eq!(command, "test");
                assert_eq!(field, "success");
            }
            other => panic!("expected InvalidPattern, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_priority() {
        let cmd = spec("test", "test").compile().unwrap();
        let fresh = Duration::ZERO;
        let late = Duration::from_secs(10);

        assert_eq!(cmd.classify(b"", fresh), Verdict::Unformed);
        assert_eq!(cmd.classify(b"", late), Verdict::TimedOut);
        assert_eq!(cmd.classify(b"1234567890\n", fresh), Verdict::Failed);
        assert_eq!(cmd.classify(b"abcdefg\n", fresh), Verdict::Matched(0..8));

        // Deadline wins over a match, failure wins over success.
        assert_eq!(cmd.classify(b"abcdefg\n", late), Verdict::TimedOut);
        assert_eq!(cmd.classify(b"abc\n123\n", fresh), Verdict::Failed);
    }

    #[test]
    fn test_classify_reports_only_matched_span() {
        let cmd = spec("test", "test").compile().unwrap();
        assert_eq!(cmd.classify(b"\x02\x03 status ok\n ", Duration::ZERO), Verdict::Matched(10..13));
    }

    #[test]
    fn test_timeout_is_strict() {
        let cmd = spec("test", "test").compile().unwrap();
        assert_eq!(cmd.classify(b"", cmd.timeout()), Verdict::Unformed);
    }

    #[test]
    fn test_default_failure_never_matches() {
        let parsed: CommandSpec = serde_json::from_str(
            r#"{"name":"ping","timeout_ms":300,"template":"\r","validation":"\r","success":"\r"}"#,
        )
        .unwrap();
        assert_eq!(parsed.failure, NEVER_MATCHES);
        assert_eq!(parsed.description, "");

        let cmd = parsed.compile().unwrap();
        assert!(!cmd.failure().is_match(b""));
        assert!(!cmd.failure().is_match(b"anything at all\r\n0"));
    }

    #[test]
    fn test_display_escapes_line_endings() {
        let cmd = spec("PING\r\n", "PING\r\n").compile().unwrap();
        let shown = cmd.to_string();
        assert!(shown.starts_with("test: 5s Template:\"PING\\r\\n\""), "{shown}");
        assert!(!shown.contains('\r'));
        assert!(!shown.contains('\n'));
    }
}
