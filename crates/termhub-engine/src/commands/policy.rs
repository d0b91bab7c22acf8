//! Command validation, preprocessing and side-effect heuristics.

use async_trait::async_trait;
use regex::Regex;
use termhub_core::{BridgeError, BridgeResult, CommandPolicy, SideEffect};

/// Patterns no session ever receives, whatever the configuration says.
const FORBIDDEN: &[(&str, &str)] = &[
    ("recursive removal of /", r"\brm\s+-[a-zA-Z]*[rR][a-zA-Z]*\s+/(?:\s|\*|$)"),
    ("sudo rm -rf", r"\bsudo\s+rm\s+-[a-zA-Z]*[rR][a-zA-Z]*"),
    ("fork bomb", r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:"),
    ("dd onto a block device", r"\bdd\b.*\bof=/dev/(?:sd|hd|vd|nvme|disk|mmcblk)"),
    ("mkfs", r"\bmkfs(?:\.\w+)?\b"),
];

/// Outcome of checking one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Reject(String),
}

/// Compiled form of a [`CommandPolicy`].
#[derive(Debug)]
pub struct CommandValidator {
    max_length: usize,
    forbidden: Vec<(&'static str, Regex)>,
    blocked: Vec<Regex>,
}

impl CommandValidator {
    /// Compile the built-in and configured patterns. An invalid
    /// `blocked_patterns` entry is a configuration error.
    pub fn new(policy: &CommandPolicy) -> BridgeResult<Self> {
        let forbidden = FORBIDDEN
            .iter()
            .map(|(name, pattern)| {
                Regex::new(pattern)
                    .map(|re| (*name, re))
                    .map_err(|e| BridgeError::Other(format!("built-in pattern {name}: {e}")))
            })
            .collect::<BridgeResult<Vec<_>>>()?;
        let blocked = policy
            .blocked_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| BridgeError::Config(format!("blocked pattern {p:?}: {e}")))
            })
            .collect::<BridgeResult<Vec<_>>>()?;
        Ok(Self {
            max_length: policy.max_length,
            forbidden,
            blocked,
        })
    }

    pub fn check(&self, text: &str) -> Verdict {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Verdict::Reject("empty command".into());
        }
        let len = text.chars().count();
        if len > self.max_length {
            return Verdict::Reject(format!(
                "command exceeds max length ({len} > {})",
                self.max_length
            ));
        }
        if let Some((name, _)) = self.forbidden.iter().find(|(_, re)| re.is_match(trimmed)) {
            return Verdict::Reject(format!("forbidden command pattern: {name}"));
        }
        if let Some(re) = self.blocked.iter().find(|re| re.is_match(trimmed)) {
            return Verdict::Reject(format!("blocked pattern: {}", re.as_str()));
        }
        Verdict::Allow
    }
}

/// Rewrites command text before it is validated and forwarded.
///
/// Preprocessors run in registration order; an error rejects the command.
#[async_trait]
pub trait CommandPreprocessor: Send + Sync + 'static {
    async fn process(&self, text: String) -> anyhow::Result<String>;
}

/// Best-effort guess at what a command will change.
pub fn detect_side_effects(text: &str) -> Vec<SideEffect> {
    let text = text.trim();
    let lower = text.to_lowercase();
    let first = lower.split_whitespace().next().unwrap_or("");
    let mut effects = Vec::new();

    if matches!(first, "create" | "touch" | "mkdir" | "cp")
        || lower.contains(" > ")
        || lower.contains(" >> ")
    {
        effects.push(SideEffect::FileCreated);
    }
    if matches!(first, "rm" | "rmdir" | "unlink" | "delete") {
        effects.push(SideEffect::FileDeleted);
    }
    if first == "/compact" {
        effects.push(SideEffect::ContextCompacted);
    }
    if first == "/clear" {
        effects.push(SideEffect::ContextCleared);
    }
    if let Some(rest) = lower.strip_prefix('#') {
        let read_only = rest.starts_with("memory list") || rest.starts_with("memory search");
        if !read_only && !rest.trim().is_empty() {
            effects.push(SideEffect::MemoryUpdated);
        }
    }
    effects
}
