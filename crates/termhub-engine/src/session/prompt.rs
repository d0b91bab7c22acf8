//! Interactive prompt detection on raw terminal output.

use regex::Regex;
use termhub_core::{BridgeError, BridgeResult};

/// Decides whether a chunk of output ends at an interactive prompt.
///
/// Only the last non-blank line of the chunk is inspected, after ANSI
/// escape sequences are removed.
#[derive(Debug, Clone)]
pub struct PromptDetector {
    ansi: Regex,
    prompt: Regex,
}

impl PromptDetector {
    pub fn new() -> BridgeResult<Self> {
        let ansi = Regex::new(
            r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]",
        )
        .map_err(|e| BridgeError::Other(format!("ansi pattern: {e}")))?;
        let prompt = Regex::new(
            r"claude-code>|^\s*(?:Human|Assistant):|[$#>❯]\s*$|Continue\?|\by/n\b",
        )
        .map_err(|e| BridgeError::Other(format!("prompt pattern: {e}")))?;
        Ok(Self { ansi, prompt })
    }

    /// Text with escape sequences removed.
    pub fn strip_ansi(&self, text: &str) -> String {
        self.ansi.replace_all(text, "").into_owned()
    }

    pub fn is_prompt(&self, data: &[u8]) -> bool {
        let text = String::from_utf8_lossy(data);
        let clean = self.strip_ansi(&text);
        clean
            .split(['\n', '\r'])
            .rev()
            .find(|line| !line.trim().is_empty())
            .is_some_and(|line| self.prompt.is_match(line))
    }
}
