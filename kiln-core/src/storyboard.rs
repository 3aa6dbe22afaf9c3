//! Storyboard script parsing.
//!
//! Chat models wrap their JSON in prose or markdown fences more often than
//! not, so parsing is tolerant: try the raw text first, then the first
//! balanced `{...}` block found inside it.

use serde::{Deserialize, Serialize};

use crate::error::OrchestrateError;

/// A structured shooting script: acts, each a sequence of shots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Storyboard {
    pub title: Option<String>,
    pub acts: Vec<Act>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Act {
    pub title: Option<String>,
    pub shots: Vec<Shot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Shot {
    pub scene: Option<String>,
    pub description: String,
    pub dialogue: Option<String>,
    /// Camera direction, e.g. "slow push-in".
    pub camera: Option<String>,
}

impl Storyboard {
    /// Parse a model response into a storyboard.
    pub fn parse(text: &str) -> Result<Self, OrchestrateError> {
        let board = match serde_json::from_str::<Storyboard>(text.trim()) {
            Ok(board) => board,
            Err(_) => {
                let block = embedded_json_block(text).ok_or_else(|| {
                    OrchestrateError::Parse("response contains no JSON object".to_owned())
                })?;
                serde_json::from_str::<Storyboard>(block)
                    .map_err(|e| OrchestrateError::Parse(e.to_string()))?
            }
        };
        if board.acts.is_empty() {
            return Err(OrchestrateError::Parse(
                "storyboard has no acts".to_owned(),
            ));
        }
        if board.acts.iter().any(|act| act.shots.is_empty()) {
            return Err(OrchestrateError::Parse(
                "storyboard contains an act with no shots".to_owned(),
            ));
        }
        Ok(board)
    }

    pub fn shot_count(&self) -> usize {
        self.acts.iter().map(|a| a.shots.len()).sum()
    }
}

/// First balanced top-level `{...}` block in `text`, brace-counting so
/// nested objects survive. Braces inside JSON strings are rare enough in
/// model output that string-state tracking is skipped.
fn embedded_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (offset, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}
