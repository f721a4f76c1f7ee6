//! Enumeration types for review settings and report output.

use serde::{Deserialize, Serialize};

/// Output format for reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// Human-readable Markdown format.
    #[default]
    Markdown,
    /// Machine-readable JSON format.
    Json,
}

impl ResponseFormat {
    /// Check if this is markdown format.
    #[must_use]
    pub const fn is_markdown(self) -> bool {
        matches!(self, Self::Markdown)
    }

    /// Check if this is JSON format.
    #[must_use]
    pub const fn is_json(self) -> bool {
        matches!(self, Self::Json)
    }
}

/// Direction for citation traversal during snowballing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnowballDirection {
    /// Papers the seed cites (references).
    Backward,
    /// Papers citing the seed (citations).
    Forward,
    /// Both references and citations.
    #[default]
    Both,
}

impl SnowballDirection {
    /// Follow references.
    #[must_use]
    pub const fn backward(self) -> bool {
        matches!(self, Self::Backward | Self::Both)
    }

    /// Follow citations.
    #[must_use]
    pub const fn forward(self) -> bool {
        matches!(self, Self::Forward | Self::Both)
    }

    /// Lower-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Backward => "backward",
            Self::Forward => "forward",
            Self::Both => "both",
        }
    }
}

impl std::fmt::Display for SnowballDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_flags() {
        assert!(SnowballDirection::Both.backward() && SnowballDirection::Both.forward());
        assert!(!SnowballDirection::Backward.forward());
        assert!(!SnowballDirection::Forward.backward());
    }

    #[test]
    fn test_direction_serde() {
        let dir: SnowballDirection = serde_json::from_str("\"forward\"").unwrap();
        assert_eq!(dir, SnowballDirection::Forward);
        assert_eq!(SnowballDirection::default(), SnowballDirection::Both);
    }
}
