pub mod command;
pub mod environment;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod output;
pub mod request;
pub mod runner;
pub mod settings_layer;
pub mod workspace;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Restore,
    Colorize,
}

impl EngineKind {
    pub const ALL: [Self; 2] = [Self::Restore, Self::Colorize];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Restore => "restore",
            Self::Colorize => "colorize",
        }
    }

    /// Human-facing name of the external tool behind this engine kind.
    pub fn tool_name(self) -> &'static str {
        match self {
            Self::Restore => "Real-ESRGAN",
            Self::Colorize => "DeOldify",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "restore" | "realesrgan" | "real-esrgan" => Some(Self::Restore),
            "colorize" | "colourise" | "deoldify" => Some(Self::Colorize),
            _ => None,
        }
    }

    pub(crate) fn slot(self) -> usize {
        match self {
            Self::Restore => 0,
            Self::Colorize => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_engine_aliases_case_insensitively() {
        assert_eq!(EngineKind::parse("Restore"), Some(EngineKind::Restore));
        assert_eq!(EngineKind::parse(" real-esrgan "), Some(EngineKind::Restore));
        assert_eq!(EngineKind::parse("DeOldify"), Some(EngineKind::Colorize));
        assert_eq!(EngineKind::parse("upscale"), None);
    }

    #[test]
    fn engine_slots_are_distinct() {
        assert_ne!(EngineKind::Restore.slot(), EngineKind::Colorize.slot());
    }
}
