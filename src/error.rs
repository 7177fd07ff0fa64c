//! Error types for the questline bot.
//!
//! All errors are explicitly typed using thiserror. No panics in production code.

use thiserror::Error;

/// Central error type for all questline operations.
#[derive(Debug, Error)]
pub enum QuestlineError {
    /// Discord API error from serenity.
    #[error("Discord API error: {0}")]
    DiscordApi(#[from] Box<serenity::Error>),

    /// Configuration error (missing env vars, invalid values).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Database error that survived the write-retry wrapper.
    #[error("Database error: {0}")]
    Database(String),

    /// Custom quest definition rejected at creation/edit time.
    #[error("Invalid quest definition: {0}")]
    InvalidQuest(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),
}

impl QuestlineError {
    /// Check if this error indicates the persisted state is in an unknown
    /// condition and the enclosing command should report a hard failure.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Database(_))
    }

    /// Get user-friendly error message (hides internal details).
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::DiscordApi(_) => "Discord service temporarily unavailable",
            Self::Config(_) => "Service configuration error",
            Self::Database(_) => "Storage temporarily unavailable, please try again",
            Self::InvalidQuest(_) => "That quest definition is not valid",
            Self::Json(_) => "Data format error",
            Self::Io(_) => "File system error",
        }
    }
}

/// Result type alias for questline operations.
pub type Result<T> = std::result::Result<T, QuestlineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_database() {
        let err = QuestlineError::Database("disk full".to_string());
        assert_eq!(err.to_string(), "Database error: disk full");
    }

    #[test]
    fn error_display_config() {
        let err = QuestlineError::Config("DISCORD_TOKEN not set".to_string());
        assert_eq!(err.to_string(), "Configuration error: DISCORD_TOKEN not set");
    }

    #[test]
    fn error_display_invalid_quest() {
        let err = QuestlineError::InvalidQuest("empty requirement map".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid quest definition: empty requirement map"
        );
    }

    #[test]
    fn error_is_critical() {
        assert!(QuestlineError::Database("test".to_string()).is_critical());
        assert!(!QuestlineError::Config("test".to_string()).is_critical());
        assert!(!QuestlineError::InvalidQuest("test".to_string()).is_critical());
    }

    #[test]
    fn error_user_message_hides_details() {
        let err = QuestlineError::Database("SELECT * FROM users".to_string());
        assert!(!err.user_message().contains("users"));

        let err = QuestlineError::InvalidQuest("daily_mesages is unknown".to_string());
        assert_eq!(err.user_message(), "That quest definition is not valid");
    }
}
