//! Session configuration
//!
//! Holds the user-editable parameters of a live session (persona text, voice
//! identity, enabled tools) plus the process-level settings read from the
//! environment at start-up.

use crate::tools::ToolKind;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Live model used when `RHOVOICE_MODEL` is not set.
pub const DEFAULT_MODEL: &str = "models/gemini-live-2.5-flash-preview";

/// Persona used when none is configured.
pub const DEFAULT_PERSONA: &str = "You are a helpful AI assistant.";

/// Delay between tearing a session down and reconnecting it.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Errors raised while building or mutating configuration
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("GEMINI_API_KEY is not set")]
    MissingApiKey,

    #[error("unknown voice '{0}'")]
    UnknownVoice(String),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("unknown preset '{0}'")]
    UnknownPreset(String),

    #[error("persona text must not be empty")]
    EmptyPersona,

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Prebuilt voices offered by the live model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Voice {
    Zephyr,
    Puck,
    Charon,
    Kore,
    Fenrir,
    Leda,
    #[default]
    Orus,
    Aoede,
}

impl Voice {
    pub const ALL: [Voice; 8] = [
        Voice::Zephyr,
        Voice::Puck,
        Voice::Charon,
        Voice::Kore,
        Voice::Fenrir,
        Voice::Leda,
        Voice::Orus,
        Voice::Aoede,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Zephyr => "Zephyr",
            Self::Puck => "Puck",
            Self::Charon => "Charon",
            Self::Kore => "Kore",
            Self::Fenrir => "Fenrir",
            Self::Leda => "Leda",
            Self::Orus => "Orus",
            Self::Aoede => "Aoede",
        }
    }
}

impl fmt::Display for Voice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Voice {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Voice::ALL
            .iter()
            .copied()
            .find(|v| v.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ConfigError::UnknownVoice(wanted.to_string()))
    }
}

/// A named persona the user can switch to quickly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub name: &'static str,
    pub prompt: &'static str,
}

pub const PRESETS: &[Preset] = &[
    Preset {
        name: "Default Assistant",
        prompt: DEFAULT_PERSONA,
    },
    Preset {
        name: "Creative Writer",
        prompt: "You are a creative writing assistant. Help users with storytelling, character development, and creative ideas. Be imaginative and inspiring.",
    },
    Preset {
        name: "Technical Expert",
        prompt: "You are a technical expert specializing in programming, engineering, and technology. Provide detailed, accurate technical explanations and solutions.",
    },
    Preset {
        name: "Casual Friend",
        prompt: "You are a friendly, casual conversation partner. Be warm, engaging, and speak in a relaxed, conversational tone like a good friend.",
    },
    Preset {
        name: "Teacher",
        prompt: "You are an educational tutor. Explain concepts clearly, ask questions to check understanding, and adapt your teaching style to help the user learn effectively.",
    },
    Preset {
        name: "Motivational Coach",
        prompt: "You are an enthusiastic motivational coach. Be encouraging, positive, and help users achieve their goals with energy and inspiration.",
    },
];

/// Look up a preset by name, ignoring case.
pub fn preset(name: &str) -> Result<&'static Preset, ConfigError> {
    let wanted = name.trim();
    PRESETS
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(wanted))
        .ok_or_else(|| ConfigError::UnknownPreset(wanted.to_string()))
}

/// Parameters of one live session. Any change forces a reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub persona: String,
    pub voice: Voice,
    pub tools: BTreeSet<ToolKind>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persona: DEFAULT_PERSONA.to_string(),
            voice: Voice::default(),
            tools: ToolKind::ALL.iter().copied().collect(),
        }
    }
}

impl SessionConfig {
    /// Normalise and validate persona text.
    pub fn normalize_persona(text: &str) -> Result<String, ConfigError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ConfigError::EmptyPersona);
        }
        Ok(trimmed.to_string())
    }
}

/// Parse a comma separated tool list. `none` (or an empty string) disables all tools.
pub fn parse_tool_list(list: &str) -> Result<BTreeSet<ToolKind>, ConfigError> {
    let list = list.trim();
    if list.is_empty() || list.eq_ignore_ascii_case("none") {
        return Ok(BTreeSet::new());
    }
    if list.eq_ignore_ascii_case("all") {
        return Ok(ToolKind::ALL.iter().copied().collect());
    }
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<ToolKind>())
        .collect()
}

/// Process-level configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub api_key: String,
    pub model: String,
    pub session: SessionConfig,
    pub input_device: Option<String>,
    pub settle_delay: Duration,
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let api_key = lookup("GEMINI_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or(ConfigError::MissingApiKey)?;

        let mut session = SessionConfig::default();
        if let Some(voice) = lookup("RHOVOICE_VOICE") {
            session.voice = voice.parse()?;
        }
        if let Some(persona) = lookup("RHOVOICE_PERSONA") {
            session.persona = SessionConfig::normalize_persona(&persona)?;
        }
        if let Some(tools) = lookup("RHOVOICE_TOOLS") {
            session.tools = parse_tool_list(&tools)?;
        }

        let settle_delay = match lookup("RHOVOICE_SETTLE_MS") {
            Some(ms) => Duration::from_millis(ms.trim().parse().map_err(|_| {
                ConfigError::InvalidValue {
                    key: "RHOVOICE_SETTLE_MS",
                    value: ms.clone(),
                }
            })?),
            None => SETTLE_DELAY,
        };

        Ok(Self {
            api_key,
            model: lookup("RHOVOICE_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            session,
            input_device: lookup("RHOVOICE_INPUT_DEVICE").filter(|d| !d.is_empty()),
            settle_delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_voice_parse_is_case_insensitive() {
        assert_eq!("kore".parse::<Voice>().unwrap(), Voice::Kore);
        assert_eq!(" AOEDE ".parse::<Voice>().unwrap(), Voice::Aoede);
        assert_eq!(
            "Robot".parse::<Voice>(),
            Err(ConfigError::UnknownVoice("Robot".to_string()))
        );
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.voice, Voice::Orus);
        assert_eq!(config.persona, DEFAULT_PERSONA);
        assert_eq!(config.tools.len(), ToolKind::ALL.len());
    }

    #[test]
    fn test_preset_lookup() {
        assert!(preset("teacher").unwrap().prompt.contains("tutor"));
        assert!(matches!(preset("pirate"), Err(ConfigError::UnknownPreset(_))));
    }

    #[test]
    fn test_persona_rejects_blank_text() {
        assert_eq!(
            SessionConfig::normalize_persona("   \n"),
            Err(ConfigError::EmptyPersona)
        );
        assert_eq!(SessionConfig::normalize_persona("  hi ").unwrap(), "hi");
    }

    #[test]
    fn test_tool_list_parsing() {
        assert!(parse_tool_list("none").unwrap().is_empty());
        let tools = parse_tool_list("weather, console_log_name").unwrap();
        assert!(tools.contains(&ToolKind::Weather));
        assert!(tools.contains(&ToolKind::ConsoleLogName));
        assert_eq!(
            parse_tool_list("weather,teleport"),
            Err(ConfigError::UnknownTool("teleport".to_string()))
        );
    }

    #[test]
    fn test_app_config_requires_api_key() {
        let err = AppConfig::from_lookup(lookup_from(&[])).unwrap_err();
        assert_eq!(err, ConfigError::MissingApiKey);
    }

    #[test]
    fn test_app_config_from_lookup() {
        let config = AppConfig::from_lookup(lookup_from(&[
            ("GEMINI_API_KEY", "secret"),
            ("RHOVOICE_VOICE", "puck"),
            ("RHOVOICE_TOOLS", "console"),
            ("RHOVOICE_SETTLE_MS", "250"),
        ]))
        .unwrap();

        assert_eq!(config.api_key, "secret");
        assert_eq!(config.model, DEFAULT_MODEL);
        assert_eq!(config.session.voice, Voice::Puck);
        assert_eq!(config.session.tools.len(), 1);
        assert_eq!(config.settle_delay, Duration::from_millis(250));
        assert!(config.input_device.is_none());
    }

    #[test]
    fn test_app_config_rejects_bad_settle_delay() {
        let err = AppConfig::from_lookup(lookup_from(&[
            ("GEMINI_API_KEY", "secret"),
            ("RHOVOICE_SETTLE_MS", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
