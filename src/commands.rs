//! Interactive command parsing

use crate::config::{self, parse_tool_list, ConfigError, Preset, Voice};
use crate::session::Command;
use crate::tools::ToolKind;
use std::collections::BTreeSet;
use std::path::PathBuf;

pub const HELP: &str = "\
Commands:
  /start                 start streaming the microphone
  /stop                  stop streaming the microphone
  /reset                 close the session and reconnect
  /voice <name>          switch voice (restarts the session)
  /voices                list available voices
  /persona <text>        replace the persona (restarts the session)
  /preset <name>         use a persona preset (restarts the session)
  /presets               list persona presets
  /tools <list|all|none> choose enabled tools (restarts the session)
  /persona-from <pdf>    generate a persona from a PDF document
  /meter                 toggle the level meter
  /status                show session status
  /help                  show this help
  /quit                  exit";

#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    Start,
    Stop,
    Reset,
    Voice(Voice),
    Voices,
    Persona(String),
    Preset(&'static Preset),
    Presets,
    Tools(BTreeSet<ToolKind>),
    PersonaFrom(PathBuf),
    Meter,
    Status,
    Help,
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("Commands start with '/'; try /help")]
    NotACommand,

    #[error("Unknown command '{0}'; try /help")]
    Unknown(String),

    #[error("/{0} needs an argument")]
    MissingArgument(&'static str),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl UserCommand {
    /// The controller command this maps to, if any. Purely local commands
    /// (listing, help, meter) map to `None`.
    pub fn to_session_command(&self) -> Option<Command> {
        match self {
            UserCommand::Start => Some(Command::StartRecording),
            UserCommand::Stop => Some(Command::StopRecording),
            UserCommand::Reset => Some(Command::Reset),
            UserCommand::Voice(voice) => Some(Command::SetVoice(*voice)),
            UserCommand::Persona(text) => Some(Command::SetPersona(text.clone())),
            UserCommand::Preset(preset) => Some(Command::SetPersona(preset.prompt.to_string())),
            UserCommand::Tools(tools) => Some(Command::SetTools(tools.clone())),
            UserCommand::Quit => Some(Command::Shutdown),
            UserCommand::Voices
            | UserCommand::Presets
            | UserCommand::PersonaFrom(_)
            | UserCommand::Meter
            | UserCommand::Status
            | UserCommand::Help => None,
        }
    }
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<UserCommand>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(body) = line.strip_prefix('/') else {
        return Err(ParseError::NotACommand);
    };

    let (name, arg) = match body.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (body, ""),
    };
    let required = |key: &'static str| {
        if arg.is_empty() {
            Err(ParseError::MissingArgument(key))
        } else {
            Ok(arg)
        }
    };

    let command = match name.to_ascii_lowercase().as_str() {
        "start" => UserCommand::Start,
        "stop" => UserCommand::Stop,
        "reset" => UserCommand::Reset,
        "voice" => UserCommand::Voice(required("voice")?.parse()?),
        "voices" => UserCommand::Voices,
        "persona" => UserCommand::Persona(required("persona")?.to_string()),
        "preset" => UserCommand::Preset(config::preset(required("preset")?)?),
        "presets" => UserCommand::Presets,
        "tools" => UserCommand::Tools(parse_tool_list(required("tools")?)?),
        "persona-from" => UserCommand::PersonaFrom(PathBuf::from(required("persona-from")?)),
        "meter" => UserCommand::Meter,
        "status" => UserCommand::Status,
        "help" | "?" => UserCommand::Help,
        "quit" | "exit" => UserCommand::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}
