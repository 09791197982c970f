//! Console command parsing

use std::path::PathBuf;
use std::str::FromStr;

use crate::shell::Platform;

/// One operator command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Add(u16),
    Remove(u16),
    List,
    Connections(u16),
    Switch { port: u16, id: Option<usize> },
    Send(String),
    /// Start a shell, optionally overriding the connection's platform
    Shell(Option<Platform>),
    StopShell,
    Upload(PathBuf),
    Help,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("Invalid port number: {0}")]
    InvalidPort(String),

    #[error("Invalid connection ID: {0}")]
    InvalidConnectionId(String),

    #[error("{0}")]
    InvalidPlatform(String),

    #[error("Usage: {0}")]
    Usage(&'static str),

    #[error("Invalid command '{0}'! Type 'help' for usage.")]
    Unknown(String),
}

/// What a line typed at the prompt means
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Command(Command),
    /// Text for the focused connection
    Message(String),
    Empty,
}

/// Classify a prompt line. A leading `/` always means a command; without it,
/// text goes to the focused connection when there is one.
pub fn route(line: &str, focused: bool) -> Result<Input, CommandError> {
    let line = line.trim_end_matches(['\n', '\r']);

    if let Some(command) = line.strip_prefix('/') {
        return parse_or_empty(command);
    }
    if focused {
        if line.is_empty() {
            return Ok(Input::Empty);
        }
        return Ok(Input::Message(line.to_string()));
    }
    parse_or_empty(line)
}

fn parse_or_empty(line: &str) -> Result<Input, CommandError> {
    if line.trim().is_empty() {
        return Ok(Input::Empty);
    }
    line.parse().map(Input::Command)
}

fn parse_port(arg: Option<&str>, usage: &'static str) -> Result<u16, CommandError> {
    let arg = arg.ok_or(CommandError::Usage(usage))?;
    arg.parse()
        .map_err(|_| CommandError::InvalidPort(arg.to_string()))
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (verb, rest) = line
            .split_once(char::is_whitespace)
            .map(|(verb, rest)| (verb, rest.trim()))
            .unwrap_or((line, ""));
        let mut args = rest.split_whitespace();

        let command = match verb {
            "add" => Command::Add(parse_port(args.next(), "add <port>")?),
            "remove" => Command::Remove(parse_port(args.next(), "remove <port>")?),
            "list" => Command::List,
            "connections" => Command::Connections(parse_port(args.next(), "connections <port>")?),
            "switch" => {
                let port = parse_port(args.next(), "switch <port> [conn_id]")?;
                let id = args
                    .next()
                    .map(|id| {
                        id.parse()
                            .map_err(|_| CommandError::InvalidConnectionId(id.to_string()))
                    })
                    .transpose()?;
                Command::Switch { port, id }
            }
            "send" if !rest.is_empty() => Command::Send(rest.to_string()),
            "send" => return Err(CommandError::Usage("send <message>")),
            "shell" => Command::Shell(
                args.next()
                    .map(|p| p.parse::<Platform>().map_err(CommandError::InvalidPlatform))
                    .transpose()?,
            ),
            "stopshell" => Command::StopShell,
            "upload" if !rest.is_empty() => Command::Upload(PathBuf::from(rest)),
            "upload" => return Err(CommandError::Usage("upload <filepath>")),
            "help" => Command::Help,
            "exit" | "quit" => Command::Exit,
            other => return Err(CommandError::Unknown(other.to_string())),
        };

        if args.next().is_some() && !matches!(command, Command::Send(_) | Command::Upload(_)) {
            return Err(CommandError::Unknown(line.to_string()));
        }
        Ok(command)
    }
}
