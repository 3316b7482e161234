//! Line commands typed into the console client.

use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Say(String),
    Mic,
    Mute,
    Company(String),
    Volume { output: bool, level: f32 },
    Tool { id: String, data: Value },
    Reject { id: String, reason: String },
    History,
    Metrics,
    Clear,
    Help,
    Quit,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseError {
    #[error("Unknown command: /{0} (try /help)")]
    Unknown(String),
    #[error("Usage: {0}")]
    Usage(&'static str),
    #[error("Invalid JSON payload: {0}")]
    InvalidJson(String),
}

pub const HELP: &str = "\
  <text>                 send a user message
  /mic                   start streaming the microphone
  /mute                  stop streaming the microphone
  /company <name>        update the company name in the session context
  /volume <in|out> <0-1> set the microphone or speaker gain
  /tool <id> <json>      answer a pending tool call
  /reject <id> <reason>  reject a pending tool call
  /history               print the conversation so far
  /metrics               print session counters
  /clear                 clear the conversation history
  /quit                  disconnect and exit";

/// Parses one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(ConsoleCommand::Say(line.to_string())));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    let command = match name.to_lowercase().as_str() {
        "mic" => ConsoleCommand::Mic,
        "mute" => ConsoleCommand::Mute,
        "company" => {
            if args.is_empty() {
                return Err(ParseError::Usage("/company <name>"));
            }
            ConsoleCommand::Company(args.to_string())
        }
        "volume" => {
            const USAGE: &str = "/volume <in|out> <0-1>";
            let (target, level) = split_id(args).ok_or(ParseError::Usage(USAGE))?;
            let output = match target {
                "in" => false,
                "out" => true,
                _ => return Err(ParseError::Usage(USAGE)),
            };
            let level = level.parse().map_err(|_| ParseError::Usage(USAGE))?;
            ConsoleCommand::Volume { output, level }
        }
        "tool" => {
            let (id, payload) = split_id(args).ok_or(ParseError::Usage("/tool <id> <json>"))?;
            let data = serde_json::from_str(payload)
                .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
            ConsoleCommand::Tool {
                id: id.to_string(),
                data,
            }
        }
        "reject" => {
            let (id, reason) = split_id(args).ok_or(ParseError::Usage("/reject <id> <reason>"))?;
            ConsoleCommand::Reject {
                id: id.to_string(),
                reason: reason.to_string(),
            }
        }
        "history" => ConsoleCommand::History,
        "metrics" => ConsoleCommand::Metrics,
        "clear" => ConsoleCommand::Clear,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn split_id(args: &str) -> Option<(&str, &str)> {
    let (id, rest) = args.split_once(char::is_whitespace)?;
    let rest = rest.trim();
    if rest.is_empty() { None } else { Some((id, rest)) }
}
