//! Parsing of REPL input lines.
//!
//! Lines starting with `/` are commands; anything else is a new turn.

use std::path::PathBuf;

use parley_core::ApiSpec;

/// Help text printed by `/help`.
pub const HELP: &str = "\
Type a message to send it. Commands:
  /models                          list models
  /model <name>                    select a model
  /key <provider> <key|->          store or clear an API key
  /download <model>                download and select a local model
  /remove-model <model>            delete a local model
  /tools                           list built-in tools
  /tool <id> on|off                toggle a built-in tool
  /servers                         list external tool servers
  /server add|rm <url>             add or remove a tool server
  /server tool <url> <name> on|off toggle a server tool
  /system <prompt>                 set the system prompt (empty clears)
  /reasoning on|off                toggle model reasoning
  /threads                         list threads
  /new                             start a new thread
  /switch <id-prefix>              switch thread
  /rename <title>                  rename the current thread
  /delete <id-prefix>              delete a thread
  /history                         show the current thread
  /edit <index> <text>             replace a turn and rerun
  /reload <index>                  rerun from a message
  /image <path> <text>             send an image with a question
  /quit                            exit";

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Send a new user turn.
    Say(String),
    Help,
    Models,
    Model(String),
    Key {
        spec: ApiSpec,
        key: Option<String>,
    },
    Download(String),
    RemoveModel(String),
    Tools,
    Tool {
        id: String,
        enabled: bool,
    },
    Servers,
    ServerAdd(String),
    ServerRemove(String),
    ServerTool {
        url: String,
        name: String,
        enabled: bool,
    },
    System(String),
    Reasoning(bool),
    Threads,
    New,
    Switch(String),
    Rename(String),
    Delete(String),
    History,
    Edit {
        index: usize,
        text: String,
    },
    Reload(usize),
    Image {
        path: PathBuf,
        text: String,
    },
    Quit,
}

/// Why a line could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command: /{0} (try /help)")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("{0}")]
    Invalid(String),
}

/// Parse one input line. Blank lines parse to `None`.
///
/// # Errors
///
/// Returns a [`ParseError`] for unknown commands or bad arguments.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(body) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };

    let (name, rest) = split_word(body);
    let command = match name {
        "help" | "?" => Command::Help,
        "models" => Command::Models,
        "model" => Command::Model(required(rest, "/model <name>")?),
        "key" => {
            let (spec, key) = split_word(rest);
            if spec.is_empty() || key.is_empty() {
                return Err(ParseError::Usage("/key <provider> <key|->"));
            }
            let spec = spec.parse::<ApiSpec>().map_err(ParseError::Invalid)?;
            let key = (key != "-").then(|| key.to_string());
            Command::Key { spec, key }
        }
        "download" => Command::Download(required(rest, "/download <model>")?),
        "remove-model" => Command::RemoveModel(required(rest, "/remove-model <model>")?),
        "tools" => Command::Tools,
        "tool" => {
            let (id, state) = split_word(rest);
            if id.is_empty() {
                return Err(ParseError::Usage("/tool <id> on|off"));
            }
            Command::Tool {
                id: id.to_string(),
                enabled: switch(state, "/tool <id> on|off")?,
            }
        }
        "servers" => Command::Servers,
        "server" => parse_server(rest)?,
        "system" => Command::System(rest.to_string()),
        "reasoning" => Command::Reasoning(switch(rest, "/reasoning on|off")?),
        "threads" => Command::Threads,
        "new" => Command::New,
        "switch" => Command::Switch(required(rest, "/switch <id-prefix>")?),
        "rename" => Command::Rename(required(rest, "/rename <title>")?),
        "delete" => Command::Delete(required(rest, "/delete <id-prefix>")?),
        "history" => Command::History,
        "edit" => {
            let (index, text) = split_word(rest);
            if text.is_empty() {
                return Err(ParseError::Usage("/edit <index> <text>"));
            }
            Command::Edit {
                index: index_arg(index, "/edit <index> <text>")?,
                text: text.to_string(),
            }
        }
        "reload" => Command::Reload(index_arg(rest, "/reload <index>")?),
        "image" => {
            let (path, text) = split_word(rest);
            if path.is_empty() || text.is_empty() {
                return Err(ParseError::Usage("/image <path> <text>"));
            }
            Command::Image {
                path: PathBuf::from(path),
                text: text.to_string(),
            }
        }
        "quit" | "exit" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn parse_server(rest: &str) -> Result<Command, ParseError> {
    const USAGE: &str = "/server add|rm <url> | /server tool <url> <name> on|off";

    let (action, rest) = split_word(rest);
    match action {
        "add" => Ok(Command::ServerAdd(required(rest, USAGE)?)),
        "rm" | "remove" => Ok(Command::ServerRemove(required(rest, USAGE)?)),
        "tool" => {
            let (url, rest) = split_word(rest);
            let (name, state) = split_word(rest);
            if url.is_empty() || name.is_empty() {
                return Err(ParseError::Usage(USAGE));
            }
            Ok(Command::ServerTool {
                url: url.to_string(),
                name: name.to_string(),
                enabled: switch(state, USAGE)?,
            })
        }
        _ => Err(ParseError::Usage(USAGE)),
    }
}

/// Split off the first whitespace-delimited word.
fn split_word(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    match s.find(char::is_whitespace) {
        Some(at) => (&s[..at], s[at..].trim_start()),
        None => (s, ""),
    }
}

fn required(rest: &str, usage: &'static str) -> Result<String, ParseError> {
    let rest = rest.trim();
    if rest.is_empty() {
        Err(ParseError::Usage(usage))
    } else {
        Ok(rest.to_string())
    }
}

fn switch(arg: &str, usage: &'static str) -> Result<bool, ParseError> {
    match arg.trim() {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(ParseError::Usage(usage)),
    }
}

fn index_arg(arg: &str, usage: &'static str) -> Result<usize, ParseError> {
    arg.trim().parse().map_err(|_| ParseError::Usage(usage))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn plain_lines_are_turns() {
        assert_eq!(
            parse("  hello there ").unwrap(),
            Some(Command::Say("hello there".into()))
        );
        assert_eq!(parse("   ").unwrap(), None);
    }

    #[test]
    fn key_dash_clears() {
        assert_eq!(
            parse("/key openai -").unwrap(),
            Some(Command::Key {
                spec: ApiSpec::OpenAI,
                key: None
            })
        );
        assert_eq!(
            parse("/key Grok xai-123").unwrap(),
            Some(Command::Key {
                spec: ApiSpec::Grok,
                key: Some("xai-123".into())
            })
        );
        assert!(matches!(parse("/key nope abc"), Err(ParseError::Invalid(_))));
        assert!(matches!(parse("/key openai"), Err(ParseError::Usage(_))));
    }

    #[test]
    fn server_subcommands() {
        assert_eq!(
            parse("/server add http://localhost:3000/mcp").unwrap(),
            Some(Command::ServerAdd("http://localhost:3000/mcp".into()))
        );
        assert_eq!(
            parse("/server tool http://a/mcp add off").unwrap(),
            Some(Command::ServerTool {
                url: "http://a/mcp".into(),
                name: "add".into(),
                enabled: false
            })
        );
        assert!(matches!(parse("/server tool http://a/mcp add"), Err(ParseError::Usage(_))));
        assert!(matches!(parse("/server list"), Err(ParseError::Usage(_))));
    }

    #[test]
    fn edit_keeps_the_whole_text() {
        assert_eq!(
            parse("/edit 2 what about   rust?").unwrap(),
            Some(Command::Edit {
                index: 2,
                text: "what about   rust?".into()
            })
        );
        assert!(matches!(parse("/edit x text"), Err(ParseError::Usage(_))));
        assert_eq!(parse("/reload 3").unwrap(), Some(Command::Reload(3)));
    }

    #[test]
    fn system_prompt_may_be_empty() {
        assert_eq!(parse("/system").unwrap(), Some(Command::System(String::new())));
        assert_eq!(
            parse("/system Be brief.").unwrap(),
            Some(Command::System("Be brief.".into()))
        );
    }

    #[test]
    fn unknown_commands_are_reported() {
        assert_eq!(
            parse("/frobnicate now").unwrap_err(),
            ParseError::Unknown("frobnicate".into())
        );
        assert!(matches!(parse("/tool web_fetch maybe"), Err(ParseError::Usage(_))));
    }
}
