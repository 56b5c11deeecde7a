use client_core::AttemptId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Send(String),
    Join(String),
    Leave,
    Reload,
    Retry(AttemptId),
    Dismiss(AttemptId),
    Help,
    Quit,
    Nothing,
}

pub const HELP: &str = "commands: /join <channel>, /leave, /reload, /retry <attempt>, /dismiss <attempt>, /quit; anything else is sent";

/// Parses one line typed by the user. Lines not starting with `/` are messages.
pub fn parse_input(line: &str) -> Result<Input, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Input::Nothing);
    }
    let Some(command) = line.strip_prefix('/') else {
        return Ok(Input::Send(line.to_string()));
    };

    let mut parts = command.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let arg = parts.next();
    match (name, arg) {
        ("join", Some(channel)) => Ok(Input::Join(channel.to_string())),
        ("join", None) => Err("usage: /join <channel>".into()),
        ("leave", _) => Ok(Input::Leave),
        ("reload", _) => Ok(Input::Reload),
        ("retry", arg) => parse_attempt(arg).map(Input::Retry),
        ("dismiss", arg) => parse_attempt(arg).map(Input::Dismiss),
        ("help", _) => Ok(Input::Help),
        ("quit" | "exit", _) => Ok(Input::Quit),
        (other, _) => Err(format!("unknown command '/{other}'")),
    }
}

fn parse_attempt(arg: Option<&str>) -> Result<AttemptId, String> {
    let arg = arg.ok_or_else(|| "missing attempt number".to_string())?;
    arg.parse::<u64>()
        .map(AttemptId)
        .map_err(|_| format!("invalid attempt number '{arg}'"))
}
