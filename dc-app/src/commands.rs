//! In-chat command parser.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `reset` / `clear`: forget the conversation's session.
    Reset,
    Status,
    /// `help` / `info`.
    Help,
    Ping,
    /// `ask <question>`: relay the question as an ordinary prompt.
    Ask(String),
    /// Anything else after the prefix; carries the full original text.
    Unknown(String),
}

/// Returns `None` when `input` is not a command at all.
pub fn parse_command(prefix: &str, input: &str) -> Option<Command> {
    let trimmed = input.trim();
    if prefix.is_empty() {
        return None;
    }
    let rest = trimmed.strip_prefix(prefix)?;

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };

    let command = match name.to_ascii_lowercase().as_str() {
        "reset" | "clear" if args.is_empty() => Command::Reset,
        "status" if args.is_empty() => Command::Status,
        "help" | "info" if args.is_empty() => Command::Help,
        "ping" if args.is_empty() => Command::Ping,
        "ask" if !args.is_empty() => Command::Ask(args.to_string()),
        _ => Command::Unknown(trimmed.to_string()),
    };
    Some(command)
}

pub fn status_text(model: &str, has_session: bool) -> String {
    format!(
        "Model: {model}\nSession: {}",
        if has_session { "Active" } else { "None" }
    )
}

pub fn help_text(prefix: &str, platform_info: &str) -> String {
    format!(
        "Disclaude Bot ({platform_info})\n\n\
         Commands:\n\
         {prefix}reset - Clear session\n\
         {prefix}status - Show status\n\
         {prefix}ask <question> - Ask a question\n\
         {prefix}ping - Check the bot is responsive\n\
         {prefix}help - Show this help\n\n\
         Just send a message to interact with the agent."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_is_not_a_command() {
        assert_eq!(parse_command("/", "hello"), None);
        assert_eq!(parse_command("!", "  what is 2+2?"), None);
        assert_eq!(parse_command("", "/reset"), None);
    }

    #[test]
    fn known_commands_parse_with_either_prefix() {
        assert_eq!(parse_command("/", "/reset"), Some(Command::Reset));
        assert_eq!(parse_command("/", " /clear "), Some(Command::Reset));
        assert_eq!(parse_command("!", "!status"), Some(Command::Status));
        assert_eq!(parse_command("!", "!INFO"), Some(Command::Help));
        assert_eq!(parse_command("!", "!help"), Some(Command::Help));
        assert_eq!(parse_command("!", "!ping"), Some(Command::Ping));
        assert_eq!(
            parse_command("!", "!ask  what is rust?"),
            Some(Command::Ask("what is rust?".to_string()))
        );
    }

    #[test]
    fn unrecognised_commands_keep_the_full_text() {
        assert_eq!(
            parse_command("/", "/frobnicate now"),
            Some(Command::Unknown("/frobnicate now".to_string()))
        );
        assert_eq!(
            parse_command("/", "/reset everything"),
            Some(Command::Unknown("/reset everything".to_string()))
        );
        assert_eq!(
            parse_command("!", "!ask"),
            Some(Command::Unknown("!ask".to_string()))
        );
    }

    #[test]
    fn status_and_help_render() {
        assert_eq!(status_text("glm-4.7", true), "Model: glm-4.7\nSession: Active");
        assert_eq!(status_text("glm-4.7", false), "Model: glm-4.7\nSession: None");

        let help = help_text("!", "Discord bot with glm-4.7");
        assert!(help.starts_with("Disclaude Bot (Discord bot with glm-4.7)"));
        assert!(help.contains("!reset - Clear session"));
        assert!(help.contains("!help - Show this help"));
    }
}
