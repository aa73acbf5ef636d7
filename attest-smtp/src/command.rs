use std::fmt;

/// One SMTP command line from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Noop,
    Quit,
    Unknown(String),
}

impl Command {
    /// Parse one CRLF-stripped command line.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let upper = line.to_ascii_uppercase();

        if let Some(rest) = upper.strip_prefix("HELO") {
            if rest.is_empty() || rest.starts_with(' ') {
                return Self::Helo(line[line.len() - rest.len()..].trim().to_string());
            }
        }
        if let Some(rest) = upper.strip_prefix("EHLO") {
            if rest.is_empty() || rest.starts_with(' ') {
                return Self::Ehlo(line[line.len() - rest.len()..].trim().to_string());
            }
        }
        if upper.starts_with("MAIL FROM:") {
            return Self::MailFrom(line["MAIL FROM:".len()..].trim().to_string());
        }
        if upper.starts_with("RCPT TO:") {
            return Self::RcptTo(line["RCPT TO:".len()..].trim().to_string());
        }

        match upper.as_str() {
            "DATA" => Self::Data,
            "RSET" => Self::Rset,
            "NOOP" => Self::Noop,
            "QUIT" => Self::Quit,
            _ => Self::Unknown(line.to_string()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(name) => write!(f, "HELO {name}"),
            Self::Ehlo(name) => write!(f, "EHLO {name}"),
            Self::MailFrom(addr) => write!(f, "MAIL FROM:{addr}"),
            Self::RcptTo(addr) => write!(f, "RCPT TO:{addr}"),
            Self::Data => f.write_str("DATA"),
            Self::Rset => f.write_str("RSET"),
            Self::Noop => f.write_str("NOOP"),
            Self::Quit => f.write_str("QUIT"),
            Self::Unknown(line) => write!(f, "{line}"),
        }
    }
}

/// Strip the angle brackets and any ESMTP parameters of an envelope
/// argument: `<bob@example.com> SIZE=1024` becomes `bob@example.com`.
#[must_use]
pub fn envelope_address(argument: &str) -> String {
    let argument = argument.trim();
    let address = argument
        .split_whitespace()
        .next()
        .unwrap_or_default();
    address
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn commands_parse_case_insensitively() {
        assert_eq!(
            Command::parse("ehlo mx.example.com\r\n"),
            Command::Ehlo("mx.example.com".to_string())
        );
        assert_eq!(
            Command::parse("MAIL FROM:<bob@example.com>"),
            Command::MailFrom("<bob@example.com>".to_string())
        );
        assert_eq!(
            Command::parse("rcpt to:<alice@example.org>"),
            Command::RcptTo("<alice@example.org>".to_string())
        );
        assert_eq!(Command::parse("data\r\n"), Command::Data);
        assert_eq!(Command::parse("QUIT"), Command::Quit);
        assert_eq!(
            Command::parse("VRFY alice"),
            Command::Unknown("VRFY alice".to_string())
        );
        // A prefix alone is not a command.
        assert_eq!(
            Command::parse("HELOX"),
            Command::Unknown("HELOX".to_string())
        );
    }

    #[test]
    fn envelope_address_strips_brackets_and_params() {
        assert_eq!(envelope_address("<bob@example.com>"), "bob@example.com");
        assert_eq!(
            envelope_address("<bob@example.com> SIZE=1024 BODY=8BITMIME"),
            "bob@example.com"
        );
        assert_eq!(envelope_address("<>"), "");
    }
}
