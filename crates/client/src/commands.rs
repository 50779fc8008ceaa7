/// One line of user input outside of chat mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    Exit,
    Login,
    Register,
    /// `None` when the target was left out.
    Invite(Option<String>),
    Online,
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let mut words = line.split_whitespace();
        let Some(head) = words.next() else {
            return Self::Empty;
        };
        match head {
            "h" | "help" => Self::Help,
            "e" | "exit" | "quit" => Self::Exit,
            "l" | "login" => Self::Login,
            "r" | "reg" | "register" => Self::Register,
            "i" | "invite" => Self::Invite(words.next().map(str::to_string)),
            "o" | "online" => Self::Online,
            other => Self::Unknown(other.to_string()),
        }
    }
}

pub const HELP: &str = "\
Short\tLong

Login:
l\tlogin
r\tregister
Invite:
o\tonline
i\tinvite <user>
Always:
h\thelp
e\texit";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_and_long_forms() {
        for (line, cmd) in [
            ("h", Command::Help),
            ("help", Command::Help),
            ("quit", Command::Exit),
            ("l", Command::Login),
            ("reg", Command::Register),
            ("o", Command::Online),
        ] {
            assert_eq!(Command::parse(line), cmd, "{line}");
        }
    }

    #[test]
    fn invite_takes_first_argument() {
        assert_eq!(
            Command::parse("invite bob"),
            Command::Invite(Some("bob".into()))
        );
        assert_eq!(
            Command::parse("  i   bob carol "),
            Command::Invite(Some("bob".into()))
        );
        assert_eq!(Command::parse("i"), Command::Invite(None));
    }

    #[test]
    fn blanks_and_unknowns() {
        assert_eq!(Command::parse("   "), Command::Empty);
        assert_eq!(Command::parse("dance"), Command::Unknown("dance".into()));
    }
}
