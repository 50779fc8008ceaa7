use std::io::{self, Write};

/// Erase the current terminal line and return the cursor to column 0.
const CLEAR_LINE: &str = "\r\x1b[2K";

pub const BANNER: &str = r"
    +-----------------------------------+
    |       _            _              |
    |    __| |_   _  ___| |_            |
    |   / _` | | | |/ _ \ __|           |
    |  | (_| | |_| |  __/ |_            |
    |   \__,_|\__,_|\___|\__|           |
    |                                   |
    +-----------------------------------+

      Welcome to duet! Press h for help.
";

/// Terminal output. Lines pushed by the server are printed above the prompt
/// so they never end up glued to half-typed input.
pub struct Console<W: Write> {
    out: W,
}

impl Console<io::Stdout> {
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write> Console<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn line(&mut self, text: &str) -> io::Result<()> {
        writeln!(self.out, "{CLEAR_LINE}{text}")?;
        self.out.flush()
    }

    pub fn prompt(&mut self, prompt: &str) -> io::Result<()> {
        write!(self.out, "{CLEAR_LINE}{prompt}")?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_clear_before_printing() {
        let mut console = Console::new(Vec::new());
        console.line("bob> hi").unwrap();
        console.prompt("duet alice> ").unwrap();
        let out = String::from_utf8(console.into_inner()).unwrap();
        assert_eq!(out, "\r\x1b[2Kbob> hi\n\r\x1b[2Kduet alice> ");
    }
}
