use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{PtyError, Result};

/// The argv of a child process.
///
/// Always holds at least the program name. The Windows backends hand the
/// child a single command line string, which the child re-tokenizes, so
/// [`Command::to_command_line`] follows the quoting rules of the Microsoft C
/// runtime exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct Command {
    argv: Vec<String>,
}

impl Command {
    /// Builds a command from its argv, program first.
    ///
    /// Fails with [`PtyError::EmptyCommand`] if `argv` is empty.
    ///
    /// ```
    /// let command = ptyspawn::Command::new(["sh", "-c", "exit 0"]).unwrap();
    /// assert_eq!(command.program(), "sh");
    /// assert_eq!(command.args(), ["-c", "exit 0"]);
    /// assert!(ptyspawn::Command::new(Vec::<String>::new()).is_err());
    /// ```
    pub fn new<I, S>(argv: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = argv.into_iter().map(Into::into).collect();
        if argv.is_empty() {
            return Err(PtyError::EmptyCommand);
        }
        Ok(Self { argv })
    }

    /// The program name, `argv[0]`.
    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    /// Arguments after the program name.
    pub fn args(&self) -> &[String] {
        &self.argv[1..]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// Joins the argv into one command line, quoting where needed.
    pub fn to_command_line(&self) -> String {
        let mut line = String::new();
        for (i, arg) in self.argv.iter().enumerate() {
            if i > 0 {
                line.push(' ');
            }
            append_quoted(arg, &mut line);
        }
        line
    }
}

impl TryFrom<Vec<String>> for Command {
    type Error = PtyError;

    fn try_from(argv: Vec<String>) -> Result<Self> {
        Command::new(argv)
    }
}

impl From<Command> for Vec<String> {
    fn from(command: Command) -> Self {
        command.argv
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_command_line())
    }
}

fn needs_quotes(arg: &str) -> bool {
    arg.is_empty()
        || arg
            .chars()
            .any(|c| matches!(c, ' ' | '\t' | '\n' | '\x0b' | '"'))
}

fn append_quoted(arg: &str, line: &mut String) {
    if !needs_quotes(arg) {
        line.push_str(arg);
        return;
    }

    line.push('"');
    let mut backslashes = 0;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                // Backslashes in front of a quote escape each other, and one
                // more escapes the quote itself.
                push_backslashes(line, backslashes * 2 + 1);
                line.push('"');
                backslashes = 0;
            }
            _ => {
                push_backslashes(line, backslashes);
                line.push(c);
                backslashes = 0;
            }
        }
    }
    // Trailing backslashes sit in front of the closing quote.
    push_backslashes(line, backslashes * 2);
    line.push('"');
}

fn push_backslashes(line: &mut String, count: usize) {
    line.extend(std::iter::repeat('\\').take(count));
}
