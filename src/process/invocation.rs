//! Description of one external command, and shell-line parsing.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use super::error::ExecError;

/// Where an output stream goes before the wrapper takes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputBinding {
    /// Not bound yet; the captured wrapper will capture it.
    #[default]
    Unbound,
    /// Connected to this process's own stream.
    Inherit,
    /// Discarded.
    Null,
}

impl OutputBinding {
    fn stdio(self) -> Stdio {
        match self {
            OutputBinding::Unbound | OutputBinding::Inherit => Stdio::inherit(),
            OutputBinding::Null => Stdio::null(),
        }
    }
}

/// A program, its arguments, and how its standard streams are wired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    input: Option<Vec<u8>>,
    stdout: OutputBinding,
    stderr: OutputBinding,
    current_dir: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Build an invocation from a single line, split the way a shell
    /// splits words: whitespace separates, single quotes are literal,
    /// double quotes allow `\"`, `\\`, `\$` and `` \` `` escapes, and a
    /// bare backslash escapes the next character.
    pub fn parse(line: &str) -> Result<Self, ExecError> {
        let parse_err = |detail: &str| ExecError::Parse {
            line: line.to_string(),
            detail: detail.to_string(),
        };
        let mut words = split_words(line).map_err(parse_err)?.into_iter();
        let program = words.next().ok_or_else(|| parse_err("empty command"))?;
        Ok(Self::new(program).args(words))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Bytes written to the command's stdin.
    pub fn input(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn stdout(mut self, binding: OutputBinding) -> Self {
        self.stdout = binding;
        self
    }

    pub fn stderr(mut self, binding: OutputBinding) -> Self {
        self.stderr = binding;
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn stdin_input(&self) -> Option<&[u8]> {
        self.input.as_deref()
    }

    pub fn stdout_binding(&self) -> OutputBinding {
        self.stdout
    }

    pub fn stderr_binding(&self) -> OutputBinding {
        self.stderr
    }

    /// The command as a single printable line, quoting words that need it.
    pub fn command_line(&self) -> String {
        std::iter::once(&self.program)
            .chain(&self.args)
            .map(|word| quote_word(word))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// A tokio command with program, arguments and working directory set.
    /// Streams are left to the caller.
    pub(crate) fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command.stdin(if self.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        command
    }

    pub(crate) fn stdout_stdio(&self) -> Stdio {
        self.stdout.stdio()
    }

    pub(crate) fn stderr_stdio(&self) -> Stdio {
        self.stderr.stdio()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Format a line and parse it into an [`Invocation`].
///
/// ```
/// let inv = summon::shellf!("echo {:?}", "hello world").unwrap();
/// assert_eq!(inv.arguments(), ["hello world"]);
/// ```
#[macro_export]
macro_rules! shellf {
    ($($arg:tt)*) => {
        $crate::process::Invocation::parse(&format!($($arg)*))
    };
}

fn quote_word(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn split_words(line: &str) -> Result<Vec<String>, &'static str> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err("unterminated single quote"),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\' | '$' | '`')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => return Err("unterminated double quote"),
                        },
                        Some(c) => current.push(c),
                        None => return Err("unterminated double quote"),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return Err("trailing backslash"),
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}
