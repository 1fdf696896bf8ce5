//! # Command-line Splitting
//!
//! Splits a configured command string into an argv vector. Supports single
//! and double quotes and backslash escapes, following POSIX shell rules for
//! quote removal. No variable expansion or globbing is performed.

use thiserror::Error;

/// Errors produced when a command string cannot be split.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandLineError {
    #[error("unterminated {quote} quote in command line")]
    UnterminatedQuote { quote: char },

    #[error("command line is empty")]
    Empty,
}

/// Split `input` into arguments with quotes removed.
///
/// # Example
/// ```rust
/// use anywhere_util::split_command_line;
///
/// let argv = split_command_line("npx -y \"@scope/server name\" --flag='a b'").unwrap();
/// assert_eq!(argv, vec!["npx", "-y", "@scope/server name", "--flag=a b"]);
/// ```
pub fn split_command_line(input: &str) -> Result<Vec<String>, CommandLineError> {
    let mut arguments = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut characters = input.chars().peekable();

    while let Some(character) = characters.next() {
        match character {
            '\'' => {
                in_token = true;
                loop {
                    match characters.next() {
                        Some('\'') => break,
                        Some(inner) => current.push(inner),
                        None => return Err(CommandLineError::UnterminatedQuote { quote: '\'' }),
                    }
                }
            }
            '"' => {
                in_token = true;
                loop {
                    match characters.next() {
                        Some('"') => break,
                        Some('\\') => match characters.next() {
                            Some(escaped @ ('"' | '\\' | '$' | '`')) => current.push(escaped),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err(CommandLineError::UnterminatedQuote { quote: '"' }),
                        },
                        Some(inner) => current.push(inner),
                        None => return Err(CommandLineError::UnterminatedQuote { quote: '"' }),
                    }
                }
            }
            '\\' => {
                in_token = true;
                if let Some(escaped) = characters.next() {
                    current.push(escaped);
                }
            }
            whitespace if whitespace.is_whitespace() => {
                if in_token {
                    arguments.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            other => {
                in_token = true;
                current.push(other);
            }
        }
    }

    if in_token {
        arguments.push(current);
    }
    if arguments.is_empty() {
        return Err(CommandLineError::Empty);
    }
    Ok(arguments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(
            split_command_line("  ghcr.io/acme/server:1.2   --port 0 ").unwrap(),
            vec!["ghcr.io/acme/server:1.2", "--port", "0"]
        );
    }

    #[test]
    fn keeps_empty_quoted_argument() {
        assert_eq!(split_command_line("run ''").unwrap(), vec!["run", ""]);
    }

    #[test]
    fn backslash_escapes_space() {
        assert_eq!(split_command_line(r"path\ with\ spaces").unwrap(), vec!["path with spaces"]);
    }

    #[test]
    fn unterminated_quote_is_an_error() {
        assert_eq!(
            split_command_line("echo \"oops"),
            Err(CommandLineError::UnterminatedQuote { quote: '"' })
        );
    }

    #[test]
    fn blank_input_is_empty_error() {
        assert_eq!(split_command_line("   "), Err(CommandLineError::Empty));
    }
}
