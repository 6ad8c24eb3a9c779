//! Command-line handling shared by the validator and the executor.
//!
//! A validated command line becomes a [`CommandPlan`]: either an argument
//! vector executed without a shell, or (for pipeline-safe commands only) a
//! line handed to `sh -c`.

use serde::{Deserialize, Serialize};

/// Sequences that are never accepted, pipeline-safe or not.
pub const SUBSTITUTION_SEQUENCES: &[&str] = &["`", "$(", "${", "\n", "\r"];

/// Shell operator characters. Rejected unless the command is pipeline-safe,
/// in which case only the pipeline operators below are tolerated.
pub const OPERATOR_CHARS: &[char] = &[';', '&', '|', '>', '<', '(', ')'];

/// Operators a pipeline-safe command line may use between segments.
pub const PIPELINE_OPERATORS: &[&str] = &["&&", "||", "|", ";"];

/// How a validated command is executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CommandPlan {
    /// Spawned directly from an argument vector; no shell interpretation.
    Direct { program: String, args: Vec<String> },
    /// Passed to `sh -c`. Only produced for pipeline-safe command lines.
    Shell { line: String },
}

impl CommandPlan {
    /// The executable name (first word for shell lines).
    pub fn program(&self) -> &str {
        match self {
            Self::Direct { program, .. } => program,
            Self::Shell { line } => line.split_whitespace().next().unwrap_or(""),
        }
    }

    pub fn uses_shell(&self) -> bool {
        matches!(self, Self::Shell { .. })
    }
}

/// Errors from splitting a command line into words.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SplitError {
    #[error("unterminated quote")]
    UnterminatedQuote,

    #[error("trailing escape character")]
    TrailingEscape,

    #[error("unsupported shell operator '{0}'")]
    UnsupportedOperator(char),

    #[error("empty pipeline segment")]
    EmptySegment,
}

/// Operators a pipeline-safe line may place between segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Pipe,
    Or,
    And,
    Sequence,
}

/// One lexical unit of a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(String),
    Control(ControlOp),
}

/// Lex a command line the way `sh` would for the subset we accept.
///
/// Single quotes are literal. Inside double quotes a backslash escapes only
/// `"`, `\`, `$` and a backtick. Outside quotes a backslash escapes any
/// character. With `operators` unset, operator characters are ordinary word
/// characters.
fn lex(line: &str, operators: bool) -> Result<Vec<Token>, SplitError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => current.push(ch),
                        None => return Err(SplitError::UnterminatedQuote),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(esc @ ('"' | '\\' | '$' | '`')) => current.push(esc),
                            Some(other) => {
                                current.push('\\');
                                current.push(other);
                            }
                            None => return Err(SplitError::UnterminatedQuote),
                        },
                        Some(ch) => current.push(ch),
                        None => return Err(SplitError::UnterminatedQuote),
                    }
                }
            }
            '\\' => match chars.next() {
                Some(ch) => {
                    in_word = true;
                    current.push(ch);
                }
                None => return Err(SplitError::TrailingEscape),
            },
            c if c.is_whitespace() => {
                if in_word {
                    tokens.push(Token::Word(std::mem::take(&mut current)));
                    in_word = false;
                }
            }
            c if operators && OPERATOR_CHARS.contains(&c) => {
                if in_word {
                    tokens.push(Token::Word(std::mem::take(&mut current)));
                    in_word = false;
                }
                let next = chars.peek().copied();
                let op = match (c, next) {
                    ('|', Some('|')) => {
                        chars.next();
                        ControlOp::Or
                    }
                    ('|', _) => ControlOp::Pipe,
                    ('&', Some('&')) => {
                        chars.next();
                        ControlOp::And
                    }
                    (';', _) => ControlOp::Sequence,
                    (other, _) => return Err(SplitError::UnsupportedOperator(other)),
                };
                tokens.push(Token::Control(op));
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        tokens.push(Token::Word(current));
    }
    Ok(tokens)
}

/// Split a command line into words, honouring single quotes, double quotes,
/// and backslash escapes. No expansion of any kind is performed.
pub fn split_words(line: &str) -> Result<Vec<String>, SplitError> {
    Ok(lex(line, false)?
        .into_iter()
        .filter_map(|token| match token {
            Token::Word(word) => Some(word),
            Token::Control(_) => None,
        })
        .collect())
}

/// Lex a line into words and control operators, rejecting any operator
/// other than `|`, `||`, `&&` and `;` outside quotes.
pub fn tokenize(line: &str) -> Result<Vec<Token>, SplitError> {
    lex(line, true)
}

/// Whether the line contains a substitution or line-break sequence.
pub fn contains_substitution(line: &str) -> bool {
    SUBSTITUTION_SEQUENCES.iter().any(|seq| line.contains(seq))
}

/// Whether the line contains any shell operator character.
pub fn contains_operator(line: &str) -> bool {
    line.contains(OPERATOR_CHARS)
}

/// Split a pipeline-safe line into segments of words. Every operator must
/// sit between two non-empty segments.
pub fn split_pipeline(line: &str) -> Result<Vec<Vec<String>>, SplitError> {
    let mut segments = Vec::new();
    let mut current = Vec::new();
    for token in tokenize(line)? {
        match token {
            Token::Word(word) => current.push(word),
            Token::Control(_) => {
                if current.is_empty() {
                    return Err(SplitError::EmptySegment);
                }
                segments.push(std::mem::take(&mut current));
            }
        }
    }
    if current.is_empty() {
        return Err(SplitError::EmptySegment);
    }
    segments.push(current);
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_plain_words() {
        assert_eq!(
            split_words("wp post list --format=json").unwrap(),
            vec!["wp", "post", "list", "--format=json"]
        );
    }

    #[test]
    fn split_respects_quotes() {
        assert_eq!(
            split_words(r#"git commit -m "fix the build" --author='A B'"#).unwrap(),
            vec!["git", "commit", "-m", "fix the build", "--author=A B"]
        );
        assert_eq!(split_words(r#"echo "a \"b\" c""#).unwrap(), vec!["echo", r#"a "b" c"#]);
        assert_eq!(split_words("echo ''").unwrap(), vec!["echo", ""]);
    }

    #[test]
    fn split_rejects_unbalanced() {
        assert_eq!(split_words("echo 'oops"), Err(SplitError::UnterminatedQuote));
        assert_eq!(split_words("echo \"oops"), Err(SplitError::UnterminatedQuote));
        assert_eq!(split_words("echo oops\\"), Err(SplitError::TrailingEscape));
    }

    #[test]
    fn substitution_detection() {
        assert!(contains_substitution("echo `id`"));
        assert!(contains_substitution("echo $(id)"));
        assert!(contains_substitution("echo ${HOME}"));
        assert!(contains_substitution("ls\nrm"));
        assert!(!contains_substitution("echo $HOME"));
    }

    fn words(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn pipeline_segments() {
        assert_eq!(
            split_pipeline("grep foo log.txt | wc -l").unwrap(),
            vec![words(&["grep", "foo", "log.txt"]), words(&["wc", "-l"])]
        );
        assert_eq!(
            split_pipeline("git pull && git status; ls").unwrap(),
            vec![words(&["git", "pull"]), words(&["git", "status"]), words(&["ls"])]
        );
        assert_eq!(
            split_pipeline("grep 'a|b' file").unwrap(),
            vec![words(&["grep", "a|b", "file"])]
        );
    }

    #[test]
    fn pipeline_rejects_redirection_and_background() {
        assert_eq!(split_pipeline("grep foo > out.txt"), Err(SplitError::UnsupportedOperator('>')));
        assert_eq!(split_pipeline("sleep 100 &"), Err(SplitError::UnsupportedOperator('&')));
        assert_eq!(split_pipeline("(ls)"), Err(SplitError::UnsupportedOperator('(')));
    }

    #[test]
    fn pipeline_rejects_empty_segments() {
        assert_eq!(split_pipeline("grep x ||| wc"), Err(SplitError::EmptySegment));
        assert_eq!(split_pipeline("| wc"), Err(SplitError::EmptySegment));
        assert_eq!(split_pipeline("grep x;"), Err(SplitError::EmptySegment));
    }

    #[test]
    fn escaped_quotes_do_not_hide_operators() {
        // `\'` is a literal quote to sh, so the pipes after it are real.
        assert_eq!(
            split_pipeline(r"grep \' | touch /tmp/x | wc ' '").unwrap(),
            vec![words(&["grep", "'"]), words(&["touch", "/tmp/x"]), words(&["wc", " "])]
        );
        assert_eq!(
            split_pipeline(r#"grep \" | touch x | wc " ""#).unwrap(),
            vec![words(&["grep", "\""]), words(&["touch", "x"]), words(&["wc", " "])]
        );
        assert_eq!(
            split_pipeline(r#"grep "\"" | touch x | wc"#).unwrap(),
            vec![words(&["grep", "\""]), words(&["touch", "x"]), words(&["wc"])]
        );
    }

    #[test]
    fn escaped_operators_stay_in_the_word() {
        assert_eq!(split_pipeline(r"grep a\|b f").unwrap(), vec![words(&["grep", "a|b", "f"])]);
        assert_eq!(split_words(r"echo a\;b").unwrap(), vec!["echo", "a;b"]);
    }

    #[test]
    fn double_quote_escapes_match_sh() {
        assert_eq!(split_words(r#"echo "\$HOME \n""#).unwrap(), vec!["echo", r"$HOME \n"]);
    }

    #[test]
    fn plan_program_name() {
        let direct = CommandPlan::Direct {
            program: "ls".into(),
            args: vec!["-la".into()],
        };
        assert_eq!(direct.program(), "ls");
        assert!(!direct.uses_shell());

        let shell = CommandPlan::Shell {
            line: "grep x f | wc -l".into(),
        };
        assert_eq!(shell.program(), "grep");
        assert!(shell.uses_shell());
    }
}
