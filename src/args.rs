//! Command-line tokenization.
//!
//! Splits a command line into the executable token and its arguments.
//! Single quotes preserve everything literally, double quotes honor
//! `\"` and `\\`, a bare backslash escapes the next character, and
//! unquoted `*`, `?`, `[` make a token a glob candidate.

use std::path::Path;

use crate::error::{Result, ScriptError};

struct Token {
    text: String,
    glob_candidate: bool,
}

fn scan(cmdline: &str) -> Result<Vec<Token>> {
    let mut chars = cmdline.chars().peekable();
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut started = false;
    let mut globby = false;

    macro_rules! flush {
        () => {
            if started {
                tokens.push(Token {
                    text: std::mem::take(&mut current),
                    glob_candidate: globby,
                });
                started = false;
                globby = false;
            }
        };
    }

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' | '\n' | '\r' => flush!(),
            '\'' => {
                started = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => {
                            return Err(ScriptError::InvalidInput(
                                "unterminated single quote".to_owned(),
                            ))
                        }
                    }
                }
            }
            '"' => {
                started = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => current.push(c),
                            Some(c) => {
                                current.push('\\');
                                current.push(c);
                            }
                            None => {
                                return Err(ScriptError::InvalidInput(
                                    "unterminated double quote".to_owned(),
                                ))
                            }
                        },
                        Some(c) => current.push(c),
                        None => {
                            return Err(ScriptError::InvalidInput(
                                "unterminated double quote".to_owned(),
                            ))
                        }
                    }
                }
            }
            '\\' => {
                started = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => {
                        return Err(ScriptError::InvalidInput(
                            "trailing backslash in command line".to_owned(),
                        ))
                    }
                }
            }
            c @ ('*' | '?' | '[') => {
                started = true;
                globby = true;
                current.push(c);
            }
            c => {
                started = true;
                current.push(c);
            }
        }
    }
    flush!();

    if tokens.is_empty() {
        return Err(ScriptError::InvalidInput("empty command line".to_owned()));
    }
    Ok(tokens)
}

/// Tokenize without glob expansion.
pub fn parse(cmdline: &str) -> Result<Vec<String>> {
    Ok(scan(cmdline)?.into_iter().map(|t| t.text).collect())
}

/// Tokenize, expanding glob-candidate argument tokens against `root`.
/// The executable token is never expanded, and a pattern with no
/// matches stays literal.
pub fn parse_with_globs(cmdline: &str, root: &Path, globs: bool) -> Result<Vec<String>> {
    let tokens = scan(cmdline)?;
    let mut out = Vec::with_capacity(tokens.len());
    for (index, token) in tokens.into_iter().enumerate() {
        if globs && index > 0 && token.glob_candidate {
            out.extend(expand(&token.text, root)?);
        } else {
            out.push(token.text);
        }
    }
    Ok(out)
}

fn expand(token: &str, root: &Path) -> Result<Vec<String>> {
    let pattern = root.join(token);
    let walker = glob::glob(&pattern.to_string_lossy()).map_err(|err| {
        ScriptError::InvalidInput(format!("invalid glob pattern `{}`: {}", token, err))
    })?;
    let mut matches = Vec::new();
    for entry in walker.flatten() {
        let rel = entry.strip_prefix(root).unwrap_or(&entry);
        matches.push(rel.to_string_lossy().into_owned());
    }
    matches.sort();
    if matches.is_empty() {
        Ok(vec![token.to_owned()])
    } else {
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(parse("echo  hi\tthere").unwrap(), ["echo", "hi", "there"]);
    }

    #[test]
    fn single_quotes_are_literal() {
        assert_eq!(parse(r#"echo 'a "b" \c'"#).unwrap(), ["echo", r#"a "b" \c"#]);
    }

    #[test]
    fn double_quotes_honor_escapes() {
        assert_eq!(
            parse(r#"echo "a \"b\" \\ \n""#).unwrap(),
            ["echo", r#"a "b" \ \n"#]
        );
    }

    #[test]
    fn backslash_escapes_outside_quotes() {
        assert_eq!(parse(r"echo a\ b").unwrap(), ["echo", "a b"]);
    }

    #[test]
    fn adjacent_quoted_parts_join() {
        assert_eq!(parse(r#"echo a'b'"c""#).unwrap(), ["echo", "abc"]);
    }

    #[test]
    fn unterminated_quote_is_invalid() {
        assert!(matches!(
            parse("echo 'oops"),
            Err(ScriptError::InvalidInput(_))
        ));
        assert!(matches!(
            parse("echo \"oops"),
            Err(ScriptError::InvalidInput(_))
        ));
    }

    #[test]
    fn empty_line_is_invalid() {
        assert!(matches!(parse("   "), Err(ScriptError::InvalidInput(_))));
    }

    #[test]
    fn globs_off_keeps_pattern_literal() {
        let tokens = parse_with_globs("ls *.rs", Path::new("."), false).unwrap();
        assert_eq!(tokens, ["ls", "*.rs"]);
    }

    #[test]
    fn unmatched_glob_stays_literal() {
        let dir = tempfile::tempdir().unwrap();
        let tokens = parse_with_globs("ls *.nothing", dir.path(), true).unwrap();
        assert_eq!(tokens, ["ls", "*.nothing"]);
    }

    #[test]
    fn glob_expands_sorted_matches() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.txt"), "").unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        let tokens = parse_with_globs("ls *.txt", dir.path(), true).unwrap();
        assert_eq!(tokens, ["ls", "a.txt", "b.txt"]);
    }

    #[test]
    fn quoted_wildcards_are_not_globs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "").unwrap();
        let tokens = parse_with_globs("echo '*.txt'", dir.path(), true).unwrap();
        assert_eq!(tokens, ["echo", "*.txt"]);
    }
}
