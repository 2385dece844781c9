//! Regex-based line transformers.

use futures::stream::StreamExt;
use regex::{Regex, RegexBuilder};

use crate::error::{Result, ScriptError};
use crate::script::Script;
use crate::stream::LineStream;

#[derive(Debug, Clone, Copy, Default)]
pub struct GrepOptions {
    /// Emit the lines that do NOT match.
    pub exclude: bool,
    /// Emit each match instead of the whole line.
    pub only_matching: bool,
    pub case_insensitive: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplaceOptions {
    /// Replace every occurrence per line, not just the first.
    pub all: bool,
    pub case_insensitive: bool,
}

fn build_regex(pattern: &str, case_insensitive: bool) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|err| ScriptError::InvalidInput(format!("invalid pattern `{}`: {}", pattern, err)))
}

fn grep_regex(pattern: &str, options: GrepOptions) -> Result<Regex> {
    if options.exclude && options.only_matching {
        return Err(ScriptError::InvalidInput(
            "grep cannot combine exclude with only_matching".to_owned(),
        ));
    }
    build_regex(pattern, options.case_insensitive)
}

fn apply_grep(lines: LineStream, regex: Regex, options: GrepOptions) -> LineStream {
    if options.only_matching {
        LineStream::new(lines.flat_map(move |line| {
            let matches: Vec<String> = regex
                .find_iter(&line)
                .map(|found| found.as_str().to_owned())
                .collect();
            futures::stream::iter(matches)
        }))
    } else {
        let exclude = options.exclude;
        LineStream::new(lines.filter(move |line| {
            let keep = regex.is_match(line) != exclude;
            async move { keep }
        }))
    }
}

/// Reject replacement strings referring to groups the pattern does not
/// define, before any line is processed.
fn check_rewrite(regex: &Regex, rewrite: &str) -> Result<()> {
    let group_count = regex.captures_len();
    let named: Vec<&str> = regex.capture_names().flatten().collect();
    let mut chars = rewrite.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            continue;
        }
        match chars.peek() {
            Some('$') => {
                chars.next();
            }
            Some('{') => {
                chars.next();
                let mut name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    name.push(c);
                }
                check_group(&name, group_count, &named, rewrite)?;
            }
            Some(c) if c.is_ascii_digit() => {
                let mut digits = String::new();
                while let Some(c) = chars.peek() {
                    if c.is_ascii_digit() {
                        digits.push(*c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                check_group(&digits, group_count, &named, rewrite)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_group(name: &str, group_count: usize, named: &[&str], rewrite: &str) -> Result<()> {
    let known = match name.parse::<usize>() {
        Ok(index) => index < group_count,
        Err(_) => named.contains(&name),
    };
    if known {
        Ok(())
    } else {
        Err(ScriptError::InvalidInput(format!(
            "replacement `{}` references nonexistent group `{}`",
            rewrite, name
        )))
    }
}

fn apply_replace(
    lines: LineStream,
    regex: Regex,
    rewrite: String,
    options: ReplaceOptions,
) -> LineStream {
    LineStream::new(lines.map(move |line| {
        if options.all {
            regex.replace_all(&line, rewrite.as_str()).into_owned()
        } else {
            regex.replace(&line, rewrite.as_str()).into_owned()
        }
    }))
}

impl LineStream {
    /// Keep (or drop, or extract from) the lines matching `pattern`.
    pub fn grep(self, pattern: &str, options: GrepOptions) -> Result<LineStream> {
        let regex = grep_regex(pattern, options)?;
        Ok(apply_grep(self, regex, options))
    }

    /// Rewrite each line by regex replacement. Group references in
    /// `rewrite` are validated against the pattern up front.
    pub fn replace(
        self,
        pattern: &str,
        rewrite: impl Into<String>,
        options: ReplaceOptions,
    ) -> Result<LineStream> {
        let regex = build_regex(pattern, options.case_insensitive)?;
        let rewrite = rewrite.into();
        check_rewrite(&regex, &rewrite)?;
        Ok(apply_replace(self, regex, rewrite, options))
    }
}

impl Script {
    /// A `grep`-shaped line transformer script.
    pub fn grep(pattern: &str, options: GrepOptions) -> Result<Script> {
        let regex = grep_regex(pattern, options)?;
        Ok(Script::line_transform("grep", move |lines| {
            apply_grep(lines, regex, options)
        }))
    }

    /// A `sed s///`-shaped line transformer script.
    pub fn replace(
        pattern: &str,
        rewrite: impl Into<String>,
        options: ReplaceOptions,
    ) -> Result<Script> {
        let regex = build_regex(pattern, options.case_insensitive)?;
        let rewrite = rewrite.into();
        check_rewrite(&regex, &rewrite)?;
        Ok(Script::line_transform("replace", move |lines| {
            apply_replace(lines, regex, rewrite, options)
        }))
    }
}
