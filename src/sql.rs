//! Splitting a migration script into individually executable statements.
//!
//! A migration file is one piece of text containing one or more SQL
//! statements. Statements are separated by a line consisting of the command
//! separator (`--;;` by default) and anything after it on that line; line
//! comments (`-- ...`) and blank lines are stripped before execution.

use std::sync::OnceLock;

use regex::Regex;

/// Default statement separator, overridable via `command_separator`.
pub const DEFAULT_COMMAND_SEPARATOR: &str = "--;;";

fn build_separator_re(separator: &str) -> Regex {
    Regex::new(&format!(r"(?m)^{}.*\n?", regex::escape(separator))).unwrap()
}

fn default_separator_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| build_separator_re(DEFAULT_COMMAND_SEPARATOR))
}

fn comment_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^--.*$").unwrap())
}

/// A hook applied to every statement before it is sent to the database.
/// Returns either a single replacement or a sequence of replacements.
pub trait ModifySql: Send + Sync {
    /// Transform one statement, possibly expanding it into several.
    fn modify(&self, statement: &str) -> Vec<String>;
}

impl<F> ModifySql for F
where
    F: Fn(&str) -> Vec<String> + Send + Sync,
{
    fn modify(&self, statement: &str) -> Vec<String> {
        self(statement)
    }
}

/// Split raw migration text into a sequence of executable statements.
///
/// Splits on a `separator` line (`--;;` by default, overridable via
/// `command_separator`), then drops comment-only and blank lines from each
/// fragment. Fragments that are empty after stripping are dropped entirely.
/// If `modify` is supplied, it runs over each remaining fragment and may
/// expand it into multiple statements.
pub fn split_statements(text: &str, separator: &str, modify: Option<&dyn ModifySql>) -> Vec<String> {
    let owned_re;
    let re = if separator == DEFAULT_COMMAND_SEPARATOR {
        default_separator_re()
    } else {
        owned_re = build_separator_re(separator);
        &owned_re
    };
    let fragments = re.split(text);

    let mut statements = Vec::new();
    for fragment in fragments {
        let stripped = strip_comments(fragment);
        if stripped.trim().is_empty() {
            continue;
        }
        match modify {
            Some(hook) => statements.extend(hook.modify(&stripped)),
            None => statements.push(stripped),
        }
    }
    statements
}

fn strip_comments(fragment: &str) -> String {
    let without_comments = comment_line_re().replace_all(fragment, "");
    without_comments
        .lines()
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
