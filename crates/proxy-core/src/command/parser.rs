use std::collections::HashMap;

use regex::Regex;

/// A parsed argument value. A bare key (no `=value`) parses to `Bool(true)`
/// per spec.md §4.3 grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Bool(bool),
    Text(String),
}

impl ArgValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ArgValue::Text(s) => Some(s),
            ArgValue::Bool(_) => None,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            ArgValue::Bool(b) => *b,
            ArgValue::Text(s) => !s.is_empty(),
        }
    }
}

/// A single command occurrence found in a text segment, with the byte span
/// it occupies (used to splice it out of the original text).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    pub name: String,
    pub args: HashMap<String, ArgValue>,
    pub span: (usize, usize),
}

/// Parses the `<prefix> name ( "(" args? ")" )?` grammar from spec.md §4.3
/// into an ordered list of commands found in document order.
pub struct CommandParser {
    prefix: String,
    matcher: Regex,
}

impl CommandParser {
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        let escaped = regex::escape(&prefix);
        let matcher = Regex::new(&format!(
            r"{escaped}([A-Za-z][A-Za-z0-9_-]*)(\(([^)]*)\))?"
        ))
        .expect("command grammar regex is well-formed");
        Self { prefix, matcher }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Finds every command occurrence in `text`, in document order.
    pub fn find_commands(&self, text: &str) -> Vec<ParsedCommand> {
        self.matcher
            .captures_iter(text)
            .map(|caps| {
                let whole = caps.get(0).unwrap();
                let name = caps.get(1).unwrap().as_str().to_string();
                let args = caps
                    .get(3)
                    .map(|m| parse_args(m.as_str()))
                    .unwrap_or_default();
                ParsedCommand {
                    name,
                    args,
                    span: (whole.start(), whole.end()),
                }
            })
            .collect()
    }
}

/// `args := arg ("," arg)*`, `arg := key ("=" value)?`. Inner commas inside
/// a quoted value are forbidden by the grammar, so a naive split on `,` at
/// the top level is sufficient once quotes are stripped per-arg.
fn parse_args(raw: &str) -> HashMap<String, ArgValue> {
    let mut out = HashMap::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((key, value)) => {
                let key = key.trim().to_string();
                let value = unquote(value.trim());
                out.insert(key, ArgValue::Text(value));
            }
            None => {
                out.insert(part.to_string(), ArgValue::Bool(true));
            }
        }
    }
    out
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

/// Collapses whitespace runs, strips XML-like tags and `#`-comment lines,
/// and trims — the post-substitution cleanup from spec.md §4.3 step 3.
pub fn collapse_and_strip(text: &str) -> String {
    static TAG_RE: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"<[^>]*>").unwrap());
    static WS_RE: once_cell::sync::Lazy<Regex> =
        once_cell::sync::Lazy::new(|| Regex::new(r"\s+").unwrap());

    let without_tags = TAG_RE.replace_all(text, "");
    let without_comments: String = without_tags
        .lines()
        .filter(|line| !line.trim_start().starts_with('#'))
        .collect::<Vec<_>>()
        .join(" ");
    WS_RE.replace_all(&without_comments, " ").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_command_with_args() {
        let parser = CommandParser::new("!/");
        let commands = parser.find_commands("!/set(temperature=0.2,loud) hi");
        assert_eq!(commands.len(), 1);
        let c = &commands[0];
        assert_eq!(c.name, "set");
        assert_eq!(c.args.get("temperature"), Some(&ArgValue::Text("0.2".to_string())));
        assert_eq!(c.args.get("loud"), Some(&ArgValue::Bool(true)));
    }

    #[test]
    fn parses_bare_command_without_parens() {
        let parser = CommandParser::new("!/");
        let commands = parser.find_commands("!/hello there");
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].name, "hello");
        assert!(commands[0].args.is_empty());
    }

    #[test]
    fn strips_quotes_from_values() {
        let parser = CommandParser::new("!/");
        let commands = parser.find_commands(r#"!/project(dir="my proj")"#);
        assert_eq!(
            commands[0].args.get("dir"),
            Some(&ArgValue::Text("my proj".to_string()))
        );
    }

    #[test]
    fn span_covers_exact_match_for_removal() {
        let parser = CommandParser::new("!/");
        let text = "before !/hello after";
        let commands = parser.find_commands(text);
        let (start, end) = commands[0].span;
        assert_eq!(&text[start..end], "!/hello");
    }

    #[test]
    fn collapse_strips_tags_comments_and_whitespace() {
        let out = collapse_and_strip("  a  <b>ignored</b>   c\n# a comment\nd  ");
        assert_eq!(out, "a ignored c d");
    }
}
