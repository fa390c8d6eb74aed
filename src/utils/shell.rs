//! Shell quoting utilities.

/// Quote a string for use in a shell command.
/// This wraps the string in single quotes and escapes any existing single quotes.
pub fn quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }

    if !needs_quoting(s) {
        return s.to_string();
    }

    // abc's -> 'abc'"'"'s'
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// Check if a string needs quoting.
fn needs_quoting(s: &str) -> bool {
    s.chars().any(|c| {
        matches!(
            c,
            ' ' | '\t'
                | '\n'
                | '\r'
                | '"'
                | '\''
                | '\\'
                | '$'
                | '`'
                | '!'
                | '*'
                | '?'
                | '['
                | ']'
                | '{'
                | '}'
                | '('
                | ')'
                | '<'
                | '>'
                | '|'
                | '&'
                | ';'
                | '#'
                | '~'
        )
    })
}

/// Join arguments with proper quoting, for display.
pub fn join_args<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|s| quote(s.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a command line into arguments.
/// Uses shell-words crate for proper handling.
pub fn split_args(s: &str) -> Result<Vec<String>, shell_words::ParseError> {
    shell_words::split(s)
}
