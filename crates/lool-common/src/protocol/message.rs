//! Frame splitting and token parsing.
//!
//! All commands are ASCII; payloads after the first newline are opaque bytes
//! and never inspected here.

/// Returns the first line of a frame: everything up to (not including) the
/// first `\n`, or the whole buffer if it contains none.
///
/// A first line that is not valid UTF-8 yields the empty string, which the
/// routers treat as a syntax failure.
pub fn first_line(data: &[u8]) -> &str {
    let end = data.iter().position(|&b| b == b'\n').unwrap_or(data.len());
    std::str::from_utf8(&data[..end]).unwrap_or("")
}

/// Splits a frame into its command line and the optional binary tail that
/// follows the first `\n`.
pub fn split_frame(data: &[u8]) -> (&str, Option<&[u8]>) {
    match data.iter().position(|&b| b == b'\n') {
        Some(pos) => (
            std::str::from_utf8(&data[..pos]).unwrap_or(""),
            Some(&data[pos + 1..]),
        ),
        None => (std::str::from_utf8(data).unwrap_or(""), None),
    }
}

/// Tokenizes a command line: split on spaces, trim, drop empty tokens.
pub fn tokenize(line: &str) -> Vec<&str> {
    line.split(' ')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}

/// Extracts the value of a `name=value` token, requiring an exact name match.
pub fn token_string<'a>(token: &'a str, name: &str) -> Option<&'a str> {
    let rest = token.strip_prefix(name)?;
    rest.strip_prefix('=')
}

/// Extracts an integer from a `name=value` token.
///
/// Returns `None` both when the name does not match and when the value does
/// not parse; callers report either as a syntax error on the whole frame.
pub fn token_int(token: &str, name: &str) -> Option<i64> {
    token_string(token, name)?.parse().ok()
}

/// Abbreviates a frame for logging: its first line, truncated to `max` bytes.
pub fn abbreviate(data: &[u8], max: usize) -> String {
    let line = first_line(data);
    if line.len() <= max {
        return line.to_string();
    }
    let mut end = max;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &line[..end])
}

/// The document-addressing options carried by a `load` command.
///
/// `load [part=N] url=... [jail=...] [timestamp=...] [options=...]` where
/// `options=` swallows the remainder of the line (the value is free-form
/// JSON that may itself contain spaces).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocOptions {
    pub part: i32,
    pub url: Option<String>,
    pub jail: Option<String>,
    pub timestamp: Option<String>,
    pub options: Option<String>,
}

/// Parses the tokens of a `load` command (the first token is the command
/// itself and is skipped).
pub fn parse_doc_options(tokens: &[&str]) -> DocOptions {
    let mut opts = DocOptions {
        part: -1,
        ..Default::default()
    };

    for (i, token) in tokens.iter().enumerate().skip(1) {
        if let Some(part) = token_int(token, "part") {
            opts.part = part as i32;
        } else if let Some(url) = token_string(token, "url") {
            opts.url = Some(url.to_string());
        } else if let Some(jail) = token_string(token, "jail") {
            opts.jail = Some(jail.to_string());
        } else if let Some(ts) = token_string(token, "timestamp") {
            opts.timestamp = Some(ts.to_string());
        } else if let Some(head) = token_string(token, "options") {
            // options= takes everything to the end of the line.
            let mut value = head.to_string();
            for tail in &tokens[i + 1..] {
                value.push(' ');
                value.push_str(tail);
            }
            opts.options = Some(value);
            break;
        }
    }

    opts
}
