//! Import of newsboat-style plain-text queue files.
//!
//! Each line reads `URL "destination" [status]`. Tokens are separated by
//! spaces and may be double-quoted; quoted tokens understand `\"`, `\\`,
//! `\n`, `\r` and `\t`, and any other escaped character stands for itself.

use crate::types::Status;
use std::path::PathBuf;

/// One entry of a legacy queue file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacyEntry {
    /// 1-based line number the entry came from
    pub line: usize,
    /// Enclosure URL
    pub url: String,
    /// Destination path as written in the file
    pub destination: PathBuf,
    /// Status recorded after the destination, if any
    pub status: Option<Status>,
}

/// Why a line could not be imported
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacyLineError {
    /// 1-based line number
    pub line: usize,
    /// Description of the problem
    pub reason: String,
}

/// Parse a whole legacy queue file
///
/// Blank lines are ignored. Malformed lines are returned separately so the
/// caller can report them without losing the good entries.
pub fn parse_queue(contents: &str) -> (Vec<LegacyEntry>, Vec<LegacyLineError>) {
    let mut entries = Vec::new();
    let mut errors = Vec::new();

    for (index, raw) in contents.lines().enumerate() {
        let line = index + 1;
        if raw.trim().is_empty() {
            continue;
        }
        match parse_line(raw) {
            Ok((url, destination, status)) => entries.push(LegacyEntry {
                line,
                url,
                destination: PathBuf::from(destination),
                status,
            }),
            Err(reason) => errors.push(LegacyLineError { line, reason }),
        }
    }

    (entries, errors)
}

fn parse_line(raw: &str) -> Result<(String, String, Option<Status>), String> {
    let tokens = tokenize(raw)?;
    let mut tokens = tokens.into_iter();

    let url = tokens.next().ok_or_else(|| "empty line".to_string())?;
    let destination = tokens
        .next()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| "missing destination".to_string())?;
    let status = match tokens.next().as_deref() {
        None => None,
        Some("downloaded" | "played" | "finished") => Some(Status::Finished),
        Some(other) => return Err(format!("unknown status {other:?}")),
    };
    if tokens.next().is_some() {
        return Err("trailing tokens".to_string());
    }

    Ok((url, destination, status))
}

fn tokenize(raw: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = raw.trim().chars().peekable();

    while let Some(&c) = chars.peek() {
        if c == ' ' || c == '\t' {
            chars.next();
            continue;
        }

        if c == '"' {
            chars.next();
            let mut token = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '"' => {
                        closed = true;
                        break;
                    }
                    '\\' => match chars.next() {
                        Some('n') => token.push('\n'),
                        Some('r') => token.push('\r'),
                        Some('t') => token.push('\t'),
                        Some(other) => token.push(other),
                        None => return Err("dangling escape".to_string()),
                    },
                    other => token.push(other),
                }
            }
            if !closed {
                return Err("unterminated quote".to_string());
            }
            tokens.push(token);
        } else {
            let mut token = String::new();
            while let Some(&c) = chars.peek() {
                if c == ' ' || c == '\t' {
                    break;
                }
                token.push(c);
                chars.next();
            }
            tokens.push(token);
        }
    }

    Ok(tokens)
}
