//! Utility functions for `pid_tid` thread keys and command-line splitting.
//!
//! Sample records identify threads with a combined `<pid>_<tid>` string
//! key; the helpers here build and take apart that form.

use regex::Regex;

use crate::errors::SessionError;

pub fn pid_tid_key(pid: u64, tid: u64) -> String {
    format!("{}_{}", pid, tid)
}

/// Split a `<pid>_<tid>` key into its two decimal components.
pub fn split_pid_tid(key: &str) -> Option<(&str, &str)> {
    let re = Regex::new(r"^(\d+)_(\d+)$").unwrap();
    let caps = re.captures(key)?;
    let pid_end = caps.get(1).unwrap().end();
    Some((&key[..pid_end], &key[pid_end + 1..]))
}

/// Split a command string the way a POSIX shell tokenizes words: whitespace
/// separates arguments, single quotes are literal, double quotes honor
/// backslash escapes, a backslash outside quotes escapes the next byte.
pub fn split_unix(command: &str) -> Result<Vec<String>, SessionError> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = command.chars();

    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }
    let mut quote = Quote::None;

    while let Some(c) = chars.next() {
        match quote {
            Quote::None => match c {
                '\'' => {
                    quote = Quote::Single;
                    in_word = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_word = true;
                }
                '\\' => match chars.next() {
                    Some(next) => {
                        current.push(next);
                        in_word = true;
                    }
                    None => {
                        return Err(SessionError::User(
                            "the command ends with an unfinished escape".to_string(),
                        ))
                    }
                },
                c if c.is_whitespace() => {
                    if in_word {
                        parts.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                c => {
                    current.push(c);
                    in_word = true;
                }
            },
            Quote::Single => match c {
                '\'' => quote = Quote::None,
                c => current.push(c),
            },
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\' | '$' | '`')) => current.push(next),
                    Some(next) => {
                        current.push('\\');
                        current.push(next);
                    }
                    None => {
                        return Err(SessionError::User(
                            "the command ends with an unfinished escape".to_string(),
                        ))
                    }
                },
                c => current.push(c),
            },
        }
    }

    if quote != Quote::None {
        return Err(SessionError::User(
            "the command has an unterminated quote".to_string(),
        ));
    }
    if in_word {
        parts.push(current);
    }

    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pid_tid_round_trip() {
        let key = pid_tid_key(1234, 5678);
        assert_eq!(key, "1234_5678");
        assert_eq!(split_pid_tid(&key), Some(("1234", "5678")));
    }

    #[test]
    fn test_split_pid_tid_rejects_garbage() {
        assert_eq!(split_pid_tid("1234"), None);
        assert_eq!(split_pid_tid("a_b"), None);
        assert_eq!(split_pid_tid("1_2_3"), None);
    }

    #[test]
    fn test_split_unix_words() {
        assert_eq!(
            split_unix("ls -la /tmp").unwrap(),
            vec!["ls", "-la", "/tmp"]
        );
    }

    #[test]
    fn test_split_unix_quoting() {
        assert_eq!(
            split_unix("sh -c 'echo \"a b\"'").unwrap(),
            vec!["sh", "-c", "echo \"a b\""]
        );
        assert_eq!(
            split_unix("echo \"hello world\"").unwrap(),
            vec!["echo", "hello world"]
        );
        assert_eq!(split_unix("a\\ b").unwrap(), vec!["a b"]);
    }

    #[test]
    fn test_split_unix_empty_and_errors() {
        assert!(split_unix("").unwrap().is_empty());
        assert!(split_unix("   ").unwrap().is_empty());
        assert!(split_unix("echo 'open").is_err());
        assert!(split_unix("echo \\").is_err());
    }
}
