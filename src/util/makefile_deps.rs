//! Parser for makefile-format dependency files.
//!
//! Compilers invoked with `-MF` emit files of the form
//! `output.o: input.c header.h \` with backslash line continuations and
//! backslash-escaped spaces in paths. The parser ignores the rule target
//! and hands every dependency it finds to the caller.

use thiserror::Error;

/// A malformed dependency file.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DepsParseError {
    #[error("missing ':' after rule target at offset {0}")]
    MissingColon(usize),
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedCharacter(char, usize),
}

/// Parse a makefile-format dependency file, invoking `on_dependency` for
/// each dependency of each rule, in order of appearance.
pub fn parse_deps(
    input: &str,
    mut on_dependency: impl FnMut(&str),
) -> Result<(), DepsParseError> {
    let bytes = input.as_bytes();
    let mut pos = 0;

    while pos < bytes.len() {
        skip_blank(bytes, &mut pos);
        if pos >= bytes.len() {
            break;
        }

        // Rule target (everything up to an unescaped ':').
        let target_start = pos;
        let mut saw_colon = false;
        while pos < bytes.len() {
            match bytes[pos] {
                b':' => {
                    saw_colon = true;
                    pos += 1;
                    break;
                }
                b'\n' => break,
                b'\\' if pos + 1 < bytes.len() => pos += 2,
                _ => pos += 1,
            }
        }
        if !saw_colon {
            return Err(DepsParseError::MissingColon(target_start));
        }

        // Dependencies, up to the end of the (continued) line.
        loop {
            skip_spaces(bytes, &mut pos);
            if pos >= bytes.len() {
                break;
            }
            match bytes[pos] {
                b'\n' => {
                    pos += 1;
                    break;
                }
                b'\r' => {
                    pos += 1;
                }
                b'\\' if line_continuation(bytes, pos) => {
                    pos = after_continuation(bytes, pos);
                }
                _ => {
                    let word = read_word(input, bytes, &mut pos)?;
                    if !word.is_empty() {
                        on_dependency(&word);
                    }
                }
            }
        }
    }

    Ok(())
}

/// Parse the file and collect every dependency.
pub fn parse_deps_to_vec(input: &str) -> Result<Vec<String>, DepsParseError> {
    let mut deps = Vec::new();
    parse_deps(input, |dep| deps.push(dep.to_string()))?;
    Ok(deps)
}

fn skip_blank(bytes: &[u8], pos: &mut usize) {
    while *pos < bytes.len() && (bytes[*pos] as char).is_ascii_whitespace() {
        *pos += 1;
    }
}

fn skip_spaces(bytes: &[u8], pos: &mut usize) {
    while *pos < bytes.len() && (bytes[*pos] == b' ' || bytes[*pos] == b'\t') {
        *pos += 1;
    }
}

fn line_continuation(bytes: &[u8], pos: usize) -> bool {
    bytes[pos] == b'\\'
        && (pos + 1 >= bytes.len()
            || bytes[pos + 1] == b'\n'
            || (bytes[pos + 1] == b'\r' && pos + 2 < bytes.len() && bytes[pos + 2] == b'\n'))
}

fn after_continuation(bytes: &[u8], pos: usize) -> usize {
    let mut next = pos + 1;
    if next < bytes.len() && bytes[next] == b'\r' {
        next += 1;
    }
    if next < bytes.len() && bytes[next] == b'\n' {
        next += 1;
    }
    next
}

fn read_word(input: &str, bytes: &[u8], pos: &mut usize) -> Result<String, DepsParseError> {
    let mut word = String::new();
    while *pos < bytes.len() {
        match bytes[*pos] {
            b' ' | b'\t' | b'\n' | b'\r' => break,
            b'\\' if line_continuation(bytes, *pos) => break,
            b'\\' if *pos + 1 < bytes.len() => {
                // Escaped character; most commonly a space in a path.
                let escaped = bytes[*pos + 1];
                if !escaped.is_ascii() {
                    let ch = input[*pos + 1..].chars().next().unwrap_or('\u{fffd}');
                    return Err(DepsParseError::UnexpectedCharacter(ch, *pos + 1));
                }
                word.push(escaped as char);
                *pos += 2;
            }
            _ => {
                let ch = input[*pos..].chars().next().unwrap_or('\u{fffd}');
                word.push(ch);
                *pos += ch.len_utf8();
            }
        }
    }
    Ok(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_rule() {
        let deps = parse_deps_to_vec("main.o: main.c header.h\n").unwrap();
        assert_eq!(deps, vec!["main.c", "header.h"]);
    }

    #[test]
    fn test_line_continuation() {
        let deps = parse_deps_to_vec("main.o: main.c \\\n  header.h \\\n  other.h\n").unwrap();
        assert_eq!(deps, vec!["main.c", "header.h", "other.h"]);
    }

    #[test]
    fn test_escaped_space_in_path() {
        let deps = parse_deps_to_vec("out: some\\ file.h plain.h\n").unwrap();
        assert_eq!(deps, vec!["some file.h", "plain.h"]);
    }

    #[test]
    fn test_multiple_rules() {
        let deps = parse_deps_to_vec("a.o: a.c\nb.o: b.c shared.h\n").unwrap();
        assert_eq!(deps, vec!["a.c", "b.c", "shared.h"]);
    }

    #[test]
    fn test_missing_colon() {
        let err = parse_deps_to_vec("no colon here\n").unwrap_err();
        assert!(matches!(err, DepsParseError::MissingColon(_)));
    }

    #[test]
    fn test_empty_input() {
        assert!(parse_deps_to_vec("").unwrap().is_empty());
        assert!(parse_deps_to_vec("\n\n  \n").unwrap().is_empty());
    }

    #[test]
    fn test_no_trailing_newline() {
        let deps = parse_deps_to_vec("main.o: main.c header.h").unwrap();
        assert_eq!(deps, vec!["main.c", "header.h"]);
    }
}
