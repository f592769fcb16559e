// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lightweight syntax scanners used by the gate and by code-generation
//! agents for post-generation validation.
//!
//! The JS/TS scanner is structural, not a parser: it tracks strings,
//! template literals, and comments, and reports unbalanced brackets and
//! unterminated literals. It accepts some programs a real parser would
//! reject; it never rejects a well-formed one.

/// Scan JS/TS-family source and return found problems (empty = clean).
#[must_use]
pub fn scan_source(source: &str) -> Vec<String> {
    #[derive(PartialEq)]
    enum Mode {
        Normal,
        LineComment,
        BlockComment,
        Single,
        Double,
        Template,
    }

    let mut errors = Vec::new();
    let mut mode = Mode::Normal;
    // Bracket stack entries: (opening char, line).
    let mut stack: Vec<(char, usize)> = Vec::new();
    // Template literals nest through `${ ... }`; remember stack depth at entry.
    let mut template_marks: Vec<usize> = Vec::new();
    let mut line = 1usize;
    let mut prev = '\0';
    let mut chars = source.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' {
            line += 1;
            match mode {
                Mode::LineComment => mode = Mode::Normal,
                Mode::Single | Mode::Double => {
                    errors.push(format!("unterminated string literal on line {}", line - 1));
                    mode = Mode::Normal;
                }
                _ => {}
            }
            prev = c;
            continue;
        }

        match mode {
            Mode::LineComment => {}
            Mode::BlockComment => {
                if prev == '*' && c == '/' {
                    mode = Mode::Normal;
                    // Reset so `*/*/` is not misread.
                    prev = '\0';
                    continue;
                }
            }
            Mode::Single => {
                if c == '\'' && prev != '\\' {
                    mode = Mode::Normal;
                } else if prev == '\\' && c == '\\' {
                    prev = '\0';
                    continue;
                }
            }
            Mode::Double => {
                if c == '"' && prev != '\\' {
                    mode = Mode::Normal;
                } else if prev == '\\' && c == '\\' {
                    prev = '\0';
                    continue;
                }
            }
            Mode::Template => {
                if c == '`' && prev != '\\' {
                    mode = Mode::Normal;
                } else if prev == '$' && c == '{' {
                    // Interpolation: resume normal scanning until the matching
                    // brace closes.
                    template_marks.push(stack.len());
                    stack.push(('{', line));
                    mode = Mode::Normal;
                }
            }
            Mode::Normal => match c {
                '/' => {
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        mode = Mode::LineComment;
                    } else if chars.peek() == Some(&'*') {
                        chars.next();
                        mode = Mode::BlockComment;
                        prev = '\0';
                        continue;
                    }
                }
                '\'' => mode = Mode::Single,
                '"' => mode = Mode::Double,
                '`' => mode = Mode::Template,
                '(' | '[' | '{' => stack.push((c, line)),
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, _)) if open == expected => {
                            // Closing the interpolation brace returns to the
                            // template literal.
                            if c == '}' && template_marks.last() == Some(&stack.len()) {
                                template_marks.pop();
                                mode = Mode::Template;
                            }
                        }
                        Some((open, open_line)) => {
                            errors.push(format!(
                                "mismatched bracket: `{c}` on line {line} closes `{open}` from line {open_line}"
                            ));
                        }
                        None => {
                            errors.push(format!("unexpected `{c}` on line {line}"));
                        }
                    }
                }
                _ => {}
            },
        }
        prev = c;
    }

    match mode {
        Mode::Single | Mode::Double => {
            errors.push(format!("unterminated string literal on line {line}"));
        }
        Mode::Template => errors.push("unterminated template literal".to_string()),
        Mode::BlockComment => errors.push("unterminated block comment".to_string()),
        _ => {}
    }
    for (open, open_line) in stack {
        errors.push(format!("unclosed `{open}` from line {open_line}"));
    }
    errors
}

/// Validate JSON content.
#[must_use]
pub fn scan_json(source: &str) -> Vec<String> {
    match serde_json::from_str::<serde_json::Value>(source) {
        Ok(_) => Vec::new(),
        Err(e) => vec![format!("invalid JSON: {e}")],
    }
}

/// Validate CSS by balanced-brace/parenthesis scan (comment- and
/// string-aware).
#[must_use]
pub fn scan_css(source: &str) -> Vec<String> {
    let mut errors = Vec::new();
    let mut braces: i64 = 0;
    let mut parens: i64 = 0;
    let mut in_comment = false;
    let mut in_string: Option<char> = None;
    let mut prev = '\0';

    for c in source.chars() {
        if in_comment {
            if prev == '*' && c == '/' {
                in_comment = false;
                prev = '\0';
                continue;
            }
            prev = c;
            continue;
        }
        if let Some(quote) = in_string {
            if c == quote && prev != '\\' {
                in_string = None;
            }
            prev = c;
            continue;
        }
        match c {
            '/' if prev == '/' => {}
            '*' if prev == '/' => in_comment = true,
            '\'' | '"' => in_string = Some(c),
            '{' => braces += 1,
            '}' => braces -= 1,
            '(' => parens += 1,
            ')' => parens -= 1,
            _ => {}
        }
        if braces < 0 {
            errors.push("unexpected `}`".to_string());
            braces = 0;
        }
        if parens < 0 {
            errors.push("unexpected `)`".to_string());
            parens = 0;
        }
        prev = c;
    }
    if braces > 0 {
        errors.push(format!("{braces} unclosed brace(s)"));
    }
    if parens > 0 {
        errors.push(format!("{parens} unclosed parenthesis(es)"));
    }
    errors
}

/// File-extension dispatch used by the syntax check.
///
/// Returns `None` for extensions the gate does not validate.
#[must_use]
pub fn scan_by_extension(path: &str, content: &str) -> Option<Vec<String>> {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "js" | "jsx" | "ts" | "tsx" | "mjs" | "cjs" => Some(scan_source(content)),
        "json" => Some(scan_json(content)),
        "css" => Some(scan_css(content)),
        _ => None,
    }
}
