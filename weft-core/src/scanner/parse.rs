//! Template signature parsing.
//!
//! The primary parser understands the template grammar directly: a
//! `package <identifier>` line, free import statements, and component
//! blocks `templ <Name>(<params>) { ... }`. Host-language code between
//! blocks is tolerated as long as braces stay balanced. When the primary
//! parser rejects a file, [`extract_loose`] falls back to line-oriented
//! extraction so one syntax error never hides every component in a file.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::component::Parameter;
use crate::error::{Result, WeftError};

static IDENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

/// `@Name(` component references inside block bodies.
static DEPENDENCY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@([A-Za-z_][A-Za-z0-9_]*)\s*\(").expect("dependency regex"));

/// One component signature as declared in source.
#[derive(Debug, Clone, PartialEq)]
pub struct RawComponent {
    pub name: String,
    pub parameters: Vec<Parameter>,
    pub dependencies: BTreeSet<String>,
    /// 1-based line of the `templ` keyword.
    pub line: u32,
}

/// Everything extracted from one template file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSignature {
    pub package: String,
    pub imports: Vec<String>,
    pub components: Vec<RawComponent>,
}

/// Strict parse of the template grammar.
pub fn parse_template(file: &std::path::Path, source: &str) -> Result<ParsedSignature> {
    let err = |line: u32, column: u32, message: String| WeftError::Parse {
        file: file.to_path_buf(),
        line,
        column,
        message,
    };

    let mut parsed = ParsedSignature::default();
    let mut current: Option<RawComponent> = None;
    let mut depth: i64 = 0;
    let mut import_block = false;

    for (idx, raw_line) in source.lines().enumerate() {
        let line_no = (idx + 1) as u32;
        let line = raw_line.trim();

        if depth == 0 {
            if import_block {
                if line == ")" {
                    import_block = false;
                } else if !line.is_empty() {
                    parsed.imports.push(format!("import {line}"));
                }
                continue;
            }
            if line.is_empty() || line.starts_with("//") {
                continue;
            }
            if let Some(rest) = line.strip_prefix("package ") {
                let name = rest.trim();
                if !IDENT.is_match(name) {
                    return Err(err(line_no, 9, format!("invalid package name {name:?}")));
                }
                if !parsed.package.is_empty() {
                    return Err(err(line_no, 1, "duplicate package declaration".to_string()));
                }
                parsed.package = name.to_string();
                continue;
            }
            if line == "import (" || line == "import(" {
                import_block = true;
                continue;
            }
            if line == "import" || line.starts_with("import ") || line.starts_with("import(") {
                parsed.imports.push(line.to_string());
                continue;
            }
            if let Some(rest) = line.strip_prefix("templ ") {
                let (component, after_params) = parse_signature(rest, line_no)
                    .map_err(|(column, message)| err(line_no, column, message))?;
                let tail = &rest[after_params..];
                if !tail.trim_start().starts_with('{') {
                    return Err(err(
                        line_no,
                        (after_params + 7) as u32,
                        "component signature must open a block".to_string(),
                    ));
                }
                current = Some(component);
                // The tail (opening brace onward) is body text; a one-line
                // component closes again on this same line.
                scan_body(tail, line_no, &mut depth, &mut current, &mut parsed)
                    .map_err(|(column, message)| err(line_no, column, message))?;
                continue;
            }
        }

        scan_body(raw_line, line_no, &mut depth, &mut current, &mut parsed)
            .map_err(|(column, message)| err(line_no, column, message))?;
    }

    if import_block {
        let line = source.lines().count() as u32;
        return Err(err(line, 1, "unterminated import block".to_string()));
    }
    if depth != 0 || current.is_some() {
        let line = source.lines().count() as u32;
        return Err(err(line, 1, "unterminated block at end of file".to_string()));
    }
    if parsed.package.is_empty() {
        return Err(err(1, 1, "missing package declaration".to_string()));
    }
    Ok(parsed)
}

/// Scan body (or top-level host code) text: collect `@Name(` references,
/// track brace balance, and close the current component when depth returns
/// to zero. Errors are `(column, message)`.
fn scan_body(
    segment: &str,
    _line_no: u32,
    depth: &mut i64,
    current: &mut Option<RawComponent>,
    parsed: &mut ParsedSignature,
) -> std::result::Result<(), (u32, String)> {
    for capture in DEPENDENCY.captures_iter(segment) {
        if let Some(component) = current.as_mut() {
            component.dependencies.insert(capture[1].to_string());
        }
    }
    for (col, ch) in segment.char_indices() {
        match ch {
            '{' => *depth += 1,
            '}' => {
                *depth -= 1;
                if *depth < 0 {
                    return Err(((col + 1) as u32, "unbalanced '}'".to_string()));
                }
                if *depth == 0
                    && let Some(done) = current.take()
                {
                    parsed.components.push(done);
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Parse `Name(<params>)` from the text following the `templ` keyword.
/// Returns the component and the byte offset just past the closing paren.
/// Errors are `(column, message)` relative to the keyword's line.
fn parse_signature(
    rest: &str,
    line_no: u32,
) -> std::result::Result<(RawComponent, usize), (u32, String)> {
    let open = rest
        .find('(')
        .ok_or((7, "expected '(' after component name".to_string()))?;
    let name = rest[..open].trim();
    if !IDENT.is_match(name) {
        return Err((7, format!("invalid component name {name:?}")));
    }

    let close = find_matching_paren(&rest[open..])
        .map(|i| open + i)
        .ok_or((open as u32 + 7, "unbalanced '(' in parameter list".to_string()))?;
    let params = parse_parameters(&rest[open + 1..close])
        .map_err(|message| (open as u32 + 8, message))?;

    Ok((
        RawComponent {
            name: name.to_string(),
            parameters: params,
            dependencies: BTreeSet::new(),
            line: line_no,
        },
        close + 1,
    ))
}

fn find_matching_paren(s: &str) -> Option<usize> {
    let mut depth = 0i64;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a comma-separated `name type[= default]` list. Commas nested in
/// brackets (generic or map types, function types) do not split.
fn parse_parameters(list: &str) -> std::result::Result<Vec<Parameter>, String> {
    let mut parameters = Vec::new();
    let mut seen = BTreeSet::new();

    for item in split_top_level(list, ',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }

        let (decl, default) = match split_once_top_level(item, '=') {
            Some((decl, default)) => {
                let default = default.trim();
                if default.is_empty() {
                    return Err(format!("parameter {decl:?} has an empty default"));
                }
                (decl.trim(), Some(default.to_string()))
            }
            None => (item, None),
        };

        let Some((name, ty)) = decl.split_once(char::is_whitespace) else {
            return Err(format!("parameter {decl:?} is missing a type"));
        };
        let name = name.trim();
        let ty = ty.trim();
        if !IDENT.is_match(name) {
            return Err(format!("invalid parameter name {name:?}"));
        }
        if ty.is_empty() {
            return Err(format!("parameter {name:?} is missing a type"));
        }
        if !seen.insert(name.to_string()) {
            return Err(format!("duplicate parameter name {name:?}"));
        }

        parameters.push(match default {
            Some(default) => Parameter::optional(name, ty, default),
            None => Parameter::required(name, ty),
        });
    }

    Ok(parameters)
}

fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i64;
    let mut start = 0;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(&s[start..i]);
                start = i + sep.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

fn split_once_top_level(s: &str, sep: char) -> Option<(&str, &str)> {
    let mut depth = 0i64;
    for (i, ch) in s.char_indices() {
        match ch {
            '(' | '[' | '{' => depth += 1,
            ')' | ']' | '}' => depth -= 1,
            c if c == sep && depth == 0 => {
                return Some((&s[..i], &s[i + sep.len_utf8()..]));
            }
            _ => {}
        }
    }
    None
}

/// Line-oriented fallback used when [`parse_template`] rejects a file.
/// Infallible: extracts whatever well-formed declarations it can find and
/// silently skips the rest.
pub fn extract_loose(source: &str) -> ParsedSignature {
    let mut parsed = ParsedSignature::default();

    for (idx, raw_line) in source.lines().enumerate() {
        let line = raw_line.trim();
        if let Some(rest) = line.strip_prefix("package ") {
            let name = rest.trim();
            if parsed.package.is_empty() && IDENT.is_match(name) {
                parsed.package = name.to_string();
            }
            continue;
        }
        if line.starts_with("import ") || line == "import" || line.starts_with("import(") {
            parsed.imports.push(line.to_string());
            continue;
        }
        let Some(rest) = line.strip_prefix("templ ") else {
            continue;
        };
        let Some(open) = rest.find('(') else {
            continue;
        };
        let name = rest[..open].trim();
        if !IDENT.is_match(name) {
            continue;
        }
        let close = match find_matching_paren(&rest[open..]) {
            Some(i) => open + i,
            None => continue,
        };
        let Ok(parameters) = parse_parameters(&rest[open + 1..close]) else {
            continue;
        };
        parsed.components.push(RawComponent {
            name: name.to_string(),
            parameters,
            dependencies: BTreeSet::new(),
            line: (idx + 1) as u32,
        });
    }

    if parsed.package.is_empty() {
        parsed.package = "main".to_string();
    }
    parsed
}
