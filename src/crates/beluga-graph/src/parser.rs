//! DOT-subset parser for pipeline source text
//!
//! The supported grammar is a deliberately small slice of DOT: one
//! `digraph NAME { ... }`, statements separated by `;` or newlines
//! (quoted strings do not participate in splitting), `//` and `#` line
//! comments, `graph`/`node`/`edge` default statements, node
//! declarations, and chained `A -> B -> C [k=v, ...]` edge statements.
//!
//! Undirected edges (`--`), `subgraph` blocks, multiple digraphs per
//! file, and HTML labels are rejected outright.

use crate::error::{GraphError, Result};
use crate::model::{is_valid_identifier, AttrValue, Attrs, Edge, Graph, Node};

/// Parse pipeline source text into a [`Graph`]
pub fn parse_dot(source: &str) -> Result<Graph> {
    let stripped = strip_comments(source);

    let (name, body, body_line) = extract_digraph(&stripped)?;
    let mut graph = Graph::new(name);

    let mut node_defaults = Attrs::new();
    let mut edge_defaults = Attrs::new();

    for (line, statement) in split_statements(body, body_line) {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        if contains_outside_quotes(statement, "--") {
            return Err(GraphError::parse(
                line,
                "undirected edges ('--') are not supported",
            ));
        }
        if statement.starts_with("subgraph") {
            return Err(GraphError::parse(line, "subgraph blocks are not supported"));
        }

        let (head, attrs_src) = split_attr_list(statement, line)?;
        let head = head.trim();
        if head.is_empty() {
            return Err(GraphError::parse(line, "statement has no subject"));
        }

        match head {
            "graph" => {
                let attrs = parse_attrs(attrs_src.unwrap_or(""), line)?;
                graph.attrs.merge(&attrs);
            }
            "node" => {
                let attrs = parse_attrs(attrs_src.unwrap_or(""), line)?;
                node_defaults.merge(&attrs);
            }
            "edge" => {
                let attrs = parse_attrs(attrs_src.unwrap_or(""), line)?;
                edge_defaults.merge(&attrs);
            }
            _ if contains_outside_quotes(head, "->") => {
                let attrs = match attrs_src {
                    Some(src) => parse_attrs(src, line)?,
                    None => Attrs::new(),
                };
                let ids: Vec<&str> = head.split("->").map(str::trim).collect();
                for id in &ids {
                    if !is_valid_identifier(id) {
                        return Err(GraphError::parse(
                            line,
                            format!("invalid node identifier '{id}' in edge statement"),
                        ));
                    }
                }
                for pair in ids.windows(2) {
                    let mut edge = Edge::new(pair[0], pair[1]);
                    edge.attrs.merge(&edge_defaults);
                    edge.attrs.merge(&attrs);
                    graph.edges.push(edge);
                }
            }
            _ => {
                if !is_valid_identifier(head) {
                    return Err(GraphError::parse(
                        line,
                        format!("invalid node identifier '{head}'"),
                    ));
                }
                let attrs = match attrs_src {
                    Some(src) => parse_attrs(src, line)?,
                    None => Attrs::new(),
                };
                let node = graph
                    .nodes
                    .entry(head.to_string())
                    .or_insert_with(|| {
                        let mut node = Node::new(head);
                        node.attrs.merge(&node_defaults);
                        node
                    });
                node.attrs.merge(&attrs);
            }
        }
    }

    Ok(graph)
}

/// Drop `//` and `#` comment lines, preserving line structure
fn strip_comments(source: &str) -> String {
    source
        .lines()
        .map(|l| {
            let trimmed = l.trim_start();
            if trimmed.starts_with("//") || trimmed.starts_with('#') {
                ""
            } else {
                l
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Locate the single `digraph NAME { ... }` block
///
/// Returns (name, body slice, 1-based line of the opening brace).
fn extract_digraph(source: &str) -> Result<(String, &str, usize)> {
    let keyword = "digraph";
    let occurrences = keyword_occurrences(source, keyword);
    let first = *occurrences
        .first()
        .ok_or_else(|| GraphError::parse(1, "expected 'digraph NAME { ... }'"))?;
    if occurrences.len() > 1 {
        return Err(GraphError::parse(
            line_of(source, occurrences[1]),
            "multiple digraph blocks per file are not supported",
        ));
    }
    let before = &source[..first];
    if !before.trim().is_empty() {
        return Err(GraphError::parse(
            1,
            "unexpected content before 'digraph'",
        ));
    }

    let rest = &source[first + keyword.len()..];
    let open_rel = rest
        .find('{')
        .ok_or_else(|| GraphError::parse(line_of(source, first), "missing '{' after digraph name"))?;
    let name = rest[..open_rel].trim().to_string();
    if !is_valid_identifier(&name) {
        return Err(GraphError::parse(
            line_of(source, first),
            format!("invalid digraph name '{name}'"),
        ));
    }

    let open_abs = first + keyword.len() + open_rel;
    let close_abs = source
        .rfind('}')
        .ok_or_else(|| GraphError::parse(line_of(source, open_abs), "missing closing '}'"))?;
    if close_abs < open_abs {
        return Err(GraphError::parse(
            line_of(source, open_abs),
            "missing closing '}'",
        ));
    }
    if !source[close_abs + 1..].trim().is_empty() {
        return Err(GraphError::parse(
            line_of(source, close_abs),
            "unexpected content after closing '}'",
        ));
    }

    let body = &source[open_abs + 1..close_abs];
    Ok((name, body, line_of(source, open_abs)))
}

fn line_of(source: &str, offset: usize) -> usize {
    source[..offset].bytes().filter(|b| *b == b'\n').count() + 1
}

/// Byte offsets of `keyword` as a standalone word outside quoted strings
fn keyword_occurrences(source: &str, keyword: &str) -> Vec<usize> {
    let bytes = source.as_bytes();
    let kw = keyword.as_bytes();
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_quotes {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_quotes = false;
            }
            i += 1;
            continue;
        }
        if b == b'"' {
            in_quotes = true;
            i += 1;
            continue;
        }
        if bytes[i..].starts_with(kw) {
            let before_ok = i == 0 || !is_word_byte(bytes[i - 1]);
            let after = i + kw.len();
            let after_ok = after >= bytes.len() || !is_word_byte(bytes[after]);
            if before_ok && after_ok {
                out.push(i);
                i = after;
                continue;
            }
        }
        i += 1;
    }
    out
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Split the digraph body into statements at `;` and newlines
///
/// Quoted strings are opaque to the splitter, and a newline inside an
/// open attribute list continues the statement. Each statement carries
/// the 1-based line number where it starts.
fn split_statements(body: &str, base_line: usize) -> Vec<(usize, String)> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut line = base_line;
    let mut stmt_line = line;
    let mut in_quotes = false;
    let mut escaped = false;
    let mut bracket_depth: usize = 0;

    for ch in body.chars() {
        if ch == '\n' {
            line += 1;
        }
        if in_quotes {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_quotes = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_quotes = true;
                current.push(ch);
            }
            '[' => {
                bracket_depth += 1;
                current.push(ch);
            }
            ']' => {
                bracket_depth = bracket_depth.saturating_sub(1);
                current.push(ch);
            }
            '\n' if bracket_depth > 0 => current.push(' '),
            ';' | '\n' => {
                if !current.trim().is_empty() {
                    out.push((stmt_line, std::mem::take(&mut current)));
                } else {
                    current.clear();
                }
                stmt_line = line;
            }
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        out.push((stmt_line, current));
    }
    out
}

/// True when `needle` occurs outside quoted strings
fn contains_outside_quotes(haystack: &str, needle: &str) -> bool {
    let mut in_quotes = false;
    let mut escaped = false;
    let bytes = haystack.as_bytes();
    let needle = needle.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_quotes {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_quotes = false;
            }
            i += 1;
            continue;
        }
        if b == b'"' {
            in_quotes = true;
            i += 1;
            continue;
        }
        if bytes[i..].starts_with(needle) {
            return true;
        }
        i += 1;
    }
    false
}

/// Split `head [attrs]` into its two halves
///
/// The attribute list must be the trailing bracketed segment of the
/// statement; brackets inside quoted strings are ignored.
fn split_attr_list(statement: &str, line: usize) -> Result<(&str, Option<&str>)> {
    let mut in_quotes = false;
    let mut escaped = false;
    let mut open = None;
    for (i, ch) in statement.char_indices() {
        if in_quotes {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_quotes = false;
            }
            continue;
        }
        match ch {
            '"' => in_quotes = true,
            '[' => {
                open = Some(i);
                break;
            }
            _ => {}
        }
    }
    let Some(open) = open else {
        return Ok((statement, None));
    };
    let close = statement
        .rfind(']')
        .ok_or_else(|| GraphError::parse(line, "unterminated attribute list"))?;
    if close < open {
        return Err(GraphError::parse(line, "unterminated attribute list"));
    }
    if !statement[close + 1..].trim().is_empty() {
        return Err(GraphError::parse(
            line,
            "unexpected content after attribute list",
        ));
    }
    Ok((&statement[..open], Some(&statement[open + 1..close])))
}

/// Parse a `k=v, k2=v2` attribute list body
fn parse_attrs(src: &str, line: usize) -> Result<Attrs> {
    let mut attrs = Attrs::new();
    for entry in split_entries(src) {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let eq = entry
            .find('=')
            .ok_or_else(|| GraphError::parse(line, format!("expected 'key=value', got '{entry}'")))?;
        let key = entry[..eq].trim();
        let value = entry[eq + 1..].trim();
        if key.is_empty() {
            return Err(GraphError::parse(line, "attribute key is empty"));
        }
        attrs.insert(key, parse_value(value, line)?);
    }
    Ok(attrs)
}

/// Split attribute entries on commas outside quoted strings
fn split_entries(src: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for ch in src.chars() {
        if in_quotes {
            current.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_quotes = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_quotes = true;
                current.push(ch);
            }
            ',' => out.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

/// Parse one attribute value into its typed form
fn parse_value(raw: &str, line: usize) -> Result<AttrValue> {
    if raw.starts_with('<') {
        return Err(GraphError::parse(line, "HTML labels are not supported"));
    }
    if let Some(inner) = raw.strip_prefix('"') {
        let inner = inner
            .strip_suffix('"')
            .ok_or_else(|| GraphError::parse(line, "unterminated string literal"))?;
        return Ok(AttrValue::String(unescape(inner)));
    }
    match raw {
        "true" => return Ok(AttrValue::Boolean(true)),
        "false" => return Ok(AttrValue::Boolean(false)),
        _ => {}
    }
    if let Some(value) = parse_duration(raw) {
        return Ok(value);
    }
    if let Ok(i) = raw.parse::<i64>() {
        return Ok(AttrValue::Integer(i));
    }
    if raw.contains('.') {
        if let Ok(f) = raw.parse::<f64>() {
            return Ok(AttrValue::Float(f));
        }
    }
    Ok(AttrValue::String(raw.to_string()))
}

/// `<int><ms|s|m|h|d>` duration literal
fn parse_duration(raw: &str) -> Option<AttrValue> {
    let unit_start = raw.find(|c: char| !c.is_ascii_digit())?;
    if unit_start == 0 {
        return None;
    }
    let (digits, unit) = raw.split_at(unit_start);
    let magnitude: u64 = digits.parse().ok()?;
    let millis = match unit {
        "ms" => magnitude,
        "s" => magnitude * 1_000,
        "m" => magnitude * 60_000,
        "h" => magnitude * 3_600_000,
        "d" => magnitude * 86_400_000,
        _ => return None,
    };
    Some(AttrValue::Duration {
        millis,
        raw: raw.to_string(),
    })
}

/// Resolve `\"`, `\n`, and `\\` escapes in a quoted string body
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('"') => out.push('"'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
