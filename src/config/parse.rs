//! Parser for the `key = value` config file format.
//!
//! Supported values: double-quoted strings, integers, decimals and
//! `true`/`false`. `#` starts a comment outside of strings. Keys are
//! case-insensitive and stored upper-cased.

use std::collections::HashMap;

use super::ConfigError;

pub(crate) fn parse_config_str(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut values = HashMap::new();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line_no = line_index + 1;
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }

        let Some((raw_key, raw_value)) = line.split_once('=') else {
            return Err(ConfigError::syntax(line_no, "expected key = value"));
        };

        let key = raw_key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ConfigError::syntax(line_no, format!("invalid key '{key}'")));
        }
        let value = parse_value(raw_value.trim())
            .map_err(|message| ConfigError::syntax(line_no, format!("`{key}`: {message}")))?;
        values.insert(key.to_ascii_uppercase(), value);
    }
    Ok(values)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_value(raw_value: &str) -> Result<String, String> {
    if raw_value.starts_with('"') {
        return parse_string_literal(raw_value);
    }
    match raw_value {
        "true" | "false" => return Ok(raw_value.to_string()),
        "" => return Err("expected a value".to_string()),
        _ => {}
    }
    if raw_value.parse::<i128>().is_ok() || raw_value.parse::<f64>().is_ok_and(f64::is_finite) {
        return Ok(raw_value.to_string());
    }
    Err(format!(
        "expected double-quoted string, number or boolean, got '{raw_value}'"
    ))
}

fn parse_string_literal(raw_value: &str) -> Result<String, String> {
    if raw_value.len() < 2 || !raw_value.ends_with('"') {
        return Err("unterminated string".to_string());
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}
