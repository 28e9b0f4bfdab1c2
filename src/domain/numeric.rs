use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

pub fn find_value<'a>(object: &'a Map<String, Value>, aliases: &[&str]) -> Option<&'a Value> {
    for alias in aliases {
        if let Some(value) = object.get(*alias) {
            return Some(value);
        }
    }

    let normalized_aliases: Vec<String> =
        aliases.iter().map(|alias| normalize_key(alias)).collect();

    object.iter().find_map(|(key, value)| {
        let normalized_key = normalize_key(key);
        if normalized_aliases
            .iter()
            .any(|alias| alias == &normalized_key)
        {
            Some(value)
        } else {
            None
        }
    })
}

/// Identifier-like field that vendors send either as a string or a number.
pub fn find_text(object: &Map<String, Value>, aliases: &[&str]) -> Option<String> {
    match find_value(object, aliases)? {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub fn normalize_key(value: &str) -> String {
    value
        .chars()
        .filter(|char| char.is_ascii_alphanumeric())
        .flat_map(|char| char.to_lowercase())
        .collect()
}

/// Separator convention to assume when a token is ambiguous on its own.
///
/// `"1.234"` is one and a quarter under [`NumberLocale::Any`], the reading
/// vendor APIs need. Brazilian invoices write thousands with a dot, so under
/// [`NumberLocale::PtBr`] a lone dot followed by exactly three digits is a
/// thousands separator and `"1.234"` is 1234.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumberLocale {
    Any,
    PtBr,
}

pub fn parse_f64(value: &Value) -> Option<f64> {
    parse_f64_in(value, NumberLocale::Any)
}

pub fn parse_f64_in(value: &Value, locale: NumberLocale) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64().filter(|number| number.is_finite()),
        Value::String(text) => parse_f64_from_text_in(text, locale),
        _ => None,
    }
}

pub fn parse_f64_from_text(text: &str) -> Option<f64> {
    parse_f64_from_text_in(text, NumberLocale::Any)
}

pub fn parse_f64_from_text_in(text: &str, locale: NumberLocale) -> Option<f64> {
    extract_numeric_tokens(text).into_iter().find_map(|token| {
        normalize_numeric_token(&token, locale)
            .and_then(|normalized| normalized.parse::<f64>().ok())
            .filter(|number| number.is_finite())
    })
}

fn extract_numeric_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();

    for char in text.chars() {
        if char.is_ascii_digit() || char == ',' || char == '.' || char == '-' {
            current.push(char);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }

    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

fn normalize_numeric_token(token: &str, locale: NumberLocale) -> Option<String> {
    let comma_count = token.matches(',').count();
    let dot_count = token.matches('.').count();

    if comma_count > 0 && dot_count > 0 {
        let comma_index = token.rfind(',')?;
        let dot_index = token.rfind('.')?;
        if comma_index > dot_index {
            return Some(token.replace('.', "").replace(',', "."));
        }
        return Some(token.replace(',', ""));
    }

    if comma_count > 1 {
        return Some(token.replace(',', ""));
    }

    if comma_count > 0 {
        return Some(token.replace(',', "."));
    }

    if dot_count > 1 {
        return Some(token.replace('.', ""));
    }

    if dot_count == 1
        && locale == NumberLocale::PtBr
        && let Some((head, tail)) = token.split_once('.')
        && tail.len() == 3
        && head.trim_start_matches('-').chars().any(|char| char.is_ascii_digit())
    {
        return Some(format!("{head}{tail}"));
    }

    Some(token.to_string())
}

/// Serde helper for invoice amounts that arrive as numbers, pt-BR formatted
/// strings, or not at all. Unparseable and missing values become 0.
pub fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(|value| parse_f64_in(value, NumberLocale::PtBr))
        .unwrap_or(0.0))
}

pub fn lenient_opt_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(|value| parse_f64_in(value, NumberLocale::PtBr)))
}
