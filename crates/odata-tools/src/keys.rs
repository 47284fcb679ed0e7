//! Key literals for entity addresses: `Products(7)`, `Customers('ALFKI')`,
//! `Order_Details(OrderID=10248,ProductID=11)`.

use crate::catalog::KeyPart;
use crate::error::ExecutionError;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Render one key value as a literal.
///
/// With a known `Edm.*` type the type decides the form (`Edm.String` is always quoted, even for
/// `"42"`). Without one, numeric-looking values are bare, values parseable as a GUID are bare, and
/// everything else is a quoted string with `'` doubled.
///
/// # Errors
///
/// Returns [`ExecutionError::Validation`] when the value cannot be expressed as a literal of the
/// declared type (e.g. `"abc"` for `Edm.Int32`), or is not a scalar.
pub fn format_key_literal(
    name: &str,
    value: &Value,
    edm_type: Option<&str>,
) -> Result<String, ExecutionError> {
    let text = scalar_text(name, value)?;
    let invalid = |expected: &str| {
        ExecutionError::Validation(format!(
            "key '{name}' expects {expected}, got {value}"
        ))
    };

    match edm_type {
        Some("Edm.String") => Ok(quote(&text)),
        Some("Edm.Guid") => Uuid::parse_str(&text)
            .map(|_| text.clone())
            .map_err(|_| invalid("a GUID")),
        Some("Edm.Byte" | "Edm.SByte" | "Edm.Int16" | "Edm.Int32" | "Edm.Int64") => text
            .parse::<i64>()
            .map(|n| n.to_string())
            .map_err(|_| invalid("an integer")),
        Some("Edm.Decimal" | "Edm.Double" | "Edm.Single") => {
            if is_numeric(&text) {
                Ok(text)
            } else {
                Err(invalid("a number"))
            }
        }
        Some("Edm.Boolean") => match text.as_str() {
            "true" | "false" => Ok(text),
            _ => Err(invalid("a boolean")),
        },
        Some("Edm.Date" | "Edm.DateTimeOffset" | "Edm.TimeOfDay") => Ok(text),
        Some("Edm.Duration") => Ok(format!("duration{}", quote(&text))),
        Some("Edm.Binary") => Ok(format!("binary{}", quote(&text))),
        _ => Ok(untyped_literal(value, text)),
    }
}

fn untyped_literal(value: &Value, text: String) -> String {
    match value {
        Value::Number(_) | Value::Bool(_) => text,
        _ if is_numeric(&text) || Uuid::parse_str(&text).is_ok() => text,
        _ => quote(&text),
    }
}

/// Render the parenthesized key segment for `parts`, taking values from `args`.
///
/// A single key is written bare (`(7)`); a composite key is written as comma-joined
/// `Name=value` pairs in key declaration order. The result is percent-encoded for use in a path.
///
/// # Errors
///
/// Returns [`ExecutionError::Validation`] when a key value is missing, null or malformed.
pub fn format_key_segment(
    parts: &[KeyPart],
    args: &Map<String, Value>,
) -> Result<String, ExecutionError> {
    let mut literals = Vec::with_capacity(parts.len());
    for part in parts {
        let value = args
            .get(&part.parameter)
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                ExecutionError::Validation(format!(
                    "missing required key parameter '{}'",
                    part.parameter
                ))
            })?;
        let literal = format_key_literal(&part.parameter, value, Some(part.edm_type.as_str()))?;
        literals.push((part.property.as_str(), literal));
    }

    let inner = match literals.as_slice() {
        [(_, only)] => only.clone(),
        _ => literals
            .iter()
            .map(|(name, lit)| format!("{name}={lit}"))
            .collect::<Vec<_>>()
            .join(","),
    };
    Ok(format!("({})", encode_path_segment(&inner)))
}

/// Parse a key segment back into `(name, value)` pairs. The inverse of [`format_key_segment`].
///
/// Returns `None` if the segment is not parenthesized or a quoted literal is unterminated.
#[must_use]
pub fn parse_key_segment(segment: &str) -> Option<Vec<(Option<String>, Value)>> {
    let inner = segment.strip_prefix('(')?.strip_suffix(')')?;
    let decoded = percent_decode(inner)?;

    let mut out = Vec::new();
    for part in split_outside_quotes(&decoded, ',')? {
        let pieces = split_outside_quotes(&part, '=')?;
        match pieces.as_slice() {
            [literal] => out.push((None, parse_key_literal(literal)?)),
            [name, literal] => out.push((Some(name.clone()), parse_key_literal(literal)?)),
            _ => return None,
        }
    }
    Some(out)
}

/// Parse a single (already percent-decoded) literal.
#[must_use]
pub fn parse_key_literal(literal: &str) -> Option<Value> {
    if let Some(rest) = literal.strip_prefix('\'') {
        let inner = rest.strip_suffix('\'')?;
        return Some(Value::String(inner.replace("''", "'")));
    }
    if let Ok(n) = literal.parse::<i64>() {
        return Some(Value::from(n));
    }
    if is_numeric(literal)
        && let Some(n) = literal
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
    {
        return Some(Value::Number(n));
    }
    match literal {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        _ => Some(Value::String(literal.to_string())),
    }
}

fn scalar_text(name: &str, value: &Value) -> Result<String, ExecutionError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Null => Err(ExecutionError::Validation(format!(
            "key '{name}' must not be null"
        ))),
        Value::Array(_) | Value::Object(_) => Err(ExecutionError::Validation(format!(
            "key '{name}' must be a scalar value"
        ))),
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

fn is_numeric(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        && s.parse::<f64>().is_ok_and(f64::is_finite)
}

/// Split on `sep` wherever it is not inside a `'...'` literal.
fn split_outside_quotes(s: &str, sep: char) -> Option<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    for c in s.chars() {
        if c == '\'' {
            in_quote = !in_quote;
        }
        if c == sep && !in_quote {
            parts.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    if in_quote {
        return None;
    }
    parts.push(current);
    Some(parts)
}

/// Percent-encode everything outside RFC 3986 `pchar`.
#[must_use]
pub fn encode_path_segment(s: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if is_pchar(b) {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0F) as usize] as char);
        }
    }
    out
}

fn is_pchar(b: u8) -> bool {
    matches!(
        b,
        b'A'..=b'Z'
            | b'a'..=b'z'
            | b'0'..=b'9'
            | b'-'
            | b'.'
            | b'_'
            | b'~'
            | b'!'
            | b'$'
            | b'&'
            | b'\''
            | b'('
            | b')'
            | b'*'
            | b'+'
            | b','
            | b';'
            | b'='
            | b':'
            | b'@'
    )
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn part(name: &str, edm_type: &str) -> KeyPart {
        KeyPart {
            property: name.to_string(),
            parameter: name.to_string(),
            edm_type: edm_type.to_string(),
        }
    }

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn untyped_values_follow_shape_heuristic() {
        assert_eq!(format_key_literal("id", &json!(7), None).unwrap(), "7");
        assert_eq!(format_key_literal("id", &json!("42"), None).unwrap(), "42");
        assert_eq!(
            format_key_literal("id", &json!("6f9619ff-8b86-d011-b42d-00c04fc964ff"), None)
                .unwrap(),
            "6f9619ff-8b86-d011-b42d-00c04fc964ff"
        );
        assert_eq!(
            format_key_literal("id", &json!("O'Brien"), None).unwrap(),
            "'O''Brien'"
        );
    }

    #[test]
    fn typed_strings_are_always_quoted() {
        assert_eq!(
            format_key_literal("code", &json!("42"), Some("Edm.String")).unwrap(),
            "'42'"
        );
        assert_eq!(
            format_key_literal("code", &json!(42), Some("Edm.String")).unwrap(),
            "'42'"
        );
    }

    #[test]
    fn typed_mismatches_are_validation_errors() {
        let err = format_key_literal("id", &json!("abc"), Some("Edm.Int32")).unwrap_err();
        assert_eq!(err.kind(), "validation");
        let err = format_key_literal("id", &json!("nope"), Some("Edm.Guid")).unwrap_err();
        assert_eq!(err.kind(), "validation");
        let err = format_key_literal("id", &json!({"a": 1}), None).unwrap_err();
        assert_eq!(err.kind(), "validation");
        assert_eq!(
            format_key_literal("id", &json!("7"), Some("Edm.Int32")).unwrap(),
            "7"
        );
    }

    #[test]
    fn single_and_composite_segments() {
        let single = [part("ProductID", "Edm.Int32")];
        assert_eq!(
            format_key_segment(&single, &args(json!({"ProductID": 7}))).unwrap(),
            "(7)"
        );

        let composite = [part("OrderID", "Edm.Int32"), part("ProductID", "Edm.Int32")];
        let seg = format_key_segment(
            &composite,
            &args(json!({"ProductID": 11, "OrderID": 10248})),
        )
        .unwrap();
        assert_eq!(seg, "(OrderID=10248,ProductID=11)");
        assert_eq!(seg.matches('=').count(), 2);
    }

    #[test]
    fn missing_or_null_key_is_rejected() {
        let single = [part("ProductID", "Edm.Int32")];
        let err = format_key_segment(&single, &args(json!({"ProductID": null}))).unwrap_err();
        assert!(err.to_string().contains("ProductID"));
        assert!(format_key_segment(&single, &Map::new()).is_err());
    }

    #[test]
    fn unsafe_characters_are_percent_encoded() {
        let single = [part("Name", "Edm.String")];
        let seg = format_key_segment(&single, &args(json!({"Name": "a b/c?"}))).unwrap();
        assert_eq!(seg, "('a%20b%2Fc%3F')");
    }

    #[test]
    fn formatting_round_trips_through_parsing() {
        let cases = [
            (json!(7), "Edm.Int32"),
            (json!(-12), "Edm.Int64"),
            (json!("6f9619ff-8b86-d011-b42d-00c04fc964ff"), "Edm.Guid"),
            (json!("it's a/b 100%"), "Edm.String"),
            (json!("ALFKI"), "Edm.String"),
        ];
        for (value, edm_type) in cases {
            let parts = [part("K", edm_type)];
            let seg = format_key_segment(&parts, &args(json!({"K": value.clone()}))).unwrap();
            let parsed = parse_key_segment(&seg).unwrap();
            assert_eq!(parsed, vec![(None, value)]);
        }

        let composite = [part("A", "Edm.String"), part("B", "Edm.Int32")];
        let seg =
            format_key_segment(&composite, &args(json!({"A": "x=1,y", "B": 2}))).unwrap();
        assert_eq!(
            parse_key_segment(&seg).unwrap(),
            vec![
                (Some("A".to_string()), json!("x=1,y")),
                (Some("B".to_string()), json!(2)),
            ]
        );
    }

    #[test]
    fn unterminated_literal_does_not_parse() {
        assert!(parse_key_segment("('abc)").is_none());
        assert!(parse_key_segment("abc").is_none());
    }
}
