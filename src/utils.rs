use crate::error::ServiceError;
use chrono::Utc;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

/// True for empty/whitespace values and for the configured not-present marker.
pub fn is_absent(value: &str, not_present_marker: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case(not_present_marker.trim())
}

/// Lower-cases, collapses inner whitespace and drops surrounding punctuation.
pub fn normalize_text(value: &str) -> String {
    let collapsed = value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_matches(|c: char| c.is_ascii_punctuation() || c.is_whitespace())
        .to_string()
}

const CURRENCY_SYMBOLS: &[char] = &['$', '€', '£', '¥', '₹'];

/// Parses a single amount such as `$1,234.50`, `(12.00)`, `USD 7` or `1e3`.
///
/// Currency symbols and codes, whitespace and `,` group separators are
/// dropped. Anything else left over (a second number, words) gives `None`.
pub fn parse_number(value: &str) -> Option<f64> {
    let mut text = value.trim();
    let negative_parens = text.starts_with('(') && text.ends_with(')');
    if negative_parens {
        text = text[1..text.len() - 1].trim();
    }

    let mut tokens = text.split_whitespace().filter(|t| !is_currency_token(t));
    let token = tokens.next()?;
    if tokens.next().is_some() {
        return None;
    }

    let token: String = token.chars().filter(|c| !CURRENCY_SYMBOLS.contains(c)).collect();
    let literal = strip_group_separators(&token)?;
    if !literal.chars().any(|c| c.is_ascii_digit())
        || !literal
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
    {
        return None;
    }

    let parsed: f64 = literal.parse().ok()?;
    if negative_parens {
        Some(-parsed.abs())
    } else {
        Some(parsed)
    }
}

fn is_currency_token(token: &str) -> bool {
    token.chars().all(|c| CURRENCY_SYMBOLS.contains(&c))
        || (token.len() == 3 && token.chars().all(|c| c.is_ascii_uppercase()))
}

/// Removes `,` from the integer part when it groups digits in threes.
fn strip_group_separators(token: &str) -> Option<String> {
    if !token.contains(',') {
        return Some(token.to_string());
    }
    let split = token.find(['.', 'e', 'E']).unwrap_or(token.len());
    let (integer, rest) = token.split_at(split);
    if rest.contains(',') {
        return None;
    }
    let (sign, digits) = match integer.strip_prefix(['-', '+']) {
        Some(unsigned) => (&integer[..1], unsigned),
        None => ("", integer),
    };

    let groups: Vec<&str> = digits.split(',').collect();
    let well_formed = groups.iter().enumerate().all(|(i, group)| {
        let len_ok = if i == 0 { (1..=3).contains(&group.len()) } else { group.len() == 3 };
        len_ok && group.chars().all(|c| c.is_ascii_digit())
    });
    well_formed.then(|| format!("{}{}{}", sign, groups.concat(), rest))
}

/// Strips whitespace and a surrounding Markdown code fence (```json ... ```).
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric()),
    };
    body.trim_end().trim_end_matches("```").trim()
}

/// Narrows model output down to the outermost JSON object when prose surrounds it.
pub fn clean_json_output(raw: &str) -> String {
    let unfenced = strip_code_fences(raw);
    if let Some(start) = unfenced.find('{') {
        if let Some(end) = unfenced.rfind('}') {
            if end > start {
                return unfenced[start..=end].to_string();
            }
        }
    }
    unfenced.to_string()
}

/// Ordered key-resolution rule for loosely shaped JSON replies.
///
/// Candidates are tried in order; the first key holding a non-empty string wins.
/// Matching is exact first, then case-insensitive on the object's keys.
#[derive(Debug, Clone, Copy)]
pub struct KeyRule {
    pub candidates: &'static [&'static str],
}

impl KeyRule {
    pub const fn new(candidates: &'static [&'static str]) -> Self {
        Self { candidates }
    }

    pub fn resolve<'a>(&self, object: &'a Value) -> Option<&'a str> {
        let map = object.as_object()?;
        for candidate in self.candidates {
            if let Some(text) = map.get(*candidate).and_then(non_empty_str) {
                return Some(text);
            }
        }
        for candidate in self.candidates {
            let found = map
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(candidate))
                .and_then(|(_, v)| non_empty_str(v));
            if found.is_some() {
                return found;
            }
        }
        None
    }
}

fn non_empty_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.trim().is_empty())
}

/// Awaits an external call, mapping an elapsed deadline to `ServiceError::Timeout`.
pub async fn call_with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout(timeout)),
    }
}

pub fn new_run_id() -> String {
    format!(
        "run-{}-{:06x}",
        Utc::now().format("%Y%m%d%H%M%S"),
        rand::random::<u32>() & 0x00ff_ffff
    )
}

pub fn truncate_for_prompt(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        value.to_string()
    } else {
        let head: String = value.chars().take(max_chars).collect();
        format!("{}…", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_absent_values() {
        assert!(is_absent("", "NOT_PRESENT"));
        assert!(is_absent("   ", "NOT_PRESENT"));
        assert!(is_absent(" not_present ", "NOT_PRESENT"));
        assert!(!is_absent("0", "NOT_PRESENT"));
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  ACME   Corp. "), "acme corp");
        assert_eq!(normalize_text("\"Net 30\""), "net 30");
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("$1,234.50"), Some(1234.5));
        assert_eq!(parse_number("(12.00)"), Some(-12.0));
        assert_eq!(parse_number("USD 7"), Some(7.0));
        assert_eq!(parse_number("n/a"), None);
        assert_eq!(parse_number("-$5"), Some(-5.0));
        assert_eq!(parse_number("1,234,567"), Some(1234567.0));
        assert_eq!(parse_number("€ 2.5e2"), Some(250.0));
    }

    #[test]
    fn test_parse_number_rejects_merged_tokens() {
        assert_eq!(parse_number("1e3"), Some(1000.0));
        assert_eq!(parse_number("5 of 10"), None);
        assert_eq!(parse_number("10 to 20"), None);
        assert_eq!(parse_number("1,23"), None);
        assert_eq!(parse_number("12 USD 5"), None);
        assert_eq!(parse_number("inf"), None);
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```  "), "{}");
        assert_eq!(strip_code_fences("  {\"b\":2} "), "{\"b\":2}");
        assert_eq!(
            clean_json_output("Here you go: {\"a\": 1} thanks"),
            "{\"a\": 1}"
        );
    }

    #[test]
    fn test_key_rule_order_and_case() {
        const RULE: KeyRule = KeyRule::new(&["new_prompt", "prompt"]);
        let value = json!({"Prompt": "second", "NEW_PROMPT": "first"});
        assert_eq!(RULE.resolve(&value), Some("first"));

        let value = json!({"new_prompt": "", "prompt": "fallback key"});
        assert_eq!(RULE.resolve(&value), Some("fallback key"));

        assert_eq!(RULE.resolve(&json!("not an object")), None);
    }

    #[tokio::test]
    async fn test_call_with_timeout() {
        let slow = call_with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, ServiceError>(1)
        })
        .await;
        assert!(matches!(slow, Err(ServiceError::Timeout(_))));

        let fast = call_with_timeout(Duration::from_secs(1), async { Ok::<_, ServiceError>(2) }).await;
        assert_eq!(fast, Ok(2));
    }
}
