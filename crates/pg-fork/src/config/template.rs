//! Name templating for target databases and job ids.
//!
//! Patterns contain `{{name}}` placeholders (a leading dot, `{{ .name }}`, is
//! accepted too). Rendering is pure string substitution from a variable map;
//! nothing is evaluated.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

use super::validation::MAX_IDENTIFIER_BYTES;

/// Errors produced while rendering a name pattern.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unterminated placeholder starting at byte {0}")]
    Unterminated(usize),

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("empty placeholder at byte {0}")]
    EmptyName(usize),

    #[error("'{0}' is not a valid database name")]
    InvalidIdentifier(String),
}

/// Substitute every placeholder in `pattern`.
pub fn render(
    pattern: &str,
    vars: &BTreeMap<String, String>,
) -> std::result::Result<String, TemplateError> {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let end = after_open
            .find("}}")
            .ok_or(TemplateError::Unterminated(offset + start))?;

        let name = after_open[..end].trim();
        let name = name.strip_prefix('.').unwrap_or(name).trim();
        if name.is_empty() {
            return Err(TemplateError::EmptyName(offset + start));
        }

        let value = vars
            .get(name)
            .ok_or_else(|| TemplateError::UnknownVariable(name.to_string()))?;
        out.push_str(value);

        let consumed = start + 2 + end + 2;
        offset += consumed;
        rest = &rest[consumed..];
    }
    out.push_str(rest);

    Ok(out)
}

/// Render `pattern` and normalise the result into a database name.
///
/// The name is lower-cased and every character outside `[a-z0-9_]` becomes
/// `_`.
pub fn resolve_name(
    pattern: &str,
    vars: &BTreeMap<String, String>,
) -> std::result::Result<String, TemplateError> {
    let rendered = render(pattern, vars)?;
    let name: String = rendered
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    if name.is_empty() || name.len() > MAX_IDENTIFIER_BYTES {
        return Err(TemplateError::InvalidIdentifier(rendered));
    }
    Ok(name)
}

/// Variables every pattern can use.
pub fn builtin_vars(source_database: &str, now: DateTime<Utc>) -> BTreeMap<String, String> {
    let mut vars = BTreeMap::new();
    vars.insert("source".to_string(), source_database.to_string());
    vars.insert("date".to_string(), now.format("%Y%m%d").to_string());
    vars.insert("timestamp".to_string(), now.format("%Y%m%d%H%M%S").to_string());
    vars
}

/// Parse a `KEY=VALUE` pair.
pub fn parse_var(pair: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = pair
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", pair))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", pair));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn vars() -> BTreeMap<String, String> {
        let mut v = BTreeMap::new();
        v.insert("pr".to_string(), "42".to_string());
        v.insert("branch".to_string(), "Feature/Login-Page".to_string());
        v
    }

    #[test]
    fn test_render_plain_and_dotted() {
        assert_eq!(render("app_pr_{{pr}}", &vars()).unwrap(), "app_pr_42");
        assert_eq!(render("app_pr_{{ .pr }}", &vars()).unwrap(), "app_pr_42");
        assert_eq!(render("no_placeholders", &vars()).unwrap(), "no_placeholders");
    }

    #[test]
    fn test_render_errors() {
        assert_eq!(
            render("app_{{pr", &vars()),
            Err(TemplateError::Unterminated(4))
        );
        assert_eq!(
            render("app_{{missing}}", &vars()),
            Err(TemplateError::UnknownVariable("missing".into()))
        );
        assert_eq!(render("app_{{ }}", &vars()), Err(TemplateError::EmptyName(4)));
    }

    #[test]
    fn test_resolve_name_normalises() {
        assert_eq!(
            resolve_name("app_{{branch}}", &vars()).unwrap(),
            "app_feature_login_page"
        );
    }

    #[test]
    fn test_resolve_name_rejects_too_long() {
        let mut v = vars();
        v.insert("long".into(), "x".repeat(70));
        assert!(matches!(
            resolve_name("{{long}}", &v),
            Err(TemplateError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_builtin_vars() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let vars = builtin_vars("app", now);
        assert_eq!(
            resolve_name("{{source}}_{{date}}", &vars).unwrap(),
            "app_20240309"
        );
        assert_eq!(vars["timestamp"], "20240309140507");
    }

    #[test]
    fn test_parse_var() {
        assert_eq!(
            parse_var("pr=42").unwrap(),
            ("pr".to_string(), "42".to_string())
        );
        assert_eq!(
            parse_var("url=a=b").unwrap(),
            ("url".to_string(), "a=b".to_string())
        );
        assert!(parse_var("novalue").is_err());
        assert!(parse_var("=x").is_err());
    }
}
