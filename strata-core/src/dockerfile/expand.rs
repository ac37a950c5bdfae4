//! Build-time variable substitution.
//!
//! Implements the subset of shell parameter expansion Dockerfiles use:
//! `$VAR`, `${VAR}`, `${VAR:-default}` and `${VAR:+alternate}`, with `\$`
//! escaping a literal dollar. Undefined variables expand to the empty
//! string. Every successful variable read is recorded so cache
//! fingerprints can include exactly the `NAME=VALUE` pairs a command
//! consumed.

use std::collections::BTreeMap;

use crate::error::ParseError;

/// A resolved variable environment: later entries win, lookups record
/// which keys were actually read.
pub struct ExpansionEnv<'a> {
    scopes: Vec<&'a BTreeMap<String, String>>,
}

impl<'a> ExpansionEnv<'a> {
    pub fn new() -> Self {
        Self { scopes: Vec::new() }
    }

    /// Push a scope; keys in later scopes shadow earlier ones.
    pub fn push(mut self, scope: &'a BTreeMap<String, String>) -> Self {
        self.scopes.push(scope);
        self
    }

    fn lookup(&self, key: &str) -> Option<&str> {
        self.scopes.iter().rev().find_map(|scope| scope.get(key).map(String::as_str))
    }
}

impl<'a> Default for ExpansionEnv<'a> {
    fn default() -> Self {
        Self::new()
    }
}

/// Expand all variable references in `word`.
///
/// Reads are recorded into `used` (as the resolved `NAME=VALUE` pair; an
/// undefined variable records an empty value so that defining it later
/// changes the fingerprint).
pub fn expand(
    word: &str,
    env: &ExpansionEnv<'_>,
    used: &mut BTreeMap<String, String>,
) -> Result<String, ParseError> {
    expand_at_line(word, env, used, 0)
}

/// Expand, reporting errors against a source line.
pub fn expand_at_line(
    word: &str,
    env: &ExpansionEnv<'_>,
    used: &mut BTreeMap<String, String>,
    line: usize,
) -> Result<String, ParseError> {
    let mut out = String::with_capacity(word.len());
    let mut chars = word.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                // \$ produces a literal dollar; any other escape is kept
                // verbatim for the downstream consumer (shell, tar paths).
                match chars.peek() {
                    Some('$') => {
                        chars.next();
                        out.push('$');
                    }
                    _ => out.push('\\'),
                }
            }
            '$' => match chars.peek() {
                Some('{') => {
                    chars.next();
                    let mut body = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '}' {
                            closed = true;
                            break;
                        }
                        body.push(c);
                    }
                    if !closed {
                        return Err(ParseError::new(
                            line,
                            format!("unterminated variable reference ${{{body}"),
                        ));
                    }
                    out.push_str(&expand_braced(&body, env, used));
                }
                Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                    let mut name = String::new();
                    while let Some(c) = chars.peek() {
                        if c.is_ascii_alphanumeric() || *c == '_' {
                            name.push(*c);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    let value = env.lookup(&name).unwrap_or_default().to_string();
                    used.insert(name, value.clone());
                    out.push_str(&value);
                }
                // A bare `$` not followed by a name is literal.
                _ => out.push('$'),
            },
            _ => out.push(c),
        }
    }

    Ok(out)
}

fn expand_braced(
    body: &str,
    env: &ExpansionEnv<'_>,
    used: &mut BTreeMap<String, String>,
) -> String {
    // ${NAME}, ${NAME:-default}, ${NAME:+alternate}
    if let Some(idx) = body.find(":-").or_else(|| body.find(":+")) {
        let name = &body[..idx];
        let op = &body[idx..idx + 2];
        let word = &body[idx + 2..];
        let value = env.lookup(name);
        used.insert(name.to_string(), value.unwrap_or_default().to_string());
        return match (op, value) {
            (":-", Some(v)) if !v.is_empty() => v.to_string(),
            (":-", _) => word.to_string(),
            (":+", Some(v)) if !v.is_empty() => word.to_string(),
            (":+", _) => String::new(),
            _ => unreachable!(),
        };
    }
    let value = env.lookup(body).unwrap_or_default().to_string();
    used.insert(body.to_string(), value.clone());
    value
}

/// Parse an `KEY=VALUE` list into a map, later entries winning.
pub fn pairs_to_map<'a>(pairs: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for pair in pairs {
        if let Some((key, value)) = pair.split_once('=') {
            map.insert(key.to_string(), value.to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_simple_expansion() {
        let scope = env_of(&[("VERSION", "3.19")]);
        let env = ExpansionEnv::new().push(&scope);
        let mut used = BTreeMap::new();
        assert_eq!(expand("alpine:$VERSION", &env, &mut used).unwrap(), "alpine:3.19");
        assert_eq!(expand("alpine:${VERSION}", &env, &mut used).unwrap(), "alpine:3.19");
        assert_eq!(used.get("VERSION").map(String::as_str), Some("3.19"));
    }

    #[test]
    fn test_undefined_is_empty_and_tracked() {
        let env = ExpansionEnv::new();
        let mut used = BTreeMap::new();
        assert_eq!(expand("x${NOPE}y", &env, &mut used).unwrap(), "xy");
        assert_eq!(used.get("NOPE").map(String::as_str), Some(""));
    }

    #[test]
    fn test_default_and_alternate() {
        let scope = env_of(&[("SET", "v")]);
        let env = ExpansionEnv::new().push(&scope);
        let mut used = BTreeMap::new();
        assert_eq!(expand("${UNSET:-fallback}", &env, &mut used).unwrap(), "fallback");
        assert_eq!(expand("${SET:-fallback}", &env, &mut used).unwrap(), "v");
        assert_eq!(expand("${SET:+alt}", &env, &mut used).unwrap(), "alt");
        assert_eq!(expand("${UNSET:+alt}", &env, &mut used).unwrap(), "");
    }

    #[test]
    fn test_escaped_dollar() {
        let env = ExpansionEnv::new();
        let mut used = BTreeMap::new();
        assert_eq!(expand(r"cost: \$5", &env, &mut used).unwrap(), "cost: $5");
        assert!(used.is_empty());
    }

    #[test]
    fn test_scope_shadowing() {
        let outer = env_of(&[("A", "outer"), ("B", "only-outer")]);
        let inner = env_of(&[("A", "inner")]);
        let env = ExpansionEnv::new().push(&outer).push(&inner);
        let mut used = BTreeMap::new();
        assert_eq!(expand("$A/$B", &env, &mut used).unwrap(), "inner/only-outer");
    }

    #[test]
    fn test_unterminated_brace_errors() {
        let env = ExpansionEnv::new();
        let mut used = BTreeMap::new();
        assert!(expand("${OOPS", &env, &mut used).is_err());
    }

    #[test]
    fn test_bare_dollar_literal() {
        let env = ExpansionEnv::new();
        let mut used = BTreeMap::new();
        assert_eq!(expand("a$ b$", &env, &mut used).unwrap(), "a$ b$");
    }
}
