//! Rule application
//!
//! A pure function over a request or response view. Rules run in list
//! order and each sees the output of the one before it.

use regex::NoExpand;

use super::{Direction, MatchMode, Rule, RuleTarget};
use crate::http::{Body, Headers};

/// The rewritable parts of a request or response
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Absent for responses
    pub url: Option<String>,
    pub headers: Headers,
    pub body: Body,
}

/// Apply every enabled rule for `direction` to `record`
pub fn apply_rules(mut record: Record, rules: &[Rule], direction: Direction) -> Record {
    for rule in rules.iter().filter(|r| r.applies_to(direction)) {
        // Named header rules overwrite rather than match
        if rule.target == RuleTarget::Headers {
            if let Some(name) = &rule.header_name {
                set_header(&mut record.headers, name, &rule.replacement);
                continue;
            }
        }

        if rule.pattern.is_empty() {
            continue;
        }

        let matcher = match rule.matcher() {
            Ok(re) => re,
            Err(e) => {
                tracing::warn!("Skipping rule: {}", e);
                continue;
            }
        };
        let replace = |text: &str| -> String {
            match rule.mode {
                MatchMode::Literal => matcher.replace_all(text, NoExpand(&rule.replacement)).into_owned(),
                MatchMode::Regex => matcher.replace_all(text, rule.replacement.as_str()).into_owned(),
            }
        };

        match rule.target {
            RuleTarget::Url => {
                if let Some(url) = record.url.as_mut() {
                    *url = replace(url);
                }
            }
            RuleTarget::Body => {
                // Binary bodies are never rewritten
                if let Body::Text { text } = &mut record.body {
                    *text = replace(text);
                }
            }
            RuleTarget::Headers => {
                for value in record.headers.values_mut() {
                    *value = replace(value);
                }
            }
        }
    }
    record
}

fn set_header(headers: &mut Headers, name: &str, value: &str) {
    if headers.contains(name) {
        headers.set(name, value);
    } else if !value.is_empty() {
        headers.append(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::RuleScope;

    fn record(url: &str, body: &str) -> Record {
        let mut headers = Headers::new();
        headers.append("Host", "example.com");
        headers.append("User-Agent", "Mozilla/5.0");
        headers.append("Cookie", "session=abc; theme=dark");
        Record {
            url: Some(url.to_string()),
            headers,
            body: Body::text(body),
        }
    }

    #[test]
    fn test_literal_case_insensitive_replaces_all() {
        let rules = vec![Rule::literal(RuleTarget::Body, "admin", "guest")];
        let out = apply_rules(record("http://x/", "Admin and ADMIN and admin"), &rules, Direction::Request);
        assert_eq!(out.body.as_text(), Some("guest and guest and guest"));
    }

    #[test]
    fn test_literal_case_sensitive() {
        let rule = Rule {
            case_sensitive: true,
            ..Rule::literal(RuleTarget::Body, "admin", "guest")
        };
        let out = apply_rules(record("http://x/", "Admin admin"), &[rule], Direction::Request);
        assert_eq!(out.body.as_text(), Some("Admin guest"));
    }

    #[test]
    fn test_literal_replacement_is_verbatim() {
        let rules = vec![Rule::literal(RuleTarget::Body, "price", "$1.00")];
        let out = apply_rules(record("http://x/", "price"), &rules, Direction::Request);
        assert_eq!(out.body.as_text(), Some("$1.00"));
    }

    #[test]
    fn test_regex_backreferences_in_url() {
        let rules = vec![Rule::regex(RuleTarget::Url, r"id=(\d+)", "id=${1}0")];
        let out = apply_rules(record("http://x/item?id=7&b=id=8", ""), &rules, Direction::Request);
        assert_eq!(out.url.as_deref(), Some("http://x/item?id=70&b=id=80"));
    }

    #[test]
    fn test_named_header_overwrites_or_adds() {
        let rules = vec![
            Rule::set_header("user-agent", "pincer"),
            Rule::set_header("X-Forwarded-For", "127.0.0.1"),
            Rule::set_header("X-Never", ""),
        ];
        let out = apply_rules(record("http://x/", ""), &rules, Direction::Request);
        assert_eq!(out.headers.get("User-Agent"), Some("pincer"));
        assert_eq!(out.headers.get("x-forwarded-for"), Some("127.0.0.1"));
        assert!(!out.headers.contains("x-never"));
    }

    #[test]
    fn test_unnamed_header_rule_applies_to_every_value() {
        let rules = vec![Rule::literal(RuleTarget::Headers, "dark", "light")];
        let out = apply_rules(record("http://x/", ""), &rules, Direction::Request);
        assert_eq!(out.headers.get("cookie"), Some("session=abc; theme=light"));
    }

    #[test]
    fn test_rules_chain_in_order() {
        let rules = vec![
            Rule::literal(RuleTarget::Body, "a", "b"),
            Rule::literal(RuleTarget::Body, "b", "c"),
        ];
        let out = apply_rules(record("http://x/", "a"), &rules, Direction::Request);
        assert_eq!(out.body.as_text(), Some("c"));
    }

    #[test]
    fn test_invalid_regex_is_skipped() {
        let rules = vec![
            Rule::regex(RuleTarget::Body, "([", "x"),
            Rule::literal(RuleTarget::Body, "keep", "kept"),
        ];
        let out = apply_rules(record("http://x/", "keep"), &rules, Direction::Request);
        assert_eq!(out.body.as_text(), Some("kept"));
    }

    #[test]
    fn test_direction_and_binary_bodies() {
        let rules = vec![Rule::literal(RuleTarget::Body, "x", "y").with_scope(RuleScope::Response)];
        let out = apply_rules(record("http://x/", "x"), &rules, Direction::Request);
        assert_eq!(out.body.as_text(), Some("x"));

        let mut binary = record("http://x/", "");
        binary.body = Body::binary(vec![b'x', 0]);
        let out = apply_rules(binary.clone(), &rules, Direction::Response);
        assert_eq!(out.body, binary.body);
    }

    #[test]
    fn test_idempotent_without_overlap() {
        let rules = vec![
            Rule::literal(RuleTarget::Body, "password", "********"),
            Rule::regex(RuleTarget::Url, r"debug=\w+", "debug=off"),
            Rule::set_header("User-Agent", "pincer"),
        ];
        let input = record("http://x/?debug=on", "password=password");
        let once = apply_rules(input, &rules, Direction::Request);
        let twice = apply_rules(once.clone(), &rules, Direction::Request);
        assert_eq!(once, twice);
        assert_eq!(once.body.as_text(), Some("********=********"));
    }
}
