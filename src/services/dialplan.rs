//! Dialplan: dialed-number matching and call actions
//!
//! Prefix rules match longest-prefix-first; rules may opt into anchored
//! regex matching instead. Ties fall back to rule priority. An extension
//! action with an empty target rings the (translated) dialed number
//! itself, which is how the default "4-digit extensions" rule works.

use regex::Regex;
use tracing::debug;

use crate::config::{DialAction, DialplanConfig, DialplanRule, MatchType, NumberTranslation};
use crate::{Error, Result};

/// A compiled rule
struct CompiledRule {
    rule: DialplanRule,
    regex: Option<Regex>,
}

/// The routing decision for a dialed number
#[derive(Debug, Clone, PartialEq)]
pub struct RouteDecision {
    pub rule_id: String,
    pub action: DialAction,
    /// The dialed number after translation
    pub number: String,
}

/// Immutable compiled dialplan, built once at startup
pub struct Dialplan {
    rules: Vec<CompiledRule>,
    pub ring_timeout: u32,
}

impl Dialplan {
    pub fn compile(config: &DialplanConfig) -> Result<Self> {
        let mut rules = Vec::with_capacity(config.rules.len());
        for rule in &config.rules {
            let regex = match rule.match_type {
                MatchType::Regex => {
                    let anchored = if rule.pattern.starts_with('^') {
                        rule.pattern.clone()
                    } else {
                        format!("^(?:{})$", rule.pattern)
                    };
                    Some(Regex::new(&anchored).map_err(|e| {
                        Error::parse(format!("Dialplan rule {}: {}", rule.id, e))
                    })?)
                }
                _ => None,
            };
            rules.push(CompiledRule {
                rule: rule.clone(),
                regex,
            });
        }
        Ok(Self {
            rules,
            ring_timeout: config.ring_timeout,
        })
    }

    /// Match a dialed number. Longest prefix wins; equal length falls back
    /// to priority (lower first).
    pub fn route(&self, dialed: &str) -> Option<RouteDecision> {
        let mut best: Option<(&CompiledRule, usize)> = None;

        for compiled in &self.rules {
            let match_len = match compiled.rule.match_type {
                MatchType::Exact => {
                    if compiled.rule.pattern == dialed {
                        Some(dialed.len())
                    } else {
                        None
                    }
                }
                MatchType::Prefix => {
                    if dialed.starts_with(&compiled.rule.pattern) {
                        Some(compiled.rule.pattern.len())
                    } else {
                        None
                    }
                }
                MatchType::Regex => compiled
                    .regex
                    .as_ref()
                    .filter(|r| r.is_match(dialed))
                    // Regex rules compete as full-length matches
                    .map(|_| dialed.len()),
            };

            if let Some(len) = match_len {
                let better = match best {
                    None => true,
                    Some((current, current_len)) => {
                        len > current_len
                            || (len == current_len
                                && compiled.rule.priority < current.rule.priority)
                    }
                };
                if better {
                    best = Some((compiled, len));
                }
            }
        }

        let (compiled, _) = best?;
        let number = apply_translation(dialed, compiled.rule.translation.as_ref());

        // Empty targets resolve to the translated number
        let action = match &compiled.rule.action {
            DialAction::Extension { target } if target.is_empty() => DialAction::Extension {
                target: number.clone(),
            },
            DialAction::Voicemail { mailbox } if mailbox.is_empty() => DialAction::Voicemail {
                mailbox: number.clone(),
            },
            other => other.clone(),
        };

        debug!("Dialplan: {} -> rule {} ({:?})", dialed, compiled.rule.id, action);

        Some(RouteDecision {
            rule_id: compiled.rule.id.clone(),
            action,
            number,
        })
    }
}

fn apply_translation(number: &str, translation: Option<&NumberTranslation>) -> String {
    let mut out = number.to_string();
    if let Some(translation) = translation {
        if let Some(strip) = &translation.prefix_strip {
            if let Some(stripped) = out.strip_prefix(strip.as_str()) {
                out = stripped.to_string();
            }
        }
        if let Some(add) = &translation.prefix_add {
            out = format!("{}{}", add, out);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DialplanConfig;

    fn rule(id: &str, pattern: &str, match_type: MatchType, action: DialAction, priority: u8) -> DialplanRule {
        DialplanRule {
            id: id.to_string(),
            pattern: pattern.to_string(),
            match_type,
            action,
            priority,
            translation: None,
        }
    }

    fn plan(rules: Vec<DialplanRule>) -> Dialplan {
        Dialplan::compile(&DialplanConfig {
            rules,
            ring_timeout: 25,
        })
        .unwrap()
    }

    #[test]
    fn test_longest_prefix_wins() {
        let plan = plan(vec![
            rule("short", "1", MatchType::Prefix, DialAction::Reject { status: 404 }, 10),
            rule(
                "long",
                "100",
                MatchType::Prefix,
                DialAction::Extension { target: String::new() },
                10,
            ),
        ]);

        let decision = plan.route("1001").unwrap();
        assert_eq!(decision.rule_id, "long");
        assert_eq!(
            decision.action,
            DialAction::Extension { target: "1001".to_string() }
        );
    }

    #[test]
    fn test_priority_breaks_ties() {
        let plan = plan(vec![
            rule("low", "8", MatchType::Prefix, DialAction::Reject { status: 404 }, 50),
            rule(
                "high",
                "8",
                MatchType::Prefix,
                DialAction::Group { targets: vec!["1003".to_string()] },
                5,
            ),
        ]);
        assert_eq!(plan.route("8001").unwrap().rule_id, "high");
    }

    #[test]
    fn test_regex_rule() {
        let plan = plan(vec![rule(
            "extensions",
            "^1[0-9]{3}$",
            MatchType::Regex,
            DialAction::Extension { target: String::new() },
            10,
        )]);

        assert!(plan.route("1001").is_some());
        assert!(plan.route("2001").is_none());
        assert!(plan.route("10011").is_none());
    }

    #[test]
    fn test_voicemail_star_prefix() {
        let mut star = rule(
            "vm",
            "*",
            MatchType::Prefix,
            DialAction::Voicemail { mailbox: String::new() },
            5,
        );
        star.translation = Some(NumberTranslation {
            prefix_strip: Some("*".to_string()),
            prefix_add: None,
        });
        let plan = plan(vec![star]);

        let decision = plan.route("*1001").unwrap();
        assert_eq!(decision.number, "1001");
        assert_eq!(
            decision.action,
            DialAction::Voicemail { mailbox: "1001".to_string() }
        );
    }

    #[test]
    fn test_translation_prefix_add() {
        let mut outbound = rule(
            "trunk",
            "9",
            MatchType::Prefix,
            DialAction::Hunt { targets: vec!["2001".to_string(), "2002".to_string()] },
            10,
        );
        outbound.translation = Some(NumberTranslation {
            prefix_strip: Some("9".to_string()),
            prefix_add: Some("+1".to_string()),
        });
        let plan = plan(vec![outbound]);

        let decision = plan.route("95551234").unwrap();
        assert_eq!(decision.number, "+15551234");
    }

    #[test]
    fn test_no_match() {
        let plan = plan(vec![rule(
            "only",
            "^1[0-9]{3}$",
            MatchType::Regex,
            DialAction::Extension { target: String::new() },
            10,
        )]);
        assert!(plan.route("99999").is_none());
    }

    #[test]
    fn test_exact_match() {
        let plan = plan(vec![rule(
            "attendant",
            "0",
            MatchType::Exact,
            DialAction::Ivr { menu: "main".to_string() },
            1,
        )]);
        assert!(plan.route("0").is_some());
        assert!(plan.route("00").is_none());
    }

    #[test]
    fn test_default_config_compiles() {
        let config = crate::config::PbxConfig::default_config();
        let plan = Dialplan::compile(&config.dialplan).unwrap();
        // 4-digit extension hits the regex rule
        assert!(plan.route("1001").is_some());
        // Star prefix goes to voicemail
        let decision = plan.route("*1001").unwrap();
        assert_eq!(
            decision.action,
            DialAction::Voicemail { mailbox: "1001".to_string() }
        );
    }
}
