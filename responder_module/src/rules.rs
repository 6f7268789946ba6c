//! Sender rule model and the first-match rule evaluator.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use regex::RegexBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    Draft,
    Send,
}

impl ReplyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplyMode::Draft => "draft",
            ReplyMode::Send => "send",
        }
    }
}

impl FromStr for ReplyMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(ReplyMode::Draft),
            "send" => Ok(ReplyMode::Send),
            other => Err(format!("unknown reply mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    Exact,
    Domain,
    Wildcard,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Exact => "exact",
            PatternType::Domain => "domain",
            PatternType::Wildcard => "wildcard",
        }
    }
}

impl FromStr for PatternType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "exact" => Ok(PatternType::Exact),
            "domain" => Ok(PatternType::Domain),
            "wildcard" => Ok(PatternType::Wildcard),
            other => Err(format!("unknown pattern type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Reply,
    Ignore,
    Flag,
}

impl RuleAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleAction::Reply => "reply",
            RuleAction::Ignore => "ignore",
            RuleAction::Flag => "flag",
        }
    }
}

impl FromStr for RuleAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reply" => Ok(RuleAction::Reply),
            "ignore" => Ok(RuleAction::Ignore),
            "flag" => Ok(RuleAction::Flag),
            other => Err(format!("unknown rule action: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SenderRule {
    pub id: Uuid,
    pub user_id: Uuid,
    pub pattern: String,
    pub pattern_type: PatternType,
    pub action: RuleAction,
    pub reply_mode_override: Option<ReplyMode>,
    pub custom_instructions: Option<String>,
    pub priority: i32,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// First matching active rule wins. `rules` must already be ordered by
/// ascending priority (the stores order by priority, then created_at).
pub fn match_sender<'a>(rules: &'a [SenderRule], sender: &str) -> Option<&'a SenderRule> {
    let sender = sender.trim().to_ascii_lowercase();
    rules
        .iter()
        .filter(|rule| rule.active)
        .find(|rule| rule_matches(rule, &sender))
}

fn rule_matches(rule: &SenderRule, sender_lower: &str) -> bool {
    let pattern = rule.pattern.trim().to_ascii_lowercase();
    match rule.pattern_type {
        PatternType::Exact => sender_lower == pattern,
        PatternType::Domain => {
            let rule_domain = pattern
                .rsplit_once('@')
                .map(|(_, domain)| domain)
                .unwrap_or(pattern.as_str());
            sender_lower
                .rsplit_once('@')
                .map(|(_, domain)| domain == rule_domain)
                .unwrap_or(false)
        }
        PatternType::Wildcard => wildcard_matches(&pattern, sender_lower),
    }
}

fn wildcard_matches(pattern: &str, sender_lower: &str) -> bool {
    let regex_pattern = format!("^{}$", regex::escape(pattern).replace("\\*", ".*"));
    RegexBuilder::new(&regex_pattern)
        .case_insensitive(true)
        .build()
        .map(|re| re.is_match(sender_lower))
        .unwrap_or(false)
}
