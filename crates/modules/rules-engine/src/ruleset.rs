use std::collections::HashSet;

use glob::{MatchOptions, Pattern, PatternError};
use kwatch_core::event::{Match, ProcessIdentity, Severity, SyscallEvent, SyscallKind};

use crate::engine::RuleLoadError;

/// `*` and `?` also match `/`, and leading dots need no literal match, so
/// `*.env` matches `/app/.env`. Patterns are anchored on the whole string.
pub(crate) const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Compile a rule pattern. Runs of `*` fold into a single `*`, so `**` is a
/// plain wildcard and never a recursive directory match.
pub(crate) fn compile_pattern(pattern: &str) -> Result<Pattern, PatternError> {
    let mut folded = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        if c == '*' && folded.ends_with('*') {
            continue;
        }
        folded.push(c);
    }
    Pattern::new(&folded)
}

/// A validated rule, with its patterns compiled.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    pub kinds: Vec<SyscallKind>,
    pub path: Pattern,
    pub comm: Option<Pattern>,
    pub severity: Severity,
    pub description: Option<String>,
}

impl Rule {
    pub fn is_match(&self, event: &SyscallEvent) -> bool {
        self.kinds.contains(&event.kind)
            && self.path.matches_with(&event.path, MATCH_OPTIONS)
            && self
                .comm
                .as_ref()
                .is_none_or(|comm| comm.matches_with(&event.comm, MATCH_OPTIONS))
    }
}

/// Rules in load order. Rule ids are unique.
#[derive(Debug, Default)]
pub struct Ruleset {
    rules: Vec<Rule>,
}

impl Ruleset {
    pub fn from_rules(rules: Vec<Rule>) -> Result<Self, RuleLoadError> {
        let mut ids = HashSet::new();
        for rule in &rules {
            if !ids.insert(rule.id.as_str()) {
                return Err(RuleLoadError::DuplicateRule(rule.id.clone()));
            }
        }
        log::debug!("Loaded {} rules", rules.len());
        Ok(Self { rules })
    }

    /// Every rule matching the event, each producing its own [`Match`].
    pub fn matches<'a>(
        &'a self,
        event: &'a SyscallEvent,
        identity: &'a ProcessIdentity,
    ) -> impl Iterator<Item = Match<'a>> {
        self.rules
            .iter()
            .filter(|rule| rule.is_match(event))
            .map(move |rule| Match {
                rule_id: &rule.id,
                severity: rule.severity,
                event,
                identity,
            })
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}
