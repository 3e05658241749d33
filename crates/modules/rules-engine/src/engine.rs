use std::{fs, path::Path, str::FromStr};

use glob::glob;
use kwatch_core::event::{Match, ProcessIdentity, Severity, SyscallEvent, SyscallKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ruleset::{Rule, Ruleset, compile_pattern};

const RULE_EXTENSION: &str = "yaml";

/// A rule as written in the YAML files.
///
/// ```yaml
/// - name: env-file-read
///   kinds: [openat, openat2]
///   path: "*.env"
///   comm: "python*"
///   severity: high
///   description: Read of a dotenv file
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserRule {
    pub name: String,
    #[serde(default)]
    pub kinds: Vec<String>,
    pub path: String,
    pub comm: Option<String>,
    pub severity: Option<String>,
    pub description: Option<String>,
}

#[derive(Error, Debug)]
pub enum RuleLoadError {
    #[error("Error listing rules: {0}")]
    RuleListing(#[from] glob::PatternError),
    #[error("Error reading rule: {name}")]
    RuleLoading {
        name: String,
        #[source]
        error: std::io::Error,
    },
    #[error("Error parsing rule file: {filename}")]
    RuleParsing {
        filename: String,
        #[source]
        error: serde_yaml::Error,
    },
    #[error("Invalid pattern '{pattern}' in rule {rule}")]
    InvalidPattern {
        rule: String,
        pattern: String,
        #[source]
        error: glob::PatternError,
    },
    #[error("Unknown syscall kind '{kind}' in rule {rule}")]
    UnknownKind { rule: String, kind: String },
    #[error("Unknown severity '{severity}' in rule {rule}")]
    UnknownSeverity { rule: String, severity: String },
    #[error("Duplicate rule id {0}")]
    DuplicateRule(String),
}

/// Matches decoded events against the loaded rules.
///
/// The engine is immutable once built: reloading builds a new engine which
/// replaces the old one as a whole.
#[derive(Debug, Default)]
pub struct RuleEngine {
    ruleset: Ruleset,
}

impl RuleEngine {
    /// Load every `*.yaml` file found under `rules_path`, recursively.
    pub fn from_dir(rules_path: &Path) -> Result<Self, RuleLoadError> {
        let user_rules = load_user_rules_from_dir(rules_path)?;
        if user_rules.is_empty() {
            log::warn!("No rules found in {}", rules_path.display());
        }
        Self::from_rules(user_rules)
    }

    pub fn from_rules(user_rules: Vec<UserRule>) -> Result<Self, RuleLoadError> {
        let rules = user_rules
            .into_iter()
            .map(parse_rule)
            .collect::<Result<Vec<Rule>, RuleLoadError>>()?;
        Ok(Self {
            ruleset: Ruleset::from_rules(rules)?,
        })
    }

    /// Parse the content of a single rule file.
    pub fn from_yaml(body: &str) -> Result<Self, RuleLoadError> {
        let user_rules =
            serde_yaml::from_str(body).map_err(|error| RuleLoadError::RuleParsing {
                filename: "<inline>".to_string(),
                error,
            })?;
        Self::from_rules(user_rules)
    }

    /// Every rule matching the event, in load order. No precedence is implied
    /// by the order.
    pub fn evaluate<'a>(
        &'a self,
        event: &'a SyscallEvent,
        identity: &'a ProcessIdentity,
    ) -> Vec<Match<'a>> {
        self.ruleset.matches(event, identity).collect()
    }

    pub fn rules(&self) -> &[Rule] {
        self.ruleset.rules()
    }

    pub fn len(&self) -> usize {
        self.ruleset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ruleset.is_empty()
    }
}

fn load_user_rules_from_dir(rules_path: &Path) -> Result<Vec<UserRule>, RuleLoadError> {
    let mut rule_files = Vec::new();

    let expr = format!("{}/**/*.{}", rules_path.display(), RULE_EXTENSION);
    let mut paths = glob(&expr)?
        .map(|entry| {
            entry.map_err(|err| RuleLoadError::RuleLoading {
                name: err.path().display().to_string(),
                error: err.into(),
            })
        })
        .collect::<Result<Vec<_>, RuleLoadError>>()?;
    // glob order is already alphabetical, keep it stable anyway
    paths.sort();
    for path in paths {
        rule_files.push(RuleFile::from(&path)?);
    }

    let rules = rule_files
        .into_iter()
        .filter(|rule_file| !rule_file.body.trim().is_empty())
        .map(|rule_file| {
            serde_yaml::from_str::<Vec<UserRule>>(&rule_file.body).map_err(|error| {
                RuleLoadError::RuleParsing {
                    filename: rule_file.path,
                    error,
                }
            })
        })
        .collect::<Result<Vec<Vec<UserRule>>, RuleLoadError>>()?;

    Ok(rules.into_iter().flatten().collect())
}

fn parse_rule(user_rule: UserRule) -> Result<Rule, RuleLoadError> {
    let compile = |pattern: &str| {
        compile_pattern(pattern).map_err(|error| RuleLoadError::InvalidPattern {
            rule: user_rule.name.clone(),
            pattern: pattern.to_string(),
            error,
        })
    };
    let path = compile(&user_rule.path)?;
    let comm = user_rule.comm.as_deref().map(compile).transpose()?;

    let mut kinds = Vec::with_capacity(user_rule.kinds.len());
    for kind in &user_rule.kinds {
        let kind = SyscallKind::from_str(kind.trim()).map_err(|_| RuleLoadError::UnknownKind {
            rule: user_rule.name.clone(),
            kind: kind.clone(),
        })?;
        if !kinds.contains(&kind) {
            kinds.push(kind);
        }
    }
    if kinds.is_empty() {
        log::warn!("Rule {} has no syscall kinds, it will never match", user_rule.name);
    }

    let severity = match &user_rule.severity {
        None => Severity::default(),
        Some(severity) => Severity::from_str(severity.trim()).map_err(|_| {
            RuleLoadError::UnknownSeverity {
                rule: user_rule.name.clone(),
                severity: severity.clone(),
            }
        })?,
    };

    Ok(Rule {
        id: user_rule.name,
        kinds,
        path,
        comm,
        severity,
        description: user_rule.description,
    })
}

#[derive(Debug, Clone)]
struct RuleFile {
    path: String,
    body: String,
}

impl RuleFile {
    pub fn from(path: &Path) -> Result<Self, RuleLoadError> {
        log::debug!("loading rule {}", path.display());
        let body = fs::read_to_string(path).map_err(|error| RuleLoadError::RuleLoading {
            name: path.display().to_string(),
            error,
        })?;
        let path = path.display().to_string();
        Ok(Self { path, body })
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use kwatch_core::Timestamp;

    use super::*;

    const ENV_RULES: &str = r#"
- name: env-read
  kinds: [openat, openat2]
  path: "*.env"
  severity: high
- name: tmp-exec
  kinds: [exec]
  path: "/tmp/*"
  severity: critical
  description: Binary executed from /tmp
"#;

    fn event(kind: SyscallKind, comm: &str, path: &str) -> SyscallEvent {
        SyscallEvent::new(1, kind, 1234, comm, path, Timestamp::from(1))
    }

    fn matched_ids(engine: &RuleEngine, event: &SyscallEvent) -> Vec<String> {
        let identity = ProcessIdentity::unknown(event.pid, Timestamp::from(0));
        engine
            .evaluate(event, &identity)
            .into_iter()
            .map(|m| m.rule_id.to_string())
            .collect()
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kwatch-rules-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn env_file_reads_match() {
        let engine = RuleEngine::from_yaml(ENV_RULES).unwrap();
        assert_eq!(engine.len(), 2);
        for path in ["/app/.env", "/a/b/.env", "/srv/prod.env"] {
            assert_eq!(
                matched_ids(&engine, &event(SyscallKind::OpenAt, "cat", path)),
                ["env-read"],
                "{path}"
            );
        }
        assert!(matched_ids(&engine, &event(SyscallKind::OpenAt, "cat", "/app/.envrc")).is_empty());
        assert!(matched_ids(&engine, &event(SyscallKind::OpenAt, "cat", "/app/.ENV")).is_empty());
        assert_eq!(
            matched_ids(&engine, &event(SyscallKind::OpenAt2, "cat", "/app/.env")),
            ["env-read"]
        );
    }

    #[test]
    fn kinds_are_disjoint() {
        let engine = RuleEngine::from_yaml(ENV_RULES).unwrap();
        assert!(matched_ids(&engine, &event(SyscallKind::Exec, "sh", "/app/.env")).is_empty());
        assert_eq!(
            matched_ids(&engine, &event(SyscallKind::Exec, "sh", "/tmp/payload")),
            ["tmp-exec"]
        );
        assert!(matched_ids(&engine, &event(SyscallKind::OpenAt, "sh", "/tmp/payload")).is_empty());
    }

    #[test]
    fn every_matching_rule_is_reported() {
        let engine = RuleEngine::from_yaml(
            r#"
- name: any-env
  kinds: [openat]
  path: "*.env"
- name: srv-files
  kinds: [openat]
  path: "/srv/*"
"#,
        )
        .unwrap();
        let event = event(SyscallKind::OpenAt, "cat", "/srv/.env");
        let identity = ProcessIdentity::unknown(1234, Timestamp::from(0));
        let matches = engine.evaluate(&event, &identity);
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].rule_id, "any-env");
        assert_eq!(matches[0].severity, Severity::Medium);
        assert_eq!(matches[1].rule_id, "srv-files");
    }

    #[test]
    fn comm_pattern_restricts_match() {
        let engine = RuleEngine::from_yaml(
            r#"
- name: python-env
  kinds: [openat]
  path: "*.env"
  comm: "python*"
"#,
        )
        .unwrap();
        assert_eq!(
            matched_ids(&engine, &event(SyscallKind::OpenAt, "python3", "/a/.env")),
            ["python-env"]
        );
        assert!(matched_ids(&engine, &event(SyscallKind::OpenAt, "cat", "/a/.env")).is_empty());
    }

    #[test]
    fn question_mark_and_classes() {
        let engine = RuleEngine::from_yaml(
            r#"
- name: shadow
  kinds: [openat]
  path: "/etc/[gs]shadow?"
"#,
        )
        .unwrap();
        assert_eq!(
            matched_ids(&engine, &event(SyscallKind::OpenAt, "cat", "/etc/gshadow-")),
            ["shadow"]
        );
        assert!(matched_ids(&engine, &event(SyscallKind::OpenAt, "cat", "/etc/shadow")).is_empty());
    }

    #[test]
    fn double_star_is_a_plain_wildcard() {
        let engine = RuleEngine::from_yaml(
            r#"
- name: nested
  kinds: [openat]
  path: "/app/**/x"
- name: dotenv
  kinds: [openat]
  path: "/app/**.env"
"#,
        )
        .unwrap();
        assert!(matched_ids(&engine, &event(SyscallKind::OpenAt, "cat", "/app/x")).is_empty());
        assert_eq!(
            matched_ids(&engine, &event(SyscallKind::OpenAt, "cat", "/app/a/x")),
            ["nested"]
        );
        assert_eq!(
            matched_ids(&engine, &event(SyscallKind::OpenAt, "cat", "/app/.env")),
            ["dotenv"]
        );
        assert_eq!(
            matched_ids(&engine, &event(SyscallKind::OpenAt, "cat", "/app/a/b/prod.env")),
            ["dotenv"]
        );
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let err = RuleEngine::from_yaml(
            r#"
- name: broken
  kinds: [openat]
  path: "["
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RuleLoadError::InvalidPattern { ref rule, .. } if rule == "broken"));
    }

    #[test]
    fn unknown_kind_and_severity_are_rejected() {
        let err = RuleEngine::from_yaml(
            r#"
- name: r
  kinds: [read]
  path: "*"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RuleLoadError::UnknownKind { ref kind, .. } if kind == "read"));

        let err = RuleEngine::from_yaml(
            r#"
- name: r
  kinds: [exec]
  path: "*"
  severity: urgent
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RuleLoadError::UnknownSeverity { .. }));
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let err = RuleEngine::from_yaml(
            r#"
- name: twice
  kinds: [exec]
  path: "*"
- name: twice
  kinds: [openat]
  path: "*"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RuleLoadError::DuplicateRule(ref id) if id == "twice"));
    }

    #[test]
    fn rule_without_kinds_never_matches() {
        let engine = RuleEngine::from_yaml("- name: idle\n  path: \"*\"\n").unwrap();
        assert_eq!(engine.len(), 1);
        assert!(matched_ids(&engine, &event(SyscallKind::Exec, "sh", "/bin/sh")).is_empty());
    }

    #[test]
    fn load_from_directory() {
        let dir = temp_dir("load");
        fs::create_dir_all(dir.join("nested")).unwrap();
        fs::write(dir.join("a.yaml"), ENV_RULES).unwrap();
        fs::write(
            dir.join("nested/b.yaml"),
            "- name: passwd\n  kinds: [openat]\n  path: /etc/passwd\n",
        )
        .unwrap();
        fs::write(dir.join("empty.yaml"), "").unwrap();
        fs::write(dir.join("ignored.txt"), "not yaml: [").unwrap();

        let engine = RuleEngine::from_dir(&dir).unwrap();
        let ids: Vec<_> = engine.rules().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["env-read", "tmp-exec", "passwd"]);

        fs::write(dir.join("z.yaml"), "- name: [unterminated").unwrap();
        assert!(matches!(
            RuleEngine::from_dir(&dir),
            Err(RuleLoadError::RuleParsing { .. })
        ));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn duplicate_across_files_is_rejected() {
        let dir = temp_dir("dup");
        fs::write(dir.join("a.yaml"), ENV_RULES).unwrap();
        fs::write(dir.join("b.yaml"), ENV_RULES).unwrap();
        assert!(matches!(
            RuleEngine::from_dir(&dir),
            Err(RuleLoadError::DuplicateRule(_))
        ));
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn shipped_rules_are_valid() {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../../rules");
        let engine = RuleEngine::from_dir(&dir).unwrap();
        assert!(!engine.is_empty());
        assert!(
            !matched_ids(&engine, &event(SyscallKind::OpenAt, "cat", "/srv/app/.env")).is_empty()
        );
    }
}
