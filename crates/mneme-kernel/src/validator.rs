//! [`SecurityValidator`] – input sanitisation rule engine.
//!
//! Every [`InputKind`] has its own ordered list of [`Rule`]s. An input is
//! checked against the list for its kind and the first violation is returned
//! as [`KernelError::Rejected`]; nothing else is evaluated after it.
//!
//! | Kind      | Built-in rules                                                   |
//! |-----------|------------------------------------------------------------------|
//! | `Command` | dangerous commands, shell metacharacters, max length             |
//! | `Path`    | path traversal, blocked extensions, max length                   |
//! | `Url`     | scheme allow-list, domain allow/block lists, max length          |
//! | `Sql`     | SQL injection, max length                                        |
//! | `Html`    | XSS, max length                                                  |
//! | `General` | a relaxed mix of the above that tolerates ordinary prose         |
//!
//! General text is what memory records and free-form action parameters
//! contain, so it must accept punctuation such as `:` and `,` that the
//! strict command rules reject.
//!
//! # Example
//!
//! ```
//! use mneme_kernel::validator::{SecurityConfig, SecurityValidator};
//! use mneme_types::{ActionSpec, InputKind};
//!
//! let validator = SecurityValidator::with_defaults(SecurityConfig::default()).unwrap();
//! assert!(validator.verify("Login form: email, password", InputKind::General).is_ok());
//! assert!(validator.verify("ls; rm -rf /", InputKind::Command).is_err());
//!
//! let click = ActionSpec::new("click").with_target("#submit");
//! assert!(validator.validate_action(&click).is_ok());
//! ```

use std::collections::HashMap;

use mneme_types::{ActionSpec, InputKind, InputValidator, Verdict};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::KernelError;

// ────────────────────────────────────────────────────────────────────────────
// Built-in pattern sets
// ────────────────────────────────────────────────────────────────────────────

const DANGEROUS_COMMANDS: &[&str] = &[
    r"(?i)\b(rm|del|format|mkfs|dd)\b.*-[rf]",
    r"(?i)\b(sudo|su|doas)\b",
    r"[:,;|&`$]",
    r"\$\(",
    r"(?i)\beval\s*\(",
    r"(?i)\bexec\s*\(",
    r"__import__",
    r"(?i)\bcompile\s*\(",
    r">\s*/dev/",
    r"/proc/",
    r"/sys/",
    r"/etc/(passwd|shadow|sudoers)",
    r"(?i)\bcat\b.*(/etc/|/var/log/)",
];

const SHELL_METACHARACTERS: &[char] = &['|', '&', ';', '$', '`', '\n', '<', '>'];

const SQL_INJECTION: &[&str] = &[
    r"(?i)\b(SELECT|INSERT|UPDATE|DELETE|DROP|CREATE|ALTER|EXEC|EXECUTE)\b",
    r"(--|#|/\*|\*/)",
    r"(?i)'\s*(OR|AND)\s*'?\d",
    r"(?i)UNION\s+SELECT",
    r"(;|\|\||&&)",
];

const XSS: &[&str] = &[
    r"(?is)<script[^>]*>.*?</script>",
    r"(?i)javascript:",
    r"(?i)\bon\w+\s*=",
    r"(?i)<iframe",
    r"(?i)<object",
    r"(?i)<embed",
    r"(?i)\beval\s*\(",
];

const PATH_TRAVERSAL: &[&str] = &[r"\.\.", r"~", r"/etc/", r"/var/", r"/root/", r"(?i)^[a-z]:\\"];

/// Patterns that are unambiguous attacks even inside ordinary prose.
const GENERAL: &[&str] = &[
    r"(?i)\b(rm|mkfs|dd)\b\s+-[a-z]*[rf]",
    r"(?i)\b(sudo|doas)\s+\S",
    r"\$\(",
    r"(?i)\b(eval|exec)\s*\(",
    r"__import__",
    r"/etc/(passwd|shadow|sudoers)",
    r"(?i)\bunion\s+select\b",
    r"(?i)'\s*(or|and)\s*'?\d",
    r"(?i);\s*(drop|truncate|delete)\s+(table|from)\b",
    r"(?i)<script[^>]*>",
    r"(?i)javascript:",
    r"(?i)<(iframe|object|embed)\b",
    r"(?i)<[^>]*\bon\w+\s*=",
];

const DANGEROUS_EXTENSIONS: &[&str] = &[
    "exe", "dll", "so", "dylib", "sh", "bat", "cmd", "ps1", "vbs", "js", "jar",
];

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single check an input must pass.
///
/// Implement this trait to add custom checks to a [`SecurityValidator`] via
/// [`SecurityValidator::add_rule`].
pub trait Rule: Send + Sync {
    /// Human-readable name used in rejection reasons.
    fn name(&self) -> &str;

    /// `Err(detail)` when `input` violates the rule.
    fn check(&self, input: &str) -> Result<(), String>;
}

/// Rejects inputs matching any of a list of regular expressions.
pub struct PatternRule {
    name: String,
    patterns: Vec<Regex>,
}

impl PatternRule {
    pub fn new<S: AsRef<str>>(
        name: impl Into<String>,
        patterns: &[S],
    ) -> Result<Self, KernelError> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()).map_err(|e| KernelError::InvalidPattern(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            name: name.into(),
            patterns,
        })
    }
}

impl Rule for PatternRule {
    fn name(&self) -> &str {
        &self.name
    }

    fn check(&self, input: &str) -> Result<(), String> {
        match self.patterns.iter().find(|p| p.is_match(input)) {
            Some(p) => Err(format!("matched pattern `{}`", p.as_str())),
            None => Ok(()),
        }
    }
}

/// Rejects shell metacharacters that chain or redirect commands.
pub struct ShellMetacharRule;

impl Rule for ShellMetacharRule {
    fn name(&self) -> &str {
        "shell_metacharacter"
    }

    fn check(&self, input: &str) -> Result<(), String> {
        match input.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
            Some(c) => Err(format!("shell metacharacter {c:?} not allowed")),
            None => Ok(()),
        }
    }
}

/// Rejects inputs longer than `max` characters.
pub struct MaxLengthRule {
    pub max: usize,
}

impl Rule for MaxLengthRule {
    fn name(&self) -> &str {
        "max_length"
    }

    fn check(&self, input: &str) -> Result<(), String> {
        let len = input.chars().count();
        if len > self.max {
            Err(format!("{len} characters exceeds limit {}", self.max))
        } else {
            Ok(())
        }
    }
}

/// Rejects file names with executable or script extensions.
pub struct ExtensionRule {
    pub blocked: Vec<String>,
}

impl Rule for ExtensionRule {
    fn name(&self) -> &str {
        "file_extension"
    }

    fn check(&self, input: &str) -> Result<(), String> {
        let file = input.rsplit(['/', '\\']).next().unwrap_or(input);
        let Some((stem, ext)) = file.rsplit_once('.') else {
            return Ok(());
        };
        let ext = ext.to_ascii_lowercase();
        if !stem.is_empty() && self.blocked.iter().any(|b| *b == ext) {
            Err(format!("file extension .{ext} not allowed"))
        } else {
            Ok(())
        }
    }
}

/// Scheme allow-list plus domain allow/block lists.
pub struct UrlRule {
    pub allowed_schemes: Vec<String>,
    /// When non-empty, only these hosts are accepted.
    pub allowed_domains: Vec<String>,
    pub blocked_domains: Vec<String>,
}

impl UrlRule {
    /// `(scheme, host)` of an absolute URL, both lower-cased.
    fn split(url: &str) -> Option<(String, String)> {
        let (scheme, rest) = url.trim().split_once(':')?;
        let rest = rest.strip_prefix("//").unwrap_or(rest);
        let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
        let host = authority.rsplit('@').next().unwrap_or(authority);
        let host = host.split(':').next().unwrap_or(host);
        Some((scheme.to_ascii_lowercase(), host.to_ascii_lowercase()))
    }
}

impl Rule for UrlRule {
    fn name(&self) -> &str {
        "url"
    }

    fn check(&self, input: &str) -> Result<(), String> {
        let Some((scheme, host)) = Self::split(input) else {
            return Err("not an absolute URL".to_string());
        };
        if !self.allowed_schemes.iter().any(|s| *s == scheme) {
            return Err(format!("URL scheme '{scheme}' not allowed"));
        }
        if self.blocked_domains.iter().any(|d| *d == host) {
            return Err(format!("domain '{host}' is blocked"));
        }
        if !self.allowed_domains.is_empty() && !self.allowed_domains.iter().any(|d| *d == host) {
            return Err(format!("domain '{host}' not in allowed list"));
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Configuration
// ────────────────────────────────────────────────────────────────────────────

fn default_max_length() -> usize {
    10_000
}

fn default_schemes() -> Vec<String> {
    vec!["http".into(), "https".into(), "file".into()]
}

fn lowercased(values: &[String]) -> Vec<String> {
    values.iter().map(|v| v.to_ascii_lowercase()).collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    #[serde(default = "default_schemes")]
    pub allowed_schemes: Vec<String>,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    /// Extra regular expressions rejected in every kind of input.
    #[serde(default)]
    pub deny_patterns: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_length: default_max_length(),
            allowed_schemes: default_schemes(),
            allowed_domains: Vec::new(),
            blocked_domains: Vec::new(),
            deny_patterns: Vec::new(),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SecurityValidator
// ────────────────────────────────────────────────────────────────────────────

/// Input kind implied by an action parameter name.
pub fn kind_for_param(key: &str) -> InputKind {
    match key {
        "command" | "cmd" | "exec" => InputKind::Command,
        "path" | "file" | "directory" => InputKind::Path,
        "url" | "link" | "href" => InputKind::Url,
        _ => InputKind::General,
    }
}

/// Rule engine checking inputs against the rules registered for their kind.
#[derive(Default)]
pub struct SecurityValidator {
    rules: HashMap<InputKind, Vec<Box<dyn Rule>>>,
    action_name: Option<Regex>,
}

impl SecurityValidator {
    /// Create an empty validator that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validator with the built-in rule set for every kind.
    pub fn with_defaults(config: SecurityConfig) -> Result<Self, KernelError> {
        let mut v = Self::new();
        let action_name = Regex::new(r"^[A-Za-z0-9_]+$")
            .map_err(|e| KernelError::InvalidPattern(e.to_string()))?;
        v.action_name = Some(action_name);

        v.add_rule(
            InputKind::Command,
            Box::new(PatternRule::new("dangerous_command", DANGEROUS_COMMANDS)?),
        );
        v.add_rule(InputKind::Command, Box::new(ShellMetacharRule));
        v.add_rule(InputKind::Path, Box::new(PatternRule::new("path_traversal", PATH_TRAVERSAL)?));
        v.add_rule(
            InputKind::Path,
            Box::new(ExtensionRule {
                blocked: DANGEROUS_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            }),
        );
        v.add_rule(
            InputKind::Url,
            Box::new(UrlRule {
                allowed_schemes: lowercased(&config.allowed_schemes),
                allowed_domains: lowercased(&config.allowed_domains),
                blocked_domains: lowercased(&config.blocked_domains),
            }),
        );
        v.add_rule(InputKind::Sql, Box::new(PatternRule::new("sql_injection", SQL_INJECTION)?));
        v.add_rule(InputKind::Html, Box::new(PatternRule::new("xss", XSS)?));
        v.add_rule(InputKind::General, Box::new(PatternRule::new("general", GENERAL)?));

        for kind in ALL_KINDS {
            if !config.deny_patterns.is_empty() {
                v.add_rule(kind, Box::new(PatternRule::new("deny_list", &config.deny_patterns)?));
            }
            v.add_rule(
                kind,
                Box::new(MaxLengthRule {
                    max: config.max_length,
                }),
            );
        }
        Ok(v)
    }

    /// Register a [`Rule`] for `kind`. Rules run in insertion order.
    pub fn add_rule(&mut self, kind: InputKind, rule: Box<dyn Rule>) {
        self.rules.entry(kind).or_default().push(rule);
    }

    /// Check `input` against every rule for `kind`. Empty input always
    /// passes.
    pub fn verify(&self, input: &str, kind: InputKind) -> Result<(), KernelError> {
        if input.is_empty() {
            return Ok(());
        }
        for rule in self.rules.get(&kind).into_iter().flatten() {
            rule.check(input).map_err(|detail| KernelError::Rejected {
                kind,
                reason: format!("{}: {detail}", rule.name()),
            })?;
        }
        Ok(())
    }

    /// Check an action's name, target and string parameters. Each parameter
    /// is checked as the kind its name implies (see [`kind_for_param`]).
    pub fn validate_action(&self, action: &ActionSpec) -> Result<(), KernelError> {
        if let Some(format) = &self.action_name {
            if !format.is_match(&action.action_type) {
                return Err(KernelError::Rejected {
                    kind: InputKind::General,
                    reason: format!("invalid action name format: {:?}", action.action_type),
                });
            }
        }
        if let Some(target) = &action.target {
            self.verify(target, InputKind::General)
                .map_err(|e| e.in_context("target"))?;
        }
        if let Value::Object(params) = &action.params {
            for (key, value) in params {
                if let Value::String(s) = value {
                    self.verify(s, kind_for_param(key))
                        .map_err(|e| e.in_context(&format!("parameter '{key}'")))?;
                }
            }
        }
        Ok(())
    }
}

const ALL_KINDS: [InputKind; 6] = [
    InputKind::General,
    InputKind::Command,
    InputKind::Path,
    InputKind::Url,
    InputKind::Sql,
    InputKind::Html,
];

impl InputValidator for SecurityValidator {
    fn validate(&self, input: &str, kind: InputKind) -> Verdict {
        match self.verify(input, kind) {
            Ok(()) => Verdict::allow(),
            Err(e) => Verdict::reject(e.to_string()),
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
