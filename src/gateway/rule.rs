//! Routing rules: how one inbound call is matched and what is done with it.

use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    #[error("rules file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("rules file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("rule {rule:?}: invalid method {method:?}")]
    InvalidMethod { rule: String, method: String },
    #[error("rule {rule:?}: path must start with '/': {path:?}")]
    InvalidPath { rule: String, path: String },
    #[error("rule {rule:?}: exactly one of proxy or mock is required")]
    Disposition { rule: String },
    #[error("rule {rule:?}: mock takes body or body_file, not both")]
    MockBody { rule: String },
    #[error("rule {rule:?}: proxy needs exactly one of upstream or unit")]
    ProxyTarget { rule: String },
    #[error("rule {rule:?}: unit {unit:?} has no address")]
    UnknownUnit { rule: String, unit: String },
    #[error("rule {rule:?}: invalid upstream {upstream:?}: {reason}")]
    InvalidUpstream {
        rule: String,
        upstream: String,
        reason: String,
    },
    #[error("rule {rule:?}: invalid mock status {status}")]
    InvalidStatus { rule: String, status: u16 },
    #[error("rule {rule:?}: invalid mock header {name:?}")]
    InvalidHeader { rule: String, name: String },
    #[error("rule {rule:?}: mock body file {path:?}: {source}")]
    BodyFile {
        rule: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodMatcher {
    Any,
    Exact(Method),
}

impl MethodMatcher {
    pub fn parse(rule: &str, raw: Option<&str>) -> Result<Self, RuleError> {
        match raw.map(str::trim) {
            None | Some("") | Some("*") => Ok(MethodMatcher::Any),
            Some(m) if m.eq_ignore_ascii_case("any") => Ok(MethodMatcher::Any),
            Some(m) => Method::from_bytes(m.to_ascii_uppercase().as_bytes())
                .map(MethodMatcher::Exact)
                .map_err(|_| RuleError::InvalidMethod {
                    rule: rule.to_string(),
                    method: m.to_string(),
                }),
        }
    }

    pub fn matches(&self, method: &Method) -> bool {
        match self {
            MethodMatcher::Any => true,
            MethodMatcher::Exact(m) => m == method,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MethodMatcher::Any => "*",
            MethodMatcher::Exact(m) => m.as_str(),
        }
    }
}

/// Literal path with `*` wildcards. A wildcard matches any run of characters,
/// including `/`.
#[derive(Debug, Clone)]
pub struct PathMatcher {
    pattern: String,
    regex: Regex,
    specificity: usize,
}

impl PathMatcher {
    pub fn compile(rule: &str, pattern: &str) -> Result<Self, RuleError> {
        if !pattern.starts_with('/') {
            return Err(RuleError::InvalidPath {
                rule: rule.to_string(),
                path: pattern.to_string(),
            });
        }

        let expr = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{}$", expr)).map_err(|_| RuleError::InvalidPath {
            rule: rule.to_string(),
            path: pattern.to_string(),
        })?;

        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            specificity: pattern.find('*').unwrap_or(pattern.len()),
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    /// Length of the literal prefix before the first wildcard.
    pub fn specificity(&self) -> usize {
        self.specificity
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    /// Body with `{{method}}`, `{{path}}` and `{{query}}` placeholders.
    pub body: String,
}

#[derive(Debug, Clone)]
pub enum Disposition {
    Proxy { upstream: String },
    Mock(MockResponse),
}

impl Disposition {
    pub fn kind(&self) -> &'static str {
        match self {
            Disposition::Proxy { .. } => "proxy",
            Disposition::Mock(_) => "mock",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub name: String,
    pub method: MethodMatcher,
    pub path: PathMatcher,
    pub priority: i64,
    /// Position in the rules file.
    pub order: usize,
    pub disposition: Disposition,
}

impl RoutingRule {
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        self.method.matches(method) && self.path.matches(path)
    }

    pub fn summary(&self) -> RuleSummary {
        RuleSummary {
            name: self.name.clone(),
            method: self.method.as_str().to_string(),
            path: self.path.pattern().to_string(),
            priority: self.priority,
            order: self.order,
            disposition: self.disposition.kind(),
            upstream: match &self.disposition {
                Disposition::Proxy { upstream } => Some(upstream.clone()),
                Disposition::Mock(_) => None,
            },
            status: match &self.disposition {
                Disposition::Proxy { .. } => None,
                Disposition::Mock(m) => Some(m.status.as_u16()),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleSummary {
    pub name: String,
    pub method: String,
    pub path: String,
    pub priority: i64,
    pub order: usize,
    pub disposition: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub rules: Vec<RuleDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleDescriptor {
    pub name: Option<String>,
    pub method: Option<String>,
    pub path: String,
    #[serde(default)]
    pub priority: i64,
    pub proxy: Option<ProxyDescriptor>,
    pub mock: Option<MockDescriptor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyDescriptor {
    pub upstream: Option<String>,
    /// Unit whose declared address is the upstream.
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MockDescriptor {
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub body_file: Option<PathBuf>,
}

/// Inputs a rule needs from outside the rules file.
#[derive(Debug, Clone, Default)]
pub struct RuleContext {
    /// Unit name -> base URL.
    pub addresses: BTreeMap<String, String>,
    /// Directory relative `body_file` paths resolve against.
    pub base_dir: Option<PathBuf>,
}

fn validate_upstream(rule: &str, upstream: &str) -> Result<String, RuleError> {
    let invalid = |reason: &str| RuleError::InvalidUpstream {
        rule: rule.to_string(),
        upstream: upstream.to_string(),
        reason: reason.to_string(),
    };
    let parsed = url::Url::parse(upstream).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if parsed.host_str().is_none() {
        return Err(invalid("missing host"));
    }
    if parsed.query().is_some() {
        return Err(invalid("query not allowed in upstream base"));
    }
    Ok(upstream.trim_end_matches('/').to_string())
}

fn read_body_file(rule: &str, path: &Path, base: Option<&Path>) -> Result<String, RuleError> {
    let full = match base {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    };
    std::fs::read_to_string(&full).map_err(|source| RuleError::BodyFile {
        rule: rule.to_string(),
        path: full,
        source,
    })
}

impl RuleDescriptor {
    pub fn compile(&self, order: usize, ctx: &RuleContext) -> Result<RoutingRule, RuleError> {
        let name = self
            .name
            .clone()
            .unwrap_or_else(|| format!("rule-{}", order));

        let method = MethodMatcher::parse(&name, self.method.as_deref())?;
        let path = PathMatcher::compile(&name, &self.path)?;

        let disposition = match (&self.proxy, &self.mock) {
            (Some(proxy), None) => {
                let upstream = match (&proxy.upstream, &proxy.unit) {
                    (Some(upstream), None) => upstream.clone(),
                    (None, Some(unit)) => ctx.addresses.get(unit).cloned().ok_or_else(|| {
                        RuleError::UnknownUnit {
                            rule: name.clone(),
                            unit: unit.clone(),
                        }
                    })?,
                    _ => return Err(RuleError::ProxyTarget { rule: name }),
                };
                Disposition::Proxy {
                    upstream: validate_upstream(&name, &upstream)?,
                }
            }
            (None, Some(mock)) => {
                let status_code = mock.status.unwrap_or(200);
                let status = StatusCode::from_u16(status_code).map_err(|_| RuleError::InvalidStatus {
                    rule: name.clone(),
                    status: status_code,
                })?;

                let mut headers = Vec::with_capacity(mock.headers.len());
                for (k, v) in &mock.headers {
                    let invalid = || RuleError::InvalidHeader {
                        rule: name.clone(),
                        name: k.clone(),
                    };
                    let hn = HeaderName::try_from(k.as_str()).map_err(|_| invalid())?;
                    let hv = HeaderValue::from_str(v).map_err(|_| invalid())?;
                    headers.push((hn, hv));
                }

                let body = match (&mock.body, &mock.body_file) {
                    (Some(_), Some(_)) => return Err(RuleError::MockBody { rule: name }),
                    (Some(body), None) => body.clone(),
                    (None, Some(file)) => read_body_file(&name, file, ctx.base_dir.as_deref())?,
                    (None, None) => String::new(),
                };

                Disposition::Mock(MockResponse {
                    status,
                    headers,
                    body,
                })
            }
            _ => return Err(RuleError::Disposition { rule: name }),
        };

        Ok(RoutingRule {
            name,
            method,
            path,
            priority: self.priority,
            order,
            disposition,
        })
    }
}
