//! Label selectors
//!
//! Parses the kubectl selector syntax (`app=web,tier!=db,env in (a,b),!canary`)
//! and converts the selectors carried by owner resources, so that pods can
//! be matched against both in one place.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector as ApiLabelSelector;
use regex::Regex;

use crate::error::Error;

static LABEL_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$",
    )
    .expect("label key pattern is valid")
});

static LABEL_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?)?$").expect("label value pattern is valid")
});

static SET_REQUIREMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+)\s+(in|notin)\s*\((.*)\)$").expect("set requirement pattern is valid")
});

const MAX_NAME_LEN: usize = 63;

/// Operator of a single requirement
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operator {
    Equals(String),
    NotEquals(String),
    In(BTreeSet<String>),
    NotIn(BTreeSet<String>),
    Exists,
    DoesNotExist,
}

/// One `key <op> values` term of a selector
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
}

impl Requirement {
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match &self.operator {
            Operator::Equals(v) => value == Some(v),
            Operator::NotEquals(v) => value != Some(v),
            Operator::In(set) => value.is_some_and(|v| set.contains(v)),
            Operator::NotIn(set) => value.is_none_or(|v| !set.contains(v)),
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |set: &BTreeSet<String>| set.iter().cloned().collect::<Vec<_>>().join(",");
        match &self.operator {
            Operator::Equals(v) => write!(f, "{}={}", self.key, v),
            Operator::NotEquals(v) => write!(f, "{}!={}", self.key, v),
            Operator::In(set) => write!(f, "{} in ({})", self.key, join(set)),
            Operator::NotIn(set) => write!(f, "{} notin ({})", self.key, join(set)),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// A conjunction of label requirements
///
/// An empty selector matches every label set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: Vec<Requirement>,
}

impl LabelSelector {
    pub fn new(requirements: Vec<Requirement>) -> Self {
        Self { requirements }
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for LabelSelector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut requirements = Vec::new();
        for term in split_terms(s) {
            let term = term.trim();
            if term.is_empty() {
                return Err(Error::selector(s, "empty requirement"));
            }
            requirements.push(parse_requirement(s, term)?);
        }
        Ok(Self { requirements })
    }
}

impl From<&BTreeMap<String, String>> for LabelSelector {
    /// Equality-only selector, as carried by services and replication controllers
    fn from(map: &BTreeMap<String, String>) -> Self {
        Self {
            requirements: map
                .iter()
                .map(|(k, v)| Requirement {
                    key: k.clone(),
                    operator: Operator::Equals(v.clone()),
                })
                .collect(),
        }
    }
}

impl TryFrom<&ApiLabelSelector> for LabelSelector {
    type Error = Error;

    fn try_from(selector: &ApiLabelSelector) -> Result<Self, Self::Error> {
        let mut out = selector
            .match_labels
            .as_ref()
            .map(LabelSelector::from)
            .unwrap_or_default();

        for expr in selector.match_expressions.iter().flatten() {
            let values: BTreeSet<String> = expr.values.iter().flatten().cloned().collect();
            let operator = match expr.operator.as_str() {
                "In" => Operator::In(values),
                "NotIn" => Operator::NotIn(values),
                "Exists" => Operator::Exists,
                "DoesNotExist" => Operator::DoesNotExist,
                other => {
                    return Err(Error::selector(
                        &expr.key,
                        format!("unsupported operator '{other}'"),
                    ));
                }
            };
            out.requirements.push(Requirement {
                key: expr.key.clone(),
                operator,
            });
        }

        Ok(out)
    }
}

/// Split on commas that are not inside a parenthesised value set
fn split_terms(s: &str) -> Vec<&str> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    terms.push(&s[start..]);
    terms
}

fn parse_requirement(selector: &str, term: &str) -> Result<Requirement, Error> {
    if let Some(caps) = SET_REQUIREMENT.captures(term) {
        let key = validate_key(selector, &caps[1])?;
        let mut values = BTreeSet::new();
        for value in caps[3].split(',') {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            values.insert(validate_value(selector, value)?);
        }
        let operator = if &caps[2] == "in" {
            Operator::In(values)
        } else {
            Operator::NotIn(values)
        };
        return Ok(Requirement { key, operator });
    }

    if let Some(key) = term.strip_prefix('!') {
        return Ok(Requirement {
            key: validate_key(selector, key.trim())?,
            operator: Operator::DoesNotExist,
        });
    }

    let (key, operator) = if let Some((k, v)) = term.split_once("!=") {
        (k, Operator::NotEquals(validate_value(selector, v.trim())?))
    } else if let Some((k, v)) = term.split_once("==") {
        (k, Operator::Equals(validate_value(selector, v.trim())?))
    } else if let Some((k, v)) = term.split_once('=') {
        (k, Operator::Equals(validate_value(selector, v.trim())?))
    } else {
        (term, Operator::Exists)
    };

    Ok(Requirement {
        key: validate_key(selector, key.trim())?,
        operator,
    })
}

fn validate_key(selector: &str, key: &str) -> Result<String, Error> {
    let name = key.rsplit('/').next().unwrap_or(key);
    if name.len() > MAX_NAME_LEN || !LABEL_KEY.is_match(key) {
        return Err(Error::selector(selector, format!("invalid label key '{key}'")));
    }
    Ok(key.to_string())
}

fn validate_value(selector: &str, value: &str) -> Result<String, Error> {
    if value.len() > MAX_NAME_LEN || !LABEL_VALUE.is_match(value) {
        return Err(Error::selector(
            selector,
            format!("invalid label value '{value}'"),
        ));
    }
    Ok(value.to_string())
}
