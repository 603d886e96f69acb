use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::Error;

/// A `key` or `key=value` selector over pod labels or annotations.
///
/// A bare key matches whenever the key is present, whatever its value
/// (including the empty string).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRule {
    key: String,
    value: Option<String>,
}

impl MatchRule {
    pub fn matches(&self, metadata: &BTreeMap<String, String>) -> bool {
        match (&self.value, metadata.get(&self.key)) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(expected), Some(actual)) => expected == actual,
        }
    }
}

impl FromStr for MatchRule {
    type Err = Error;

    fn from_str(rule: &str) -> Result<Self, Error> {
        let (key, value) = match rule.split_once('=') {
            Some((key, value)) => (key.trim(), Some(value.trim().to_string())),
            None => (rule.trim(), None),
        };
        if key.is_empty() {
            return Err(Error::UserInputError(format!(
                "match rule '{rule}' has an empty key"
            )));
        }
        Ok(MatchRule {
            key: key.to_string(),
            value,
        })
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}={value}", self.key),
            None => f.write_str(&self.key),
        }
    }
}

/// Label and annotation rules, OR-ed together.
#[derive(Debug, Clone)]
pub struct Matcher {
    labels: Vec<MatchRule>,
    annotations: Vec<MatchRule>,
}

impl Matcher {
    pub fn new(labels: Vec<MatchRule>, annotations: Vec<MatchRule>) -> Result<Self, Error> {
        if labels.is_empty() && annotations.is_empty() {
            return Err(Error::UserInputError(
                "at least one label or annotation required".to_string(),
            ));
        }
        Ok(Matcher {
            labels,
            annotations,
        })
    }

    pub fn parse<S: AsRef<str>>(labels: &[S], annotations: &[S]) -> Result<Self, Error> {
        let parse_all = |rules: &[S]| {
            rules
                .iter()
                .map(|x| x.as_ref().parse())
                .collect::<Result<Vec<MatchRule>, Error>>()
        };
        Self::new(parse_all(labels)?, parse_all(annotations)?)
    }

    pub fn matches(
        &self,
        labels: Option<&BTreeMap<String, String>>,
        annotations: Option<&BTreeMap<String, String>>,
    ) -> bool {
        let any = |rules: &[MatchRule], metadata: Option<&BTreeMap<String, String>>| {
            metadata
                .map(|m| rules.iter().any(|rule| rule.matches(m)))
                .unwrap_or_default()
        };
        any(&self.labels, labels) || any(&self.annotations, annotations)
    }
}
