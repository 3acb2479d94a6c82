use regex::Regex;
use serde::Deserialize;

use crate::error::SatchelError;

/// Channel selection as configured: allow-list, deny-list, patterns or "all".
///
/// A name is selected when it is allowed (by `all`, by `topics` or by
/// `regex`) and not denied (by `exclude_topics` or `exclude`). A filter that
/// only denies allows everything else. Patterns must match the whole name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TopicFilter {
    #[serde(default)]
    pub all: bool,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub regex: Option<String>,
    #[serde(default)]
    pub exclude_topics: Vec<String>,
    #[serde(default)]
    pub exclude: Option<String>,
}

impl TopicFilter {
    /// Select every channel.
    pub fn everything() -> Self {
        Self {
            all: true,
            ..Self::default()
        }
    }

    /// Allow-list of exact channel names.
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            topics: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Deny-list of exact channel names; everything else is selected.
    pub fn except<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            exclude_topics: names.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// True when no selection criteria were given at all.
    pub fn is_empty(&self) -> bool {
        !self.all
            && self.topics.is_empty()
            && self.regex.is_none()
            && self.exclude_topics.is_empty()
            && self.exclude.is_none()
    }

    pub fn compile(&self) -> Result<ChannelFilter, SatchelError> {
        let include = self.regex.as_deref().map(anchored).transpose()?;
        let exclude = self.exclude.as_deref().map(anchored).transpose()?;
        let allow_all = self.all || (self.topics.is_empty() && self.regex.is_none());
        Ok(ChannelFilter {
            allow_all,
            topics: self.topics.clone(),
            include,
            exclude_topics: self.exclude_topics.clone(),
            exclude,
        })
    }
}

fn anchored(pattern: &str) -> Result<Regex, SatchelError> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| SatchelError::Config(format!("invalid channel pattern '{pattern}': {e}")))
}

/// Compiled form of [`TopicFilter`].
#[derive(Debug, Clone)]
pub struct ChannelFilter {
    allow_all: bool,
    topics: Vec<String>,
    include: Option<Regex>,
    exclude_topics: Vec<String>,
    exclude: Option<Regex>,
}

impl ChannelFilter {
    pub fn matches(&self, name: &str) -> bool {
        let allowed = self.allow_all
            || self.topics.iter().any(|t| t == name)
            || self.include.as_ref().is_some_and(|re| re.is_match(name));
        if !allowed {
            return false;
        }
        let denied = self.exclude_topics.iter().any(|t| t == name)
            || self.exclude.as_ref().is_some_and(|re| re.is_match(name));
        !denied
    }
}
