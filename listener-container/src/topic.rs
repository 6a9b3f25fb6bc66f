//! Subscription targets

use std::fmt;

/// A subscription target: an exact channel name or a channel pattern.
///
/// Topics are immutable values compared by kind and name, so
/// `Topic::channel("a") != Topic::pattern("a")`.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum Topic {
    /// Exact channel name, subscribed with `SUBSCRIBE`
    Channel(String),
    /// Channel pattern, subscribed with `PSUBSCRIBE`
    Pattern(String),
}

impl Topic {
    pub fn channel(name: impl Into<String>) -> Self {
        Topic::Channel(name.into())
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Topic::Pattern(pattern.into())
    }

    /// The channel name or pattern text
    pub fn name(&self) -> &str {
        match self {
            Topic::Channel(name) | Topic::Pattern(name) => name,
        }
    }

    pub fn is_pattern(&self) -> bool {
        matches!(self, Topic::Pattern(_))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Channel(name) => write!(f, "channel:{}", name),
            Topic::Pattern(pattern) => write!(f, "pattern:{}", pattern),
        }
    }
}

/// Topics split by subscribe command.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct TopicSet {
    pub channels: Vec<String>,
    pub patterns: Vec<String>,
}

impl TopicSet {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.patterns.is_empty()
    }
}

impl<'a> FromIterator<&'a Topic> for TopicSet {
    fn from_iter<I: IntoIterator<Item = &'a Topic>>(iter: I) -> Self {
        let mut set = TopicSet::default();
        for topic in iter {
            match topic {
                Topic::Channel(name) => set.channels.push(name.clone()),
                Topic::Pattern(pattern) => set.patterns.push(pattern.clone()),
            }
        }
        set.channels.sort();
        set.patterns.sort();
        set
    }
}
