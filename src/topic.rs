//! Topic naming and wildcard matching for the log bus
//!
//! Topics are `logs:{slug}`. Matching is done here rather than by the bus so
//! any transport that can deliver `(topic, payload)` pairs works.

/// Prefix of every project log topic
pub const LOG_TOPIC_PREFIX: &str = "logs:";

/// Topic a build job publishes its log lines on
pub fn log_topic(slug: &str) -> String {
    format!("{}{}", LOG_TOPIC_PREFIX, slug)
}

/// A subscription pattern: either an exact topic or a prefix ending in `*`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    prefix: Option<String>,
}

impl TopicPattern {
    pub fn new(pattern: impl Into<String>) -> Self {
        let raw = pattern.into();
        let prefix = raw.strip_suffix('*').map(String::from);
        Self { raw, prefix }
    }

    /// The pattern as given, for handing to a pattern-capable bus
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &str) -> bool {
        match &self.prefix {
            Some(prefix) => topic.starts_with(prefix.as_str()),
            None => topic == self.raw,
        }
    }

    /// Extract the room name carried by a topic.
    ///
    /// For a prefix pattern this is whatever the wildcard matched; for an
    /// exact pattern it's the part after the `logs:` prefix. Returns `None` if
    /// the topic doesn't match or names an empty room.
    pub fn slug_of<'a>(&self, topic: &'a str) -> Option<&'a str> {
        if !self.matches(topic) {
            return None;
        }
        let slug = match &self.prefix {
            Some(prefix) => &topic[prefix.len()..],
            None => topic.strip_prefix(LOG_TOPIC_PREFIX).unwrap_or(topic),
        };
        if slug.is_empty() {
            None
        } else {
            Some(slug)
        }
    }
}

impl Default for TopicPattern {
    fn default() -> Self {
        Self::new(format!("{}*", LOG_TOPIC_PREFIX))
    }
}
