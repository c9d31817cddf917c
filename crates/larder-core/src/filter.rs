//! Subscription filters (NIP-01).
//!
//! A filter is serialized as the third element of a `REQ` frame. Absent
//! fields are omitted; tag filters serialize as `"#e"` / `"#p"`. Time bounds
//! are inclusive on both ends, which is why incremental fetches use
//! `since = newest + 1`.

use serde::{Deserialize, Serialize};

use crate::event::Event;

/// Subscription filter sent to relays.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(rename = "#e", default, skip_serializing_if = "Option::is_none")]
    pub event_refs: Option<Vec<String>>,
    #[serde(rename = "#p", default, skip_serializing_if = "Option::is_none")]
    pub pubkey_refs: Option<Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds<I>(mut self, kinds: I) -> Self
    where
        I: IntoIterator<Item = u16>,
    {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn event_refs<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_refs = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn pubkey_refs<I, S>(mut self, pubkeys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pubkey_refs = Some(pubkeys.into_iter().map(Into::into).collect());
        self
    }

    /// Check whether `event` satisfies every constraint of this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids
            && !ids.iter().any(|id| id == &event.id)
        {
            return false;
        }
        if let Some(authors) = &self.authors
            && !authors.iter().any(|a| a == &event.pubkey)
        {
            return false;
        }
        if let Some(kinds) = &self.kinds
            && !kinds.contains(&event.kind)
        {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        if let Some(refs) = &self.event_refs
            && !event.tag_values("e").any(|v| refs.iter().any(|r| r == v))
        {
            return false;
        }
        if let Some(refs) = &self.pubkey_refs
            && !event.tag_values("p").any(|v| refs.iter().any(|r| r == v))
        {
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(id: &str, pubkey: &str, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at,
            kind: 1,
            tags: vec![vec!["e".to_string(), "root".to_string()]],
            content: String::new(),
            sig: String::new(),
        }
    }

    #[test]
    fn test_serialize_omits_absent_fields() {
        let filter = Filter::new().kinds([1, 6]).until(100).limit(50);
        let json = serde_json::to_string(&filter).unwrap();
        assert_eq!(json, r#"{"kinds":[1,6],"until":100,"limit":50}"#);
    }

    #[test]
    fn test_tag_filters_use_hash_names() {
        let filter = Filter::new().event_refs(["abc"]).pubkey_refs(["def"]);
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["#e"][0], "abc");
        assert_eq!(json["#p"][0], "def");

        let parsed: Filter = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, filter);
    }

    #[test]
    fn test_time_bounds_are_inclusive() {
        let filter = Filter::new().since(100).until(200);
        assert!(filter.matches(&note("a", "pk", 100)));
        assert!(filter.matches(&note("a", "pk", 200)));
        assert!(!filter.matches(&note("a", "pk", 99)));
        assert!(!filter.matches(&note("a", "pk", 201)));
    }

    #[test]
    fn test_matches_authors_kinds_and_refs() {
        let event = note("a", "alice", 10);
        assert!(Filter::new().authors(["alice", "bob"]).matches(&event));
        assert!(!Filter::new().authors(["bob"]).matches(&event));
        assert!(Filter::new().kinds([1]).matches(&event));
        assert!(!Filter::new().kinds([0]).matches(&event));
        assert!(Filter::new().event_refs(["root"]).matches(&event));
        assert!(!Filter::new().pubkey_refs(["carol"]).matches(&event));
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(Filter::new().matches(&note("x", "y", 0)));
    }
}
