// The descriptor data model (spec §3) and the key-parsing / field-mapping
// logic the Tracker uses. The source (conf_tracker.go) resolved field names
// to struct fields via reflection; spec §9 asks for an explicit mapping
// table instead, which `Field` and `Descriptor::set_field` are.

use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref COMMIT_HASH_RE: Regex = Regex::new("^[0-9a-f]{40}$").unwrap();
}

/// One of the four KV fields under `<prefix>/<app_id>/<field>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Id,
    Branch,
    Repo,
    Rev,
}

impl FromStr for Field {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "id" => Ok(Field::Id),
            "branch" => Ok(Field::Branch),
            "repo" => Ok(Field::Repo),
            "rev" => Ok(Field::Rev),
            _ => Err(()),
        }
    }
}

/// A revision selector: `latest`, a `v`-prefixed tag, or a literal 40-char
/// commit hash (spec §3). Parsing never fails — an unparseable value is just
/// not a valid descriptor field, which the Tracker's completeness check
/// rejects downstream rather than this type enforcing it, mirroring the
/// source's "any non-empty string is accepted; the fetcher sorts out what it
/// means" behaviour (conf_fetcher.go's `switch evt.Rev`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rev {
    Latest,
    Tag(String),
    Commit(String),
}

impl Rev {
    pub fn parse(raw: &str) -> Self {
        if raw == "latest" {
            Rev::Latest
        } else if raw.starts_with('v') {
            // Tag name keeps its leading 'v', per spec ("a tag name starting v").
            Rev::Tag(raw.to_owned())
        } else {
            Rev::Commit(raw.to_owned())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Rev::Latest => "latest",
            Rev::Tag(t) => t,
            Rev::Commit(c) => c,
        }
    }

    #[cfg(test)]
    pub fn looks_like_commit_hash(s: &str) -> bool {
        COMMIT_HASH_RE.is_match(s)
    }
}

/// The four-tuple identity of one unit of configuration delivery. Raw string
/// fields are kept (rather than e.g. a parsed `Url`) because the Tracker's
/// job is purely to detect change, not validate content — validation of
/// individual fields (is this a real URL? a resolvable branch?) happens
/// downstream in the Fetcher, which is where a bad value will actually fail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Descriptor {
    pub id: String,
    pub branch: String,
    pub repo: String,
    pub rev: String,
}

impl Descriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Set `field` to `value`, returning whether that changed anything.
    pub fn set_field(&mut self, field: Field, value: &str) -> bool {
        let slot = match field {
            Field::Id => &mut self.id,
            Field::Branch => &mut self.branch,
            Field::Repo => &mut self.repo,
            Field::Rev => &mut self.rev,
        };
        if slot == value {
            false
        } else {
            *slot = value.to_owned();
            true
        }
    }

    /// All four fields non-empty (spec §3: "A descriptor is complete iff all
    /// four fields are non-empty").
    pub fn is_complete(&self) -> bool {
        !self.id.is_empty() && !self.branch.is_empty() && !self.repo.is_empty() && !self.rev.is_empty()
    }

    /// All four fields empty, i.e. every field ever observed for this id has
    /// since been deleted.
    pub fn is_empty_record(&self) -> bool {
        self.id.is_empty() && self.branch.is_empty() && self.repo.is_empty() && self.rev.is_empty()
    }

    pub fn rev(&self) -> Rev {
        Rev::parse(&self.rev)
    }
}

/// Parse `<prefix>/<app_id>/<field>` into `(app_id, field)`. Keys with a
/// different number of path components, or an unrecognized field name, are
/// malformed and ignored by the Tracker (spec §4.2, "Malformed keys with
/// fewer parts are ignored").
pub fn parse_key<'a>(key: &'a str, prefix: &str) -> Option<(&'a str, Field)> {
    let rest = key.strip_prefix(prefix)?.strip_prefix('/')?;
    let mut parts = rest.splitn(2, '/');
    let app_id = parts.next()?;
    let field_str = parts.next()?;
    if app_id.is_empty() || field_str.contains('/') {
        return None;
    }
    let field = field_str.parse().ok()?;
    Some((app_id, field))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorEventKind {
    New,
    Changed,
    Removed,
}

/// Spec §3: "NEW precedes any CHANGED; REMOVED terminates its stream; the
/// tracker never emits two consecutive events carrying identical descriptor
/// field values." `descriptor` is `None` only for `Removed`, matching the
/// source's `AppConf{ID: id}`-only removal event.
#[derive(Debug, Clone)]
pub struct DescriptorEvent {
    pub id: String,
    pub kind: DescriptorEventKind,
    pub descriptor: Option<Descriptor>,
}

impl DescriptorEvent {
    pub fn new(descriptor: Descriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            kind: DescriptorEventKind::New,
            descriptor: Some(descriptor),
        }
    }

    pub fn changed(descriptor: Descriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            kind: DescriptorEventKind::Changed,
            descriptor: Some(descriptor),
        }
    }

    pub fn removed(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            id,
            kind: DescriptorEventKind::Removed,
            descriptor: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use pretty_assertions::assert_eq;

    use super::*;

    #[googletest::test]
    fn parse_key_splits_app_id_and_field() {
        assert_eq!(
            parse_key("config/global/web1/branch", "config/global"),
            Some(("web1", Field::Branch))
        );
        assert_eq!(
            parse_key("config/global/web1/id", "config/global"),
            Some(("web1", Field::Id))
        );
    }

    #[googletest::test]
    fn parse_key_rejects_malformed_keys() {
        expect_that!(parse_key("config/global/web1", "config/global"), none());
        expect_that!(parse_key("config/global/web1/bogus", "config/global"), none());
        expect_that!(parse_key("other/prefix/web1/branch", "config/global"), none());
    }

    #[googletest::test]
    fn descriptor_completeness() {
        let mut d = Descriptor::new("web1");
        assert!(!d.is_complete());
        d.set_field(Field::Branch, "master");
        d.set_field(Field::Repo, "https://example.com/r.git");
        assert!(!d.is_complete());
        d.set_field(Field::Rev, "latest");
        assert!(d.is_complete());
    }

    #[googletest::test]
    fn set_field_reports_whether_value_changed() {
        let mut d = Descriptor::new("web1");
        assert!(d.set_field(Field::Branch, "master"));
        assert!(!d.set_field(Field::Branch, "master"));
        assert!(d.set_field(Field::Branch, "feature"));
    }

    #[googletest::test]
    fn rev_parses_latest_tag_and_commit() {
        assert_eq!(Rev::parse("latest"), Rev::Latest);
        assert_eq!(Rev::parse("v1.2.3"), Rev::Tag("v1.2.3".to_owned()));
        let commit = "0".repeat(40);
        assert!(Rev::looks_like_commit_hash(&commit));
        assert_eq!(Rev::parse(&commit), Rev::Commit(commit));
    }
}
