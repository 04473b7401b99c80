// The SnapshotBundle data model (spec §3) and the ConfChange envelope the
// Fetcher hands to the Pusher (spec §4.4 step 6 / §4.5).

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

/// Reserved path prefix for the four synthetic metadata entries every bundle
/// carries alongside the walked tree contents.
pub const META_PREFIX: &str = "_meta";

pub const META_BRANCH: &str = "_meta/branch";
pub const META_REV: &str = "_meta/rev";
pub const META_COMMIT: &str = "_meta/commit";
pub const META_REPO: &str = "_meta/repo";

/// A mapping from forward-slash-joined tree path to blob bytes, plus the four
/// `_meta/*` entries. `BTreeMap` keeps key order deterministic so the
/// Pusher's transaction ops (and therefore tests asserting on them) don't
/// depend on hashing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotBundle(BTreeMap<String, Vec<u8>>);

impl SnapshotBundle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_meta(&mut self, branch: &str, rev: &str, commit: &str, repo_url: &str) {
        self.0.insert(META_BRANCH.to_owned(), branch.as_bytes().to_vec());
        self.0.insert(META_REV.to_owned(), rev.as_bytes().to_vec());
        self.0.insert(META_COMMIT.to_owned(), commit.as_bytes().to_vec());
        self.0.insert(META_REPO.to_owned(), repo_url.as_bytes().to_vec());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<u8>)> {
        self.0.iter()
    }
}

impl From<BTreeMap<String, Vec<u8>>> for SnapshotBundle {
    fn from(map: BTreeMap<String, Vec<u8>>) -> Self {
        Self(map)
    }
}

impl Deref for SnapshotBundle {
    type Target = BTreeMap<String, Vec<u8>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for SnapshotBundle {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// One successful snapshot, destined for `<outputPrefix>/<app_id>/*`.
#[derive(Debug, Clone)]
pub struct ConfChange {
    pub app_id: String,
    pub kvs: SnapshotBundle,
}
