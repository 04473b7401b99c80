// The Tracker component (spec §4.2), grounded on conf_tracker.go: folds raw
// KvEvents keyed by `<prefix>/<app_id>/<field>` into NEW/CHANGED/REMOVED
// DescriptorEvents, one stream per distinct app_id.

use std::collections::BTreeMap;

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::descriptor::{parse_key, Descriptor, DescriptorEvent};
use crate::watcher::KvEvent;

/// Folds a stream of `KvEvent`s into a stream of `DescriptorEvent`s.
///
/// Mirrors conf_tracker.go's `emitConf`/`emitConfPair`: each app_id has an
/// in-progress `Descriptor` built up field-by-field as its four keys arrive
/// in any order. The first time a descriptor becomes complete, a `New` event
/// fires; every subsequent change to a field of an already-complete
/// descriptor fires `Changed`. Deleting one field only clears that field --
/// the descriptor goes silently incomplete, `seen` is untouched, and filling
/// the field back in later fires `Changed` again, not a fresh `New` (spec
/// §3: "REMOVED: every field previously observed for this id was deleted").
/// `Removed` only fires once all four fields for an id are gone.
pub struct Tracker {
    prefix: String,
    state: BTreeMap<String, Descriptor>,
    seen: std::collections::BTreeSet<String>,
}

impl Tracker {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            state: BTreeMap::new(),
            seen: std::collections::BTreeSet::new(),
        }
    }

    /// Consumes `rx` until it closes, emitting to `tx`. Returns `Ok(())` on
    /// clean closure of the input channel.
    pub async fn run(&mut self, mut rx: mpsc::Receiver<KvEvent>, tx: mpsc::Sender<DescriptorEvent>) -> anyhow::Result<()> {
        while let Some(event) = rx.recv().await {
            if let Some(out) = self.apply(event) {
                if tx.send(out).await.is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Applies one raw KV event to internal state, returning the
    /// `DescriptorEvent` it produced, if any (most field updates to an
    /// already-complete descriptor that don't actually change a value
    /// produce nothing, matching `set_field`'s change-detection).
    fn apply(&mut self, event: KvEvent) -> Option<DescriptorEvent> {
        match event {
            KvEvent::Set(pair) => {
                let (app_id, field) = parse_key(&pair.key, &self.prefix)?;
                let app_id = app_id.to_owned();
                let value = String::from_utf8_lossy(&pair.value).into_owned();

                let descriptor = self.state.entry(app_id.clone()).or_insert_with(|| Descriptor::new(&app_id));
                let changed = descriptor.set_field(field, &value);
                if !changed {
                    return None;
                }
                if !descriptor.is_complete() {
                    return None;
                }

                if self.seen.insert(app_id.clone()) {
                    Some(DescriptorEvent::new(descriptor.clone()))
                } else {
                    Some(DescriptorEvent::changed(descriptor.clone()))
                }
            }
            KvEvent::Deleted(key) => {
                let (app_id, field) = parse_key(&key, &self.prefix)?;
                let app_id = app_id.to_owned();
                let descriptor = self.state.get_mut(&app_id)?;
                descriptor.set_field(field, "");

                if !descriptor.is_empty_record() {
                    debug!("tracker: {app_id} lost a field, descriptor now incomplete");
                    return None;
                }

                self.state.remove(&app_id);
                if self.seen.remove(&app_id) {
                    debug!("tracker: {app_id} removed");
                    Some(DescriptorEvent::removed(app_id))
                } else {
                    warn!("tracker: incomplete descriptor {app_id} lost its last field, no REMOVED emitted");
                    None
                }
            }
        }
    }
}
