// The KvBackend collaborator trait (spec §6: "the KV store is an external
// collaborator") and its two implementations: ConsulKv, a thin reqwest-based
// client over Consul's HTTP API, and FakeKv, an in-memory stand-in used by
// every other module's unit tests. Grounded on watch.go (long-poll get),
// leaderhandler/leader.go (session + lock), and conf_pusher.go (txn).

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

/// One KV pair as returned by a `GET /v1/kv/<key>` query, decoded from
/// Consul's base64-wrapped wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub modify_index: u64,
    /// Whether a session currently holds a lock on this key (Consul's
    /// `Session` field). Only meaningful for keys used as election locks;
    /// plain config keys never set this.
    pub held: bool,
}

/// The result of a long-poll: either the index moved and here's what's under
/// the prefix now, or we timed out waiting and the caller should just issue
/// another poll at the same index (spec §4.1: "a watch that times out is not
/// an error").
#[derive(Debug, Clone)]
pub enum WatchResult {
    Pairs { pairs: Vec<KvPair>, index: u64 },
    TimedOut { index: u64 },
}

/// A transactional operation against the KV store, as used by the Pusher to
/// atomically replace `<outputPrefix>/<id>/*` (spec §4.5: "the delete-tree
/// and the sets that follow it must be a single KV transaction, otherwise a
/// reader could observe a half-replaced bundle").
#[derive(Debug, Clone)]
pub enum KvTxnOp {
    DeleteTree { prefix: String },
    Set { key: String, value: Vec<u8> },
}

/// Everything the coordinator needs from a Consul-shaped KV store: reads,
/// long-poll watches, session/lock primitives for leader election, and
/// atomic multi-key transactions. Kept as a plain async trait (no
/// `async-trait` box) since every implementor here is `Send + Sync + 'static`
/// and the trait is only ever used behind a single concrete type per binary,
/// matching how `GitBackend` is defined.
pub trait KvBackend: Send + Sync {
    /// Single-key get. `None` if the key doesn't exist.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<KvPair>>> + Send;

    /// Recursive get of everything under `prefix`, long-polling at `index`
    /// for up to `wait` before giving up and returning `TimedOut`. `index =
    /// 0` means "don't block, return whatever's there now".
    fn watch_prefix(
        &self,
        prefix: &str,
        index: u64,
        wait: Duration,
    ) -> impl Future<Output = Result<WatchResult>> + Send;

    /// Create a new session with the given TTL, returning its ID.
    fn session_create(&self, name: &str, ttl: Duration) -> impl Future<Output = Result<String>> + Send;

    fn session_destroy(&self, session_id: &str) -> impl Future<Output = Result<()>> + Send;

    /// Attempt to acquire `key` under `session_id`, setting its value to
    /// `value` (spec §4.3: "acquire the leaderKey with its nodeName as the
    /// value"). Returns whether the acquisition succeeded (`false` means
    /// someone else holds the lock, not an error).
    fn acquire(&self, key: &str, session_id: &str, value: &[u8]) -> impl Future<Output = Result<bool>> + Send;

    fn release(&self, key: &str, session_id: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Apply every op in `ops` as a single atomic transaction.
    fn txn(&self, ops: Vec<KvTxnOp>) -> impl Future<Output = Result<()>> + Send;
}

/// Production backend: talks to a real Consul agent over its HTTP API.
#[derive(Debug, Clone)]
pub struct ConsulKv {
    client: reqwest::Client,
    base_url: String,
}

impl ConsulKv {
    pub fn new(address: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("http://{address}/v1"),
        }
    }

    fn kv_url(&self, key: &str) -> String {
        format!("{}/kv/{}", self.base_url, key.trim_start_matches('/'))
    }
}

#[derive(Deserialize)]
struct RawKvPair {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
    #[serde(rename = "ModifyIndex")]
    modify_index: u64,
    #[serde(rename = "Session")]
    session: Option<String>,
}

fn decode_pair(raw: RawKvPair) -> Result<KvPair> {
    let value = match raw.value {
        Some(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("decoding base64 KV value")?,
        None => Vec::new(),
    };
    Ok(KvPair {
        key: raw.key,
        value,
        modify_index: raw.modify_index,
        held: raw.session.is_some(),
    })
}

fn consul_index(resp: &reqwest::Response) -> u64 {
    resp.headers()
        .get("X-Consul-Index")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[derive(Serialize)]
#[serde(tag = "Verb")]
enum RawTxnOp {
    #[serde(rename = "delete-tree")]
    DeleteTree { #[serde(rename = "Key")] key: String },
    #[serde(rename = "set")]
    Set {
        #[serde(rename = "Key")]
        key: String,
        #[serde(rename = "Value")]
        value: String,
    },
}

#[derive(Serialize)]
struct RawTxnEntry {
    #[serde(rename = "KV")]
    kv: RawTxnOp,
}

impl KvBackend for ConsulKv {
    async fn get(&self, key: &str) -> Result<Option<KvPair>> {
        let resp = self
            .client
            .get(self.kv_url(key))
            .send()
            .await
            .with_context(|| format!("GET {key}"))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let raw: Vec<RawKvPair> = resp.error_for_status()?.json().await?;
        raw.into_iter().next().map(decode_pair).transpose()
    }

    async fn watch_prefix(&self, prefix: &str, index: u64, wait: Duration) -> Result<WatchResult> {
        let resp = self
            .client
            .get(self.kv_url(prefix))
            .query(&[("recurse", "true")])
            .query(&[("index", index.to_string())])
            .query(&[("wait", format!("{}s", wait.as_secs().max(1)))])
            .timeout(wait + Duration::from_secs(10))
            .send()
            .await
            .with_context(|| format!("long-polling {prefix}"))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(WatchResult::Pairs {
                pairs: Vec::new(),
                index: consul_index(&resp),
            });
        }
        let new_index = consul_index(&resp);
        if new_index == index {
            return Ok(WatchResult::TimedOut { index });
        }
        let raw: Vec<RawKvPair> = resp.error_for_status()?.json().await?;
        let pairs = raw.into_iter().map(decode_pair).collect::<Result<Vec<_>>>()?;
        Ok(WatchResult::Pairs { pairs, index: new_index })
    }

    async fn session_create(&self, name: &str, ttl: Duration) -> Result<String> {
        #[derive(Serialize)]
        struct Req<'a> {
            #[serde(rename = "Name")]
            name: &'a str,
            #[serde(rename = "TTL")]
            ttl: String,
        }
        #[derive(Deserialize)]
        struct Resp {
            #[serde(rename = "ID")]
            id: String,
        }
        let resp: Resp = self
            .client
            .put(format!("{}/session/create", self.base_url))
            .json(&Req {
                name,
                ttl: format!("{}s", ttl.as_secs()),
            })
            .send()
            .await
            .context("creating session")?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.id)
    }

    async fn session_destroy(&self, session_id: &str) -> Result<()> {
        self.client
            .put(format!("{}/session/destroy/{}", self.base_url, session_id))
            .send()
            .await
            .context("destroying session")?
            .error_for_status()?;
        Ok(())
    }

    async fn acquire(&self, key: &str, session_id: &str, value: &[u8]) -> Result<bool> {
        let ok: bool = self
            .client
            .put(self.kv_url(key))
            .query(&[("acquire", session_id)])
            .body(value.to_vec())
            .send()
            .await
            .with_context(|| format!("acquiring {key}"))?
            .error_for_status()?
            .json()
            .await?;
        Ok(ok)
    }

    async fn release(&self, key: &str, session_id: &str) -> Result<bool> {
        let ok: bool = self
            .client
            .put(self.kv_url(key))
            .query(&[("release", session_id)])
            .send()
            .await
            .with_context(|| format!("releasing {key}"))?
            .error_for_status()?
            .json()
            .await?;
        Ok(ok)
    }

    async fn txn(&self, ops: Vec<KvTxnOp>) -> Result<()> {
        let raw: Vec<RawTxnEntry> = ops
            .into_iter()
            .map(|op| RawTxnEntry {
                kv: match op {
                    KvTxnOp::DeleteTree { prefix } => RawTxnOp::DeleteTree { key: prefix },
                    KvTxnOp::Set { key, value } => RawTxnOp::Set {
                        key,
                        value: base64::engine::general_purpose::STANDARD.encode(value),
                    },
                },
            })
            .collect();
        let resp = self
            .client
            .put(format!("{}/txn", self.base_url))
            .json(&raw)
            .send()
            .await
            .context("applying KV transaction")?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("KV transaction rejected: {body}");
        }
        Ok(())
    }
}

/// In-memory stand-in used by unit tests for Watcher, Tracker, LeaderHandler
/// and Pusher, none of which should need a live Consul agent to exercise
/// their logic.
#[derive(Default)]
pub struct FakeKv {
    inner: Mutex<FakeKvState>,
}

#[derive(Default)]
struct FakeKvState {
    pairs: BTreeMap<String, Vec<u8>>,
    index: u64,
    sessions: BTreeMap<String, ()>,
    locks: BTreeMap<String, String>,
    next_session: u64,
}

impl FakeKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: set `key` and bump the global index, as if an external
    /// writer had done it.
    pub fn put(&self, key: &str, value: impl Into<Vec<u8>>) {
        let mut state = self.inner.lock().unwrap();
        state.index += 1;
        state.pairs.insert(key.to_owned(), value.into());
    }

    pub fn delete(&self, key: &str) {
        let mut state = self.inner.lock().unwrap();
        state.index += 1;
        state.pairs.remove(key);
    }

    pub fn index(&self) -> u64 {
        self.inner.lock().unwrap().index
    }
}

impl KvBackend for FakeKv {
    async fn get(&self, key: &str) -> Result<Option<KvPair>> {
        let state = self.inner.lock().unwrap();
        Ok(state.pairs.get(key).map(|v| KvPair {
            key: key.to_owned(),
            value: v.clone(),
            modify_index: state.index,
            held: state.locks.get(key).is_some(),
        }))
    }

    async fn watch_prefix(&self, prefix: &str, index: u64, _wait: Duration) -> Result<WatchResult> {
        let state = self.inner.lock().unwrap();
        if state.index == index {
            return Ok(WatchResult::TimedOut { index });
        }
        let pairs = state
            .pairs
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| KvPair {
                key: k.clone(),
                value: v.clone(),
                modify_index: state.index,
                held: state.locks.get(k).is_some(),
            })
            .collect();
        Ok(WatchResult::Pairs {
            pairs,
            index: state.index,
        })
    }

    async fn session_create(&self, _name: &str, _ttl: Duration) -> Result<String> {
        let mut state = self.inner.lock().unwrap();
        state.next_session += 1;
        let id = format!("fake-session-{}", state.next_session);
        state.sessions.insert(id.clone(), ());
        Ok(id)
    }

    async fn session_destroy(&self, session_id: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.sessions.remove(session_id);
        state.locks.retain(|_, holder| holder != session_id);
        Ok(())
    }

    async fn acquire(&self, key: &str, session_id: &str, value: &[u8]) -> Result<bool> {
        let mut state = self.inner.lock().unwrap();
        if !state.sessions.contains_key(session_id) {
            bail!("unknown session {session_id}");
        }
        match state.locks.get(key) {
            Some(holder) if holder != session_id => Ok(false),
            _ => {
                state.locks.insert(key.to_owned(), session_id.to_owned());
                state.pairs.insert(key.to_owned(), value.to_vec());
                state.index += 1;
                Ok(true)
            }
        }
    }

    async fn release(&self, key: &str, session_id: &str) -> Result<bool> {
        let mut state = self.inner.lock().unwrap();
        match state.locks.get(key) {
            Some(holder) if holder == session_id => {
                state.locks.remove(key);
                state.pairs.remove(key);
                state.index += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn txn(&self, ops: Vec<KvTxnOp>) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        for op in ops {
            match op {
                KvTxnOp::DeleteTree { prefix } => {
                    state.pairs.retain(|k, _| !k.starts_with(&prefix));
                }
                KvTxnOp::Set { key, value } => {
                    state.pairs.insert(key, value);
                }
            }
        }
        state.index += 1;
        Ok(())
    }
}
