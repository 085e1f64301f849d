//! 🧪 The in-memory object store. Lives entirely in RAM, gone the moment you blink.
//!
//! Tests need a store that does exactly what it's told, including the bad stuff:
//! a probe that errors, a GET that dies halfway, a part upload that never lands,
//! a completion that refuses to complete. This is that store. It also writes down
//! every call it receives, so tests can prove what was (and was not) asked of it.
//!
//! 🧠 Knowledge graph: `Clone` shares the same state through an `Arc`, so a test keeps
//! one handle for assertions and hands another to the pipeline. Same trick the old
//! in-memory sink used for its received batches.
//!
//! ⚠️ Not for production. If you're deploying this to prod, please also deploy a therapist.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backends::{
    EntrySink, FetchError, ObjectMeta, ObjectStore, StoreError, UploadedPart,
};

/// 📒 One line in the store's diary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    List { bucket: String, prefix: String },
    Probe { bucket: String, key: String },
    Fetch { bucket: String, key: String },
    CreateUpload { bucket: String, key: String },
    UploadPart { key: String, part_number: i32, len: usize },
    CompleteUpload { key: String, parts: usize },
    AbortUpload { key: String },
}

impl StoreCall {
    /// The source key this call touched, for probe and fetch calls.
    pub fn source_key(&self) -> Option<&str> {
        match self {
            StoreCall::Probe { key, .. } | StoreCall::Fetch { key, .. } => Some(key),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum ProbeFault {
    Unavailable,
    AccessDenied,
    Stall(Duration),
}

#[derive(Debug, Clone, Copy)]
enum FetchFault {
    /// Deliver this many bytes, then fall over.
    FailAfter(u64),
    Stall(Duration),
}

#[derive(Debug, Default)]
struct Faults {
    probe: HashMap<String, ProbeFault>,
    fetch: HashMap<String, FetchFault>,
    failing_part: Option<i32>,
    failing_complete: bool,
    part_delay: Option<Duration>,
}

#[derive(Debug)]
struct PendingUpload {
    bucket: String,
    key: String,
    parts: BTreeMap<i32, Vec<u8>>,
}

#[derive(Debug)]
struct State {
    objects: BTreeMap<(String, String), Vec<u8>>,
    uploads: HashMap<String, PendingUpload>,
    calls: Vec<StoreCall>,
    faults: Faults,
    fetch_chunk_bytes: usize,
    next_upload_id: u64,
    aborted: usize,
}

impl Default for State {
    fn default() -> Self {
        Self {
            objects: BTreeMap::new(),
            uploads: HashMap::new(),
            calls: Vec::new(),
            faults: Faults::default(),
            fetch_chunk_bytes: 4096,
            next_upload_id: 1,
            aborted: 0,
        }
    }
}

/// 📦 A store that never forgets, until the test ends.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 📥 Seed an object.
    pub async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) {
        self.state
            .lock()
            .await
            .objects
            .insert((bucket.to_string(), key.to_string()), data);
    }

    /// 🔍 Read an object back, if it exists.
    pub async fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .await
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    /// 📒 Everything asked of this store so far, in order.
    pub async fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn aborted_uploads(&self) -> usize {
        self.state.lock().await.aborted
    }

    /// Multipart uploads that were created but neither completed nor aborted.
    pub async fn open_uploads(&self) -> usize {
        self.state.lock().await.uploads.len()
    }

    /// How big the GET "network packets" are.
    pub async fn set_fetch_chunk_bytes(&self, bytes: usize) {
        self.state.lock().await.fetch_chunk_bytes = bytes.max(1);
    }

    // ============================================================
    // 💣 fault injection
    // ============================================================

    /// Probing `key` fails with a transport-ish error.
    pub async fn fail_probe(&self, key: &str) {
        self.insert_probe_fault(key, ProbeFault::Unavailable).await;
    }

    pub async fn deny_probe(&self, key: &str) {
        self.insert_probe_fault(key, ProbeFault::AccessDenied).await;
    }

    /// Probing `key` takes this long before answering.
    pub async fn stall_probe(&self, key: &str, delay: Duration) {
        self.insert_probe_fault(key, ProbeFault::Stall(delay)).await;
    }

    /// Fetching `key` delivers `bytes` bytes, then the connection "resets".
    pub async fn fail_fetch_after(&self, key: &str, bytes: u64) {
        self.state
            .lock()
            .await
            .faults
            .fetch
            .insert(key.to_string(), FetchFault::FailAfter(bytes));
    }

    pub async fn stall_fetch(&self, key: &str, delay: Duration) {
        self.state
            .lock()
            .await
            .faults
            .fetch
            .insert(key.to_string(), FetchFault::Stall(delay));
    }

    /// Uploading part `part_number` of any multipart upload fails.
    pub async fn fail_upload_part(&self, part_number: i32) {
        self.state.lock().await.faults.failing_part = Some(part_number);
    }

    pub async fn fail_complete(&self) {
        self.state.lock().await.faults.failing_complete = true;
    }

    /// Every part upload sleeps this long first. A slow consumer on demand. 🐢
    pub async fn delay_upload_parts(&self, delay: Duration) {
        self.state.lock().await.faults.part_delay = Some(delay);
    }

    async fn insert_probe_fault(&self, key: &str, fault: ProbeFault) {
        self.state
            .lock()
            .await
            .faults
            .probe
            .insert(key.to_string(), fault);
    }

    async fn log(&self, call: StoreCall) {
        self.state.lock().await.calls.push(call);
    }
}

fn injected(context: String) -> StoreError {
    StoreError::unavailable(context, "injected fault")
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::List {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        });
        // -- 📚 BTreeMap order = lexicographic, which is what S3 hands back too
        Ok(state
            .objects
            .keys()
            .filter(|(b, k)| b == bucket && k.starts_with(prefix))
            .map(|(_, k)| k.clone())
            .collect())
    }

    async fn probe(&self, bucket: &str, key: &str) -> Result<ObjectMeta, StoreError> {
        self.log(StoreCall::Probe {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
        .await;

        let fault = self.state.lock().await.faults.probe.get(key).copied();
        match fault {
            Some(ProbeFault::Unavailable) => return Err(injected(format!("probing '{key}'"))),
            Some(ProbeFault::AccessDenied) => {
                return Err(StoreError::AccessDenied {
                    target: format!("{bucket}/{key}"),
                });
            }
            Some(ProbeFault::Stall(delay)) => tokio::time::sleep(delay).await,
            None => {}
        }

        let state = self.state.lock().await;
        match state.objects.get(&(bucket.to_string(), key.to_string())) {
            Some(data) => Ok(ObjectMeta {
                size: Some(data.len() as u64),
            }),
            None => Err(StoreError::NotFound {
                key: key.to_string(),
            }),
        }
    }

    async fn fetch(
        &self,
        bucket: &str,
        key: &str,
        sink: &mut (dyn EntrySink + Send),
    ) -> Result<u64, FetchError> {
        self.log(StoreCall::Fetch {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
        .await;

        // -- 🔒 copy out and let go of the lock; the sink may block on backpressure for a while
        let (data, fault, chunk_bytes) = {
            let state = self.state.lock().await;
            let data = state
                .objects
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| StoreError::NotFound {
                    key: key.to_string(),
                })?;
            (data, state.faults.fetch.get(key).copied(), state.fetch_chunk_bytes)
        };

        let fail_after = match fault {
            Some(FetchFault::Stall(delay)) => {
                tokio::time::sleep(delay).await;
                None
            }
            Some(FetchFault::FailAfter(bytes)) => Some(bytes),
            None => None,
        };

        let mut delivered = 0u64;
        for chunk in data.chunks(chunk_bytes) {
            let chunk = match fail_after {
                Some(limit) if delivered + chunk.len() as u64 > limit => {
                    let keep = (limit - delivered) as usize;
                    if keep > 0 {
                        sink.append(&chunk[..keep]).await?;
                    }
                    return Err(injected(format!("reading '{key}'")).into());
                }
                _ => chunk,
            };
            sink.append(chunk).await?;
            delivered += chunk.len() as u64;
        }
        if let Some(limit) = fail_after {
            if delivered >= limit {
                return Err(injected(format!("reading '{key}'")).into());
            }
        }
        Ok(delivered)
    }

    async fn create_upload(&self, bucket: &str, key: &str) -> Result<String, StoreError> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::CreateUpload {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
        let upload_id = format!("mem-upload-{}", state.next_upload_id);
        state.next_upload_id += 1;
        state.uploads.insert(
            upload_id.clone(),
            PendingUpload {
                bucket: bucket.to_string(),
                key: key.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        part_number: i32,
        data: Vec<u8>,
    ) -> Result<UploadedPart, StoreError> {
        let delay = {
            let mut state = self.state.lock().await;
            state.calls.push(StoreCall::UploadPart {
                key: key.to_string(),
                part_number,
                len: data.len(),
            });
            state.faults.part_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().await;
        if state.faults.failing_part == Some(part_number) {
            return Err(injected(format!("uploading part {part_number} of '{key}'")));
        }
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::Protocol(format!("unknown upload id '{upload_id}'")))?;
        upload.parts.insert(part_number, data);
        Ok(UploadedPart {
            part_number,
            etag: format!("\"{upload_id}-{part_number}\""),
        })
    }

    async fn complete_upload(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
        parts: Vec<UploadedPart>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::CompleteUpload {
            key: key.to_string(),
            parts: parts.len(),
        });
        if state.faults.failing_complete {
            return Err(injected(format!("completing upload of '{key}'")));
        }
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StoreError::Protocol(format!("unknown upload id '{upload_id}'")))?;

        let mut body = Vec::new();
        for part in &parts {
            let data = upload.parts.get(&part.part_number).ok_or_else(|| {
                StoreError::Protocol(format!("part {} was never uploaded", part.part_number))
            })?;
            body.extend_from_slice(data);
        }
        state.objects.insert((upload.bucket, upload.key), body);
        Ok(())
    }

    async fn abort_upload(
        &self,
        _bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.calls.push(StoreCall::AbortUpload {
            key: key.to_string(),
        });
        if state.uploads.remove(upload_id).is_some() {
            state.aborted += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn the_one_where_listing_is_sorted_and_scoped_to_the_prefix() {
        let store = InMemoryStore::new();
        store.put_object("b", "p/z.txt", vec![1]).await;
        store.put_object("b", "p/a.txt", vec![2]).await;
        store.put_object("b", "q/a.txt", vec![3]).await;
        store.put_object("other", "p/b.txt", vec![4]).await;

        let keys = store.list_keys("b", "p/").await.expect("list");
        assert_eq!(keys, vec!["p/a.txt", "p/z.txt"]);
    }

    #[tokio::test]
    async fn the_one_where_fetch_arrives_in_chunks_and_in_order() {
        let store = InMemoryStore::new();
        store.set_fetch_chunk_bytes(3).await;
        store.put_object("b", "k", b"abcdefgh".to_vec()).await;

        let mut sink = Vec::new();
        let n = store.fetch("b", "k", &mut sink).await.expect("fetch");
        assert_eq!(n, 8);
        assert_eq!(sink, b"abcdefgh");
    }

    #[tokio::test]
    async fn the_one_where_the_connection_resets_halfway_through() {
        let store = InMemoryStore::new();
        store.set_fetch_chunk_bytes(4).await;
        store.put_object("b", "k", vec![7u8; 10]).await;
        store.fail_fetch_after("k", 6).await;

        let mut sink = Vec::new();
        let err = store.fetch("b", "k", &mut sink).await.expect_err("reset");
        assert!(matches!(err, FetchError::Store(StoreError::Unavailable { .. })));
        // -- 💀 exactly the promised six bytes made it out before the lights went off
        assert_eq!(sink.len(), 6);
    }

    #[tokio::test]
    async fn the_one_where_probe_faults_are_per_key() {
        let store = InMemoryStore::new();
        store.put_object("b", "fine", vec![]).await;
        store.put_object("b", "grumpy", vec![]).await;
        store.put_object("b", "secret", vec![]).await;
        store.fail_probe("grumpy").await;
        store.deny_probe("secret").await;

        assert_eq!(store.probe("b", "fine").await.expect("probe").size, Some(0));
        assert!(matches!(
            store.probe("b", "grumpy").await,
            Err(StoreError::Unavailable { .. })
        ));
        assert!(matches!(
            store.probe("b", "secret").await,
            Err(StoreError::AccessDenied { .. })
        ));
    }

    #[tokio::test]
    async fn the_one_where_nothing_is_visible_until_completion() {
        let store = InMemoryStore::new();
        let id = store.create_upload("b", "out.zip").await.expect("create");
        let p1 = store
            .upload_part("b", "out.zip", &id, 1, b"hello ".to_vec())
            .await
            .expect("part 1");
        let p2 = store
            .upload_part("b", "out.zip", &id, 2, b"world".to_vec())
            .await
            .expect("part 2");
        assert!(store.object("b", "out.zip").await.is_none());

        store
            .complete_upload("b", "out.zip", &id, vec![p1, p2])
            .await
            .expect("complete");
        assert_eq!(
            store.object("b", "out.zip").await.as_deref(),
            Some(&b"hello world"[..])
        );
        assert_eq!(store.open_uploads().await, 0);
    }

    #[tokio::test]
    async fn the_one_where_an_aborted_upload_leaves_no_object() {
        let store = InMemoryStore::new();
        let id = store.create_upload("b", "out.zip").await.expect("create");
        store
            .upload_part("b", "out.zip", &id, 1, vec![1, 2, 3])
            .await
            .expect("part");
        store.abort_upload("b", "out.zip", &id).await.expect("abort");

        assert!(store.object("b", "out.zip").await.is_none());
        assert_eq!(store.aborted_uploads().await, 1);
        assert!(store
            .calls()
            .await
            .contains(&StoreCall::AbortUpload { key: "out.zip".into() }));
    }

    #[tokio::test]
    async fn the_one_where_a_failing_part_fails_only_that_part() {
        let store = InMemoryStore::new();
        store.fail_upload_part(2).await;
        let id = store.create_upload("b", "out.zip").await.expect("create");
        assert!(store.upload_part("b", "out.zip", &id, 1, vec![1]).await.is_ok());
        assert!(store.upload_part("b", "out.zip", &id, 2, vec![2]).await.is_err());
    }
}
