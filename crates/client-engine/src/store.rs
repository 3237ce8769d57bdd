//! C6: Order Store — crash-safe on-disk queue of suspended Orders
//! (`storefile*.bin`) and deferred uploads (`curl_save*.bin`), each guarded
//! by a sibling advisory lock file.
//!
//! Grounded on `autogtp/Order.cpp` (the save/load text format, carried by
//! [`crate::order::Order`]) and `autogtp/Worker.cpp`/`Management.cpp`
//! (`storefile`/`curl_save` glob-and-try-lock lifecycle), with the
//! atomic-tmp-then-rename write pattern borrowed from the teacher's
//! `inflight.rs` (`persist_file`) — crash safety there comes from the
//! rename being atomic, not from the lock, which only arbitrates between
//! concurrent *readers*.

use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use uuid::Uuid;

use crate::order::Order;

/// How long a reader is willing to wait for a file's advisory lock before
/// treating it as owned by someone else and skipping it.
const LOCK_TIMEOUT: Duration = Duration::from_millis(10);

/// A directory-scoped queue of checkpointed Orders and deferred uploads.
#[derive(Debug, Clone)]
pub struct OrderStore {
    dir: PathBuf,
}

/// A queued upload: the argument tokens that reconstruct the request, plus
/// the game basename it belongs to (used to clean up the game's files once
/// the upload finally lands).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedUpload {
    pub basename: String,
    pub tokens: Vec<String>,
}

impl OrderStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Writes `order` to a freshly named `storefile<uuid>.bin`, locked for
    /// the duration of the write. One call writes exactly one file.
    pub async fn store_order(&self, order: &Order) -> std::io::Result<PathBuf> {
        let dir = self.dir.clone();
        let order = order.clone();
        tokio::task::spawn_blocking(move || {
            let name = format!("storefile{}.bin", Uuid::new_v4().simple());
            let path = dir.join(&name);
            let lock_path = dir.join(format!("{name}.lock"));
            let lock_file = std::fs::File::create(&lock_path)?;
            lock_file.lock_exclusive()?;
            let tmp = dir.join(format!("{name}.tmp"));
            std::fs::write(&tmp, order.serialize())?;
            std::fs::rename(&tmp, &path)?;
            lock_file.unlock()?;
            let _ = std::fs::remove_file(&lock_path);
            Ok(path)
        })
        .await
        .unwrap()
    }

    /// Takes the first `storefile*.bin` this process can lock, parses it,
    /// and removes it. Returns `None` if the queue is empty or every file is
    /// currently locked by another process.
    pub async fn take_next_order(&self) -> std::io::Result<Option<Order>> {
        self.take_next_matching("storefile", "bin").await
    }

    /// Reads every queued `storefile*.bin` without consuming it and collects
    /// the network hashes each checkpointed Order still needs on resume
    /// (`network` for self-play, `firstNet`/`secondNet` for a match). Used by
    /// `--erase` so it doesn't delete a blob a just-checkpointed order needs.
    pub async fn referenced_network_hashes(
        &self,
    ) -> std::io::Result<std::collections::HashSet<String>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let mut hashes = std::collections::HashSet::new();
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(hashes),
                Err(e) => return Err(e),
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = match path.file_name().and_then(|n| n.to_str()) {
                    Some(n) => n,
                    None => continue,
                };
                if !name.starts_with("storefile") || !name.ends_with(".bin") {
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(&path) else {
                    continue;
                };
                let Ok(order) = Order::deserialize(&text) else {
                    continue;
                };
                for key in ["network", "firstNet", "secondNet"] {
                    if let Some(hash) = order.get(key) {
                        if !hash.is_empty() {
                            hashes.insert(hash.to_string());
                        }
                    }
                }
            }
            Ok(hashes)
        })
        .await
        .unwrap()
    }

    async fn take_next_matching(
        &self,
        prefix: &str,
        ext: &str,
    ) -> std::io::Result<Option<Order>> {
        let dir = self.dir.clone();
        let prefix = prefix.to_string();
        let ext = ext.to_string();
        tokio::task::spawn_blocking(move || {
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = match path.file_name().and_then(|n| n.to_str()) {
                    Some(n) => n,
                    None => continue,
                };
                if !name.starts_with(&prefix) || !name.ends_with(&format!(".{ext}")) {
                    continue;
                }
                let lock_path = dir.join(format!("{name}.lock"));
                let lock_file = std::fs::File::create(&lock_path)?;
                if lock_file.try_lock_exclusive().is_err() {
                    continue;
                }
                std::thread::sleep(LOCK_TIMEOUT);
                let text = std::fs::read_to_string(&path)?;
                let order = Order::deserialize(&text)
                    .map_err(|e| std::io::Error::other(e.to_string()))?;
                std::fs::remove_file(&path)?;
                lock_file.unlock()?;
                let _ = std::fs::remove_file(&lock_path);
                return Ok(Some(order));
            }
            Ok(None)
        })
        .await
        .unwrap()
    }

    /// Appends an upload to the queue in the source's token-list format:
    /// basename line, token count, then one token per line.
    pub async fn enqueue_upload(&self, upload: &QueuedUpload) -> std::io::Result<PathBuf> {
        let dir = self.dir.clone();
        let upload = upload.clone();
        tokio::task::spawn_blocking(move || {
            let name = format!("curl_save{}.bin", Uuid::new_v4().simple());
            let path = dir.join(&name);
            let lock_path = dir.join(format!("{name}.lock"));
            let lock_file = std::fs::File::create(&lock_path)?;
            lock_file.lock_exclusive()?;
            let mut text = String::new();
            text.push_str(&upload.basename);
            text.push('\n');
            text.push_str(&upload.tokens.len().to_string());
            text.push('\n');
            for token in &upload.tokens {
                text.push_str(token);
                text.push('\n');
            }
            let tmp = dir.join(format!("{name}.tmp"));
            std::fs::write(&tmp, text)?;
            std::fs::rename(&tmp, &path)?;
            lock_file.unlock()?;
            let _ = std::fs::remove_file(&lock_path);
            Ok(path)
        })
        .await
        .unwrap()
    }

    /// Drains every lockable `curl_save*.bin`, calling `upload` for each;
    /// deletes the file (and its lock) only if `upload` reports success, so
    /// a failed retry stays queued for the next drain pass.
    pub async fn drain_uploads<F, Fut>(&self, mut upload: F) -> std::io::Result<usize>
    where
        F: FnMut(QueuedUpload) -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let mut drained = 0;
        loop {
            let next = self.peek_next_upload().await?;
            let Some((path, lock_path, lock_guard, item)) = next else {
                break;
            };
            if upload(item).await {
                std::fs::remove_file(&path)?;
                drop(lock_guard);
                let _ = std::fs::remove_file(&lock_path);
                drained += 1;
            } else {
                drop(lock_guard);
                let _ = std::fs::remove_file(&lock_path);
                break;
            }
        }
        Ok(drained)
    }

    #[allow(clippy::type_complexity)]
    async fn peek_next_upload(
        &self,
    ) -> std::io::Result<Option<(PathBuf, PathBuf, std::fs::File, QueuedUpload)>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || {
            let entries = match std::fs::read_dir(&dir) {
                Ok(e) => e,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e),
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = match path.file_name().and_then(|n| n.to_str()) {
                    Some(n) => n,
                    None => continue,
                };
                if !name.starts_with("curl_save") || !name.ends_with(".bin") {
                    continue;
                }
                let lock_path = dir.join(format!("{name}.lock"));
                let lock_file = std::fs::File::create(&lock_path)?;
                if lock_file.try_lock_exclusive().is_err() {
                    continue;
                }
                std::thread::sleep(LOCK_TIMEOUT);
                let item = parse_upload(&path)?;
                return Ok(Some((path, lock_path, lock_file, item)));
            }
            Ok(None)
        })
        .await
        .unwrap()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn parse_upload(path: &Path) -> std::io::Result<QueuedUpload> {
    let text = std::fs::read_to_string(path)?;
    let mut lines = text.lines();
    let basename = lines
        .next()
        .ok_or_else(|| std::io::Error::other("truncated upload file"))?
        .to_string();
    let count: usize = lines
        .next()
        .ok_or_else(|| std::io::Error::other("truncated upload file"))?
        .trim()
        .parse()
        .map_err(|_| std::io::Error::other("bad token count"))?;
    let tokens = lines.take(count).map(String::from).collect();
    Ok(QueuedUpload { basename, tokens })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderKind;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn store_and_restore_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path());
        let mut order = Order::new(OrderKind::RestoreSelfPlayed, BTreeMap::new());
        order.add("moves", "51");
        order.add("sgf", "abc123");
        store.store_order(&order).await.unwrap();

        let restored = store.take_next_order().await.unwrap().unwrap();
        assert_eq!(restored.kind(), OrderKind::RestoreSelfPlayed);
        assert_eq!(restored.get("moves"), Some("51"));

        assert!(store.take_next_order().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upload_queue_drains_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path());
        store
            .enqueue_upload(&QueuedUpload {
                basename: "game1".to_string(),
                tokens: vec!["--submit".to_string(), "foo".to_string()],
            })
            .await
            .unwrap();

        let drained = store.drain_uploads(|_item| async { true }).await.unwrap();
        assert_eq!(drained, 1);

        let remaining = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .count();
        assert_eq!(remaining, 0);
    }

    #[tokio::test]
    async fn upload_queue_keeps_file_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let store = OrderStore::new(dir.path());
        store
            .enqueue_upload(&QueuedUpload {
                basename: "game1".to_string(),
                tokens: vec!["x".to_string()],
            })
            .await
            .unwrap();

        let drained = store.drain_uploads(|_item| async { false }).await.unwrap();
        assert_eq!(drained, 0);

        let remaining = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("curl_save"))
            .count();
        assert_eq!(remaining, 1);
    }
}
