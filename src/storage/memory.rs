//! In-memory capture store

use super::{search_pattern, CaptureStore, STORAGE_DIR_NAME};
use crate::errors::Result;
use crate::har::HarEntry;
use crate::request::{CapturedRequest, CapturedResponse, RequestId, WebSocketMessage};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

#[derive(Default)]
struct Inner {
  order: VecDeque<RequestId>,
  requests: HashMap<RequestId, Record>,
}

struct Record {
  request: CapturedRequest,
  har_entry: Option<HarEntry>,
}

/// Volatile store, optionally bounded to `maxsize` requests.
///
/// When the bound is exceeded the oldest request is evicted together with its
/// response, messages and HAR entry.
pub struct MemoryStorage {
  home_dir: PathBuf,
  maxsize: Option<usize>,
  inner: RwLock<Inner>,
}

impl MemoryStorage {
  /// Create a store whose home dir lives under `base_dir`
  pub fn new(base_dir: &Path, maxsize: Option<usize>) -> Result<Self> {
    let home_dir = base_dir.join(STORAGE_DIR_NAME);
    std::fs::create_dir_all(&home_dir)?;
    Ok(Self {
      home_dir,
      maxsize,
      inner: RwLock::new(Inner::default()),
    })
  }

  fn with_record<F>(&self, id: RequestId, f: F)
  where
    F: FnOnce(&mut Record),
  {
    let mut inner = self.inner.write();
    match inner.requests.get_mut(&id) {
      Some(record) => f(record),
      None => tracing::debug!("Dropping update for unknown request {}", id),
    }
  }
}

impl CaptureStore for MemoryStorage {
  fn save_request(&self, request: &mut CapturedRequest) -> Result<RequestId> {
    let id = RequestId::new();
    request.id = Some(id);
    let mut inner = self.inner.write();
    inner.order.push_back(id);
    inner.requests.insert(
      id,
      Record {
        request: request.clone(),
        har_entry: None,
      },
    );
    if let Some(maxsize) = self.maxsize {
      while inner.order.len() > maxsize {
        if let Some(oldest) = inner.order.pop_front() {
          inner.requests.remove(&oldest);
        }
      }
    }
    Ok(id)
  }

  fn save_response(&self, id: RequestId, response: &CapturedResponse) -> Result<()> {
    self.with_record(id, |record| record.request.response = Some(response.clone()));
    Ok(())
  }

  fn save_ws_message(&self, id: RequestId, message: &WebSocketMessage) -> Result<()> {
    self.with_record(id, |record| record.request.ws_messages.push(message.clone()));
    Ok(())
  }

  fn save_har_entry(&self, id: RequestId, entry: &HarEntry) -> Result<()> {
    self.with_record(id, |record| record.har_entry = Some(entry.clone()));
    Ok(())
  }

  fn load_request(&self, id: RequestId) -> Result<Option<CapturedRequest>> {
    Ok(self.inner.read().requests.get(&id).map(|r| r.request.clone()))
  }

  fn request_ids(&self) -> Vec<RequestId> {
    self.inner.read().order.iter().copied().collect()
  }

  fn find(&self, pattern: &str, check_response: bool) -> Result<Option<CapturedRequest>> {
    let regex = search_pattern(pattern)?;
    let inner = self.inner.read();
    Ok(
      inner
        .order
        .iter()
        .filter_map(|id| inner.requests.get(id))
        .map(|record| &record.request)
        .find(|request| {
          regex.is_match(&request.url) && (!check_response || request.response.is_some())
        })
        .cloned(),
    )
  }

  fn load_har_entries(&self) -> Result<Vec<HarEntry>> {
    let inner = self.inner.read();
    Ok(
      inner
        .order
        .iter()
        .filter_map(|id| inner.requests.get(id))
        .filter_map(|record| record.har_entry.clone())
        .collect(),
    )
  }

  fn clear_requests(&self) -> Result<()> {
    let mut inner = self.inner.write();
    inner.order.clear();
    inner.requests.clear();
    Ok(())
  }

  fn home_dir(&self) -> &Path {
    &self.home_dir
  }

  fn cleanup(&self) -> Result<()> {
    self.clear_requests()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::tests::{exercise_concurrent_maxsize, exercise_maxsize, exercise_store};

  #[test]
  fn test_memory_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStorage::new(dir.path(), None).unwrap();
    exercise_store(&store);
    assert!(store.home_dir().ends_with(STORAGE_DIR_NAME));
  }

  #[test]
  fn test_memory_maxsize() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStorage::new(dir.path(), Some(1)).unwrap();
    exercise_maxsize(&store);
  }

  #[test]
  fn test_memory_maxsize_under_concurrent_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStorage::new(dir.path(), Some(1)).unwrap();
    exercise_concurrent_maxsize(&store);
  }
}
