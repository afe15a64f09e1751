//! Capture store
//!
//! Persists captured requests together with their responses, WebSocket
//! messages and HAR entries. Two backends with the same observable behaviour
//! are provided: [`DiskStorage`] keeps one directory per session, and
//! [`MemoryStorage`] keeps everything in process memory.

mod disk;
mod memory;

pub use disk::DiskStorage;
pub use memory::MemoryStorage;

use crate::errors::Result;
use crate::har::HarEntry;
use crate::options::{StorageKind, WireOptions};
use crate::request::{CapturedRequest, CapturedResponse, RequestId, WebSocketMessage};
use regex::Regex;
use std::path::Path;
use std::sync::Arc;

/// Name of the directory created under the storage base dir
pub const STORAGE_DIR_NAME: &str = ".slinger-wire";

/// Storage for captured traffic.
///
/// Implementations must tolerate concurrent writers (several flows completing
/// at once) and readers polling from another thread.
pub trait CaptureStore: Send + Sync {
  /// Persist a request snapshot, assigning and returning its id.
  ///
  /// The id is also written into `request.id`.
  fn save_request(&self, request: &mut CapturedRequest) -> Result<RequestId>;

  /// Attach a response to a stored request
  fn save_response(&self, id: RequestId, response: &CapturedResponse) -> Result<()>;

  /// Append a WebSocket message to a stored request
  fn save_ws_message(&self, id: RequestId, message: &WebSocketMessage) -> Result<()>;

  /// Attach a HAR entry to a stored request
  fn save_har_entry(&self, id: RequestId, entry: &HarEntry) -> Result<()>;

  /// Load one request with its response and messages
  fn load_request(&self, id: RequestId) -> Result<Option<CapturedRequest>>;

  /// Ids of the stored requests in capture order
  fn request_ids(&self) -> Vec<RequestId>;

  /// Every stored request in capture order
  fn load_requests(&self) -> Result<Vec<CapturedRequest>> {
    let mut requests = Vec::new();
    for id in self.request_ids() {
      if let Some(request) = self.load_request(id)? {
        requests.push(request);
      }
    }
    Ok(requests)
  }

  /// The most recently captured request
  fn load_last_request(&self) -> Result<Option<CapturedRequest>> {
    match self.request_ids().last() {
      Some(id) => self.load_request(*id),
      None => Ok(None),
    }
  }

  /// The earliest request whose URL contains a match for `pattern`.
  ///
  /// With `check_response` set, only requests that already have a response
  /// are considered.
  fn find(&self, pattern: &str, check_response: bool) -> Result<Option<CapturedRequest>>;

  /// Every stored HAR entry in capture order
  fn load_har_entries(&self) -> Result<Vec<HarEntry>>;

  /// Remove every stored record
  fn clear_requests(&self) -> Result<()>;

  /// Directory owned by this store
  fn home_dir(&self) -> &Path;

  /// Release everything the store holds
  fn cleanup(&self) -> Result<()>;
}

impl<'s> dyn CaptureStore + 's {
  /// Lazily iterate the requests stored at the time of the call.
  ///
  /// Requests cleared while iterating are skipped. Call again to restart.
  pub fn iter_requests(&self) -> RequestIter<'_> {
    RequestIter {
      store: self,
      ids: self.request_ids().into_iter(),
    }
  }
}

/// Iterator returned by [`CaptureStore::iter_requests`](trait.CaptureStore.html#method.iter_requests)
pub struct RequestIter<'a> {
  store: &'a dyn CaptureStore,
  ids: std::vec::IntoIter<RequestId>,
}

impl Iterator for RequestIter<'_> {
  type Item = CapturedRequest;

  fn next(&mut self) -> Option<Self::Item> {
    for id in self.ids.by_ref() {
      match self.store.load_request(id) {
        Ok(Some(request)) => return Some(request),
        Ok(None) => continue,
        Err(e) => tracing::warn!("Failed to load request {}: {}", id, e),
      }
    }
    None
  }
}

/// Compile a search pattern, matched anywhere in the URL
pub(crate) fn search_pattern(pattern: &str) -> Result<Regex> {
  Ok(Regex::new(pattern)?)
}

/// Create the store selected by `options`
pub fn create(options: &WireOptions) -> Result<Arc<dyn CaptureStore>> {
  let base = options.storage_base();
  let maxsize = options.request_storage_max_size;
  Ok(match options.request_storage {
    StorageKind::Disk => Arc::new(DiskStorage::new(&base, maxsize)?),
    StorageKind::Memory => Arc::new(MemoryStorage::new(&base, maxsize)?),
  })
}
