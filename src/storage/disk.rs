//! Disk backed capture store
//!
//! Layout of a session:
//!
//! ```text
//! <base>/.slinger-wire/storage-<uuid>/
//!   <request id>/request.json
//!   <request id>/response.json
//!   <request id>/har_entry.json
//!   <request id>/ws_messages.jsonl
//! ```

use super::{search_pattern, CaptureStore, STORAGE_DIR_NAME};
use crate::errors::Result;
use crate::har::HarEntry;
use crate::request::{CapturedRequest, CapturedResponse, RequestId, WebSocketMessage};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

const REQUEST_FILE: &str = "request.json";
const RESPONSE_FILE: &str = "response.json";
const HAR_FILE: &str = "har_entry.json";
const WS_FILE: &str = "ws_messages.jsonl";
/// Session directories untouched for longer than this are removed on start
const STALE_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

struct IndexEntry {
  id: RequestId,
  url: String,
  has_response: bool,
}

/// Durable store keeping one directory per captured request.
///
/// An in-memory index keeps capture order so listing does not need to walk
/// the file system.
pub struct DiskStorage {
  home_dir: PathBuf,
  session_dir: PathBuf,
  maxsize: Option<usize>,
  index: RwLock<VecDeque<IndexEntry>>,
}

impl DiskStorage {
  /// Create a new session directory under `base_dir`
  pub fn new(base_dir: &Path, maxsize: Option<usize>) -> Result<Self> {
    let home_dir = base_dir.join(STORAGE_DIR_NAME);
    fs::create_dir_all(&home_dir)?;
    cleanup_stale(&home_dir);
    let session_dir = home_dir.join(format!("storage-{}", Uuid::new_v4().simple()));
    fs::create_dir_all(&session_dir)?;
    tracing::debug!("Capturing to {}", session_dir.display());
    Ok(Self {
      home_dir,
      session_dir,
      maxsize,
      index: RwLock::new(VecDeque::new()),
    })
  }

  /// Directory holding this session's records
  pub fn session_dir(&self) -> &Path {
    &self.session_dir
  }

  fn request_dir(&self, id: RequestId) -> PathBuf {
    self.session_dir.join(id.to_string())
  }

  /// Run `f` on the directory of `id` while it is still indexed.
  ///
  /// The index stays write locked for the whole call, so an eviction can not
  /// remove the directory in between. Returns whether `f` ran.
  fn update_indexed<F>(&self, id: RequestId, f: F) -> Result<bool>
  where
    F: FnOnce(&Path, &mut IndexEntry) -> Result<()>,
  {
    let mut index = self.index.write();
    let Some(entry) = index.iter_mut().find(|e| e.id == id) else {
      return Ok(false);
    };
    f(&self.request_dir(id), entry)?;
    Ok(true)
  }

  fn load_index_entry(&self, entry: &IndexEntry) -> Result<Option<CapturedRequest>> {
    self.load_request(entry.id)
  }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
  let tmp = path.with_extension("tmp");
  fs::write(&tmp, serde_json::to_vec(value)?)?;
  fs::rename(&tmp, path)?;
  Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
  match fs::read(path) {
    Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
    Err(e) => Err(e.into()),
  }
}

fn cleanup_stale(home_dir: &Path) {
  let Ok(entries) = fs::read_dir(home_dir) else {
    return;
  };
  let now = SystemTime::now();
  for entry in entries.flatten() {
    let path = entry.path();
    let is_session = path
      .file_name()
      .and_then(|n| n.to_str())
      .map(|n| n.starts_with("storage-"))
      .unwrap_or(false);
    if !is_session || !path.is_dir() {
      continue;
    }
    let stale = entry
      .metadata()
      .and_then(|m| m.modified())
      .ok()
      .and_then(|modified| now.duration_since(modified).ok())
      .map(|age| age > STALE_AFTER)
      .unwrap_or(false);
    if stale {
      match fs::remove_dir_all(&path) {
        Ok(()) => tracing::debug!("Removed stale storage {}", path.display()),
        Err(e) => tracing::warn!("Failed to remove stale storage {}: {}", path.display(), e),
      }
    }
  }
}

impl CaptureStore for DiskStorage {
  fn save_request(&self, request: &mut CapturedRequest) -> Result<RequestId> {
    let id = RequestId::new();
    request.id = Some(id);
    let dir = self.request_dir(id);
    fs::create_dir_all(&dir)?;
    let mut stored = request.clone();
    stored.response = None;
    stored.ws_messages.clear();
    write_json(&dir.join(REQUEST_FILE), &stored)?;

    let evicted: Vec<RequestId> = {
      let mut index = self.index.write();
      index.push_back(IndexEntry {
        id,
        url: request.url.clone(),
        has_response: false,
      });
      let mut evicted = Vec::new();
      if let Some(maxsize) = self.maxsize {
        while index.len() > maxsize {
          if let Some(oldest) = index.pop_front() {
            evicted.push(oldest.id);
          }
        }
      }
      evicted
    };
    for old in evicted {
      if let Err(e) = fs::remove_dir_all(self.request_dir(old)) {
        tracing::warn!("Failed to evict request {}: {}", old, e);
      }
    }
    Ok(id)
  }

  fn save_response(&self, id: RequestId, response: &CapturedResponse) -> Result<()> {
    let written = self.update_indexed(id, |dir, entry| {
      write_json(&dir.join(RESPONSE_FILE), response)?;
      entry.has_response = true;
      Ok(())
    })?;
    if !written {
      tracing::debug!("Dropping response for unknown request {}", id);
    }
    Ok(())
  }

  fn save_ws_message(&self, id: RequestId, message: &WebSocketMessage) -> Result<()> {
    let mut line = serde_json::to_vec(message)?;
    line.push(b'\n');
    let written = self.update_indexed(id, |dir, _| {
      let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(WS_FILE))?;
      file.write_all(&line)?;
      Ok(())
    })?;
    if !written {
      tracing::debug!("Dropping websocket message for unknown request {}", id);
    }
    Ok(())
  }

  fn save_har_entry(&self, id: RequestId, entry: &HarEntry) -> Result<()> {
    self
      .update_indexed(id, |dir, _| write_json(&dir.join(HAR_FILE), entry))
      .map(|_| ())
  }

  fn load_request(&self, id: RequestId) -> Result<Option<CapturedRequest>> {
    let dir = self.request_dir(id);
    let Some(mut request) = read_json::<CapturedRequest>(&dir.join(REQUEST_FILE))? else {
      return Ok(None);
    };
    request.response = read_json(&dir.join(RESPONSE_FILE))?;
    request.ws_messages = match fs::read_to_string(dir.join(WS_FILE)) {
      Ok(lines) => lines
        .lines()
        .filter(|l| !l.is_empty())
        .map(serde_json::from_str)
        .collect::<std::result::Result<Vec<WebSocketMessage>, _>>()?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
      Err(e) => return Err(e.into()),
    };
    Ok(Some(request))
  }

  fn request_ids(&self) -> Vec<RequestId> {
    self.index.read().iter().map(|e| e.id).collect()
  }

  fn find(&self, pattern: &str, check_response: bool) -> Result<Option<CapturedRequest>> {
    let regex = search_pattern(pattern)?;
    let index = self.index.read();
    for entry in index.iter() {
      if regex.is_match(&entry.url) && (!check_response || entry.has_response) {
        return self.load_index_entry(entry);
      }
    }
    Ok(None)
  }

  fn load_har_entries(&self) -> Result<Vec<HarEntry>> {
    let mut entries = Vec::new();
    for id in self.request_ids() {
      if let Some(entry) = read_json(&self.request_dir(id).join(HAR_FILE))? {
        entries.push(entry);
      }
    }
    Ok(entries)
  }

  fn clear_requests(&self) -> Result<()> {
    let mut index = self.index.write();
    for entry in index.drain(..) {
      let dir = self.request_dir(entry.id);
      if let Err(e) = fs::remove_dir_all(&dir) {
        if e.kind() != std::io::ErrorKind::NotFound {
          return Err(e.into());
        }
      }
    }
    Ok(())
  }

  fn home_dir(&self) -> &Path {
    &self.home_dir
  }

  fn cleanup(&self) -> Result<()> {
    self.index.write().clear();
    match fs::remove_dir_all(&self.session_dir) {
      Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
      _ => Ok(()),
    }
  }
}
