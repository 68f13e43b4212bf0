//! kcopy store: on-disk snapshot of downloaded objects.
//!
//! Layout: `<base>/<group|_core>/<version>/<resource>/<namespace|_cluster>/<name>.yaml`.
//! Every path segment is percent-encoded outside `[a-z0-9.-]`; the `_core` and `_cluster`
//! sentinels can never be produced by the encoder, so the mapping is a bijection. Upper-case
//! letters are escaped as well, which keeps distinct names distinct on case-insensitive
//! filesystems.
//!
//! Names whose encoded file name would exceed [`MAX_FILE_NAME`] are split over nested
//! directories below a `_long` marker: `<scope>/_long/<chunk>/.../<last chunk>.yaml`. Dots are
//! escaped in that form so no chunk starts with one.

#![forbid(unsafe_code)]

use std::ffi::OsStr;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use kcopy_core::{CopyError, CopyOutcome, ResourceCoordinate};
use metrics::counter;
use serde_json::Value as Json;
use tracing::{debug, warn};

pub const CORE_GROUP_DIR: &str = "_core";
pub const CLUSTER_SCOPE_DIR: &str = "_cluster";
pub const OBJECT_EXT: &str = "yaml";
/// Per-resource sidecar holding the kind name.
pub const KIND_FILE: &str = ".kind";
pub const LOCK_FILE: &str = ".kcopy.lock";
/// Marker directory for names too long for a single file name.
pub const LONG_NAME_DIR: &str = "_long";
/// NAME_MAX on common Linux and macOS filesystems.
pub const MAX_FILE_NAME: usize = 255;

const LAYOUT_DEPTH: usize = 5;
const LONG_NAME_CHUNK: usize = 200;
/// 253 characters encoded at 3 bytes each fit in four chunks.
const MAX_WALK_DEPTH: usize = LAYOUT_DEPTH + 6;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Percent-encode a path segment. A leading `.` is encoded too so objects never look hidden.
pub fn encode_segment(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for (i, b) in s.bytes().enumerate() {
        let safe = b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || (b == b'.' && i > 0);
        if safe {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

pub fn decode_segment(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

/// Descriptor of one object on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoredObject {
    pub coordinate: ResourceCoordinate,
    pub namespace: Option<String>,
    pub name: String,
    pub path: PathBuf,
}

fn resource_dir(base: &Path, c: &ResourceCoordinate) -> PathBuf {
    let group = if c.group.is_empty() { CORE_GROUP_DIR.to_string() } else { encode_segment(&c.group) };
    base.join(group).join(encode_segment(&c.version)).join(encode_segment(&c.resource))
}

/// Pure mapping from (coordinate, namespace, name) to a file path.
pub fn object_path(base: &Path, c: &ResourceCoordinate, namespace: Option<&str>, name: &str) -> PathBuf {
    let scope = match namespace {
        Some(ns) if !ns.is_empty() => encode_segment(ns),
        _ => CLUSTER_SCOPE_DIR.to_string(),
    };
    let dir = resource_dir(base, c).join(scope);
    let encoded = encode_segment(name);
    if encoded.len() + OBJECT_EXT.len() + 1 <= MAX_FILE_NAME {
        return dir.join(format!("{encoded}.{OBJECT_EXT}"));
    }
    let mut chunks = long_name_chunks(&encoded.replace('.', "%2E"));
    let last = chunks.pop().unwrap_or_default();
    let mut path = dir.join(LONG_NAME_DIR);
    for chunk in &chunks {
        path.push(chunk);
    }
    path.join(format!("{last}.{OBJECT_EXT}"))
}

/// Split an encoded name into chunks of at most `LONG_NAME_CHUNK` bytes, never inside an escape.
fn long_name_chunks(encoded: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut rest = encoded;
    while !rest.is_empty() {
        let token_len = if rest.starts_with('%') { 3.min(rest.len()) } else { 1 };
        let (token, tail) = rest.split_at(token_len);
        if current.len() + token.len() > LONG_NAME_CHUNK {
            chunks.push(std::mem::take(&mut current));
        }
        current.push_str(token);
        rest = tail;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Inverse of [`object_path`]; `None` for paths outside the layout.
pub fn parse_object_path(base: &Path, path: &Path) -> Option<StoredObject> {
    let rel = path.strip_prefix(base).ok()?;
    let parts: Vec<&str> = rel.iter().map(OsStr::to_str).collect::<Option<_>>()?;
    let (group, version, resource, scope, name_parts) = match parts.as_slice() {
        [g, v, r, s, file] => (*g, *v, *r, *s, vec![*file]),
        [g, v, r, s, marker, chunks @ ..] if *marker == LONG_NAME_DIR && chunks.len() >= 2 => (*g, *v, *r, *s, chunks.to_vec()),
        _ => return None,
    };
    let (file, chunks) = name_parts.split_last()?;
    let stem = file.strip_suffix(&format!(".{OBJECT_EXT}"))?;
    let encoded_name: String = chunks.iter().copied().chain(std::iter::once(stem)).collect();
    let group = if group == CORE_GROUP_DIR { String::new() } else { decode_segment(group)? };
    let namespace = if scope == CLUSTER_SCOPE_DIR { None } else { Some(decode_segment(scope)?) };
    let obj = StoredObject {
        coordinate: ResourceCoordinate::new(group, decode_segment(version)?, decode_segment(resource)?),
        namespace,
        name: decode_segment(&encoded_name)?,
        path: path.to_path_buf(),
    };
    // only the canonical spelling of a name belongs to the layout
    if object_path(base, &obj.coordinate, obj.namespace.as_deref(), &obj.name) != path {
        return None;
    }
    Some(obj)
}

fn persistence(path: &Path, e: impl std::fmt::Display) -> CopyError { CopyError::persistence(path, e) }

/// Write through a dot-prefixed temp file in the same directory, then rename into place.
async fn write_atomic(path: &Path, body: &[u8]) -> CopyOutcome<()> {
    let dir = path.parent().ok_or_else(|| persistence(path, "path has no parent"))?;
    tokio::fs::create_dir_all(dir).await.map_err(|e| persistence(dir, e))?;
    let tmp = dir.join(format!(".tmp.{}.{}", std::process::id(), TMP_SEQ.fetch_add(1, Ordering::Relaxed)));
    if let Err(e) = tokio::fs::write(&tmp, body).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(persistence(&tmp, e));
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(persistence(path, format!("rename from {}: {e}", tmp.display())));
    }
    Ok(())
}

/// Filesystem snapshot rooted at a base directory.
#[derive(Debug, Clone)]
pub struct ObjectStore {
    base: PathBuf,
}

impl ObjectStore {
    /// Open a directory that must already exist (upload side).
    pub fn open_existing(base: impl Into<PathBuf>) -> CopyOutcome<Self> {
        let base = base.into();
        match fs::metadata(&base) {
            Ok(m) if m.is_dir() => Ok(Self { base }),
            Ok(_) => Err(CopyError::Configuration(format!("object directory {} is not a directory", base.display()))),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(CopyError::Configuration(format!("object directory {} does not exist", base.display())))
            }
            Err(e) => Err(CopyError::Configuration(format!("cannot read object directory {}: {e}", base.display()))),
        }
    }

    /// Open a directory, creating it when missing (download side).
    pub fn create(base: impl Into<PathBuf>) -> CopyOutcome<Self> {
        let base = base.into();
        fs::create_dir_all(&base)
            .map_err(|e| CopyError::Configuration(format!("cannot create object directory {}: {e}", base.display())))?;
        Self::open_existing(base)
    }

    pub fn base(&self) -> &Path { &self.base }

    pub fn path_for(&self, c: &ResourceCoordinate, namespace: Option<&str>, name: &str) -> PathBuf {
        object_path(&self.base, c, namespace, name)
    }

    /// Persist one object as YAML. Also records the kind sidecar for its resource directory.
    pub async fn write(&self, c: &ResourceCoordinate, namespace: Option<&str>, name: &str, content: &Json) -> CopyOutcome<PathBuf> {
        let path = self.path_for(c, namespace, name);
        let body = serde_yaml::to_string(content).map_err(|e| persistence(&path, e))?;
        write_atomic(&path, body.as_bytes()).await?;
        if let Some(kind) = content.get("kind").and_then(Json::as_str) {
            let sidecar = resource_dir(&self.base, c).join(KIND_FILE);
            if tokio::fs::metadata(&sidecar).await.is_err() {
                write_atomic(&sidecar, kind.as_bytes()).await?;
            }
        }
        counter!("store_writes_total", 1u64);
        debug!(path = %path.display(), "object written");
        Ok(path)
    }

    pub async fn read(&self, obj: &StoredObject) -> CopyOutcome<Json> {
        let body = tokio::fs::read_to_string(&obj.path).await.map_err(|e| persistence(&obj.path, e))?;
        let value: Json = serde_yaml::from_str(&body).map_err(|e| persistence(&obj.path, format!("parsing YAML: {e}")))?;
        if !value.is_object() {
            return Err(persistence(&obj.path, "object file does not hold a mapping"));
        }
        Ok(value)
    }

    /// Lazily walk the snapshot. Each call starts a fresh walk.
    pub fn list(&self) -> CopyOutcome<StoredObjects> {
        let root = fs::read_dir(&self.base)
            .map_err(|e| CopyError::Configuration(format!("cannot read object directory {}: {e}", self.base.display())))?;
        Ok(StoredObjects { base: self.base.clone(), stack: vec![root] })
    }

    /// Kind stored for a resource: the sidecar when present, else the first object's `kind`.
    pub fn kind_of(&self, c: &ResourceCoordinate) -> CopyOutcome<Option<String>> {
        let dir = resource_dir(&self.base, c);
        let sidecar = dir.join(KIND_FILE);
        match fs::read_to_string(&sidecar) {
            Ok(s) if !s.trim().is_empty() => return Ok(Some(s.trim().to_string())),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(persistence(&sidecar, e)),
        }
        warn!(dir = %dir.display(), "kind sidecar missing; reading an object to find the kind");
        for scope in fs::read_dir(&dir).map_err(|e| persistence(&dir, e))? {
            let scope = scope.map_err(|e| persistence(&dir, e))?.path();
            if !scope.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&scope).map_err(|e| persistence(&scope, e))? {
                let path = entry.map_err(|e| persistence(&scope, e))?.path();
                if parse_object_path(&self.base, &path).is_none() {
                    continue;
                }
                let body = fs::read_to_string(&path).map_err(|e| persistence(&path, e))?;
                let value: Json = serde_yaml::from_str(&body).map_err(|e| persistence(&path, format!("parsing YAML: {e}")))?;
                if let Some(kind) = value.get("kind").and_then(Json::as_str) {
                    return Ok(Some(kind.to_string()));
                }
            }
        }
        Ok(None)
    }

    /// Take the exclusive run lock on the directory; released when the guard drops.
    pub fn lock(&self) -> CopyOutcome<DirLock> {
        let path = self.base.join(LOCK_FILE);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut f) => {
                use std::io::Write;
                let _ = writeln!(f, "{}", std::process::id());
                Ok(DirLock { path })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(CopyError::Configuration(format!(
                "object directory {} is in use by another run (remove {} if stale)",
                self.base.display(),
                path.display()
            ))),
            Err(e) => Err(CopyError::Configuration(format!("cannot lock {}: {e}", path.display()))),
        }
    }
}

/// Guard for [`ObjectStore::lock`].
#[derive(Debug)]
pub struct DirLock {
    path: PathBuf,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove object directory lock");
        }
    }
}

/// Lazy walk over the snapshot tree; yields one descriptor per object file.
pub struct StoredObjects {
    base: PathBuf,
    stack: Vec<fs::ReadDir>,
}

impl Iterator for StoredObjects {
    type Item = CopyOutcome<StoredObject>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let depth = self.stack.len();
            let entry = match self.stack.last_mut()?.next() {
                None => {
                    self.stack.pop();
                    continue;
                }
                Some(Err(e)) => return Some(Err(persistence(&self.base, e))),
                Some(Ok(entry)) => entry,
            };
            // temp files, sidecars and the lock are all dot-prefixed
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => return Some(Err(persistence(&path, e))),
            };
            if file_type.is_dir() {
                // below the scope level only long-name chains are descended
                let long_chain = (depth == LAYOUT_DEPTH && entry.file_name() == LONG_NAME_DIR) || depth > LAYOUT_DEPTH;
                if depth < LAYOUT_DEPTH || (long_chain && depth < MAX_WALK_DEPTH) {
                    match fs::read_dir(&path) {
                        Ok(rd) => self.stack.push(rd),
                        Err(e) => return Some(Err(persistence(&path, e))),
                    }
                }
                continue;
            }
            if depth < LAYOUT_DEPTH || !file_type.is_file() {
                continue;
            }
            match parse_object_path(&self.base, &path) {
                Some(obj) => return Some(Ok(obj)),
                None => warn!(path = %path.display(), "skipping file outside the snapshot layout"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trips_awkward_names() {
        for name in ["simple", "with.dots", "system:controller:x", "a_b", "%41", ".hidden", "ünï", "a/b", "MixedCase"] {
            let enc = encode_segment(name);
            assert!(!enc.contains('/') && !enc.starts_with('.') && !enc.contains('_'), "{enc}");
            assert_eq!(decode_segment(&enc).as_deref(), Some(name));
        }
        assert_eq!(encode_segment("nginx-7d9c.abc"), "nginx-7d9c.abc");
    }

    #[test]
    fn decode_rejects_truncated_escape() {
        assert_eq!(decode_segment("ab%4"), None);
        assert_eq!(decode_segment("ab%zz"), None);
    }

    #[test]
    fn path_mapping_is_invertible() {
        let base = Path::new("/snap");
        let cases = [
            (ResourceCoordinate::new("", "v1", "pods"), Some("default"), "web-0"),
            (ResourceCoordinate::new("", "v1", "nodes"), None, "node-a"),
            (ResourceCoordinate::new("rbac.authorization.k8s.io", "v1", "clusterroles"), None, "system:aggregate-to-view"),
            (ResourceCoordinate::new("core", "v1", "things"), Some("cluster"), "x"),
        ];
        for (c, ns, name) in cases {
            let p = object_path(base, &c, ns, name);
            let back = parse_object_path(base, &p).unwrap();
            assert_eq!(back.coordinate, c);
            assert_eq!(back.namespace.as_deref(), ns);
            assert_eq!(back.name, name);
        }
    }

    #[test]
    fn sentinels_do_not_collide_with_real_names() {
        let base = Path::new("/snap");
        let core = object_path(base, &ResourceCoordinate::new("", "v1", "pods"), Some("cluster"), "p");
        let grouped = object_path(base, &ResourceCoordinate::new("core", "v1", "pods"), None, "p");
        assert_eq!(core, PathBuf::from("/snap/_core/v1/pods/cluster/p.yaml"));
        assert_eq!(grouped, PathBuf::from("/snap/core/v1/pods/_cluster/p.yaml"));
    }

    #[test]
    fn names_differing_in_case_get_distinct_paths() {
        let base = Path::new("/snap");
        let c = ResourceCoordinate::new("", "v1", "configmaps");
        let upper = object_path(base, &c, Some("Team"), "Admin");
        let lower = object_path(base, &c, Some("team"), "admin");
        assert_ne!(upper.to_string_lossy().to_lowercase(), lower.to_string_lossy().to_lowercase());
        assert_eq!(parse_object_path(base, &upper).unwrap().name, "Admin");
    }

    #[test]
    fn long_names_split_into_short_components() {
        let base = Path::new("/snap");
        let c = ResourceCoordinate::new("rbac.authorization.k8s.io", "v1", "clusterroles");
        let dotted = format!("{}.example.com", "x".repeat(240));
        for name in ["a".repeat(253), "system:".repeat(36), dotted, "Ü".repeat(126)] {
            let p = object_path(base, &c, None, &name);
            let rel = p.strip_prefix(base).unwrap();
            assert!(rel.iter().any(|s| s == LONG_NAME_DIR), "{}", p.display());
            for seg in rel.iter() {
                let seg = seg.to_str().unwrap();
                assert!(seg.len() <= MAX_FILE_NAME && !seg.starts_with('.'), "{seg}");
            }
            let back = parse_object_path(base, &p).unwrap();
            assert_eq!(back.name, name);
            assert_eq!(back.coordinate, c);
        }
        // short names never take the long form
        assert_eq!(object_path(base, &c, None, "view"), PathBuf::from("/snap/rbac.authorization.k8s.io/v1/clusterroles/_cluster/view.yaml"));
    }

    #[test]
    fn non_canonical_spellings_are_rejected() {
        let base = Path::new("/snap");
        // a short name stored under the long marker
        assert!(parse_object_path(base, Path::new("/snap/_core/v1/pods/default/_long/a/b.yaml")).is_none());
        // lower-case escape of a byte the encoder writes upper-case
        assert!(parse_object_path(base, Path::new("/snap/_core/v1/pods/default/a%3ab.yaml")).is_none());
        assert!(parse_object_path(base, Path::new("/snap/_core/v1/pods/default/_long/x.yaml")).is_none());
    }

    #[test]
    fn parse_rejects_paths_outside_layout() {
        let base = Path::new("/snap");
        assert!(parse_object_path(base, Path::new("/snap/_core/v1/pods/p.yaml")).is_none());
        assert!(parse_object_path(base, Path::new("/snap/_core/v1/pods/default/p.json")).is_none());
        assert!(parse_object_path(base, Path::new("/elsewhere/_core/v1/pods/default/p.yaml")).is_none());
    }
}
