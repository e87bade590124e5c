//! Resolving document references to text.
//!
//! References starting with `mem://` are served from an in-process [`MemorySource`]; anything
//! else is treated as a filesystem path. Bytes become text through a [`TextExtractor`].

use super::types::LoadError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Scheme prefix for in-memory documents.
pub const MEMORY_SCHEME: &str = "mem://";

/// Byte source for document references.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Raw bytes behind `reference`.
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, LoadError>;
}

/// Reads documents from the local filesystem, optionally confined to a root directory.
///
/// With a root, relative references resolve against it and every reference must canonicalize
/// to a path inside it; symlinks pointing elsewhere are rejected too.
#[derive(Debug, Clone, Default)]
pub struct FileSystemSource {
    root: Option<PathBuf>,
}

impl FileSystemSource {
    /// Source reading any path the process can read.
    pub fn unrestricted() -> Self {
        Self::default()
    }

    /// Source confined to `root`.
    pub fn confined(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    /// Path `reference` reads from, after applying the root.
    pub async fn resolve(&self, reference: &str) -> Result<PathBuf, LoadError> {
        let Some(root) = &self.root else {
            return Ok(PathBuf::from(reference));
        };
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|source| io_error(&root.display().to_string(), source))?;
        let candidate = Path::new(reference);
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            root.join(candidate)
        };
        let resolved = tokio::fs::canonicalize(&joined)
            .await
            .map_err(|source| io_error(reference, source))?;
        if !resolved.starts_with(&root) {
            tracing::warn!(reference, root = %root.display(), "Rejected reference outside the document root");
            return Err(LoadError::OutsideRoot(reference.to_string()));
        }
        Ok(resolved)
    }
}

fn io_error(reference: &str, source: std::io::Error) -> LoadError {
    if source.kind() == ErrorKind::NotFound {
        LoadError::NotFound(reference.to_string())
    } else {
        LoadError::Io {
            reference: reference.to_string(),
            source,
        }
    }
}

#[async_trait]
impl DocumentSource for FileSystemSource {
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, LoadError> {
        let path = self.resolve(reference).await?;
        tokio::fs::read(&path)
            .await
            .map_err(|source| io_error(reference, source))
    }
}

/// Documents registered in process memory under `mem://<key>` references.
#[derive(Default)]
pub struct MemorySource {
    documents: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemorySource {
    /// Store `bytes` and return the reference that resolves to them.
    pub async fn insert(&self, key: &str, bytes: impl Into<Vec<u8>>) -> String {
        let key = key.trim_start_matches(MEMORY_SCHEME).to_string();
        let reference = format!("{MEMORY_SCHEME}{key}");
        self.documents.write().await.insert(key, bytes.into());
        reference
    }

    /// Forget the document behind `reference`; `true` if it was stored.
    pub async fn remove(&self, reference: &str) -> bool {
        let key = reference.trim_start_matches(MEMORY_SCHEME);
        self.documents.write().await.remove(key).is_some()
    }

    /// Number of stored documents.
    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    /// Whether nothing is stored.
    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentSource for MemorySource {
    async fn fetch(&self, reference: &str) -> Result<Vec<u8>, LoadError> {
        let key = reference.trim_start_matches(MEMORY_SCHEME);
        self.documents
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| LoadError::NotFound(reference.to_string()))
    }
}

/// Turns document bytes into text.
pub trait TextExtractor: Send + Sync {
    /// Decode `bytes` loaded from `reference`.
    fn extract(&self, reference: &str, bytes: &[u8]) -> Result<String, LoadError>;
}

/// UTF-8 plain text, with a leading byte-order mark removed.
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, reference: &str, bytes: &[u8]) -> Result<String, LoadError> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        String::from_utf8(bytes.to_vec()).map_err(|error| LoadError::Undecodable {
            reference: reference.to_string(),
            reason: error.to_string(),
        })
    }
}

/// Dispatches references to the right source and extracts text.
#[derive(Clone)]
pub struct DocumentLoader {
    memory: Arc<MemorySource>,
    files: Arc<dyn DocumentSource>,
    extractor: Arc<dyn TextExtractor>,
}

impl Default for DocumentLoader {
    fn default() -> Self {
        Self::new(Arc::new(MemorySource::default()))
    }
}

impl DocumentLoader {
    /// Loader over `memory`, the filesystem, and plain-text extraction.
    pub fn new(memory: Arc<MemorySource>) -> Self {
        Self {
            memory,
            files: Arc::new(FileSystemSource::unrestricted()),
            extractor: Arc::new(PlainTextExtractor),
        }
    }

    /// Replace the text extractor.
    pub fn with_extractor(mut self, extractor: Arc<dyn TextExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// In-memory source backing `mem://` references.
    pub fn memory(&self) -> &Arc<MemorySource> {
        &self.memory
    }

    /// Replace the source used for filesystem references.
    pub fn with_files(mut self, files: Arc<dyn DocumentSource>) -> Self {
        self.files = files;
        self
    }

    /// Whether `reference` is served from process memory.
    pub fn is_memory(reference: &str) -> bool {
        reference.starts_with(MEMORY_SCHEME)
    }

    /// Fetch and decode the document behind `reference`.
    pub async fn load(&self, reference: &str) -> Result<String, LoadError> {
        let bytes = if Self::is_memory(reference) {
            self.memory.fetch(reference).await?
        } else {
            self.files.fetch(reference).await?
        };
        tracing::debug!(reference, bytes = bytes.len(), "Document fetched");
        self.extractor.extract(reference, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_documents_round_trip_through_loader() {
        let loader = DocumentLoader::default();
        let reference = loader.memory().insert("notes", "hello").await;
        assert_eq!(reference, "mem://notes");
        assert_eq!(loader.load(&reference).await.unwrap(), "hello");

        assert!(loader.memory().remove(&reference).await);
        assert!(loader.memory().is_empty().await);
        assert!(!loader.memory().remove(&reference).await);
    }

    #[tokio::test]
    async fn files_are_read_and_bom_is_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.txt");
        std::fs::write(&path, b"\xEF\xBB\xBFplain text").unwrap();

        let loader = DocumentLoader::default();
        let text = loader.load(path.to_str().unwrap()).await.unwrap();
        assert_eq!(text, "plain text");
    }

    #[tokio::test]
    async fn confined_source_rejects_paths_outside_its_root() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("inside.txt"), b"inside").unwrap();
        std::fs::write(outside.path().join("secret.txt"), b"secret").unwrap();

        let loader = DocumentLoader::default()
            .with_files(Arc::new(FileSystemSource::confined(root.path())));
        assert_eq!(loader.load("inside.txt").await.unwrap(), "inside");

        let absolute = outside.path().join("secret.txt");
        assert!(matches!(
            loader.load(absolute.to_str().unwrap()).await,
            Err(LoadError::OutsideRoot(_))
        ));
        let escape = format!(
            "../{}/secret.txt",
            outside.path().file_name().unwrap().to_str().unwrap()
        );
        assert!(matches!(
            loader.load(&escape).await,
            Err(LoadError::OutsideRoot(_) | LoadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn missing_and_binary_documents_fail() {
        let loader = DocumentLoader::default();
        assert!(matches!(
            loader.load("mem://absent").await,
            Err(LoadError::NotFound(_))
        ));
        assert!(matches!(
            loader.load("/definitely/not/here.txt").await,
            Err(LoadError::NotFound(_))
        ));

        let reference = loader.memory().insert("binary", vec![0xff, 0xfe, 0x00]).await;
        assert!(matches!(
            loader.load(&reference).await,
            Err(LoadError::Undecodable { .. })
        ));
    }
}
