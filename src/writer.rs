use core::fmt;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};

use crate::model::Signature;
use crate::reader::ComposedReader;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written { bytes: u64 },
    Skipped { reason: String },
}

impl fmt::Display for WriteOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteOutcome::Written { bytes } => write!(f, "{bytes} bytes"),
            WriteOutcome::Skipped { reason } => write!(f, "skipped ({reason})"),
        }
    }
}

/// What happened to one output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub path: PathBuf,
    pub outcome: WriteOutcome,
}

/// Streams a reassembled file to wherever it belongs.
#[async_trait::async_trait]
pub trait SignatureWriter: Send + Sync {
    /// Writes every output entry that has the given signature.
    ///
    /// Returns `Ok(None)` when no entry is known for `signature`. The reader
    /// is only borrowed for the duration of the call.
    async fn write(
        &self,
        signature: &Signature,
        reader: &mut ComposedReader,
    ) -> anyhow::Result<Option<Vec<WriteReport>>>;
}

/// Writes files below a root directory.
///
/// Several paths may share a signature (identical contents), the first one is
/// streamed and the rest are copied from it.
#[derive(Debug)]
pub struct DirectoryWriter {
    root: PathBuf,
    entries: HashMap<Signature, Vec<PathBuf>>,
    overwrite: bool,
}

impl DirectoryWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: HashMap::new(),
            overwrite: false,
        }
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_entry(mut self, signature: Signature, path: impl Into<PathBuf>) -> Self {
        self.entries.entry(signature).or_default().push(path.into());
        self
    }
}

impl<P: Into<PathBuf>> Extend<(Signature, P)> for DirectoryWriter {
    fn extend<I: IntoIterator<Item = (Signature, P)>>(&mut self, entries: I) {
        for (signature, path) in entries {
            self.entries.entry(signature).or_default().push(path.into());
        }
    }
}

/// Only plain relative paths may leave the root.
fn is_contained(path: &Path) -> bool {
    path.components().all(|c| matches!(c, Component::Normal(_)))
        && path.components().next().is_some()
}

#[async_trait::async_trait]
impl SignatureWriter for DirectoryWriter {
    async fn write(
        &self,
        signature: &Signature,
        reader: &mut ComposedReader,
    ) -> anyhow::Result<Option<Vec<WriteReport>>> {
        let Some(paths) = self.entries.get(signature) else {
            return Ok(None);
        };

        let mut reports = Vec::with_capacity(paths.len());
        let mut first_written: Option<PathBuf> = None;

        for path in paths {
            let skipped = |reason: &str| WriteReport {
                path: path.clone(),
                outcome: WriteOutcome::Skipped {
                    reason: reason.into(),
                },
            };
            if !is_contained(path) {
                tracing::warn!(path = %path.display(), "refusing to write outside of the output root");
                reports.push(skipped("unsafe path"));
                continue;
            }
            let target = self.root.join(path);
            if !self.overwrite && tokio::fs::try_exists(&target).await? {
                reports.push(skipped("exists"));
                continue;
            }
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            let bytes = match &first_written {
                Some(source) => tokio::fs::copy(source, &target).await?,
                None => {
                    let mut file = tokio::fs::File::create(&target).await?;
                    let bytes = tokio::io::copy(reader, &mut file).await?;
                    file.sync_all().await?;
                    first_written = Some(target);
                    bytes
                }
            };
            reports.push(WriteReport {
                path: path.clone(),
                outcome: WriteOutcome::Written { bytes },
            });
        }

        Ok(Some(reports))
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn reader(parts: &[&'static [u8]]) -> ComposedReader {
        ComposedReader::new(parts.iter().map(|p| Bytes::from_static(p)).collect())
    }

    #[tokio::test]
    async fn writes_all_paths_of_a_signature() {
        let dir = tempfile::tempdir().unwrap();
        let signature = Signature::from_contents(b"hello world");
        let writer = DirectoryWriter::new(dir.path())
            .with_entry(signature, "a/b/hello.txt")
            .with_entry(signature, "copy.txt");

        let reports = writer
            .write(&signature, &mut reader(&[b"hello ", b"world"]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reports.len(), 2);
        assert!(reports
            .iter()
            .all(|r| r.outcome == WriteOutcome::Written { bytes: 11 }));
        assert_eq!(
            std::fs::read(dir.path().join("a/b/hello.txt")).unwrap(),
            b"hello world"
        );
        assert_eq!(
            std::fs::read(dir.path().join("copy.txt")).unwrap(),
            b"hello world"
        );
    }

    #[tokio::test]
    async fn unknown_signature_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let writer = DirectoryWriter::new(dir.path());
        let result = writer
            .write(&Signature::from_contents(b"?"), &mut reader(&[b"?"]))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn existing_files_are_kept_unless_overwriting() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"old").unwrap();
        let signature = Signature::from_contents(b"new");

        let writer = DirectoryWriter::new(dir.path()).with_entry(signature, "f");
        let reports = writer
            .write(&signature, &mut reader(&[b"new"]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            reports[0].outcome,
            WriteOutcome::Skipped {
                reason: "exists".into()
            }
        );
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"old");

        let writer = writer.with_overwrite(true);
        writer
            .write(&signature, &mut reader(&[b"new"]))
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn refuses_paths_escaping_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let signature = Signature::from_contents(b"x");
        let mut writer = DirectoryWriter::new(dir.path().join("out"));
        writer.extend([(signature, "../escape"), (signature, "/etc/escape")]);

        let reports = writer
            .write(&signature, &mut reader(&[b"x"]))
            .await
            .unwrap()
            .unwrap();
        assert!(reports
            .iter()
            .all(|r| matches!(&r.outcome, WriteOutcome::Skipped { reason } if reason == "unsafe path")));
        assert!(!dir.path().join("escape").exists());
    }
}
