//! Ordered streaming writer and byte sinks
//!
//! Decrypted chunks finish in whatever order the network delivers them.
//! [`OrderedWriter`] holds early arrivals in a bounded reorder buffer and
//! appends to the sink strictly in index order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use futures::future::BoxFuture;
use rcx_core::TransferError;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Where a closed sink left its bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOutput {
    File(PathBuf),
    Memory(Bytes),
}

/// Sequential-append destination.
pub trait ByteSink: Send {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, std::io::Result<()>>;

    /// Flush and publish the output.
    fn close(self: Box<Self>) -> BoxFuture<'static, std::io::Result<SinkOutput>>;

    /// Discard everything written so far.
    fn abort(self: Box<Self>) -> BoxFuture<'static, std::io::Result<()>>;
}

/// Creates sinks for streaming downloads. Hosts that cannot write straight
/// to storage simply don't provide one.
pub trait SinkFactory: Send + Sync {
    fn create_sink<'a>(
        &'a self,
        suggested_name: &'a str,
        content_type: &'a str,
    ) -> BoxFuture<'a, std::io::Result<Box<dyn ByteSink>>>;
}

#[derive(Debug, Default)]
pub struct MemorySink {
    buf: Vec<u8>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ByteSink for MemorySink {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, std::io::Result<()>> {
        self.buf.extend_from_slice(data);
        Box::pin(async { Ok(()) })
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, std::io::Result<SinkOutput>> {
        let buf = Bytes::from(self.buf);
        Box::pin(async move { Ok(SinkOutput::Memory(buf)) })
    }

    fn abort(self: Box<Self>) -> BoxFuture<'static, std::io::Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Writes each sink to a hidden temp file in `dir`, renamed into place on
/// close. An existing file of the same name is kept and the output takes a
/// numbered name instead, unless overwriting is enabled.
#[derive(Debug, Clone)]
pub struct DirSinkFactory {
    dir: PathBuf,
    overwrite: bool,
}

impl DirSinkFactory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            overwrite: false,
        }
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SinkFactory for DirSinkFactory {
    fn create_sink<'a>(
        &'a self,
        suggested_name: &'a str,
        _content_type: &'a str,
    ) -> BoxFuture<'a, std::io::Result<Box<dyn ByteSink>>> {
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.dir).await?;
            let name = sanitize_file_name(suggested_name);
            let temp = self
                .dir
                .join(format!(".{name}.{}.part", uuid::Uuid::new_v4()));
            let file = tokio::fs::File::create(&temp).await?;
            tracing::debug!(path = %temp.display(), "streaming sink opened");
            Ok(Box::new(FileSink {
                file,
                temp,
                dir: self.dir.clone(),
                name,
                overwrite: self.overwrite,
            }) as Box<dyn ByteSink>)
        })
    }
}

/// Strip directory components and characters that can't appear in a file
/// name on common platforms.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, ':' | '*' | '?' | '"' | '<' | '>' | '|') {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = cleaned.trim_matches(|c: char| c == '.' || c.is_whitespace());
    if trimmed.is_empty() {
        "download".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Where output named `name` lands in `dir`. With `overwrite` an existing
/// file is replaced (and a warning logged); otherwise the first free name of
/// the form `stem (n).ext` is used.
pub async fn output_path(dir: &Path, name: &str, overwrite: bool) -> std::io::Result<PathBuf> {
    let target = dir.join(name);
    if !tokio::fs::try_exists(&target).await? {
        return Ok(target);
    }
    if overwrite {
        tracing::warn!(path = %target.display(), "replacing existing file");
        return Ok(target);
    }
    let as_path = Path::new(name);
    let stem = as_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    let ext = as_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    for n in 1u32.. {
        let candidate = dir.join(format!("{stem} ({n}){ext}"));
        if !tokio::fs::try_exists(&candidate).await? {
            tracing::info!(
                existing = %target.display(),
                path = %candidate.display(),
                "output name taken, writing alongside"
            );
            return Ok(candidate);
        }
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("no free name for {}", target.display()),
    ))
}

struct FileSink {
    file: tokio::fs::File,
    temp: PathBuf,
    dir: PathBuf,
    name: String,
    overwrite: bool,
}

impl ByteSink for FileSink {
    fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, std::io::Result<()>> {
        Box::pin(self.file.write_all(data))
    }

    fn close(self: Box<Self>) -> BoxFuture<'static, std::io::Result<SinkOutput>> {
        Box::pin(async move {
            let Self {
                mut file,
                temp,
                dir,
                name,
                overwrite,
            } = *self;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            let target = output_path(&dir, &name, overwrite).await?;
            tokio::fs::rename(&temp, &target).await?;
            tracing::debug!(path = %target.display(), "streaming sink closed");
            Ok(SinkOutput::File(target))
        })
    }

    fn abort(self: Box<Self>) -> BoxFuture<'static, std::io::Result<()>> {
        Box::pin(async move {
            let Self { file, temp, .. } = *self;
            drop(file);
            match tokio::fs::remove_file(&temp).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e),
            }
        })
    }
}

#[derive(Debug, Error)]
pub enum WriterError {
    #[error("chunk index {index} out of range (total {total})")]
    OutOfRange { index: usize, total: usize },

    #[error("chunk {index} written twice")]
    Duplicate { index: usize },

    #[error("reorder buffer full: {pending} chunks waiting for chunk {next}")]
    BufferFull { pending: usize, next: usize },

    #[error("finish called with {written} of {total} chunks written")]
    Incomplete { written: usize, total: usize },

    #[error("sink: {0}")]
    Sink(#[from] std::io::Error),
}

impl From<WriterError> for TransferError {
    fn from(err: WriterError) -> Self {
        TransferError::Sink(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriterSummary {
    pub bytes_written: u64,
    pub output: SinkOutput,
}

/// Reorder buffer in front of a [`ByteSink`].
pub struct OrderedWriter {
    sink: Option<Box<dyn ByteSink>>,
    total: usize,
    next: usize,
    pending: BTreeMap<usize, Vec<u8>>,
    max_pending: usize,
    bytes_written: u64,
}

impl OrderedWriter {
    pub fn new(sink: Box<dyn ByteSink>, total_chunks: usize, max_pending: usize) -> Self {
        Self {
            sink: Some(sink),
            total: total_chunks,
            next: 0,
            pending: BTreeMap::new(),
            max_pending: max_pending.max(1),
            bytes_written: 0,
        }
    }

    /// Next index the sink is waiting for.
    pub fn next_index(&self) -> usize {
        self.next
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn is_complete(&self) -> bool {
        self.next == self.total
    }

    /// Accept chunk `index`; flushes every contiguous chunk now available.
    pub async fn write(&mut self, index: usize, data: Vec<u8>) -> Result<(), WriterError> {
        if index >= self.total {
            return Err(WriterError::OutOfRange {
                index,
                total: self.total,
            });
        }
        if index < self.next || self.pending.contains_key(&index) {
            return Err(WriterError::Duplicate { index });
        }
        if index != self.next {
            if self.pending.len() >= self.max_pending {
                return Err(WriterError::BufferFull {
                    pending: self.pending.len(),
                    next: self.next,
                });
            }
            self.pending.insert(index, data);
            return Ok(());
        }

        let Some(sink) = self.sink.as_mut() else {
            return Err(closed_sink());
        };
        sink.write(&data).await?;
        self.bytes_written += data.len() as u64;
        self.next += 1;
        while let Some(data) = self.pending.remove(&self.next) {
            sink.write(&data).await?;
            self.bytes_written += data.len() as u64;
            self.next += 1;
        }
        Ok(())
    }

    /// Close the sink once every chunk has been written.
    ///
    /// Calling this early is a bug in the caller: the sink is aborted and
    /// [`WriterError::Incomplete`] returned.
    pub async fn finish(mut self) -> Result<WriterSummary, WriterError> {
        let Some(sink) = self.sink.take() else {
            return Err(closed_sink());
        };
        if !self.is_complete() {
            tracing::error!(
                written = self.next,
                total = self.total,
                pending = self.pending.len(),
                "ordered writer finished before all chunks were written"
            );
            if let Err(e) = sink.abort().await {
                tracing::warn!("aborting sink failed: {e}");
            }
            return Err(WriterError::Incomplete {
                written: self.next,
                total: self.total,
            });
        }
        let output = sink.close().await?;
        Ok(WriterSummary {
            bytes_written: self.bytes_written,
            output,
        })
    }

    /// Discard the output; leaves the destination as if never written.
    pub async fn abort(mut self) -> Result<(), WriterError> {
        self.pending.clear();
        match self.sink.take() {
            Some(sink) => Ok(sink.abort().await?),
            None => Ok(()),
        }
    }
}

fn closed_sink() -> WriterError {
    WriterError::Sink(std::io::Error::other("sink already closed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records the byte slices it receives.
    struct Recording {
        writes: Arc<Mutex<Vec<Vec<u8>>>>,
    }

    impl ByteSink for Recording {
        fn write<'a>(&'a mut self, data: &'a [u8]) -> BoxFuture<'a, std::io::Result<()>> {
            self.writes.lock().unwrap().push(data.to_vec());
            Box::pin(async { Ok(()) })
        }

        fn close(self: Box<Self>) -> BoxFuture<'static, std::io::Result<SinkOutput>> {
            let all = self.writes.lock().unwrap().concat();
            Box::pin(async move { Ok(SinkOutput::Memory(Bytes::from(all))) })
        }

        fn abort(self: Box<Self>) -> BoxFuture<'static, std::io::Result<()>> {
            self.writes.lock().unwrap().clear();
            Box::pin(async { Ok(()) })
        }
    }

    fn recording() -> (Box<dyn ByteSink>, Arc<Mutex<Vec<Vec<u8>>>>) {
        let writes = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(Recording {
                writes: writes.clone(),
            }),
            writes,
        )
    }

    #[tokio::test]
    async fn test_reverse_order_flushes_in_sequence() {
        let (sink, writes) = recording();
        let mut writer = OrderedWriter::new(sink, 3, 8);
        writer.write(2, b"cc".to_vec()).await.unwrap();
        writer.write(1, b"b".to_vec()).await.unwrap();
        assert!(writes.lock().unwrap().is_empty());
        assert_eq!(writer.pending(), 2);

        writer.write(0, b"aaa".to_vec()).await.unwrap();
        assert_eq!(
            *writes.lock().unwrap(),
            vec![b"aaa".to_vec(), b"b".to_vec(), b"cc".to_vec()]
        );

        let summary = writer.finish().await.unwrap();
        assert_eq!(summary.bytes_written, 6);
        assert_eq!(summary.output, SinkOutput::Memory(Bytes::from_static(b"aaabcc")));
    }

    #[tokio::test]
    async fn test_forward_and_reverse_byte_counts_match() {
        let chunks: Vec<Vec<u8>> = (0..5).map(|i| vec![i as u8; i + 1]).collect();

        let mut forward = OrderedWriter::new(Box::new(MemorySink::new()), 5, 8);
        for (i, c) in chunks.iter().enumerate() {
            forward.write(i, c.clone()).await.unwrap();
        }
        let mut reverse = OrderedWriter::new(Box::new(MemorySink::new()), 5, 8);
        for (i, c) in chunks.iter().enumerate().rev() {
            reverse.write(i, c.clone()).await.unwrap();
        }
        let a = forward.finish().await.unwrap();
        let b = reverse.finish().await.unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_duplicate_and_out_of_range_rejected() {
        let mut writer = OrderedWriter::new(Box::new(MemorySink::new()), 2, 4);
        writer.write(0, b"x".to_vec()).await.unwrap();
        assert!(matches!(
            writer.write(0, b"x".to_vec()).await,
            Err(WriterError::Duplicate { index: 0 })
        ));
        assert!(matches!(
            writer.write(5, b"x".to_vec()).await,
            Err(WriterError::OutOfRange { index: 5, total: 2 })
        ));
    }

    #[tokio::test]
    async fn test_reorder_buffer_is_bounded() {
        let mut writer = OrderedWriter::new(Box::new(MemorySink::new()), 10, 2);
        writer.write(3, vec![3]).await.unwrap();
        writer.write(4, vec![4]).await.unwrap();
        let err = writer.write(5, vec![5]).await.unwrap_err();
        assert!(matches!(err, WriterError::BufferFull { pending: 2, next: 0 }));
    }

    #[tokio::test]
    async fn test_finish_early_aborts_sink() {
        let (sink, writes) = recording();
        let mut writer = OrderedWriter::new(sink, 3, 4);
        writer.write(0, b"a".to_vec()).await.unwrap();
        let err = writer.finish().await.unwrap_err();
        assert!(matches!(err, WriterError::Incomplete { written: 1, total: 3 }));
        assert!(writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_chunk_file_finishes_empty() {
        let writer = OrderedWriter::new(Box::new(MemorySink::new()), 0, 4);
        let summary = writer.finish().await.unwrap();
        assert_eq!(summary.bytes_written, 0);
    }

    #[tokio::test]
    async fn test_dir_sink_renames_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DirSinkFactory::new(dir.path());
        let sink = factory.create_sink("report.pdf", "application/pdf").await.unwrap();
        let mut writer = OrderedWriter::new(sink, 2, 4);
        writer.write(1, b"world".to_vec()).await.unwrap();
        writer.write(0, b"hello ".to_vec()).await.unwrap();
        let summary = writer.finish().await.unwrap();

        let path = dir.path().join("report.pdf");
        assert_eq!(summary.output, SinkOutput::File(path.clone()));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        // Only the published file remains.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    async fn write_through(factory: &DirSinkFactory, name: &str, body: &[u8]) -> SinkOutput {
        let sink = factory.create_sink(name, "text/plain").await.unwrap();
        let mut writer = OrderedWriter::new(sink, 1, 4);
        writer.write(0, body.to_vec()).await.unwrap();
        writer.finish().await.unwrap().output
    }

    #[tokio::test]
    async fn test_dir_sink_keeps_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"mine").unwrap();
        std::fs::write(dir.path().join("notes (1).txt"), b"also mine").unwrap();

        let factory = DirSinkFactory::new(dir.path());
        let output = write_through(&factory, "notes.txt", b"downloaded").await;
        let path = dir.path().join("notes (2).txt");
        assert_eq!(output, SinkOutput::File(path.clone()));
        assert_eq!(std::fs::read(&path).unwrap(), b"downloaded");
        assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"mine");
    }

    #[tokio::test]
    async fn test_dir_sink_overwrite_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        std::fs::write(&path, b"old").unwrap();

        let factory = DirSinkFactory::new(dir.path()).overwrite(true);
        let output = write_through(&factory, "notes.txt", b"new").await;
        assert_eq!(output, SinkOutput::File(path.clone()));
        assert_eq!(std::fs::read(&path).unwrap(), b"new");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_output_path_without_extension() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            output_path(dir.path(), "README", false).await.unwrap(),
            dir.path().join("README")
        );
        std::fs::write(dir.path().join("README"), b"x").unwrap();
        assert_eq!(
            output_path(dir.path(), "README", false).await.unwrap(),
            dir.path().join("README (1)")
        );
    }

    #[tokio::test]
    async fn test_dir_sink_abort_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DirSinkFactory::new(dir.path());
        let sink = factory.create_sink("big.iso", "application/octet-stream").await.unwrap();
        let mut writer = OrderedWriter::new(sink, 3, 4);
        writer.write(0, vec![0; 1024]).await.unwrap();
        writer.abort().await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\a.txt"), "a.txt");
        assert_eq!(sanitize_file_name("what?.txt"), "what_.txt");
        assert_eq!(sanitize_file_name(".."), "download");
        assert_eq!(sanitize_file_name(""), "download");
    }
}
