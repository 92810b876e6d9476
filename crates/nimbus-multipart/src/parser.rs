//! Incremental multipart/form-data state machine
//!
//! The parser keeps a small rolling buffer. In `Data`, everything except the
//! last `delimiter.len() - 1` bytes is flushed to the part's target, so a
//! delimiter split across two chunks is always found on the next scan.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use nimbus_core::config::UploadConfig;
use nimbus_core::{validate_storage_key, NimbusError, NimbusResult};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::content_type::boundary_from_content_type;
use crate::headers::{parse_part_headers, PartHeaders};
use crate::{DEFAULT_MIME_TYPE, STORAGE_KEY_FIELD};

/// Size limits applied while parsing one request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParserLimits {
    pub max_header_bytes: usize,
    pub max_field_bytes: usize,
    pub max_file_bytes: Option<u64>,
    pub write_buffer_bytes: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: 16 * 1024,
            max_field_bytes: 1024 * 1024,
            max_file_bytes: None,
            write_buffer_bytes: 64 * 1024,
        }
    }
}

impl From<&UploadConfig> for ParserLimits {
    fn from(cfg: &UploadConfig) -> Self {
        Self {
            max_header_bytes: cfg.max_header_bytes,
            max_field_bytes: cfg.max_field_bytes,
            max_file_bytes: cfg.max_file_bytes,
            write_buffer_bytes: cfg.write_buffer_bytes,
        }
    }
}

/// A file part fully written to the staging directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    pub storage_key: String,
    /// Client filename, reduced to its final path component
    pub name: String,
    /// Form field the part was submitted under
    pub field_name: String,
    pub size: u64,
    pub mime_type: String,
    pub path: PathBuf,
}

/// Everything decoded from one request body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedUpload {
    /// File parts in body order
    pub files: Vec<StagedFile>,
    /// Text fields; repeated names keep every value in body order
    pub fields: HashMap<String, Vec<String>>,
}

impl ParsedUpload {
    /// First value of a text field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn field_values(&self, name: &str) -> &[String] {
        self.fields.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

type StartFn<'a> = Box<dyn FnMut(&str, &str) + Send + 'a>;
type ProgressFn<'a> = Box<dyn FnMut(&str, u64) + Send + 'a>;
type CompleteFn<'a> = Box<dyn FnMut(&StagedFile) + Send + 'a>;

/// Optional per-file observers.
#[derive(Default)]
pub struct UploadCallbacks<'a> {
    on_start: Option<StartFn<'a>>,
    on_progress: Option<ProgressFn<'a>>,
    on_complete: Option<CompleteFn<'a>>,
}

impl<'a> UploadCallbacks<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with `(storage_key, filename)` when a file part's headers are read.
    pub fn on_file_start(mut self, f: impl FnMut(&str, &str) + Send + 'a) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    /// Called with `(storage_key, bytes_written_so_far)` after each write.
    pub fn on_file_progress(mut self, f: impl FnMut(&str, u64) + Send + 'a) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    /// Called once the staged file has been flushed and closed.
    pub fn on_file_complete(mut self, f: impl FnMut(&StagedFile) + Send + 'a) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    fn file_started(&mut self, storage_key: &str, name: &str) {
        if let Some(f) = self.on_start.as_mut() {
            f(storage_key, name);
        }
    }

    fn file_progress(&mut self, storage_key: &str, written: u64) {
        if let Some(f) = self.on_progress.as_mut() {
            f(storage_key, written);
        }
    }

    fn file_completed(&mut self, file: &StagedFile) {
        if let Some(f) = self.on_complete.as_mut() {
            f(file);
        }
    }
}

/// Parser configured for one request's boundary.
#[derive(Debug, Clone)]
pub struct MultipartParser {
    boundary: String,
    staging_dir: PathBuf,
    limits: ParserLimits,
}

impl MultipartParser {
    /// Fails with `Malformed` when `content_type` carries no usable boundary.
    pub fn new(content_type: &str, staging_dir: impl Into<PathBuf>) -> NimbusResult<Self> {
        Ok(Self {
            boundary: boundary_from_content_type(content_type)?,
            staging_dir: staging_dir.into(),
            limits: ParserLimits::default(),
        })
    }

    pub fn with_limits(mut self, limits: ParserLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Consume `body`, staging file parts under the staging directory.
    ///
    /// On any error every file staged by this call is closed and removed.
    pub async fn parse<S>(
        &self,
        body: Option<S>,
        callbacks: &mut UploadCallbacks<'_>,
    ) -> NimbusResult<ParsedUpload>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let mut body =
            body.ok_or_else(|| NimbusError::Malformed("missing request body".into()))?;
        tokio::fs::create_dir_all(&self.staging_dir).await?;

        let mut run = ParseRun::new(self, callbacks);
        match run.drive(&mut body).await {
            Ok(()) => Ok(run.finish()),
            Err(e) => {
                warn!(boundary = %self.boundary, "multipart parse failed: {e}");
                run.abort().await;
                Err(e)
            }
        }
    }
}

/// Parse a request body given its `Content-Type` header value.
pub async fn parse_multipart_stream<S>(
    content_type: Option<&str>,
    body: Option<S>,
    staging_dir: &Path,
    limits: &ParserLimits,
    callbacks: &mut UploadCallbacks<'_>,
) -> NimbusResult<ParsedUpload>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    let content_type = content_type
        .ok_or_else(|| NimbusError::Malformed("missing Content-Type header".into()))?;
    MultipartParser::new(content_type, staging_dir)?
        .with_limits(limits.clone())
        .parse(body, callbacks)
        .await
}

struct FileSink {
    writer: BufWriter<File>,
    staged: StagedFile,
}

enum PartTarget {
    File(FileSink),
    Field { name: String, value: Vec<u8> },
    /// Empty file inputs: the body is drained and dropped
    Discard,
}

enum State {
    /// Scanning for the next delimiter; bytes before it are discarded
    Boundary,
    /// Accumulating a header block up to the blank line
    Headers,
    /// Streaming a part body until the next delimiter
    Data(PartTarget),
    Finished,
}

enum Step {
    Continue,
    NeedMore,
    Done,
}

struct ParseRun<'p, 'c, 'a> {
    parser: &'p MultipartParser,
    callbacks: &'c mut UploadCallbacks<'a>,
    /// `\r\n--boundary`; the CRLF belongs to the framing, not the part body
    delimiter: Vec<u8>,
    buf: BytesMut,
    state: State,
    /// Key supplied by a preceding `storageKey` field, consumed by the next file
    pending_key: Option<String>,
    staged: Vec<PathBuf>,
    output: ParsedUpload,
}

impl<'p, 'c, 'a> ParseRun<'p, 'c, 'a> {
    fn new(parser: &'p MultipartParser, callbacks: &'c mut UploadCallbacks<'a>) -> Self {
        // A leading CRLF lets the first delimiter match at the very start of the body
        let mut buf = BytesMut::with_capacity(8 * 1024);
        buf.extend_from_slice(b"\r\n");
        Self {
            parser,
            callbacks,
            delimiter: format!("\r\n--{}", parser.boundary).into_bytes(),
            buf,
            state: State::Boundary,
            pending_key: None,
            staged: Vec::new(),
            output: ParsedUpload::default(),
        }
    }

    async fn drive<S>(&mut self, body: &mut S) -> NimbusResult<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        loop {
            match self.step().await? {
                Step::Continue => {}
                Step::Done => return Ok(()),
                Step::NeedMore => match body.next().await {
                    Some(chunk) => self.buf.extend_from_slice(&chunk?),
                    None => {
                        warn!(
                            files = self.output.files.len(),
                            "request body ended before the closing boundary"
                        );
                        return Err(NimbusError::Truncated);
                    }
                },
            }
        }
    }

    async fn step(&mut self) -> NimbusResult<Step> {
        match self.state {
            State::Boundary => self.scan_boundary(),
            State::Headers => self.read_headers().await,
            State::Data(_) => self.read_data().await,
            State::Finished => Ok(Step::Done),
        }
    }

    fn scan_boundary(&mut self) -> NimbusResult<Step> {
        let Some(at) = find(&self.buf, &self.delimiter) else {
            // Preamble: keep only what could be the start of a delimiter
            let keep = self.delimiter.len() - 1;
            if self.buf.len() > keep {
                self.buf.advance(self.buf.len() - keep);
            }
            return Ok(Step::NeedMore);
        };

        let after = at + self.delimiter.len();
        if self.buf.len() < after + 2 {
            return Ok(Step::NeedMore);
        }
        if &self.buf[after..after + 2] == b"--" {
            // Anything after the closing delimiter is epilogue
            self.buf.clear();
            self.state = State::Finished;
            return Ok(Step::Done);
        }

        let Some(eol) = find(&self.buf[after..], b"\r\n") else {
            if self.buf.len() - after > self.parser.limits.max_header_bytes {
                return Err(NimbusError::Malformed("boundary line too long".into()));
            }
            return Ok(Step::NeedMore);
        };
        // RFC 2046 transport padding
        if !self.buf[after..after + eol]
            .iter()
            .all(|b| *b == b' ' || *b == b'\t')
        {
            return Err(NimbusError::Malformed("invalid boundary line".into()));
        }

        self.buf.advance(after + eol + 2);
        self.state = State::Headers;
        Ok(Step::Continue)
    }

    async fn read_headers(&mut self) -> NimbusResult<Step> {
        let max = self.parser.limits.max_header_bytes;
        let (block_len, consumed) = if self.buf.starts_with(b"\r\n") {
            (0, 2)
        } else {
            match find(&self.buf, b"\r\n\r\n") {
                Some(end) => (end, end + 4),
                None if self.buf.len() > max => {
                    return Err(NimbusError::Malformed(format!(
                        "part headers exceed {max} bytes"
                    )))
                }
                None => return Ok(Step::NeedMore),
            }
        };
        if block_len > max {
            return Err(NimbusError::Malformed(format!(
                "part headers exceed {max} bytes"
            )));
        }

        let headers = parse_part_headers(&self.buf[..block_len])?;
        self.buf.advance(consumed);
        let target = self.open_target(headers).await?;
        self.state = State::Data(target);
        Ok(Step::Continue)
    }

    async fn open_target(&mut self, headers: PartHeaders) -> NimbusResult<PartTarget> {
        match headers.filename {
            Some(ref filename) if filename.is_empty() => {
                debug!(field = %headers.name, "skipping empty file input");
                Ok(PartTarget::Discard)
            }
            Some(filename) => {
                let storage_key = self
                    .pending_key
                    .take()
                    .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
                let path = self.parser.staging_dir.join(format!("{storage_key}.part"));
                if self.staged.contains(&path) {
                    return Err(NimbusError::Malformed(format!(
                        "storage key {storage_key} used twice in one request"
                    )));
                }

                // Exclusive create: a part staged by another request is never shared
                let file = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&path)
                    .await
                    .map_err(|e| match e.kind() {
                        io::ErrorKind::AlreadyExists => NimbusError::Conflict(storage_key.clone()),
                        _ => NimbusError::Io(e),
                    })?;
                self.staged.push(path.clone());
                let writer =
                    BufWriter::with_capacity(self.parser.limits.write_buffer_bytes.max(1), file);

                let staged = StagedFile {
                    storage_key,
                    name: filename,
                    field_name: headers.name,
                    size: 0,
                    mime_type: headers
                        .content_type
                        .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
                    path,
                };
                debug!(
                    storage_key = %staged.storage_key,
                    name = %staged.name,
                    "file part started"
                );
                self.callbacks
                    .file_started(&staged.storage_key, &staged.name);
                Ok(PartTarget::File(FileSink { writer, staged }))
            }
            None => Ok(PartTarget::Field {
                name: headers.name,
                value: Vec::new(),
            }),
        }
    }

    async fn read_data(&mut self) -> NimbusResult<Step> {
        match find(&self.buf, &self.delimiter) {
            Some(at) => {
                // The delimiter stays in the buffer for scan_boundary
                let body = self.buf.split_to(at).freeze();
                self.write_part(&body).await?;
                self.finish_part().await?;
                Ok(Step::Continue)
            }
            None => {
                let safe = self
                    .buf
                    .len()
                    .saturating_sub(self.delimiter.len() - 1);
                if safe > 0 {
                    let body = self.buf.split_to(safe).freeze();
                    self.write_part(&body).await?;
                }
                Ok(Step::NeedMore)
            }
        }
    }

    async fn write_part(&mut self, data: &[u8]) -> NimbusResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        match &mut self.state {
            State::Data(PartTarget::File(sink)) => {
                let written = sink.staged.size + data.len() as u64;
                if let Some(max) = self.parser.limits.max_file_bytes {
                    if written > max {
                        return Err(NimbusError::Malformed(format!(
                            "file {} exceeds {max} bytes",
                            sink.staged.name
                        )));
                    }
                }
                sink.writer.write_all(data).await?;
                sink.staged.size = written;
                self.callbacks
                    .file_progress(&sink.staged.storage_key, written);
            }
            State::Data(PartTarget::Field { name, value }) => {
                let max = self.parser.limits.max_field_bytes;
                if value.len() + data.len() > max {
                    return Err(NimbusError::Malformed(format!(
                        "field {name} exceeds {max} bytes"
                    )));
                }
                value.extend_from_slice(data);
            }
            State::Data(PartTarget::Discard) => {}
            State::Boundary | State::Headers | State::Finished => {}
        }
        Ok(())
    }

    async fn finish_part(&mut self) -> NimbusResult<()> {
        match std::mem::replace(&mut self.state, State::Boundary) {
            State::Data(PartTarget::File(FileSink { mut writer, staged })) => {
                writer.shutdown().await?;
                drop(writer);
                info!(
                    storage_key = %staged.storage_key,
                    name = %staged.name,
                    size = staged.size,
                    "file part staged"
                );
                self.callbacks.file_completed(&staged);
                self.output.files.push(staged);
            }
            State::Data(PartTarget::Field { name, value }) => {
                let value = String::from_utf8(value).map_err(|_| {
                    NimbusError::Malformed(format!("field {name} is not valid UTF-8"))
                })?;
                if name == STORAGE_KEY_FIELD {
                    validate_storage_key(&value)?;
                    self.pending_key = Some(value.clone());
                }
                self.output.fields.entry(name).or_default().push(value);
            }
            State::Data(PartTarget::Discard) => {}
            State::Boundary | State::Headers | State::Finished => {}
        }
        Ok(())
    }

    fn finish(self) -> ParsedUpload {
        info!(
            files = self.output.files.len(),
            fields = self.output.fields.len(),
            "multipart body parsed"
        );
        self.output
    }

    /// Close any open staged file and remove everything this run staged.
    ///
    /// If the parse future is dropped instead, the open file is still closed
    /// on drop; leftover parts are removed by failed-upload cleanup.
    async fn abort(mut self) {
        if let State::Data(PartTarget::File(FileSink { mut writer, staged })) =
            std::mem::replace(&mut self.state, State::Finished)
        {
            if let Err(e) = writer.shutdown().await {
                warn!(storage_key = %staged.storage_key, "failed to close staged part: {e}");
            }
        }
        for path in &self.staged {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "removed staged part"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), "failed to remove staged part: {e}"),
            }
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
