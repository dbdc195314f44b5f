//! Bounded-memory handling of large source files.
//!
//! Files within the worker memory budget are read whole. Larger files are
//! streamed to local scratch space. Files above the OCR engine's hard limit
//! are additionally split along page breaks into parts that each fit under
//! it. Scratch space is a temporary directory removed on drop, so local
//! copies disappear on success and on error alike.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

use docket_core::{defaults, Error, Result};

const READ_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct LargeFileConfig {
    /// Above this, never hold the file in memory.
    pub memory_budget_bytes: u64,
    /// Above this, the OCR engine refuses the file; split it.
    pub hard_limit_bytes: u64,
    /// Preferred upper size of one split part.
    pub part_target_bytes: u64,
    /// Parent directory for scratch space; the system temp dir if unset.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for LargeFileConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: defaults::WORKER_MEMORY_BUDGET_BYTES,
            hard_limit_bytes: defaults::OCR_HARD_LIMIT_BYTES,
            part_target_bytes: defaults::WORKER_MEMORY_BUDGET_BYTES,
            scratch_dir: None,
        }
    }
}

/// How the extraction stage loads a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStrategy {
    InMemory,
    Streamed,
    Split,
}

impl LargeFileConfig {
    pub fn new(memory_budget_bytes: u64, hard_limit_bytes: u64) -> Self {
        Self {
            memory_budget_bytes,
            hard_limit_bytes,
            part_target_bytes: memory_budget_bytes.min(hard_limit_bytes),
            scratch_dir: None,
        }
    }

    pub fn with_part_target(mut self, bytes: u64) -> Self {
        self.part_target_bytes = bytes;
        self
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn plan(&self, size_bytes: u64) -> LoadStrategy {
        if size_bytes > self.hard_limit_bytes {
            LoadStrategy::Split
        } else if size_bytes > self.memory_budget_bytes {
            LoadStrategy::Streamed
        } else {
            LoadStrategy::InMemory
        }
    }

    /// Largest part the splitter may produce.
    pub fn max_part_bytes(&self) -> u64 {
        self.part_target_bytes.min(self.hard_limit_bytes).max(1)
    }

    /// Fresh scratch directory, deleted when the returned handle drops.
    pub fn scratch(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("docket-");
        let dir = match &self.scratch_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 of a local file, read in fixed-size blocks.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUFFER_BYTES];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// One part file written by [`PageSplitter`].
#[derive(Debug, Clone, PartialEq)]
pub struct SplitPart {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub pages: u32,
}

#[derive(Debug, Clone)]
pub struct SplitOutput {
    pub parts: Vec<SplitPart>,
    /// Digest of the whole source, computed during the same pass.
    pub source_sha256: String,
}

/// Splits a file on page-break bytes into parts no larger than a limit.
///
/// Pages are never cut. A single page above the limit cannot be split and
/// is reported as resource exhaustion. Memory use is bounded by one page.
#[derive(Debug, Clone)]
pub struct PageSplitter {
    max_part_bytes: u64,
}

struct OpenPart {
    writer: BufWriter<File>,
    path: PathBuf,
    size_bytes: u64,
    pages: u32,
}

impl OpenPart {
    async fn finish(mut self) -> Result<SplitPart> {
        self.writer.flush().await?;
        Ok(SplitPart {
            path: self.path,
            size_bytes: self.size_bytes,
            pages: self.pages,
        })
    }
}

impl PageSplitter {
    pub fn new(max_part_bytes: u64) -> Self {
        Self {
            max_part_bytes: max_part_bytes.max(1),
        }
    }

    async fn open_part(dest_dir: &Path, index: usize) -> Result<OpenPart> {
        let path = dest_dir.join(format!("part-{index:04}.bin"));
        let file = File::create(&path).await?;
        Ok(OpenPart {
            writer: BufWriter::new(file),
            path,
            size_bytes: 0,
            pages: 0,
        })
    }

    pub async fn split(&self, src: &Path, dest_dir: &Path) -> Result<SplitOutput> {
        tokio::fs::create_dir_all(dest_dir).await?;
        let page_break = defaults::PAGE_BREAK as u8;
        let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, File::open(src).await?);
        let mut hasher = Sha256::new();
        let mut parts = Vec::new();
        let mut current: Option<OpenPart> = None;
        let mut page = Vec::new();
        let mut page_no = 0u64;

        loop {
            page.clear();
            let n = (&mut reader)
                .take(self.max_part_bytes + 1)
                .read_until(page_break, &mut page)
                .await?;
            if n == 0 {
                break;
            }
            page_no += 1;
            let len = page.len() as u64;
            if len > self.max_part_bytes {
                return Err(Error::ResourceExhausted(format!(
                    "page {page_no} of {} exceeds the {} byte part limit",
                    src.display(),
                    self.max_part_bytes
                )));
            }
            hasher.update(&page);

            let mut part = match current.take() {
                Some(full) if full.size_bytes + len > self.max_part_bytes => {
                    parts.push(full.finish().await?);
                    Self::open_part(dest_dir, parts.len()).await?
                }
                Some(open) => open,
                None => Self::open_part(dest_dir, parts.len()).await?,
            };
            part.writer.write_all(&page).await?;
            part.size_bytes += len;
            part.pages += 1;
            current = Some(part);
        }
        if let Some(done) = current.take() {
            parts.push(done.finish().await?);
        }

        debug!(
            subsystem = "jobs",
            component = "large_file",
            parts = parts.len(),
            max_part_bytes = self.max_part_bytes,
            "Source split along page breaks"
        );
        Ok(SplitOutput {
            parts,
            source_sha256: hex::encode(hasher.finalize()),
        })
    }
}
