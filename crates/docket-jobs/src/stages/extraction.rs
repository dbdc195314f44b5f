//! Text extraction: source object to durable plain text via OCR.

use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use docket_cache::Artifact;
use docket_core::{
    defaults, normalize_confidence, Document, Error, ExtractionMode, Result, SourceLocation,
    Stage, StageOutput,
};
use docket_services::OcrOutcome;

use super::{publish, StageExecutor};
use crate::context::PipelineContext;
use crate::large_file::{sha256_file, sha256_hex, LoadStrategy, PageSplitter};

/// Submits the source to the OCR engine and stores the resulting text.
///
/// Sources within the memory budget are read whole to fingerprint them.
/// Larger ones are streamed to scratch space, and sources above the engine's
/// hard limit are split on page breaks into parts that are OCRed one by one
/// and joined back together.
pub struct ExtractionStage;

async fn ocr(ctx: &PipelineContext, location: &SourceLocation) -> Result<OcrOutcome> {
    let job_id = ctx.ocr.service().submit(location).await?;
    debug!(
        subsystem = "jobs",
        component = "extraction",
        location = %location,
        ocr_job_id = %job_id,
        "OCR job submitted"
    );
    ctx.ocr.wait(&job_id).await
}

struct Extracted {
    text: String,
    pages: u32,
    confidence: Option<f32>,
    mode: ExtractionMode,
    source_sha256: String,
}

impl Extracted {
    fn single(outcome: OcrOutcome, mode: ExtractionMode, source_sha256: String) -> Self {
        Self {
            text: outcome.text,
            pages: outcome.pages,
            confidence: outcome.confidence.map(|c| normalize_confidence(Some(c))),
            mode,
            source_sha256,
        }
    }
}

async fn extract_split(ctx: &PipelineContext, document: &Document) -> Result<Extracted> {
    let location = &document.location;
    let scratch = ctx.config.large_file.scratch()?;
    let local = scratch.path().join("source.bin");
    ctx.objects.download_to(location, &local).await?;

    let splitter = PageSplitter::new(ctx.config.large_file.max_part_bytes());
    let split = splitter.split(&local, &scratch.path().join("parts")).await?;
    // The whole local copy is no longer needed once parts exist
    tokio::fs::remove_file(&local).await?;

    info!(
        subsystem = "jobs",
        component = "extraction",
        document_id = %document.id,
        parts = split.parts.len(),
        "Source above OCR limit, processing in parts"
    );

    let mut texts = Vec::with_capacity(split.parts.len());
    let mut pages = 0u32;
    let mut weighted = 0f64;
    let mut weighted_pages = 0u32;
    for (index, part) in split.parts.iter().enumerate() {
        let part_location = location.part(index);
        ctx.objects.upload_from(&part_location, &part.path).await?;
        let result = ocr(ctx, &part_location).await;
        if let Err(e) = ctx.objects.delete(&part_location).await {
            warn!(
                subsystem = "jobs",
                component = "extraction",
                location = %part_location,
                error = %e,
                "Failed to delete part object"
            );
        }
        let outcome = result?;

        pages += outcome.pages;
        if let Some(c) = outcome.confidence {
            weighted += f64::from(normalize_confidence(Some(c))) * f64::from(outcome.pages);
            weighted_pages += outcome.pages;
        }
        if !outcome.text.trim().is_empty() {
            texts.push(outcome.text);
        }
    }

    Ok(Extracted {
        text: texts.join(&defaults::PAGE_BREAK.to_string()),
        pages,
        confidence: (weighted_pages > 0).then(|| (weighted / f64::from(weighted_pages)) as f32),
        mode: ExtractionMode::Split {
            parts: split.parts.len(),
        },
        source_sha256: split.source_sha256,
    })
}

#[async_trait]
impl StageExecutor for ExtractionStage {
    fn stage(&self) -> Stage {
        Stage::Extraction
    }

    async fn execute(&self, ctx: &PipelineContext, document: &Document) -> Result<StageOutput> {
        let start = Instant::now();
        let location = &document.location;
        let size = ctx.objects.size(location).await?;
        if size == 0 {
            return Err(Error::Validation(format!("source {location} is empty")));
        }

        let strategy = ctx.config.large_file.plan(size);
        debug!(
            subsystem = "jobs",
            component = "extraction",
            document_id = %document.id,
            size_bytes = size,
            strategy = ?strategy,
            "Extraction strategy chosen"
        );

        let extracted = match strategy {
            LoadStrategy::InMemory => {
                let digest = sha256_hex(&ctx.objects.read(location).await?);
                Extracted::single(ocr(ctx, location).await?, ExtractionMode::InMemory, digest)
            }
            LoadStrategy::Streamed => {
                let scratch = ctx.config.large_file.scratch()?;
                let local = scratch.path().join("source.bin");
                ctx.objects.download_to(location, &local).await?;
                let digest = sha256_file(&local).await?;
                drop(scratch);
                Extracted::single(ocr(ctx, location).await?, ExtractionMode::Streamed, digest)
            }
            LoadStrategy::Split => extract_split(ctx, document).await?,
        };

        if extracted.text.trim().is_empty() {
            return Err(Error::Validation(format!(
                "OCR produced no text for {location}"
            )));
        }

        ctx.store
            .save_extracted_text(document.id, &extracted.text)
            .await?;
        publish(
            ctx,
            &ctx.cache.keys().text(document.id),
            Artifact::ExtractedText,
            &extracted.text,
        )
        .await;

        let characters = extracted.text.chars().count();
        info!(
            subsystem = "jobs",
            component = "extraction",
            document_id = %document.id,
            characters,
            pages = extracted.pages,
            duration_ms = start.elapsed().as_millis() as u64,
            "Text extracted"
        );

        Ok(StageOutput::Extraction {
            characters,
            pages: extracted.pages,
            mode: extracted.mode,
            confidence: extracted.confidence,
            source_sha256: extracted.source_sha256,
        })
    }
}
