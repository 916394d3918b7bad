//! One synchronization pass from Postgres into the search index.
//!
//! A pass moves through `Idle -> WatermarkCaptured -> Extracting <-> Loading ->
//! Committed`. Batches are pulled one at a time and loaded before the next page is
//! requested. The new baseline is written only after the last batch loads; any
//! error leaves the stored watermark untouched so the next pass re-covers the window.

use crate::backoff::Backoff;
use crate::error::EtlError;
use crate::extract::{ChangeExtractor, DEFAULT_PAGE_SIZE, MovieStore};
use crate::search::{DocumentSink, LoadSummary};
use crate::state::{CursorStore, LAST_EXTRACTED_KEY, Watermark, format_timestamp};
use chrono::{DateTime, Utc};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::fmt;

pub const DEFAULT_INDEX: &str = "movies";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    WatermarkCaptured,
    Extracting,
    Loading,
    Committed,
    Failed,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SyncPhase::Idle => "idle",
            SyncPhase::WatermarkCaptured => "watermark_captured",
            SyncPhase::Extracting => "extracting",
            SyncPhase::Loading => "loading",
            SyncPhase::Committed => "committed",
            SyncPhase::Failed => "failed",
        })
    }
}

/// Outcome of a successful pass.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub watermark: Watermark,
    pub changed_ids: usize,
    pub batches: usize,
    pub documents: usize,
    pub loaded: LoadSummary,
}

impl RunReport {
    fn new(watermark: Watermark, changed_ids: usize) -> Self {
        Self {
            watermark,
            changed_ids,
            batches: 0,
            documents: 0,
            loaded: LoadSummary::default(),
        }
    }

    fn record(&mut self, documents: usize, summary: LoadSummary) {
        self.batches += 1;
        self.documents += documents;
        self.loaded.created += summary.created;
        self.loaded.updated += summary.updated;
        self.loaded.unchanged += summary.unchanged;
    }
}

/// Orchestrates extraction, loading and the watermark commit.
///
/// Collaborators are injected; the pipeline owns no global state. It does not
/// guard against overlapping passes, which the scheduler is expected to prevent.
pub struct SyncPipeline<M, S, C> {
    movies: M,
    sink: S,
    cursor: C,
    backoff: Backoff,
    index: String,
    page_size: usize,
    last_phase: Mutex<SyncPhase>,
}

impl<M, S, C> SyncPipeline<M, S, C>
where
    M: MovieStore,
    S: DocumentSink,
    C: CursorStore,
{
    pub fn new(movies: M, sink: S, cursor: C, backoff: Backoff) -> Self {
        Self {
            movies,
            sink,
            cursor,
            backoff,
            index: DEFAULT_INDEX.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            last_phase: Mutex::new(SyncPhase::Idle),
        }
    }

    pub fn with_index(mut self, index: impl Into<String>) -> Self {
        self.index = index.into();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn movies(&self) -> &M {
        &self.movies
    }

    pub fn cursor(&self) -> &C {
        &self.cursor
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Phase the most recent pass finished in.
    pub fn last_phase(&self) -> SyncPhase {
        *self.last_phase.lock()
    }

    /// Run one pass with the window ending now.
    pub async fn run_once(&self) -> Result<RunReport, EtlError> {
        self.run_at(Utc::now()).await
    }

    /// Run one pass with the window ending at `now`.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<RunReport, EtlError> {
        let mut phase = SyncPhase::Idle;
        *self.last_phase.lock() = phase;

        let outcome = self.execute(now, &mut phase).await;
        match outcome {
            Ok(report) => {
                *self.last_phase.lock() = SyncPhase::Committed;
                info!(
                    "sync committed: {} changed, {} documents in {} batches; baseline now {}",
                    report.changed_ids,
                    report.documents,
                    report.batches,
                    format_timestamp(report.watermark.current_time)
                );
                Ok(report)
            }
            Err(err) => {
                *self.last_phase.lock() = SyncPhase::Failed;
                error!("sync failed while {phase}: {err}; watermark left unchanged");
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        now: DateTime<Utc>,
        phase: &mut SyncPhase,
    ) -> Result<RunReport, EtlError> {
        let cursor = &self.cursor;
        let watermark = self
            .backoff
            .retry("read_watermark", || Watermark::capture(cursor, now))
            .await?;
        advance(phase, SyncPhase::WatermarkCaptured);
        info!(
            "sync window ({}, {}]",
            format_timestamp(watermark.last_extracted_time),
            format_timestamp(watermark.current_time)
        );

        advance(phase, SyncPhase::Extracting);
        let mut batches = ChangeExtractor::new(&self.movies, self.backoff)
            .with_page_size(self.page_size)
            .extract(&watermark)
            .await?;
        let mut report = RunReport::new(watermark, batches.total_ids());

        while let Some(batch) = batches.next_batch().await? {
            advance(phase, SyncPhase::Loading);
            if report.batches == 0 {
                debug!("document columns: {}", batch.columns.join(", "));
                self.sink.ensure_index(&self.index).await?;
            }

            let summary = self.sink.load(&batch.documents, &self.index).await?;
            report.record(batch.len(), summary);
            info!(
                "batch {}: loaded {} documents into '{}' ({} of {} so far)",
                report.batches,
                batch.len(),
                self.index,
                report.documents,
                report.changed_ids
            );
            advance(phase, SyncPhase::Extracting);
        }

        if report.batches == 0 {
            info!("nothing changed in window; advancing baseline only");
        }

        let committed = format_timestamp(watermark.current_time);
        self.backoff
            .retry("commit_watermark", || cursor.set(LAST_EXTRACTED_KEY, &committed))
            .await?;
        advance(phase, SyncPhase::Committed);

        Ok(report)
    }
}

fn advance(phase: &mut SyncPhase, next: SyncPhase) {
    if *phase != next {
        debug!("sync phase {phase} -> {next}");
        *phase = next;
    }
}
