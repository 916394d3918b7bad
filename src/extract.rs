//! Change detection and document extraction from the content schema.
//!
//! A film work is considered changed when its own row, a linked person, or a
//! linked genre was modified inside the watermark window. The union of those
//! IDs is then expanded into denormalized documents, page by page, ordered by
//! film work ID so every page can be re-fetched on its own after a retry.

use crate::backoff::Backoff;
use crate::error::EtlError;
use crate::models::{DocumentBatch, MovieDocument, PersonRef};
use crate::state::Watermark;
use log::{debug, info};
use sqlx::PgPool;
use sqlx::types::Json;
use std::collections::HashSet;
use std::future::Future;
use uuid::Uuid;

pub const DEFAULT_PAGE_SIZE: usize = 5000;

/// Read access to the relational content store.
pub trait MovieStore {
    /// Film works whose own row changed inside the window.
    fn films_modified(
        &self,
        window: &Watermark,
    ) -> impl Future<Output = Result<Vec<Uuid>, EtlError>> + Send;

    /// Film works linked to a person that changed inside the window.
    fn films_by_modified_persons(
        &self,
        window: &Watermark,
    ) -> impl Future<Output = Result<Vec<Uuid>, EtlError>> + Send;

    /// Film works linked to a genre that changed inside the window.
    fn films_by_modified_genres(
        &self,
        window: &Watermark,
    ) -> impl Future<Output = Result<Vec<Uuid>, EtlError>> + Send;

    /// Up to `limit` documents for `ids`, ordered by ID, starting after `after`.
    fn movie_documents(
        &self,
        ids: &[Uuid],
        after: Option<Uuid>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<MovieDocument>, EtlError>> + Send;
}

/// Deduplicated film work IDs touched in one window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub ids: Vec<Uuid>,
    pub direct: usize,
    pub via_persons: usize,
    pub via_genres: usize,
}

impl ChangeSet {
    pub fn from_sources(direct: Vec<Uuid>, via_persons: Vec<Uuid>, via_genres: Vec<Uuid>) -> Self {
        let counts = (direct.len(), via_persons.len(), via_genres.len());
        let unique: HashSet<Uuid> = direct
            .into_iter()
            .chain(via_persons)
            .chain(via_genres)
            .collect();
        let mut ids: Vec<Uuid> = unique.into_iter().collect();
        ids.sort_unstable();

        Self {
            ids,
            direct: counts.0,
            via_persons: counts.1,
            via_genres: counts.2,
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

pub struct ChangeExtractor<'a, M> {
    store: &'a M,
    backoff: Backoff,
    page_size: usize,
}

impl<'a, M: MovieStore> ChangeExtractor<'a, M> {
    pub fn new(store: &'a M, backoff: Backoff) -> Self {
        Self {
            store,
            backoff,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Query the three change sources, each under its own retry budget.
    pub async fn changed_ids(&self, window: &Watermark) -> Result<ChangeSet, EtlError> {
        let store = self.store;

        let direct = self
            .backoff
            .retry("films_modified", || store.films_modified(window))
            .await?;
        let via_persons = self
            .backoff
            .retry("films_by_modified_persons", || {
                store.films_by_modified_persons(window)
            })
            .await?;
        let via_genres = self
            .backoff
            .retry("films_by_modified_genres", || {
                store.films_by_modified_genres(window)
            })
            .await?;

        let changes = ChangeSet::from_sources(direct, via_persons, via_genres);
        info!(
            "{} film works changed ({} direct, {} via persons, {} via genres)",
            changes.len(),
            changes.direct,
            changes.via_persons,
            changes.via_genres
        );
        Ok(changes)
    }

    /// Compute the change set and return a pull-driven sequence of document pages.
    ///
    /// An empty change set yields a sequence that is already exhausted and issues
    /// no further queries.
    pub async fn extract(self, window: &Watermark) -> Result<DocumentBatches<'a, M>, EtlError> {
        let changes = self.changed_ids(window).await?;
        Ok(DocumentBatches::new(
            self.store,
            self.backoff,
            changes.ids,
            self.page_size,
        ))
    }
}

/// Finite, non-restartable sequence of document pages.
pub struct DocumentBatches<'a, M> {
    store: &'a M,
    backoff: Backoff,
    ids: Vec<Uuid>,
    page_size: usize,
    after: Option<Uuid>,
    finished: bool,
    pages: usize,
}

impl<'a, M: MovieStore> DocumentBatches<'a, M> {
    fn new(store: &'a M, backoff: Backoff, ids: Vec<Uuid>, page_size: usize) -> Self {
        let finished = ids.is_empty();
        Self {
            store,
            backoff,
            ids,
            page_size: page_size.max(1),
            after: None,
            finished,
            pages: 0,
        }
    }

    /// Number of distinct film works this sequence covers.
    pub fn total_ids(&self) -> usize {
        self.ids.len()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Fetch the next page, or `None` once the result set is exhausted.
    ///
    /// A page shorter than the page size ends the sequence without another query;
    /// a full page is followed by one more fetch, which may come back empty.
    pub async fn next_batch(&mut self) -> Result<Option<DocumentBatch>, EtlError> {
        if self.finished {
            return Ok(None);
        }

        let store = self.store;
        let ids = self.ids.as_slice();
        let after = self.after;
        let limit = self.page_size;

        let page = self
            .backoff
            .retry("movie_documents", move || {
                store.movie_documents(ids, after, limit)
            })
            .await?;

        if page.len() < self.page_size {
            self.finished = true;
        }

        let Some(last) = page.last() else {
            debug!("document page {} came back empty", self.pages + 1);
            self.finished = true;
            return Ok(None);
        };

        self.after = Some(last.id);
        self.pages += 1;
        debug!(
            "document page {}: {} documents (finished: {})",
            self.pages,
            page.len(),
            self.finished
        );
        Ok(Some(DocumentBatch::new(page)))
    }
}

/// `MovieStore` over the `content` schema in Postgres.
#[derive(Clone)]
pub struct PgMovieStore {
    pool: PgPool,
}

impl PgMovieStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn ids_in_window(&self, query: &str, window: &Watermark) -> Result<Vec<Uuid>, EtlError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(query)
            .bind(window.last_extracted_time)
            .bind(window.current_time)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}

impl MovieStore for PgMovieStore {
    async fn films_modified(&self, window: &Watermark) -> Result<Vec<Uuid>, EtlError> {
        self.ids_in_window(FILMS_MODIFIED_QUERY, window).await
    }

    async fn films_by_modified_persons(&self, window: &Watermark) -> Result<Vec<Uuid>, EtlError> {
        self.ids_in_window(FILMS_BY_PERSONS_QUERY, window).await
    }

    async fn films_by_modified_genres(&self, window: &Watermark) -> Result<Vec<Uuid>, EtlError> {
        self.ids_in_window(FILMS_BY_GENRES_QUERY, window).await
    }

    async fn movie_documents(
        &self,
        ids: &[Uuid],
        after: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<MovieDocument>, EtlError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows: Vec<MovieRow> = sqlx::query_as::<_, MovieRow>(MOVIE_DOCUMENTS_QUERY)
            .bind(ids)
            .bind(after)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(MovieDocument::from).collect())
    }
}

#[derive(sqlx::FromRow)]
struct MovieRow {
    id: Uuid,
    title: String,
    description: Option<String>,
    imdb_rating: Option<f64>,
    director: Vec<String>,
    actors_names: Vec<String>,
    writers_names: Vec<String>,
    actors: Json<Vec<PersonRef>>,
    writers: Json<Vec<PersonRef>>,
    genre: Vec<String>,
}

impl From<MovieRow> for MovieDocument {
    fn from(row: MovieRow) -> Self {
        let mut actors = row.actors.0;
        let mut writers = row.writers.0;
        actors.sort();
        writers.sort();

        MovieDocument {
            id: row.id,
            title: row.title,
            description: row.description,
            imdb_rating: row.imdb_rating,
            director: row.director,
            actors_names: row.actors_names,
            writers_names: row.writers_names,
            actors,
            writers,
            genre: row.genre,
        }
    }
}

const FILMS_MODIFIED_QUERY: &str = r#"
    SELECT fw.id
    FROM content.film_work fw
    WHERE fw.modified > $1
      AND fw.modified <= $2
"#;

const FILMS_BY_PERSONS_QUERY: &str = r#"
    SELECT DISTINCT pfw.film_work_id
    FROM content.person_film_work pfw
    JOIN content.person p ON p.id = pfw.person_id
    WHERE p.modified > $1
      AND p.modified <= $2
"#;

const FILMS_BY_GENRES_QUERY: &str = r#"
    SELECT DISTINCT gfw.film_work_id
    FROM content.genre_film_work gfw
    JOIN content.genre g ON g.id = gfw.genre_id
    WHERE g.modified > $1
      AND g.modified <= $2
"#;

// Keyset paging: each page re-runs the aggregation, so pages are not one snapshot.
// A row changed between pages is picked up again by the next window.
const MOVIE_DOCUMENTS_QUERY: &str = r#"
    SELECT
        fw.id,
        fw.title::text AS title,
        fw.description,
        fw.rating AS imdb_rating,
        COALESCE(
            ARRAY_AGG(DISTINCT p.full_name::text) FILTER (WHERE pfw.role = 'director'),
            '{}'::text[]
        ) AS director,
        COALESCE(
            ARRAY_AGG(DISTINCT p.full_name::text) FILTER (WHERE pfw.role = 'actor'),
            '{}'::text[]
        ) AS actors_names,
        COALESCE(
            ARRAY_AGG(DISTINCT p.full_name::text) FILTER (WHERE pfw.role = 'writer'),
            '{}'::text[]
        ) AS writers_names,
        COALESCE(
            JSONB_AGG(DISTINCT JSONB_BUILD_OBJECT('id', p.id, 'name', p.full_name))
                FILTER (WHERE p.id IS NOT NULL AND pfw.role = 'actor'),
            '[]'::jsonb
        ) AS actors,
        COALESCE(
            JSONB_AGG(DISTINCT JSONB_BUILD_OBJECT('id', p.id, 'name', p.full_name))
                FILTER (WHERE p.id IS NOT NULL AND pfw.role = 'writer'),
            '[]'::jsonb
        ) AS writers,
        COALESCE(
            ARRAY_AGG(DISTINCT g.name::text) FILTER (WHERE g.name IS NOT NULL),
            '{}'::text[]
        ) AS genre
    FROM content.film_work fw
    LEFT JOIN content.person_film_work pfw ON pfw.film_work_id = fw.id
    LEFT JOIN content.person p ON p.id = pfw.person_id
    LEFT JOIN content.genre_film_work gfw ON gfw.film_work_id = fw.id
    LEFT JOIN content.genre g ON g.id = gfw.genre_id
    WHERE fw.id = ANY($1)
      AND ($2::uuid IS NULL OR fw.id > $2)
    GROUP BY fw.id
    ORDER BY fw.id
    LIMIT $3
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_set_collapses_duplicates_across_sources() {
        let shared = Uuid::new_v4();
        let by_person = Uuid::new_v4();
        let by_genre = Uuid::new_v4();

        let changes = ChangeSet::from_sources(
            vec![shared],
            vec![shared, by_person],
            vec![by_genre, by_person],
        );

        assert_eq!(changes.len(), 3);
        assert_eq!(changes.direct, 1);
        assert_eq!(changes.via_persons, 2);
        assert_eq!(changes.via_genres, 2);
        for id in [shared, by_person, by_genre] {
            assert_eq!(changes.ids.iter().filter(|candidate| **candidate == id).count(), 1);
        }
    }

    #[test]
    fn empty_sources_give_empty_change_set() {
        let changes = ChangeSet::from_sources(Vec::new(), Vec::new(), Vec::new());
        assert!(changes.is_empty());
    }
}
