//! Incremental synchronization of the movie catalogue from Postgres into Elasticsearch.
//!
//! Each pass finds film works changed since the last committed watermark (directly,
//! or through a linked person or genre), rebuilds their denormalized documents and
//! upserts them in bulk. See [`pipeline::SyncPipeline`] for the run lifecycle.

pub mod backoff;
pub mod config;
pub mod db;
pub mod error;
pub mod extract;
pub mod models;
pub mod pipeline;
pub mod search;
pub mod state;

use crate::backoff::Backoff;
use crate::config::EtlConfig;
use crate::error::EtlError;
use crate::extract::PgMovieStore;
use crate::pipeline::{RunReport, SyncPipeline};
use crate::search::{ElasticsearchService, IndexLoader};
use crate::state::AnyCursorStore;
use env_logger::Env;
use std::sync::Once;

static LOGGER: Once = Once::new();

pub fn init_logger() {
    LOGGER.call_once(|| {
        env_logger::Builder::from_env(Env::default().default_filter_or("info,sqlx=warn")).init();
    });
}

pub type MoviesPipeline = SyncPipeline<PgMovieStore, IndexLoader, AnyCursorStore>;

/// Wire the production collaborators described by `config`.
pub async fn build_pipeline(config: &EtlConfig) -> Result<MoviesPipeline, EtlError> {
    let backoff = Backoff::new(config.backoff);
    let database_url = config.require_database_url()?;
    let pool = backoff
        .retry("connect_database", || db::connect(database_url))
        .await?;

    let cursor = AnyCursorStore::from_config(config, Some(&pool))?;
    let service = ElasticsearchService::new(&config.elasticsearch)?;
    let loader = IndexLoader::new(service, backoff);

    Ok(
        SyncPipeline::new(PgMovieStore::new(pool), loader, cursor, backoff)
            .with_index(config.elasticsearch.index.clone())
            .with_page_size(config.page_size),
    )
}

/// Run one synchronization pass configured from the environment.
///
/// This is the entry point for an external scheduler.
pub async fn run_sync() -> Result<RunReport, EtlError> {
    let config = EtlConfig::from_env()?;
    let pipeline = build_pipeline(&config).await?;
    pipeline.run_once().await
}

#[cfg_attr(not(test), allow(dead_code))]
pub mod test_support {
    use chrono::{DateTime, Utc};
    use sqlx::PgPool;
    use uuid::Uuid;

    pub use database::{TestDatabase, TestDatabaseError};

    /// Helpers for seeding the `content` schema with explicit modification times.
    pub struct TestFixtures<'a> {
        pool: &'a PgPool,
    }

    impl<'a> TestFixtures<'a> {
        pub fn new(pool: &'a PgPool) -> Self {
            Self { pool }
        }

        pub async fn insert_film(
            &self,
            title: &str,
            rating: Option<f64>,
            modified: DateTime<Utc>,
        ) -> Result<Uuid, sqlx::Error> {
            let id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO content.film_work (id, title, rating, type, created, modified) VALUES ($1, $2, $3, 'movie', $4, $4)",
            )
            .bind(id)
            .bind(title)
            .bind(rating)
            .bind(modified)
            .execute(self.pool)
            .await?;
            Ok(id)
        }

        pub async fn insert_person(
            &self,
            full_name: &str,
            modified: DateTime<Utc>,
        ) -> Result<Uuid, sqlx::Error> {
            let id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO content.person (id, full_name, created, modified) VALUES ($1, $2, $3, $3)",
            )
            .bind(id)
            .bind(full_name)
            .bind(modified)
            .execute(self.pool)
            .await?;
            Ok(id)
        }

        pub async fn insert_genre(
            &self,
            name: &str,
            modified: DateTime<Utc>,
        ) -> Result<Uuid, sqlx::Error> {
            let id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO content.genre (id, name, created, modified) VALUES ($1, $2, $3, $3)",
            )
            .bind(id)
            .bind(name)
            .bind(modified)
            .execute(self.pool)
            .await?;
            Ok(id)
        }

        pub async fn link_person(
            &self,
            film_work_id: Uuid,
            person_id: Uuid,
            role: &str,
        ) -> Result<(), sqlx::Error> {
            sqlx::query(
                "INSERT INTO content.person_film_work (id, film_work_id, person_id, role) VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(film_work_id)
            .bind(person_id)
            .bind(role)
            .execute(self.pool)
            .await?;
            Ok(())
        }

        pub async fn link_genre(
            &self,
            film_work_id: Uuid,
            genre_id: Uuid,
        ) -> Result<(), sqlx::Error> {
            sqlx::query(
                "INSERT INTO content.genre_film_work (id, film_work_id, genre_id) VALUES ($1, $2, $3)",
            )
            .bind(Uuid::new_v4())
            .bind(film_work_id)
            .bind(genre_id)
            .execute(self.pool)
            .await?;
            Ok(())
        }

        /// Set `modified` on a row of `content.{table}`.
        pub async fn touch(
            &self,
            table: &str,
            id: Uuid,
            modified: DateTime<Utc>,
        ) -> Result<(), sqlx::Error> {
            let table = match table {
                "film_work" | "person" | "genre" => table,
                other => panic!("unsupported table {other}"),
            };
            let sql = format!("UPDATE content.{table} SET modified = $1 WHERE id = $2");
            sqlx::query(&sql)
                .bind(modified)
                .bind(id)
                .execute(self.pool)
                .await?;
            Ok(())
        }
    }

    pub mod database {
        use crate::db::MIGRATOR;
        use log::LevelFilter;
        use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
        use sqlx::{ConnectOptions, PgPool};
        use testcontainers::core::error::TestcontainersError;
        use testcontainers::{ContainerAsync, runners::AsyncRunner};
        use testcontainers_modules::postgres::Postgres;
        use thiserror::Error;
        use tokio::runtime::Handle;
        use uuid::Uuid;

        #[derive(Debug, Error)]
        pub enum TestDatabaseError {
            #[error("TEST_DATABASE_URL not set")]
            MissingUrl,
            #[error("database error: {0}")]
            Sqlx(#[from] sqlx::Error),
            #[error("migration error: {0}")]
            Migration(#[from] sqlx::migrate::MigrateError),
            #[error("container error: {0}")]
            Container(#[from] TestcontainersError),
        }

        /// Ephemeral database for integration tests.
        ///
        /// Uses `TEST_DATABASE_URL` when set; otherwise starts a disposable Postgres
        /// container if `ETL_TEST_CONTAINERS=1`.
        pub struct TestDatabase {
            pool: Option<PgPool>,
            admin_options: PgConnectOptions,
            database_name: String,
            container: Option<ContainerAsync<Postgres>>,
        }

        impl TestDatabase {
            pub async fn new_from_env() -> Result<Self, TestDatabaseError> {
                if let Ok(url) = std::env::var("TEST_DATABASE_URL") {
                    if !url.is_empty() {
                        let options: PgConnectOptions = url.parse()?;
                        return Self::provision(options, None).await;
                    }
                }

                let containers_enabled = std::env::var("ETL_TEST_CONTAINERS")
                    .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
                    .unwrap_or(false);
                if !containers_enabled {
                    return Err(TestDatabaseError::MissingUrl);
                }

                let container = Postgres::default().start().await?;
                let host = container.get_host().await?.to_string();
                let port = container.get_host_port_ipv4(5432).await?;
                let admin_url = format!("postgres://postgres:postgres@{}:{}/postgres", host, port);
                let options: PgConnectOptions = admin_url.parse()?;

                Self::provision(options, Some(container)).await
            }

            async fn provision(
                base_options: PgConnectOptions,
                container: Option<ContainerAsync<Postgres>>,
            ) -> Result<Self, TestDatabaseError> {
                let base_options = base_options.log_statements(LevelFilter::Off);
                let base_name = base_options
                    .get_database()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "postgres".to_string());

                let admin_options = base_options.clone().database("postgres");
                let admin_pool = PgPoolOptions::new()
                    .max_connections(1)
                    .connect_with(admin_options.clone())
                    .await?;

                let new_db_name = format!("{}_{}", base_name, Uuid::new_v4().simple());
                let create_sql = format!("CREATE DATABASE \"{}\" TEMPLATE template0", new_db_name);
                sqlx::query(&create_sql).execute(&admin_pool).await?;
                admin_pool.close().await;

                let pool = PgPoolOptions::new()
                    .max_connections(5)
                    .connect_with(base_options.clone().database(&new_db_name))
                    .await?;

                MIGRATOR.run(&pool).await?;

                Ok(Self {
                    pool: Some(pool),
                    admin_options,
                    database_name: new_db_name,
                    container,
                })
            }

            pub fn pool(&self) -> &PgPool {
                self.pool.as_ref().expect("test database pool is available")
            }

            pub fn pool_clone(&self) -> PgPool {
                self.pool().clone()
            }

            /// Close pool connections and drop the ephemeral database.
            pub async fn close(mut self) -> Result<(), TestDatabaseError> {
                if let Some(pool) = self.pool.take() {
                    pool.close().await;
                }

                drop_database_with_fallback(self.admin_options.clone(), &self.database_name)
                    .await?;

                if let Some(container) = self.container.take() {
                    drop(container);
                }

                Ok(())
            }
        }

        async fn drop_database_with_fallback(
            admin_options: PgConnectOptions,
            database_name: &str,
        ) -> Result<(), sqlx::Error> {
            let admin_pool = PgPoolOptions::new()
                .max_connections(1)
                .connect_with(admin_options)
                .await?;

            let drop_force = format!("DROP DATABASE \"{}\" WITH (FORCE)", database_name);
            match sqlx::query(&drop_force).execute(&admin_pool).await {
                Ok(_) => Ok(()),
                Err(err) if force_drop_unsupported(&err) => {
                    let drop_sql = format!("DROP DATABASE \"{}\"", database_name);
                    sqlx::query(&drop_sql).execute(&admin_pool).await?;
                    Ok(())
                }
                Err(err) => Err(err),
            }
        }

        fn force_drop_unsupported(err: &sqlx::Error) -> bool {
            matches!(
                err,
                sqlx::Error::Database(db_err)
                    if db_err
                        .code()
                        .map(|code| code == "42601" || code == "0A000")
                        .unwrap_or(false)
            )
        }

        impl Drop for TestDatabase {
            fn drop(&mut self) {
                if let Some(pool) = self.pool.take() {
                    let admin_options = self.admin_options.clone();
                    let db_name = self.database_name.clone();
                    if let Ok(handle) = Handle::try_current() {
                        handle.spawn(async move {
                            pool.close().await;
                            let _ = drop_database_with_fallback(admin_options, &db_name).await;
                        });
                    }
                }

                if let Some(container) = self.container.take() {
                    drop(container);
                }
            }
        }
    }
}
