use movies_etl::backoff::Backoff;
use movies_etl::config::{BackoffConfig, ElasticsearchConfig};
use movies_etl::models::{MovieDocument, PersonRef};
use movies_etl::search::schema::create_index_body;
use movies_etl::search::{DocumentSink, ElasticsearchService, IndexLoader};
use std::time::Duration;
use uuid::Uuid;

fn config_from_env(test_name: &str) -> Option<ElasticsearchConfig> {
    let base_url = match std::env::var("TEST_ELASTICSEARCH_URL") {
        Ok(url) if !url.is_empty() => url,
        _ => {
            eprintln!("skipping {test_name}: TEST_ELASTICSEARCH_URL not set");
            return None;
        }
    };

    Some(ElasticsearchConfig {
        base_url,
        index: format!("movies_test_{}", Uuid::new_v4().simple()),
        request_timeout: Duration::from_secs(30),
    })
}

fn loader_for(config: &ElasticsearchConfig) -> IndexLoader {
    let service = ElasticsearchService::new(config).expect("client builds");
    let backoff = Backoff::new(BackoffConfig {
        start_delay: Duration::from_millis(50),
        factor: 2.0,
        ceiling: Duration::from_millis(800),
    });
    IndexLoader::new(service, backoff)
}

fn loader_from_env(test_name: &str) -> Option<(IndexLoader, String)> {
    let config = config_from_env(test_name)?;
    Some((loader_for(&config), config.index))
}

fn sample(title: &str) -> MovieDocument {
    let actor = PersonRef {
        id: Uuid::new_v4(),
        name: "Sam Actor".to_string(),
    };
    MovieDocument {
        id: Uuid::new_v4(),
        title: title.to_string(),
        description: Some("A film used by the loader test".to_string()),
        imdb_rating: Some(7.4),
        director: vec!["Dee Director".to_string()],
        actors_names: vec![actor.name.clone()],
        writers_names: Vec::new(),
        actors: vec![actor],
        writers: Vec::new(),
        genre: vec!["Drama".to_string()],
    }
}

#[tokio::test]
async fn ensure_index_is_idempotent() {
    let Some((loader, index)) = loader_from_env("ensure index test") else {
        return;
    };

    loader.ensure_index(&index).await.expect("first ensure");
    loader.ensure_index(&index).await.expect("second ensure");

    assert!(loader.service().index_exists(&index).await.unwrap());
    assert_eq!(loader.service().count(&index).await.unwrap(), 0);
}

#[tokio::test]
async fn second_creator_of_an_index_is_told_it_already_exists() {
    let Some(config) = config_from_env("duplicate index creation test") else {
        return;
    };
    let service = ElasticsearchService::new(&config).expect("client builds");
    let body = create_index_body();

    assert!(service.create_index(&config.index, &body).await.unwrap());
    assert!(!service.create_index(&config.index, &body).await.unwrap());
}

#[tokio::test]
async fn separate_loaders_both_ensure_the_same_index() {
    let Some(config) = config_from_env("concurrent ensure index test") else {
        return;
    };
    let first = loader_for(&config);
    let second = loader_for(&config);

    let (a, b) = tokio::join!(
        first.ensure_index(&config.index),
        second.ensure_index(&config.index)
    );
    a.expect("first loader ensures index");
    b.expect("second loader ensures index");

    let loaded = second
        .load(&[sample("After race")], &config.index)
        .await
        .expect("second loader can write");
    assert_eq!(loaded.created, 1);
}

#[tokio::test]
async fn repeated_upserts_leave_one_document_per_id() {
    let Some((loader, index)) = loader_from_env("bulk upsert test") else {
        return;
    };
    loader.ensure_index(&index).await.expect("index ready");

    let mut documents = vec![sample("First"), sample("Second")];
    let first = loader.load(&documents, &index).await.expect("first load");
    assert_eq!(first.created, 2);

    let again = loader.load(&documents, &index).await.expect("second load");
    assert_eq!(again.total(), 2);
    assert_eq!(again.created, 0);

    documents[0].title = "First (restored)".to_string();
    let updated = loader.load(&documents[..1], &index).await.expect("update");
    assert_eq!(updated.updated, 1);

    assert_eq!(loader.service().count(&index).await.unwrap(), 2);
    let stored = loader
        .service()
        .get_source(&index, &documents[0].document_id())
        .await
        .unwrap()
        .expect("document stored");
    assert_eq!(stored["title"], "First (restored)");
    assert_eq!(stored["actors"][0]["name"], "Sam Actor");
}
