use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Output column order of the denormalized movie query.
pub const MOVIE_COLUMNS: &[&str] = &[
    "id",
    "title",
    "description",
    "imdb_rating",
    "director",
    "actors_names",
    "writers_names",
    "actors",
    "writers",
    "genre",
];

/// Participant reference nested inside a movie document.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersonRef {
    pub id: Uuid,
    pub name: String,
}

/// Flattened, search-ready representation of one film work.
///
/// Field names match the `movies` index mapping one to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovieDocument {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub imdb_rating: Option<f64>,
    pub director: Vec<String>,
    pub actors_names: Vec<String>,
    pub writers_names: Vec<String>,
    pub actors: Vec<PersonRef>,
    pub writers: Vec<PersonRef>,
    pub genre: Vec<String>,
}

impl MovieDocument {
    pub fn document_id(&self) -> String {
        self.id.to_string()
    }
}

/// One page of documents handed from the extractor to the loader.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentBatch {
    pub documents: Vec<MovieDocument>,
    pub columns: &'static [&'static str],
}

impl DocumentBatch {
    pub fn new(documents: Vec<MovieDocument>) -> Self {
        Self {
            documents,
            columns: MOVIE_COLUMNS,
        }
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn serialized_document_uses_declared_column_order() {
        let doc = MovieDocument {
            id: Uuid::nil(),
            title: "Star Wars".into(),
            description: None,
            imdb_rating: Some(8.6),
            director: vec!["George Lucas".into()],
            actors_names: vec!["Mark Hamill".into()],
            writers_names: vec![],
            actors: vec![PersonRef {
                id: Uuid::nil(),
                name: "Mark Hamill".into(),
            }],
            writers: vec![],
            genre: vec!["Sci-Fi".into()],
        };

        let value = serde_json::to_value(&doc).expect("serializes");
        let keys: Vec<&str> = match &value {
            Value::Object(map) => map.keys().map(String::as_str).collect(),
            other => panic!("expected object, got {other}"),
        };

        let mut expected: Vec<&str> = MOVIE_COLUMNS.to_vec();
        expected.sort_unstable();
        let mut actual = keys.clone();
        actual.sort_unstable();
        assert_eq!(actual, expected);
        assert_eq!(value["id"], "00000000-0000-0000-0000-000000000000");
        assert_eq!(value["description"], Value::Null);
    }
}
