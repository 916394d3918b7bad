//! Settings and mappings for the `movies` index.
//!
//! Text fields go through a combined English/Russian analyzer. The title also
//! carries a `raw` keyword sub-field for exact matching and sorting, and cast
//! members are nested objects so `{id, name}` pairs stay together in queries.

use serde_json::{Value, json};

pub const ANALYZER: &str = "ru_en";

pub fn index_settings() -> Value {
    json!({
        "refresh_interval": "1s",
        "analysis": {
            "filter": {
                "english_stop": { "type": "stop", "stopwords": "_english_" },
                "english_stemmer": { "type": "stemmer", "language": "english" },
                "english_possessive_stemmer": {
                    "type": "stemmer",
                    "language": "possessive_english"
                },
                "russian_stop": { "type": "stop", "stopwords": "_russian_" },
                "russian_stemmer": { "type": "stemmer", "language": "russian" }
            },
            "analyzer": {
                ANALYZER: {
                    "tokenizer": "standard",
                    "filter": [
                        "lowercase",
                        "english_stop",
                        "english_stemmer",
                        "english_possessive_stemmer",
                        "russian_stop",
                        "russian_stemmer"
                    ]
                }
            }
        }
    })
}

fn analyzed_text() -> Value {
    json!({ "type": "text", "analyzer": ANALYZER })
}

fn person_refs() -> Value {
    json!({
        "type": "nested",
        "dynamic": "strict",
        "properties": {
            "id": { "type": "keyword" },
            "name": analyzed_text()
        }
    })
}

pub fn index_mappings() -> Value {
    json!({
        "dynamic": "strict",
        "properties": {
            "id": { "type": "keyword" },
            "imdb_rating": { "type": "float" },
            "genre": { "type": "keyword" },
            "title": {
                "type": "text",
                "analyzer": ANALYZER,
                "fields": { "raw": { "type": "keyword" } }
            },
            "description": analyzed_text(),
            "director": analyzed_text(),
            "actors_names": analyzed_text(),
            "writers_names": analyzed_text(),
            "actors": person_refs(),
            "writers": person_refs()
        }
    })
}

/// Body for `PUT /{index}`.
pub fn create_index_body() -> Value {
    json!({
        "settings": index_settings(),
        "mappings": index_mappings()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MOVIE_COLUMNS;

    #[test]
    fn every_document_column_is_mapped() {
        let mappings = index_mappings();
        for column in MOVIE_COLUMNS {
            assert!(
                mappings["properties"].get(*column).is_some(),
                "column {column} missing from mapping"
            );
        }
    }

    #[test]
    fn title_has_raw_keyword_and_cast_is_nested() {
        let mappings = index_mappings();
        assert_eq!(mappings["properties"]["title"]["fields"]["raw"]["type"], "keyword");
        assert_eq!(mappings["properties"]["actors"]["type"], "nested");
        assert_eq!(mappings["properties"]["writers"]["properties"]["name"]["analyzer"], ANALYZER);
    }

    #[test]
    fn analyzer_covers_both_languages() {
        let settings = index_settings();
        let filters = settings["analysis"]["analyzer"][ANALYZER]["filter"]
            .as_array()
            .expect("filter list");
        for name in ["english_stop", "english_stemmer", "russian_stop", "russian_stemmer"] {
            assert!(filters.iter().any(|filter| filter == name), "{name} missing");
        }
    }
}
