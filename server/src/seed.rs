//! Initial data loading.

use std::collections::BTreeMap;
use std::path::Path;

use livesync_client::MemorySource;
use livesync_engine::{error::validate_collection, Record};

use crate::error::{AppError, Result};

/// Parse a seed document: an object mapping collection names to record arrays.
pub fn parse_seed(text: &str) -> Result<BTreeMap<String, Vec<Record>>> {
    let collections: BTreeMap<String, Vec<Record>> =
        serde_json::from_str(text).map_err(|e| AppError::Seed(e.to_string()))?;
    for name in collections.keys() {
        validate_collection(name)?;
    }
    Ok(collections)
}

/// Load a seed file into the store. Returns the number of records loaded.
pub fn load_seed(path: &Path, store: &MemorySource) -> Result<usize> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| AppError::Seed(format!("{}: {}", path.display(), e)))?;

    let mut total = 0;
    for (collection, records) in parse_seed(&text)? {
        tracing::info!(collection = %collection, records = records.len(), "Seeded collection");
        total += records.len();
        store.seed(collection, records);
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_collections() {
        let seed = parse_seed(
            r#"{"projects": [{"id": "1", "title": "Education"}, {"id": 2, "title": "Water"}]}"#,
        )
        .unwrap();
        let projects = &seed["projects"];
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[1].id(), "2");
    }

    #[test]
    fn rejects_records_without_id() {
        assert!(matches!(
            parse_seed(r#"{"projects": [{"title": "Education"}]}"#),
            Err(AppError::Seed(_))
        ));
        assert!(matches!(
            parse_seed(r#"{"": []}"#),
            Err(AppError::Engine(_))
        ));
    }
}
