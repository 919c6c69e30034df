//! REST collection endpoints.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, patch},
    Json, Router,
};
use livesync_client::RemoteSource;
use livesync_engine::{error::validate_collection, Filter, QueryResponse, Record};
use serde_json::{Map, Value};

use crate::error::{AppError, Result};
use crate::AppState;

/// Create REST routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/rest/{collection}", get(query_handler).post(create_handler))
        .route(
            "/rest/{collection}/{id}",
            patch(update_handler).delete(delete_handler),
        )
}

/// Parse the optional `{field}=eq.{value}` parameter.
fn parse_filter(params: &HashMap<String, String>) -> Result<Option<Filter>> {
    let mut params = params.iter();
    let filter = match params.next() {
        Some((field, raw)) => Some(Filter::from_query_param(field, raw)?),
        None => None,
    };
    if params.next().is_some() {
        return Err(AppError::BadRequest(
            "at most one filter parameter is supported".to_string(),
        ));
    }
    Ok(filter)
}

/// GET /rest/{collection} - Records matching the optional filter.
async fn query_handler(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<QueryResponse>> {
    validate_collection(&collection)?;
    let filter = parse_filter(&params)?;

    let snapshot = state.store.query(&collection, filter.as_ref()).await?;

    tracing::debug!(
        collection = %collection,
        records = snapshot.records.len(),
        "Query answered"
    );

    Ok(Json(QueryResponse {
        records: snapshot.records,
        sequence: snapshot.sequence,
    }))
}

/// POST /rest/{collection} - Create a record.
async fn create_handler(
    State(state): State<AppState>,
    Path(collection): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Record>)> {
    validate_collection(&collection)?;
    let record = Record::from_value(body)?;

    state.store.insert(&collection, record.clone())?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// PATCH /rest/{collection}/{id} - Merge fields into a record.
async fn update_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
    Json(patch): Json<Map<String, Value>>,
) -> Result<Json<Record>> {
    validate_collection(&collection)?;
    let record = state.store.merge(&collection, &id, &patch)?;
    Ok(Json(record))
}

/// DELETE /rest/{collection}/{id} - Remove a record.
async fn delete_handler(
    State(state): State<AppState>,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    validate_collection(&collection)?;
    state.store.delete(&collection, &id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_filter() {
        let mut params = HashMap::new();
        assert_eq!(parse_filter(&params).unwrap(), None);

        params.insert("client_id".to_string(), "eq.X".to_string());
        assert_eq!(
            parse_filter(&params).unwrap(),
            Some(Filter::eq("client_id", "X").unwrap())
        );

        params.insert("status".to_string(), "eq.open".to_string());
        assert!(matches!(parse_filter(&params), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn rejects_other_operators() {
        let mut params = HashMap::new();
        params.insert("client_id".to_string(), "gt.X".to_string());
        assert!(matches!(parse_filter(&params), Err(AppError::Engine(_))));
    }
}
