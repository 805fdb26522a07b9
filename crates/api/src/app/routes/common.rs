use axum::response::Response;

use stocktake_core::AggregateId;
use stocktake_counting::{CountableItemId, SessionId};

use crate::app::errors;

pub fn parse_session_id(raw: &str) -> Result<SessionId, Response> {
    raw.parse::<AggregateId>()
        .map(SessionId::new)
        .map_err(|_| errors::invalid_id("session"))
}

pub fn parse_item_id(raw: &str) -> Result<CountableItemId, Response> {
    raw.parse().map_err(|_| errors::invalid_id("item"))
}
