use axum::{
    extract::{Path, State},
    http::StatusCode,
    Extension, Json,
};
use shareport_core::wire::TeamInfo;
use std::sync::Arc;

use super::{api_error, store_error, ApiError};
use crate::middleware::Caller;
use crate::models::ErrorResponse;
use crate::AppState;

/// Resolve a team slug for one of its members
#[utoipa::path(
    get,
    path = "/api/teams/{slug}",
    params(
        ("slug" = String, Path, description = "Team slug")
    ),
    responses(
        (status = 200, description = "Team", body = TeamInfo),
        (status = 401, description = "Not signed in", body = ErrorResponse),
        (status = 403, description = "Not a member", body = ErrorResponse),
        (status = 404, description = "Unknown team", body = ErrorResponse)
    ),
    tag = "teams"
)]
pub async fn get_team(
    State(state): State<Arc<AppState>>,
    Extension(caller): Extension<Caller>,
    Path(slug): Path<String>,
) -> Result<Json<TeamInfo>, ApiError> {
    let user_id = caller.require()?;

    let team = state
        .store
        .find_team(&slug)
        .await
        .map_err(store_error)?
        .ok_or_else(|| {
            api_error(
                StatusCode::NOT_FOUND,
                "TEAM_NOT_FOUND",
                format!("Team '{}' not found", slug),
            )
        })?;

    let member = state
        .store
        .is_team_member(team.id, user_id)
        .await
        .map_err(store_error)?;
    if !member {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "NOT_A_MEMBER",
            format!("Not a member of team '{}'", slug),
        ));
    }

    Ok(Json(TeamInfo {
        id: team.id,
        slug: team.slug,
        name: team.name,
    }))
}
