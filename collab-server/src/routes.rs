//! HTTP and WebSocket route handlers.
//!
//! The collaboration socket is served at
//! `/threat_models/{threat_model_id}/diagrams/{diagram_id}/ws` and, for
//! diagrams outside any threat model, `/diagrams/{diagram_id}/ws`. Identity
//! arrives in `x-user-*` headers set by the authenticating proxy in front of
//! this server.

use axum::{
    extract::{ws::WebSocketUpgrade, FromRequestParts, Path, State},
    http::{request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use collab_core::{Diagram, Role, User};
use serde_json::json;

use crate::connection::{handle_collab_socket, SessionTarget};
use crate::health;
use crate::hub::HubError;
use crate::validation::{validate_diagram_id, validate_threat_model_id};
use crate::AppState;

/// Header carrying the canonical user id.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the user's email.
pub const USER_EMAIL_HEADER: &str = "x-user-email";
/// Header carrying the user's display name.
pub const USER_NAME_HEADER: &str = "x-user-name";
/// Header carrying the identity provider name.
pub const USER_PROVIDER_HEADER: &str = "x-user-provider";

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

/// Build the application routes over `state`.
///
/// The binary adds metrics and the tower layers on top.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/health", get(health::readiness))
        .route(
            "/threat_models/{threat_model_id}/diagrams/{diagram_id}/ws",
            get(threat_model_diagram_ws),
        )
        .route("/diagrams/{diagram_id}/ws", get(diagram_ws))
        .route("/api/sessions", get(list_sessions))
        .route(
            "/api/diagrams/{diagram_id}",
            get(get_diagram).put(put_diagram),
        )
        .with_state(state)
}

/// The user making the request, taken from proxy-set headers.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub User);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        let provider_id = header_value(headers, USER_ID_HEADER)
            .ok_or_else(|| api_error(StatusCode::UNAUTHORIZED, "Authentication required"))?;

        let mut user = User::new(provider_id);
        if let Some(email) = header_value(headers, USER_EMAIL_HEADER) {
            user = user.with_email(email);
        }
        if let Some(name) = header_value(headers, USER_NAME_HEADER) {
            user = user.with_display_name(name);
        }
        if let Some(provider) = header_value(headers, USER_PROVIDER_HEADER) {
            user = user.with_provider(provider);
        }
        Ok(Self(user))
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

/// Collaboration socket for a diagram inside a threat model.
#[tracing::instrument(
    name = "collab_websocket_connect",
    skip(ws, state, user),
    fields(user_id = %user.0.user_id())
)]
async fn threat_model_diagram_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path((threat_model_id, diagram_id)): Path<(String, String)>,
    user: AuthenticatedUser,
) -> Response {
    upgrade(ws, state, threat_model_id, diagram_id, user.0).await
}

/// Collaboration socket for a diagram outside any threat model.
#[tracing::instrument(
    name = "collab_websocket_connect",
    skip(ws, state, user),
    fields(user_id = %user.0.user_id())
)]
async fn diagram_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(diagram_id): Path<String>,
    user: AuthenticatedUser,
) -> Response {
    upgrade(ws, state, String::new(), diagram_id, user.0).await
}

async fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    threat_model_id: String,
    diagram_id: String,
    user: User,
) -> Response {
    if let Err(e) = validate_diagram_id(&diagram_id).and(validate_threat_model_id(&threat_model_id))
    {
        return api_error(StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    let role = match resolve_role(&state, &user, &threat_model_id).await {
        Ok(role) => role,
        Err(rejection) => return rejection.into_response(),
    };

    if let Err(e) = state
        .hub
        .session_for(&diagram_id, &threat_model_id, &user)
        .await
    {
        return hub_error_response(&e).into_response();
    }
    state.hub.observe_user(&user);

    tracing::info!(
        diagram_id = %diagram_id,
        threat_model_id = %threat_model_id,
        role = role.as_str(),
        "Collaboration socket upgrade requested"
    );
    let target = SessionTarget {
        diagram_id,
        threat_model_id,
    };
    let hub = state.hub.clone();
    let config = state.connection.clone();
    ws.on_upgrade(move |socket| handle_collab_socket(socket, hub, target, user, role, config))
}

async fn resolve_role(
    state: &AppState,
    user: &User,
    threat_model_id: &str,
) -> Result<Role, ApiError> {
    if threat_model_id.is_empty() {
        return Ok(if state.hub.config().allow_unscoped_mutations {
            Role::Writer
        } else {
            Role::Reader
        });
    }
    match state.hub.authorization().role_for(user, threat_model_id).await {
        Ok(Some(role)) => Ok(role),
        Ok(None) => Err(api_error(
            StatusCode::FORBIDDEN,
            format!("No access to threat model {threat_model_id}"),
        )),
        Err(e) => {
            tracing::error!(threat_model_id = %threat_model_id, "Role lookup failed: {}", e);
            Err(api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "Authorization service unavailable",
            ))
        }
    }
}

/// Whether `user` may write diagrams in `threat_model_id`, or unscoped
/// diagrams when it is `None`.
async fn require_mutation(
    state: &AppState,
    user: &User,
    threat_model_id: Option<&str>,
) -> Result<(), ApiError> {
    let Some(threat_model_id) = threat_model_id.filter(|id| !id.is_empty()) else {
        return if state.hub.config().allow_unscoped_mutations {
            Ok(())
        } else {
            Err(api_error(
                StatusCode::FORBIDDEN,
                "Diagrams outside a threat model are read-only",
            ))
        };
    };
    match state.hub.authorization().role_for(user, threat_model_id).await {
        Ok(Some(role)) if role.can_mutate() => Ok(()),
        Ok(_) => Err(api_error(
            StatusCode::FORBIDDEN,
            "Insufficient permissions on threat model",
        )),
        Err(e) => {
            tracing::error!(threat_model_id = %threat_model_id, "Role lookup failed: {}", e);
            Err(api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "Authorization service unavailable",
            ))
        }
    }
}

fn hub_error_response(error: &HubError) -> ApiError {
    match error {
        HubError::DiagramNotFound(_) | HubError::ThreatModelMismatch { .. } => {
            api_error(StatusCode::NOT_FOUND, error.to_string())
        }
        HubError::Join(_) => api_error(StatusCode::FORBIDDEN, error.to_string()),
        HubError::Store(e) => {
            tracing::error!("Diagram store error: {}", e);
            api_error(StatusCode::SERVICE_UNAVAILABLE, "Diagram store unavailable")
        }
    }
}

/// List live collaboration sessions the caller may see.
///
/// Sessions inside a threat model are listed only for users holding a role
/// on it.
#[tracing::instrument(name = "list_sessions", skip(state, user), fields(user_id = %user.0.user_id()))]
async fn list_sessions(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> impl IntoResponse {
    let mut visible = Vec::new();
    for info in state.hub.active_sessions() {
        if info.threat_model_id.is_empty() {
            visible.push(info);
            continue;
        }
        match state
            .hub
            .authorization()
            .role_for(&user.0, &info.threat_model_id)
            .await
        {
            Ok(Some(_)) => visible.push(info),
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(threat_model_id = %info.threat_model_id, "Role lookup failed: {}", e);
            }
        }
    }
    Json(json!({ "sessions": visible }))
}

/// Get a diagram.
///
/// Sessions persist every accepted change, so the store holds the latest
/// state. Diagrams inside a threat model need a role on it.
#[tracing::instrument(name = "get_diagram", skip(state, user), fields(user_id = %user.0.user_id()))]
async fn get_diagram(
    State(state): State<AppState>,
    Path(diagram_id): Path<String>,
    user: AuthenticatedUser,
) -> Result<Json<Diagram>, ApiError> {
    validate_diagram_id(&diagram_id)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    let diagram = match state.hub.store().get(&diagram_id).await {
        Ok(diagram) => diagram,
        Err(e) if e.is_not_found() => return Err(api_error(StatusCode::NOT_FOUND, e.to_string())),
        Err(e) => {
            tracing::error!(diagram_id = %diagram_id, "Diagram load failed: {}", e);
            return Err(api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "Diagram store unavailable",
            ));
        }
    };
    if let Some(threat_model_id) = diagram.threat_model_id.as_deref() {
        resolve_role(&state, &user.0, threat_model_id).await?;
    }
    Ok(Json(diagram))
}

/// Create or replace a diagram.
///
/// Refused with 409 while a collaboration session is editing it.
#[tracing::instrument(name = "put_diagram", skip(state, user, diagram), fields(user_id = %user.0.user_id()))]
async fn put_diagram(
    State(state): State<AppState>,
    Path(diagram_id): Path<String>,
    user: AuthenticatedUser,
    Json(mut diagram): Json<Diagram>,
) -> Result<(StatusCode, Json<Diagram>), ApiError> {
    validate_diagram_id(&diagram_id)
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e.to_string()))?;
    if diagram.id.is_empty() {
        diagram.id.clone_from(&diagram_id);
    } else if diagram.id != diagram_id {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Diagram id in body does not match path",
        ));
    }

    if state.hub.session(&diagram_id).is_some() {
        return Err(api_error(
            StatusCode::CONFLICT,
            "Diagram is being edited in a collaboration session",
        ));
    }

    let stored = match state.hub.store().get(&diagram_id).await {
        Ok(stored) => Some(stored),
        Err(e) if e.is_not_found() => None,
        Err(e) => {
            tracing::error!(diagram_id = %diagram_id, "Diagram load failed: {}", e);
            return Err(api_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "Diagram store unavailable",
            ));
        }
    };

    require_mutation(&state, &user.0, diagram.threat_model_id.as_deref()).await?;
    if let Some(stored) = &stored {
        if stored.threat_model_id != diagram.threat_model_id {
            require_mutation(&state, &user.0, stored.threat_model_id.as_deref()).await?;
        }
    }

    // Sequence numbers belong to the server; a client cannot move them.
    diagram.update_vector = stored.map_or(0, |stored| stored.update_vector);
    diagram.modified_at = collab_core::current_timestamp_ms();
    state.hub.store().put(diagram.clone()).await.map_err(|e| {
        tracing::error!(diagram_id = %diagram_id, "Diagram save failed: {}", e);
        api_error(StatusCode::SERVICE_UNAVAILABLE, "Diagram store unavailable")
    })?;
    tracing::info!(diagram_id = %diagram_id, cells = diagram.cells.len(), "Diagram saved");
    Ok((StatusCode::OK, Json(diagram)))
}
