use crate::models::ConnectionStatus;
use crate::services::CallbackParams;
use crate::startup::AppState;
use axum::{
    extract::{Query, State},
    response::{IntoResponse, Redirect, Response},
};
use chrono::Utc;
use service_core::error::AppError;
use uuid::Uuid;

/// `GET /banking/callback`
///
/// Correlates the provider redirect with its pending connection, then sends
/// the browser on to the app. A successful link starts the first sync in the
/// background.
pub async fn oauth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Response, AppError> {
    let connection = state.callback.handle(params, Utc::now()).await?;

    let outcome = if connection.status == ConnectionStatus::Authorized {
        let engine = state.sync.clone();
        let connection_id = connection.id;
        tokio::spawn(async move {
            match engine.sync_connection(connection_id).await {
                Ok(reports) => tracing::info!(
                    connection_id = %connection_id,
                    accounts = reports.len(),
                    synced = reports.iter().filter(|r| r.is_success()).count(),
                    "Initial sync finished"
                ),
                Err(e) => tracing::warn!(
                    connection_id = %connection_id,
                    code = e.code(),
                    "Initial sync failed"
                ),
            }
        });
        "connected"
    } else {
        "failed"
    };

    let url = app_return_url(&state.app_return_url, outcome, connection.id);
    Ok(Redirect::to(&url).into_response())
}

fn app_return_url(base: &str, status: &str, connection_id: Uuid) -> String {
    let separator = if base.contains('?') { '&' } else { '?' };
    format!("{}{}status={}&connectionId={}", base, separator, status, connection_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_return_url_appends_to_existing_query() {
        let id = Uuid::nil();
        assert_eq!(
            app_return_url("https://app.example.com/banking", "connected", id),
            format!("https://app.example.com/banking?status=connected&connectionId={}", id)
        );
        assert_eq!(
            app_return_url("https://app.example.com/banking?tab=1", "failed", id),
            format!("https://app.example.com/banking?tab=1&status=failed&connectionId={}", id)
        );
    }
}
