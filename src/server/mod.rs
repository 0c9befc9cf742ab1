//! warp filters exposing one POST route per webhook id at
//! `{path_prefix}/{webhook_id}`.
//!
//! Replies always carry an empty JSON object; the status code is the only
//! signal the remote server gets.


use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use warp::filters::path::Tail;
use warp::filters::BoxedFilter;
use warp::hyper::body::Bytes;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

use crate::Error;
use crate::Result;
use crate::WebhookDispatcher;

/// Header carrying the shared webhook token.
pub const API_KEY_HEADER_NAME: &str = "x-api-key";

/// POST filter dispatching to `dispatcher` with `ctx` forwarded to handlers.
///
/// Paths outside `prefix_segments` are rejected so the filter composes with
/// the host's other routes.
pub fn webhook_filter<C>(
    dispatcher: Arc<WebhookDispatcher<C>>,
    ctx: Arc<C>,
    prefix_segments: Vec<String>,
    max_body_bytes: u64,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone
where
    C: Send + Sync + 'static,
{
    let prefix = Arc::new(prefix_segments);
    let routed = warp::post().and(warp::path::tail()).and_then(move |tail: Tail| {
        let prefix = prefix.clone();
        async move { webhook_id_from_tail(&prefix, tail.as_str()).ok_or_else(warp::reject::not_found) }
    });

    // Unknown ids skip the body limit
    let unknown = {
        let dispatcher = dispatcher.clone();
        let ctx = ctx.clone();
        routed
            .clone()
            .and_then({
                let dispatcher = dispatcher.clone();
                move |webhook_id: String| {
                    let known = dispatcher.definitions().get(&webhook_id).is_some();
                    async move {
                        if known {
                            Err(warp::reject::not_found())
                        } else {
                            Ok(webhook_id)
                        }
                    }
                }
            })
            .and(warp::header::optional::<String>(API_KEY_HEADER_NAME))
            .and_then(move |webhook_id: String, api_key: Option<String>| {
                let dispatcher = dispatcher.clone();
                let ctx = ctx.clone();
                async move { Ok::<_, Rejection>(dispatch(dispatcher, ctx, webhook_id, api_key, Bytes::new()).await) }
            })
    };

    let known = routed
        .and(warp::header::optional::<String>(API_KEY_HEADER_NAME))
        .and(warp::body::content_length_limit(max_body_bytes))
        .and(warp::body::bytes())
        .and_then(move |webhook_id: String, api_key: Option<String>, body: Bytes| {
            let dispatcher = dispatcher.clone();
            let ctx = ctx.clone();
            async move { Ok::<_, Rejection>(dispatch(dispatcher, ctx, webhook_id, api_key, body).await) }
        });

    unknown.or(known).unify()
}

/// The webhook id when `tail` is exactly the prefix followed by one segment.
fn webhook_id_from_tail(
    prefix: &[String],
    tail: &str,
) -> Option<String> {
    let mut segments = tail.split('/').filter(|s| !s.is_empty());
    for expected in prefix {
        if segments.next()? != expected {
            return None;
        }
    }
    let webhook_id = segments.next()?;
    if segments.next().is_some() {
        return None;
    }
    Some(webhook_id.to_string())
}

async fn dispatch<C>(
    dispatcher: Arc<WebhookDispatcher<C>>,
    ctx: Arc<C>,
    webhook_id: String,
    api_key: Option<String>,
    body: Bytes,
) -> Response
where
    C: Send + Sync + 'static,
{
    // Detached so a dropped connection cannot cut a handler short
    let task = tokio::spawn(async move {
        dispatcher
            .handle(&webhook_id, api_key.as_deref(), &body, ctx.as_ref())
            .await
    });

    let status = match task.await {
        Ok(Ok(_)) => StatusCode::OK,
        Ok(Err(e)) => StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::BAD_REQUEST),
        Err(e) => {
            error!("webhook dispatch task failed: {:?}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    empty_reply(status)
}

fn empty_reply(status: StatusCode) -> Response {
    warp::reply::with_status(warp::reply::json(&json!({})), status).into_response()
}

/// Serve `routes` on `addr` until `shutdown_signal` fires.
///
/// # Errors
/// [`Error::Fatal`] when the address cannot be bound.
pub async fn serve(
    routes: BoxedFilter<(Response,)>,
    addr: SocketAddr,
    mut shutdown_signal: watch::Receiver<()>,
) -> Result<()> {
    let (bound, server) = warp::serve(routes)
        .try_bind_with_graceful_shutdown(addr, async move {
            let _ = shutdown_signal.changed().await;
        })
        .map_err(|e| Error::Fatal(format!("failed to bind {addr}: {e}")))?;

    info!(addr = %bound, "webhook listener started");
    server.await;
    info!("webhook listener stopped");
    Ok(())
}
