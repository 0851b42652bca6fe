use crate::AppState;
use axum::{
    extract::{Query, Request, State},
    middleware::Next,
    response::Response,
};
use multidb_tenant::{RoutingContext, TENANT_HEADER, TENANT_QUERY_PARAM};
use std::collections::HashMap;
use std::sync::Arc;

/// Run every request inside its own routing scope bound to the requested tenant
pub async fn routing_scope(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let token = tenant_token(&request);
    let key = state.selector.select(token.as_deref());

    RoutingContext::with_tenant(key, next.run(request)).await
}

/// The `X-Tenant-ID` header wins over the `client` query parameter
fn tenant_token(request: &Request) -> Option<String> {
    if let Some(header) = request
        .headers()
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        return Some(header.to_string());
    }

    Query::<HashMap<String, String>>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(mut params)| params.remove(TENANT_QUERY_PARAM))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_tenant_token_sources() {
        let request = Request::builder()
            .uri("/tenant/current?client=client-a")
            .body(Body::empty())
            .unwrap();
        assert_eq!(tenant_token(&request).as_deref(), Some("client-a"));

        let request = Request::builder()
            .uri("/tenant/current?client=client-a")
            .header("X-Tenant-ID", "client-b")
            .body(Body::empty())
            .unwrap();
        assert_eq!(tenant_token(&request).as_deref(), Some("client-b"));

        let request = Request::builder()
            .uri("/tenant/current")
            .body(Body::empty())
            .unwrap();
        assert_eq!(tenant_token(&request), None);
    }
}
