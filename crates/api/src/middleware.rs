use axum::{extract::Request, http::Method, middleware::Next, response::Response};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info};

pub async fn request_logging(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = std::time::Instant::now();

    debug!(%method, %uri, "开始处理请求");

    let response = next.run(request).await;
    let duration = start.elapsed();

    // Worker的轮询量很大，成功的轮询只记debug
    if response.status().is_success() && uri.path().ends_with("/offer") {
        debug!(%method, %uri, status = %response.status(), ?duration, "完成请求处理");
    } else {
        info!(%method, %uri, status = %response.status(), ?duration, "完成请求处理");
    }

    response
}

pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers(Any)
}

pub fn trace_layer(
) -> TraceLayer<tower_http::classify::SharedClassifier<tower_http::classify::ServerErrorsAsFailures>>
{
    TraceLayer::new_for_http()
}
