use crate::config::Config;
use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use catalog_core::{
    encode, CatalogError, CatalogStore, CreateItemOperation, CreateItemOperationRequest,
    ImageStore, ImageUpload, ItemRecord, ReadImageOperation, ReadImageOperationOutcome,
    ReadImageOperationRequest, ReadItemOperationOutcome, ReadItemsOperation, Result,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub struct ServerState {
    pub create_item: CreateItemOperation,
    pub read_items: ReadItemsOperation,
    pub read_image: ReadImageOperation,
    pub config: Config,
}

impl ServerState {
    pub fn new(config: Config) -> Result<Self> {
        let image_store = Arc::new(ImageStore::new(
            config.image_dir.clone(),
            config.default_image.clone(),
        )?);
        let catalog_store = Arc::new(CatalogStore::open(
            &config.database_path,
            &config.store_options(),
        )?);

        if !image_store.default_image_exists() {
            tracing::warn!(
                "Default image {:?} is missing; image fallbacks will return 404",
                image_store.default_image_path()
            );
        }

        let timeout = config.request_timeout();
        Ok(Self {
            create_item: CreateItemOperation::new(
                image_store.clone(),
                catalog_store.clone(),
                timeout,
            ),
            read_items: ReadItemsOperation::new(catalog_store.clone(), timeout),
            read_image: ReadImageOperation::new(catalog_store, image_store, timeout),
            config,
        })
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct MessageResponse {
    message: String,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Json<Self> {
        Json(Self {
            message: message.into(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    keyword: String,
}

/// Maps core errors onto HTTP statuses with a `{"message": ...}` body.
struct ApiError(CatalogError);

impl From<CatalogError> for ApiError {
    fn from(error: CatalogError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CatalogError::Validation(_) => StatusCode::BAD_REQUEST,
            CatalogError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if self.0.is_client_error() {
            tracing::info!("Request rejected: {}", self.0);
        } else {
            tracing::error!("Request failed: {}", self.0);
        }

        (status, MessageResponse::new(self.0.to_string())).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn build_router(state: Arc<ServerState>) -> Result<Router> {
    let cors = CorsLayer::new()
        .allow_origin(state.config.cors_origin()?)
        .allow_methods([Method::GET, Method::PUT, Method::POST, Method::DELETE]);
    let max_upload_bytes = state.config.max_upload_bytes;

    Ok(Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/items", get(list_items).post(create_item))
        .route("/items/:id", get(get_item))
        .route("/search", get(search_items))
        .route("/image/:id", get(get_image))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

pub async fn run_server(config: Config) -> Result<()> {
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(ServerState::new(config)?);
    let app = build_router(state)?;

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| CatalogError::Config(format!("failed to bind {}: {}", bind_addr, e)))?;
    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| CatalogError::Internal(format!("server error: {}", e)))?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", error);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

async fn root_handler() -> impl IntoResponse {
    MessageResponse::new("Hello, world!")
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> ApiResult<impl IntoResponse> {
    state.read_items.ping().await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

fn items_response(items: &[ItemRecord]) -> ApiResult<Response> {
    let payload = encode(items)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        payload,
    )
        .into_response())
}

async fn list_items(State(state): State<Arc<ServerState>>) -> ApiResult<Response> {
    let items = state.read_items.list().await?;
    items_response(&items)
}

async fn search_items(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Response> {
    let items = state.read_items.search(&query.keyword).await?;
    items_response(&items)
}

async fn get_item(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let id: i64 = id
        .parse()
        .map_err(|_| CatalogError::Validation(format!("invalid item id '{}'", id)))?;

    match state.read_items.get(id).await? {
        ReadItemOperationOutcome::Found(item) => Ok(Json(item).into_response()),
        ReadItemOperationOutcome::NotFound => {
            Ok((StatusCode::NOT_FOUND, MessageResponse::new("item not found")).into_response())
        }
    }
}

async fn get_image(
    State(state): State<Arc<ServerState>>,
    Path(key): Path<String>,
) -> ApiResult<Response> {
    let request = ReadImageOperationRequest::parse(&key);

    match state.read_image.run(request).await? {
        ReadImageOperationOutcome::Found(image) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, image.content_type)],
            image.body,
        )
            .into_response()),
        ReadImageOperationOutcome::Missing => {
            Ok((StatusCode::NOT_FOUND, MessageResponse::new("image not found")).into_response())
        }
    }
}

#[derive(Default)]
struct ItemForm {
    name: Option<String>,
    category: Option<String>,
    image: Option<(String, Bytes)>,
}

/// Collects the form fields. The image part is buffered so that name and
/// category can be validated before anything is written, whatever the
/// field order.
async fn read_item_form(multipart: &mut Multipart) -> Result<ItemForm> {
    let mut form = ItemForm::default();
    let malformed = |e: axum::extract::multipart::MultipartError| {
        CatalogError::Validation(format!("malformed multipart body: {}", e))
    };

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let field_name = field.name().unwrap_or_default().to_string();

        match field_name.as_str() {
            "name" => form.name = Some(field.text().await.map_err(malformed)?),
            "category" => form.category = Some(field.text().await.map_err(malformed)?),
            "image" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let body = field.bytes().await.map_err(|e| {
                    CatalogError::Read(format!("failed to receive image upload: {}", e))
                })?;
                // browsers send an empty, unnamed part when no file was chosen
                if file_name.is_empty() && body.is_empty() {
                    continue;
                }
                form.image = Some((file_name, body));
            }
            other => tracing::debug!("Ignoring form field {:?}", other),
        }
    }

    Ok(form)
}

async fn create_item(
    State(state): State<Arc<ServerState>>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    let form = read_item_form(&mut multipart).await?;

    tracing::debug!(
        "Receive item: name={:?} category={:?} image={:?}",
        form.name,
        form.category,
        form.image.as_ref().map(|(file_name, _)| file_name)
    );

    let request = CreateItemOperationRequest {
        name: form.name.unwrap_or_default(),
        category: form.category.unwrap_or_default(),
        image: form
            .image
            .map(|(file_name, body)| ImageUpload::from_bytes(file_name, body)),
    };

    let name = request.name.trim().to_string();
    state.create_item.run(request).await?;

    Ok(MessageResponse::new(format!("item received: {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use catalog_core::{compute_hash, decode};
    use tower::ServiceExt;

    const BOUNDARY: &str = "catalog-test-boundary";

    struct TestApp {
        _dir: tempfile::TempDir,
        database_path: std::path::PathBuf,
        router: Router,
    }

    impl TestApp {
        fn new() -> Self {
            Self::with_request_timeout(Config::default().request_timeout_ms)
        }

        fn with_request_timeout(request_timeout_ms: u64) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = Config {
                database_path: dir.path().join("db").join("catalog.sqlite3"),
                image_dir: dir.path().join("images"),
                request_timeout_ms,
                ..Config::default()
            };
            std::fs::create_dir_all(&config.image_dir).unwrap();
            std::fs::write(config.image_dir.join("default.jpg"), b"default image").unwrap();

            let database_path = config.database_path.clone();
            let state = Arc::new(ServerState::new(config).unwrap());
            let router = build_router(state).unwrap();
            Self {
                _dir: dir,
                database_path,
                router,
            }
        }

        async fn send(&self, request: Request<Body>) -> (StatusCode, Vec<u8>, Option<String>) {
            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .map(|value| value.to_str().unwrap().to_string());
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            (status, body.to_vec(), content_type)
        }

        async fn get(&self, uri: &str) -> (StatusCode, Vec<u8>, Option<String>) {
            self.send(Request::get(uri).body(Body::empty()).unwrap()).await
        }

        async fn post_item(
            &self,
            fields: &[(&str, &str)],
            image: Option<(&str, &[u8])>,
        ) -> (StatusCode, Vec<u8>, Option<String>) {
            let mut body = Vec::new();
            for (name, value) in fields {
                body.extend_from_slice(
                    format!(
                        "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                        BOUNDARY, name, value
                    )
                    .as_bytes(),
                );
            }
            if let Some((file_name, bytes)) = image {
                body.extend_from_slice(
                    format!(
                        "--{}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"{}\"\r\nContent-Type: application/octet-stream\r\n\r\n",
                        BOUNDARY, file_name
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(bytes);
                body.extend_from_slice(b"\r\n");
            }
            body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

            let request = Request::post("/items")
                .header(
                    header::CONTENT_TYPE,
                    format!("multipart/form-data; boundary={}", BOUNDARY),
                )
                .body(Body::from(body))
                .unwrap();
            self.send(request).await
        }
    }

    fn message(body: &[u8]) -> String {
        serde_json::from_slice::<MessageResponse>(body).unwrap().message
    }

    #[tokio::test]
    async fn test_root() {
        let app = TestApp::new();
        let (status, body, _) = app.get("/").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(message(&body), "Hello, world!");
    }

    #[tokio::test]
    async fn test_empty_catalog_lists_empty_collection() {
        let app = TestApp::new();
        let (status, body, content_type) = app.get("/items").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"{\"items\":[]}\n");
        assert_eq!(content_type.as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn test_create_without_image_then_list() {
        let app = TestApp::new();

        let (status, body, _) = app
            .post_item(&[("name", "Book"), ("category", "Fiction")], None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(message(&body), "item received: Book");

        let (status, body, _) = app.get("/items").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.ends_with(b"\n"));

        let items = decode(&body).unwrap().items;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Book");
        assert_eq!(items[0].category, "Fiction");
        assert_eq!(items[0].image_name, "default.jpg");

        let (status, body, _) = app.get(&format!("/items/{}", items[0].id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(serde_json::from_slice::<ItemRecord>(&body).unwrap(), items[0]);
    }

    #[tokio::test]
    async fn test_create_with_image_and_fetch_it() {
        let app = TestApp::new();
        let pixels: &[u8] = b"\x89PNG fake pixels";

        let (status, _, _) = app
            .post_item(
                &[("name", "Mug"), ("category", "Kitchen")],
                Some(("mug.png", pixels)),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        let (status, _, _) = app
            .post_item(
                &[("name", "Cup"), ("category", "Kitchen")],
                Some(("cup.png", pixels)),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (_, body, _) = app.get("/items").await;
        let items = decode(&body).unwrap().items;
        let expected = format!("{}.png", compute_hash(pixels));
        assert!(items.iter().all(|item| item.image_name == expected));

        let (status, body, content_type) = app.get(&format!("/image/{}", items[0].id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, pixels);
        assert_eq!(content_type.as_deref(), Some("image/png"));

        let (status, body, _) = app.get(&format!("/image/{}", expected)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, pixels);
    }

    #[tokio::test]
    async fn test_missing_fields_are_client_errors() {
        let app = TestApp::new();

        let (status, body, _) = app.post_item(&[("category", "Fiction")], None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(message(&body), "invalid request: name is required");

        let (status, body, _) = app.post_item(&[("name", "Book")], None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(message(&body), "invalid request: category is required");

        let (_, body, _) = app.get("/items").await;
        assert!(decode(&body).unwrap().items.is_empty());
    }

    #[tokio::test]
    async fn test_search() {
        let app = TestApp::new();
        for (name, category) in [("Blue Book", "Fiction"), ("Lamp", "Home")] {
            app.post_item(&[("name", name), ("category", category)], None)
                .await;
        }

        let (status, body, _) = app.get("/search?keyword=lamp").await;
        assert_eq!(status, StatusCode::OK);
        let found = decode(&body).unwrap().items;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "Lamp");

        let (_, all, _) = app.get("/items").await;
        let (_, empty_keyword, _) = app.get("/search?keyword=").await;
        let (_, no_keyword, _) = app.get("/search").await;
        assert_eq!(empty_keyword, all);
        assert_eq!(no_keyword, all);
    }

    #[tokio::test]
    async fn test_item_lookup_errors() {
        let app = TestApp::new();

        let (status, body, _) = app.get("/items/999").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(message(&body), "item not found");

        let (status, _, _) = app.get("/items/abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_image_serves_default() {
        let app = TestApp::new();

        let (status, body, content_type) = app.get("/image/999").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"default image");
        assert_eq!(content_type.as_deref(), Some("image/jpeg"));

        let (status, body, _) = app.get("/image/nothing-here.png").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"default image");
    }

    #[tokio::test]
    async fn test_health() {
        let app = TestApp::new();
        let (status, body, _) = app.get("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            serde_json::from_slice::<serde_json::Value>(&body).unwrap(),
            serde_json::json!({ "status": "ok" })
        );
    }

    #[tokio::test]
    async fn test_timeout_is_gateway_timeout() {
        let app = TestApp::with_request_timeout(100);

        let locker = rusqlite::Connection::open(&app.database_path).unwrap();
        locker.execute_batch("BEGIN IMMEDIATE;").unwrap();

        let (status, body, content_type) =
            app.post_item(&[("name", "Book"), ("category", "Fiction")], None).await;

        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(content_type.as_deref(), Some("application/json"));
        assert_eq!(message(&body), "operation timed out after 100ms");

        locker.execute_batch("COMMIT;").unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        let (_, body, _) = app.get("/items").await;
        assert!(decode(&body).unwrap().items.is_empty());
    }
}
