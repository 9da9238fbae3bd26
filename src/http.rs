//! tus 协议绑定：请求头解析、处理器、CORS 与公共响应头。

use axum::body::{Body as AxumBody, Bytes};
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode, header};
use axum::{middleware, response::IntoResponse, response::Response};
use std::sync::Arc;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tracing::{debug, warn};

use crate::config::{TUS_EXTENSIONS, TUS_VERSION};
use crate::engine::{CreateRequest, UploadEngine};
use crate::error::ApiError;

pub const TUS_RESUMABLE: HeaderName = HeaderName::from_static("tus-resumable");
pub const TUS_VERSION_HEADER: HeaderName = HeaderName::from_static("tus-version");
pub const TUS_EXTENSION: HeaderName = HeaderName::from_static("tus-extension");
pub const TUS_MAX_SIZE: HeaderName = HeaderName::from_static("tus-max-size");
pub const UPLOAD_LENGTH: HeaderName = HeaderName::from_static("upload-length");
pub const UPLOAD_METADATA: HeaderName = HeaderName::from_static("upload-metadata");
pub const UPLOAD_OFFSET: HeaderName = HeaderName::from_static("upload-offset");

pub const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

/// Routing-level settings shared by all handlers.
#[derive(Debug, Clone)]
pub struct ProtocolSettings {
    pub upload_url: String,
    pub public_url: Option<String>,
    pub max_size: u64,
}

impl ProtocolSettings {
    /// 生成上传资源的 Location 前缀：优先使用配置的公开地址，否则按请求头推断。
    pub fn location_base(&self, headers: &HeaderMap) -> String {
        let upload_url = self.upload_url.trim_end_matches('/');
        if let Some(public_url) = self.public_url.as_deref() {
            return format!("{}{}", public_url.trim_end_matches('/'), upload_url);
        }
        match request_origin(headers) {
            Some(origin) => format!("{origin}{upload_url}"),
            None => upload_url.to_string(),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Result<Option<&'a str>, ApiError> {
    headers
        .get(name)
        .map(|value| {
            value
                .to_str()
                .map(str::trim)
                .map_err(|_| ApiError::BadRequest(format!("{name} is not valid text")))
        })
        .transpose()
}

fn header_u64(headers: &HeaderMap, name: &HeaderName) -> Result<Option<u64>, ApiError> {
    header_str(headers, name)?
        .map(|value| {
            value
                .parse::<u64>()
                .map_err(|_| ApiError::BadRequest(format!("{name} must be a non-negative integer")))
        })
        .transpose()
}

/// 从反向代理头或 Host 推断请求来源（`scheme://host`）。
fn request_origin(headers: &HeaderMap) -> Option<String> {
    let first = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };
    let host = first("x-forwarded-host").or_else(|| first(header::HOST.as_str()))?;
    let scheme = first("x-forwarded-proto").unwrap_or("http");
    Some(format!("{scheme}://{host}"))
}

fn require_tus_resumable(headers: &HeaderMap) -> Result<(), ApiError> {
    match header_str(headers, &TUS_RESUMABLE)? {
        Some(version) if version == TUS_VERSION => Ok(()),
        other => {
            warn!(version = other, "request without supported Tus-Resumable");
            Err(ApiError::PreconditionFailed)
        }
    }
}

/// 能力发现：协议版本、扩展与最大上传大小。
pub async fn upload_options(Extension(settings): Extension<Arc<ProtocolSettings>>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(TUS_VERSION_HEADER, HeaderValue::from_static(TUS_VERSION));
    headers.insert(TUS_EXTENSION, HeaderValue::from_static(TUS_EXTENSIONS));
    if settings.max_size > 0 {
        headers.insert(TUS_MAX_SIZE, HeaderValue::from(settings.max_size));
    }
    (StatusCode::NO_CONTENT, headers).into_response()
}

/// 创建上传会话，返回 201 与 Location。
pub async fn create_upload(
    headers: HeaderMap,
    Extension(engine): Extension<Arc<UploadEngine>>,
    Extension(settings): Extension<Arc<ProtocolSettings>>,
) -> Result<Response, ApiError> {
    require_tus_resumable(&headers)?;
    let declared_size = header_u64(&headers, &UPLOAD_LENGTH)?
        .ok_or_else(|| ApiError::BadRequest("Upload-Length is required".into()))?;
    let raw_metadata = header_str(&headers, &UPLOAD_METADATA)?;
    let request = CreateRequest::new(declared_size, raw_metadata)?;

    let created = engine.create_session(request).await?;
    if let Some(name) = created.published_name.as_deref() {
        debug!(upload_id = created.resource_id, name, "empty upload published on creation");
    }
    let location = format!("{}/{}", settings.location_base(&headers), created.resource_id);
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::LOCATION,
        HeaderValue::from_str(&location)
            .map_err(|_| ApiError::Internal("failed to build Location header".into()))?,
    );
    Ok((StatusCode::CREATED, response_headers).into_response())
}

/// 查询上传偏移，结果不可缓存。
pub async fn upload_status(
    Path(resource_id): Path<String>,
    headers: HeaderMap,
    Extension(engine): Extension<Arc<UploadEngine>>,
) -> Result<Response, ApiError> {
    require_tus_resumable(&headers)?;
    let status = engine.get_status(&resource_id).await?;
    let mut headers = HeaderMap::new();
    headers.insert(UPLOAD_OFFSET, HeaderValue::from(status.offset));
    if let Some(length) = status.declared_size {
        headers.insert(UPLOAD_LENGTH, HeaderValue::from(length));
    }
    if let Some(value) = status
        .metadata
        .as_deref()
        .and_then(|raw| HeaderValue::from_str(raw).ok())
    {
        headers.insert(UPLOAD_METADATA, value);
    }
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok((StatusCode::OK, headers).into_response())
}

/// 追加一个分片。
pub async fn append_upload(
    Path(resource_id): Path<String>,
    headers: HeaderMap,
    Extension(engine): Extension<Arc<UploadEngine>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    require_tus_resumable(&headers)?;
    let content_type = header_str(&headers, &header::CONTENT_TYPE)?;
    if content_type != Some(OFFSET_OCTET_STREAM) {
        return Err(ApiError::UnsupportedMediaType);
    }
    let client_offset = header_u64(&headers, &UPLOAD_OFFSET)?
        .ok_or_else(|| ApiError::BadRequest("Upload-Offset is required".into()))?;
    if let Some(length) = header_u64(&headers, &header::CONTENT_LENGTH)?
        && length != body.len() as u64
    {
        return Err(ApiError::BadRequest(
            "Content-Length does not match body".into(),
        ));
    }

    let outcome = engine
        .append_chunk(&resource_id, client_offset, &body)
        .await?;
    debug!(
        upload_id = resource_id,
        offset = outcome.offset,
        published = outcome.published_name.as_deref(),
        "patch accepted"
    );
    let mut response_headers = HeaderMap::new();
    response_headers.insert(UPLOAD_OFFSET, HeaderValue::from(outcome.offset));
    Ok((StatusCode::NO_CONTENT, response_headers).into_response())
}

/// 终止上传，可重复调用。
pub async fn terminate_upload(
    Path(resource_id): Path<String>,
    headers: HeaderMap,
    Extension(engine): Extension<Arc<UploadEngine>>,
) -> Result<StatusCode, ApiError> {
    require_tus_resumable(&headers)?;
    engine.delete_session(&resource_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// 构建 CORS Layer（支持逗号分隔的来源列表），并暴露 tus 响应头。
pub fn build_cors_layer(cors_origins: Option<&str>) -> Option<CorsLayer> {
    let origins = cors_origins?
        .split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin, "invalid cors origin");
                None
            }
        })
        .collect::<Vec<_>>();

    if origins.is_empty() {
        return None;
    }

    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([
                Method::OPTIONS,
                Method::POST,
                Method::HEAD,
                Method::PATCH,
                Method::DELETE,
            ])
            .allow_headers(AllowHeaders::mirror_request())
            .expose_headers([
                header::LOCATION,
                UPLOAD_OFFSET,
                UPLOAD_LENGTH,
                UPLOAD_METADATA,
                TUS_RESUMABLE,
                TUS_VERSION_HEADER,
                TUS_EXTENSION,
                TUS_MAX_SIZE,
            ])
            .allow_credentials(true),
    )
}

/// 为每个响应添加 `Tus-Resumable` 与基础安全头。
pub async fn add_protocol_headers(
    request: Request<AxumBody>,
    next: middleware::Next,
) -> Result<Response, StatusCode> {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    use crate::engine::EngineConfig;
    use crate::sink::FsSink;
    use crate::store::MemoryStore;

    fn make_engine() -> (tempfile::TempDir, Arc<UploadEngine>) {
        let temp = tempdir().expect("tempdir");
        let sink = Arc::new(FsSink::new(temp.path().join("uploads")));
        let engine = UploadEngine::new(
            Arc::new(MemoryStore::new()),
            sink,
            EngineConfig {
                metadata_ttl: Duration::from_secs(3600),
                io_timeout: Duration::from_secs(5),
                lock_timeout: Duration::from_secs(5),
                max_size: 1024,
            },
        );
        (temp, Arc::new(engine))
    }

    fn make_settings() -> Arc<ProtocolSettings> {
        Arc::new(ProtocolSettings {
            upload_url: "/file-upload".into(),
            public_url: None,
            max_size: 1024,
        })
    }

    fn tus_headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(TUS_RESUMABLE, HeaderValue::from_static(TUS_VERSION));
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    fn patch_headers(offset: &'static str) -> HeaderMap {
        tus_headers(&[
            ("upload-offset", offset),
            ("content-type", OFFSET_OCTET_STREAM),
        ])
    }

    async fn create(engine: &Arc<UploadEngine>, length: &'static str) -> String {
        let response = create_upload(
            tus_headers(&[
                ("upload-length", length),
                ("upload-metadata", "filename YS50eHQ="),
                ("host", "files.example.com"),
            ]),
            Extension(engine.clone()),
            Extension(make_settings()),
        )
        .await
        .expect("create upload");
        assert_eq!(response.status(), StatusCode::CREATED);
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .expect("location")
            .to_string();
        let prefix = "http://files.example.com/file-upload/";
        assert!(location.starts_with(prefix), "unexpected location {location}");
        location[prefix.len()..].to_string()
    }

    #[tokio::test]
    async fn options_advertises_capabilities() {
        let response = upload_options(Extension(make_settings())).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        let headers = response.headers();
        assert_eq!(headers.get(TUS_VERSION_HEADER).expect("version"), "1.0.0");
        assert_eq!(
            headers.get(TUS_EXTENSION).expect("extensions"),
            "creation,termination"
        );
        assert_eq!(headers.get(TUS_MAX_SIZE).expect("max size"), "1024");
    }

    #[tokio::test]
    async fn create_requires_tus_resumable_and_valid_length() {
        let (_temp, engine) = make_engine();
        let mut headers = HeaderMap::new();
        headers.insert(UPLOAD_LENGTH, HeaderValue::from_static("10"));
        let result = create_upload(
            headers,
            Extension(engine.clone()),
            Extension(make_settings()),
        )
        .await;
        assert!(matches!(result, Err(ApiError::PreconditionFailed)));

        let result = create_upload(
            tus_headers(&[("upload-length", "-1")]),
            Extension(engine.clone()),
            Extension(make_settings()),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let result = create_upload(
            tus_headers(&[]),
            Extension(engine.clone()),
            Extension(make_settings()),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let result = create_upload(
            tus_headers(&[("upload-length", "4096")]),
            Extension(engine),
            Extension(make_settings()),
        )
        .await;
        assert!(matches!(result, Err(ApiError::PayloadTooLarge(_))));
    }

    #[tokio::test]
    async fn location_prefers_configured_public_url() {
        let settings = ProtocolSettings {
            upload_url: "/file-upload/".into(),
            public_url: Some("https://cdn.example.com/".into()),
            max_size: 0,
        };
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("internal:5005"));
        assert_eq!(
            settings.location_base(&headers),
            "https://cdn.example.com/file-upload"
        );

        let settings = ProtocolSettings {
            public_url: None,
            ..settings
        };
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        assert_eq!(
            settings.location_base(&headers),
            "https://internal:5005/file-upload"
        );
        assert_eq!(settings.location_base(&HeaderMap::new()), "/file-upload");
    }

    #[tokio::test]
    async fn upload_flow_over_handlers() {
        let (temp, engine) = make_engine();
        let id = create(&engine, "6").await;

        let result =
            upload_status(Path(id.clone()), HeaderMap::new(), Extension(engine.clone())).await;
        assert!(matches!(result, Err(ApiError::PreconditionFailed)));

        let response =
            upload_status(Path(id.clone()), tus_headers(&[]), Extension(engine.clone()))
                .await
                .expect("head");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(UPLOAD_OFFSET).expect("offset"), "0");
        assert_eq!(response.headers().get(UPLOAD_LENGTH).expect("length"), "6");
        assert_eq!(
            response.headers().get(UPLOAD_METADATA).expect("metadata"),
            "filename YS50eHQ="
        );
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).expect("cache"),
            "no-store"
        );

        let result = append_upload(
            Path(id.clone()),
            tus_headers(&[("upload-offset", "0")]),
            Extension(engine.clone()),
            Bytes::from_static(b"abc"),
        )
        .await;
        assert!(matches!(result, Err(ApiError::UnsupportedMediaType)));

        let response = append_upload(
            Path(id.clone()),
            patch_headers("0"),
            Extension(engine.clone()),
            Bytes::from_static(b"abc"),
        )
        .await
        .expect("patch");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers().get(UPLOAD_OFFSET).expect("offset"), "3");

        let result = append_upload(
            Path(id.clone()),
            patch_headers("0"),
            Extension(engine.clone()),
            Bytes::from_static(b"abc"),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Conflict { offset: 3 })));

        let response = append_upload(
            Path(id.clone()),
            patch_headers("3"),
            Extension(engine.clone()),
            Bytes::from_static(b"def"),
        )
        .await
        .expect("final patch");
        assert_eq!(response.headers().get(UPLOAD_OFFSET).expect("offset"), "6");

        let published = temp.path().join("uploads").join("a.txt");
        assert_eq!(std::fs::read(published).expect("read"), b"abcdef");

        let result = append_upload(
            Path(id),
            patch_headers("6"),
            Extension(engine),
            Bytes::new(),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Gone)));
    }

    #[tokio::test]
    async fn patch_rejects_mismatched_content_length() {
        let (_temp, engine) = make_engine();
        let id = create(&engine, "6").await;
        let mut headers = patch_headers("0");
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("5"));
        let result = append_upload(
            Path(id),
            headers,
            Extension(engine),
            Bytes::from_static(b"abc"),
        )
        .await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn terminate_always_succeeds_and_upload_disappears() {
        let (_temp, engine) = make_engine();
        let id = create(&engine, "4").await;

        for _ in 0..2 {
            let status =
                terminate_upload(Path(id.clone()), tus_headers(&[]), Extension(engine.clone()))
                    .await
                    .expect("delete");
            assert_eq!(status, StatusCode::NO_CONTENT);
        }

        let result =
            upload_status(Path(id.clone()), tus_headers(&[]), Extension(engine.clone())).await;
        assert!(matches!(result, Err(ApiError::NotFound)));
        let result = append_upload(
            Path(id),
            patch_headers("0"),
            Extension(engine),
            Bytes::from_static(b"ab"),
        )
        .await;
        assert!(matches!(result, Err(ApiError::Gone)));
    }
}
