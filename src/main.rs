//! AxoTus server binary.
//!
//! Serves the tus 1.0.0 resumable upload protocol (creation and termination
//! extensions). The main entry point builds the upload engine from its
//! metadata store and byte sink, wires the Axum router, and starts the HTTP
//! listener.

mod background;
mod config;
mod engine;
mod error;
mod http;
mod locking;
mod logging;
mod metadata;
mod session;
mod sink;
mod store;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{head, options};
use axum::{Router, middleware};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::engine::UploadEngine;
use crate::http::{add_protocol_headers, build_cors_layer};
use crate::sink::FsSink;
use crate::store::{MemoryStore, MetaStore};

/// Starts the AxoTus server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let sink = Arc::new(FsSink::new(PathBuf::from(&args.upload_dir)));
    sink.ensure_root().await?;

    let (store, memory_store) = build_store(&args).await?;
    let engine = Arc::new(UploadEngine::new(store, sink, args.engine_config()));
    let settings = Arc::new(args.protocol_settings());
    let upload_url = settings.upload_url.clone();

    let mut app = Router::new()
        .route(
            &upload_url,
            options(http::upload_options).post(http::create_upload),
        )
        .route(
            &format!("{upload_url}/{{resource_id}}"),
            head(http::upload_status)
                .patch(http::append_upload)
                .delete(http::terminate_upload)
                .layer(DefaultBodyLimit::max(args.max_chunk_size)),
        )
        .layer(middleware::from_fn(add_protocol_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(engine.clone()))
        .layer(Extension(settings));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.http_port);
    let listener = TcpListener::bind(addr).await?;

    info!(
        %addr,
        upload_url,
        upload_dir = args.upload_dir,
        "starting tus upload server"
    );

    spawn_background_tasks(
        engine,
        memory_store,
        Duration::from_secs(args.sweep_interval_secs),
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
}

type StoreHandles = (Arc<dyn MetaStore>, Option<Arc<MemoryStore>>);

/// 选择元数据存储：配置了 Redis 时使用 Redis，否则使用进程内存储。
#[cfg(feature = "redis")]
async fn build_store(args: &Args) -> Result<StoreHandles, std::io::Error> {
    let Some(url) = args.redis_url.as_deref() else {
        return Ok(memory_store());
    };
    let store = store::RedisStore::connect(url)
        .await
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, err))?;
    info!("using redis metadata store");
    let shared: Arc<dyn MetaStore> = Arc::new(store);
    Ok((shared, None))
}

#[cfg(not(feature = "redis"))]
async fn build_store(_args: &Args) -> Result<StoreHandles, std::io::Error> {
    Ok(memory_store())
}

fn memory_store() -> StoreHandles {
    let store = Arc::new(MemoryStore::new());
    info!("using in-memory metadata store");
    let shared: Arc<dyn MetaStore> = store.clone();
    (shared, Some(store))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
}
