use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use prometheus::{Encoder, Registry, TextEncoder};

use crate::exporter::{Exporter, ExporterCollector};

/// State shared by the HTTP handlers.
pub struct AppState {
    registry: Registry,
    exporter: Arc<Exporter>,
}

impl AppState {
    pub fn new(exporter: Arc<Exporter>) -> Result<Self> {
        let registry = Registry::new();
        registry
            .register(Box::new(ExporterCollector(exporter.clone())))
            .context("registering exporter")?;
        Ok(Self { registry, exporter })
    }
}

/// Accepts `host:port` or a bare `:port` meaning every interface.
pub fn listen_addr(addr: &str) -> Result<SocketAddr> {
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    addr.parse()
        .with_context(|| format!("invalid listen address {addr:?}"))
}

/// `/metrics`, plus the `/tables` dump when `debug` is set.
pub fn router(state: Arc<AppState>, debug: bool) -> Router {
    let mut app = Router::new().route("/metrics", get(metrics_handler));
    if debug {
        app = app.route("/tables", get(tables_handler));
    }
    app.with_state(state)
}

pub async fn run_server(state: Arc<AppState>, addr: SocketAddr, debug: bool) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    log::info!("listening on {addr}");
    axum::serve(listener, router(state, debug)).await?;
    Ok(())
}

/// Text exposition of everything in `registry`.
pub fn encode(registry: &Registry) -> Result<String> {
    let families = registry.gather();
    let mut buf = Vec::new();
    TextEncoder::new()
        .encode(&families, &mut buf)
        .context("encoding metrics")?;
    String::from_utf8(buf).context("metrics are not utf-8")
}

// Collection reads kernel maps and may block on the container runtime,
// so it runs on the blocking pool.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let result = tokio::task::spawn_blocking(move || encode(&state.registry)).await;
    match result.context("collection task failed").and_then(|r| r) {
        Ok(body) => (
            [(header::CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            log::error!("serving metrics: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}\n")).into_response()
        }
    }
}

async fn tables_handler(State(state): State<Arc<AppState>>) -> Response {
    match tokio::task::spawn_blocking(move || state.exporter.tables_dump()).await {
        Ok(body) => ([(header::CONTENT_TYPE, "text/plain")], body).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{e}\n")).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::scanner::tests::{decoder_context, node, FakeTables};

    #[test]
    fn bare_port_listens_everywhere() {
        assert_eq!(
            listen_addr(":9435").unwrap(),
            "0.0.0.0:9435".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            listen_addr("127.0.0.1:8080").unwrap(),
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
        assert!(listen_addr("nonsense").is_err());
    }

    #[test]
    fn exposition_includes_program_series() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::parse(
            "programs:\n  - name: idle\n    object: /opt/bpf/idle.o\n",
        )
        .unwrap();
        let exporter = Exporter::new(
            &config,
            node(),
            &decoder_context(dir.path()),
            Arc::new(FakeTables::default()),
            None,
        )
        .unwrap();
        let state = AppState::new(Arc::new(exporter)).unwrap();

        let body = encode(&state.registry).unwrap();
        assert!(body.contains("# TYPE ebpf_exporter_enabled_programs gauge"));
        assert!(body.contains(r#"ebpf_exporter_enabled_programs{name="idle",node_id="node-1"} 1"#));
    }
}
