// 計測器から読み出した計測値をHTTPで配信する。
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use sentron_gateway::background::BackgroundTask;
use sentron_gateway::settings::{self, DeviceSettings, GatewaySettings};
use sentron_gateway::simulator::{SimulatedDevice, spawn_server};
use sentron_gateway::{ConnectionPool, DeviceEndpoint, MeterDataService};
use serde::Deserialize;
use std::env;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::result;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

/// HTTPの待ち受けポート
const DEFAULT_HTTP_PORT: u16 = 3001;

#[derive(Debug, Error)]
pub enum GatewayDaemonError {
    #[error(r#"i/o "{0}""#)]
    Io(#[from] io::Error),

    #[error(r#"settings "{0}""#)]
    Settings(#[from] settings::Error),

    #[error(r#"invalid port "{0}""#)]
    InvalidPort(String),
}

#[derive(Clone)]
struct AppState {
    service: MeterDataService,
    devices: Arc<Vec<DeviceSettings>>,
}

/// GET /api/meter-data?ip=&port=&sim=
#[derive(Debug, Deserialize)]
struct MeterDataQuery {
    ip: Option<String>,
    port: Option<String>,
    sim: Option<String>,
}

impl MeterDataQuery {
    fn endpoint(&self) -> DeviceEndpoint {
        let host = self
            .ip
            .as_deref()
            .filter(|s| !s.is_empty())
            .unwrap_or("127.0.0.1");
        // 数値でなければ既定のポート
        let port = self
            .port
            .as_deref()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(502);
        let simulated = self.sim.as_deref() == Some("true");
        DeviceEndpoint::new(host, port, simulated)
    }
}

async fn meter_data(State(state): State<AppState>, Query(query): Query<MeterDataQuery>) -> Response {
    let endpoint = query.endpoint();
    match state.service.fetch(&endpoint).await {
        Ok(measurement) => {
            tracing::debug!("{} {}", endpoint, measurement);
            Json(measurement).into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": format!("No se pudo leer del dispositivo {}", e.endpoint.host)
            })),
        )
            .into_response(),
    }
}

async fn devices(State(state): State<AppState>) -> Json<Vec<DeviceSettings>> {
    Json(state.devices.as_ref().clone())
}

/// 設定ファイルを読む(無ければ既定値)
fn read_settings() -> result::Result<GatewaySettings, GatewayDaemonError> {
    match env::var("GATEWAY_SETTINGS") {
        Ok(path) => {
            tracing::info!(r#"settings file "{}""#, path);
            Ok(GatewaySettings::load(&path)?)
        }
        Err(_) => {
            tracing::info!("GATEWAY_SETTINGS is not set, use default settings");
            Ok(GatewaySettings::default())
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("couldn't listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

/// このサービス本体
async fn exec_gateway(settings: GatewaySettings) -> result::Result<(), GatewayDaemonError> {
    let http_port = match env::var("PORT") {
        Ok(s) => s
            .parse::<u16>()
            .map_err(|_| GatewayDaemonError::InvalidPort(s))?,
        Err(_) => DEFAULT_HTTP_PORT,
    };

    // 内蔵シミュレータ
    let simulator = SimulatedDevice::new(settings.Simulator.tick_interval());
    let mut tasks: Vec<BackgroundTask> = vec![simulator.spawn_ticker()];
    if settings.Simulator.Port != 0 {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, settings.Simulator.Port));
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("simulator listening on {}", addr);
        tasks.push(spawn_server(
            listener,
            simulator.clone(),
            settings.Simulator.response_delay(),
        ));
    }

    // コネクションプール
    let pool = ConnectionPool::new(settings.pool_config());
    tasks.push(pool.spawn_reaper());

    let state = AppState {
        service: MeterDataService::new(pool, simulator),
        devices: Arc::new(settings.Devices.clone()),
    };
    let app = Router::new()
        .route("/api/meter-data", get(meter_data))
        .route("/api/devices", get(devices))
        .with_state(state);

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, http_port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", addr);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    for task in tasks {
        task.stop().await;
    }
    Ok(served?)
}

#[tokio::main]
async fn main() -> ExitCode {
    // プログラムの情報
    let git_head_ref = built_info::GIT_HEAD_REF.unwrap_or_default();
    let app_info = format!(
        "{} / {}{}",
        built_info::PKG_NAME,
        built_info::PKG_VERSION,
        built_info::GIT_COMMIT_HASH_SHORT
            .map(|s| format!(" ({s} - {git_head_ref})"))
            .unwrap_or_default()
    );

    let _ = dotenv::dotenv();

    // tracingの設定
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    // systemd-journaldに接続
    match tracing_journald::layer() {
        // journaldにログ出力する
        Ok(journald_layer) => registry.with(journald_layer).init(),
        // journaldが使えないので、標準出力にログ出力する
        Err(e) => {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_timer(tracing_subscriber::fmt::time::LocalTime::rfc_3339())
                        .with_file(false)
                        .with_line_number(false)
                        .with_thread_names(false)
                        .with_thread_ids(false)
                        .with_ansi(false),
                )
                .init();
            tracing::error!("couldn't connect to journald: {}", e)
        }
    }

    tracing::info!("{app_info} started.");
    let result = match read_settings() {
        Ok(settings) => exec_gateway(settings).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => {
            tracing::info!("{app_info} stopped.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!("{app_info} aborted, reason: {e}");
            ExitCode::FAILURE
        }
    }
}

#[test]
fn test1() {
    let query = MeterDataQuery {
        ip: None,
        port: None,
        sim: None,
    };
    assert_eq!(query.endpoint(), DeviceEndpoint::new("127.0.0.1", 502, false));
    let query = MeterDataQuery {
        ip: Some("10.0.0.5".to_owned()),
        port: Some("abc".to_owned()),
        sim: Some("true".to_owned()),
    };
    assert_eq!(query.endpoint(), DeviceEndpoint::new("10.0.0.5", 502, true));
    let query = MeterDataQuery {
        ip: Some("10.0.0.6".to_owned()),
        port: Some("1502".to_owned()),
        sim: Some("1".to_owned()),
    };
    assert_eq!(query.endpoint(), DeviceEndpoint::new("10.0.0.6", 1502, false));
}
