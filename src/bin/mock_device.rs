// 擬似計測器をModbus/TCPサーバとして単独で動かす。
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use anyhow::Context;
use clap::Parser;
use sentron_gateway::simulator::{DEFAULT_SIMULATOR_PORT, SimulatedDevice, spawn_server};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// SENTRON PAC3200と同じレジスタ配置の擬似計測器
#[derive(Parser, Debug)]
#[command(name = "mock_device")]
#[command(version, about, long_about = None)]
struct Cli {
    /// 待ち受けポート
    #[arg(short = 'p', long, env = "SIMULATOR_PORT", default_value_t = DEFAULT_SIMULATOR_PORT)]
    port: u16,

    /// 計測値の更新間隔(ミリ秒)
    #[arg(long, default_value_t = 200, value_parser = clap::value_parser!(u64).range(1..))]
    tick_ms: u64,

    /// 応答までの遅延(ミリ秒)
    #[arg(long, default_value_t = 50)]
    response_delay_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    // 標準出力へのログはワーカースレッドで書き出す
    let (writer, _guard) = tracing_appender::non_blocking(std::io::stdout());
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,sentron_gateway::simulator=debug"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(tracing_subscriber::fmt::time::LocalTime::rfc_3339())
                .with_writer(writer),
        )
        .init();

    let device = SimulatedDevice::new(Duration::from_millis(cli.tick_ms));
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, cli.port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("simulated device listening on {}", addr);

    let ticker = device.spawn_ticker();
    let server = spawn_server(
        listener,
        device,
        Duration::from_millis(cli.response_delay_ms),
    );

    tokio::signal::ctrl_c()
        .await
        .context("Can't listen for shutdown signal.")?;
    server.stop().await;
    ticker.stop().await;
    tracing::info!("Good Bye!");
    Ok(())
}

#[test]
fn test1() {
    let cli = Cli::try_parse_from(["mock_device"]).unwrap();
    assert_eq!(cli.tick_ms, 200);
    assert_eq!(cli.response_delay_ms, 50);
    // 更新間隔0は受け付けない
    assert!(Cli::try_parse_from(["mock_device", "--tick-ms", "0"]).is_err());
    let cli = Cli::try_parse_from(["mock_device", "--tick-ms", "1", "--response-delay-ms", "0"]).unwrap();
    assert_eq!(cli.tick_ms, 1);
    assert_eq!(cli.response_delay_ms, 0);
}
