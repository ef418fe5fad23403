// 計測器に接続してみる。
// SPDX-License-Identifier: MPL-2.0
// SPDX-FileCopyrightText: 2025 Akihiro Yamamoto <github.com/ak1211>
//
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sentron_gateway::sentron::{self, Measurement, REGISTER_COUNT, START_REGISTER};
use sentron_gateway::simulator::SimulatedDevice;
use sentron_gateway::{ConnectionPool, DeviceEndpoint, GatewaySettings, MeterDataService};
use tracing_subscriber::FmtSubscriber;

/// 計測器から計測値を取得する。
#[derive(Parser, Debug)]
#[command(name = "dryrun")]
#[command(version, about, long_about = None)]
struct Cli {
    /// 設定ファイル名(省略時は既定値)
    #[arg(short = 'S', long, env = "GATEWAY_SETTINGS")]
    config_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// 設定ファイルの計測器を周期的に読む(読めなければシミュレータの値)
    Poll(PollArgs),
    /// 計測器の保持レジスタを読んで表示する
    Read(ReadArgs),
}

#[derive(Debug, Args)]
struct PollArgs {
    /// 読み出し回数
    #[arg(short = 'n', long, default_value_t = 5)]
    count: usize,
}

#[derive(Debug, Args)]
struct ReadArgs {
    /// IPアドレスまたはホスト名
    host: String,
    /// ポート番号
    #[arg(short = 'p', long, default_value_t = 502)]
    port: u16,
    /// 先頭レジスタ
    #[arg(long, default_value_t = START_REGISTER)]
    start: u16,
    /// レジスタ数
    #[arg(short = 'n', long, default_value_t = REGISTER_COUNT)]
    count: u16,
}

fn read_settings(cli: &Cli) -> anyhow::Result<GatewaySettings> {
    match &cli.config_file {
        Some(file_name) => GatewaySettings::load(file_name)
            .with_context(|| format!(r#""{}" setting file read error."#, file_name)),
        None => Ok(GatewaySettings::default()),
    }
}

/// 読めなければシミュレータの値で代用する
async fn fetch_or_simulate(service: &MeterDataService, endpoint: &DeviceEndpoint) -> Measurement {
    match service.fetch(endpoint).await {
        Ok(measurement) => measurement,
        Err(e) => {
            tracing::warn!("{}, fall back to simulation. cause: {}", e, e.source);
            service.read_simulator()
        }
    }
}

async fn exec_poll(cli: &Cli, args: &PollArgs) -> anyhow::Result<()> {
    let settings = read_settings(cli)?;
    let simulator = SimulatedDevice::new(settings.Simulator.tick_interval());
    let ticker = simulator.spawn_ticker();
    let pool = ConnectionPool::new(settings.pool_config());
    let reaper = pool.spawn_reaper();
    let service = MeterDataService::new(pool, simulator);

    let mut interval = tokio::time::interval(settings.poll_interval());
    for n in 0..args.count {
        interval.tick().await;
        let readings = futures::future::join_all(settings.Devices.iter().map(|device| {
            let service = &service;
            async move {
                let endpoint = DeviceEndpoint::from(device);
                (device, fetch_or_simulate(service, &endpoint).await)
            }
        }))
        .await;
        for (device, measurement) in readings {
            tracing::info!("#{} {} {}", n + 1, device.Name, measurement.show());
            println!(
                r#"{{"id":{},"data":{}}}"#,
                serde_json::to_string(&device.Id)?,
                serde_json::to_string(&measurement)?
            );
        }
    }

    reaper.stop().await;
    ticker.stop().await;
    Ok(())
}

async fn exec_read(cli: &Cli, args: &ReadArgs) -> anyhow::Result<()> {
    let settings = read_settings(cli)?;
    let pool = ConnectionPool::new(settings.pool_config());
    let mut lease = pool.acquire(&args.host, args.port).await?;
    let frame = pool.read(&mut lease, args.start, args.count).await?;
    println!("{}", frame);
    if args.start == START_REGISTER {
        println!("{}", sentron::decode(&frame));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(tracing::Level::TRACE)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")?;

    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Poll(args) => exec_poll(&cli, args).await,
        Commands::Read(args) => exec_read(&cli, args).await,
    }
}
