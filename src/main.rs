/// MySQL binlog 변경 이벤트 스트리머
///
/// 환경 변수(`DB_USER`, `DB_PASSWORD`, `DB_HOST`, `DB_NAME`, `DB_PORT`)로 연결해
/// 행 변경 이벤트를 표준 출력에 씁니다. Ctrl+C로 종료합니다.
use binlog_stream::binlog_client::MySqlSource;
use binlog_stream::config::ConnectionProfile;
use binlog_stream::controller::{StreamController, StreamOptions};
use binlog_stream::offset::BinlogPosition;
use binlog_stream::runner::run_to_sink;
use binlog_stream::sink::{ConsoleSink, OutputFormat};
use clap::Parser;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "binlog-stream")]
#[command(about = "Stream MySQL binlog row changes as insert/update/delete events", long_about = None)]
struct Args {
    #[arg(long, value_name = "FILE", help = "Binary log file to start from (default: latest)")]
    log_file: Option<String>,

    #[arg(long, value_name = "OFFSET", default_value_t = 4, help = "Offset within --log-file")]
    log_position: u64,

    #[arg(long, default_value_t = 1, help = "Server ID for the binary log reader")]
    server_id: u32,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting binlog-stream");

    let profile = match ConnectionProfile::from_env() {
        Ok(profile) => profile,
        Err(e) => {
            error!("Failed to load connection settings: {}", e);
            eprintln!("binlog-stream: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!(
        host = %profile.host(),
        port = profile.port(),
        database = %profile.database(),
        user = %profile.user(),
        server_id = args.server_id,
        "Configuration summary"
    );

    let options = StreamOptions {
        server_id: args.server_id,
    };
    let mut controller = StreamController::new(MySqlSource::new(), profile, options);

    let (interrupt_tx, interrupt_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping binlog stream");
            interrupt_tx.send_replace(true);
        }
        // 송신측을 유지해야 수신측이 닫힌 채널로 오인하지 않음
        std::future::pending::<()>().await;
    });

    let start = args
        .log_file
        .map(|file| BinlogPosition::new(file, args.log_position));
    let mut sink = ConsoleSink::stdout(args.format);

    let outcome = run_to_sink(&mut controller, &mut sink, start, interrupt_rx).await;

    if let Err(e) = controller.close().await {
        warn!("Binlog stream did not close cleanly: {}", e);
    }

    let last_position = controller
        .position()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string());

    match outcome {
        Ok(()) => {
            info!(
                events = sink.emitted(),
                position = %last_position,
                "Stopping binary log processor"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Binlog stream terminated: {}", e);
            eprintln!(
                "binlog-stream terminated: {} (last position: {})",
                e, last_position
            );
            ExitCode::FAILURE
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("binlog_stream=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("binlog_stream=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
