use log::{error, info, Level, LevelFilter, Metadata, Record};
use rconlink::{
    client::Client,
    config::{Endpoint, Settings},
    packet::PacketType,
    server,
};
use std::error::Error;
use tokio::signal;

struct SimpleLogger {
    level: Level,
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            println!("{} - {}", record.level(), record.args());
        }
    }

    fn flush(&self) {}
}

static INFO_LOGGER: SimpleLogger = SimpleLogger { level: Level::Info };
static TRACE_LOGGER: SimpleLogger = SimpleLogger { level: Level::Trace };

fn init_logger() {
    let (logger, filter) = if std::env::var_os("RCON_TRACE").is_some() {
        (&TRACE_LOGGER, LevelFilter::Trace)
    } else {
        (&INFO_LOGGER, LevelFilter::Info)
    };
    let _ = log::set_logger(logger).map(|()| log::set_max_level(filter));
}

/// `rconlink <command...>` runs one command against `RCON_HOST:RCON_PORT`.
/// `rconlink serve` runs an echo server there until Ctrl-C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    init_logger();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let endpoint = Endpoint::from_env()?;

    if args.first().map(String::as_str) == Some("serve") {
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        let server = server::Server::start(&addr, &endpoint.password, server::echo).await?;
        info!("echo server listening on {}", server.local_addr());
        signal::ctrl_c().await?;
        info!("bye");
        return Ok(());
    }

    if args.is_empty() {
        error!("usage: rconlink <command...> | rconlink serve");
        return Ok(());
    }

    let client = Client::new(Settings::from_env()?);
    client.configure_endpoint(endpoint).await?;

    let response = client.request(PacketType::Command, &args.join(" ")).await?;
    println!("{}", response.body());

    client.dispose().await;
    Ok(())
}
