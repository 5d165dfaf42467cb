use clap::Parser as _;
use tokio::{signal, task};
use tracing::{Level, debug, info};
use tracing_subscriber::{
    EnvFilter, fmt::format::FmtSpan, prelude::*, util::SubscriberInitExt,
};

use ctmon::{
    conntrack::Consumer,
    runtime::{cli::Cli, conf::Conf},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let (conf, _cli) = Conf::new(cli)?;

    init_tracing(conf.log_level);

    info!(
        event.name = "ctmon.starting",
        version = env!("CARGO_PKG_VERSION"),
        "starting ctmon"
    );

    let consumer = Consumer::new(&conf.conntrack)?;

    // Walk the existing table before subscribing to new-connection events,
    // so downstream sees the full picture of established flows first.
    if conf.conntrack.dump_on_start {
        for family in [libc::AF_INET as u8, libc::AF_INET6 as u8] {
            let rx = consumer.dump_table(family);
            let (batches, messages) = task::spawn_blocking(move || {
                let mut batches = 0u64;
                let mut messages = 0u64;
                for event in rx.iter() {
                    batches += 1;
                    messages += event.len() as u64;
                }
                (batches, messages)
            })
            .await?;

            info!(
                event.name = "ctmon.dump_complete",
                family = family,
                batches = batches,
                messages = messages,
                "conntrack table dump complete"
            );
        }
    }

    let events = consumer.events();
    let stream = task::spawn_blocking(move || {
        let mut total = 0u64;
        for event in events.iter() {
            total += event.len() as u64;
            debug!(
                event.name = "ctmon.batch_received",
                messages = event.len(),
                "received conntrack event batch"
            );
        }
        total
    });

    signal::ctrl_c().await?;
    info!(event.name = "ctmon.stopping", "received ctrl-c, stopping");
    consumer.stop();

    let total = stream.await?;
    info!(
        event.name = "ctmon.stopped",
        messages_total = total,
        "ctmon stopped"
    );
    Ok(())
}

fn init_tracing(level: Level) {
    let mut fmt_layer = tracing_subscriber::fmt::layer()
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(std::env::var("NO_COLOR").is_err());

    match level {
        Level::DEBUG => fmt_layer = fmt_layer.with_file(true).with_line_number(true),
        Level::TRACE => {
            fmt_layer = fmt_layer
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true)
        }
        _ => {}
    }

    let filter = EnvFilter::new(format!("warn,ctmon={level}"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}
