use std::io::BufRead;

use anyhow::{Context, Result};
use tokio::{io::AsyncWriteExt, select, sync::mpsc};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    config::ExchangeConfig,
    exchange::{Delivery, Exchange, Handler, Inbox, SharedExchange},
    packet::Packet,
};

type StdinLines = mpsc::UnboundedReceiver<std::io::Result<String>>;

pub async fn run(args: ClientArgs) -> Result<()> {
    let exchange = build_exchange(&args)?;
    let mut inbox = join_channel(&exchange, &args).await?;
    let mut lines = spawn_stdin_reader();

    run_client_loop(&exchange, &args.channel, &mut inbox, &mut lines).await?;
    // Registrations and subscriptions are released by the broker once the
    // connection closes.
    drop(exchange);
    info!(channel = %args.channel, "left channel");

    Ok(())
}

fn build_exchange(args: &ClientArgs) -> Result<SharedExchange> {
    let config = match &args.config {
        Some(path) => ExchangeConfig::from_file(path)?,
        None => ExchangeConfig::wire(args.server.ip().to_string(), args.server.port()),
    };
    debug!(?config, "building exchange");
    config.build().context("failed to build exchange")
}

async fn join_channel(exchange: &SharedExchange, args: &ClientArgs) -> Result<Inbox> {
    let channel = args.channel.as_str();
    let (handler, inbox) = Handler::channel();
    let (joined, banner) = if args.register {
        (
            exchange.register(channel, handler).await,
            format!("*** registered {channel}"),
        )
    } else {
        (
            exchange.subscribe(channel, handler).await,
            format!("*** subscribed to {channel}"),
        )
    };

    if let Err(err) = joined {
        write_stdout(&format!("*** cannot join {channel}: {err}")).await?;
        return Err(err).with_context(|| format!("failed to join {channel}"));
    }

    info!(%channel, exclusive = args.register, "joined channel");
    write_stdout(&banner).await?;
    Ok(inbox)
}

/// Reads stdin on a plain thread. The read blocks and cannot be cancelled,
/// so it must not sit inside `select!` or hold up runtime shutdown.
fn spawn_stdin_reader() -> StdinLines {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let failed = line.is_err();
            if tx.send(line).is_err() || failed {
                break;
            }
        }
    });
    rx
}

async fn run_client_loop(
    exchange: &SharedExchange,
    channel: &str,
    inbox: &mut Inbox,
    lines: &mut StdinLines,
) -> Result<()> {
    loop {
        select! {
            delivery = inbox.recv() => {
                if !handle_delivery(delivery).await? {
                    break;
                }
            }
            line = lines.recv() => {
                if !handle_stdin_line(line, exchange, channel).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                break;
            }
        }
    }
    Ok(())
}

async fn handle_delivery(delivery: Option<Delivery>) -> Result<bool> {
    let Some(Delivery {
        destination,
        mut packet,
    }) = delivery
    else {
        write_stdout("*** exchange closed the channel").await?;
        return Ok(false);
    };

    match packet.read_string() {
        Ok(text) => write_stdout(&format!("{destination} {text}")).await?,
        Err(err) => {
            write_stderr(&format!(
                "!!! {destination}: unreadable packet of {} bytes ({err})",
                packet.len()
            ))
            .await?
        }
    }
    Ok(true)
}

async fn handle_stdin_line(
    line: Option<std::io::Result<String>>,
    exchange: &SharedExchange,
    channel: &str,
) -> Result<bool> {
    let Some(line) = line else {
        return Ok(false);
    };
    let line = line.context("failed to read stdin")?;

    let text = line.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if text.eq_ignore_ascii_case("/quit") {
        write_stdout(&format!("*** leaving {channel}")).await?;
        return Ok(false);
    }

    exchange
        .publish(channel, Packet::from_string(text))
        .await
        .with_context(|| format!("failed to publish to {channel}"))?;
    Ok(true)
}

fn handle_ctrl_c(result: std::io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn write_stdout(line: &str) -> std::io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> std::io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
