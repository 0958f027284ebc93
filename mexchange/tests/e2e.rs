use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{anyhow, Context, Result};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, Command},
    sync::mpsc,
    time::timeout,
};

const LINE_TIMEOUT: Duration = Duration::from_secs(5);

/// One running `mexchange` process with its stdout split into lines.
struct Node {
    name: String,
    child: Child,
    stdin: ChildStdin,
    lines: mpsc::UnboundedReceiver<String>,
}

impl Node {
    fn spawn(name: &str, args: &[&str], log_level: &str) -> Result<Self> {
        let mut child = Command::new(Path::new(env!("CARGO_BIN_EXE_mexchange")))
            .args(args)
            .env("RUST_LOG", log_level)
            .env("NO_COLOR", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {name}"))?;

        let stdin = child.stdin.take().context("stdin missing after spawn")?;
        let stdout = child.stdout.take().context("stdout missing after spawn")?;

        // Forward every line so the pipe never fills up.
        let (tx, lines) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            name: name.to_owned(),
            child,
            stdin,
            lines,
        })
    }

    fn broker() -> Result<Self> {
        Self::spawn("broker", &["broker", "--listen", "127.0.0.1:0"], "info")
    }

    fn client(name: &str, addr: &str, channel: &str, register: bool) -> Result<Self> {
        let mut args = vec!["client", "--channel", channel, "--server", addr];
        if register {
            args.push("--register");
        }
        Self::spawn(name, &args, "warn")
    }

    async fn next_line(&mut self) -> Result<String> {
        timeout(LINE_TIMEOUT, self.lines.recv())
            .await
            .with_context(|| format!("{} printed nothing in time", self.name))?
            .with_context(|| format!("{} closed stdout", self.name))
    }

    async fn expect_line(&mut self, expected: &str) -> Result<()> {
        let line = self.next_line().await?;
        if line != expected {
            return Err(anyhow!("{} printed '{line}', expected '{expected}'", self.name));
        }
        Ok(())
    }

    async fn listening_addr(&mut self) -> Result<String> {
        loop {
            let line = self.next_line().await?;
            if let Some((_, addr)) = line.split_once("broker listening on ") {
                return Ok(addr.trim().to_owned());
            }
        }
    }

    async fn say(&mut self, text: &str) -> Result<()> {
        self.stdin.write_all(format!("{text}\n").as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn exit_code(mut self) -> Result<Option<i32>> {
        let status = timeout(LINE_TIMEOUT, self.child.wait())
            .await
            .with_context(|| format!("{} did not exit", self.name))??;
        Ok(status.code())
    }
}

#[tokio::test]
async fn broker_and_clients_share_channels_over_the_wire() -> Result<()> {
    let mut broker = Node::broker()?;
    let addr = broker.listening_addr().await?;

    let mut alice = Node::client("alice", &addr, "lobby", false)?;
    alice.expect_line("*** subscribed to lobby").await?;
    let mut bob = Node::client("bob", &addr, "lobby", false)?;
    bob.expect_line("*** subscribed to lobby").await?;

    // A broadcast id cannot be claimed exclusively.
    let mut carol = Node::client("carol", &addr, "lobby", true)?;
    carol
        .expect_line("*** cannot join lobby: ERR_ALREADY_EXISTS")
        .await?;
    assert_eq!(carol.exit_code().await?, Some(1));

    // An exclusive owner receives what is published to its id.
    let mut dave = Node::client("dave", &addr, "desk.1", true)?;
    dave.expect_line("*** registered desk.1").await?;
    dave.say("ping").await?;
    dave.expect_line("desk.1 ping").await?;

    // Every subscriber hears a broadcast, the sender included.
    alice.say("hello from alice").await?;
    bob.expect_line("lobby hello from alice").await?;
    alice.expect_line("lobby hello from alice").await?;

    alice.say("/quit").await?;
    alice.expect_line("*** leaving lobby").await?;
    assert_eq!(alice.exit_code().await?, Some(0));

    bob.say("anyone?").await?;
    bob.expect_line("lobby anyone?").await?;

    for mut node in [bob, dave] {
        node.say("/quit").await?;
        let line = node.next_line().await?;
        assert!(line.starts_with("*** leaving "), "unexpected '{line}'");
        assert_eq!(node.exit_code().await?, Some(0));
    }

    broker.child.kill().await?;
    Ok(())
}
