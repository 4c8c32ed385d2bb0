//! Command execution

use std::future::Future;
use std::time::Duration;

use rendezvous_ble::platform_bridge;
use rendezvous_core::{
    Bridge, CentralRadio, Identity, InboundMessage, LinkPhase, Mailbox, PeerSummary,
    PeripheralRadio, StationOptions, VirtualAir, WriteReport,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::cli::Commands;
use crate::config::AppConfig;
use crate::error::{CliError, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

// ----------------------------------------------------------------------------
// Output Formatting
// ----------------------------------------------------------------------------

/// Printable payload: text when it is UTF-8 without control characters, hex otherwise
pub fn format_payload(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) if !text.chars().any(char::is_control) => text.to_string(),
        _ => format!("0x{}", hex::encode(payload)),
    }
}

pub fn format_message(message: &InboundMessage) -> String {
    format!(
        "[{}] {}: {}",
        message.via,
        message.peer_id,
        format_payload(&message.payload)
    )
}

fn format_report(report: &WriteReport) -> String {
    let mut out = format!("Wrote to {} peer(s)", report.delivered.len());
    for (peer, err) in &report.failed {
        out.push_str(&format!("\n  {} failed: {}", peer, err));
    }
    out
}

/// One `peers` line: address, name, phase and seconds since discovery
pub fn format_peer(peer: &PeerSummary) -> String {
    format!(
        "{}\t{}\t{}\t{}s",
        peer.address,
        peer.local_name.as_deref().unwrap_or("-"),
        peer.phase,
        peer.discovered_at.elapsed().as_secs()
    )
}

/// Parse a `send` argument into the bytes to transmit
pub fn parse_payload(message: &str, is_hex: bool) -> Result<Vec<u8>> {
    if is_hex {
        let digits = message.trim().trim_start_matches("0x");
        Ok(hex::decode(digits)?)
    } else {
        Ok(message.as_bytes().to_vec())
    }
}

/// Poll `ready` until it holds or `window` elapses
async fn wait_until<F, Fut>(window: Duration, mut ready: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    timeout(window, async {
        while !ready().await {
            sleep(POLL_INTERVAL).await;
        }
    })
    .await
    .is_ok()
}

async fn has_subscribed_peer<C: CentralRadio, P: PeripheralRadio>(bridge: &Bridge<C, P>) -> bool {
    bridge
        .peers()
        .await
        .iter()
        .any(|peer| peer.phase == LinkPhase::Subscribed)
}

// ----------------------------------------------------------------------------
// Application
// ----------------------------------------------------------------------------

pub struct App {
    config: AppConfig,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn execute(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Run => self.run().await,
            Commands::Send {
                message,
                hex,
                write,
                wait,
            } => {
                let payload = parse_payload(&message, hex)?;
                self.send(&payload, write, self.window(wait)).await
            }
            Commands::Peers { wait } => self.peers(self.window(wait)).await,
            Commands::Identity => {
                println!("{}", self.describe_identity());
                Ok(())
            }
            Commands::Config => {
                print!("{}", self.config.to_toml()?);
                Ok(())
            }
            Commands::Demo { message } => {
                let outcome = run_demo(&self.config, message.as_bytes()).await?;
                println!("Y received {}", format_message(&outcome.notified));
                println!("X received {}", format_message(&outcome.written));
                Ok(())
            }
        }
    }

    fn window(&self, wait: Option<u64>) -> Duration {
        wait.map(Duration::from_secs)
            .unwrap_or_else(|| self.config.discovery_window())
    }

    pub fn describe_identity(&self) -> String {
        let identity = Identity::derive(&self.config.identity.client_id);
        format!(
            "client id:      {}\nshort hash:     {:04x}\nservice:        {}\ncharacteristic: {}",
            self.config.identity.client_id,
            identity.short_hash(),
            identity.service_uuid(),
            identity.characteristic_uuid()
        )
    }

    /// Interactive bridge until stdin closes or Ctrl-C
    async fn run(&self) -> Result<()> {
        let (sink, mut inbound) = mpsc::unbounded_channel::<InboundMessage>();
        let bridge = platform_bridge(sink, self.config.bridge_config()).await?;

        let self_id = self.config.self_id();
        let mode = bridge
            .start(&self.config.identity.client_id, &self_id)
            .await?;
        info!(
            "Bridge running as {:?} ({:?}, link timeout {:?})",
            self_id,
            mode,
            bridge.config().link_timeout
        );

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                Some(message) = inbound.recv() => {
                    println!("{}", format_message(&message));
                }
                line = lines.next_line() => match line? {
                    Some(line) if line.is_empty() => continue,
                    Some(line) => {
                        if let Err(e) = bridge.send(line.as_bytes()).await {
                            warn!("Send failed: {}", e);
                        }
                    }
                    None => break,
                },
                _ = tokio::signal::ctrl_c() => {
                    debug!("Interrupted");
                    break;
                }
            }
        }

        bridge.stop().await?;
        Ok(())
    }

    async fn send(&self, payload: &[u8], write: bool, window: Duration) -> Result<()> {
        let bridge = platform_bridge(Mailbox::new(), self.config.bridge_config()).await?;
        bridge
            .start(&self.config.identity.client_id, &self.config.self_id())
            .await?;

        let linked = &bridge;
        let found = wait_until(window, move || async move {
            linked.subscriber_count().await > 0 || (write && has_subscribed_peer(linked).await)
        })
        .await;
        if !found {
            warn!("No peers found within {:?}", window);
        }

        let outcome = bridge.send(payload).await;
        if outcome.is_ok() {
            println!(
                "Notified {} subscriber(s)",
                bridge.subscriber_count().await
            );
        }
        if write {
            println!("{}", format_report(&bridge.write_to_peers(payload).await));
        }

        bridge.stop().await?;
        Ok(outcome?)
    }

    async fn peers(&self, window: Duration) -> Result<()> {
        let bridge = platform_bridge(Mailbox::new(), self.config.bridge_config()).await?;
        bridge
            .start(&self.config.identity.client_id, &self.config.self_id())
            .await?;
        sleep(window).await;

        let peers = bridge.peers().await;
        if peers.is_empty() {
            println!("No peers found");
        }
        for peer in &peers {
            println!("{}", format_peer(peer));
        }
        println!("{} subscriber(s)", bridge.subscriber_count().await);

        bridge.stop().await?;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Demo
// ----------------------------------------------------------------------------

/// What each side of the demo received
#[derive(Debug, Clone)]
pub struct DemoOutcome {
    /// X's notification as seen by Y
    pub notified: InboundMessage,
    /// Y's write as seen by X
    pub written: InboundMessage,
}

/// Link two bridges on a virtual radio, then exchange `payload` both ways
pub async fn run_demo(config: &AppConfig, payload: &[u8]) -> Result<DemoOutcome> {
    if payload.is_empty() {
        return Err(CliError::Demo("message must not be empty".to_string()));
    }

    let air = VirtualAir::new();
    let bridge_config = config.bridge_config().with_peripheral(true);
    let window = config.discovery_window();
    let client_id = &config.identity.client_id;

    let (central, peripheral) = air.station("virtual-x", StationOptions::default()).await;
    let x_inbox = Mailbox::new();
    let x = Bridge::with_config(central, peripheral, x_inbox.clone(), bridge_config.clone())?;

    let (central, peripheral) = air.station("virtual-y", StationOptions::default()).await;
    let y_inbox = Mailbox::new();
    let y = Bridge::with_config(central, peripheral, y_inbox.clone(), bridge_config)?;

    x.start(client_id, "X").await?;
    y.start(client_id, "Y").await?;

    let (x_ref, y_ref) = (&x, &y);
    let linked = wait_until(window, move || async move {
        has_subscribed_peer(x_ref).await
            && has_subscribed_peer(y_ref).await
            && x_ref.subscriber_count().await > 0
            && y_ref.subscriber_count().await > 0
    })
    .await;
    if !linked {
        return Err(CliError::Demo("bridges did not link".to_string()));
    }
    debug!("Virtual bridges linked");

    x.send(payload).await?;
    let notified = wait_for_message(&y_inbox, window)
        .await
        .ok_or_else(|| CliError::Demo("notification not delivered".to_string()))?;

    let report = y.write_to_peers(payload).await;
    if !report.is_complete() {
        return Err(CliError::Demo(format_report(&report)));
    }
    let written = wait_for_message(&x_inbox, window)
        .await
        .ok_or_else(|| CliError::Demo("write not delivered".to_string()))?;

    x.stop().await?;
    y.stop().await?;
    Ok(DemoOutcome { notified, written })
}

async fn wait_for_message(inbox: &Mailbox, window: Duration) -> Option<InboundMessage> {
    let mut changes = inbox.watch();
    let arrived = matches!(
        timeout(window, changes.wait_for(Option::is_some)).await,
        Ok(Ok(_))
    );
    if arrived {
        inbox.take()
    } else {
        None
    }
}
