use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::config::ServeArgs;
use crate::pool::Session;
use crate::protocol::{ClientMessage, ServerMessage};

#[derive(Parser, Debug)]
#[command(name = "beach-signal")]
#[command(about = "Beach WebRTC signaling relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Connect to a relay and print its offer pool
    Probe {
        /// Relay URL (e.g., ws://localhost:8181)
        #[arg(short, long, default_value = "ws://localhost:8181")]
        url: String,

        /// Identity to connect as
        #[arg(short, long, default_value = "beach-signal-probe")]
        identity: String,

        /// Shared secret
        #[arg(short, long, env = "BEACH_SIGNAL_SHARED_SECRET", default_value = "x")]
        credential: String,

        /// Keep printing pool updates instead of exiting after the first
        #[arg(short, long)]
        watch: bool,
    },
}

pub async fn run_probe(url: String, identity: String, credential: String, watch: bool) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("Connecting to {} as {}", ws_url, identity);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(ws_url.as_str())).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("Failed to connect to {}: {}", ws_url, e);
            return Err(anyhow::anyhow!("Connection failed: {}", e));
        }
        Err(_) => {
            error!("Connection timeout after 5 seconds");
            return Err(anyhow::anyhow!(
                "Connection timeout - is the relay running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    let connect = serde_json::to_string(&ClientMessage::Connect {
        identity,
        credential,
    })?;
    write.send(Message::Text(connect.into())).await?;

    loop {
        let next = match timeout(Duration::from_secs(5), read.next()).await {
            Ok(next) => next,
            Err(_) if watch => continue,
            Err(_) => return Err(anyhow::anyhow!("Timeout waiting for the offer pool")),
        };

        match next {
            Some(Ok(Message::Text(text))) => {
                if let ServerMessage::AvailableOffers { offers } =
                    serde_json::from_str::<ServerMessage>(&text)?
                {
                    print_offers(&offers);
                    if !watch {
                        break;
                    }
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "no reason given".into());
                return Err(anyhow::anyhow!("Relay closed the connection: {}", reason));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => return Err(anyhow::anyhow!("Connection closed unexpectedly")),
        }
    }

    write.send(Message::Close(None)).await?;
    Ok(())
}

fn print_offers(offers: &[Session]) {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║                        OFFER POOL                            ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    if offers.is_empty() {
        println!("║ (no offers)");
    }
    for offer in offers {
        let status = match &offer.answerer_identity {
            Some(answerer) => format!("answered by {}", answerer),
            None => "waiting".to_string(),
        };
        println!(
            "║ {} from {} - {} - candidates {}/{} - since {}",
            offer.id,
            offer.offerer_identity,
            status,
            offer.offer_ice_candidates.len(),
            offer.answerer_ice_candidates.len(),
            offer.created_at.format("%H:%M:%S")
        );
    }
    println!("╚══════════════════════════════════════════════════════════════╝");
}
