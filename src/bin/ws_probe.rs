// Market stream connectivity check: connect, subscribe to depth, print mids.
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use standx_mm::standx::messages::{parse_frame, subscribe_frame, StreamEvent, CHANNEL_DEPTH};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let url = std::env::var("STANDX_WS_URL")
        .unwrap_or_else(|_| "wss://perps.standx.com/ws-stream/v1".to_string());
    let symbol = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LIMIT_ORDER_SYMBOL").ok())
        .unwrap_or_else(|| "BTC-USD".to_string());
    let count: usize = std::env::args().nth(2).and_then(|n| n.parse().ok()).unwrap_or(10);

    println!("Testing WebSocket connection to StandX...");
    println!("URL: {}", url);
    println!("Attempting connection with 10s timeout...");

    let ws = match tokio::time::timeout(Duration::from_secs(10), connect_async(url.as_str())).await {
        Ok(Ok((ws, response))) => {
            println!("✅ SUCCESS! Connected to WebSocket");
            println!("Response status: {:?}", response.status());
            ws
        }
        Ok(Err(e)) => {
            println!("❌ Connection error: {}", e);
            anyhow::bail!("connect failed: {e:?}");
        }
        Err(_) => {
            println!("⏱️ TIMEOUT after 10 seconds");
            anyhow::bail!("connect timeout");
        }
    };

    let (mut write, mut read) = ws.split();
    write
        .send(Message::Text(subscribe_frame(CHANNEL_DEPTH, &symbol)))
        .await?;
    println!("📡 Subscribed to {} {}", CHANNEL_DEPTH, symbol);

    let mut seen = 0;
    while seen < count {
        let msg = match tokio::time::timeout(Duration::from_secs(30), read.next()).await {
            Ok(Some(msg)) => msg?,
            Ok(None) => {
                println!("🔌 stream closed by server");
                break;
            }
            Err(_) => {
                println!("⏱️ no frame in 30s");
                break;
            }
        };
        match msg {
            Message::Text(text) => {
                for event in parse_frame(&text) {
                    if let StreamEvent::Depth(d) = event {
                        seen += 1;
                        println!(
                            "#{:<3} seq={:?} bid={} ask={} mid={}",
                            seen,
                            d.seq,
                            d.best_bid,
                            d.best_ask,
                            d.mid()
                        );
                    }
                }
            }
            Message::Ping(payload) => write.send(Message::Pong(payload)).await?,
            _ => {}
        }
    }
    let _ = write.send(Message::Close(None)).await;
    Ok(())
}
