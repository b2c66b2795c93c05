use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tasklive_shared::{ClientFrame, PushFrame};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::{IntoClientRequest, uri_mode};
use tokio_tungstenite::tungstenite::stream::Mode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, instrument, warn};

use crate::push::ChannelEvent;

const CHANNEL_BUFFER: usize = 256;

/// Both ends of a running push channel plus its driver task.
pub struct PushChannel {
    pub events: mpsc::Receiver<ChannelEvent>,
    pub outbound: mpsc::Sender<ClientFrame>,
    pub driver: JoinHandle<()>,
}

enum PumpEnd {
    Lost(String),
    Shutdown,
}

/// Rejects anything that is not a `ws://` or `wss://` address before the
/// driver starts retrying against it.
pub fn check_url(url: &str) -> anyhow::Result<()> {
    let request = url
        .into_client_request()
        .with_context(|| format!("invalid socket url {url:?}"))?;
    let mode = uri_mode(request.uri()).with_context(|| format!("unsupported socket url {url:?}"))?;
    debug!(url, tls = matches!(mode, Mode::Tls), "socket url accepted");
    Ok(())
}

/// Connects to `url` and keeps reconnecting after `reconnect_delay`
/// until the event receiver or the outbound sender is dropped.
pub fn open(url: String, reconnect_delay: Duration) -> PushChannel {
    let (events_tx, events) = mpsc::channel(CHANNEL_BUFFER);
    let (outbound, outbound_rx) = mpsc::channel(CHANNEL_BUFFER);
    let driver = tokio::spawn(drive(url, reconnect_delay, events_tx, outbound_rx));
    PushChannel {
        events,
        outbound,
        driver,
    }
}

#[instrument(skip(reconnect_delay, events_tx, outbound_rx))]
async fn drive(
    url: String,
    reconnect_delay: Duration,
    events_tx: mpsc::Sender<ChannelEvent>,
    mut outbound_rx: mpsc::Receiver<ClientFrame>,
) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                info!("push channel open");
                if events_tx.send(ChannelEvent::Connected).await.is_err() {
                    return;
                }
                match pump(ws, &events_tx, &mut outbound_rx).await {
                    PumpEnd::Shutdown => {
                        debug!("push channel shut down by client");
                        return;
                    }
                    PumpEnd::Lost(reason) => {
                        if events_tx
                            .send(ChannelEvent::Disconnected { reason })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
            }
            Err(err) => warn!(error = %err, "push channel connect failed"),
        }

        if events_tx.is_closed() {
            return;
        }
        tokio::time::sleep(reconnect_delay).await;
    }
}

async fn pump(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    events_tx: &mpsc::Sender<ChannelEvent>,
    outbound_rx: &mut mpsc::Receiver<ClientFrame>,
) -> PumpEnd {
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(frame) = decode_frame(text.as_str())
                        && events_tx.send(ChannelEvent::Frame(frame)).await.is_err()
                    {
                        let _ = sink.close().await;
                        return PumpEnd::Shutdown;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    return PumpEnd::Lost("closed by server".to_string());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return PumpEnd::Lost(err.to_string()),
            },
            outgoing = outbound_rx.recv() => match outgoing {
                Some(frame) => {
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(err) => {
                            warn!(error = %err, "failed to serialize outbound frame");
                            continue;
                        }
                    };
                    if let Err(err) = sink.send(Message::Text(json.into())).await {
                        return PumpEnd::Lost(err.to_string());
                    }
                }
                None => {
                    let _ = sink.close().await;
                    return PumpEnd::Shutdown;
                }
            },
        }
    }
}

/// Parses one text frame; unknown or malformed events are logged and
/// skipped.
pub fn decode_frame(text: &str) -> Option<PushFrame> {
    match serde_json::from_str::<PushFrame>(text) {
        Ok(frame) => Some(frame),
        Err(err) => {
            let event = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|value| value.get("event").and_then(|e| e.as_str()).map(str::to_string));
            debug!(event = ?event, error = %err, "ignoring push frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_frames_and_skips_the_rest() {
        let frame = decode_frame(r#"{"event":"task:deleted","data":{"id":3}}"#);
        assert_eq!(frame.map(|f| f.event_name()), Some("task:deleted"));

        assert!(decode_frame(r#"{"event":"typing","data":{}}"#).is_none());
        assert!(decode_frame("not json").is_none());
    }

    #[test]
    fn socket_urls_accept_plain_and_tls_schemes() {
        assert!(check_url("ws://localhost:5000/ws").is_ok());
        assert!(check_url("wss://tasks.example.com/ws").is_ok());
        assert!(check_url("http://localhost:5000/ws").is_err());
        assert!(check_url("not a url").is_err());
    }

    #[test]
    fn identify_frame_matches_the_wire_shape() {
        let frame = ClientFrame::Identify(tasklive_shared::IdentifyArgs {
            username: "ana".to_string(),
            color: "#10b981".to_string(),
        });
        let json = serde_json::to_value(&frame).expect("serialize identify");
        assert_eq!(json["event"], "user:identify");
        assert_eq!(json["data"]["username"], "ana");
    }
}
