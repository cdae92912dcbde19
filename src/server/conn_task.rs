//! One task per WebSocket client: handshake authentication, then a relay
//! loop between the socket and the coordinator/orchestrator mailboxes.

use std::net::SocketAddr;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use log::{error, info, warn};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response,
};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};

use crate::protocol::{ClientEvent, ServerEvent};
use crate::store::Store;

use super::tournament::TournamentMsg;
use super::{ConnectAck, Message};

/// Pull the bearer token out of the upgrade request: `Authorization: Bearer`
/// wins, a `?token=` query parameter is the fallback for browser clients.
fn extract_token(req: &Request) -> Option<String> {
    if let Some(value) = req.headers().get("authorization") {
        if let Ok(value) = value.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }
    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("token=")
                .map(|token| token.to_string())
        })
    })
}

async fn close_unauthorized(mut ws: WebSocketStream<TcpStream>) {
    let _ = ws
        .close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: "invalid or missing token".into(),
        }))
        .await;
}

async fn handle_connection(
    server: mpsc::Sender<Message>,
    tournaments: mpsc::Sender<TournamentMsg>,
    store: Store,
    stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    // grab the token while the websocket handshake runs
    let mut token = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        token = extract_token(req);
        Ok(resp)
    };
    let ws = accept_hdr_async(stream, callback).await?;

    // the external auth service minted the token; we only resolve it
    let account = match token {
        Some(token) => store.resolve_token(token).await?,
        None => None,
    };
    let Some(account) = account else {
        info!("rejecting unauthenticated connection from {peer}");
        close_unauthorized(ws).await;
        return Ok(());
    };

    let user = account.id;
    let (resp, resp_rx) = oneshot::channel();
    server
        .send(Message::Connect {
            user,
            name: account.name,
            resp,
        })
        .await?;
    let ConnectAck {
        conn_id,
        mut outbox,
    } = resp_rx.await?;

    let (mut sink, mut source) = ws.split();

    // Authenticated and registered. From here on, every exit path tells the
    // coordinator, which decides whether this was a stale connection.
    loop {
        tokio::select! {
            event = outbox.recv() => {
                match event {
                    None => {
                        // replaced by a newer connection for the same user
                        info!("connection of user {user} superseded");
                        let _ = sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                    Some(event) => {
                        let text = serde_json::to_string(&event)?;
                        if sink.send(WsMessage::Text(text)).await.is_err() {
                            server.send(Message::Disconnect { user, conn_id }).await?;
                            break;
                        }
                    }
                }
            }

            frame = source.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<ClientEvent>(&text) {
                            Ok(ClientEvent::Game(event)) => {
                                server.send(Message::Command { user, event }).await?;
                            }
                            Ok(ClientEvent::Tournament(event)) => {
                                tournaments
                                    .send(TournamentMsg::Client { user, event })
                                    .await?;
                            }
                            Err(e) => {
                                warn!("unparseable frame from user {user}: {e}");
                                let error = ServerEvent::GameError {
                                    message: "INVALID_MESSAGE".into(),
                                };
                                let _ = sink
                                    .send(WsMessage::Text(serde_json::to_string(&error)?))
                                    .await;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        info!("user {user} hung up");
                        server.send(Message::Disconnect { user, conn_id }).await?;
                        break;
                    }
                    Some(Ok(_)) => {
                        // pings are answered by the protocol layer; binary is
                        // not part of this protocol
                    }
                    Some(Err(e)) => {
                        warn!("socket error for user {user}: {e:?}");
                        server.send(Message::Disconnect { user, conn_id }).await?;
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

pub(super) fn run_connection(
    server: mpsc::Sender<Message>,
    tournaments: mpsc::Sender<TournamentMsg>,
    store: Store,
    stream: TcpStream,
    peer: SocketAddr,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = handle_connection(server, tournaments, store, stream, peer).await {
            error!("connection from {peer} failed: {e:?}");
        }
    })
}
