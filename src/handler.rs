//! WebSocket connection handler
//!
//! Handles individual client connections: WebSocket handshake, token and
//! membership checks, and the reader/writer task pair that binds the socket
//! to the broadcast hub.

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use crate::connection::{Connection, Frame};
use crate::error::AppError;
use crate::event::ErrorBody;
use crate::state::AppState;
use crate::types::{ConnectionId, ConversationId, UserId};

/// Parameters read from the upgrade request's query string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    pub token: String,
    pub conversation_id: ConversationId,
}

impl ConnectParams {
    /// Parse `token=..&conversation_id=..`; both are required
    pub fn from_query(query: Option<&str>) -> Result<Self, AppError> {
        let mut token = None;
        let mut conversation_id = None;

        for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "token" => token = Some(value.into_owned()),
                "conversation_id" => conversation_id = Some(value.into_owned()),
                _ => {}
            }
        }

        let token = token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::InvalidInput("token is required".into()))?;
        let conversation_id = conversation_id
            .ok_or_else(|| AppError::InvalidInput("conversation_id is required".into()))?
            .parse::<ConversationId>()?;

        Ok(Self {
            token,
            conversation_id,
        })
    }
}

/// Accept connections forever, one handler task per socket
pub async fn serve(listener: TcpListener, state: AppState) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("New connection from {}", addr);
                let state = state.clone();

                tokio::spawn(async move {
                    match handle_connection(stream, state).await {
                        Err(e) if e.is_fatal() => error!("Connection handler error: {}", e),
                        Err(e) => warn!("Connection ended with error: {}", e),
                        Ok(()) => {}
                    }
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

/// Handle a new TCP connection
///
/// Refused connections get one error frame followed by a policy-violation
/// close; accepted ones stay registered with the hub until either side ends.
pub async fn handle_connection(stream: TcpStream, state: AppState) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    let mut query = None;
    let mut ws_stream =
        tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
            query = req.uri().query().map(str::to_owned);
            Ok(resp)
        })
        .await?;

    let (user_id, conversation_id) = match authorize(&state, query.as_deref()).await {
        Ok(bound) => bound,
        Err(e) => {
            warn!("Refusing connection from {}: {}", peer_addr, e);
            reject(&mut ws_stream, &e).await;
            return Ok(());
        }
    };

    let connection_id = ConnectionId::new();
    let (frame_tx, mut frame_rx) = mpsc::channel::<Frame>(state.outbound_buffer);
    state
        .hub
        .register(Connection::new(
            connection_id,
            user_id,
            conversation_id,
            frame_tx,
        ))
        .await?;
    info!(
        "User {} connected to conversation {} from {}",
        user_id, conversation_id, peer_addr
    );

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Inbound frames carry no commands; the reader only watches for the end
    let mut read_task = tokio::spawn(async move {
        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(Message::Close(_)) => {
                    debug!("Connection {} sent close frame", connection_id);
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("WebSocket error for {}: {}", connection_id, e);
                    break;
                }
            }
        }
    });

    // Ends when the hub drops the sender (unregister or eviction)
    let mut write_task = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if ws_sender
                .send(Message::Text(frame.to_string().into()))
                .await
                .is_err()
            {
                debug!("WebSocket send failed, ending write task");
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    // Whichever side finishes first takes the other down with it
    tokio::select! {
        _ = &mut read_task => {
            debug!("Read task completed for {}", connection_id);
            write_task.abort();
        }
        _ = &mut write_task => {
            debug!("Write task completed for {}", connection_id);
            read_task.abort();
        }
    }

    state.hub.unregister(connection_id).await?;
    info!("User {} left conversation {}", user_id, conversation_id);

    Ok(())
}

async fn authorize(
    state: &AppState,
    query: Option<&str>,
) -> Result<(UserId, ConversationId), AppError> {
    let params = ConnectParams::from_query(query)?;
    let user_id = state.validator.validate(&params.token).await?;

    if !state
        .conversations
        .is_participant(params.conversation_id, user_id)
        .await?
    {
        return Err(AppError::Unauthorized(
            "not a participant of this conversation".into(),
        ));
    }

    Ok((user_id, params.conversation_id))
}

async fn reject(ws_stream: &mut WebSocketStream<TcpStream>, err: &AppError) {
    match serde_json::to_string(&ErrorBody::from(err)) {
        Ok(json) => {
            let _ = ws_stream.send(Message::Text(json.into())).await;
        }
        Err(e) => error!("Failed to serialize error frame: {}", e),
    }

    let frame = CloseFrame {
        code: CloseCode::Policy,
        reason: "connection refused".into(),
    };
    let _ = ws_stream.close(Some(frame)).await;
}
