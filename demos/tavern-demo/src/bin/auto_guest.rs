//! A scripted guest for exercising a host without a second human.
//!
//! Joins a room, asks for one character token, submits a placeholder
//! turn whenever a turn opens, and answers every roll request with a d20.
//!
//! ```text
//! cargo run --bin auto-guest -- ws://127.0.0.1:8080 R1 bot-1:Robo wizard
//! ```

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::json;
use tavern::prelude::*;
use tokio_tungstenite::tungstenite::Message;

const HEARTBEAT_EVERY: Duration = Duration::from_secs(5);

struct Args {
    url: String,
    room: RoomId,
    auth_token: String,
    character: Token,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let mut args = std::env::args().skip(1);
        let usage = "usage: auto-guest <url> <room> <auth-token> <character>";
        let mut next = |what: &str| args.next().ok_or_else(|| format!("missing {what}\n{usage}"));
        Ok(Self {
            url: next("url")?,
            room: RoomId::from(next("room")?),
            auth_token: next("auth token")?,
            character: Token::from(next("character")?),
        })
    }
}

fn encode(event: &ClientEvent) -> Result<Message, serde_json::Error> {
    Ok(Message::Text(serde_json::to_string(event)?.into()))
}

fn decode(msg: Message) -> Option<ServerEvent> {
    match msg {
        Message::Binary(data) => serde_json::from_slice(&data).ok(),
        Message::Text(text) => serde_json::from_str(text.as_str()).ok(),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse()?;

    let (ws, _) = tokio_tungstenite::connect_async(args.url.as_str()).await?;
    let (mut sink, mut stream) = ws.split();

    sink.send(encode(&ClientEvent::Handshake(
        PROTOCOL_VERSION,
        Some(args.auth_token.clone()),
    ))?)
    .await?;

    let (user_id, name) = loop {
        let Some(msg) = stream.next().await else {
            return Err("connection closed during handshake".into());
        };
        match decode(msg?) {
            Some(ServerEvent::HandshakeAck(user_id, name)) => break (user_id, name),
            Some(ServerEvent::OperationFailed(reason)) => return Err(reason.into()),
            _ => continue,
        }
    };
    tracing::info!(%user_id, %name, room = %args.room, "authenticated, joining");

    sink.send(encode(&ClientEvent::JoinSession(
        user_id.clone(),
        name.clone(),
        args.room.clone(),
    ))?)
    .await?;

    let mut role: Option<Token> = None;
    let mut heartbeat = tokio::time::interval(HEARTBEAT_EVERY);
    let started = std::time::Instant::now();

    loop {
        let event = tokio::select! {
            _ = heartbeat.tick() => {
                let now = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                sink.send(encode(&ClientEvent::Heartbeat(now))?).await?;
                continue;
            }
            msg = stream.next() => match msg {
                Some(msg) => match decode(msg?) {
                    Some(event) => event,
                    None => continue,
                },
                None => break,
            },
        };

        let reply = match event {
            ServerEvent::GuestJoin(_, _, assigned, _) => {
                role = assigned;
                match &role {
                    Some(token) => {
                        tracing::info!(%token, "rejoined with a role");
                        None
                    }
                    None => Some(ClientEvent::RequestAccess(
                        args.room.clone(),
                        user_id.clone(),
                        name.clone(),
                        args.character.clone(),
                    )),
                }
            }
            ServerEvent::GrantToken(token) => {
                if token.is_some() {
                    role = token;
                }
                None
            }
            ServerEvent::RefreshSnapshot if role.is_some() => {
                let caster = role.as_ref().map(Token::as_str).unwrap_or_default();
                let action = Action(json!({"action_type": 0, "caster": caster}));
                Some(ClientEvent::SubmitTurn(
                    args.room.clone(),
                    user_id.clone(),
                    name.clone(),
                    vec![action],
                ))
            }
            ServerEvent::EnableRoll(context) => {
                let value = rand::rng().random_range(1..=DIE_SIDES);
                tracing::info!(ability = %context.ability, value, "rolling");
                Some(ClientEvent::SubmitRoll(
                    args.room.clone(),
                    value,
                    name.clone(),
                    context.action_index,
                ))
            }
            ServerEvent::Log(line) => {
                tracing::info!("{line}");
                None
            }
            ServerEvent::OperationFailed(reason) => {
                tracing::warn!(%reason, "operation failed");
                None
            }
            other => {
                tracing::debug!(event = other.name(), "ignored");
                None
            }
        };

        if let Some(reply) = reply {
            sink.send(encode(&reply)?).await?;
        }
    }

    tracing::info!("server closed the connection");
    Ok(())
}
