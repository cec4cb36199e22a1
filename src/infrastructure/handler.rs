use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use tokio::io::AsyncReadExt;

use crate::domain::{BrokerError, Message, Result};
use crate::infrastructure::broker::MessageBroker;
use crate::infrastructure::client::{BodyReader, ClientEvents, SocketClient};

/// Upper bound on an inbound body this handler is willing to buffer.
pub const MAX_BODY_SIZE: u64 = 64 * 1024 * 1024;

/// Wires socket envelopes to broker calls.
///
/// The envelope metadata carries a small text command; the body carries the
/// payload where one applies. Replies go back on the same connection:
///
/// ```text
/// produce <topic> [meta...]       body = payload   -> "ok <offset> <micros>"
/// consume <topic> <group>                          -> "msg <offset> <micros> [meta...]" + body, or "none"
/// consume <topic> at <offset>                      -> same reply shape as above
/// peek <topic> <offset>                            -> "msg <offset> <micros> [meta...]", empty body, or "none"
/// seek <topic> <group> <offset>                    -> "ok"
/// topics                                           -> newline-joined names
/// stats                                            -> "<name> <count>" per line
/// ```
///
/// Anything else answers `err <reason>`. The whole body is read up front,
/// and a body above [`MAX_BODY_SIZE`] is drained rather than buffered, so a
/// failed command never leaves the connection's framing desynchronized.
pub struct BrokerHandler {
    broker: Arc<MessageBroker>,
}

impl BrokerHandler {
    pub fn new(broker: Arc<MessageBroker>) -> Self {
        Self { broker }
    }

    async fn dispatch(&self, meta: &str, body: Vec<u8>) -> Result<(String, Vec<u8>)> {
        let parts: Vec<&str> = meta.split_whitespace().collect();
        match parts.as_slice() {
            ["produce", topic, record_meta @ ..] => {
                let record_meta = record_meta.join(" ");
                match self.broker.produce(topic, &record_meta, &body)? {
                    Some((offset, timestamp)) => Ok((
                        format!("ok {offset} {}", timestamp.timestamp_micros()),
                        Vec::new(),
                    )),
                    // broker is draining; tell the client rather than hang
                    None => Ok(("err broker is stopping".to_string(), Vec::new())),
                }
            }
            ["consume", topic, group] => {
                Ok(reply_message(self.broker.consume_group(topic, group)?))
            }
            ["consume", topic, "at", offset] => {
                let offset = parse_offset(offset)?;
                Ok(reply_message(self.broker.consume_at(topic, offset)?))
            }
            ["peek", topic, offset] => {
                let offset = parse_offset(offset)?;
                Ok(reply_message(self.broker.peek(topic, offset)?))
            }
            ["seek", topic, group, offset] => {
                let offset = parse_offset(offset)?;
                if self.broker.set_offset(topic, group, offset)? {
                    Ok(("ok".to_string(), Vec::new()))
                } else {
                    Ok(("err broker is stopping".to_string(), Vec::new()))
                }
            }
            ["topics"] => Ok((self.broker.topic_names().join("\n"), Vec::new())),
            ["stats"] => {
                let lines: Vec<String> = self
                    .broker
                    .topic_statistics()
                    .iter()
                    .map(|s| format!("{} {}", s.name, s.message_count))
                    .collect();
                Ok((lines.join("\n"), Vec::new()))
            }
            _ => Ok((format!("err unknown command '{meta}'"), Vec::new())),
        }
    }
}

#[async_trait]
impl ClientEvents for BrokerHandler {
    async fn on_started(&self, client: &Arc<SocketClient>) -> Result<()> {
        debug!("client {} connected from {}", client.id(), client.peer_addr());
        Ok(())
    }

    async fn on_stopped(&self, client: &Arc<SocketClient>) -> Result<()> {
        debug!("client {} disconnected", client.id());
        Ok(())
    }

    async fn on_message(
        &self,
        client: &Arc<SocketClient>,
        meta: &str,
        body_size: u64,
        body: &mut BodyReader<'_>,
    ) -> Result<()> {
        let (reply_meta, reply_body) = if body_size > MAX_BODY_SIZE {
            // drain the capped reader so the framing survives the refusal
            tokio::io::copy(body, &mut tokio::io::sink()).await?;
            (
                format!("err body of {body_size} bytes exceeds the {MAX_BODY_SIZE} byte limit"),
                Vec::new(),
            )
        } else {
            let mut payload = vec![0u8; body_size as usize];
            body.read_exact(&mut payload).await?;
            match self.dispatch(meta, payload).await {
                Ok(reply) => reply,
                Err(e) => (format!("err {e}"), Vec::new()),
            }
        };
        client.send(&reply_meta, &reply_body).await
    }
}

fn reply_message(message: Option<Message>) -> (String, Vec<u8>) {
    match message {
        Some(message) => {
            let offset = message.offset.unwrap_or(0);
            let micros = message
                .timestamp
                .map(|t| t.timestamp_micros())
                .unwrap_or(0);
            let mut reply = format!("msg {offset} {micros}");
            if !message.meta.is_empty() {
                reply.push(' ');
                reply.push_str(&message.meta);
            }
            (reply, message.body)
        }
        None => ("none".to_string(), Vec::new()),
    }
}

fn parse_offset(value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| BrokerError::InvalidCommand(format!("'{value}' is not a valid offset")))
}
