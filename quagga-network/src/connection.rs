//! One transport connection.
//!
//! Every connection runs as its own task (its strand): receive callbacks,
//! sends and close are serialized here, while different connections run in
//! parallel on the runtime. The task owns the framed socket, the two send
//! queues, the chunk reassembly state and the keepalive timer.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant as TokioInstant};
use tokio_util::codec::Framed;
use tracing::{debug, trace, warn};

use crate::constants::{PING_INTERVAL, PING_TIMEOUT, SEND_BUDGET_BYTES};
use crate::error::Error;
use crate::protocol::codec::Codec;
use crate::protocol::message::{Message, MessageBuilder, ParsedFrame};
use crate::protocol::tags::{header, TagValue};

/// Identifies one connection within a manager.
pub type ConnectionId = i32;

/// Send priority. Control traffic bypasses queued bulk data; chunked
/// transmission is illegal at high priority.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Priority {
    Normal,
    High,
}

/// Whether we dialed the peer or it dialed us. Outgoing connections ping;
/// incoming connections expect pings.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Commands accepted by a connection task.
pub(crate) enum Command {
    Send(Message, Priority),
    Close,
}

/// Where a connection's events land. Implemented by the manager.
pub(crate) trait Dispatcher: Send + Sync {
    /// A complete logical message arrived.
    fn deliver(&self, message: Message);
}

/// The sending half the manager keeps per connection.
#[derive(Clone)]
pub(crate) struct ConnectionHandle {
    pub sender: mpsc::UnboundedSender<Command>,
}

impl ConnectionHandle {
    pub fn send(&self, message: Message, priority: Priority) {
        let _ = self.sender.send(Command::Send(message, priority));
    }

    pub fn close(&self) {
        let _ = self.sender.send(Command::Close);
    }
}

struct Reassembly {
    service_id: u32,
    message_id: u32,
    expected: usize,
    buffer: BytesMut,
}

/// Drive one connection until it closes or fails.
///
/// The returned error tells the manager what happened; ban-scoring and
/// reconnect policy live there.
pub(crate) async fn run_connection(
    stream: TcpStream,
    id: ConnectionId,
    direction: Direction,
    dispatcher: Arc<dyn Dispatcher>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    login: Option<Message>,
) -> Result<(), Error> {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let codec = Codec::builder().with_metrics_label(peer.clone()).finish();
    let mut framed = Framed::new(stream, codec);

    let mut priority_queue: VecDeque<Bytes> = VecDeque::new();
    let mut normal_queue: VecDeque<Bytes> = VecDeque::new();
    let mut reassembly: Option<Reassembly> = None;
    let mut awaiting_first_frame = true;

    // On outbound connections the login cookie goes out before any user
    // traffic.
    if let Some(login) = login {
        match MessageBuilder::build(&login) {
            Ok(frame) => priority_queue.push_back(frame),
            Err(error) => warn!(%error, "could not build login message"),
        }
    }

    let ping_deadline = match direction {
        Direction::Outbound => TokioInstant::from_std(Instant::now() + PING_INTERVAL),
        Direction::Inbound => TokioInstant::from_std(Instant::now() + PING_TIMEOUT),
    };
    let ping_timer = sleep_until(ping_deadline);
    tokio::pin!(ping_timer);

    loop {
        // Drain up to the per-round budget, control traffic first.
        let mut budget = SEND_BUDGET_BYTES;
        while budget > 0 {
            let frame = match priority_queue.pop_front() {
                Some(frame) => frame,
                None => match normal_queue.pop_front() {
                    Some(frame) => frame,
                    None => break,
                },
            };
            budget = budget.saturating_sub(frame.len() + 2);
            framed.feed(frame).await?;
        }
        framed.flush().await?;

        tokio::select! {
            command = commands.recv() => match command {
                None | Some(Command::Close) => {
                    debug!(id, "connection closed locally");
                    return Ok(());
                }
                Some(Command::Send(message, priority)) => {
                    queue_message(&mut priority_queue, &mut normal_queue, message, priority)?;
                }
            },
            frame = framed.next() => match frame {
                None => return Err(Error::Closed),
                Some(Err(error)) => return Err(error),
                Some(Ok(payload)) => {
                    let parsed = ParsedFrame::parse(payload)?;
                    if awaiting_first_frame {
                        if !parsed.leads_with_service_id {
                            return Err(Error::NotOurProtocol);
                        }
                        awaiting_first_frame = false;
                    }

                    if parsed.ping {
                        trace!(id, "ping");
                        priority_queue.push_back(MessageBuilder::build_system(
                            header::PONG,
                            TagValue::Bool(true),
                        ));
                        if direction == Direction::Inbound {
                            ping_timer
                                .as_mut()
                                .reset(TokioInstant::from_std(Instant::now() + PING_TIMEOUT));
                        }
                        continue;
                    }
                    if parsed.pong {
                        trace!(id, "pong");
                        continue;
                    }

                    if let Some(message) = receive_frame(&mut reassembly, parsed, id)? {
                        dispatcher.deliver(message);
                    }
                }
            },
            _ = ping_timer.as_mut() => match direction {
                Direction::Outbound => {
                    priority_queue.push_back(MessageBuilder::build_system(
                        header::PING,
                        TagValue::Bool(true),
                    ));
                    ping_timer
                        .as_mut()
                        .reset(TokioInstant::from_std(Instant::now() + PING_INTERVAL));
                }
                Direction::Inbound => {
                    debug!(id, "no ping within the keepalive window, disconnecting");
                    return Err(Error::Closed);
                }
            },
        }
    }
}

/// Turn an outgoing message into frames on the right queue.
fn queue_message(
    priority_queue: &mut VecDeque<Bytes>,
    normal_queue: &mut VecDeque<Bytes>,
    message: Message,
    priority: Priority,
) -> Result<(), Error> {
    if message.needs_chunking() {
        if priority == Priority::High {
            warn!("cannot send a chunked message at high priority, dropping");
            return Ok(());
        }
        for frame in MessageBuilder::build_chunked(&message)? {
            normal_queue.push_back(frame);
        }
        return Ok(());
    }
    let frame = MessageBuilder::build(&message)?;
    match priority {
        Priority::High => priority_queue.push_back(frame),
        Priority::Normal => normal_queue.push_back(frame),
    }
    Ok(())
}

/// Fold one received frame into the chunk reassembly state, yielding a
/// complete message when one finishes.
fn receive_frame(
    reassembly: &mut Option<Reassembly>,
    parsed: ParsedFrame,
    id: ConnectionId,
) -> Result<Option<Message>, Error> {
    match (reassembly.as_mut(), parsed.sequence_start) {
        // A new chunk sequence begins.
        (None, Some(total)) => {
            let service_id = parsed
                .service_id
                .ok_or(Error::Parse("missing service id"))?;
            let message_id = parsed
                .message_id
                .ok_or(Error::Parse("missing message id"))?;
            let mut buffer = BytesMut::with_capacity(total as usize);
            buffer.extend_from_slice(&parsed.body);
            if buffer.len() > total as usize {
                return Err(Error::IllegalChunk("chunk overflows the announced size"));
            }
            let finished = parsed.last_in_sequence == Some(true) && buffer.len() == total as usize;
            if finished {
                return Ok(Some(Message {
                    service_id,
                    message_id,
                    headers: parsed.headers,
                    body: buffer.freeze(),
                    remote: Some(id),
                }));
            }
            *reassembly = Some(Reassembly {
                service_id,
                message_id,
                expected: total as usize,
                buffer,
            });
            Ok(None)
        }

        // A sequence is in progress and another one starts: illegal.
        (Some(_), Some(_)) => Err(Error::IllegalChunk("mixed chunk sequences")),

        // A continuation chunk.
        (Some(state), None) if parsed.last_in_sequence.is_some() => {
            if parsed.service_id != Some(state.service_id)
                || parsed.message_id != Some(state.message_id)
            {
                return Err(Error::IllegalChunk("service changed mid-sequence"));
            }
            state.buffer.extend_from_slice(&parsed.body);
            if state.buffer.len() > state.expected {
                return Err(Error::IllegalChunk("chunk overflows the announced size"));
            }
            if parsed.last_in_sequence == Some(true) {
                if state.buffer.len() != state.expected {
                    return Err(Error::IllegalChunk("final chunk leaves the body short"));
                }
                let state = reassembly.take().expect("checked above");
                return Ok(Some(Message {
                    service_id: state.service_id,
                    message_id: state.message_id,
                    headers: parsed.headers,
                    body: state.buffer.freeze(),
                    remote: Some(id),
                }));
            }
            Ok(None)
        }

        // A plain message while a sequence is in progress: illegal.
        (Some(_), None) => Err(Error::IllegalChunk("unchunked frame mid-sequence")),

        // A plain, complete message.
        (None, None) => parsed.into_message(id).map(Some),
    }
}
