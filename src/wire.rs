//! Newline-delimited JSON protocol.
//!
//! Each request is one JSON object on one line, tagged by `op`; each reply is
//! one line, `{"ok":true,"data":...}` or `{"ok":false,"error":{...}}`.
//! `{"op":"subscribe"}` turns the connection into a capacity stream: one
//! `CapacityUpdate` object per line, starting with the current snapshot,
//! until either side hangs up. Lines sent by the client after that are ignored.

use std::io;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability::{REQUESTS_TOTAL, SUBSCRIBERS_ACTIVE};
use crate::service::{ReservationService, ServiceError};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] LinesCodecError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Request {
    Apply {
        user_id: String,
        slot_id: SlotId,
    },
    Cancel {
        reservation_id: ReservationId,
        user_id: String,
    },
    Reservations {
        user_id: String,
    },
    Reservation {
        id: ReservationId,
    },
    ActiveReservation {
        user_id: String,
        event_id: EventId,
    },
    Slots,
    CreateSlot {
        slot_id: SlotId,
        event_id: EventId,
        max_capacity: u32,
    },
    ResizeSlot {
        slot_id: SlotId,
        max_capacity: u32,
    },
    Resync,
    DeadLetters,
    Subscribe,
}

impl Request {
    fn label(&self) -> &'static str {
        match self {
            Request::Apply { .. } => "apply",
            Request::Cancel { .. } => "cancel",
            Request::Reservations { .. } => "reservations",
            Request::Reservation { .. } => "reservation",
            Request::ActiveReservation { .. } => "active_reservation",
            Request::Slots => "slots",
            Request::CreateSlot { .. } => "create_slot",
            Request::ResizeSlot { .. } => "resize_slot",
            Request::Resync => "resync",
            Request::DeadLetters => "dead_letters",
            Request::Subscribe => "subscribe",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

#[derive(Debug, Serialize)]
struct Reply<'a> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody<'a>>,
}

fn ok_line(data: Value) -> Result<String, WireError> {
    Ok(serde_json::to_string(&Reply {
        ok: true,
        data: Some(data),
        error: None,
    })?)
}

fn error_line(code: &str, message: String) -> Result<String, WireError> {
    Ok(serde_json::to_string(&Reply {
        ok: false,
        data: None,
        error: Some(ErrorBody { code, message }),
    })?)
}

fn to_data<T: Serialize>(value: T) -> Result<Value, WireError> {
    Ok(serde_json::to_value(value)?)
}

/// Run one request against the service and render its reply line.
pub async fn execute(service: &ReservationService, request: Request) -> Result<String, WireError> {
    let op = request.label();
    let result: Result<Value, ServiceError> = match request {
        Request::Apply { user_id, slot_id } => match service.apply(&user_id, slot_id).await {
            Ok(admission) => Ok(to_data(admission)?),
            Err(e) => Err(e.into()),
        },
        Request::Cancel {
            reservation_id,
            user_id,
        } => match service.cancel(reservation_id, &user_id).await {
            Ok(reservation) => Ok(to_data(reservation)?),
            Err(e) => Err(e.into()),
        },
        Request::Reservations { user_id } => Ok(to_data(service.reservations_for_user(&user_id).await)?),
        Request::Reservation { id } => match service.reservation(id).await {
            Ok(reservation) => Ok(to_data(reservation)?),
            Err(e) => Err(e.into()),
        },
        Request::ActiveReservation { user_id, event_id } => {
            Ok(to_data(service.active_reservation(&user_id, event_id).await)?)
        }
        Request::Slots => Ok(to_data(service.slots().await)?),
        Request::CreateSlot {
            slot_id,
            event_id,
            max_capacity,
        } => match service.create_slot(slot_id, event_id, max_capacity).await {
            Ok(slot) => Ok(to_data(slot)?),
            Err(e) => Err(e.into()),
        },
        Request::ResizeSlot {
            slot_id,
            max_capacity,
        } => match service.resize_slot(slot_id, max_capacity).await {
            Ok(slot) => Ok(to_data(slot)?),
            Err(e) => Err(e),
        },
        Request::Resync => match service.resync_counters().await {
            Ok(count) => Ok(to_data(serde_json::json!({ "resynced": count }))?),
            Err(e) => Err(e.into()),
        },
        Request::DeadLetters => Ok(to_data(service.dead_letters().await)?),
        Request::Subscribe => Ok(Value::Null),
    };

    match result {
        Ok(data) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => "ok").increment(1);
            ok_line(data)
        }
        Err(e) => {
            metrics::counter!(REQUESTS_TOTAL, "op" => op, "status" => "error").increment(1);
            error_line(e.code(), e.to_string())
        }
    }
}

/// Serve one client connection until it closes or `shutdown` fires.
pub async fn process_connection<S>(
    socket: S,
    service: Arc<ReservationService>,
    shutdown: CancellationToken,
) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    loop {
        let next = tokio::select! {
            next = framed.next() => next,
            _ = shutdown.cancelled() => break,
        };
        let line = match next {
            None => break,
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                framed
                    .send(error_line("LINE_TOO_LONG", format!("request exceeds {MAX_LINE_LEN} bytes"))?)
                    .await?;
                continue;
            }
            Some(Err(e)) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                framed.send(error_line("BAD_REQUEST", e.to_string())?).await?;
                continue;
            }
        };
        if request == Request::Subscribe {
            return stream_capacity(framed, &service, shutdown).await;
        }
        let reply = execute(&service, request).await?;
        framed.send(reply).await?;
    }
    Ok(())
}

async fn stream_capacity<S>(
    framed: Framed<S, LinesCodec>,
    service: &ReservationService,
    shutdown: CancellationToken,
) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = framed.split::<String>();
    let mut subscription = service.subscribe().await;
    metrics::gauge!(SUBSCRIBERS_ACTIVE).increment(1.0);
    let result = async {
        loop {
            tokio::select! {
                update = subscription.next() => {
                    let Some(update) = update else { break };
                    sink.send(serde_json::to_string(&update)?).await?;
                }
                incoming = stream.next() => match incoming {
                    None | Some(Err(_)) => break,
                    Some(Ok(_)) => debug!("ignoring inbound line on capacity stream"),
                },
                _ = shutdown.cancelled() => break,
            }
        }
        Ok::<(), WireError>(())
    }
    .await;
    metrics::gauge!(SUBSCRIBERS_ACTIVE).decrement(1.0);
    result
}
