//! Streaming JSON array responses
//!
//! Rows are written as `[\n` row `,\n` row ... `\n]\n`. The first row is
//! pulled before the response starts so that an immediate failure still
//! maps to a proper error status. A failure after that ends the body
//! without the closing bracket.

use actix_web::{http::header::ContentType, web::Bytes, HttpResponse};
use billing_core::{AppError, AppResult};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Serialize;
use tracing::error;

struct ArrayState<T> {
    rows: BoxStream<'static, AppResult<T>>,
    pending: Option<T>,
    first: bool,
    finished: bool,
}

fn encode_row<T: Serialize>(row: &T, first: bool) -> AppResult<Bytes> {
    let mut chunk = if first { b"[\n".to_vec() } else { b",\n".to_vec() };
    serde_json::to_writer(&mut chunk, row)?;
    Ok(Bytes::from(chunk))
}

/// Stream `rows` as a JSON array body
pub async fn json_array_response<T>(
    mut rows: BoxStream<'static, AppResult<T>>,
) -> AppResult<HttpResponse>
where
    T: Serialize + Send + 'static,
{
    let pending = match rows.next().await {
        Some(Ok(row)) => Some(row),
        Some(Err(e)) => return Err(e),
        None => None,
    };

    let state = ArrayState {
        rows,
        pending,
        first: true,
        finished: false,
    };

    let body = stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }

        let next = match state.pending.take() {
            Some(row) => Some(Ok(row)),
            None => state.rows.next().await,
        };

        let chunk = match next {
            Some(Ok(row)) => {
                let encoded = encode_row(&row, state.first);
                state.first = false;
                encoded
            }
            Some(Err(e)) => Err(e),
            None => {
                state.finished = true;
                let tail: &'static [u8] = if state.first { b"[\n\n]\n" } else { b"\n]\n" };
                return Some((Ok(Bytes::from_static(tail)), state));
            }
        };

        match chunk {
            Ok(bytes) => Some((Ok(bytes), state)),
            Err(e) => {
                error!("Aborting streamed response: {}", e);
                state.finished = true;
                Some((Err::<Bytes, AppError>(e), state))
            }
        }
    });

    Ok(HttpResponse::Ok()
        .content_type(ContentType::json())
        .streaming(body))
}
