//! Newline-delimited JSON -> [`LLMStream`] adapter.

use futures_util::{stream, StreamExt};
use reqwest::Response;
use tokio::io::AsyncBufReadExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::io::StreamReader;

use crate::provider::{LLMError, LLMStream, Result};
use crate::types::LLMChunk;

/// Convert an NDJSON HTTP [`Response`] into an [`LLMStream`].
///
/// Blank lines are dropped before `handler` sees them. Read failures surface
/// as `LLMError::Stream`.
pub fn llm_stream_from_ndjson<H>(response: Response, mut handler: H) -> LLMStream
where
    H: FnMut(&str) -> Result<Vec<LLMChunk>> + Send + 'static,
{
    let body = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(std::io::Error::other));
    let lines = LinesStream::new(StreamReader::new(body).lines());

    let stream = lines
        .filter_map(|line| async move {
            match line {
                Ok(line) if line.trim().is_empty() => None,
                other => Some(other),
            }
        })
        .map(move |line| {
            let line = line.map_err(|e| LLMError::Stream(e.to_string()))?;
            handler(line.trim())
        })
        .flat_map(|result| {
            let items: Vec<Result<LLMChunk>> = match result {
                Ok(chunks) => chunks.into_iter().map(Ok).collect(),
                Err(err) => vec![Err(err)],
            };
            stream::iter(items)
        });

    Box::pin(stream)
}
