//! Server-sent event framing shared by both vendors.

use crate::{Error, EventStream, StreamEvent};
use futures::StreamExt;

/// Drain complete `data:` payloads from `buffer`, leaving any partial line.
///
/// Bytes are only decoded once a full line has arrived, so multi-byte
/// characters split across network chunks survive intact.
pub(crate) fn drain_data_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut payloads = Vec::new();

    while let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=newline_pos).collect();
        let line = String::from_utf8_lossy(&line);
        let line = line.trim_end_matches(['\n', '\r']);

        // event:, id: and comment lines carry nothing we need
        if let Some(data) = line.strip_prefix("data:") {
            let data = data.trim_start();
            if !data.is_empty() {
                payloads.push(data.to_string());
            }
        }
    }

    payloads
}

/// Wrap an HTTP response body as a stream of events decoded by `convert`.
pub(crate) fn event_stream<F>(response: reqwest::Response, convert: F) -> EventStream
where
    F: Fn(&str) -> Vec<Result<StreamEvent, Error>> + Send + 'static,
{
    let stream = response
        .bytes_stream()
        .scan(Vec::new(), move |buffer: &mut Vec<u8>, result| {
            let events: Vec<Result<StreamEvent, Error>> = match result {
                Ok(bytes) => {
                    buffer.extend_from_slice(&bytes);
                    drain_data_lines(buffer)
                        .iter()
                        .flat_map(|data| convert(data))
                        .collect()
                }
                Err(e) => vec![Err(Error::from_reqwest(e))],
            };
            futures::future::ready(Some(events))
        })
        .flat_map(futures::stream::iter);

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_complete_lines() {
        let mut buffer = b"event: ping\ndata: {\"a\":1}\n\ndata: [DONE]\n".to_vec();
        let payloads = drain_data_lines(&mut buffer);
        assert_eq!(payloads, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_partial_line_is_kept() {
        let mut buffer = b"data: {\"a\":1}\ndata: {\"b\"".to_vec();
        let payloads = drain_data_lines(&mut buffer);
        assert_eq!(payloads, vec!["{\"a\":1}".to_string()]);
        assert_eq!(buffer, b"data: {\"b\"".to_vec());

        buffer.extend_from_slice(b":2}\r\n");
        let payloads = drain_data_lines(&mut buffer);
        assert_eq!(payloads, vec!["{\"b\":2}".to_string()]);
    }

    #[test]
    fn test_split_multibyte_character() {
        let text = "data: é\n".as_bytes();
        let (head, tail) = text.split_at(7); // splits the two-byte 'é'
        let mut buffer = head.to_vec();
        assert!(drain_data_lines(&mut buffer).is_empty());
        buffer.extend_from_slice(tail);
        assert_eq!(drain_data_lines(&mut buffer), vec!["é".to_string()]);
    }
}
