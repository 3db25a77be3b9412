//! The request/response loop.  This is the only place that touches the channel.
use crate::protocol::{self, ErrorKind, GenericResponse, JsonRpcError};
use crate::tools::ToolHandler;
use crate::transport::{McpTransport, RequestLine};
use crate::Result;
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Serve tool calls from `transport` until the input ends or `cancel` fires.
///
/// Requests are handled strictly one at a time, and every non-blank input line produces exactly
/// one response line.  Cancellation is only observed between requests, so a request that has
/// been read is always answered.  An I/O error on the transport ends the session with that error.
pub async fn serve(
    mut transport: Box<dyn McpTransport>,
    handler: &dyn ToolHandler,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Session cancelled");
                break;
            }
            line = transport.read_request() => line?,
        };

        let response: GenericResponse = match line {
            None => {
                debug!("End of input, ending session");
                break;
            }
            Some(RequestLine::TooLong { limit }) => {
                warn!(limit, "Rejected over-long request line");
                JsonRpcError::new(
                    ErrorKind::ParseError,
                    format!("Request line exceeds the {limit} byte limit"),
                    None,
                )
                .into()
            }
            Some(RequestLine::Complete(line)) => {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                handle_line(&line, handler).await
            }
        };
        transport.write_response(response).await?;
    }

    Ok(())
}

/// Turn one line of input into the response that answers it.  Never fails; every problem becomes
/// an error response.
#[instrument(skip_all, fields(id = field::Empty))]
async fn handle_line(line: &[u8], handler: &dyn ToolHandler) -> GenericResponse {
    let line = match std::str::from_utf8(line) {
        Ok(line) => line,
        Err(e) => {
            debug!(error = %e, "Request is not valid UTF-8");
            return JsonRpcError::new(
                ErrorKind::ParseError,
                format!("Request is not valid UTF-8: {e}"),
                None,
            )
            .into();
        }
    };
    trace!(request = %line, "Received request");

    let request = match protocol::parse_request(line) {
        Ok(request) => request,
        Err(e) => {
            debug!(kind = %e.kind(), message = e.message(), "Rejected request");
            return e.into();
        }
    };
    Span::current().record("id", tracing::field::debug(&request.id));

    match handler.call_tool(request.params).await {
        Ok(result) => protocol::success_response(request.id, result),
        Err(e) => {
            warn!(kind = %e.kind(), error = %e, "Tool call failed");
            JsonRpcError::from_error(e.kind(), &e, request.id).into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::init_test_logging;
    use crate::tools::ToolError;
    use crate::transport::StreamTransport;
    use serde_json::Value;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

    /// Echoes the params back as the result, or fails with "unknown tool" when asked to.
    #[derive(Default)]
    struct EchoHandler {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ToolHandler for EchoHandler {
        async fn call_tool(&self, params: Option<Value>) -> std::result::Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let params = params.unwrap_or(Value::Null);
            match params["name"].as_str() {
                Some("fail") => Err(ToolError::ToolNotFound("fail".to_string())),
                _ => Ok(params),
            }
        }
    }

    /// Run a whole session over `input`, returning the parsed response lines.
    async fn run(input: impl Into<Vec<u8>>, handler: &dyn ToolHandler) -> Vec<Value> {
        init_test_logging();
        let (server_tx, mut client_rx) = tokio::io::duplex(64 * 1024);
        let transport = StreamTransport::new(BufReader::new(Cursor::new(input.into())), server_tx);

        serve(Box::new(transport), handler, CancellationToken::new())
            .await
            .unwrap();

        let mut output = String::new();
        client_rx.read_to_string(&mut output).await.unwrap();
        output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn one_response_per_request_in_order() {
        let handler = EchoHandler::default();
        let responses = run(
            concat!(
                r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"a"}}"#,
                "\n",
                r#"{"jsonrpc":"2.0","id":"two","method":"tools/call","params":{"name":"b"}}"#,
                "\n",
                r#"{"method":"tools/call","params":{"name":"c"}}"#,
                "\n",
            ),
            &handler,
        )
        .await;

        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[0]["result"]["name"], "a");
        assert_eq!(responses[1]["id"], "two");
        assert_eq!(responses[2]["id"], Value::Null);
        assert_eq!(responses[2]["result"]["name"], "c");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let handler = EchoHandler::default();
        let responses = run(
            "\n   \n\t\r\n{\"id\":5,\"method\":\"tools/call\",\"params\":{}}\n\n",
            &handler,
        )
        .await;

        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 5);
    }

    #[tokio::test]
    async fn errors_do_not_end_the_session() {
        let handler = EchoHandler::default();
        let responses = run(
            concat!(
                "not json\n",
                r#"{"id":2,"method":"initialize"}"#,
                "\n",
                r#"{"id":3,"method":"tools/call","params":{"name":"fail"}}"#,
                "\n",
                r#"{"id":4,"method":"tools/call","params":{"name":"ok"}}"#,
                "\n",
            ),
            &handler,
        )
        .await;

        assert_eq!(responses.len(), 4);
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[0]["error"]["data"]["kind"], "PARSE_ERROR");
        assert_eq!(responses[1]["id"], 2);
        assert_eq!(responses[1]["error"]["data"]["kind"], "METHOD_NOT_FOUND");
        assert_eq!(responses[2]["id"], 3);
        assert_eq!(responses[2]["error"]["code"], -32001);
        assert_eq!(responses[3]["result"]["name"], "ok");

        // Only the requests that made it past the protocol layer reach the handler
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn every_response_has_exactly_one_of_result_or_error() {
        let handler = EchoHandler::default();
        let responses = run(
            "not json\n{\"id\":1,\"method\":\"tools/call\"}\n{\"id\":2,\"method\":\"tools/call\",\"params\":{\"name\":\"fail\"}}\n",
            &handler,
        )
        .await;

        for response in responses {
            assert_eq!(response["jsonrpc"], "2.0");
            assert!(
                response.get("result").is_some() != response.get("error").is_some(),
                "{response}"
            );
        }
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_parse_error() {
        let handler = EchoHandler::default();
        let mut input = b"{\"id\":1,\"method\":\"tools/call\",\"params\":{\"name\":\"".to_vec();
        input.extend_from_slice(b"\xff\xfe\"}}\n");

        let responses = run(input, &handler).await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[0]["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn over_long_line_is_a_parse_error_and_session_continues() {
        init_test_logging();
        let handler = EchoHandler::default();
        let input = format!(
            "{{\"id\":1,\"method\":\"tools/call\",\"params\":{{\"name\":\"{}\"}}}}\n{}\n",
            "a".repeat(200),
            r#"{"id":2,"method":"tools/call","params":{"name":"short"}}"#,
        );
        let (server_tx, mut client_rx) = tokio::io::duplex(64 * 1024);
        let transport = StreamTransport::new(BufReader::new(Cursor::new(input)), server_tx)
            .with_max_line_bytes(100);

        serve(Box::new(transport), &handler, CancellationToken::new())
            .await
            .unwrap();

        let mut output = String::new();
        client_rx.read_to_string(&mut output).await.unwrap();
        let responses: Vec<Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[0]["error"]["code"], -32700);
        assert_eq!(responses[0]["error"]["data"]["kind"], "PARSE_ERROR");
        assert_eq!(responses[1]["id"], 2);
        assert_eq!(responses[1]["result"]["name"], "short");
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_waiting_for_input() {
        init_test_logging();
        let handler = EchoHandler::default();
        let (server_rx, mut client_tx) = tokio::io::duplex(1024);
        let (server_tx, mut client_rx) = tokio::io::duplex(1024);
        let transport = StreamTransport::new(BufReader::new(server_rx), server_tx);
        let cancel = CancellationToken::new();

        client_tx
            .write_all(b"{\"id\":1,\"method\":\"tools/call\",\"params\":{}}\n")
            .await
            .unwrap();

        let session = {
            let cancel = cancel.clone();
            async move { serve(Box::new(transport), &handler, cancel).await }
        };
        let canceller = async {
            // Wait for the first response so we know the session is idle, then cancel
            let mut buf = [0u8; 1];
            client_rx.read_exact(&mut buf).await.unwrap();
            cancel.cancel();
        };

        // `client_tx` stays open throughout, so only the cancellation can end the session
        let (result, ()) = tokio::join!(session, canceller);
        result.unwrap();
        drop(client_tx);
    }
}
