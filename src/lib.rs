use std::{sync::Arc, time::Instant};

use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite},
    net::TcpStream,
};
use tracing::{debug, info, warn};

pub mod config;
pub mod demo;
pub mod errors;
pub mod logging;
pub mod router;
pub mod rpc;
pub mod transport;

use config::Config;
use errors::ServerError;
use router::Router;
use transport::{
    codec::{decode_request, resync_offset, RequestFrame},
    Connection, FramingError, Request,
};

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Connects to the broker's request and reply sockets and serves until the
/// request stream closes.
pub async fn run(config: &Config, router: Router) -> Result<(), ServerError> {
    let recv_addr = config.recv_socket()?;
    let send_addr = config.send_socket()?;

    let inbound = TcpStream::connect(recv_addr)
        .await
        .map_err(|source| ServerError::Connect {
            role: "receive",
            addr: recv_addr,
            source,
        })?;
    let outbound = TcpStream::connect(send_addr)
        .await
        .map_err(|source| ServerError::Connect {
            role: "send",
            addr: send_addr,
            source,
        })?;

    info!(
        recv_addr = %recv_addr,
        send_addr = %send_addr,
        "connected to broker"
    );

    serve(
        inbound,
        Arc::new(Connection::new(outbound)),
        Arc::new(router),
        config.max_frame_bytes,
    )
    .await
}

/// Reads request frames from `inbound` and answers each one through
/// `connection` before reading the next.
pub async fn serve<R, W>(
    mut inbound: R,
    connection: Arc<Connection<W>>,
    router: Arc<Router>,
    max_frame_bytes: usize,
) -> Result<(), ServerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send,
{
    let mut inbox = Inbox::default();
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];

    loop {
        drain_frames(&mut inbox, &connection, &router, max_frame_bytes).await?;

        let read = inbound.read(&mut chunk).await.map_err(ServerError::Read)?;
        if read == 0 {
            if !inbox.buffer.is_empty() && !inbox.discarding {
                warn!(bytes = inbox.buffer.len(), "discarding incomplete frame at end of stream");
            }
            return Ok(());
        }
        inbox.buffer.extend_from_slice(&chunk[..read]);
    }
}

/// Bytes read but not yet decoded. While `discarding` is set the front of
/// `buffer` belongs to a rejected frame and nothing is decoded until its
/// terminator arrives.
#[derive(Default)]
struct Inbox {
    buffer: Vec<u8>,
    discarding: bool,
}

impl Inbox {
    /// Drops bytes up to the next frame terminator. Returns false when none
    /// is buffered yet; the last byte is kept in case it starts one.
    fn skip_frame(&mut self) -> bool {
        match resync_offset(&self.buffer) {
            Some(offset) => {
                self.buffer.drain(..offset);
                self.discarding = false;
                true
            }
            None => {
                let keep_from = self.buffer.len().saturating_sub(1);
                self.buffer.drain(..keep_from);
                self.discarding = true;
                false
            }
        }
    }
}

async fn drain_frames<W>(
    inbox: &mut Inbox,
    connection: &Connection<W>,
    router: &Router,
    max_frame_bytes: usize,
) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin + Send,
{
    let too_large = FramingError::FrameTooLarge {
        limit: max_frame_bytes,
    };

    loop {
        if inbox.discarding && !inbox.skip_frame() {
            return Ok(());
        }

        match decode_request(&inbox.buffer) {
            Ok((_, consumed)) if consumed > max_frame_bytes => {
                warn!(error = %too_large, "discarding frame");
                inbox.buffer.drain(..consumed);
            }
            Ok((frame, consumed)) => {
                inbox.buffer.drain(..consumed);
                process_frame(frame, connection, router).await?;
            }
            Err(FramingError::Incomplete) if inbox.buffer.len() > max_frame_bytes => {
                warn!(error = %too_large, "discarding frame");
                inbox.discarding = true;
            }
            Err(FramingError::Incomplete) => return Ok(()),
            Err(error) => {
                warn!(error = %error, "discarding frame");
                inbox.discarding = true;
            }
        }
    }
}

async fn process_frame<W>(
    frame: RequestFrame,
    connection: &Connection<W>,
    router: &Router,
) -> Result<(), ServerError>
where
    W: AsyncWrite + Unpin + Send,
{
    let started_at = Instant::now();
    let request = match Request::from_frame(frame) {
        Ok(request) => request,
        Err(error) => {
            warn!(error = %error, "discarding frame");
            return Ok(());
        }
    };

    if request.is_disconnect() {
        debug!(sender = %request.sender, conn_id = %request.conn_id, "peer disconnected");
        return Ok(());
    }

    let reply = router.dispatch(&request).await;
    connection
        .reply(&request, &reply)
        .await
        .map_err(ServerError::Send)?;
    logging::log_frame_summary(&request, &reply, started_at);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{json, Value};
    use tokio::{
        io::{duplex, AsyncWriteExt},
        net::TcpListener,
    };
    use tracing::{Event, Level, Subscriber};
    use tracing_subscriber::{
        layer::{Context, SubscriberExt},
        Layer,
    };

    use super::*;
    use crate::demo::HelloService;
    use crate::rpc::{HandlerOptions, JsonRpcHandler};
    use crate::transport::codec::{decode_reply, FRAME_TERMINATOR};

    fn frame(conn_id: &str, path: &str, method: &str, body: &str) -> Vec<u8> {
        let headers = json!({"PATH": path, "METHOD": method}).to_string();
        format!(
            "broker-1 {}:{conn_id}, {headers} {}:{body}\n\n",
            conn_id.len(),
            body.len()
        )
        .into_bytes()
    }

    fn router() -> Router {
        let handler = JsonRpcHandler::new(HelloService, HandlerOptions::default())
            .expect("hello handler");
        Router::new()
            .route("^/api$", Arc::new(handler))
            .expect("api route")
    }

    fn split_replies(written: &[u8]) -> Vec<(String, Value)> {
        let mut replies = Vec::new();
        let mut rest = written;
        while let Some(end) = resync_offset(rest) {
            let reply = decode_reply(&rest[..end]).expect("reply frame");
            assert_eq!(reply.sender, "broker-1");
            let body = serde_json::from_slice(&reply.payload).expect("reply json");
            replies.push((reply.conn_id, body));
            rest = &rest[end..];
        }
        assert!(rest.is_empty(), "trailing bytes after last reply");
        replies
    }

    async fn serve_bytes(inbound: &[u8], max_frame_bytes: usize) -> Vec<(String, Value)> {
        serve_from(inbound, max_frame_bytes).await
    }

    /// Feeds `inbound` through a 64 byte pipe so frames straddle reads.
    async fn serve_chunked(inbound: Vec<u8>, max_frame_bytes: usize) -> Vec<(String, Value)> {
        let (mut writer, reader) = duplex(64);
        let feeder = tokio::spawn(async move {
            writer.write_all(&inbound).await.expect("feed inbound");
        });

        let replies = serve_from(reader, max_frame_bytes).await;
        feeder.await.expect("feeder task");
        replies
    }

    async fn serve_from<R>(inbound: R, max_frame_bytes: usize) -> Vec<(String, Value)>
    where
        R: AsyncRead + Unpin,
    {
        let connection = Arc::new(Connection::new(Vec::new()));
        serve(inbound, Arc::clone(&connection), Arc::new(router()), max_frame_bytes)
            .await
            .expect("serve should finish cleanly");

        let written = Arc::try_unwrap(connection)
            .ok()
            .expect("serve released the connection")
            .into_inner();
        split_replies(&written)
    }

    #[tokio::test]
    async fn answers_each_call_in_order() {
        let mut inbound = frame(
            "7",
            "/api",
            "POST",
            r#"{"id":1,"method":"hello","params":["Ada"]}"#,
        );
        inbound.extend(frame(
            "8",
            "/api",
            "POST",
            r#"{"jsonrpc":"2.0","id":2,"method":"nope","params":[]}"#,
        ));

        let replies = serve_bytes(&inbound, 4096).await;

        assert_eq!(
            replies,
            vec![
                (
                    "7".to_string(),
                    json!({"id": 1, "error": null, "result": "Hello Ada"})
                ),
                (
                    "8".to_string(),
                    json!({
                        "jsonrpc": "2.0",
                        "id": 2,
                        "error": {"message": "Method 'nope' not found."}
                    })
                ),
            ]
        );
    }

    #[tokio::test]
    async fn disconnects_get_no_reply() {
        let mut inbound = frame("3", "/api", "JSON", r#"{"type":"disconnect"}"#);
        inbound.extend(frame(
            "4",
            "/api",
            "POST",
            r#"{"id":5,"method":"hello","params":[""]}"#,
        ));

        let replies = serve_bytes(&inbound, 4096).await;

        assert_eq!(
            replies,
            vec![(
                "4".to_string(),
                json!({"id": 5, "error": null, "result": "Hello there"})
            )]
        );
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() {
        let mut inbound = b"broker-1 9:1, {} 0:\n\n".to_vec();
        inbound.extend(frame(
            "2",
            "/api",
            "POST",
            r#"{"id":6,"method":"hello","params":["Bob"]}"#,
        ));

        let replies = serve_bytes(&inbound, 4096).await;

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].1["result"], json!("Hello Bob"));
    }

    #[tokio::test]
    async fn oversized_frame_is_skipped() {
        let replies = serve_bytes(&oversized_then_valid(), 128).await;

        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, "2");
    }

    fn oversized_then_valid() -> Vec<u8> {
        let big = format!(
            r#"{{"id":1,"method":"hello","params":["{}"]}}"#,
            "x".repeat(512)
        );
        let mut inbound = frame("1", "/api", "POST", &big);
        inbound.extend(frame(
            "2",
            "/api",
            "POST",
            r#"{"id":2,"method":"hello","params":["Ada"]}"#,
        ));
        inbound
    }

    #[tokio::test]
    async fn frames_split_across_reads_are_answered() {
        let mut inbound = frame(
            "1",
            "/api",
            "POST",
            &format!(r#"{{"id":1,"method":"hello","params":["{}"]}}"#, "y".repeat(150)),
        );
        inbound.extend(frame(
            "2",
            "/api",
            "POST",
            r#"{"id":2,"method":"hello","params":["Ada"]}"#,
        ));

        let replies = serve_chunked(inbound, 4096).await;

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].0, "1");
        assert_eq!(replies[1].1["result"], json!("Hello Ada"));
    }

    #[tokio::test]
    async fn oversized_frame_split_across_reads_is_skipped_whole() {
        let replies = serve_chunked(oversized_then_valid(), 128).await;

        assert_eq!(
            replies,
            vec![(
                "2".to_string(),
                json!({"id": 2, "error": null, "result": "Hello Ada"})
            )]
        );
    }

    #[tokio::test]
    async fn length_mismatch_split_across_reads_is_skipped_whole() {
        let headers = json!({"PATH": "/api", "METHOD": "POST"}).to_string();
        let mut inbound =
            format!("broker-1 1:1, {headers} 3:{}\n\n", "z".repeat(300)).into_bytes();
        inbound.extend(frame(
            "2",
            "/api",
            "POST",
            r#"{"id":2,"method":"hello","params":["Bob"]}"#,
        ));

        let replies = serve_chunked(inbound, 4096).await;

        assert_eq!(
            replies,
            vec![(
                "2".to_string(),
                json!({"id": 2, "error": null, "result": "Hello Bob"})
            )]
        );
    }

    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: Subscriber> Layer<S> for WarnCounter {
        fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn only_server_errors_are_logged_as_warnings() {
        let warnings = Arc::new(AtomicUsize::new(0));
        let subscriber =
            tracing_subscriber::registry().with(WarnCounter(Arc::clone(&warnings)));
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut inbound = frame(
            "1",
            "/api",
            "POST",
            r#"{"id":1,"method":"nope","params":[]}"#,
        );
        inbound.extend(frame("2", "/api", "POST", r#"{"id":2,"method":"hello"}"#));
        serve_bytes(&inbound, 4096).await;
        assert_eq!(warnings.load(Ordering::SeqCst), 0);

        let arity = frame("3", "/api", "POST", r#"{"id":3,"method":"hello","params":[]}"#);
        serve_bytes(&arity, 4096).await;
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unrouted_path_is_answered_with_error() {
        let inbound = frame("1", "/other", "POST", r#"{"id":1,"method":"hello","params":["Ada"]}"#);

        let replies = serve_bytes(&inbound, 4096).await;

        assert_eq!(
            replies[0].1,
            json!({"id": null, "error": {"message": "No handler for path '/other'."}})
        );
    }

    #[tokio::test]
    async fn run_talks_to_broker_over_tcp() {
        let recv_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind recv");
        let send_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind send");
        let config = Config {
            recv_addr: recv_listener.local_addr().expect("recv addr").to_string(),
            send_addr: send_listener.local_addr().expect("send addr").to_string(),
            call_timeout: std::time::Duration::from_secs(5),
            max_frame_bytes: 4096,
        };

        let server = tokio::spawn(async move { run(&config, router()).await });

        let (mut requests, _) = recv_listener.accept().await.expect("accept recv");
        let (mut replies, _) = send_listener.accept().await.expect("accept send");

        requests
            .write_all(&frame(
                "11",
                "/api",
                "POST",
                r#"{"version":"1.1","id":"a","method":"hello","params":["Ada"]}"#,
            ))
            .await
            .expect("write request");
        requests.shutdown().await.expect("close request stream");

        server
            .await
            .expect("server task")
            .expect("server should finish cleanly");

        let mut written = Vec::new();
        replies.read_to_end(&mut written).await.expect("read replies");
        assert!(written.ends_with(FRAME_TERMINATOR));
        assert_eq!(
            split_replies(&written),
            vec![(
                "11".to_string(),
                json!({"version": "1.1", "id": "a", "error": null, "result": "Hello Ada"})
            )]
        );
    }

    #[tokio::test]
    async fn run_reports_unreachable_broker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind listener");
        let addr = listener.local_addr().expect("listener addr");
        drop(listener);

        let config = Config {
            recv_addr: addr.to_string(),
            send_addr: addr.to_string(),
            call_timeout: std::time::Duration::from_secs(1),
            max_frame_bytes: 4096,
        };

        let error = run(&config, router()).await.expect_err("connect must fail");
        assert!(matches!(error, ServerError::Connect { role: "receive", .. }));
    }
}
