//! Multiplexed connection server shared by the registration service and every peer.
//!
//! One event-loop task owns the connection table and is the only place a
//! [`Service`] handler runs, so frames on one server are handled strictly one
//! at a time. Each accepted connection gets a reader task that forwards whole
//! frames into the loop and a writer task that drains that connection's
//! outbound queue. Housekeeping runs on a fixed cadence from the same loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use p2pdi_core::{wire, Response, Status};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::transport::{self, TransportError};

/// Default housekeeping cadence.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("startup hook failed: {0}")]
    Startup(String),
}

/// Behaviour plugged into the server loop.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Runs once after the listener is bound, before the loop starts. The only
    /// hook allowed to make outbound calls.
    async fn on_start(&self, _local_addr: SocketAddr) -> Result<(), ServerError> {
        Ok(())
    }

    /// Periodic housekeeping, called from the loop every tick interval.
    fn on_tick(&self) {}

    /// Turn one raw frame into exactly one response. Must not block.
    fn handle(&self, frame: &[u8]) -> Response;
}

/// Bind a listener. Port 0 picks a free port.
pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<TcpListener, ServerError> {
    Ok(TcpListener::bind(addr).await?)
}

/// Run the start hook, then spawn the event loop.
pub async fn serve<S: Service>(
    listener: TcpListener,
    service: Arc<S>,
    tick_interval: Duration,
    span: Span,
) -> Result<ServerHandle, ServerError> {
    let local_addr = listener.local_addr()?;
    service.on_start(local_addr).await?;

    let stop = Arc::new(StopSignal::default());
    let task = tokio::spawn(
        run_loop(listener, service, tick_interval, stop.clone()).instrument(span.clone()),
    );
    span.in_scope(|| info!(%local_addr, "server started"));
    Ok(ServerHandle {
        local_addr,
        stop,
        task,
    })
}

#[derive(Default)]
struct StopSignal {
    stopped: AtomicBool,
    notify: Notify,
}

/// Control over a running server loop.
pub struct ServerHandle {
    local_addr: SocketAddr,
    stop: Arc<StopSignal>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Request a stop. Idempotent; the loop observes it at the top of its
    /// next iteration.
    pub fn stop(&self) {
        if !self.stop.stopped.swap(true, Ordering::SeqCst) {
            self.stop.notify.notify_one();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.stopped.load(Ordering::SeqCst) || self.task.is_finished()
    }

    /// Wait for the loop to exit. Every connection is closed and the listening
    /// port released once this returns.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            error!("server task failed: {e}");
        }
    }
}

type ConnId = u64;

enum Event {
    Frame(ConnId, Vec<u8>),
    Closed(ConnId),
    Failed(ConnId, TransportError),
}

struct Connection {
    peer: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn close(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

async fn run_loop<S: Service>(
    listener: TcpListener,
    service: Arc<S>,
    tick_interval: Duration,
    stop: Arc<StopSignal>,
) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
    let mut conns: HashMap<ConnId, Connection> = HashMap::new();
    let mut next_id: ConnId = 0;
    let mut ticker = interval_at(Instant::now() + tick_interval, tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if stop.stopped.load(Ordering::SeqCst) {
            break;
        }
        tokio::select! {
            _ = stop.notify.notified() => {}
            _ = ticker.tick() => service.on_tick(),
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    next_id += 1;
                    debug!(%peer, conn = next_id, "accepted connection");
                    let conn = spawn_connection(next_id, stream, peer, event_tx.clone());
                    conns.insert(next_id, conn);
                }
                Err(e) => warn!("accept failed: {e}"),
            },
            Some(event) = event_rx.recv() => match event {
                Event::Frame(id, frame) => {
                    let Some(conn) = conns.get(&id) else { continue };
                    let response = dispatch(service.as_ref(), &frame);
                    debug!(peer = %conn.peer, status = %response.status, "queued response");
                    let bytes = wire::encode_response(&response).into_bytes();
                    if conn.outbound.send(bytes).is_err() {
                        if let Some(conn) = conns.remove(&id) {
                            conn.close();
                        }
                    }
                }
                Event::Closed(id) => {
                    if let Some(conn) = conns.remove(&id) {
                        debug!(peer = %conn.peer, "peer disconnected");
                        conn.close();
                    }
                }
                Event::Failed(id, e) => {
                    if let Some(conn) = conns.remove(&id) {
                        warn!(peer = %conn.peer, "closing connection: {e}");
                        conn.close();
                    }
                }
            },
        }
    }

    for (_, conn) in conns.drain() {
        conn.close();
    }
    info!("server stopped");
}

/// Run the handler; a panic still yields a response.
fn dispatch<S: Service>(service: &S, frame: &[u8]) -> Response {
    match std::panic::catch_unwind(AssertUnwindSafe(|| service.handle(frame))) {
        Ok(response) => response,
        Err(_) => {
            error!("handler panicked");
            Response::new(Status::InternalError, "Internal Error")
        }
    }
}

fn spawn_connection(
    id: ConnId,
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
) -> Connection {
    let (mut read_half, mut write_half) = stream.into_split();
    let (outbound, mut queue) = mpsc::unbounded_channel::<Vec<u8>>();

    let reader_events = events.clone();
    let reader = tokio::spawn(
        async move {
            loop {
                let event = match transport::recv_frame(&mut read_half).await {
                    Ok(Some(frame)) => Event::Frame(id, frame),
                    Ok(None) => Event::Closed(id),
                    Err(e) => Event::Failed(id, e),
                };
                let last = !matches!(event, Event::Frame(..));
                if reader_events.send(event).is_err() || last {
                    break;
                }
            }
        }
        .in_current_span(),
    );

    let writer = tokio::spawn(
        async move {
            while let Some(bytes) = queue.recv().await {
                if let Err(e) = transport::send_frame(&mut write_half, &bytes).await {
                    let _ = events.send(Event::Failed(id, e));
                    break;
                }
            }
        }
        .in_current_span(),
    );

    Connection {
        peer,
        outbound,
        reader,
        writer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2pdi_core::{decode_message, decode_response, encode_message, Message, Method};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Echoes the payload back; counts ticks; panics on "boom".
    #[derive(Default)]
    struct Echo {
        ticks: AtomicUsize,
        started: AtomicBool,
        in_handler: AtomicBool,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Service for Echo {
        async fn on_start(&self, _local_addr: SocketAddr) -> Result<(), ServerError> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn on_tick(&self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        fn handle(&self, frame: &[u8]) -> Response {
            assert!(!self.in_handler.swap(true, Ordering::SeqCst));
            let response = match decode_message(frame) {
                Ok(msg) if msg.payload == "boom" => panic!("boom"),
                Ok(msg) => {
                    self.seen.lock().unwrap().push(msg.payload.clone());
                    Response::success(msg.payload)
                }
                Err(e) => Response::new(Status::BadMessage, e.to_string()),
            };
            self.in_handler.store(false, Ordering::SeqCst);
            response
        }
    }

    async fn start(service: Arc<Echo>, tick: Duration) -> ServerHandle {
        let listener = bind("127.0.0.1:0").await.unwrap();
        serve(listener, service, tick, Span::none()).await.unwrap()
    }

    async fn call(stream: &mut TcpStream, payload: &str) -> Response {
        let msg = Message::new(Method::IndexQuery, payload);
        transport::send_frame(stream, encode_message(&msg).as_bytes())
            .await
            .unwrap();
        let frame = transport::recv_frame(stream).await.unwrap().unwrap();
        decode_response(&frame).unwrap()
    }

    #[tokio::test]
    async fn serves_many_requests_on_one_connection() {
        let service = Arc::new(Echo::default());
        let handle = start(service.clone(), DEFAULT_TICK_INTERVAL).await;
        assert!(service.started.load(Ordering::SeqCst));

        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        for i in 0..5 {
            let resp = call(&mut stream, &format!("req-{i}")).await;
            assert_eq!(resp.status, Status::Success);
            assert_eq!(resp.payload, format!("req-{i}"));
        }
        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn concurrent_clients_are_handled_sequentially() {
        let service = Arc::new(Echo::default());
        let handle = start(service.clone(), DEFAULT_TICK_INTERVAL).await;
        let addr = handle.local_addr();

        let mut clients = Vec::new();
        for c in 0..8 {
            clients.push(tokio::spawn(async move {
                let mut stream = TcpStream::connect(addr).await.unwrap();
                for i in 0..10 {
                    let resp = call(&mut stream, &format!("{c}-{i}")).await;
                    assert_eq!(resp.payload, format!("{c}-{i}"));
                }
            }));
        }
        for c in clients {
            c.await.unwrap();
        }
        assert_eq!(service.seen.lock().unwrap().len(), 80);
        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn bad_frame_and_panic_still_answer() {
        let service = Arc::new(Echo::default());
        let handle = start(service.clone(), DEFAULT_TICK_INTERVAL).await;
        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();

        transport::send_frame(&mut stream, b"garbage").await.unwrap();
        let frame = transport::recv_frame(&mut stream).await.unwrap().unwrap();
        assert_eq!(decode_response(&frame).unwrap().status, Status::BadMessage);

        service.in_handler.store(false, Ordering::SeqCst);
        let resp = call(&mut stream, "boom").await;
        assert_eq!(resp.status, Status::InternalError);

        // The panic left the flag set; clear it and keep using the connection.
        service.in_handler.store(false, Ordering::SeqCst);
        let resp = call(&mut stream, "after").await;
        assert_eq!(resp.status, Status::Success);
        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn housekeeping_runs_on_cadence() {
        let service = Arc::new(Echo::default());
        let handle = start(service.clone(), Duration::from_millis(20)).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let ticks = service.ticks.load(Ordering::SeqCst);
        assert!(ticks >= 3, "expected several ticks, got {ticks}");
        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_releases_port() {
        let service = Arc::new(Echo::default());
        let handle = start(service.clone(), DEFAULT_TICK_INTERVAL).await;
        let addr = handle.local_addr();
        let mut stream = TcpStream::connect(addr).await.unwrap();

        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());
        handle.join().await;

        // The connection was closed by the server.
        assert!(transport::recv_frame(&mut stream).await.unwrap().is_none());
        // And the port can be bound again.
        let again = bind(addr).await.unwrap();
        drop(again);
    }

    #[tokio::test]
    async fn client_disconnect_is_not_fatal() {
        let service = Arc::new(Echo::default());
        let handle = start(service.clone(), DEFAULT_TICK_INTERVAL).await;
        {
            let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
            call(&mut stream, "first").await;
        }
        let mut stream = TcpStream::connect(handle.local_addr()).await.unwrap();
        assert_eq!(call(&mut stream, "second").await.payload, "second");
        handle.stop();
        handle.join().await;
    }
}
