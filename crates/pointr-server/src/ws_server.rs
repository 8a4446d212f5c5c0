// WebSocket server: one ClientSyncAdapter per browser connection.

use std::sync::Arc;

use anyhow::Context;
use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use pointr_core::{ClientSyncAdapter, MemoryRefs, SessionId, SessionStore, UserAction};

use crate::protocol::{parse_client_message, ClientMessage, Hello, ServerMessage};

/// Actions buffered per connection before the reader waits on the adapter.
const ACTION_BUFFER: usize = 64;
/// Views buffered per connection before the adapter waits on the socket.
const VIEW_BUFFER: usize = 64;

type WsResult = Result<Message, tokio_tungstenite::tungstenite::Error>;

/// Accept connections on `listener` forever, serving each on its own task.
pub async fn serve(listener: TcpListener, store: Arc<SessionStore>) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!("WebSocket server listening on {local_addr}");

    loop {
        let (stream, addr) = listener.accept().await?;
        let addr = addr.to_string();
        info!("Accepted TCP connection from {addr}");

        let store = store.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, &addr, store).await {
                warn!("Connection {addr} ended with error: {e:#}");
            }
            info!("Client {addr} disconnected");
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: &str,
    store: Arc<SessionStore>,
) -> anyhow::Result<()> {
    let ws_stream = tokio_tungstenite::accept_async(stream)
        .await
        .context("WebSocket handshake failed")?;
    let (mut write, mut read) = ws_stream.split();

    let Some(hello) = wait_for_hello(&mut read, addr).await else {
        return Ok(());
    };

    let session = match resolve_session(&hello) {
        Ok(session) => session,
        Err(message) => {
            send_message(&mut write, &ServerMessage::Error { message }).await?;
            return Ok(());
        }
    };
    let refs = Arc::new(match hello.participant_id {
        Some(id) => MemoryRefs::with(session.clone(), id),
        None => MemoryRefs::new(),
    });

    let adapter = match ClientSyncAdapter::connect(store, session.clone(), refs).await {
        Ok(adapter) => adapter,
        Err(e) => {
            warn!("Client {addr} could not attach to session {session}: {e}");
            let message = format!("Could not load session {session}. Please try again.");
            send_message(&mut write, &ServerMessage::Error { message }).await?;
            return Ok(());
        }
    };
    info!("Client {addr} attached to session {session}");

    let (action_tx, action_rx) = mpsc::channel(ACTION_BUFFER);
    let (view_tx, mut view_rx) = mpsc::channel(VIEW_BUFFER);
    let client = tokio::spawn(adapter.run(action_rx, view_tx));

    let writer = tokio::spawn(async move {
        while let Some(view) = view_rx.recv().await {
            send_message(&mut write, &ServerMessage::View { view }).await?;
        }
        let _ = write.close().await;
        anyhow::Ok(())
    });

    // Ends on close, socket error, or when the adapter is gone.
    let _ = process_message_stream(read, &action_tx, addr).await;
    drop(action_tx);

    client.await.context("client task panicked")??;
    match writer.await.context("writer task panicked")? {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("Client {addr} writer stopped: {e:#}");
            Ok(())
        }
    }
}

fn resolve_session(hello: &Hello) -> Result<SessionId, String> {
    match hello.session_id.as_deref() {
        Some(raw) => SessionId::parse(raw).map_err(|e| e.to_string()),
        None => Ok(SessionId::generate()),
    }
}

async fn send_message<S>(write: &mut S, message: &ServerMessage) -> anyhow::Result<()>
where
    S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let text = serde_json::to_string(message).context("failed to encode server message")?;
    write.send(Message::Text(text.into())).await?;
    Ok(())
}

/// Read until the client's HELLO. Anything sent before it is logged and
/// dropped. Returns `None` if the connection ends first.
pub async fn wait_for_hello<St>(stream: &mut St, addr: &str) -> Option<Hello>
where
    St: Stream<Item = WsResult> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match parse_client_message(text.as_str()) {
                Ok(ClientMessage::Hello(hello)) => return Some(hello),
                Ok(ClientMessage::Action(action)) => {
                    warn!("Client {addr} sent {action:?} before HELLO, ignoring");
                }
                Err(e) => warn!("Client {addr} sent unparseable message: {e}"),
            },
            Ok(Message::Close(_)) => {
                info!("Client {addr} sent close frame before HELLO");
                return None;
            }
            Err(e) => {
                warn!("WebSocket error from {addr}: {e}");
                return None;
            }
            _ => {}
        }
    }
    None
}

/// Decode text frames from any [`Stream`] into [`UserAction`]s and forward
/// them through `tx`. Unparseable frames and repeated HELLOs are logged and
/// skipped. Returns `Err(())` if the receiving side has gone away.
pub async fn process_message_stream<St>(
    mut stream: St,
    tx: &mpsc::Sender<UserAction>,
    addr: &str,
) -> Result<(), ()>
where
    St: Stream<Item = WsResult> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match parse_client_message(text.as_str()) {
                Ok(ClientMessage::Action(action)) => {
                    debug!("Client {addr} -> {action:?}");
                    if tx.send(action).await.is_err() {
                        return Err(());
                    }
                }
                Ok(ClientMessage::Hello(_)) => {
                    warn!("Client {addr} sent a second HELLO, ignoring");
                }
                Err(e) => warn!("Client {addr} sent unparseable message: {e}"),
            },
            Ok(Message::Close(_)) => {
                info!("Client {addr} sent close frame");
                break;
            }
            Err(e) => {
                warn!("WebSocket error from {addr}: {e}");
                break;
            }
            _ => {
                // Binary, Ping, Pong and raw frames carry nothing for us.
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use tokio_tungstenite::tungstenite::Error as WsError;

    fn mock_stream(messages: Vec<WsResult>) -> impl Stream<Item = WsResult> + Unpin {
        stream::iter(messages)
    }

    fn text(s: &str) -> WsResult {
        Ok(Message::Text(s.into()))
    }

    #[tokio::test]
    async fn actions_forwarded_in_order() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            text(r#"{"type":"JOIN","name":"Ada"}"#),
            text(r#"{"type":"ADD_STORY","title":"Login"}"#),
            text(r#"{"type":"END_VOTING"}"#),
        ];

        process_message_stream(mock_stream(messages), &tx, "test")
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            UserAction::Join { name: "Ada".into() }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            UserAction::AddStory {
                title: "Login".into()
            }
        );
        assert_eq!(rx.recv().await.unwrap(), UserAction::EndVoting);
    }

    #[tokio::test]
    async fn garbage_and_repeat_hello_are_skipped() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            text("{{{"),
            text(r#"{"type":"HELLO","session_id":"x"}"#),
            text(r#"{"type":"NOPE"}"#),
            text(r#"{"type":"SUBMIT_VOTE"}"#),
        ];

        process_message_stream(mock_stream(messages), &tx, "test")
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), UserAction::SubmitVote);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_frame_stops_processing() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            text(r#"{"type":"DISMISS_ERROR"}"#),
            Ok(Message::Close(None)),
            text(r#"{"type":"SUBMIT_VOTE"}"#),
        ];

        process_message_stream(mock_stream(messages), &tx, "test")
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), UserAction::DismissError);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_stops_processing() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            Err(WsError::ConnectionClosed),
            text(r#"{"type":"SUBMIT_VOTE"}"#),
        ];

        process_message_stream(mock_stream(messages), &tx, "test")
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn non_text_frames_are_ignored() {
        let (tx, mut rx) = mpsc::channel(64);
        let messages = vec![
            Ok(Message::Binary(vec![1, 2, 3].into())),
            Ok(Message::Ping(vec![].into())),
            text(r#"{"type":"SUBMIT_VOTE"}"#),
        ];

        process_message_stream(mock_stream(messages), &tx, "test")
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), UserAction::SubmitVote);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn returns_err_when_adapter_is_gone() {
        let (tx, rx) = mpsc::channel(64);
        drop(rx);
        let messages = vec![text(r#"{"type":"SUBMIT_VOTE"}"#)];
        let result = process_message_stream(mock_stream(messages), &tx, "test").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn hello_waits_past_early_actions() {
        let mut messages = mock_stream(vec![
            text(r#"{"type":"SUBMIT_VOTE"}"#),
            text(r#"{"type":"HELLO","session_id":"team"}"#),
            text(r#"{"type":"END_VOTING"}"#),
        ]);

        let hello = wait_for_hello(&mut messages, "test").await.unwrap();
        assert_eq!(hello.session_id.as_deref(), Some("team"));
        // The stream resumes right after the HELLO.
        let (tx, mut rx) = mpsc::channel(64);
        process_message_stream(messages, &tx, "test").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), UserAction::EndVoting);
    }

    #[tokio::test]
    async fn no_hello_before_close() {
        let mut messages = mock_stream(vec![Ok(Message::Close(None))]);
        assert_eq!(wait_for_hello(&mut messages, "test").await, None);
    }

    #[test]
    fn blank_session_id_is_refused() {
        let hello = Hello {
            session_id: Some("   ".into()),
            participant_id: None,
        };
        assert_eq!(
            resolve_session(&hello).unwrap_err(),
            "Please enter a valid session id."
        );
        assert!(resolve_session(&Hello::default()).is_ok());
    }
}
