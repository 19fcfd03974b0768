//! Shared fakes for the integration tests: an in-memory STOMP broker behind
//! the `Transport` seam, and a scripted `ChatApi`.
#![allow(dead_code)]

use chrono::DateTime;
use futures_util::future::BoxFuture;
use reqwest::Url;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

use fanchat_client::ChatConfig;
use fanchat_client::api::{ChatApi, HistoryFetchError, ReadStatusError, RequestError, SendError};
use fanchat_client::chat::ConnectionManager;
use fanchat_client::chat::protocol::{Command, Frame};
use fanchat_client::chat::transport::{Transport, TransportError, TransportEvent, TransportLink};
use fanchat_client::models::messages::{ChatMessage, MessageBody, MessagePage, NewMessage, ReadStatus};
use fanchat_client::models::{HistoryQuery, MessageId, RoomId};

pub const WAIT: Duration = Duration::from_secs(5);

/// Config with heart-beats off and short delays.
pub fn test_config() -> ChatConfig {
    let mut config = ChatConfig::new(Url::parse("http://chat.test").unwrap());
    config.heartbeat_outgoing = Duration::ZERO;
    config.heartbeat_incoming = Duration::ZERO;
    config.reconnect_delay = Duration::from_millis(50);
    config.connect_timeout = Duration::from_secs(2);
    config
}

pub fn chat_message(id: MessageId, room_id: RoomId, content: &str) -> ChatMessage {
    ChatMessage {
        id,
        room_id,
        sender_id: 7,
        body: MessageBody::Text(content.to_string()),
        created_at: DateTime::from_timestamp(1_767_268_800 + id, 0).unwrap(),
    }
}

pub fn message_json(id: MessageId, room_id: RoomId, content: &str) -> String {
    serde_json::to_string(&chat_message(id, room_id, content)).unwrap()
}

pub fn page(messages: Vec<ChatMessage>, next_cursor: Option<&str>) -> MessagePage {
    MessagePage {
        messages,
        next_cursor: next_cursor.map(str::to_owned),
    }
}

// ── Fake broker ──

/// The broker's end of one link opened by the client.
pub struct BrokerSide {
    pub from_client: mpsc::UnboundedReceiver<String>,
    pub to_client: mpsc::UnboundedSender<TransportEvent>,
}

impl BrokerSide {
    /// Next raw text the client sent, `None` once the client closed the link.
    pub async fn next_text(&mut self) -> Option<String> {
        timeout(WAIT, self.from_client.recv())
            .await
            .expect("timed out waiting for the client")
    }

    /// Next frame the client sent, skipping heart-beats.
    pub async fn next_frame(&mut self) -> Frame {
        loop {
            let text = self.next_text().await.expect("client closed the link");
            let mut frames = Frame::parse_all(&text).expect("client sent an unparsable frame");
            if !frames.is_empty() {
                return frames.remove(0);
            }
        }
    }

    pub async fn expect(&mut self, command: Command) -> Frame {
        let frame = self.next_frame().await;
        assert_eq!(frame.command, command, "unexpected frame {frame:?}");
        frame
    }

    pub async fn accept(&mut self) {
        self.accept_with_heartbeat("0,0").await;
    }

    pub async fn accept_with_heartbeat(&mut self, heartbeat: &str) {
        self.expect(Command::Connect).await;
        self.send(
            Frame::new(Command::Connected)
                .header("version", "1.2")
                .header("heart-beat", heartbeat),
        );
    }

    /// Wait for the SUBSCRIBE of the next subscription and return its id.
    pub async fn expect_subscribe(&mut self, room_id: RoomId) -> String {
        let frame = self.expect(Command::Subscribe).await;
        assert_eq!(
            frame.get("destination"),
            Some(format!("/topic/chatroom.{room_id}").as_str())
        );
        frame.get("id").expect("SUBSCRIBE without id").to_string()
    }

    pub fn send(&self, frame: Frame) {
        self.send_raw(&frame.encode());
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.to_client.send(TransportEvent::Text(text.to_string()));
    }

    pub fn deliver(&self, subscription_id: &str, body: &str) {
        self.send(
            Frame::new(Command::Message)
                .header("subscription", subscription_id)
                .header("destination", "/topic/chatroom")
                .header("message-id", "m-1")
                .with_body(body),
        );
    }

    pub fn close(&self) {
        let _ = self.to_client.send(TransportEvent::Closed(Some("gone".to_string())));
    }
}

/// In-memory [`Transport`]: every `open` hands its broker side to the test.
pub struct FakeBroker {
    opens: AtomicUsize,
    failures: AtomicUsize,
    sessions: mpsc::UnboundedSender<BrokerSide>,
}

impl FakeBroker {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fail_next_open(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

impl Transport for FakeBroker {
    fn open(&self, _url: String) -> BoxFuture<'static, Result<TransportLink, TransportError>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let sessions = self.sessions.clone();

        Box::pin(async move {
            if fail {
                return Err(TransportError("connection refused".to_string()));
            }
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
            let _ = sessions.send(BrokerSide {
                from_client: outbound_rx,
                to_client: inbound_tx,
            });
            Ok(TransportLink {
                outbound: outbound_tx,
                inbound: inbound_rx,
            })
        })
    }
}

pub fn fake_broker() -> (Arc<FakeBroker>, mpsc::UnboundedReceiver<BrokerSide>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let broker = Arc::new(FakeBroker {
        opens: AtomicUsize::new(0),
        failures: AtomicUsize::new(0),
        sessions: tx,
    });
    (broker, rx)
}

pub struct Connected {
    pub connection: ConnectionManager,
    pub broker: Arc<FakeBroker>,
    pub sessions: mpsc::UnboundedReceiver<BrokerSide>,
    pub side: BrokerSide,
}

/// A manager already connected to a fresh fake broker.
pub async fn connected(config: ChatConfig) -> Connected {
    let (broker, mut sessions) = fake_broker();
    let connection = ConnectionManager::with_transport(config, broker.clone());

    let client = connection.clone();
    let pending = tokio::spawn(async move { client.connect().await });
    let mut side = timeout(WAIT, sessions.recv())
        .await
        .expect("timed out waiting for open")
        .expect("no link opened");
    side.accept().await;
    pending
        .await
        .expect("connect task panicked")
        .expect("connect failed");

    Connected {
        connection,
        broker,
        sessions,
        side,
    }
}

// ── Fake REST collaborator ──

/// Scripted [`ChatApi`] that records every call.
#[derive(Default)]
pub struct FakeApi {
    /// Pages handed out in order; `Err(status)` fails that call.
    pages: Mutex<VecDeque<Result<MessagePage, u16>>>,
    pub history_calls: Mutex<Vec<(RoomId, Option<String>, u32)>>,
    pub sent: Mutex<Vec<(RoomId, NewMessage)>>,
    pub read_calls: Mutex<Vec<(RoomId, MessageId)>>,
    pub fail_send: AtomicBool,
    pub fail_read: AtomicBool,
    /// How long each read-status call takes.
    pub read_delay: Mutex<Duration>,
}

impl FakeApi {
    pub fn with_pages(pages: Vec<Result<MessagePage, u16>>) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(pages.into()),
            ..Self::default()
        })
    }

    pub fn history_calls(&self) -> Vec<(RoomId, Option<String>, u32)> {
        self.history_calls.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<(RoomId, NewMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn read_calls(&self) -> Vec<(RoomId, MessageId)> {
        self.read_calls.lock().unwrap().clone()
    }
}

impl ChatApi for FakeApi {
    async fn fetch_history(
        &self,
        room_id: RoomId,
        query: &HistoryQuery,
    ) -> Result<MessagePage, HistoryFetchError> {
        self.history_calls
            .lock()
            .unwrap()
            .push((room_id, query.cursor.clone(), query.size));
        let next = self.pages.lock().unwrap().pop_front();
        match next {
            Some(Ok(page)) => Ok(page),
            Some(Err(status)) => Err(HistoryFetchError {
                room_id,
                source: RequestError::Status {
                    status,
                    body: "history unavailable".to_string(),
                },
            }),
            None => Ok(MessagePage::default()),
        }
    }

    async fn send_message(&self, room_id: RoomId, message: &NewMessage) -> Result<(), SendError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(SendError {
                room_id,
                source: RequestError::Status {
                    status: 503,
                    body: "try later".to_string(),
                },
            });
        }
        self.sent.lock().unwrap().push((room_id, message.clone()));
        Ok(())
    }

    async fn update_read_status(
        &self,
        room_id: RoomId,
        last_read_message_id: MessageId,
    ) -> Result<ReadStatus, ReadStatusError> {
        self.read_calls
            .lock()
            .unwrap()
            .push((room_id, last_read_message_id));
        let delay = *self.read_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_read.load(Ordering::SeqCst) {
            return Err(ReadStatusError {
                room_id,
                source: RequestError::Status {
                    status: 500,
                    body: "read status down".to_string(),
                },
            });
        }
        Ok(ReadStatus {
            room_id,
            last_read_message_id,
        })
    }
}
