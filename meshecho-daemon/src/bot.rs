//! Reply loop: every inbound message is handled on its own task; delivery outcomes are logged.

use std::sync::Arc;

use async_trait::async_trait;
use meshecho_core::{
    DeliveryError, DeliveryHandle, DeliveryOutcome, DeliveryReport, DestinationHash, EchoError,
    EchoHandler, InboundMessage, OutboundMessage, PeerStatus, Reply,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What the reply loop and the announcer need from the mesh.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Broadcast our destination once.
    async fn announce(&self) -> std::io::Result<()>;

    /// What is known about `destination` (stamp cost, link state) once a path to it has been
    /// resolved. An unknown destination is requested and waited for up to the path request
    /// timeout; the status is then whatever is known.
    async fn resolve_peer(&self, destination: &DestinationHash) -> PeerStatus;

    /// Queue `message` for delivery. Returns immediately; the outcome is reported later on the
    /// transport's report channel.
    async fn send(&self, message: OutboundMessage) -> Result<DeliveryHandle, DeliveryError>;
}

pub struct EchoBot<T> {
    handler: EchoHandler,
    transport: Arc<T>,
}

impl<T: Transport> EchoBot<T> {
    pub fn new(handler: EchoHandler, transport: Arc<T>) -> Self {
        Self { handler, transport }
    }

    /// Handle one inbound message. Returns the handle of the submitted reply, `None` when the
    /// reply was skipped.
    pub async fn on_message(&self, inbound: InboundMessage) -> Result<Option<DeliveryHandle>, EchoError> {
        info!(
            source = %inbound.source,
            message_id = %inbound.id,
            method = %inbound.method,
            "received message: {}",
            inbound.content_as_string()
        );
        if let Some(signal) = inbound.signal {
            debug!(rssi = ?signal.rssi, snr = ?signal.snr, "signal quality");
        }
        let peer = self.transport.resolve_peer(&inbound.source).await;
        match self.handler.handle(&inbound, peer) {
            Reply::Skip(reason) => {
                info!(destination = %inbound.source, "not replying: {}", reason);
                Ok(None)
            }
            Reply::Send(reply) => {
                let handle = self.transport.send(reply).await?;
                info!(
                    destination = %handle.destination,
                    message_id = %handle.message_id,
                    method = %handle.method,
                    "sending reply"
                );
                Ok(Some(handle))
            }
        }
    }

    /// Consume inbound messages until the transport closes the channel. Each message runs on
    /// its own task; a failed reply only affects that message.
    pub async fn run(self: Arc<Self>, mut inbound_rx: mpsc::UnboundedReceiver<InboundMessage>) {
        while let Some(inbound) = inbound_rx.recv().await {
            let bot = self.clone();
            tokio::spawn(async move {
                let source = inbound.source;
                if let Err(e) = bot.on_message(inbound).await {
                    warn!(destination = %source, "{}", e);
                }
            });
        }
        debug!("inbound channel closed");
    }
}

/// Log every delivery outcome. Outcomes never trigger further action.
pub async fn log_outcomes(mut reports: mpsc::UnboundedReceiver<DeliveryReport>) {
    while let Some(report) = reports.recv().await {
        let DeliveryReport {
            handle,
            outcome,
            elapsed,
        } = report;
        match outcome {
            DeliveryOutcome::Delivered => info!(
                destination = %handle.destination,
                message_id = %handle.message_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "reply delivered"
            ),
            DeliveryOutcome::Failed(reason) => warn!(
                destination = %handle.destination,
                message_id = %handle.message_id,
                "reply failed: {}",
                reason
            ),
            DeliveryOutcome::TimedOut => warn!(
                destination = %handle.destination,
                message_id = %handle.message_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "reply timed out waiting for proof"
            ),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use meshecho_core::{DeliveryMethod, Fields, MessageId};

    /// Records announces and sends; optionally refuses submissions.
    pub(crate) struct MockTransport {
        pub announces: Mutex<Vec<tokio::time::Instant>>,
        pub sent_tx: mpsc::UnboundedSender<OutboundMessage>,
        pub statuses: HashMap<DestinationHash, PeerStatus>,
        pub refuse: bool,
    }

    impl MockTransport {
        pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<OutboundMessage>) {
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            (
                Self {
                    announces: Mutex::new(Vec::new()),
                    sent_tx,
                    statuses: HashMap::new(),
                    refuse: false,
                },
                sent_rx,
            )
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn announce(&self) -> std::io::Result<()> {
            self.announces
                .lock()
                .unwrap()
                .push(tokio::time::Instant::now());
            Ok(())
        }

        async fn resolve_peer(&self, destination: &DestinationHash) -> PeerStatus {
            self.statuses.get(destination).copied().unwrap_or_default()
        }

        async fn send(&self, message: OutboundMessage) -> Result<DeliveryHandle, DeliveryError> {
            if self.refuse {
                return Err(DeliveryError::Closed);
            }
            let (_, message_id) = message.envelope().pack()?;
            let handle = DeliveryHandle {
                message_id,
                destination: message.destination,
                method: message.desired_method,
            };
            let _ = self.sent_tx.send(message);
            Ok(handle)
        }
    }

    const BOT: DestinationHash = DestinationHash::from_bytes([0xee; 16]);

    fn inbound(from: u8, content: &[u8]) -> InboundMessage {
        InboundMessage {
            id: MessageId::from_bytes([from; 32]),
            source: DestinationHash::from_bytes([from; 16]),
            destination: BOT,
            title: b"t".to_vec(),
            content: content.to_vec(),
            fields: Fields::new(),
            timestamp_ms: 0,
            received_at_ms: 0,
            method: DeliveryMethod::Opportunistic,
            signal: None,
        }
    }

    #[tokio::test]
    async fn reply_goes_back_to_sender() {
        let (mock, mut sent) = MockTransport::new();
        let bot = EchoBot::new(EchoHandler::new(BOT, None), Arc::new(mock));
        let handle = bot.on_message(inbound(3, b"echo me")).await.unwrap().unwrap();
        let reply = sent.recv().await.unwrap();
        assert_eq!(reply.destination, DestinationHash::from_bytes([3; 16]));
        assert_eq!(reply.source, BOT);
        assert_eq!(reply.content, b"echo me");
        assert_eq!(handle.destination, reply.destination);
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn submission_failure_is_reported_not_retried() {
        let (mut mock, mut sent) = MockTransport::new();
        mock.refuse = true;
        let bot = EchoBot::new(EchoHandler::new(BOT, None), Arc::new(mock));
        let err = bot.on_message(inbound(3, b"x")).await.err().unwrap();
        assert!(matches!(err, EchoError::DeliverySubmission(_)));
        assert!(!err.is_fatal());
        assert!(sent.try_recv().is_err());
    }

    #[tokio::test]
    async fn expensive_sender_gets_no_reply() {
        let (mut mock, mut sent) = MockTransport::new();
        mock.statuses.insert(
            DestinationHash::from_bytes([4; 16]),
            PeerStatus {
                stamp_cost: Some(30),
                link_active: false,
            },
        );
        let bot = EchoBot::new(EchoHandler::new(BOT, Some(16)), Arc::new(mock));
        assert!(bot.on_message(inbound(4, b"x")).await.unwrap().is_none());
        assert!(bot.on_message(inbound(5, b"y")).await.unwrap().is_some());
        assert_eq!(sent.recv().await.unwrap().content, b"y");
    }

    #[tokio::test]
    async fn concurrent_messages_each_get_their_own_reply() {
        let (mock, mut sent) = MockTransport::new();
        let bot = Arc::new(EchoBot::new(EchoHandler::new(BOT, None), Arc::new(mock)));
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn(bot.run(rx));
        tx.send(inbound(1, b"from one")).unwrap();
        tx.send(inbound(2, b"from two")).unwrap();
        drop(tx);

        let mut replies = Vec::new();
        for _ in 0..2 {
            let reply = tokio::time::timeout(Duration::from_secs(5), sent.recv())
                .await
                .unwrap()
                .unwrap();
            replies.push((reply.destination, reply.content));
        }
        replies.sort();
        assert_eq!(
            replies,
            vec![
                (DestinationHash::from_bytes([1; 16]), b"from one".to_vec()),
                (DestinationHash::from_bytes([2; 16]), b"from two".to_vec()),
            ]
        );
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn failing_message_does_not_stop_the_loop() {
        let (mut mock, _sent) = MockTransport::new();
        mock.refuse = true;
        let bot = Arc::new(EchoBot::new(EchoHandler::new(BOT, None), Arc::new(mock)));
        let (tx, rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn(bot.run(rx));
        tx.send(inbound(1, b"a")).unwrap();
        tx.send(inbound(2, b"b")).unwrap();
        drop(tx);
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn outcome_logger_drains_reports() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = DeliveryHandle {
            message_id: MessageId::from_bytes([1; 32]),
            destination: DestinationHash::from_bytes([1; 16]),
            method: DeliveryMethod::Direct,
        };
        for outcome in [
            DeliveryOutcome::Delivered,
            DeliveryOutcome::TimedOut,
            DeliveryOutcome::Failed(meshecho_core::FailureReason::NoPath),
        ] {
            tx.send(DeliveryReport {
                handle,
                outcome,
                elapsed: Duration::from_millis(5),
            })
            .unwrap();
        }
        drop(tx);
        log_outcomes(rx).await;
    }
}
