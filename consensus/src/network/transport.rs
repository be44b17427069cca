// Message transport seen by a single peer connection
//
// The wire encoding and the socket belong to the host; a connection only
// needs to send and receive whole messages. `MsgPipe` connects two ends in
// memory for tests and local simulations.

use super::{NetworkError, NetworkResult};
use crate::protocols::{ConsensusMessage, StatusData};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

/// Frames exchanged on a consensus connection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerMessage {
    Status(StatusData),
    Consensus(ConsensusMessage),
}

impl PeerMessage {
    pub fn name(&self) -> &'static str {
        match self {
            PeerMessage::Status(_) => "Status",
            PeerMessage::Consensus(_) => "Consensus",
        }
    }
}

#[async_trait]
pub trait MsgReadWriter: Send + Sync {
    async fn write_msg(&self, msg: PeerMessage) -> NetworkResult<()>;

    async fn read_msg(&self) -> NetworkResult<PeerMessage>;
}

/// One end of an in-memory bidirectional pipe
pub struct MsgPipe {
    tx: mpsc::Sender<PeerMessage>,
    rx: Mutex<mpsc::Receiver<PeerMessage>>,
}

impl MsgPipe {
    /// Two connected ends, each buffering up to `capacity` messages
    pub fn pair(capacity: usize) -> (MsgPipe, MsgPipe) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            MsgPipe {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            MsgPipe {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl MsgReadWriter for MsgPipe {
    async fn write_msg(&self, msg: PeerMessage) -> NetworkResult<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|e| NetworkError::SendError(format!("pipe closed: {}", e.0.name())))
    }

    async fn read_msg(&self) -> NetworkResult<PeerMessage> {
        self.rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| NetworkError::ReceiveError("pipe closed".into()))
    }
}
