use tokio::{sync::mpsc, task::JoinHandle};

use crate::detour::relay::{
    codec::Codec,
    protocol::RelayMessage,
    transport::{BoxedSink, TransportError},
};

/// Queue depth between producers (dispatch loop, pullers) and the writer.
pub const OUTBOUND_QUEUE: usize = 256;

/// Handle to the single task that owns a transport's sending half.
///
/// Every producer on a connection sends through a clone of this handle, so
/// frames are written one at a time and never interleave.
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<RelayMessage>,
}

impl Outbound {
    pub fn spawn(sink: BoxedSink, codec: Codec) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let task = tokio::spawn(run_writer(sink, codec, rx));
        (Self { tx }, task)
    }

    /// Outbound handle whose messages land in a plain channel instead of a
    /// transport.
    #[cfg(test)]
    pub fn detached(capacity: usize) -> (Self, mpsc::Receiver<RelayMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn send(&self, msg: RelayMessage) -> Result<(), TransportError> {
        self.tx.send(msg).await.map_err(|_| TransportError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

async fn run_writer(mut sink: BoxedSink, codec: Codec, mut rx: mpsc::Receiver<RelayMessage>) {
    while let Some(msg) = rx.recv().await {
        let frame = match codec.pack(&msg) {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!(session = %msg.session, cmd = %msg.command(), err = %err, "relay: pack failed; dropping message");
                continue;
            }
        };
        if let Err(err) = sink.send(frame).await {
            tracing::debug!(err = %err, "relay: transport write failed; writer stopping");
            break;
        }
    }
    rx.close();
    sink.close().await;
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::detour::relay::transport::framed;

    #[tokio::test]
    async fn concurrent_producers_never_interleave_frames() {
        let (a, b) = tokio::io::duplex(1 << 20);
        let (_a_src, a_sink) = framed::framed(a);
        let (mut b_src, _b_sink) = framed::framed(b);

        let codec = Codec::new("pw");
        let (out, writer) = Outbound::spawn(a_sink, codec.clone());

        let mut producers = Vec::new();
        for p in 0..8u8 {
            let out = out.clone();
            producers.push(tokio::spawn(async move {
                for i in 0..50u8 {
                    let payload = Bytes::from(vec![p; 100 + i as usize]);
                    out.send(RelayMessage::data(format!("s{p}").as_str().into(), payload))
                        .await
                        .unwrap();
                }
            }));
        }
        for p in producers {
            p.await.unwrap();
        }
        drop(out);

        let mut per_session = std::collections::HashMap::<String, u8>::new();
        while let Some(frame) = b_src.recv().await.unwrap() {
            let m = codec.unpack(&frame).unwrap();
            let p: u8 = m.session.as_str()[1..].parse().unwrap();
            assert!(m.data.payload.iter().all(|&x| x == p));
            let seen = per_session.entry(m.session.to_string()).or_default();
            assert_eq!(m.data.payload.len(), 100 + *seen as usize);
            *seen += 1;
        }
        assert_eq!(per_session.len(), 8);
        assert!(per_session.values().all(|&n| n == 50));
        writer.await.unwrap();
    }
}
