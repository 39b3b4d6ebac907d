use std::sync::Arc;

use anyhow::{Context, Result};
use sourcelens_core::framing::{MessageFramer, encode_frame};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::envelope::Envelope;
use crate::request::InboundMessage;
use crate::service::BridgeService;

const READ_CHUNK: usize = 64 * 1024;

/// Serves framed requests from `reader` until it reaches end of input. Each
/// request runs on its own task; replies are framed onto `writer` by a single
/// writer task in completion order. All sessions are exited before returning.
pub async fn serve<R, W>(service: Arc<BridgeService>, mut reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
    let replies = tokio::spawn(write_replies(writer, rx));

    let mut framer = MessageFramer::new();
    let mut handlers = JoinSet::new();
    let mut buf = vec![0u8; READ_CHUNK];

    let read_result: Result<()> = loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break Ok(()),
            Ok(n) => n,
            Err(err) => break Err(err).context("failed to read request stream"),
        };

        let mut inbound = Vec::new();
        framer.push(&buf[..n], |message| inbound.push(message));
        for message in inbound {
            let message = match InboundMessage::from_value(message) {
                Ok(message) => message,
                Err(err) => {
                    warn!("dropping message without a request name: {err}");
                    continue;
                }
            };
            let service = service.clone();
            let tx = tx.clone();
            handlers.spawn(async move {
                let reply = service.handle(&message).await;
                let _ = tx.send(reply);
            });
        }

        while let Some(done) = handlers.try_join_next() {
            if let Err(err) = done
                && err.is_panic()
            {
                warn!("request handler panicked: {err}");
            }
        }
    };

    if !framer.is_idle() {
        debug!("input ended inside a frame");
    }
    info!(in_flight = handlers.len(), "request stream closed, shutting down");
    handlers.shutdown().await;
    service.close_all().await;

    drop(tx);
    match replies.await {
        Ok(Err(err)) => warn!("reply writer stopped: {err:#}"),
        Err(err) => warn!("reply writer panicked: {err}"),
        Ok(Ok(())) => {}
    }
    read_result
}

async fn write_replies<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Envelope>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = rx.recv().await {
        let frame = match encode_frame(&envelope.to_value()) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(request = %envelope.request, "dropping reply: {err}");
                continue;
            }
        };
        writer
            .write_all(&frame)
            .await
            .context("failed to write reply")?;
        writer.flush().await.context("failed to flush reply")?;
    }
    Ok(())
}
