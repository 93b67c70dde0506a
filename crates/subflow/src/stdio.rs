// SPDX-License-Identifier: MIT OR Apache-2.0
//! Glue between process pipes and the message channel.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::Broadcast;
use crate::message::{Input, Message, StdioStream};

/// Size of the buffer each output pipe is read into.
pub const CHUNK_SIZE: usize = 8 * 1024;

/// Publishes every chunk handed to it as exactly one stdio [`Message`].
#[derive(Debug, Clone)]
pub struct StdioWriter {
    stream: StdioStream,
    bus: Broadcast<Message>,
}

impl StdioWriter {
    /// A writer tagging its chunks with `stream`.
    pub fn new(stream: StdioStream, bus: Broadcast<Message>) -> Self {
        Self { stream, bus }
    }

    /// Stream this writer tags messages with.
    pub fn stream(&self) -> StdioStream {
        self.stream
    }

    /// Publish a private copy of `chunk`. Returns the number of bytes taken.
    pub fn write(&self, chunk: &[u8]) -> usize {
        self.bus.push([Message::stdio(self.stream, chunk)]);
        chunk.len()
    }
}

/// Read `reader` chunk by chunk into `writer` until EOF, a read error, or `stop`.
pub(crate) async fn forward<R>(mut reader: R, writer: StdioWriter, stop: CancellationToken)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            read = reader.read(&mut buf) => read,
        };
        match read {
            Ok(0) => break,
            Ok(n) => {
                writer.write(&buf[..n]);
            }
            Err(e) => {
                debug!(target: "subflow.stdio", stream = %writer.stream(), error = %e, "pipe read failed");
                break;
            }
        }
    }
}

/// Deliver queued inputs to `stdin`, echoing what was written.
///
/// Ends when the queue is finished, `stop` fires, or a write fails; then
/// closes `stdin` and reports the close result.
pub(crate) async fn pump_input<W>(
    mut queue: mpsc::UnboundedReceiver<Input>,
    mut stdin: W,
    echo: StdioWriter,
    stop: CancellationToken,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let input = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            next = queue.recv() => match next {
                Some(input) => input,
                None => break,
            },
        };

        let data = input.as_bytes();
        let (written, result) = write_counted(&mut stdin, data).await;
        if written > 0 {
            echo.write(&data[..written]);
        }

        if let Err(e) = result {
            warn!(target: "subflow.stdio", error = %e, written, len = data.len(), "stdin write failed");
            break;
        }
        if written < data.len() {
            warn!(target: "subflow.stdio", written, len = data.len(), "incomplete write of stdin");
        }
    }

    // Remaining inputs are abandoned with the queue.
    queue.close();
    stdin.shutdown().await
}

/// Write all of `data`, reporting how much reached the pipe even on failure.
async fn write_counted<W>(stdin: &mut W, data: &[u8]) -> (usize, io::Result<()>)
where
    W: AsyncWrite + Unpin,
{
    let mut written = 0;
    while written < data.len() {
        match stdin.write(&data[written..]).await {
            Ok(0) => return (written, Err(io::ErrorKind::WriteZero.into())),
            Ok(n) => written += n,
            Err(e) => return (written, Err(e)),
        }
    }
    (written, stdin.flush().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn collect_data(messages: &[Message]) -> Vec<Vec<u8>> {
        messages
            .iter()
            .filter_map(|m| m.data().map(<[u8]>::to_vec))
            .collect()
    }

    #[tokio::test]
    async fn forward_publishes_one_message_per_chunk() {
        let bus = Broadcast::new();
        let scope = CancellationToken::new();
        let sub = bus.listen(&scope);

        let (mut tx, rx) = tokio::io::duplex(64);
        let writer = StdioWriter::new(StdioStream::Stderr, bus.clone());
        let task = tokio::spawn(forward(rx, writer, CancellationToken::new()));

        tx.write_all(b"one").await.unwrap();
        tx.flush().await.unwrap();
        tokio::task::yield_now().await;
        drop(tx);
        task.await.unwrap();
        bus.close([]);

        let messages: Vec<Message> = sub.collect().await;
        assert!(messages.iter().all(|m| m.kind() == crate::MessageKind::Stderr));
        assert_eq!(collect_data(&messages).concat(), b"one");
    }

    #[tokio::test]
    async fn forward_stops_on_cancel() {
        let bus = Broadcast::new();
        let (_tx, rx) = tokio::io::duplex(64);
        let stop = CancellationToken::new();
        let task = tokio::spawn(forward(
            rx,
            StdioWriter::new(StdioStream::Stdout, bus),
            stop.clone(),
        ));
        stop.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn pump_writes_in_order_and_echoes() {
        let bus = Broadcast::new();
        let sub = bus.listen(&CancellationToken::new());
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        queue_tx.send(Input::line("a")).unwrap();
        queue_tx.send(Input::line("b")).unwrap();
        drop(queue_tx);

        let (stdin, mut child_side) = tokio::io::duplex(64);
        let echo = StdioWriter::new(StdioStream::Stdin, bus.clone());
        pump_input(queue_rx, stdin, echo, CancellationToken::new())
            .await
            .unwrap();
        bus.close([]);

        let mut received = Vec::new();
        child_side.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"a\nb\n");

        let messages: Vec<Message> = sub.collect().await;
        assert_eq!(collect_data(&messages), vec![b"a\n".to_vec(), b"b\n".to_vec()]);
    }

    /// Accepts `limit` bytes, then fails every write.
    struct Choking {
        limit: usize,
    }

    impl AsyncWrite for Choking {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if self.limit == 0 {
                return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
            }
            let n = buf.len().min(self.limit);
            self.limit -= n;
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn pump_echoes_only_bytes_written_and_stops_on_failure() {
        let bus = Broadcast::new();
        let sub = bus.listen(&CancellationToken::new());
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        queue_tx.send(Input::new("hello")).unwrap();
        queue_tx.send(Input::new("never")).unwrap();

        let echo = StdioWriter::new(StdioStream::Stdin, bus.clone());
        pump_input(queue_rx, Choking { limit: 3 }, echo, CancellationToken::new())
            .await
            .unwrap();
        bus.close([]);

        let messages: Vec<Message> = sub.collect().await;
        assert_eq!(collect_data(&messages), vec![b"hel".to_vec()]);
        assert!(queue_tx.send(Input::new("late")).is_err());
    }
}
