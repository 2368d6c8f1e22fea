//! Message stream decoration
//!
//! [`MessageStream`] is the capability set a streaming call exposes to the
//! application: send, receive, and closing the send half. The metered
//! wrappers count messages on top of any implementation, and the client-side
//! wrapper also finalizes the call when the receive half terminates.

use crate::labels::MethodDescriptor;
use crate::metrics::GrpcMetrics;
use crate::registry::{Counter, Histogram};
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tonic::{Code, Status};

/// A bidirectional message channel
#[async_trait]
pub trait MessageStream: Send {
    type Outbound: Send;
    type Inbound: Send;

    /// Send one message to the peer
    async fn send_message(&mut self, message: Self::Outbound) -> Result<(), Status>;

    /// Receive the next message; `Ok(None)` is a clean end of stream
    async fn recv_message(&mut self) -> Result<Option<Self::Inbound>, Status>;

    /// Signal that no more messages will be sent
    async fn close_send(&mut self) -> Result<(), Status> {
        Ok(())
    }
}

/// Server-side stream that counts sent and received messages
pub struct MeteredServerStream<S> {
    inner: S,
    sent: Arc<Counter>,
    received: Arc<Counter>,
}

impl<S> MeteredServerStream<S> {
    pub(crate) fn new(inner: S, sent: Arc<Counter>, received: Arc<Counter>) -> Self {
        Self {
            inner,
            sent,
            received,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

#[async_trait]
impl<S: MessageStream> MessageStream for MeteredServerStream<S> {
    type Outbound = S::Outbound;
    type Inbound = S::Inbound;

    async fn send_message(&mut self, message: Self::Outbound) -> Result<(), Status> {
        self.inner.send_message(message).await?;
        self.sent.inc();
        Ok(())
    }

    async fn recv_message(&mut self) -> Result<Option<Self::Inbound>, Status> {
        let message = self.inner.recv_message().await?;
        if message.is_some() {
            self.received.inc();
        }
        Ok(message)
    }

    async fn close_send(&mut self) -> Result<(), Status> {
        self.inner.close_send().await
    }
}

/// Client-side stream that counts messages and records the call outcome
/// when the receive half terminates.
///
/// End of stream counts as `OK`; a receive error counts with its own code.
/// Only the first terminal receive is recorded.
pub struct MeteredClientStream<S> {
    inner: S,
    sent: Arc<Counter>,
    received: Arc<Counter>,
    metrics: Arc<GrpcMetrics>,
    descriptor: MethodDescriptor,
    handling: Option<Arc<Histogram>>,
    started: Option<Instant>,
    finished: bool,
}

impl<S> MeteredClientStream<S> {
    pub(crate) fn new(
        inner: S,
        metrics: Arc<GrpcMetrics>,
        descriptor: MethodDescriptor,
        handling: Option<Arc<Histogram>>,
        started: Option<Instant>,
    ) -> Self {
        let labels = descriptor.labels().unwrap_or_else(|e| e.fatal());
        let sent = metrics.msg_sent(&labels);
        let received = metrics.msg_received(&labels);
        Self {
            inner,
            sent,
            received,
            metrics,
            descriptor,
            handling,
            started,
            finished: false,
        }
    }

    /// Whether the terminal outcome has been recorded
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    fn finish(&mut self, code: Code) {
        if self.finished {
            return;
        }
        self.finished = true;

        let labels = self.descriptor.labels().unwrap_or_else(|e| e.fatal());
        self.metrics.handled(&labels, code).inc();
        if let (Some(handling), Some(started)) = (&self.handling, self.started) {
            handling.observe_since(started);
        }
    }
}

#[async_trait]
impl<S: MessageStream> MessageStream for MeteredClientStream<S> {
    type Outbound = S::Outbound;
    type Inbound = S::Inbound;

    async fn send_message(&mut self, message: Self::Outbound) -> Result<(), Status> {
        self.inner.send_message(message).await?;
        self.sent.inc();
        Ok(())
    }

    async fn recv_message(&mut self) -> Result<Option<Self::Inbound>, Status> {
        match self.inner.recv_message().await {
            Ok(Some(message)) => {
                self.received.inc();
                Ok(Some(message))
            }
            Ok(None) => {
                self.finish(Code::Ok);
                Ok(None)
            }
            Err(status) => {
                self.finish(status.code());
                Err(status)
            }
        }
    }

    async fn close_send(&mut self) -> Result<(), Status> {
        self.inner.close_send().await
    }
}

/// Channel-backed stream: an inbound message stream (such as
/// `tonic::Streaming`) paired with an mpsc sender for the outbound half.
pub struct ChannelStream<In, Out> {
    inbound: BoxStream<'static, Result<In, Status>>,
    outbound: Option<mpsc::Sender<Out>>,
}

impl<In, Out> ChannelStream<In, Out> {
    pub fn new<S>(inbound: S, outbound: mpsc::Sender<Out>) -> Self
    where
        S: Stream<Item = Result<In, Status>> + Send + 'static,
    {
        Self {
            inbound: inbound.boxed(),
            outbound: Some(outbound),
        }
    }
}

#[async_trait]
impl<In, Out> MessageStream for ChannelStream<In, Out>
where
    In: Send + 'static,
    Out: Send + 'static,
{
    type Outbound = Out;
    type Inbound = In;

    async fn send_message(&mut self, message: Out) -> Result<(), Status> {
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("send half already closed"))?;
        outbound
            .send(message)
            .await
            .map_err(|_| Status::cancelled("peer dropped the stream"))
    }

    async fn recv_message(&mut self) -> Result<Option<In>, Status> {
        self.inbound.next().await.transpose()
    }

    async fn close_send(&mut self) -> Result<(), Status> {
        self.outbound = None;
        Ok(())
    }
}
