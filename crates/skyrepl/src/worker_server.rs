//! Framed TCP front end of a worker: accepts connections and dispatches
//! request frames into the processor.

use std::sync::Arc;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::proto::{self, ProtoStatus, ProtoStatusExt, RequestBody, ResponseFrame, ResponseResult};
use crate::worker_processor::WorkerProcessor;
use crate::worker_request::FsStore;

/// A running worker service.
pub struct WorkerServer {
    processor: Arc<WorkerProcessor>,
    local_addr: std::net::SocketAddr,
}

impl WorkerServer {
    /// Bind the service socket, start the processor pool and the accept
    /// loop. Binding to port 0 picks a free port; the chosen address is
    /// available from `local_addr()`.
    pub async fn spawn(config: Arc<Config>, worker: &str) -> anyhow::Result<Arc<Self>> {
        let info = config.worker(worker)?;
        let store = Arc::new(FsStore::new(worker, &info.data_dir));
        let processor = WorkerProcessor::new(worker, config, store);
        processor.run();

        let listener = TcpListener::bind((info.svc_host.as_str(), info.svc_port))
            .await
            .with_context(|| format!("binding worker service at {}", info.svc_addr()))?;
        let local_addr = listener.local_addr().context("resolving bound address")?;
        info!(worker, %local_addr, "worker service listening");

        let server = Arc::new(Self {
            processor: processor.clone(),
            local_addr,
        });
        tokio::spawn(accept_loop(listener, processor));
        Ok(server)
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn processor(&self) -> &Arc<WorkerProcessor> {
        &self.processor
    }

    /// Stop the processor pool. Open connections drop when their peers
    /// disconnect.
    pub fn shutdown(&self) {
        self.processor.stop();
    }
}

async fn accept_loop(listener: TcpListener, processor: Arc<WorkerProcessor>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(%peer, "connection accepted");
                let processor = processor.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, processor).await {
                        debug!(%peer, %err, "connection closed");
                    }
                });
            }
            Err(err) => {
                warn!(%err, "accept failed");
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    processor: Arc<WorkerProcessor>,
) -> anyhow::Result<()> {
    let mut framed = proto::framed(stream);
    while let Some(message) = framed.next().await {
        let bytes = message.context("reading frame")?;
        let response = match proto::decode_request(&bytes) {
            Ok(frame) => dispatch(&processor, frame),
            Err(err) => {
                warn!(%err, "malformed request frame");
                ResponseFrame::bare("", ProtoStatus::Bad, ProtoStatusExt::InvalidParam)
            }
        };
        let payload = proto::encode_response(&response)?;
        framed.send(payload).await.context("writing frame")?;
    }
    Ok(())
}

/// Route one decoded frame to the processor.
fn dispatch(processor: &WorkerProcessor, frame: proto::RequestFrame) -> ResponseFrame {
    match frame.body {
        RequestBody::Status { target_id } => processor.check_status(&frame.id, &target_id),
        RequestBody::Stop { target_id } => processor.dequeue_or_cancel(&frame.id, &target_id),
        RequestBody::ServiceStatus => {
            let mut response =
                ResponseFrame::bare(&frame.id, ProtoStatus::Success, ProtoStatusExt::None);
            response.result = ResponseResult::Service(processor.service_info());
            response
        }
        RequestBody::ServiceDrain => {
            processor.drain();
            let mut response =
                ResponseFrame::bare(&frame.id, ProtoStatus::Success, ProtoStatusExt::None);
            response.result = ResponseResult::Service(processor.service_info());
            response
        }
        body => processor.enqueue(&frame.id, body),
    }
}
