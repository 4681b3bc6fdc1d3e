use std::{net::SocketAddr, sync::Arc, sync::Mutex, time::Duration};

use mcp_gateway::{ClientEvent, UsageRecord, UsageRecorder};
use tokio::sync::mpsc::Receiver;

/// Usage recorder that keeps every record for assertions.
#[derive(Default)]
pub struct CountingRecorder {
    records: Mutex<Vec<UsageRecord>>,
}

impl CountingRecorder {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().expect("recorder poisoned").clone()
    }
}

impl UsageRecorder for CountingRecorder {
    fn record(&self, record: UsageRecord) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.records.lock().expect("recorder poisoned").push(record);
        Ok(())
    }
}

pub async fn serve(router: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    addr
}

pub async fn next_event(events: &mut Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for client event")
        .expect("client channel closed")
}
