//! Channel wrapper that emits packet events.

use std::sync::Arc;

use async_trait::async_trait;

use super::traits::{Channel, TransportError};
use crate::events::{DmkEvent, DmkObserver, PacketDirection};
use crate::session::SessionId;

/// Bytes of each frame copied into packet events.
const PREVIEW_LEN: usize = 32;

pub struct ObservableChannel {
    inner: Box<dyn Channel>,
    observer: Arc<dyn DmkObserver>,
    session_id: SessionId,
}

impl ObservableChannel {
    pub fn new(inner: Box<dyn Channel>, observer: Arc<dyn DmkObserver>, session_id: SessionId) -> Self {
        Self {
            inner,
            observer,
            session_id,
        }
    }

    fn emit(&self, direction: PacketDirection, data: &[u8]) {
        self.observer.on_event(&DmkEvent::Packet {
            session_id: self.session_id,
            direction,
            length: data.len(),
            data: Some(data.iter().take(PREVIEW_LEN).copied().collect()),
        });
    }
}

#[async_trait]
impl Channel for ObservableChannel {
    async fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.write(data).await;
        if res.is_ok() {
            self.emit(PacketDirection::Tx, data);
        }
        res
    }

    async fn read(&mut self) -> Result<Vec<u8>, TransportError> {
        let res = self.inner.read().await;
        if let Ok(data) = &res
            && !data.is_empty()
        {
            self.emit(PacketDirection::Rx, data);
        }
        res
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.close().await
    }
}
