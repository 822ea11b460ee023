//! Batched work-request task surface.
//!
//! A `Task` builds up a sequence of waits and work requests to post as one
//! batch. Rather than guess at a wire-incompatible batching scheme without
//! a settled ordering and completion model, this crate exposes the surface
//! and reports it unimplemented through the ordinary `Result` path
//! (`UnsupportedFeature`) so callers can detect the gap instead of the
//! build simply missing a symbol.

use crate::error::TransportError;

use super::endpoint::Endpoint;
use super::message_type::MessageType;
use super::mr::{MemoryRegion, RemoteMemoryRegion};

/// A batched sequence of work requests to post to an [`Endpoint`] together.
/// Every method currently reports [`TransportError::UnsupportedFeature`].
#[derive(Debug, Default)]
pub struct Task {
    _private: (),
}

impl Task {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_wait(&mut self, _on: &MessageType) -> Result<(), TransportError> {
        Err(TransportError::UnsupportedFeature("Task::append_wait"))
    }

    pub fn append_enable_send(&mut self, _mt: &MessageType) -> Result<(), TransportError> {
        Err(TransportError::UnsupportedFeature("Task::append_enable_send"))
    }

    pub fn append_send(
        &mut self,
        _mt: &MessageType,
        _wr_id: u64,
        _region: &MemoryRegion<'_>,
        _range: std::ops::Range<usize>,
    ) -> Result<(), TransportError> {
        Err(TransportError::UnsupportedFeature("Task::append_send"))
    }

    pub fn append_recv(
        &mut self,
        _mt: &MessageType,
        _wr_id: u64,
        _region: &MemoryRegion<'_>,
        _range: std::ops::Range<usize>,
    ) -> Result<(), TransportError> {
        Err(TransportError::UnsupportedFeature("Task::append_recv"))
    }

    pub fn post(&mut self, _ep: &Endpoint, _target: Option<RemoteMemoryRegion>) -> Result<(), TransportError> {
        Err(TransportError::UnsupportedFeature("Task::post"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_method_reports_unsupported() {
        let mut task = Task::new();
        assert!(matches!(
            task.append_enable_send(&super::message_type::MessageTypeRegistry::ignored()),
            Err(TransportError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            task.append_wait(&super::message_type::MessageTypeRegistry::ignored()),
            Err(TransportError::UnsupportedFeature(_))
        ));
    }
}
