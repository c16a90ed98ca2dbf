//! Transport monitoring hook
//!
//! Observers see accepts, teardowns and errors as they happen. They are informational
//! only: framing and dispatch behave the same with or without one installed.

use std::fmt;
use std::sync::Arc;

/// Address reported when an accept fails before a peer is known
pub const UNKNOWN_PEER: &str = "0.0.0.0:0";

/// Something that happened on a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// TCP listener bound and accepting
    Listening { address: String },
    /// TCP listener could not be bound
    BindFailed { address: String, error: String },
    /// Connection accepted
    Accepted { peer: String },
    /// Accept loop failed and has stopped
    AcceptFailed { error: String },
    /// A TCP read did not parse as a frame; the connection is being dropped
    FrameRejected { peer: String, error: String },
    /// A TCP read loop exited
    Disconnected { peer: String },
    /// Serial port opened and being read
    PortOpened { device: String },
    /// Serial read failed (end-of-stream included); the port loop has stopped
    PortFailed { device: String, error: String },
}

impl TransportEvent {
    /// Address or device the event concerns
    pub fn source(&self) -> &str {
        match self {
            TransportEvent::Listening { address } | TransportEvent::BindFailed { address, .. } => {
                address
            },
            TransportEvent::Accepted { peer }
            | TransportEvent::FrameRejected { peer, .. }
            | TransportEvent::Disconnected { peer } => peer,
            TransportEvent::AcceptFailed { .. } => UNKNOWN_PEER,
            TransportEvent::PortOpened { device } | TransportEvent::PortFailed { device, .. } => {
                device
            },
        }
    }

    /// Error text, if the event reports one
    pub fn error(&self) -> Option<&str> {
        match self {
            TransportEvent::BindFailed { error, .. }
            | TransportEvent::AcceptFailed { error }
            | TransportEvent::FrameRejected { error, .. }
            | TransportEvent::PortFailed { error, .. } => Some(error),
            TransportEvent::Disconnected { .. } => Some("connection close"),
            _ => None,
        }
    }
}

impl fmt::Display for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error() {
            Some(error) => write!(f, "{}: {}", self.source(), error),
            None => write!(f, "{}", self.source()),
        }
    }
}

/// Callback invoked for every transport event
pub type Observer = Arc<dyn Fn(&TransportEvent) + Send + Sync>;

/// Forward an event to the observer, if one is installed
pub(crate) fn notify(observer: Option<&Observer>, event: TransportEvent) {
    if let Some(observer) = observer {
        observer(&event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_event_source_and_error() {
        let event = TransportEvent::AcceptFailed {
            error: "too many open files".to_string(),
        };
        assert_eq!(event.source(), UNKNOWN_PEER);
        assert_eq!(event.to_string(), "0.0.0.0:0: too many open files");

        let event = TransportEvent::Disconnected {
            peer: "127.0.0.1:5020".to_string(),
        };
        assert_eq!(event.error(), Some("connection close"));

        let event = TransportEvent::Accepted {
            peer: "127.0.0.1:5020".to_string(),
        };
        assert_eq!(event.error(), None);
    }

    #[test]
    fn test_notify_without_observer_is_noop() {
        notify(
            None,
            TransportEvent::PortOpened {
                device: "/dev/ttyUSB0".to_string(),
            },
        );
    }

    #[test]
    fn test_notify_calls_observer() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer: Observer = Arc::new(move |e: &TransportEvent| {
            sink.lock().unwrap().push(e.clone());
        });

        notify(
            Some(&observer),
            TransportEvent::PortOpened {
                device: "/dev/ttyUSB1".to_string(),
            },
        );

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].source(), "/dev/ttyUSB1");
    }
}
