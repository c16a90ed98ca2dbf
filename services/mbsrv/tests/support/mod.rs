//! Shared helpers for the ingestion integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mbsrv::frame::crc16;
use mbsrv::observer::{Observer, TransportEvent};
use mbsrv::request::Request;
use mbsrv::RequestReceiver;
use tokio::sync::mpsc;

/// How long a test waits for something that should happen promptly
pub const WAIT: Duration = Duration::from_secs(2);

/// Append the Modbus CRC to an RTU body
pub fn rtu(body: &[u8]) -> Vec<u8> {
    let mut frame = body.to_vec();
    frame.extend_from_slice(&crc16(body).to_le_bytes());
    frame
}

/// MBAP frame with a correct length field
pub fn mbap(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&[0x00, 0x00]);
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

/// Observer that forwards every event to a channel
pub fn event_channel() -> (Observer, mpsc::UnboundedReceiver<TransportEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let observer: Observer = Arc::new(move |event: &TransportEvent| {
        let _ = tx.send(event.clone());
    });
    (observer, rx)
}

/// Wait for the next event matching `pred`, skipping the others
pub async fn wait_for_event<F>(
    events: &mut mpsc::UnboundedReceiver<TransportEvent>,
    pred: F,
) -> TransportEvent
where
    F: Fn(&TransportEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("observer channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for transport event")
}

pub async fn next_request(requests: &mut RequestReceiver) -> Request {
    tokio::time::timeout(WAIT, requests.recv())
        .await
        .expect("timed out waiting for request")
        .expect("dispatch queue closed")
}

/// Assert nothing reaches the queue within a short grace period
pub async fn assert_no_request(requests: &mut RequestReceiver) {
    let waited = tokio::time::timeout(Duration::from_millis(100), requests.recv()).await;
    assert!(waited.is_err(), "unexpected request in dispatch queue");
}
