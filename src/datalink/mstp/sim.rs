//! In-memory multi-drop bus for the simulated-bus tests.
//!
//! Every write is delivered to every other attached port, the way octets on
//! a half-duplex RS-485 segment reach every listener but the transmitter.
//! The bus also keeps a wire log of whole frames for assertions.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};

use super::frame::Frame;
use super::port::OctetStream;

#[derive(Default)]
struct BusInner {
    inboxes: Vec<VecDeque<u8>>,
    /// One entry per transmitted frame, in wire order.
    wire: Vec<Vec<u8>>,
}

#[derive(Clone, Default)]
pub(crate) struct SimBus {
    inner: Arc<Mutex<BusInner>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new station to the bus.
    pub fn attach(&self) -> SimPort {
        let mut inner = self.inner.lock().unwrap();
        inner.inboxes.push(VecDeque::new());
        SimPort {
            bus: Arc::clone(&self.inner),
            index: inner.inboxes.len() - 1,
        }
    }

    /// Deliver a frame as if transmitted by a station that is not attached.
    pub fn inject(&self, frame: &Frame) {
        let octets = frame.encode();
        let mut inner = self.inner.lock().unwrap();
        inner.wire.push(octets.clone());
        for inbox in inner.inboxes.iter_mut() {
            inbox.extend(octets.iter().copied());
        }
    }

    /// Decoded log of every frame put on the wire, in order.
    pub fn frames(&self) -> Vec<Frame> {
        self.inner
            .lock()
            .unwrap()
            .wire
            .iter()
            .map(|octets| Frame::decode(octets).expect("undecodable frame on the wire"))
            .collect()
    }
}

pub(crate) struct SimPort {
    bus: Arc<Mutex<BusInner>>,
    index: usize,
}

impl OctetStream for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.bus.lock().unwrap();
        let inbox = &mut inner.inboxes[self.index];
        let n = buf.len().min(inbox.len());
        for slot in buf.iter_mut().take(n) {
            *slot = inbox.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write_all(&mut self, octets: &[u8]) -> io::Result<()> {
        let mut inner = self.bus.lock().unwrap();
        inner.wire.push(octets.to_vec());
        let index = self.index;
        for (i, inbox) in inner.inboxes.iter_mut().enumerate() {
            if i != index {
                inbox.extend(octets.iter().copied());
            }
        }
        Ok(())
    }
}
