//! Message-passing transport.
//!
//! Fallback for hosts without shared memory. Each side owns one end of an ordered
//! bidirectional link; payloads are moved through it, never shared. Incoming
//! messages are pumped into a local inbox on demand, which gives the same
//! observable semantics as the shared segment:
//!
//! - instruction batches concatenate until drained
//! - input and timing are last-write-wins slots
//! - repeated turn signals collapse into one pending token
//! - frame completions are counted until taken

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::channel::{self, Receiver, Select, Sender, TryRecvError};
use parking_lot::Mutex;

use super::{FrameChannel, TransportKind, TurnGuard};
use crate::error::ChannelError;
use crate::types::{DrawInstruction, InputSnapshot, Role, TimingSnapshot};

/// Wire message on the link.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkMessage {
    Instructions(Vec<DrawInstruction>),
    Input(InputSnapshot),
    Timing(TimingSnapshot),
    FrameComplete,
    Turn,
    Closed,
}

/// One end of a bidirectional link. Transferable to another thread.
#[derive(Debug)]
pub struct LinkEndpoint {
    tx: Sender<LinkMessage>,
    rx: Receiver<LinkMessage>,
}

impl LinkEndpoint {
    /// Create both ends of a fresh link.
    pub fn pair() -> (LinkEndpoint, LinkEndpoint) {
        let (a_tx, b_rx) = channel::unbounded();
        let (b_tx, a_rx) = channel::unbounded();
        (
            LinkEndpoint { tx: a_tx, rx: a_rx },
            LinkEndpoint { tx: b_tx, rx: b_rx },
        )
    }

    pub fn bind(self, role: Role) -> MessageChannel {
        MessageChannel::new(self, role)
    }
}

#[derive(Debug, Default)]
struct Inbox {
    instructions: Vec<DrawInstruction>,
    input: InputSnapshot,
    timing: TimingSnapshot,
    frames_completed: u64,
    turn_pending: bool,
    peer_closed: bool,
}

/// One half of a message-passing channel pair.
pub struct MessageChannel {
    role: Role,
    tx: Mutex<Option<Sender<LinkMessage>>>,
    rx: Receiver<LinkMessage>,
    interrupt_tx: Sender<()>,
    interrupt_rx: Receiver<()>,
    inbox: Mutex<Inbox>,
    turn_guard: TurnGuard,
    disposed: AtomicBool,
}

impl MessageChannel {
    pub fn new(endpoint: LinkEndpoint, role: Role) -> Self {
        let (interrupt_tx, interrupt_rx) = channel::bounded(1);
        Self {
            role,
            tx: Mutex::new(Some(endpoint.tx)),
            rx: endpoint.rx,
            interrupt_tx,
            interrupt_rx,
            inbox: Mutex::new(Inbox::default()),
            turn_guard: TurnGuard::default(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Move everything that has arrived into the inbox.
    fn pump(&self, inbox: &mut Inbox) {
        loop {
            match self.rx.try_recv() {
                Ok(LinkMessage::Instructions(batch)) => inbox.instructions.extend(batch),
                Ok(LinkMessage::Input(snapshot)) => inbox.input = snapshot,
                Ok(LinkMessage::Timing(snapshot)) => inbox.timing = snapshot,
                Ok(LinkMessage::FrameComplete) => inbox.frames_completed += 1,
                Ok(LinkMessage::Turn) => {
                    inbox.turn_pending = true;
                    // A waiter may be parked in select while another thread pumped.
                    let _ = self.interrupt_tx.try_send(());
                }
                Ok(LinkMessage::Closed) | Err(TryRecvError::Disconnected) => {
                    if !inbox.peer_closed {
                        tracing::debug!(role = %self.role, "message link closed by peer");
                    }
                    inbox.peer_closed = true;
                    let _ = self.interrupt_tx.try_send(());
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
    }

    fn send(&self, message: LinkMessage) -> Result<(), ChannelError> {
        if self.is_disposed() {
            return Err(ChannelError::Disposed);
        }
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx.send(message).map_err(|_| ChannelError::Disposed),
            None => Err(ChannelError::Disposed),
        }
    }

    /// Block until the link or the interrupt has something for us.
    fn wait_for_traffic(&self) {
        let mut select = Select::new();
        select.recv(&self.rx);
        select.recv(&self.interrupt_rx);
        select.ready();
        let _ = self.interrupt_rx.try_recv();
    }
}

impl FrameChannel for MessageChannel {
    fn role(&self) -> Role {
        self.role
    }

    fn kind(&self) -> TransportKind {
        TransportKind::MessagePassing
    }

    fn publish_instructions(&self, batch: Vec<DrawInstruction>) -> Result<(), ChannelError> {
        if batch.is_empty() {
            return if self.is_disposed() {
                Err(ChannelError::Disposed)
            } else {
                Ok(())
            };
        }
        self.send(LinkMessage::Instructions(batch))
    }

    fn drain_instructions(&self) -> Result<Vec<DrawInstruction>, ChannelError> {
        if self.disposed.load(Ordering::Acquire) {
            return Ok(Vec::new());
        }
        let mut inbox = self.inbox.lock();
        self.pump(&mut inbox);
        if inbox.peer_closed {
            inbox.instructions.clear();
            return Ok(Vec::new());
        }
        Ok(std::mem::take(&mut inbox.instructions))
    }

    fn complete_frame(&self) -> Result<(), ChannelError> {
        self.send(LinkMessage::FrameComplete)
    }

    fn take_completed_frames(&self) -> u64 {
        if self.disposed.load(Ordering::Acquire) {
            return 0;
        }
        let mut inbox = self.inbox.lock();
        self.pump(&mut inbox);
        std::mem::take(&mut inbox.frames_completed)
    }

    fn publish_input(&self, snapshot: &InputSnapshot) -> Result<(), ChannelError> {
        self.send(LinkMessage::Input(*snapshot))
    }

    fn read_input(&self) -> InputSnapshot {
        let mut inbox = self.inbox.lock();
        self.pump(&mut inbox);
        inbox.input
    }

    fn publish_timing(&self, snapshot: &TimingSnapshot) -> Result<(), ChannelError> {
        self.send(LinkMessage::Timing(*snapshot))
    }

    fn read_timing(&self) -> TimingSnapshot {
        let mut inbox = self.inbox.lock();
        self.pump(&mut inbox);
        inbox.timing
    }

    fn await_turn(&self) -> Result<(), ChannelError> {
        let _waiter = self.turn_guard.enter()?;
        loop {
            if self.disposed.load(Ordering::Acquire) {
                return Err(ChannelError::Disposed);
            }
            {
                let mut inbox = self.inbox.lock();
                self.pump(&mut inbox);
                if inbox.peer_closed {
                    return Err(ChannelError::Disposed);
                }
                if inbox.turn_pending {
                    inbox.turn_pending = false;
                    return Ok(());
                }
            }
            self.wait_for_traffic();
        }
    }

    fn signal_turn(&self) {
        let _ = self.send(LinkMessage::Turn);
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(tx) = self.tx.lock().take() {
            let _ = tx.send(LinkMessage::Closed);
        }
        let _ = self.interrupt_tx.try_send(());
        tracing::debug!(role = %self.role, "message channel disposed");
    }

    fn is_disposed(&self) -> bool {
        if self.disposed.load(Ordering::Acquire) {
            return true;
        }
        let mut inbox = self.inbox.lock();
        self.pump(&mut inbox);
        inbox.peer_closed
    }
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("role", &self.role)
            .field("queued", &self.rx.len())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::types::Key;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn pair() -> (MessageChannel, MessageChannel) {
        let (a, b) = LinkEndpoint::pair();
        (a.bind(Role::Host), b.bind(Role::Isolated))
    }

    fn circle(r: f32) -> DrawInstruction {
        DrawInstruction::FillCircle { x: 0.0, y: 0.0, radius: r }
    }

    #[test]
    fn test_batches_concatenate_until_drained() {
        let (host, isolated) = pair();
        isolated.publish_instructions(vec![circle(1.0)]).unwrap();
        isolated.publish_instructions(Vec::new()).unwrap();
        isolated.publish_instructions(vec![circle(2.0), circle(3.0)]).unwrap();

        assert_eq!(host.drain_instructions().unwrap(), vec![circle(1.0), circle(2.0), circle(3.0)]);
        assert!(host.drain_instructions().unwrap().is_empty());
    }

    #[test]
    fn test_completed_frames_follow_their_instructions() {
        let (host, isolated) = pair();
        isolated.publish_instructions(vec![circle(1.0)]).unwrap();
        isolated.complete_frame().unwrap();
        isolated.complete_frame().unwrap();

        assert_eq!(host.take_completed_frames(), 2);
        assert_eq!(host.drain_instructions().unwrap(), vec![circle(1.0)]);
        assert_eq!(host.take_completed_frames(), 0);

        isolated.dispose();
        assert_eq!(isolated.complete_frame(), Err(ChannelError::Disposed));
    }

    #[test]
    fn test_slots_are_last_write_wins() {
        let (host, isolated) = pair();
        assert_eq!(isolated.read_timing(), TimingSnapshot::default());

        let mut input = InputSnapshot::default();
        input.keys_down.insert(Key::SPACE);
        host.publish_input(&InputSnapshot::default()).unwrap();
        host.publish_input(&input).unwrap();
        host.publish_timing(&TimingSnapshot { delta: 0.5, elapsed: 0.5, frame: 1 }).unwrap();
        host.publish_timing(&TimingSnapshot { delta: 0.25, elapsed: 0.75, frame: 2 }).unwrap();

        assert_eq!(isolated.read_input(), input);
        assert_eq!(isolated.read_timing().frame, 2);
        assert_eq!(isolated.read_timing().elapsed, 0.75);
    }

    #[test]
    fn test_signals_collapse() {
        let (host, isolated) = pair();
        host.signal_turn();
        host.signal_turn();
        host.signal_turn();
        isolated.await_turn().unwrap();

        let isolated = Arc::new(isolated);
        let waiter = {
            let isolated = isolated.clone();
            thread::spawn(move || isolated.await_turn())
        };
        thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        host.signal_turn();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_second_waiter_rejected() {
        let (host, isolated) = pair();
        let isolated = Arc::new(isolated);
        let waiter = {
            let isolated = isolated.clone();
            thread::spawn(move || isolated.await_turn())
        };
        thread::sleep(Duration::from_millis(20));
        assert_eq!(
            isolated.await_turn(),
            Err(ChannelError::Protocol(ProtocolError::TurnAlreadyAwaited))
        );
        host.signal_turn();
        assert_eq!(waiter.join().unwrap(), Ok(()));
    }

    #[test]
    fn test_dispose_aborts_wait_from_either_side() {
        let (host, isolated) = pair();
        let isolated = Arc::new(isolated);

        let waiter = {
            let isolated = isolated.clone();
            thread::spawn(move || isolated.await_turn())
        };
        thread::sleep(Duration::from_millis(20));
        host.dispose();
        assert_eq!(waiter.join().unwrap(), Err(ChannelError::Disposed));
        assert!(isolated.is_disposed());
        assert_eq!(isolated.publish_instructions(vec![circle(1.0)]), Err(ChannelError::Disposed));

        let (host, isolated) = pair();
        let isolated = Arc::new(isolated);
        let waiter = {
            let isolated = isolated.clone();
            thread::spawn(move || isolated.await_turn())
        };
        thread::sleep(Duration::from_millis(20));
        isolated.dispose();
        isolated.dispose();
        assert_eq!(waiter.join().unwrap(), Err(ChannelError::Disposed));
        assert!(host.is_disposed());
        host.signal_turn();
        assert!(host.drain_instructions().unwrap().is_empty());
    }
}
