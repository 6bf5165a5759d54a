use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::select;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use super::{
    codec::AshCodec,
    constants::{
        ACK_TIMEOUTS, ASH_VERSION_2, RESET_SOFTWARE, RESET_TIMEOUT, T_REMOTE_NOTRDY,
        T_RX_ACK_INIT, T_RX_ACK_MAX, T_RX_ACK_MIN, TX_K,
    },
    error::{Error, Result},
    frame::Frame,
    types::FrameNumber,
};

/// Events delivered from the transport to the layer above it.
#[derive(Debug)]
pub enum TransportEvent {
    /// An in-sequence DATA payload, already unmasked.
    Payload(Bytes),
    /// An RSTACK frame was observed; carries the NCP reset code.
    Reset(u8),
    /// The link entered the failed state; all pending sends were cancelled
    /// with this error.
    Failed(Error),
}

enum Command {
    SendData {
        payload: Bytes,
        permit: OwnedSemaphorePermit,
        done: oneshot::Sender<Result<()>>,
    },
    Reset {
        done: oneshot::Sender<Result<u8>>,
    },
}

/// Cloneable handle used to submit DATA payloads and reset requests to the
/// transport task.
#[derive(Clone)]
pub struct AshHandle {
    commands: mpsc::Sender<Command>,
    window: Arc<Semaphore>,
}

impl AshHandle {
    /// Send one DATA payload and wait until the NCP acknowledges it.
    ///
    /// Blocks while the transmit window is full. Dropping the returned future
    /// abandons the wait; the frame itself remains in flight and is still
    /// acknowledged (or retired) by the transport.
    pub async fn send_data(&self, payload: Bytes) -> Result<()> {
        let permit = self
            .window
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::TransportFailed("transport task stopped"))?;
        let (done, ret) = oneshot::channel();
        self.commands
            .send(Command::SendData {
                payload,
                permit,
                done,
            })
            .await
            .map_err(|_| Error::TransportFailed("transport task stopped"))?;
        ret.await
            .map_err(|_| Error::TransportFailed("transport task stopped"))?
    }

    /// Perform the RST -> RSTACK handshake, returning the NCP reset code.
    pub async fn reset(&self) -> Result<u8> {
        let (done, ret) = oneshot::channel();
        self.commands
            .send(Command::Reset { done })
            .await
            .map_err(|_| Error::TransportFailed("transport task stopped"))?;
        ret.await
            .map_err(|_| Error::TransportFailed("transport task stopped"))?
    }
}

struct SendSlot {
    payload: Bytes,
    done: oneshot::Sender<Result<()>>,
    _permit: OwnedSemaphorePermit,
    /// Transmissions performed so far, including the first.
    attempts: u8,
    send_time: Instant,
    deadline: Instant,
}

enum LinkState {
    Connected,
    Failed(&'static str),
}

/// The ASH sliding-window engine. Owns all link state; everything else talks
/// to it through the [`AshHandle`] mailbox and the event channel.
pub struct AshTransport {
    commands: mpsc::Receiver<Command>,
    bytes_in: mpsc::Receiver<std::io::Result<BytesMut>>,
    wire_out: mpsc::Sender<Bytes>,
    events: mpsc::Sender<TransportEvent>,
    codec: AshCodec,
    rx_buffer: BytesMut,
    state: LinkState,
    /// frm_num of the next outbound DATA frame.
    tx_seq: FrameNumber,
    /// frm_num of the next inbound DATA frame we expect.
    rx_seq: FrameNumber,
    pending: [Option<SendSlot>; 8],
    /// DATA submissions held back while the NCP reports not-ready.
    deferred: Vec<Command>,
    t_rx_ack: Duration,
    reset_waiter: Option<(oneshot::Sender<Result<u8>>, Instant)>,
    not_ready_until: Option<Instant>,
    ingress_open: bool,
}

pub fn create_ash_transport(
    bytes_in: mpsc::Receiver<std::io::Result<BytesMut>>,
    wire_out: mpsc::Sender<Bytes>,
    events: mpsc::Sender<TransportEvent>,
) -> (AshTransport, AshHandle) {
    let (commands, mailbox) = mpsc::channel(1);
    let window = Arc::new(Semaphore::new(TX_K));
    let transport = AshTransport {
        commands: mailbox,
        bytes_in,
        wire_out,
        events,
        codec: AshCodec::default(),
        rx_buffer: BytesMut::with_capacity(1024),
        state: LinkState::Connected,
        tx_seq: FrameNumber::zero(),
        rx_seq: FrameNumber::zero(),
        pending: Default::default(),
        deferred: Vec::new(),
        t_rx_ack: T_RX_ACK_INIT,
        reset_waiter: None,
        not_ready_until: None,
        ingress_open: true,
    };
    let handle = AshHandle { commands, window };
    (transport, handle)
}

impl AshTransport {
    pub async fn run(mut self) {
        loop {
            let wake = self.next_wake();
            select! {
                biased;
                chunk = self.bytes_in.recv(), if self.ingress_open => match chunk {
                    Some(Ok(bytes)) => self.ingest(bytes).await,
                    Some(Err(e)) => {
                        warn!(error = %e, "Serial endpoint reported an error");
                        self.ingress_open = false;
                        self.fail_link(Error::ConnectionLost).await;
                    }
                    None => {
                        self.ingress_open = false;
                        self.fail_link(Error::ConnectionLost).await;
                    }
                },
                maybe_cmd = self.commands.recv() => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                _ = sleep_until(wake.unwrap_or_else(far_future)), if wake.is_some() => {
                    self.handle_timers().await;
                }
            }
        }
    }

    /// New DATA frames are held back while the NCP reports not-ready.
    fn holding_new_data(&self) -> bool {
        matches!(self.state, LinkState::Connected) && self.not_ready_until.is_some()
    }

    fn next_wake(&self) -> Option<Instant> {
        let slots = self
            .pending
            .iter()
            .flatten()
            .map(|slot| slot.deadline);
        let reset = self.reset_waiter.as_ref().map(|(_, deadline)| *deadline);
        let not_ready = self.not_ready_until;
        slots.chain(reset).chain(not_ready).min()
    }

    async fn ingest(&mut self, bytes: BytesMut) {
        self.rx_buffer.extend_from_slice(&bytes);
        loop {
            match self.codec.decode(&mut self.rx_buffer) {
                Ok(Some(Ok(frame))) => self.handle_frame(frame).await,
                // Already logged by the codec; the protocol recovers on its own.
                Ok(Some(Err(_))) => continue,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Frame decoding failed");
                    break;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            // Only new DATA is held while the NCP is not ready; resets go out
            // right away.
            Command::SendData { .. } if self.holding_new_data() => {
                trace!("NCP is not ready, deferring DATA frame");
                self.deferred.push(cmd);
            }
            Command::SendData {
                payload,
                permit,
                done,
            } => {
                if let LinkState::Failed(reason) = self.state {
                    let _ = done.send(Err(Error::TransportFailed(reason)));
                    return;
                }
                let frm_num = self.tx_seq;
                self.tx_seq += 1;
                let now = Instant::now();
                let frame = Frame::data(frm_num, false, self.rx_seq, payload.clone());
                debug!(frm_num = %frm_num, len = payload.len(), "Transmitting DATA frame");
                self.transmit(frame).await;
                self.pending[*frm_num as usize] = Some(SendSlot {
                    payload,
                    done,
                    _permit: permit,
                    attempts: 1,
                    send_time: now,
                    deadline: now + self.t_rx_ack,
                });
            }
            Command::Reset { done } => {
                debug!("Initiating ASH reset handshake");
                self.transmit(Frame::Rst).await;
                if let Some((stale, _)) = self
                    .reset_waiter
                    .replace((done, Instant::now() + RESET_TIMEOUT))
                {
                    let _ = stale.send(Err(Error::ResetTimeout));
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) {
        trace!(?frame, "Received frame");
        match frame {
            Frame::Data {
                frm_num,
                re_tx,
                ack_num,
                body,
            } => {
                self.not_ready_until = None;
                if frm_num == self.rx_seq {
                    self.rx_seq += 1;
                    self.transmit(Frame::ack(false, self.rx_seq)).await;
                    self.process_ack(ack_num).await;
                    if self.events.send(TransportEvent::Payload(body)).await.is_err() {
                        debug!("Event receiver dropped, discarding payload");
                    }
                } else if re_tx && frm_num == self.rx_seq - 1 {
                    // A replay of the frame we already accepted; re-ack it
                    // without advancing.
                    debug!(frm_num = %frm_num, "Re-acknowledging retransmitted frame");
                    self.transmit(Frame::ack(false, self.rx_seq)).await;
                    self.process_ack(ack_num).await;
                } else {
                    warn!(
                        frm_num = %frm_num,
                        expected = %self.rx_seq,
                        "Rejecting out-of-sequence DATA frame"
                    );
                    // The piggy-backed ack is still valid even though the
                    // payload is not.
                    self.process_ack(ack_num).await;
                    self.transmit(Frame::nak(false, self.rx_seq)).await;
                }
            }
            Frame::Ack { n_rdy, ack_num } => {
                self.update_not_ready(n_rdy);
                self.process_ack(ack_num).await;
            }
            Frame::Nak { n_rdy, ack_num } => {
                self.update_not_ready(n_rdy);
                if let Some(slot) = self.pending[*ack_num as usize].take() {
                    warn!(frm_num = %ack_num, "NCP rejected DATA frame");
                    let _ = slot.done.send(Err(Error::NotAcked));
                } else {
                    debug!(ack_num = %ack_num, "NAK for a frame that is not in flight");
                }
            }
            Frame::Rst => {
                // Only the host sends RST; seeing one means somebody else is
                // driving the link.
                warn!("Ignoring unexpected RST frame from the NCP");
            }
            Frame::RstAck { version, code } => self.handle_rstack(version, code).await,
            Frame::Error { code, .. } => {
                warn!(code, "NCP signalled an unrecoverable error");
                self.state = LinkState::Failed("NCP sent an ERROR frame");
                self.fail_link(Error::TransportFailed("NCP sent an ERROR frame"))
                    .await;
            }
        }
        self.release_held_data().await;
    }

    /// Flush DATA submissions that were held back once the not-ready hold is
    /// gone. No-op while the hold (or a failed link) persists.
    async fn release_held_data(&mut self) {
        if self.holding_new_data() || self.deferred.is_empty() {
            return;
        }
        for cmd in std::mem::take(&mut self.deferred) {
            self.handle_command(cmd).await;
        }
    }

    fn update_not_ready(&mut self, n_rdy: bool) {
        if n_rdy {
            debug!("NCP is not ready, pausing DATA transmission");
            self.not_ready_until = Some(Instant::now() + T_REMOTE_NOTRDY);
        } else {
            self.not_ready_until = None;
        }
    }

    /// Resolve the outstanding DATA frame named by a cumulative `ack_num`
    /// (which points at the *next* frame the NCP expects).
    async fn process_ack(&mut self, ack_num: FrameNumber) {
        let acked = ack_num - 1;
        match self.pending[*acked as usize].take() {
            Some(slot) => {
                let elapsed = slot.send_time.elapsed();
                self.adapt_ack_timeout(elapsed);
                trace!(frm_num = %acked, ?elapsed, "DATA frame acknowledged");
                let _ = slot.done.send(Ok(()));
            }
            None => {
                trace!(ack_num = %ack_num, "Acknowledgement for a frame that is not in flight");
            }
        }
    }

    /// Exponentially-weighted update of the acknowledgement timeout:
    /// 7/8 of the old value plus half the measured round trip, clamped.
    fn adapt_ack_timeout(&mut self, round_trip: Duration) {
        let next = self.t_rx_ack.mul_f64(7.0 / 8.0) + round_trip / 2;
        self.t_rx_ack = next.clamp(T_RX_ACK_MIN, T_RX_ACK_MAX);
    }

    async fn handle_rstack(&mut self, version: u8, code: u8) {
        if version != ASH_VERSION_2 {
            warn!(version, "Ignoring RSTACK with unsupported ASH version");
            return;
        }
        debug!(code, "RSTACK received, link re-synchronized");
        let solicited = self.reset_waiter.is_some();
        self.tx_seq = FrameNumber::zero();
        self.rx_seq = FrameNumber::zero();
        self.t_rx_ack = T_RX_ACK_INIT;
        self.not_ready_until = None;
        self.codec.reset();
        for slot in self.pending.iter_mut() {
            if let Some(slot) = slot.take() {
                let _ = slot.done.send(Err(Error::TransportFailed("link was reset")));
            }
        }
        for cmd in std::mem::take(&mut self.deferred) {
            if let Command::SendData { done, .. } = cmd {
                let _ = done.send(Err(Error::TransportFailed("link was reset")));
            }
        }
        self.state = LinkState::Connected;
        if let Some((done, _)) = self.reset_waiter.take() {
            let _ = done.send(Ok(code));
        }
        if solicited || code == RESET_SOFTWARE {
            let _ = self.events.send(TransportEvent::Reset(code)).await;
        } else {
            // The host did not ask for this reset; the NCP rebooted on its
            // own (watchdog, brown-out, ...).
            warn!(code, "NCP reset unexpectedly");
            let _ = self
                .events
                .send(TransportEvent::Failed(Error::UnexpectedReset(code)))
                .await;
        }
    }

    async fn handle_timers(&mut self) {
        let now = Instant::now();

        if let Some((_, deadline)) = &self.reset_waiter {
            if *deadline <= now {
                let (done, _) = self.reset_waiter.take().unwrap();
                warn!("Reset handshake timed out");
                let _ = done.send(Err(Error::ResetTimeout));
            }
        }

        if let Some(until) = self.not_ready_until {
            if until <= now {
                debug!("Not-ready hold-off expired, resuming DATA transmission");
                self.not_ready_until = None;
                self.release_held_data().await;
            }
        }

        for idx in 0..self.pending.len() {
            let expired = matches!(&self.pending[idx], Some(slot) if slot.deadline <= now);
            if expired {
                self.handle_ack_timeout(idx, now).await;
            }
        }
    }

    async fn handle_ack_timeout(&mut self, idx: usize, now: Instant) {
        let slot = self.pending[idx].as_mut().unwrap();

        if slot.done.is_closed() {
            // The sender gave up; stop retrying on its behalf.
            debug!(frm_num = idx, "Abandoning retransmission of a cancelled send");
            self.pending[idx] = None;
            return;
        }

        // Binary exponential back-off, clamped to the ceiling.
        self.t_rx_ack = (self.t_rx_ack * 2).min(T_RX_ACK_MAX);

        if slot.attempts >= ACK_TIMEOUTS {
            warn!(
                frm_num = idx,
                attempts = slot.attempts,
                "Retransmission budget exhausted"
            );
            self.state = LinkState::Failed("exceeded maximum acknowledgement timeouts");
            self.fail_link(Error::AckTimeout {
                attempts: ACK_TIMEOUTS,
            })
            .await;
            return;
        }

        slot.attempts += 1;
        slot.send_time = now;
        slot.deadline = now + self.t_rx_ack;
        let frame = Frame::data(
            FrameNumber::new_truncate(idx as u8),
            true,
            self.rx_seq,
            slot.payload.clone(),
        );
        debug!(
            frm_num = idx,
            attempt = self.pending[idx].as_ref().unwrap().attempts,
            "Retransmitting DATA frame"
        );
        self.transmit(frame).await;
    }

    /// Cancel every waiter with `error` and notify the upper layer once.
    async fn fail_link(&mut self, error: Error) {
        if !matches!(self.state, LinkState::Failed(_)) {
            self.state = LinkState::Failed("ASH transport has failed");
        }
        for slot in self.pending.iter_mut() {
            if let Some(slot) = slot.take() {
                let _ = slot.done.send(Err(error.clone()));
            }
        }
        for cmd in std::mem::take(&mut self.deferred) {
            if let Command::SendData { done, .. } = cmd {
                let _ = done.send(Err(error.clone()));
            }
        }
        if let Some((done, _)) = self.reset_waiter.take() {
            let _ = done.send(Err(error.clone()));
        }
        let _ = self.events.send(TransportEvent::Failed(error)).await;
    }

    async fn transmit(&mut self, frame: Frame) {
        let mut buf = BytesMut::with_capacity(frame.data_len() * 2 + 8);
        frame.serialize(&mut buf);
        if self.wire_out.send(buf.freeze()).await.is_err() {
            warn!("Serial writer is gone");
            self.ingress_open = false;
            self.fail_link_sync(Error::ConnectionLost);
        }
    }

    /// Like [`fail_link`] but without awaiting the event channel; used from
    /// paths where the write side just vanished.
    fn fail_link_sync(&mut self, error: Error) {
        self.state = LinkState::Failed("serial connection lost");
        for slot in self.pending.iter_mut() {
            if let Some(slot) = slot.take() {
                let _ = slot.done.send(Err(error.clone()));
            }
        }
        for cmd in std::mem::take(&mut self.deferred) {
            if let Command::SendData { done, .. } = cmd {
                let _ = done.send(Err(error.clone()));
            }
        }
        if let Some((done, _)) = self.reset_waiter.take() {
            let _ = done.send(Err(error.clone()));
        }
        let _ = self.events.try_send(TransportEvent::Failed(error));
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ash::constants::{RESET_SOFTWARE, RESET_WATCHDOG};
    use tokio::time::timeout;

    struct Harness {
        bytes: mpsc::Sender<std::io::Result<BytesMut>>,
        wire: mpsc::Receiver<Bytes>,
        events: mpsc::Receiver<TransportEvent>,
        handle: AshHandle,
    }

    fn spawn_transport() -> Harness {
        let (bytes, bytes_in) = mpsc::channel(16);
        let (wire_out, wire) = mpsc::channel(16);
        let (events_out, events) = mpsc::channel(16);
        let (transport, handle) = create_ash_transport(bytes_in, wire_out, events_out);
        tokio::spawn(transport.run());
        Harness {
            bytes,
            wire,
            events,
            handle,
        }
    }

    async fn feed(harness: &Harness, frame: Frame) {
        let mut buf = BytesMut::new();
        frame.serialize(&mut buf);
        harness.bytes.send(Ok(buf)).await.unwrap();
    }

    async fn next_frame(harness: &mut Harness) -> Frame {
        let raw = timeout(Duration::from_secs(10), harness.wire.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("wire channel closed");
        let mut codec = AshCodec::default();
        let mut buf = BytesMut::from(raw.as_ref());
        codec.decode(&mut buf).unwrap().unwrap().unwrap()
    }

    #[tokio::test]
    async fn it_sends_a_data_frame_and_resolves_on_ack() {
        let mut harness = spawn_transport();
        let handle = harness.handle.clone();

        let send = tokio::spawn(async move {
            handle.send_data(Bytes::from_static(&[0x00, 0x00, 0x00, 0x02])).await
        });

        let frame = next_frame(&mut harness).await;
        assert!(matches!(
            frame,
            Frame::Data { frm_num, re_tx, ack_num, .. }
                if *frm_num == 0 && !re_tx && *ack_num == 0
        ));

        feed(&harness, Frame::ack(false, FrameNumber::new_truncate(1))).await;
        send.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn it_acknowledges_and_delivers_an_in_sequence_data_frame() {
        let mut harness = spawn_transport();

        let body = Bytes::from_static(&[0x00, 0x80, 0x00, 0x08, 0x02, 0x80, 0x67]);
        feed(
            &harness,
            Frame::data(FrameNumber::zero(), false, FrameNumber::zero(), body.clone()),
        )
        .await;

        let frame = next_frame(&mut harness).await;
        assert!(matches!(frame, Frame::Ack { n_rdy, ack_num } if !n_rdy && *ack_num == 1));

        let event = harness.events.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Payload(p) if p == body));
    }

    #[tokio::test]
    async fn it_naks_an_out_of_sequence_data_frame() {
        let mut harness = spawn_transport();

        feed(
            &harness,
            Frame::data(
                FrameNumber::new_truncate(2),
                false,
                FrameNumber::zero(),
                Bytes::from_static(&[0x01, 0x02, 0x03]),
            ),
        )
        .await;

        let frame = next_frame(&mut harness).await;
        assert!(matches!(frame, Frame::Nak { ack_num, .. } if *ack_num == 0));

        // Nothing must be delivered upward.
        assert!(harness.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn it_processes_the_ack_piggybacked_on_a_rejected_frame() {
        let mut harness = spawn_transport();
        let handle = harness.handle.clone();

        let send = tokio::spawn(async move {
            handle.send_data(Bytes::from_static(&[0x0A, 0x0B, 0x0C])).await
        });
        let _ = next_frame(&mut harness).await;

        // Out of sequence, but its ack_num covers our DATA frame.
        feed(
            &harness,
            Frame::data(
                FrameNumber::new_truncate(2),
                false,
                FrameNumber::new_truncate(1),
                Bytes::from_static(&[0x01, 0x02, 0x03]),
            ),
        )
        .await;

        let frame = next_frame(&mut harness).await;
        assert!(matches!(frame, Frame::Nak { ack_num, .. } if *ack_num == 0));
        send.await.unwrap().unwrap();

        // The rejected payload itself is not delivered.
        assert!(harness.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn it_reacks_a_retransmitted_frame_without_advancing() {
        let mut harness = spawn_transport();
        let body = Bytes::from_static(&[0x01, 0x02, 0x03]);

        feed(
            &harness,
            Frame::data(FrameNumber::zero(), false, FrameNumber::zero(), body.clone()),
        )
        .await;
        let frame = next_frame(&mut harness).await;
        assert!(matches!(frame, Frame::Ack { ack_num, .. } if *ack_num == 1));
        let _ = harness.events.recv().await.unwrap();

        // The NCP did not see our ACK and replays the same frame.
        feed(
            &harness,
            Frame::data(FrameNumber::zero(), true, FrameNumber::zero(), body),
        )
        .await;
        let frame = next_frame(&mut harness).await;
        assert!(matches!(frame, Frame::Ack { ack_num, .. } if *ack_num == 1));

        // The payload is not delivered a second time.
        assert!(harness.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn it_retransmits_with_the_re_tx_bit_set() {
        let mut harness = spawn_transport();
        let handle = harness.handle.clone();

        let send = tokio::spawn(async move {
            handle.send_data(Bytes::from_static(&[0x0A, 0x0B, 0x0C])).await
        });

        let first = next_frame(&mut harness).await;
        assert!(matches!(first, Frame::Data { re_tx: false, .. }));

        let second = next_frame(&mut harness).await;
        assert!(matches!(
            second,
            Frame::Data { frm_num, re_tx: true, .. } if *frm_num == 0
        ));

        feed(&harness, Frame::ack(false, FrameNumber::new_truncate(1))).await;
        send.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn it_fails_the_link_after_exhausting_retransmissions() {
        let mut harness = spawn_transport();
        let handle = harness.handle.clone();

        let send = tokio::spawn(async move {
            handle.send_data(Bytes::from_static(&[0x0A, 0x0B, 0x0C])).await
        });

        // First transmission plus three retries.
        for _ in 0..4 {
            let frame = next_frame(&mut harness).await;
            assert!(matches!(frame, Frame::Data { .. }));
        }

        let err = send.await.unwrap().unwrap_err();
        assert_eq!(err, Error::AckTimeout { attempts: 4 });

        let event = timeout(Duration::from_secs(60), harness.events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, TransportEvent::Failed(Error::AckTimeout { .. })));

        // Subsequent sends fail fast without touching the wire.
        let err = harness
            .handle
            .send_data(Bytes::from_static(&[0x01]))
            .await
            .unwrap_err();
        assert_eq!(err, Error::TransportFailed(""));
        assert!(harness.wire.try_recv().is_err());
    }

    #[tokio::test]
    async fn it_limits_the_transmit_window() {
        let mut harness = spawn_transport();

        for _ in 0..TX_K {
            let handle = harness.handle.clone();
            tokio::spawn(async move { handle.send_data(Bytes::from_static(&[0x01, 0x02, 0x03])).await });
        }
        for _ in 0..TX_K {
            let frame = next_frame(&mut harness).await;
            assert!(matches!(frame, Frame::Data { .. }));
        }

        // A sixth send stays blocked on the window until an ack frees a slot.
        let handle = harness.handle.clone();
        let blocked = tokio::spawn(async move {
            handle.send_data(Bytes::from_static(&[0x04, 0x05, 0x06])).await
        });
        tokio::task::yield_now().await;
        assert!(harness.wire.try_recv().is_err());

        feed(&harness, Frame::ack(false, FrameNumber::new_truncate(1))).await;
        let frame = next_frame(&mut harness).await;
        assert!(matches!(frame, Frame::Data { frm_num, .. } if *frm_num == 5));
        drop(blocked);
    }

    #[tokio::test]
    async fn it_resolves_a_nak_with_not_acked() {
        let mut harness = spawn_transport();
        let handle = harness.handle.clone();

        let send = tokio::spawn(async move {
            handle.send_data(Bytes::from_static(&[0x01, 0x02, 0x03])).await
        });
        let _ = next_frame(&mut harness).await;

        feed(&harness, Frame::nak(false, FrameNumber::zero())).await;
        let err = send.await.unwrap().unwrap_err();
        assert_eq!(err, Error::NotAcked);
    }

    #[tokio::test]
    async fn it_performs_the_reset_handshake() {
        let mut harness = spawn_transport();
        let handle = harness.handle.clone();

        let reset = tokio::spawn(async move { handle.reset().await });

        let raw = timeout(Duration::from_secs(10), harness.wire.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw.as_ref(), [0xC0, 0x38, 0xBC, 0x7E]);

        feed(&harness, Frame::rst_ack(ASH_VERSION_2, RESET_SOFTWARE)).await;
        let code = reset.await.unwrap().unwrap();
        assert_eq!(code, RESET_SOFTWARE);

        let event = harness.events.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Reset(code) if code == RESET_SOFTWARE));
    }

    #[tokio::test]
    async fn it_surfaces_an_unsolicited_non_software_reset_as_a_failure() {
        let mut harness = spawn_transport();

        feed(&harness, Frame::rst_ack(ASH_VERSION_2, RESET_WATCHDOG)).await;
        let event = harness.events.recv().await.unwrap();
        assert!(matches!(
            event,
            TransportEvent::Failed(Error::UnexpectedReset(code)) if code == RESET_WATCHDOG
        ));
    }

    #[tokio::test]
    async fn it_reports_a_solicited_non_software_reset_to_the_waiter() {
        let mut harness = spawn_transport();
        let handle = harness.handle.clone();

        let reset = tokio::spawn(async move { handle.reset().await });
        let _ = next_frame(&mut harness).await;

        feed(&harness, Frame::rst_ack(ASH_VERSION_2, RESET_WATCHDOG)).await;
        assert_eq!(reset.await.unwrap().unwrap(), RESET_WATCHDOG);

        let event = harness.events.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Reset(code) if code == RESET_WATCHDOG));
    }

    #[tokio::test]
    async fn it_holds_new_data_but_not_resets_while_the_ncp_is_not_ready() {
        let mut harness = spawn_transport();

        // An ACK with n_rdy set starts the hold-off.
        feed(&harness, Frame::ack(true, FrameNumber::zero())).await;

        let handle = harness.handle.clone();
        let send = tokio::spawn(async move {
            handle.send_data(Bytes::from_static(&[0x01, 0x02, 0x03])).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.wire.try_recv().is_err());

        // A reset request is not subject to the hold.
        let handle = harness.handle.clone();
        let reset = tokio::spawn(async move { handle.reset().await });
        let frame = next_frame(&mut harness).await;
        assert!(matches!(frame, Frame::Rst));

        feed(&harness, Frame::rst_ack(ASH_VERSION_2, RESET_SOFTWARE)).await;
        assert_eq!(reset.await.unwrap().unwrap(), RESET_SOFTWARE);

        // The held frame is retired by the reset instead of leaking.
        assert!(send.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn it_releases_held_data_when_the_ncp_is_ready_again() {
        let mut harness = spawn_transport();

        feed(&harness, Frame::ack(true, FrameNumber::zero())).await;
        let handle = harness.handle.clone();
        let send = tokio::spawn(async move {
            handle.send_data(Bytes::from_static(&[0x01, 0x02, 0x03])).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.wire.try_recv().is_err());

        // n_rdy clear ends the hold early.
        feed(&harness, Frame::ack(false, FrameNumber::zero())).await;
        let frame = next_frame(&mut harness).await;
        assert!(matches!(frame, Frame::Data { frm_num, .. } if *frm_num == 0));

        feed(&harness, Frame::ack(false, FrameNumber::new_truncate(1))).await;
        send.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn it_times_out_a_reset_without_rstack() {
        let harness = spawn_transport();
        let err = harness.handle.reset().await.unwrap_err();
        assert_eq!(err, Error::ResetTimeout);
    }

    #[tokio::test]
    async fn it_recovers_a_failed_link_through_reset() {
        let mut harness = spawn_transport();

        // Force failure with an ERROR frame.
        feed(&harness, Frame::error(ASH_VERSION_2, 0x51)).await;
        let event = harness.events.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Failed(_)));

        let err = harness
            .handle
            .send_data(Bytes::from_static(&[0x01]))
            .await
            .unwrap_err();
        assert_eq!(err, Error::TransportFailed(""));

        let handle = harness.handle.clone();
        let reset = tokio::spawn(async move { handle.reset().await });
        let _ = next_frame(&mut harness).await;
        feed(&harness, Frame::rst_ack(ASH_VERSION_2, RESET_SOFTWARE)).await;
        reset.await.unwrap().unwrap();

        // The link accepts DATA again.
        let handle = harness.handle.clone();
        let send = tokio::spawn(async move {
            handle.send_data(Bytes::from_static(&[0x01, 0x02, 0x03])).await
        });
        let frame = next_frame(&mut harness).await;
        assert!(matches!(frame, Frame::Data { frm_num, .. } if *frm_num == 0));
        feed(&harness, Frame::ack(false, FrameNumber::new_truncate(1))).await;
        send.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn it_fails_pending_sends_when_the_connection_drops() {
        let mut harness = spawn_transport();
        let handle = harness.handle.clone();

        let send = tokio::spawn(async move {
            handle.send_data(Bytes::from_static(&[0x01, 0x02, 0x03])).await
        });
        let _ = next_frame(&mut harness).await;

        harness
            .bytes
            .send(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "port unplugged",
            )))
            .await
            .unwrap();

        let err = send.await.unwrap().unwrap_err();
        assert_eq!(err, Error::ConnectionLost);

        let event = harness.events.recv().await.unwrap();
        assert!(matches!(event, TransportEvent::Failed(Error::ConnectionLost)));
    }
}
