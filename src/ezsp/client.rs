//! The EZSP command multiplexer.
//!
//! One task owns the sequence counter, the table of outstanding commands and
//! the callback registry; everything else goes through the cloneable
//! [`EzspHandle`]. Commands are paired with their responses by the one-byte
//! sequence number the NCP echoes back; anything that does not match an
//! outstanding command is dispatched to the registered callback handlers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::select;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace, warn};

use crate::ash::{AshHandle, TransportEvent};

use super::{
    envelope::{EnvelopeCodec, MAX_PROTOCOL_VERSION},
    error::{Error, Result},
    table::{CommandDef, CommandTable},
    value::{self, Value},
};

/// Protocol version every NCP speaks before negotiation.
const LEGACY_PROTOCOL_VERSION: u8 = 4;

/// How long a command may remain unanswered before it is failed.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(100);

/// Name under which a fatal link event is announced to callback handlers.
pub const RESET_CALLBACK: &str = "_reset_controller_application";

pub type CallbackHandler = Box<dyn Fn(&str, &[(&'static str, Value)]) + Send + 'static>;

enum MuxCommand {
    Call {
        name: String,
        values: Vec<(&'static str, Value)>,
        done: oneshot::Sender<Result<Vec<(&'static str, Value)>>>,
    },
    Abort {
        seq: u8,
        error: Error,
    },
    SetProtocolVersion {
        version: u8,
        done: oneshot::Sender<u8>,
    },
    AddCallback {
        handler: CallbackHandler,
        done: oneshot::Sender<u64>,
    },
    RemoveCallback {
        id: u64,
    },
    WaitForStartup {
        done: oneshot::Sender<oneshot::Receiver<u8>>,
    },
    Suspend {
        done: oneshot::Sender<()>,
    },
}

/// Cloneable handle for issuing EZSP commands and managing callbacks.
#[derive(Clone)]
pub struct EzspHandle {
    commands: mpsc::Sender<MuxCommand>,
}

impl EzspHandle {
    /// Issue a named command and wait for the NCP's response parameters.
    pub async fn call(
        &self,
        name: &str,
        values: &[(&'static str, Value)],
    ) -> Result<Vec<(&'static str, Value)>> {
        let (done, ret) = oneshot::channel();
        self.commands
            .send(MuxCommand::Call {
                name: name.to_string(),
                values: values.to_vec(),
                done,
            })
            .await
            .map_err(|_| Error::Stopped)?;
        ret.await.map_err(|_| Error::Stopped)?
    }

    /// Negotiate the EZSP protocol version with the NCP.
    ///
    /// The first `version` exchange always uses the legacy wire format. When
    /// the NCP already answers with the desired version only the codec and
    /// command table are swapped; when it answers with anything else the
    /// exchange is repeated with the version the NCP asked for.
    pub async fn negotiate_version(&self) -> Result<u8> {
        let reply = self
            .call(
                "version",
                &[(
                    "desiredProtocolVersion",
                    Value::Uint(MAX_PROTOCOL_VERSION as u64),
                )],
            )
            .await?;
        let ncp_version = field_u8(&reply, "protocolVersion")?;
        if ncp_version == MAX_PROTOCOL_VERSION {
            return self.set_protocol_version(ncp_version).await;
        }

        let negotiated = self.set_protocol_version(ncp_version).await?;
        let reply = self
            .call(
                "version",
                &[("desiredProtocolVersion", Value::Uint(negotiated as u64))],
            )
            .await?;
        let confirmed = field_u8(&reply, "protocolVersion")?;
        if confirmed != negotiated {
            warn!(
                negotiated,
                confirmed, "NCP changed its protocol version mid-negotiation"
            );
        }
        Ok(negotiated)
    }

    /// Swap the envelope codec and command table for `version`. Returns the
    /// version actually in effect (unknown versions fall back to the newest
    /// one this driver knows).
    pub async fn set_protocol_version(&self, version: u8) -> Result<u8> {
        let (done, ret) = oneshot::channel();
        self.commands
            .send(MuxCommand::SetProtocolVersion { version, done })
            .await
            .map_err(|_| Error::Stopped)?;
        ret.await.map_err(|_| Error::Stopped)
    }

    /// Register a handler for unsolicited frames. Handlers run in
    /// registration order; the returned id removes the handler again.
    pub async fn add_callback(&self, handler: CallbackHandler) -> Result<u64> {
        let (done, ret) = oneshot::channel();
        self.commands
            .send(MuxCommand::AddCallback { handler, done })
            .await
            .map_err(|_| Error::Stopped)?;
        ret.await.map_err(|_| Error::Stopped)
    }

    pub async fn remove_callback(&self, id: u64) {
        let _ = self.commands.send(MuxCommand::RemoveCallback { id }).await;
    }

    /// A receiver that resolves with the reset code of the next completed
    /// link reset. The waiter is registered when this returns, so a reset
    /// observed afterwards cannot slip past it.
    pub async fn startup_listener(&self) -> Result<oneshot::Receiver<u8>> {
        let (done, ret) = oneshot::channel();
        self.commands
            .send(MuxCommand::WaitForStartup { done })
            .await
            .map_err(|_| Error::Stopped)?;
        ret.await.map_err(|_| Error::Stopped)
    }

    /// Stop accepting commands until the next completed link reset. Called
    /// when a reset handshake is about to start; outstanding commands are
    /// failed since their responses will never arrive.
    pub async fn suspend(&self) -> Result<()> {
        let (done, ret) = oneshot::channel();
        self.commands
            .send(MuxCommand::Suspend { done })
            .await
            .map_err(|_| Error::Stopped)?;
        ret.await.map_err(|_| Error::Stopped)
    }

    /// Start gathering the parameters of every `item_names` callback until
    /// the `completion` callback arrives. The handler is registered before
    /// this returns, so a command issued afterwards cannot outrun it.
    pub async fn start_collecting(
        &self,
        item_names: &[&str],
        completion: &str,
    ) -> Result<Collector> {
        let (found, sightings) = mpsc::unbounded_channel();
        let id = self
            .add_callback(Box::new(move |name, fields| {
                let _ = found.send((name.to_string(), fields.to_vec()));
            }))
            .await?;
        Ok(Collector {
            handle: self.clone(),
            id,
            sightings,
            wanted: item_names.iter().map(|name| name.to_string()).collect(),
            finish: completion.to_string(),
        })
    }

    /// [`start_collecting`](EzspHandle::start_collecting) and wait in one go.
    pub async fn collect_until(
        &self,
        item_names: &[&str],
        completion: &str,
    ) -> Result<Vec<Vec<(&'static str, Value)>>> {
        self.start_collecting(item_names, completion).await?.finish().await
    }
}

/// An in-progress callback collection. The temporary handler is always
/// removed when [`finish`](Collector::finish) returns, whichever way the
/// wait ends.
pub struct Collector {
    handle: EzspHandle,
    id: u64,
    sightings: mpsc::UnboundedReceiver<(String, Vec<(&'static str, Value)>)>,
    wanted: Vec<String>,
    finish: String,
}

impl Collector {
    /// Give up on the collection and deregister the temporary handler.
    pub async fn cancel(self) {
        self.handle.remove_callback(self.id).await;
    }

    pub async fn finish(mut self) -> Result<Vec<Vec<(&'static str, Value)>>> {
        let mut collected = Vec::new();
        let outcome = loop {
            match self.sightings.recv().await {
                Some((name, fields)) => {
                    if name == self.finish {
                        break Ok(collected);
                    }
                    if self.wanted.iter().any(|wanted| *wanted == name) {
                        collected.push(fields);
                    }
                }
                None => break Err(Error::Stopped),
            }
        };
        self.handle.remove_callback(self.id).await;
        outcome
    }
}

struct PendingCommand {
    def: &'static CommandDef,
    done: oneshot::Sender<Result<Vec<(&'static str, Value)>>>,
    deadline: Instant,
}

/// The multiplexer task. Consumes transport events and the handle mailbox
/// until both sides hang up.
pub struct EzspClient {
    commands: mpsc::Receiver<MuxCommand>,
    feedback: mpsc::Sender<MuxCommand>,
    events: mpsc::Receiver<TransportEvent>,
    ash: AshHandle,
    running: bool,
    protocol_version: u8,
    codec: EnvelopeCodec,
    table: &'static CommandTable,
    seq: u8,
    awaiting: Vec<Option<PendingCommand>>,
    callbacks: Vec<(u64, CallbackHandler)>,
    next_callback_id: u64,
    startup_waiters: Vec<oneshot::Sender<u8>>,
}

pub fn create_ezsp_client(
    ash: AshHandle,
    events: mpsc::Receiver<TransportEvent>,
) -> (EzspClient, EzspHandle) {
    let (commands, mailbox) = mpsc::channel(8);
    let client = EzspClient {
        commands: mailbox,
        feedback: commands.clone(),
        events,
        ash,
        running: false,
        protocol_version: LEGACY_PROTOCOL_VERSION,
        codec: EnvelopeCodec::V4,
        table: legacy_table(),
        seq: 0,
        awaiting: (0..=u8::MAX).map(|_| None).collect(),
        callbacks: Vec::new(),
        next_callback_id: 0,
        startup_waiters: Vec::new(),
    };
    let handle = EzspHandle { commands };
    (client, handle)
}

fn legacy_table() -> &'static CommandTable {
    match CommandTable::for_protocol_version(LEGACY_PROTOCOL_VERSION) {
        Some(table) => table,
        None => unreachable!("the legacy protocol version always has a table"),
    }
}

impl EzspClient {
    pub async fn run(mut self) {
        loop {
            let wake = self.next_wake();
            select! {
                biased;
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
                _ = sleep_until(wake.unwrap_or_else(far_future)), if wake.is_some() => {
                    self.handle_timers();
                }
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        self.awaiting
            .iter()
            .flatten()
            .map(|pending| pending.deadline)
            .min()
    }

    fn handle_command(&mut self, cmd: MuxCommand) {
        match cmd {
            MuxCommand::Call { name, values, done } => self.start_call(name, values, done),
            MuxCommand::Abort { seq, error } => {
                if let Some(pending) = self.awaiting[seq as usize].take() {
                    debug!(seq, command = pending.def.name, "Command aborted in transit");
                    let _ = pending.done.send(Err(error));
                }
            }
            MuxCommand::SetProtocolVersion { version, done } => {
                self.set_protocol_version(version);
                let _ = done.send(self.protocol_version);
            }
            MuxCommand::AddCallback { handler, done } => {
                let id = self.next_callback_id;
                self.next_callback_id += 1;
                self.callbacks.push((id, handler));
                let _ = done.send(id);
            }
            MuxCommand::RemoveCallback { id } => {
                self.callbacks.retain(|(registered, _)| *registered != id);
            }
            MuxCommand::WaitForStartup { done } => {
                let (notify, listener) = oneshot::channel();
                self.startup_waiters.push(notify);
                let _ = done.send(listener);
            }
            MuxCommand::Suspend { done } => {
                debug!("Link reset pending, EZSP stops accepting commands");
                self.running = false;
                self.fail_outstanding(Error::NotRunning);
                let _ = done.send(());
            }
        }
    }

    fn start_call(
        &mut self,
        name: String,
        values: Vec<(&'static str, Value)>,
        done: oneshot::Sender<Result<Vec<(&'static str, Value)>>>,
    ) {
        if !self.running {
            let _ = done.send(Err(Error::NotRunning));
            return;
        }
        let def = match self.table.get(&name) {
            Some(def) => def,
            None => {
                let _ = done.send(Err(Error::UnknownCommand(name)));
                return;
            }
        };
        let mut body = BytesMut::new();
        if let Err(e) = value::encode_schema(&def.request, &values, &mut body) {
            let _ = done.send(Err(e));
            return;
        }

        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        let frame = match self.codec.encode(seq, def.id, &body) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = done.send(Err(e));
                return;
            }
        };
        trace!(seq, command = def.name, "Issuing command");

        if let Some(stale) = self.awaiting[seq as usize].replace(PendingCommand {
            def,
            done,
            deadline: Instant::now() + COMMAND_TIMEOUT,
        }) {
            // The sequence counter lapped a command that never resolved.
            let _ = stale.done.send(Err(Error::CommandTimeout));
        }

        let ash = self.ash.clone();
        let feedback = self.feedback.clone();
        tokio::spawn(async move {
            if let Err(e) = ash.send_data(frame).await {
                let _ = feedback
                    .send(MuxCommand::Abort {
                        seq,
                        error: e.into(),
                    })
                    .await;
            }
        });
    }

    fn set_protocol_version(&mut self, version: u8) {
        match (
            EnvelopeCodec::for_protocol_version(version),
            CommandTable::for_protocol_version(version),
        ) {
            (Some(codec), Some(table)) => {
                debug!(version, "Switching EZSP protocol version");
                self.protocol_version = version;
                self.codec = codec;
                self.table = table;
            }
            _ => {
                warn!(
                    version,
                    fallback = MAX_PROTOCOL_VERSION,
                    "NCP speaks an unknown protocol version, using the newest supported one"
                );
                self.protocol_version = MAX_PROTOCOL_VERSION;
                self.codec = EnvelopeCodec::V8;
                if let Some(table) = CommandTable::for_protocol_version(MAX_PROTOCOL_VERSION) {
                    self.table = table;
                }
            }
        }
    }

    fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Payload(payload) => self.handle_payload(payload),
            TransportEvent::Reset(code) => {
                debug!(code, "Link is up, EZSP session starts fresh");
                self.running = true;
                self.seq = 0;
                self.protocol_version = LEGACY_PROTOCOL_VERSION;
                self.codec = EnvelopeCodec::V4;
                self.table = legacy_table();
                self.fail_outstanding(Error::NotRunning);
                for waiter in self.startup_waiters.drain(..) {
                    let _ = waiter.send(code);
                }
            }
            TransportEvent::Failed(error) => {
                warn!(error = %error, "Link failed, EZSP stops accepting commands");
                self.running = false;
                let cause = Value::Bytes(Bytes::from(error.to_string()));
                self.fail_outstanding(Error::Transport(error));
                self.dispatch_callback(RESET_CALLBACK, &[("cause", cause)]);
            }
        }
    }

    fn handle_payload(&mut self, payload: Bytes) {
        let envelope = match self.codec.decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Discarding an undecodable EZSP frame");
                return;
            }
        };
        let def = match self.table.by_id(envelope.command_id) {
            Some(def) => def,
            None => {
                warn!(
                    command_id = envelope.command_id,
                    "Discarding a frame with an unknown command id"
                );
                return;
            }
        };

        let idx = envelope.seq as usize;
        if let Some(pending) = &self.awaiting[idx] {
            if pending.def.id == envelope.command_id {
                let pending = self.awaiting[idx].take().unwrap_or_else(|| unreachable!());
                let mut body = envelope.body;
                let result = value::decode_schema(&def.response, &mut body);
                trace!(seq = envelope.seq, command = def.name, "Command resolved");
                let _ = pending.done.send(result);
                return;
            }
            if def.name == "invalidCommand" {
                let pending = self.awaiting[idx].take().unwrap_or_else(|| unreachable!());
                warn!(command = pending.def.name, "Firmware rejected the command");
                let _ = pending
                    .done
                    .send(Err(Error::UnknownCommand(pending.def.name.to_string())));
                return;
            }
        }

        let mut body = envelope.body;
        match value::decode_schema(&def.response, &mut body) {
            Ok(fields) => self.dispatch_callback(def.name, &fields),
            Err(e) => warn!(callback = def.name, error = %e, "Malformed callback frame"),
        }
    }

    fn dispatch_callback(&self, name: &str, fields: &[(&'static str, Value)]) {
        trace!(callback = name, handlers = self.callbacks.len(), "Dispatching callback");
        for (id, handler) in &self.callbacks {
            if catch_unwind(AssertUnwindSafe(|| handler(name, fields))).is_err() {
                warn!(callback = name, handler = id, "Callback handler panicked");
            }
        }
    }

    fn handle_timers(&mut self) {
        let now = Instant::now();
        for slot in self.awaiting.iter_mut() {
            let expired = matches!(slot, Some(pending) if pending.deadline <= now);
            let abandoned = matches!(slot, Some(pending) if pending.done.is_closed());
            if expired || abandoned {
                if let Some(pending) = slot.take() {
                    if expired {
                        warn!(command = pending.def.name, "Command went unanswered");
                    }
                    let _ = pending.done.send(Err(Error::CommandTimeout));
                }
            }
        }
    }

    fn fail_outstanding(&mut self, error: Error) {
        for slot in self.awaiting.iter_mut() {
            if let Some(pending) = slot.take() {
                let _ = pending.done.send(Err(error.clone()));
            }
        }
    }

    fn shutdown(&mut self) {
        self.running = false;
        self.fail_outstanding(Error::Stopped);
        self.startup_waiters.clear();
    }
}

fn field_u8(fields: &[(&'static str, Value)], name: &str) -> Result<u8> {
    fields
        .iter()
        .find(|(field, _)| *field == name)
        .and_then(|(_, value)| value.as_uint())
        .map(|value| value as u8)
        .ok_or(Error::Decode("response is missing an expected field"))
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400)
}
