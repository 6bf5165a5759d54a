//! The top of the stack: opens the serial port, wires the link layer and the
//! multiplexer together and exposes the driver surface applications use.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::ash::{create_ash_transport, AshHandle};
use crate::ezsp::{
    create_ezsp_client, value::Value, CallbackHandler, EzspHandle, Result,
};
use crate::serial;
use crate::settings::Settings;

const EVENT_DEPTH: usize = 32;

/// What a completed reset handshake established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Startup {
    /// Reset code the NCP reported in its RSTACK frame.
    pub reset_code: u8,
    /// The negotiated EZSP protocol version.
    pub protocol_version: u8,
}

/// A connected NCP. Cheap to clone; all clones drive the same device.
#[derive(Clone)]
pub struct Gateway {
    ash: AshHandle,
    ezsp: EzspHandle,
    ezsp_config: HashMap<String, u16>,
    ezsp_policies: HashMap<String, String>,
}

/// Open the configured serial port and spawn the driver tasks.
pub fn connect(settings: &Settings) -> Result<Gateway> {
    let link = serial::open(&settings.serial)
        .map_err(|e| crate::ash::Error::from(std::io::Error::from(e)))?;
    Ok(attach(
        link.bytes_in,
        link.wire_out,
        settings.ezsp_config.clone(),
        settings.ezsp_policies.clone(),
    ))
}

fn attach(
    bytes_in: mpsc::Receiver<std::io::Result<BytesMut>>,
    wire_out: mpsc::Sender<Bytes>,
    ezsp_config: HashMap<String, u16>,
    ezsp_policies: HashMap<String, String>,
) -> Gateway {
    let (events_out, events) = mpsc::channel(EVENT_DEPTH);
    let (transport, ash) = create_ash_transport(bytes_in, wire_out, events_out);
    tokio::spawn(transport.run());
    let (client, ezsp) = create_ezsp_client(ash.clone(), events);
    tokio::spawn(client.run());
    Gateway {
        ash,
        ezsp,
        ezsp_config,
        ezsp_policies,
    }
}

impl Gateway {
    /// Reset the NCP and bring the EZSP session up: RST/RSTACK handshake
    /// followed by protocol version negotiation. Commands issued while the
    /// handshake is in flight fail fast.
    pub async fn reset(&self) -> Result<Startup> {
        self.ezsp.suspend().await?;
        let listener = self.ezsp.startup_listener().await?;
        let reset_code = self.ash.reset().await.map_err(crate::ezsp::Error::from)?;
        listener.await.map_err(|_| crate::ezsp::Error::Stopped)?;
        let protocol_version = self.ezsp.negotiate_version().await?;
        info!(reset_code, protocol_version, "NCP is up");
        Ok(Startup {
            reset_code,
            protocol_version,
        })
    }

    /// Push the configured `ezsp_config` values and `ezsp_policies` to the
    /// NCP. Meant to be called right after [`reset`](Gateway::reset), before
    /// the network is brought up; identifiers that do not parse are skipped.
    pub async fn configure(&self) -> Result<()> {
        let mut config: Vec<_> = self.ezsp_config.iter().collect();
        config.sort();
        for (key, value) in config {
            let Some(id) = parse_id(key) else {
                warn!(key, "Ignoring an unparseable configuration id");
                continue;
            };
            let reply = self
                .command(
                    "setConfigurationValue",
                    &[
                        ("configId", Value::Uint(id)),
                        ("value", Value::Uint(*value as u64)),
                    ],
                )
                .await?;
            check_status("setConfigurationValue", key, &reply);
        }

        let mut policies: Vec<_> = self.ezsp_policies.iter().collect();
        policies.sort();
        for (key, decision) in policies {
            let (Some(policy_id), Some(decision_id)) = (parse_id(key), parse_id(decision)) else {
                warn!(key, decision, "Ignoring an unparseable policy entry");
                continue;
            };
            let reply = self
                .command(
                    "setPolicy",
                    &[
                        ("policyId", Value::Uint(policy_id)),
                        ("decisionId", Value::Uint(decision_id)),
                    ],
                )
                .await?;
            check_status("setPolicy", key, &reply);
        }
        Ok(())
    }

    /// Issue a named EZSP command and wait for its response parameters.
    pub async fn command(
        &self,
        name: &str,
        values: &[(&'static str, Value)],
    ) -> Result<Vec<(&'static str, Value)>> {
        self.ezsp.call(name, values).await
    }

    /// Resolves with the reset code of the next RSTACK the NCP emits, e.g.
    /// an unsolicited reboot. For resets initiated through
    /// [`reset`](Gateway::reset) the startup is already awaited internally.
    pub async fn wait_for_startup_reset(&self) -> Result<u8> {
        let listener = self.ezsp.startup_listener().await?;
        listener.await.map_err(|_| crate::ezsp::Error::Stopped)
    }

    pub async fn add_callback(&self, handler: CallbackHandler) -> Result<u64> {
        self.ezsp.add_callback(handler).await
    }

    pub async fn remove_callback(&self, id: u64) {
        self.ezsp.remove_callback(id).await
    }

    /// Run an energy scan over `channel_mask` and return the per-channel
    /// RSSI readings as `(channel, max_rssi)` pairs.
    pub async fn energy_scan(&self, channel_mask: u32, duration: u8) -> Result<Vec<(u8, i8)>> {
        let collector = self
            .ezsp
            .start_collecting(&["energyScanResultHandler"], "scanCompleteHandler")
            .await?;
        debug!(channel_mask, duration, "Starting energy scan");
        let reply = self
            .command(
                "startScan",
                &[
                    ("scanType", Value::Uint(0)),
                    ("channelMask", Value::Uint(channel_mask as u64)),
                    ("duration", Value::Uint(duration as u64)),
                ],
            )
            .await;
        if let Err(e) = reply {
            collector.cancel().await;
            return Err(e);
        }

        let readings = collector.finish().await?;
        Ok(readings
            .into_iter()
            .filter_map(|fields| {
                let channel = fields
                    .iter()
                    .find(|(name, _)| *name == "channel")?
                    .1
                    .as_uint()? as u8;
                let rssi = match fields.iter().find(|(name, _)| *name == "maxRssiValue")?.1 {
                    Value::Int(v) => v as i8,
                    _ => return None,
                };
                Some((channel, rssi))
            })
            .collect())
    }

    /// The raw multiplexer handle, for callers that need the lower surface.
    pub fn ezsp(&self) -> &EzspHandle {
        &self.ezsp
    }
}

/// Accept decimal or `0x`-prefixed hexadecimal identifiers.
fn parse_id(key: &str) -> Option<u64> {
    if let Some(hex) = key.strip_prefix("0x").or_else(|| key.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        key.parse().ok()
    }
}

fn check_status(command: &str, key: &str, reply: &[(&'static str, Value)]) {
    let status = reply
        .iter()
        .find(|(name, _)| *name == "status")
        .and_then(|(_, value)| value.as_uint());
    match status {
        Some(0) => {}
        Some(status) => warn!(command, key, status, "NCP refused the setting"),
        None => warn!(command, key, "NCP response carried no status"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ash::{
        constants::{ASH_VERSION_2, RESET_SOFTWARE},
        AshCodec, Frame, FrameNumber,
    };
    use std::time::Duration;
    use tokio::time::timeout;
    use tokio_util::codec::Decoder;

    struct Harness {
        bytes: mpsc::Sender<std::io::Result<BytesMut>>,
        wire: mpsc::Receiver<Bytes>,
        gateway: Gateway,
        ncp_frm: FrameNumber,
    }

    fn spawn_gateway(config: HashMap<String, u16>, policies: HashMap<String, String>) -> Harness {
        let (bytes, bytes_in) = mpsc::channel(16);
        let (wire_out, wire) = mpsc::channel(16);
        let gateway = attach(bytes_in, wire_out, config, policies);
        Harness {
            bytes,
            wire,
            gateway,
            ncp_frm: FrameNumber::zero(),
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

    async fn recv_command(harness: &mut Harness) -> (FrameNumber, Bytes) {
        loop {
            if let Frame::Data { frm_num, body, .. } = next_frame(harness).await {
                return (frm_num, body);
            }
        }
    }

    async fn respond(harness: &mut Harness, host_frm: FrameNumber, body: Vec<u8>) {
        let frame = Frame::data(harness.ncp_frm, false, host_frm + 1, Bytes::from(body));
        harness.ncp_frm = harness.ncp_frm + 1;
        feed(harness, frame).await;
    }

    async fn drive_reset(harness: &mut Harness) {
        // RST handshake.
        loop {
            if matches!(next_frame(harness).await, Frame::Rst) {
                break;
            }
        }
        feed(harness, Frame::rst_ack(ASH_VERSION_2, RESET_SOFTWARE)).await;

        // Version negotiation: the NCP agrees to v8 in the single legacy
        // exchange.
        let (frm, body) = recv_command(harness).await;
        assert_eq!(body.as_ref(), [0x00, 0x00, 0x00, 0x08]);
        respond(harness, frm, vec![0x00, 0x80, 0x00, 0x08, 0x02, 0xAA, 0xBB]).await;
    }

    #[tokio::test]
    async fn it_resets_and_negotiates_on_startup() {
        let mut harness = spawn_gateway(HashMap::new(), HashMap::new());
        let gateway = harness.gateway.clone();
        let reset = tokio::spawn(async move { gateway.reset().await });

        drive_reset(&mut harness).await;

        let startup = reset.await.unwrap().unwrap();
        assert_eq!(
            startup,
            Startup {
                reset_code: RESET_SOFTWARE,
                protocol_version: 8,
            }
        );
    }

    #[tokio::test]
    async fn it_pushes_configured_values_to_the_ncp() {
        let config = HashMap::from([("0x03".to_string(), 32u16)]);
        let policies = HashMap::from([("0".to_string(), "1".to_string())]);
        let mut harness = spawn_gateway(config, policies);

        let gateway = harness.gateway.clone();
        let task = tokio::spawn(async move {
            gateway.reset().await?;
            gateway.configure().await
        });
        drive_reset(&mut harness).await;

        // setConfigurationValue(0x03, 32) in the v8 envelope.
        let (frm, body) = recv_command(&mut harness).await;
        assert_eq!(body.as_ref(), [0x01, 0x00, 0x00, 0x53, 0x00, 0x03, 0x20, 0x00]);
        respond(&mut harness, frm, vec![0x01, 0x80, 0x00, 0x53, 0x00, 0x00]).await;

        // setPolicy(0, 1).
        let (frm, body) = recv_command(&mut harness).await;
        assert_eq!(body.as_ref(), [0x02, 0x00, 0x00, 0x55, 0x00, 0x00, 0x01]);
        respond(&mut harness, frm, vec![0x02, 0x80, 0x00, 0x55, 0x00, 0x00]).await;

        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn it_runs_an_energy_scan() {
        let mut harness = spawn_gateway(HashMap::new(), HashMap::new());
        let gateway = harness.gateway.clone();
        let task = tokio::spawn(async move {
            gateway.reset().await?;
            gateway.energy_scan(0x0000_0800, 3).await
        });
        drive_reset(&mut harness).await;

        let (frm, body) = recv_command(&mut harness).await;
        // startScan(energy, mask 0x00000800, duration 3).
        assert_eq!(
            body.as_ref(),
            [0x01, 0x00, 0x00, 0x1A, 0x00, 0x00, 0x00, 0x08, 0x00, 0x00, 0x03]
        );
        respond(&mut harness, frm, vec![0x01, 0x80, 0x00, 0x1A, 0x00, 0x00]).await;

        respond(
            &mut harness,
            FrameNumber::new_truncate(7),
            vec![0x42, 0x90, 0x00, 0x48, 0x00, 11, 0xC8],
        )
        .await;
        respond(
            &mut harness,
            FrameNumber::new_truncate(7),
            vec![0x42, 0x90, 0x00, 0x1C, 0x00, 11, 0x00],
        )
        .await;

        let readings = task.await.unwrap().unwrap();
        assert_eq!(readings, [(11, -56)]);
    }
}
