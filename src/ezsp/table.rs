//! Per-protocol-version EZSP command tables.
//!
//! Only a representative slice of the firmware command set is carried here;
//! the point is the structural contract (name -> id plus request/response
//! schemas) that the multiplexer is driven by. The schemas lean on the
//! shared parameter codec in [`super::value`].

use super::value::{Field, ParameterKind, Schema};

#[derive(Debug, Clone, Copy)]
pub struct CommandDef {
    pub name: &'static str,
    pub id: u16,
    pub request: Schema,
    pub response: Schema,
}

const fn cmd(name: &'static str, id: u16, request: Schema, response: Schema) -> CommandDef {
    CommandDef {
        name,
        id,
        request,
        response,
    }
}

const STATUS: ParameterKind = ParameterKind::Enum(1);
const U8: ParameterKind = ParameterKind::Uint(1);
const U16: ParameterKind = ParameterKind::Uint(2);
const I8: ParameterKind = ParameterKind::Int(1);
const LQI: ParameterKind = ParameterKind::Uint(1);
const EUI64: ParameterKind = ParameterKind::FixedArray {
    kind: &ParameterKind::Uint(1),
    len: 8,
};
const PAYLOAD: ParameterKind = ParameterKind::Bytes { length_width: 1 };

const ZIGBEE_NETWORK: Schema = Schema::new(&[
    Field::new("channel", U8),
    Field::new("panId", U16),
    Field::new("extendedPanId", EUI64),
    Field::new("allowingJoin", ParameterKind::Bool),
    Field::new("stackProfile", U8),
    Field::new("nwkUpdateId", U8),
]);

const APS_FRAME: Schema = Schema::new(&[
    Field::new("profileId", U16),
    Field::new("clusterId", U16),
    Field::new("sourceEndpoint", U8),
    Field::new("destinationEndpoint", U8),
    Field::new("options", ParameterKind::Bitmap(2)),
    Field::new("groupId", U16),
    Field::new("sequence", U8),
]);

static COMMON_COMMANDS: &[CommandDef] = &[
    cmd(
        "version",
        0x0000,
        Schema::new(&[Field::new("desiredProtocolVersion", U8)]),
        Schema::new(&[
            Field::new("protocolVersion", U8),
            Field::new("stackType", U8),
            Field::new("stackVersion", U16),
        ]),
    ),
    cmd("nop", 0x0005, Schema::EMPTY, Schema::EMPTY),
    cmd("callback", 0x0006, Schema::EMPTY, Schema::EMPTY),
    cmd("noCallbacks", 0x0007, Schema::EMPTY, Schema::EMPTY),
    cmd(
        "stackStatusHandler",
        0x0019,
        Schema::EMPTY,
        Schema::new(&[Field::new("status", STATUS)]),
    ),
    cmd(
        "networkInit",
        0x0017,
        Schema::EMPTY,
        Schema::new(&[Field::new("status", STATUS)]),
    ),
    cmd(
        "startScan",
        0x001A,
        Schema::new(&[
            Field::new("scanType", ParameterKind::Enum(1)),
            Field::new("channelMask", ParameterKind::Bitmap(4)),
            Field::new("duration", U8),
        ]),
        Schema::new(&[Field::new("status", STATUS)]),
    ),
    cmd(
        "networkFoundHandler",
        0x001B,
        Schema::EMPTY,
        Schema::new(&[
            Field::new("networkFound", ParameterKind::Struct(&ZIGBEE_NETWORK)),
            Field::new("lastHopLqi", LQI),
            Field::new("lastHopRssi", I8),
        ]),
    ),
    cmd(
        "scanCompleteHandler",
        0x001C,
        Schema::EMPTY,
        Schema::new(&[Field::new("channel", U8), Field::new("status", STATUS)]),
    ),
    cmd(
        "stopScan",
        0x001D,
        Schema::EMPTY,
        Schema::new(&[Field::new("status", STATUS)]),
    ),
    cmd(
        "getEui64",
        0x0026,
        Schema::EMPTY,
        Schema::new(&[Field::new("eui64", EUI64)]),
    ),
    cmd(
        "getNodeId",
        0x0027,
        Schema::EMPTY,
        Schema::new(&[Field::new("nodeId", U16)]),
    ),
    cmd(
        "sendUnicast",
        0x0034,
        Schema::new(&[
            Field::new("type", ParameterKind::Enum(1)),
            Field::new("indexOrDestination", U16),
            Field::new("apsFrame", ParameterKind::Struct(&APS_FRAME)),
            Field::new("messageTag", U8),
            Field::new("messageContents", PAYLOAD),
        ]),
        Schema::new(&[Field::new("status", STATUS), Field::new("sequence", U8)]),
    ),
    cmd(
        "messageSentHandler",
        0x003F,
        Schema::EMPTY,
        Schema::new(&[
            Field::new("type", ParameterKind::Enum(1)),
            Field::new("indexOrDestination", U16),
            Field::new("apsFrame", ParameterKind::Struct(&APS_FRAME)),
            Field::new("messageTag", U8),
            Field::new("status", STATUS),
            Field::new("messageContents", PAYLOAD),
        ]),
    ),
    cmd(
        "incomingMessageHandler",
        0x0045,
        Schema::EMPTY,
        Schema::new(&[
            Field::new("type", ParameterKind::Enum(1)),
            Field::new("apsFrame", ParameterKind::Struct(&APS_FRAME)),
            Field::new("lastHopLqi", LQI),
            Field::new("lastHopRssi", I8),
            Field::new("sender", U16),
            Field::new("bindingIndex", U8),
            Field::new("addressIndex", U8),
            Field::new("message", PAYLOAD),
        ]),
    ),
    cmd(
        "energyScanResultHandler",
        0x0048,
        Schema::EMPTY,
        Schema::new(&[Field::new("channel", U8), Field::new("maxRssiValue", I8)]),
    ),
    cmd(
        "getConfigurationValue",
        0x0052,
        Schema::new(&[Field::new("configId", ParameterKind::Enum(1))]),
        Schema::new(&[Field::new("status", STATUS), Field::new("value", U16)]),
    ),
    cmd(
        "setConfigurationValue",
        0x0053,
        Schema::new(&[
            Field::new("configId", ParameterKind::Enum(1)),
            Field::new("value", U16),
        ]),
        Schema::new(&[Field::new("status", STATUS)]),
    ),
    cmd(
        "setPolicy",
        0x0055,
        Schema::new(&[
            Field::new("policyId", ParameterKind::Enum(1)),
            Field::new("decisionId", ParameterKind::Enum(1)),
        ]),
        Schema::new(&[Field::new("status", STATUS)]),
    ),
    cmd(
        "getPolicy",
        0x0056,
        Schema::new(&[Field::new("policyId", ParameterKind::Enum(1))]),
        Schema::new(&[
            Field::new("status", STATUS),
            Field::new("decisionId", ParameterKind::Enum(1)),
        ]),
    ),
    cmd(
        "invalidCommand",
        0x0058,
        Schema::EMPTY,
        Schema::new(&[Field::new("reason", STATUS)]),
    ),
    cmd(
        "echo",
        0x0081,
        Schema::new(&[Field::new("data", PAYLOAD)]),
        Schema::new(&[Field::new("echo", PAYLOAD)]),
    ),
];

// Version 8 reworked networkInit to take a bitmask argument.
static V8_OVERRIDES: &[CommandDef] = &[cmd(
    "networkInit",
    0x0017,
    Schema::new(&[Field::new("networkInitBitmask", ParameterKind::Bitmap(2))]),
    Schema::new(&[Field::new("status", STATUS)]),
)];

#[derive(Debug)]
pub struct CommandTable {
    pub protocol_version: u8,
    overrides: &'static [CommandDef],
    common: &'static [CommandDef],
}

static TABLE_V4: CommandTable = CommandTable {
    protocol_version: 4,
    overrides: &[],
    common: COMMON_COMMANDS,
};
static TABLE_V5: CommandTable = CommandTable {
    protocol_version: 5,
    overrides: &[],
    common: COMMON_COMMANDS,
};
static TABLE_V6: CommandTable = CommandTable {
    protocol_version: 6,
    overrides: &[],
    common: COMMON_COMMANDS,
};
static TABLE_V7: CommandTable = CommandTable {
    protocol_version: 7,
    overrides: &[],
    common: COMMON_COMMANDS,
};
static TABLE_V8: CommandTable = CommandTable {
    protocol_version: 8,
    overrides: V8_OVERRIDES,
    common: COMMON_COMMANDS,
};

impl CommandTable {
    pub fn for_protocol_version(version: u8) -> Option<&'static CommandTable> {
        match version {
            4 => Some(&TABLE_V4),
            5 => Some(&TABLE_V5),
            6 => Some(&TABLE_V6),
            7 => Some(&TABLE_V7),
            8 => Some(&TABLE_V8),
            _ => None,
        }
    }

    pub fn get(&self, name: &str) -> Option<&'static CommandDef> {
        self.overrides
            .iter()
            .chain(self.common.iter())
            .find(|def| def.name == name)
    }

    pub fn by_id(&self, id: u16) -> Option<&'static CommandDef> {
        self.overrides
            .iter()
            .chain(self.common.iter())
            .find(|def| def.id == id)
    }
}
