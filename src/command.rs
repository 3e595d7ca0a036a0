//! Control command codec
//!
//! Control commands are small fixed-layout messages exchanged between the
//! network and an end-device, piggybacked on regular frames. Each concrete
//! command implements [`Command`]; the closed [`MacCommand`] set dispatches
//! on the command identifier (CID) read by the framing layer.
//!
//! # Wire format
//!
//! ```text
//! [cid: 1] [body: Command::SIZE] [cid: 1] [body] ...
//! ```
//!
//! Bodies carry no length prefix: the CID and the direction of travel fix the
//! size. The same CID may name different commands per direction (a request
//! uplink, its answer downlink).

use std::fmt;

use crate::error::DecodeError;
use crate::protocol::{Direction, LinkQuality, MARGIN_RESERVED};

/// Maximum size of a piggybacked command block in bytes
pub const MAX_FOPTS_LEN: usize = 15;

/// Receiving-endpoint state a command acts on
pub trait CommandContext {
    /// Store the link quality last reported to the device
    fn record_link_quality(&mut self, quality: LinkQuality);

    /// Note that the device asked for a link check
    fn request_link_check(&mut self);
}

/// Capabilities shared by every concrete control command
pub trait Command: Sized + fmt::Display {
    /// Human-readable command name
    const NAME: &'static str;
    /// Command identifier written by the framing layer
    const CID: u8;
    /// Direction the command travels in
    const DIRECTION: Direction;
    /// Fixed body size in bytes
    const SIZE: usize;

    /// Append exactly [`Command::SIZE`] bytes to `writer`
    fn serialize(&self, writer: &mut Vec<u8>);

    /// Decode a body, returning the command and the bytes consumed
    fn deserialize(reader: &[u8]) -> Result<(Self, usize), DecodeError>;

    /// Apply the on-receipt effect
    fn execute(&self, context: &mut dyn CommandContext);

    /// Body size of this command
    fn serialized_size(&self) -> usize {
        Self::SIZE
    }
}

fn ensure_available(
    command: &'static str,
    needed: usize,
    reader: &[u8],
) -> Result<(), DecodeError> {
    if reader.len() < needed {
        return Err(DecodeError::TruncatedInput {
            command,
            needed,
            available: reader.len(),
        });
    }
    Ok(())
}

/// Device request for a link-quality report (no body)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkCheckReq;

impl Command for LinkCheckReq {
    const NAME: &'static str = "LinkCheckReq";
    const CID: u8 = 0x02;
    const DIRECTION: Direction = Direction::Uplink;
    const SIZE: usize = 0;

    fn serialize(&self, _writer: &mut Vec<u8>) {}

    fn deserialize(_reader: &[u8]) -> Result<(Self, usize), DecodeError> {
        Ok((Self, 0))
    }

    fn execute(&self, context: &mut dyn CommandContext) {
        context.request_link_check();
    }
}

impl fmt::Display for LinkCheckReq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Self::NAME)
    }
}

/// Network answer carrying demodulation margin and gateway count
///
/// ```text
/// [margin: 1] [gateway_count: 1]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkCheckAns {
    /// Demodulation margin in dB; 255 is reserved
    pub margin: u8,
    /// Number of gateways that received the request
    pub gateway_count: u8,
}

impl LinkCheckAns {
    pub fn new(margin: u8, gateway_count: u8) -> Self {
        Self {
            margin,
            gateway_count,
        }
    }

    /// Whether the margin byte holds the reserved value
    pub fn has_reserved_margin(&self) -> bool {
        self.margin == MARGIN_RESERVED
    }

    pub fn quality(&self) -> LinkQuality {
        LinkQuality {
            margin: self.margin,
            gateway_count: self.gateway_count,
        }
    }
}

impl Command for LinkCheckAns {
    const NAME: &'static str = "LinkCheckAns";
    const CID: u8 = 0x02;
    const DIRECTION: Direction = Direction::Downlink;
    const SIZE: usize = 2;

    fn serialize(&self, writer: &mut Vec<u8>) {
        writer.push(self.margin);
        writer.push(self.gateway_count);
    }

    fn deserialize(reader: &[u8]) -> Result<(Self, usize), DecodeError> {
        ensure_available(Self::NAME, Self::SIZE, reader)?;
        Ok((Self::new(reader[0], reader[1]), Self::SIZE))
    }

    fn execute(&self, context: &mut dyn CommandContext) {
        context.record_link_quality(self.quality());
    }
}

impl fmt::Display for LinkCheckAns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(margin={}dB, gateways={})",
            Self::NAME,
            self.margin,
            self.gateway_count
        )
    }
}

/// Closed set of supported control commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacCommand {
    LinkCheckReq(LinkCheckReq),
    LinkCheckAns(LinkCheckAns),
}

impl MacCommand {
    /// Command identifier
    pub fn cid(&self) -> u8 {
        match self {
            MacCommand::LinkCheckReq(_) => LinkCheckReq::CID,
            MacCommand::LinkCheckAns(_) => LinkCheckAns::CID,
        }
    }

    /// Direction the command travels in
    pub fn direction(&self) -> Direction {
        match self {
            MacCommand::LinkCheckReq(_) => LinkCheckReq::DIRECTION,
            MacCommand::LinkCheckAns(_) => LinkCheckAns::DIRECTION,
        }
    }

    /// Body size, excluding the CID
    pub fn serialized_size(&self) -> usize {
        match self {
            MacCommand::LinkCheckReq(c) => c.serialized_size(),
            MacCommand::LinkCheckAns(c) => c.serialized_size(),
        }
    }

    /// Size on the wire, including the CID
    pub fn encoded_len(&self) -> usize {
        1 + self.serialized_size()
    }

    /// Append CID and body to `writer`
    pub fn encode(&self, writer: &mut Vec<u8>) {
        writer.push(self.cid());
        match self {
            MacCommand::LinkCheckReq(c) => c.serialize(writer),
            MacCommand::LinkCheckAns(c) => c.serialize(writer),
        }
    }

    /// Decode one command (CID and body), returning the bytes consumed
    pub fn decode(direction: Direction, bytes: &[u8]) -> Result<(Self, usize), DecodeError> {
        ensure_available("command identifier", 1, bytes)?;
        let cid = bytes[0];
        let body = &bytes[1..];

        let (command, used) = match (direction, cid) {
            (Direction::Uplink, LinkCheckReq::CID) => {
                let (c, n) = LinkCheckReq::deserialize(body)?;
                (MacCommand::LinkCheckReq(c), n)
            }
            (Direction::Downlink, LinkCheckAns::CID) => {
                let (c, n) = LinkCheckAns::deserialize(body)?;
                (MacCommand::LinkCheckAns(c), n)
            }
            _ => return Err(DecodeError::UnknownCommand { cid, direction }),
        };

        Ok((command, 1 + used))
    }

    /// Apply the command's on-receipt effect
    pub fn execute(&self, context: &mut dyn CommandContext) {
        match self {
            MacCommand::LinkCheckReq(c) => c.execute(context),
            MacCommand::LinkCheckAns(c) => c.execute(context),
        }
    }
}

impl fmt::Display for MacCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MacCommand::LinkCheckReq(c) => fmt::Display::fmt(c, f),
            MacCommand::LinkCheckAns(c) => fmt::Display::fmt(c, f),
        }
    }
}

impl From<LinkCheckReq> for MacCommand {
    fn from(command: LinkCheckReq) -> Self {
        MacCommand::LinkCheckReq(command)
    }
}

impl From<LinkCheckAns> for MacCommand {
    fn from(command: LinkCheckAns) -> Self {
        MacCommand::LinkCheckAns(command)
    }
}

/// Commands decoded from one block
///
/// Decoding stops at the first malformed command because the size of
/// whatever follows cannot be known; commands before it are kept.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandBatch {
    /// Successfully decoded commands, in wire order
    pub commands: Vec<MacCommand>,
    /// Error that stopped decoding, if any
    pub malformed: Option<DecodeError>,
}

impl CommandBatch {
    /// Whether the whole block decoded
    pub fn is_clean(&self) -> bool {
        self.malformed.is_none()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MacCommand> {
        self.commands.iter()
    }
}

/// Decode a command block travelling in `direction`
pub fn decode_commands(direction: Direction, bytes: &[u8]) -> CommandBatch {
    let mut batch = CommandBatch::default();
    let mut pos = 0;

    while pos < bytes.len() {
        match MacCommand::decode(direction, &bytes[pos..]) {
            Ok((command, used)) => {
                batch.commands.push(command);
                pos += used;
            }
            Err(e) => {
                log::debug!("discarding command block at offset {}: {}", pos, e);
                batch.malformed = Some(e);
                break;
            }
        }
    }

    batch
}

/// Encode a command block, enforcing the piggyback size limit
pub fn encode_commands(commands: &[MacCommand]) -> Result<Vec<u8>, DecodeError> {
    let size: usize = commands.iter().map(MacCommand::encoded_len).sum();
    if size > MAX_FOPTS_LEN {
        return Err(DecodeError::CommandBlockTooLong {
            size,
            max: MAX_FOPTS_LEN,
        });
    }

    let mut buf = Vec::with_capacity(size);
    for command in commands {
        command.encode(&mut buf);
    }
    Ok(buf)
}
