//! Byte-driven parser for the configuration command wire syntax:
//!
//! ```text
//! <type>(<node_eid>)[,<reliability>][:(<cla_addr>)][:[(<eid>),...]]
//!     [:[{<from_s>,<to_s>,<rate>[,[(<eid>),...]]},...]];
//! ```
//!
//! Times are seconds since the DTN epoch; they are converted to
//! milliseconds with an overflow check. The reliability field is
//! range-checked and then discarded.

use crate::node::{ContactSpec, NodeSpec};
use crate::processor::{RouterCommand, RouterCommandType};
use bpa_proto::eid::node_id_of;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    CommandType,
    NodeConfStart,
    NodeConfEid,
    ReliabilitySeparator,
    Reliability,
    ClaAddrStart,
    ClaAddr,
    ClaAddrNodesSeparator,
    NodeListStart,
    NodeStart,
    NodeEid,
    NodeSeparator,
    NodesContactsSeparator,
    ContactListStart,
    ContactStart,
    ContactStartTime,
    ContactEndTime,
    ContactBitrate,
    ContactNodeListStart,
    ContactNodeStart,
    ContactNodeEid,
    ContactNodeSeparator,
    ContactEnd,
    ContactSeparator,
    CommandEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Good,
    Done,
    Error,
}

/// Incremental configuration-command parser. Feed bytes with
/// [`ConfigParser::read`]; completed commands are returned as they are
/// terminated. A malformed byte aborts the current command and resets
/// the parser.
#[derive(Debug)]
pub struct ConfigParser {
    stage: Stage,
    status: Status,
    command_type: RouterCommandType,
    node: NodeSpec,
    scratch: String,
}

impl Default for ConfigParser {
    fn default() -> Self {
        Self::new()
    }
}

fn is_eid_char(byte: u8) -> bool {
    (0x21..=0x5f).contains(&byte) || (0x61..=0x7a).contains(&byte) || byte == 0x7e
}

fn is_digit(byte: u8) -> bool {
    byte.is_ascii_digit()
}

impl ConfigParser {
    pub fn new() -> Self {
        Self {
            stage: Stage::CommandType,
            status: Status::Good,
            command_type: RouterCommandType::Query,
            node: NodeSpec::default(),
            scratch: String::new(),
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Normalizes a just-read EID to its node ID where derivable, as
    /// the routing table is indexed by node IDs.
    fn finish_eid(&mut self) -> String {
        let raw = std::mem::take(&mut self.scratch);
        node_id_of(&raw).unwrap_or(raw)
    }

    fn finish_u64(&mut self) -> Option<u64> {
        let raw = std::mem::take(&mut self.scratch);
        raw.parse::<u64>().ok()
    }

    /// Consumes a seconds value and converts it to milliseconds,
    /// checking the 64-bit bound before multiplication.
    fn finish_time_ms(&mut self) -> Option<u64> {
        let seconds = self.finish_u64()?;
        if seconds >= u64::MAX / 1000 {
            return None;
        }
        Some(seconds * 1000)
    }

    fn error(&mut self) {
        self.status = Status::Error;
    }

    fn current_contact(&mut self) -> &mut ContactSpec {
        self.node
            .contacts
            .last_mut()
            .expect("contact pushed before its fields are read")
    }

    fn read_byte(&mut self, byte: u8) {
        let c = byte as char;
        match self.stage {
            Stage::CommandType => {
                self.command_type = match c {
                    '1' => RouterCommandType::Add,
                    '2' => RouterCommandType::Update,
                    '3' => RouterCommandType::Delete,
                    '4' => RouterCommandType::Query,
                    _ => return self.error(),
                };
                self.stage = Stage::NodeConfStart;
            }
            Stage::NodeConfStart => {
                if c == '(' {
                    self.scratch.clear();
                    self.stage = Stage::NodeConfEid;
                } else {
                    self.error();
                }
            }
            Stage::NodeConfEid => {
                if c == ')' {
                    self.node.eid = self.finish_eid();
                    self.stage = Stage::ReliabilitySeparator;
                } else if is_eid_char(byte) {
                    self.scratch.push(c);
                } else {
                    self.error();
                }
            }
            Stage::ReliabilitySeparator => match c {
                ',' => {
                    self.scratch.clear();
                    self.stage = Stage::Reliability;
                }
                ':' => self.stage = Stage::ClaAddrStart,
                ';' => self.status = Status::Done,
                _ => self.error(),
            },
            Stage::Reliability => {
                if c == ':' || c == ';' {
                    // Validated for grammar compatibility, then unused.
                    match self.finish_u64() {
                        Some(v) if (100..=1000).contains(&v) => {}
                        _ => return self.error(),
                    }
                    self.stage = Stage::ClaAddrStart;
                    if c == ';' {
                        self.status = Status::Done;
                    }
                } else if is_digit(byte) {
                    self.scratch.push(c);
                } else {
                    self.error();
                }
            }
            Stage::ClaAddrStart => match c {
                '(' => {
                    self.scratch.clear();
                    self.stage = Stage::ClaAddr;
                }
                ':' => self.stage = Stage::NodeListStart,
                ';' => self.status = Status::Done,
                _ => self.error(),
            },
            Stage::ClaAddr => {
                if c == ')' {
                    self.node.cla_addr = Some(std::mem::take(&mut self.scratch));
                    self.stage = Stage::ClaAddrNodesSeparator;
                } else {
                    // CLA addresses have no internal validation.
                    self.scratch.push(c);
                }
            }
            Stage::ClaAddrNodesSeparator => match c {
                ':' => self.stage = Stage::NodeListStart,
                ';' => self.status = Status::Done,
                _ => self.error(),
            },
            Stage::NodeListStart => match c {
                '[' => self.stage = Stage::NodeStart,
                ':' => self.stage = Stage::ContactListStart,
                ';' => self.status = Status::Done,
                _ => self.error(),
            },
            Stage::NodeStart => match c {
                '(' => {
                    self.scratch.clear();
                    self.stage = Stage::NodeEid;
                }
                ']' => self.stage = Stage::NodesContactsSeparator,
                _ => self.error(),
            },
            Stage::NodeEid => {
                if c == ')' {
                    let eid = self.finish_eid();
                    self.node.endpoints.push(eid);
                    self.stage = Stage::NodeSeparator;
                } else if is_eid_char(byte) {
                    self.scratch.push(c);
                } else {
                    self.error();
                }
            }
            Stage::NodeSeparator => match c {
                ',' => self.stage = Stage::NodeStart,
                ']' => self.stage = Stage::NodesContactsSeparator,
                _ => self.error(),
            },
            Stage::NodesContactsSeparator => match c {
                ':' => self.stage = Stage::ContactListStart,
                ';' => self.status = Status::Done,
                _ => self.error(),
            },
            Stage::ContactListStart => match c {
                '[' => self.stage = Stage::ContactStart,
                ';' => self.status = Status::Done,
                _ => self.error(),
            },
            Stage::ContactStart => match c {
                '{' => {
                    self.node.contacts.push(ContactSpec::default());
                    self.scratch.clear();
                    self.stage = Stage::ContactStartTime;
                }
                ']' => self.stage = Stage::CommandEnd,
                _ => self.error(),
            },
            Stage::ContactStartTime => {
                if c == ',' {
                    match self.finish_time_ms() {
                        Some(ms) => self.current_contact().from_ms = ms,
                        None => return self.error(),
                    }
                    self.stage = Stage::ContactEndTime;
                } else if is_digit(byte) {
                    self.scratch.push(c);
                } else {
                    self.error();
                }
            }
            Stage::ContactEndTime => {
                if c == ',' {
                    match self.finish_time_ms() {
                        Some(ms) => self.current_contact().to_ms = ms,
                        None => return self.error(),
                    }
                    self.stage = Stage::ContactBitrate;
                } else if is_digit(byte) {
                    self.scratch.push(c);
                } else {
                    self.error();
                }
            }
            Stage::ContactBitrate => {
                if c == ',' || c == '}' {
                    match self.finish_u64() {
                        Some(rate) => self.current_contact().bitrate_bytes_per_s = rate,
                        None => return self.error(),
                    }
                    self.stage = if c == ',' {
                        Stage::ContactNodeListStart
                    } else {
                        Stage::ContactSeparator
                    };
                } else if is_digit(byte) {
                    self.scratch.push(c);
                } else {
                    self.error();
                }
            }
            Stage::ContactNodeListStart => {
                if c == '[' {
                    self.stage = Stage::ContactNodeStart;
                } else {
                    self.error();
                }
            }
            Stage::ContactNodeStart => match c {
                '(' => {
                    self.scratch.clear();
                    self.stage = Stage::ContactNodeEid;
                }
                ']' => self.stage = Stage::ContactEnd,
                _ => self.error(),
            },
            Stage::ContactNodeEid => {
                if c == ')' {
                    let eid = self.finish_eid();
                    self.current_contact().contact_endpoints.push(eid);
                    self.stage = Stage::ContactNodeSeparator;
                } else if is_eid_char(byte) {
                    self.scratch.push(c);
                } else {
                    self.error();
                }
            }
            Stage::ContactNodeSeparator => match c {
                ',' => self.stage = Stage::ContactNodeStart,
                ']' => self.stage = Stage::ContactEnd,
                _ => self.error(),
            },
            Stage::ContactEnd => {
                if c == '}' {
                    self.stage = Stage::ContactSeparator;
                } else {
                    self.error();
                }
            }
            Stage::ContactSeparator => match c {
                ',' => self.stage = Stage::ContactStart,
                ']' => self.stage = Stage::CommandEnd,
                _ => self.error(),
            },
            Stage::CommandEnd => {
                if c == ';' {
                    self.status = Status::Done;
                } else {
                    self.error();
                }
            }
        }
    }

    /// Feeds a buffer of command bytes. Completed commands are
    /// appended to `out`; a parse error discards the rest of the
    /// buffer and resets the parser.
    ///
    /// Returns `Ok` with the number of consumed bytes, or `Err` with
    /// the offset of the offending byte.
    pub fn read(&mut self, buffer: &[u8], out: &mut Vec<RouterCommand>) -> Result<usize, usize> {
        for (i, byte) in buffer.iter().enumerate() {
            self.read_byte(*byte);
            match self.status {
                Status::Good => {}
                Status::Done => {
                    out.push(RouterCommand {
                        command_type: self.command_type,
                        node: std::mem::take(&mut self.node),
                    });
                    self.reset();
                }
                Status::Error => {
                    self.reset();
                    return Err(i);
                }
            }
        }
        Ok(buffer.len())
    }
}
