use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

/// Command codes the router routes. The wire byte values follow the
/// memcached binary protocol so the binary-facing targets can stamp them
/// straight into packet headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Get,
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Delete,
    Quit,
    Version,
}

impl Opcode {
    pub fn wire_code(self) -> u8 {
        match self {
            Opcode::Get => 0x00,
            Opcode::Set => 0x01,
            Opcode::Add => 0x02,
            Opcode::Replace => 0x03,
            Opcode::Delete => 0x04,
            Opcode::Quit => 0x07,
            Opcode::Version => 0x0b,
            Opcode::Append => 0x0e,
            Opcode::Prepend => 0x0f,
        }
    }

    pub fn from_wire(code: u8) -> Option<Opcode> {
        match code {
            0x00 => Some(Opcode::Get),
            0x01 => Some(Opcode::Set),
            0x02 => Some(Opcode::Add),
            0x03 => Some(Opcode::Replace),
            0x04 => Some(Opcode::Delete),
            0x07 => Some(Opcode::Quit),
            0x0b => Some(Opcode::Version),
            0x0e => Some(Opcode::Append),
            0x0f => Some(Opcode::Prepend),
            _ => None,
        }
    }

    /// True for the store-family commands that carry flags/expiration extras
    /// and a value body.
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Opcode::Set | Opcode::Add | Opcode::Replace | Opcode::Append | Opcode::Prepend
        )
    }
}

/// Response status, with the standard binary-protocol u16 values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    KeyEnoent,
    KeyEexists,
    Einval,
    NotStored,
    UnknownCommand,
}

impl Status {
    pub fn wire_code(self) -> u16 {
        match self {
            Status::Success => 0x0000,
            Status::KeyEnoent => 0x0001,
            Status::KeyEexists => 0x0002,
            Status::Einval => 0x0004,
            Status::NotStored => 0x0005,
            Status::UnknownCommand => 0x0081,
        }
    }

    /// Unrecognized wire statuses collapse to Einval; the sources only
    /// distinguish success/miss/not-stored anyway.
    pub fn from_wire(code: u16) -> Status {
        match code {
            0x0000 => Status::Success,
            0x0001 => Status::KeyEnoent,
            0x0002 => Status::KeyEexists,
            0x0005 => Status::NotStored,
            0x0081 => Status::UnknownCommand,
            _ => Status::Einval,
        }
    }
}

/// One parsed client command, independent of which protocol carried it.
#[derive(Debug, Clone)]
pub struct Command {
    pub opcode: Opcode,
    pub key: Bytes,
    pub flags: u32,
    pub expiration: u32,
    pub value: Bytes,
    pub cas: u64,
    pub opaque: u32,
    /// Assigned by the couchbase target just before transmit.
    pub vbucket: u16,
}

impl Command {
    pub fn new(opcode: Opcode, key: Bytes) -> Command {
        Command {
            opcode,
            key,
            flags: 0,
            expiration: 0,
            value: Bytes::new(),
            cas: 0,
            opaque: 0,
            vbucket: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    pub opcode: Opcode,
    pub status: Status,
    pub opaque: u32,
    pub key: Bytes,
    /// Raw extras bytes; for GET replies the first four are the item flags,
    /// big-endian.
    pub extras: Bytes,
    pub value: Bytes,
    pub cas: u64,
}

impl Response {
    /// A bare response echoing a command's opcode, opaque, and key. The
    /// drivers use this to synthesize replies on backend failure.
    pub fn reply_to(cmd: &Command, status: Status) -> Response {
        Response {
            opcode: cmd.opcode,
            status,
            opaque: cmd.opaque,
            key: cmd.key.clone(),
            extras: Bytes::new(),
            value: Bytes::new(),
            cas: 0,
        }
    }

    pub fn flags(&self) -> u32 {
        if self.extras.len() >= 4 {
            (&self.extras[..4]).get_u32()
        } else {
            0
        }
    }
}

/// Reply channel carried by each request. The pipeline performs exactly one
/// send per request; the owning source holds the receiver and may share one
/// channel across a batch (correlating by opaque).
pub type Reply = mpsc::Sender<Response>;

/// The unit of work flowing through the pipeline.
#[derive(Debug, Clone)]
pub struct Request {
    /// Logical namespace; targets that shard by bucket use it downstream.
    pub bucket: String,
    pub cmd: Command,
    pub reply: Reply,
    /// Ordinal assigned at accept time. Backend targets use it for resource
    /// affinity, such as processing a client's requests on the same
    /// connection as its previous ones; that is also what keeps ordering
    /// correct from the client's perspective.
    pub client_num: u32,
}

impl Request {
    /// Posts the one response this request is owed. A failed send means the
    /// owning source is gone; the response is dropped on the floor.
    pub async fn respond(&self, res: Response) {
        let _ = self.reply.send(res).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_wire_round_trip() {
        for op in [
            Opcode::Get,
            Opcode::Set,
            Opcode::Add,
            Opcode::Replace,
            Opcode::Append,
            Opcode::Prepend,
            Opcode::Delete,
            Opcode::Quit,
            Opcode::Version,
        ] {
            assert_eq!(Opcode::from_wire(op.wire_code()), Some(op));
        }
        assert_eq!(Opcode::from_wire(0x1c), None);
    }

    #[test]
    fn test_status_unknown_maps_to_einval() {
        assert_eq!(Status::from_wire(0x0086), Status::Einval);
        assert_eq!(Status::from_wire(Status::NotStored.wire_code()), Status::NotStored);
    }

    #[test]
    fn test_response_flags_from_extras() {
        let cmd = Command::new(Opcode::Get, Bytes::from_static(b"k"));
        let mut res = Response::reply_to(&cmd, Status::Success);
        assert_eq!(res.flags(), 0);
        res.extras = Bytes::from_static(&[0, 0, 0, 7]);
        assert_eq!(res.flags(), 7);
    }
}
