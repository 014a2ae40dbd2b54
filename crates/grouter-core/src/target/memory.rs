//! Trivial in-memory hash-table backend. Single worker, single lane; the
//! store map is owned by the worker task and never shared.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::config::Params;
use crate::request::{Command, Opcode, Request, Response, Status};
use crate::target::Target;

pub const MAX_CONCURRENCY: usize = 1;

#[derive(Debug, Clone)]
struct Item {
    flags: u32,
    #[allow(dead_code)]
    expiration: u32,
    cas: u64,
    data: Bytes,
}

pub fn start(params: &Params) -> Target {
    let (tx, rx) = mpsc::channel(params.target_chan_size.max(1));
    tokio::spawn(run(rx));
    Target::new(vec![tx])
}

async fn run(mut incoming: mpsc::Receiver<Vec<Request>>) {
    let mut store = Store::default();
    while let Some(reqs) = incoming.recv().await {
        for req in reqs {
            let res = store.apply(&req.cmd);
            req.respond(res).await;
        }
    }
}

#[derive(Default)]
struct Store {
    data: HashMap<Bytes, Item>,
    cas: u64,
}

impl Store {
    fn apply(&mut self, cmd: &Command) -> Response {
        match cmd.opcode {
            Opcode::Get => match self.data.get(&cmd.key) {
                Some(item) => {
                    let mut extras = BytesMut::with_capacity(4);
                    extras.put_u32(item.flags);
                    Response {
                        opcode: cmd.opcode,
                        status: Status::Success,
                        opaque: cmd.opaque,
                        key: cmd.key.clone(),
                        extras: extras.freeze(),
                        value: item.data.clone(),
                        cas: item.cas,
                    }
                }
                None => Response::reply_to(cmd, Status::KeyEnoent),
            },
            Opcode::Set => self.insert(cmd, cmd.value.clone()),
            Opcode::Add => {
                if self.data.contains_key(&cmd.key) {
                    Response::reply_to(cmd, Status::KeyEexists)
                } else {
                    self.insert(cmd, cmd.value.clone())
                }
            }
            Opcode::Replace => {
                if self.data.contains_key(&cmd.key) {
                    self.insert(cmd, cmd.value.clone())
                } else {
                    Response::reply_to(cmd, Status::KeyEnoent)
                }
            }
            Opcode::Append | Opcode::Prepend => match self.data.get(&cmd.key) {
                Some(item) => {
                    let mut joined = BytesMut::with_capacity(item.data.len() + cmd.value.len());
                    if cmd.opcode == Opcode::Append {
                        joined.put_slice(&item.data);
                        joined.put_slice(&cmd.value);
                    } else {
                        joined.put_slice(&cmd.value);
                        joined.put_slice(&item.data);
                    }
                    self.insert(cmd, joined.freeze())
                }
                None => Response::reply_to(cmd, Status::NotStored),
            },
            Opcode::Delete => {
                if self.data.remove(&cmd.key).is_some() {
                    Response::reply_to(cmd, Status::Success)
                } else {
                    Response::reply_to(cmd, Status::KeyEnoent)
                }
            }
            Opcode::Quit | Opcode::Version => Response::reply_to(cmd, Status::UnknownCommand),
        }
    }

    fn insert(&mut self, cmd: &Command, data: Bytes) -> Response {
        self.cas += 1;
        self.data.insert(
            cmd.key.clone(),
            Item {
                flags: cmd.flags,
                expiration: cmd.expiration,
                cas: self.cas,
                data,
            },
        );
        let mut res = Response::reply_to(cmd, Status::Success);
        res.cas = self.cas;
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(opcode: Opcode, key: &'static str) -> Command {
        Command::new(opcode, Bytes::from_static(key.as_bytes()))
    }

    #[test]
    fn test_get_miss_then_set_then_hit() {
        let mut store = Store::default();
        assert_eq!(store.apply(&cmd(Opcode::Get, "k")).status, Status::KeyEnoent);

        let mut set = cmd(Opcode::Set, "k");
        set.flags = 7;
        set.value = Bytes::from_static(b"hello");
        let res = store.apply(&set);
        assert_eq!(res.status, Status::Success);
        assert_eq!(res.cas, 1);

        let res = store.apply(&cmd(Opcode::Get, "k"));
        assert_eq!(res.status, Status::Success);
        assert_eq!(res.flags(), 7);
        assert_eq!(&res.value[..], b"hello");
        assert_eq!(res.cas, 1);
    }

    #[test]
    fn test_cas_is_monotonic_across_mutations() {
        let mut store = Store::default();
        let mut set = cmd(Opcode::Set, "k");
        set.value = Bytes::from_static(b"a");
        assert_eq!(store.apply(&set).cas, 1);
        assert_eq!(store.apply(&set).cas, 2);
        let mut app = cmd(Opcode::Append, "k");
        app.value = Bytes::from_static(b"b");
        assert_eq!(store.apply(&app).cas, 3);
        assert_eq!(&store.apply(&cmd(Opcode::Get, "k")).value[..], b"ab");
    }

    #[test]
    fn test_add_replace_semantics() {
        let mut store = Store::default();
        let mut add = cmd(Opcode::Add, "k");
        add.value = Bytes::from_static(b"v");
        assert_eq!(store.apply(&add).status, Status::Success);
        assert_eq!(store.apply(&add).status, Status::KeyEexists);

        let mut rep = cmd(Opcode::Replace, "missing");
        rep.value = Bytes::from_static(b"v");
        assert_eq!(store.apply(&rep).status, Status::KeyEnoent);
    }

    #[test]
    fn test_append_prepend_missing_not_stored() {
        let mut store = Store::default();
        let mut app = cmd(Opcode::Prepend, "k");
        app.value = Bytes::from_static(b"x");
        assert_eq!(store.apply(&app).status, Status::NotStored);
    }

    #[test]
    fn test_delete() {
        let mut store = Store::default();
        let mut set = cmd(Opcode::Set, "k");
        set.value = Bytes::from_static(b"v");
        store.apply(&set);
        assert_eq!(store.apply(&cmd(Opcode::Delete, "k")).status, Status::Success);
        assert_eq!(
            store.apply(&cmd(Opcode::Delete, "k")).status,
            Status::KeyEnoent
        );
        assert_eq!(store.apply(&cmd(Opcode::Get, "k")).status, Status::KeyEnoent);
    }

    #[test]
    fn test_unroutable_opcode_is_unknown_command() {
        let mut store = Store::default();
        assert_eq!(
            store.apply(&cmd(Opcode::Version, "")).status,
            Status::UnknownCommand
        );
    }
}
