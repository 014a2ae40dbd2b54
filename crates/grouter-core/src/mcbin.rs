//! Minimal memcached binary protocol client: 24-byte big-endian headers,
//! extras/key/value body layout. Transmit and receive are split so callers
//! can pipeline a run of requests before reading any replies.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use crate::request::{Command, Opcode, Response, Status};

pub const HEADER_LEN: usize = 24;

const REQUEST_MAGIC: u8 = 0x80;
const RESPONSE_MAGIC: u8 = 0x81;

/// Serializes one request packet into `buf`. Mutations carry an 8-byte
/// flags+expiration extras block; everything else goes extras-free.
pub fn encode_request(cmd: &Command, buf: &mut BytesMut) {
    let extras_len: u8 = if cmd.opcode.is_mutation() { 8 } else { 0 };
    let total_body = extras_len as usize + cmd.key.len() + cmd.value.len();

    buf.reserve(HEADER_LEN + total_body);
    buf.put_u8(REQUEST_MAGIC);
    buf.put_u8(cmd.opcode.wire_code());
    buf.put_u16(cmd.key.len() as u16);
    buf.put_u8(extras_len);
    buf.put_u8(0); // data type
    buf.put_u16(cmd.vbucket);
    buf.put_u32(total_body as u32);
    buf.put_u32(cmd.opaque);
    buf.put_u64(cmd.cas);
    if extras_len > 0 {
        buf.put_u32(cmd.flags);
        buf.put_u32(cmd.expiration);
    }
    buf.put_slice(&cmd.key);
    buf.put_slice(&cmd.value);
}

/// Parses a full response packet (header already validated to be
/// `HEADER_LEN` bytes, body exactly as long as the header says).
pub fn decode_response(header: &[u8], body: &[u8]) -> io::Result<Response> {
    let mut h = header;
    let magic = h.get_u8();
    if magic != RESPONSE_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad response magic: {:#04x}", magic),
        ));
    }
    let opcode_byte = h.get_u8();
    let key_len = h.get_u16() as usize;
    let extras_len = h.get_u8() as usize;
    let _data_type = h.get_u8();
    let status = Status::from_wire(h.get_u16());
    let total_body = h.get_u32() as usize;
    let opaque = h.get_u32();
    let cas = h.get_u64();

    if body.len() != total_body || extras_len + key_len > total_body {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "response body length mismatch",
        ));
    }
    let opcode = Opcode::from_wire(opcode_byte).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown response opcode: {:#04x}", opcode_byte),
        )
    })?;

    let body = Bytes::copy_from_slice(body);
    let extras = body.slice(..extras_len);
    let key = body.slice(extras_len..extras_len + key_len);
    let value = body.slice(extras_len + key_len..);

    Ok(Response {
        opcode,
        status,
        opaque,
        key,
        extras,
        value,
        cas,
    })
}

/// One binary-protocol connection, owned by exactly one worker task.
pub struct BinClient<S = TcpStream> {
    stream: BufStream<S>,
}

impl BinClient<TcpStream> {
    pub async fn connect(addr: &str) -> anyhow::Result<BinClient<TcpStream>> {
        let stream = TcpStream::connect(addr).await?;
        Ok(BinClient::from_stream(stream))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> BinClient<S> {
    pub fn from_stream(stream: S) -> BinClient<S> {
        BinClient {
            stream: BufStream::new(stream),
        }
    }

    /// Queues one request packet on the buffered stream without flushing.
    pub async fn transmit(&mut self, cmd: &Command) -> io::Result<()> {
        let mut buf = BytesMut::new();
        encode_request(cmd, &mut buf);
        self.stream.write_all(&buf).await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.stream.flush().await
    }

    /// Reads exactly one response packet.
    pub async fn receive(&mut self) -> io::Result<Response> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header).await?;
        let total_body = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
        let mut body = vec![0u8; total_body];
        self.stream.read_exact(&mut body).await?;
        decode_response(&header, &body)
    }

    /// Issues one request and waits for its reply.
    pub async fn send(&mut self, cmd: &Command) -> io::Result<Response> {
        self.transmit(cmd).await?;
        self.flush().await?;
        self.receive().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request_layout() {
        let mut cmd = Command::new(Opcode::Set, Bytes::from_static(b"key"));
        cmd.flags = 7;
        cmd.expiration = 9;
        cmd.value = Bytes::from_static(b"hello");
        cmd.opaque = 0xdeadbeef;
        cmd.vbucket = 21;

        let mut buf = BytesMut::new();
        encode_request(&cmd, &mut buf);

        assert_eq!(buf.len(), HEADER_LEN + 8 + 3 + 5);
        assert_eq!(buf[0], REQUEST_MAGIC);
        assert_eq!(buf[1], Opcode::Set.wire_code());
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 3); // key len
        assert_eq!(buf[4], 8); // extras len
        assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), 21); // vbucket
        assert_eq!(u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]), 16);
        assert_eq!(
            u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            0xdeadbeef
        );
        assert_eq!(&buf[HEADER_LEN + 8..HEADER_LEN + 11], b"key");
        assert_eq!(&buf[HEADER_LEN + 11..], b"hello");
    }

    #[test]
    fn test_decode_response_get_hit() {
        // RESPONSE_MAGIC, GET, no key, 4 extras bytes (flags), status 0.
        let mut header = BytesMut::new();
        header.put_u8(RESPONSE_MAGIC);
        header.put_u8(Opcode::Get.wire_code());
        header.put_u16(0);
        header.put_u8(4);
        header.put_u8(0);
        header.put_u16(Status::Success.wire_code());
        header.put_u32(4 + 5);
        header.put_u32(77);
        header.put_u64(3);

        let mut body = BytesMut::new();
        body.put_u32(42); // flags
        body.put_slice(b"world");

        let res = decode_response(&header, &body).unwrap();
        assert_eq!(res.status, Status::Success);
        assert_eq!(res.opaque, 77);
        assert_eq!(res.cas, 3);
        assert_eq!(res.flags(), 42);
        assert_eq!(&res.value[..], b"world");
    }

    #[test]
    fn test_decode_response_rejects_request_magic() {
        let mut header = vec![0u8; HEADER_LEN];
        header[0] = REQUEST_MAGIC;
        assert!(decode_response(&header, &[]).is_err());
    }

    #[tokio::test]
    async fn test_client_round_trip_over_duplex() {
        let (client_side, mut server_side) = tokio::io::duplex(4096);
        let mut client = BinClient::from_stream(client_side);

        let server = tokio::spawn(async move {
            let mut header = [0u8; HEADER_LEN];
            server_side.read_exact(&mut header).await.unwrap();
            let total =
                u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
            let mut body = vec![0u8; total];
            server_side.read_exact(&mut body).await.unwrap();
            assert_eq!(header[1], Opcode::Get.wire_code());

            // Miss reply echoing the opaque.
            let mut out = BytesMut::new();
            out.put_u8(RESPONSE_MAGIC);
            out.put_u8(header[1]);
            out.put_u16(0);
            out.put_u8(0);
            out.put_u8(0);
            out.put_u16(Status::KeyEnoent.wire_code());
            out.put_u32(0);
            out.put_slice(&header[12..16]);
            out.put_u64(0);
            server_side.write_all(&out).await.unwrap();
        });

        let mut cmd = Command::new(Opcode::Get, Bytes::from_static(b"missing"));
        cmd.opaque = 31337;
        let res = client.send(&cmd).await.unwrap();
        assert_eq!(res.status, Status::KeyEnoent);
        assert_eq!(res.opaque, 31337);
        server.await.unwrap();
    }
}
