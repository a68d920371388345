// Length-delimited frame format for the stream transport.
//
// Each frame is a 4-byte big-endian length, a 1-byte tag, then the body. The
// length counts the tag and the body. Tags:
//
//   0..=3  message frame on the delivery class with that byte (`types.rs`)
//   0x10   ping, body = 8-byte big-endian sender timestamp (microseconds)
//   0x11   pong, body = the timestamp echoed back
//
// Message frames carry handshake JSON or encoded control messages; this
// module does not care which. Ping/pong are answered by the link layer and
// never reach the session.
//
// A `MAX_MESSAGE_SIZE` constant (16 MB) protects against unbounded allocation
// from malformed or malicious length prefixes.

use std::io::{self, Read, Write};

use crate::types::DeliveryClass;

/// Maximum allowed frame size, tag included.
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

const TAG_PING: u8 = 0x10;
const TAG_PONG: u8 = 0x11;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Message {
        class: DeliveryClass,
        payload: Vec<u8>,
    },
    Ping { stamp: u64 },
    Pong { stamp: u64 },
}

/// Write one frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> io::Result<()> {
    match frame {
        Frame::Message { class, payload } => write_raw(writer, class.to_byte(), payload),
        Frame::Ping { stamp } => write_raw(writer, TAG_PING, &stamp.to_be_bytes()),
        Frame::Pong { stamp } => write_raw(writer, TAG_PONG, &stamp.to_be_bytes()),
    }
}

fn write_raw<W: Write>(writer: &mut W, tag: u8, body: &[u8]) -> io::Result<()> {
    let len = body.len() + 1;
    if len > MAX_MESSAGE_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    #[expect(clippy::cast_possible_truncation)]
    let len_bytes = (len as u32).to_be_bytes();
    writer.write_all(&len_bytes)?;
    writer.write_all(&[tag])?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame.
///
/// Returns `UnexpectedEof` if the stream closes cleanly before or during a
/// frame, and `InvalidData` for an empty or oversized length or unknown tag.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Frame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "empty frame"));
    }
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes (max {MAX_MESSAGE_SIZE})"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    let tag = buf[0];
    let body = buf.split_off(1);

    match tag {
        TAG_PING | TAG_PONG => {
            let stamp: [u8; 8] = body.as_slice().try_into().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "bad ping/pong body")
            })?;
            let stamp = u64::from_be_bytes(stamp);
            Ok(if tag == TAG_PING {
                Frame::Ping { stamp }
            } else {
                Frame::Pong { stamp }
            })
        }
        other => match DeliveryClass::from_byte(other) {
            Some(class) => Ok(Frame::Message {
                class,
                payload: body,
            }),
            None => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame tag {other:#04x}"),
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn message(class: DeliveryClass, payload: &[u8]) -> Frame {
        Frame::Message {
            class,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn roundtrip_simple_message() {
        let original = message(DeliveryClass::ReliableOrdered, b"hello, relay!");
        let mut buf = Vec::new();
        write_frame(&mut buf, &original).unwrap();

        let mut cursor = Cursor::new(&buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), original);
    }

    #[test]
    fn roundtrip_empty_message() {
        let original = message(DeliveryClass::Unreliable, b"");
        let mut buf = Vec::new();
        write_frame(&mut buf, &original).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 1, 0]);

        let mut cursor = Cursor::new(&buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), original);
    }

    #[test]
    fn ping_and_pong_keep_stamp() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::Ping { stamp: 123_456 }).unwrap();
        write_frame(&mut buf, &Frame::Pong { stamp: 7 }).unwrap();

        let mut cursor = Cursor::new(&buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), Frame::Ping { stamp: 123_456 });
        assert_eq!(read_frame(&mut cursor).unwrap(), Frame::Pong { stamp: 7 });
    }

    #[test]
    fn rejects_oversized_write() {
        let big = vec![0u8; MAX_MESSAGE_SIZE as usize];
        let mut buf = Vec::new();
        let err = write_frame(&mut buf, &message(DeliveryClass::Sequenced, &big)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn rejects_oversized_read() {
        let fake_len = (MAX_MESSAGE_SIZE + 1).to_be_bytes();
        let mut cursor = Cursor::new(fake_len.to_vec());
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn rejects_unknown_tag() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 2, 0x7F, 1]);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn read_unexpected_eof() {
        // Only 2 bytes when 4 are needed for the length prefix.
        let mut cursor = Cursor::new(vec![0u8, 1]);
        let err = read_frame(&mut cursor).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn multiple_frames_in_sequence() {
        let frames = vec![
            message(DeliveryClass::Unreliable, b"first"),
            Frame::Ping { stamp: 1 },
            message(DeliveryClass::ReliableUnordered, b"third"),
        ];
        let mut buf = Vec::new();
        for frame in &frames {
            write_frame(&mut buf, frame).unwrap();
        }

        let mut cursor = Cursor::new(&buf);
        for expected in &frames {
            assert_eq!(&read_frame(&mut cursor).unwrap(), expected);
        }
    }
}
