// trellis_protocol: wire protocol for the Trellis session relay.
//
// This crate defines the identifiers, control messages, handshake and framing
// used by the relay (`trellis_relay`) and its clients. It is shared between
// both sides and owns no sockets or threads.
//
// Module overview:
// - `types.rs`:     `ClientIdentity`, `JoinCode`, `DeliveryClass`.
// - `message.rs`:   `ControlMessage` and its fixed binary layout (the control
//                   codec): kind byte, author identity, raw payload.
// - `handshake.rs`: `JoinRequest` / `JoinResponse`, exchanged once at connect.
// - `framing.rs`:   Length-delimited frames over any `Read`/`Write` stream,
//                   tagged with a delivery class, plus ping/pong frames.
// - `error.rs`:     `ProtocolError`.
//
// Design decisions:
// - **Payloads are opaque `Vec<u8>`.** The relay forwards them untouched and
//   only rewrites the author field.
// - **No length prefix inside control messages.** The frame already bounds
//   the message, so the payload is simply the remainder.
// - **No async runtime.** Framing works on `std::io::Read`/`Write`.

pub mod error;
pub mod framing;
pub mod handshake;
pub mod message;
pub mod types;

pub use error::ProtocolError;
pub use framing::{Frame, MAX_MESSAGE_SIZE, read_frame, write_frame};
pub use handshake::{JoinRequest, JoinResponse, JoinRole, PROTOCOL_VERSION, RejectReason};
pub use message::{ControlKind, ControlMessage, HEADER_LEN, UnknownKind};
pub use types::{ClientIdentity, DeliveryClass, JOIN_CODE_ALPHABET, JoinCode};

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Encode a control message, frame it, read it back, decode it.
    fn framed_roundtrip(msg: &ControlMessage, class: DeliveryClass) {
        let mut wire = Vec::new();
        write_frame(
            &mut wire,
            &Frame::Message {
                class,
                payload: msg.encode(),
            },
        )
        .unwrap();

        let mut cursor = Cursor::new(&wire);
        match read_frame(&mut cursor).unwrap() {
            Frame::Message {
                class: got_class,
                payload,
            } => {
                assert_eq!(got_class, class);
                assert_eq!(&ControlMessage::decode(&payload).unwrap(), msg);
            }
            other => panic!("expected message frame, got {other:?}"),
        }
    }

    #[test]
    fn data_over_every_class() {
        for class in DeliveryClass::ALL {
            framed_roundtrip(
                &ControlMessage::data(ClientIdentity(12), vec![9, 8, 7]),
                class,
            );
        }
    }

    #[test]
    fn lifecycle_announcements() {
        framed_roundtrip(
            &ControlMessage::connected(ClientIdentity(1)),
            DeliveryClass::ReliableOrdered,
        );
        framed_roundtrip(
            &ControlMessage::disconnected(ClientIdentity::HOST),
            DeliveryClass::ReliableOrdered,
        );
    }

    #[test]
    fn handshake_then_control_on_one_stream() {
        let request = JoinRequest::new(JoinCode::parse("LOBBY").unwrap(), JoinRole::Client);
        let mut wire = Vec::new();
        write_frame(
            &mut wire,
            &Frame::Message {
                class: DeliveryClass::ReliableOrdered,
                payload: request.to_bytes().unwrap(),
            },
        )
        .unwrap();
        write_frame(
            &mut wire,
            &Frame::Message {
                class: DeliveryClass::Unreliable,
                payload: ControlMessage::data(ClientIdentity(0), vec![1]).encode(),
            },
        )
        .unwrap();

        let mut cursor = Cursor::new(&wire);
        let Frame::Message { payload, .. } = read_frame(&mut cursor).unwrap() else {
            panic!("expected handshake frame");
        };
        assert_eq!(JoinRequest::from_bytes(&payload).unwrap(), request);
        let Frame::Message { class, payload } = read_frame(&mut cursor).unwrap() else {
            panic!("expected control frame");
        };
        assert_eq!(class, DeliveryClass::Unreliable);
        assert_eq!(ControlMessage::decode(&payload).unwrap().payload, vec![1]);
    }
}
