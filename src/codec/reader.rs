use bytes::Buf;
#[cfg(test)] use mockall::automock;
use tracing::trace;

use super::{Ack, CodecError, Data, Handshake, Integrity, Message, MessageType, Pong, Request, SignedIntegrity, StreamAddress};
use binmap::Bin;

/// Sizes of variable length message fields that are not self-describing on the wire. They
///  are fixed per swarm.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageSizes {
    pub chunk_size: usize,
    pub hash_size: usize,
    pub signature_size: usize,
}

/// Receiver of decoded messages. A failure is fatal for the channel the messages arrived on.
#[cfg_attr(test, automock)]
pub trait MessageHandler {
    fn handle_handshake(&mut self, msg: Handshake) -> anyhow::Result<()>;
    fn handle_restart(&mut self) -> anyhow::Result<()>;
    fn handle_data(&mut self, msg: Data) -> anyhow::Result<()>;
    fn handle_ack(&mut self, msg: Ack) -> anyhow::Result<()>;
    fn handle_have(&mut self, bin: Bin) -> anyhow::Result<()>;
    fn handle_integrity(&mut self, msg: Integrity) -> anyhow::Result<()>;
    fn handle_signed_integrity(&mut self, msg: SignedIntegrity) -> anyhow::Result<()>;
    fn handle_request(&mut self, msg: Request) -> anyhow::Result<()>;
    fn handle_cancel(&mut self, bin: Bin) -> anyhow::Result<()>;
    fn handle_choke(&mut self) -> anyhow::Result<()>;
    fn handle_unchoke(&mut self) -> anyhow::Result<()>;
    fn handle_ping(&mut self, nonce: u64) -> anyhow::Result<()>;
    fn handle_pong(&mut self, msg: Pong) -> anyhow::Result<()>;
    fn handle_stream_request(&mut self, msg: StreamAddress) -> anyhow::Result<()>;
    fn handle_stream_cancel(&mut self, stream: u16) -> anyhow::Result<()>;
    fn handle_stream_open(&mut self, msg: StreamAddress) -> anyhow::Result<()>;
    fn handle_stream_close(&mut self, stream: u16) -> anyhow::Result<()>;
}

/// Decodes the messages of one channel frame and dispatches them to a [MessageHandler]
#[derive(Clone, Copy, Debug)]
pub struct Reader {
    sizes: MessageSizes,
}

impl Reader {
    pub fn new(sizes: MessageSizes) -> Reader {
        Reader { sizes }
    }

    pub fn sizes(&self) -> &MessageSizes {
        &self.sizes
    }

    /// Reads messages until an End message or the end of the buffer. Returns the number of
    ///  messages that were dispatched.
    pub fn read(&self, buf: &mut impl Buf, handler: &mut dyn MessageHandler) -> anyhow::Result<usize> {
        let mut count = 0;
        while buf.has_remaining() {
            let raw = buf.get_u8();
            let message_type = MessageType::try_from(raw)
                .map_err(|_| CodecError::UnsupportedMessageType(raw))?;
            if message_type == MessageType::End {
                break;
            }

            let msg = Message::deser(message_type, buf, &self.sizes)?;
            trace!("received {:?}", msg);
            Self::dispatch(msg, handler)?;
            count += 1;
        }
        Ok(count)
    }

    fn dispatch(msg: Message, handler: &mut dyn MessageHandler) -> anyhow::Result<()> {
        match msg {
            Message::Handshake(m) => handler.handle_handshake(m),
            Message::Data(m) => handler.handle_data(m),
            Message::Ack(m) => handler.handle_ack(m),
            Message::Have(b) => handler.handle_have(b),
            Message::Integrity(m) => handler.handle_integrity(m),
            Message::SignedIntegrity(m) => handler.handle_signed_integrity(m),
            Message::Request(m) => handler.handle_request(m),
            Message::Cancel(b) => handler.handle_cancel(b),
            Message::Choke => handler.handle_choke(),
            Message::Unchoke => handler.handle_unchoke(),
            Message::Ping(nonce) => handler.handle_ping(nonce),
            Message::Pong(m) => handler.handle_pong(m),
            Message::StreamRequest(m) => handler.handle_stream_request(m),
            Message::StreamCancel(s) => handler.handle_stream_cancel(s),
            Message::StreamOpen(m) => handler.handle_stream_open(m),
            Message::StreamClose(s) => handler.handle_stream_close(s),
            Message::Restart => handler.handle_restart(),
            Message::End => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Timestamp;
    use bytes::{Bytes, BytesMut};
    use mockall::predicate::eq;
    use mockall::Sequence;

    const SIZES: MessageSizes = MessageSizes {
        chunk_size: 2,
        hash_size: 4,
        signature_size: 8,
    };

    fn encode(messages: &[Message]) -> Bytes {
        let mut buf = BytesMut::new();
        for m in messages {
            m.ser(&mut buf);
        }
        buf.freeze()
    }

    #[test]
    fn test_dispatch_in_order() {
        let mut buf = encode(&[
            Message::Have(Bin(7)),
            Message::Data(Data { address: Bin(2), timestamp: Timestamp::from_millis(3), data: Bytes::from_static(b"xy") }),
            Message::Ping(5),
            Message::Choke,
        ]);

        let mut handler = MockMessageHandler::new();
        let mut seq = Sequence::new();
        handler.expect_handle_have()
            .with(eq(Bin(7)))
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        handler.expect_handle_data()
            .withf(|d| d.address == Bin(2) && &d.data[..] == b"xy")
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        handler.expect_handle_ping()
            .with(eq(5))
            .once()
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        handler.expect_handle_choke()
            .once()
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        let reader = Reader::new(SIZES);
        assert_eq!(reader.read(&mut buf, &mut handler).unwrap(), 4);
    }

    #[test]
    fn test_stops_at_end() {
        let mut buf = encode(&[Message::Have(Bin(1)), Message::End, Message::Have(Bin(3))]);

        let mut handler = MockMessageHandler::new();
        handler.expect_handle_have()
            .with(eq(Bin(1)))
            .once()
            .returning(|_| Ok(()));

        let reader = Reader::new(SIZES);
        assert_eq!(reader.read(&mut buf, &mut handler).unwrap(), 1);
        assert!(buf.has_remaining());
    }

    #[test]
    fn test_unsupported_message_type() {
        let mut buf = Bytes::from_static(&[42, 0, 0]);
        let mut handler = MockMessageHandler::new();

        let err = Reader::new(SIZES).read(&mut buf, &mut handler).unwrap_err();
        assert_eq!(err.downcast_ref::<CodecError>(), Some(&CodecError::UnsupportedMessageType(42)));
    }

    #[test]
    fn test_handler_error_aborts() {
        let mut buf = encode(&[Message::Unchoke, Message::Choke]);

        let mut handler = MockMessageHandler::new();
        handler.expect_handle_unchoke()
            .once()
            .returning(|| Err(anyhow::anyhow!("nope")));

        assert!(Reader::new(SIZES).read(&mut buf, &mut handler).is_err());
    }
}
