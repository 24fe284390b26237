//! Framed codec for packet communication.
//!
//! Frames are fixed-size, so no length prefix is needed: every
//! [`PACKET_SIZE`] bytes is one packet. Works over any AsyncRead/AsyncWrite
//! (pipes, FIFOs, sockets).

use std::io;

use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{PACKET_SIZE, Packet, ProtocolError};

/// Codec that splits a byte stream into fixed-size packets.
///
/// A frame with a bad tag is consumed and surfaced as `Ok(Some(Err(..)))` so
/// the reader can log and drop it without tearing down the stream. Only real
/// I/O failures end the stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct PacketCodec;

impl PacketCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for PacketCodec {
    type Item = Result<Packet, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < PACKET_SIZE {
            src.reserve(PACKET_SIZE - src.len());
            return Ok(None);
        }

        let mut frame = [0u8; PACKET_SIZE];
        frame.copy_from_slice(&src[..PACKET_SIZE]);
        src.advance(PACKET_SIZE);

        Ok(Some(Packet::decode(&frame)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => {
                let trailing = src.len();
                src.clear();
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream closed with {} bytes of a partial packet", trailing),
                ))
            }
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        tracing::trace!(packet = %item, "Encoding packet");
        dst.extend_from_slice(&item.encode());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::PacketTag;

    #[test]
    fn codec_roundtrip_range() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();

        let packet = Packet::Range {
            start: 1,
            end: 1000,
        };
        codec.encode(packet, &mut buf).unwrap();
        assert_eq!(buf.len(), PACKET_SIZE);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Ok(packet));
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = PacketCodec::new();
        let bytes = Packet::PerfNum { value: 496 }.encode();

        let mut buf = BytesMut::from(&bytes[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&bytes[5..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Ok(Packet::PerfNum { value: 496 }))
        );
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Packet::PerfNum { value: 6 }, &mut buf).unwrap();
        codec.encode(Packet::PerfNum { value: 28 }, &mut buf).unwrap();
        codec.encode(Packet::Done { pid: 99 }, &mut buf).unwrap();

        let mut seen = Vec::new();
        while let Some(frame) = codec.decode(&mut buf).unwrap() {
            seen.push(frame.unwrap());
        }

        assert_eq!(
            seen,
            vec![
                Packet::PerfNum { value: 6 },
                Packet::PerfNum { value: 28 },
                Packet::Done { pid: 99 },
            ]
        );
    }

    #[test]
    fn bad_frame_is_consumed_and_stream_continues() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&[0u8; PACKET_SIZE][..]);
        buf.extend_from_slice(&Packet::Kill.encode());

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Err(ProtocolError::Null))
        );
        let next = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(next.tag(), PacketTag::Kill);
    }

    #[test]
    fn truncated_frame_at_eof_is_an_error() {
        let mut codec = PacketCodec::new();
        let mut buf = BytesMut::from(&Packet::Accept.encode()[..7]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
