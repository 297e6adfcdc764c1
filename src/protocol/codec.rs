use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Error, PROTOCOL_VERSION};
use super::message::Announcement;

/// Bincode codec for announcements on a byte transport. Frames are a
/// protocol version byte, a big-endian length, and the encoded value;
/// frames from a different protocol version are rejected.
#[derive(Clone, Default)]
pub struct AnnouncementCodec;

impl AnnouncementCodec {
    /// Creates a new announcement codec
    pub fn new() -> Self {
        AnnouncementCodec
    }
}

impl Decoder for AnnouncementCodec {
    type Item = Announcement;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 5 {
            // Need more data to read version and frame length
            return Ok(None);
        }

        let version = src[0];
        if version != PROTOCOL_VERSION {
            return Err(Error::protocol(format!(
                "protocol version mismatch: got {}, expected {}",
                version, PROTOCOL_VERSION
            )));
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[1..5]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if src.len() < 5 + length {
            // Need more data to read the full frame
            return Ok(None);
        }

        src.advance(5);
        let frame_bytes = src.split_to(length);

        match bincode::deserialize(&frame_bytes) {
            Ok(announcement) => Ok(Some(announcement)),
            Err(e) => Err(Error::protocol(format!(
                "Failed to deserialize announcement: {}",
                e
            ))),
        }
    }
}

impl Encoder<Announcement> for AnnouncementCodec {
    type Error = Error;

    fn encode(&mut self, item: Announcement, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = bincode::serialize(&item)
            .map_err(|e| Error::protocol(format!("Failed to serialize announcement: {}", e)))?;

        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u32(bytes.len() as u32);
        dst.extend_from_slice(&bytes);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeAddr;
    use crate::protocol::message::{AnnouncementValue, Channel, TimesyncFrame};
    use bytes::BytesMut;

    fn sample() -> Announcement {
        Announcement {
            channel: Channel::Revelation,
            from: NodeAddr(17),
            value: AnnouncementValue {
                instr: 2,
                degree: 5,
                date_coarse: 12,
                date_fine: 40_000,
                ref_addr: NodeAddr(9),
                cons_rate: 0.0003,
            },
            frame: TimesyncFrame {
                coarse_now: 12,
                fine_offset: 62_500,
                clock_rate: 1.0002,
                avg_rate: -0.0001,
                ta: 39_980,
                tb: 39_980,
                hw_mac_timestamp: 39_995,
            },
        }
    }

    #[test]
    fn test_codec_round_trip() {
        let mut codec = AnnouncementCodec::new();
        let mut bytes = BytesMut::new();

        let announcement = sample();
        codec.encode(announcement.clone(), &mut bytes).unwrap();

        let decoded = codec.decode(&mut bytes).unwrap().unwrap();
        assert_eq!(decoded, announcement);
        assert!(bytes.is_empty());
    }

    #[test]
    fn test_codec_rejects_version_mismatch() {
        let mut codec = AnnouncementCodec::new();
        let mut bytes = BytesMut::new();
        codec.encode(sample(), &mut bytes).unwrap();

        bytes[0] = PROTOCOL_VERSION.wrapping_add(1);
        let err = codec.decode(&mut bytes).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_codec_partial_frame() {
        let mut codec = AnnouncementCodec::new();
        let mut bytes = BytesMut::new();
        codec.encode(sample(), &mut bytes).unwrap();

        // withhold the last byte
        let tail = bytes.split_off(bytes.len() - 1);
        assert!(codec.decode(&mut bytes).unwrap().is_none());

        bytes.unsplit(tail);
        assert!(codec.decode(&mut bytes).unwrap().is_some());
    }
}
