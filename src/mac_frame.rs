//! The three frame shapes of the ranging protocol, with encoding and decoding.
//!
//! Every frame is one of:
//!
//! ```norust
//! blink:      C5 | seq | src EUI (8, LE) | src short (2, LE)
//! short-MAC:  41 88 | seq | PAN (2) | dest short (2) | src short (2) | kind | payload
//! long-MAC:   41 8C | seq | PAN (2) | dest EUI (8)   | src short (2) | kind
//! ```
//!
//! `41 88` / `41 8C` are the IEEE 802.15.4 frame-control words for a
//! PAN-compressed data frame with short/short and extended/short addressing;
//! `C5` is the blink frame of the tag discovery phase. All multi-byte fields
//! are little-endian.

use crate::{Eui, ShortAddress};
use modular_bitfield::prelude::*;

/// Header bytes of a short-MAC frame; the message kind byte follows.
pub const SHORT_MAC_LEN: usize = 9;

/// Header bytes of a long-MAC frame; the message kind byte follows.
pub const LONG_MAC_LEN: usize = 15;

/// Total length of a blink frame (it carries no kind byte).
pub const BLINK_LEN: usize = 12;

/// First byte of a blink frame.
pub const FC_BLINK: u8 = 0xC5;

const FRAME_TYPE_DATA: u8 = 0b001;
const ADDR_MODE_SHORT: u8 = 0b10;
const ADDR_MODE_EXTENDED: u8 = 0b11;

/// IEEE 802.15.4 frame-control word.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameControl {
    pub frame_type: B3,
    pub security_enabled: bool,
    pub frame_pending: bool,
    pub ack_request: bool,
    pub pan_id_compression: bool,
    pub reserved: B3,
    pub dest_addr_mode: B2,
    pub frame_version: B2,
    pub src_addr_mode: B2,
}

impl FrameControl {
    /// `41 88`: data, PAN compressed, short dest, short src.
    pub fn short_mac() -> Self {
        FrameControl::new()
            .with_frame_type(FRAME_TYPE_DATA)
            .with_pan_id_compression(true)
            .with_dest_addr_mode(ADDR_MODE_SHORT)
            .with_src_addr_mode(ADDR_MODE_SHORT)
    }

    /// `41 8C`: data, PAN compressed, extended dest, short src.
    pub fn long_mac() -> Self {
        FrameControl::new()
            .with_frame_type(FRAME_TYPE_DATA)
            .with_pan_id_compression(true)
            .with_dest_addr_mode(ADDR_MODE_EXTENDED)
            .with_src_addr_mode(ADDR_MODE_SHORT)
    }
}

/// Message kinds as carried in the kind byte (blink is implied by its
/// frame shape and has no kind byte of its own).
#[repr(u8)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Poll = 0,
    PollAck = 1,
    Range = 2,
    RangeReport = 3,
    Blink = 4,
    RangingInit = 5,
    RangeFailed = 255,
}

impl MessageKind {
    /// The wire code (also the value `protocol_error` reports for an
    /// unexpected message).
    pub const fn code(self) -> u8 {
        self as u8
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownMessageKind {
    pub code: u8,
}

impl TryFrom<u8> for MessageKind {
    type Error = UnknownMessageKind;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        use MessageKind::*;
        Ok(match code {
            0 => Poll,
            1 => PollAck,
            2 => Range,
            3 => RangeReport,
            4 => Blink,
            5 => RangingInit,
            255 => RangeFailed,
            _ => return Err(UnknownMessageKind { code }),
        })
    }
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    TooShort { have: usize, need: usize },
    /// Leading byte(s) match none of the three frame shapes.
    UnrecognisedHeader { byte: u8 },
    UnknownKind { code: u8 },
}

impl From<UnknownMessageKind> for DecodeError {
    fn from(other: UnknownMessageKind) -> Self {
        DecodeError::UnknownKind { code: other.code }
    }
}

/// Where a frame is addressed.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDest {
    Short(ShortAddress),
    Extended(Eui),
    /// Blink frames carry no destination.
    Unaddressed,
}

/// Outcome of [`decode`]: enough of the header to route the frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMeta {
    pub kind: MessageKind,
    pub src: ShortAddress,
    pub dest: FrameDest,
    /// Offset of the first payload byte.
    pub payload_offset: usize,
}

fn check_len(frame: &[u8], need: usize) -> Result<(), DecodeError> {
    let have = frame.len();
    if have < need {
        return Err(DecodeError::TooShort { have, need });
    }
    Ok(())
}

/// Classifies a received frame and extracts kind, source and destination.
///
/// There is deliberately no fall-through: a frame matching none of the
/// shapes is an error for the caller to drop, never a default kind.
pub fn decode(frame: &[u8]) -> Result<FrameMeta, DecodeError> {
    check_len(frame, 1)?;
    match frame[0] {
        FC_BLINK => {
            check_len(frame, BLINK_LEN)?;
            Ok(FrameMeta {
                kind: MessageKind::Blink,
                src: ShortAddress::from_le_bytes(frame[10..12].try_into().unwrap()),
                dest: FrameDest::Unaddressed,
                payload_offset: BLINK_LEN,
            })
        }
        0x41 => {
            check_len(frame, 2)?;
            let fc = FrameControl::from_bytes(frame[0..2].try_into().unwrap());
            match fc.dest_addr_mode() {
                ADDR_MODE_SHORT => {
                    check_len(frame, SHORT_MAC_LEN + 1)?;
                    Ok(FrameMeta {
                        kind: MessageKind::try_from(frame[SHORT_MAC_LEN])?,
                        src: ShortAddress::from_le_bytes(frame[7..9].try_into().unwrap()),
                        dest: FrameDest::Short(ShortAddress::from_le_bytes(
                            frame[5..7].try_into().unwrap(),
                        )),
                        payload_offset: SHORT_MAC_LEN + 1,
                    })
                }
                ADDR_MODE_EXTENDED => {
                    check_len(frame, LONG_MAC_LEN + 1)?;
                    Ok(FrameMeta {
                        kind: MessageKind::try_from(frame[LONG_MAC_LEN])?,
                        src: ShortAddress::from_le_bytes(frame[13..15].try_into().unwrap()),
                        dest: FrameDest::Extended(Eui::from_le_bytes(
                            frame[5..13].try_into().unwrap(),
                        )),
                        payload_offset: LONG_MAC_LEN + 1,
                    })
                }
                _ => Err(DecodeError::UnrecognisedHeader { byte: frame[1] }),
            }
        }
        byte => Err(DecodeError::UnrecognisedHeader { byte }),
    }
}

/// Source identity carried by a blink frame.
pub fn decode_blink(frame: &[u8]) -> Result<(Eui, ShortAddress), DecodeError> {
    check_len(frame, BLINK_LEN)?;
    if frame[0] != FC_BLINK {
        return Err(DecodeError::UnrecognisedHeader { byte: frame[0] });
    }
    Ok((
        Eui::from_le_bytes(frame[2..10].try_into().unwrap()),
        ShortAddress::from_le_bytes(frame[10..12].try_into().unwrap()),
    ))
}

/// Fills `buf` with a blink frame; returns the frame length.
pub fn encode_blink(buf: &mut [u8], seq: u8, eui: &Eui, short: ShortAddress) -> usize {
    buf[0] = FC_BLINK;
    buf[1] = seq;
    buf[2..10].copy_from_slice(&eui.to_le_bytes());
    buf[10..12].copy_from_slice(&short.to_le_bytes());
    BLINK_LEN
}

/// Fills `buf` with a short-MAC header plus kind byte; returns the length
/// written so far (payload, if any, goes straight after).
pub fn encode_short_mac(
    buf: &mut [u8],
    seq: u8,
    pan_id: u16,
    dest: ShortAddress,
    src: ShortAddress,
    kind: MessageKind,
) -> usize {
    buf[0..2].copy_from_slice(&FrameControl::short_mac().into_bytes());
    buf[2] = seq;
    buf[3..5].copy_from_slice(&pan_id.to_le_bytes());
    buf[5..7].copy_from_slice(&dest.to_le_bytes());
    buf[7..9].copy_from_slice(&src.to_le_bytes());
    buf[SHORT_MAC_LEN] = kind.code();
    SHORT_MAC_LEN + 1
}

/// Fills `buf` with a complete RANGING_INIT frame (long-MAC, no payload);
/// returns the frame length.
pub fn encode_ranging_init(
    buf: &mut [u8],
    seq: u8,
    pan_id: u16,
    dest: &Eui,
    src: ShortAddress,
) -> usize {
    buf[0..2].copy_from_slice(&FrameControl::long_mac().into_bytes());
    buf[2] = seq;
    buf[3..5].copy_from_slice(&pan_id.to_le_bytes());
    buf[5..13].copy_from_slice(&dest.to_le_bytes());
    buf[13..15].copy_from_slice(&src.to_le_bytes());
    buf[LONG_MAC_LEN] = MessageKind::RangingInit.code();
    LONG_MAC_LEN + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DEFAULT_PAN_ID;

    #[test]
    fn frame_control_words() {
        assert_eq!(FrameControl::short_mac().into_bytes(), [0x41, 0x88]);
        assert_eq!(FrameControl::long_mac().into_bytes(), [0x41, 0x8C]);
    }

    #[test]
    fn short_mac_round_trip() {
        let mut buf = [0u8; 32];
        let n = encode_short_mac(
            &mut buf,
            7,
            DEFAULT_PAN_ID,
            ShortAddress(0x0101),
            ShortAddress(0x7D00),
            MessageKind::PollAck,
        );
        assert_eq!(n, SHORT_MAC_LEN + 1);
        assert_eq!(
            &buf[..n],
            // fc | seq | PAN DECA | dest 0101 | src 7D00 | POLL_ACK
            &[0x41, 0x88, 7, 0xCA, 0xDE, 0x01, 0x01, 0x00, 0x7D, 1]
        );

        let meta = decode(&buf[..n]).unwrap();
        assert_eq!(meta.kind, MessageKind::PollAck);
        assert_eq!(meta.src, ShortAddress(0x7D00));
        assert_eq!(meta.dest, FrameDest::Short(ShortAddress(0x0101)));
        assert_eq!(meta.payload_offset, SHORT_MAC_LEN + 1);
    }

    #[test]
    fn ranging_init_round_trip() {
        let tag: Eui = "7D:00:22:EA:82:60:3B:9C".parse().unwrap();
        let mut buf = [0u8; 32];
        let n = encode_ranging_init(&mut buf, 0, DEFAULT_PAN_ID, &tag, ShortAddress(0x0101));
        assert_eq!(n, LONG_MAC_LEN + 1);

        let meta = decode(&buf[..n]).unwrap();
        assert_eq!(meta.kind, MessageKind::RangingInit);
        assert_eq!(meta.src, ShortAddress(0x0101));
        assert_eq!(meta.dest, FrameDest::Extended(tag));
    }

    #[test]
    fn blink_round_trip() {
        let eui: Eui = "7D:00:22:EA:82:60:3B:9C".parse().unwrap();
        let mut buf = [0u8; 32];
        let n = encode_blink(&mut buf, 3, &eui, ShortAddress(0x7D00));
        assert_eq!(n, BLINK_LEN);

        let meta = decode(&buf[..n]).unwrap();
        assert_eq!(meta.kind, MessageKind::Blink);
        assert_eq!(meta.src, ShortAddress(0x7D00));
        assert_eq!(meta.dest, FrameDest::Unaddressed);

        let (decoded_eui, decoded_short) = decode_blink(&buf[..n]).unwrap();
        assert_eq!(decoded_eui, eui);
        assert_eq!(decoded_short, ShortAddress(0x7D00));
    }

    /// Literal blink frame from EUI 01:02:03:04:05:06:07:08, short 0x0102,
    /// seq 9: EUI and short address both travel least-significant byte first.
    #[test]
    fn blink_wire_image() {
        let frame = hex::decode("c5090807060504030201 0201".replace(' ', "")).unwrap();
        let (eui, short) = decode_blink(&frame).unwrap();
        assert_eq!(eui, "01:02:03:04:05:06:07:08".parse().unwrap());
        assert_eq!(short, ShortAddress(0x0102));
    }

    #[test]
    fn unrecognised_header_is_an_error() {
        assert_eq!(
            decode(&[0x99, 0x88, 0, 0, 0, 0, 0, 0, 0, 0]),
            Err(DecodeError::UnrecognisedHeader { byte: 0x99 })
        );
        // 0x41 with a reserved destination addressing mode
        let frame = [0x41, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            decode(&frame),
            Err(DecodeError::UnrecognisedHeader { byte: 0x80 })
        );
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let mut buf = [0u8; 32];
        let n = encode_short_mac(
            &mut buf,
            0,
            DEFAULT_PAN_ID,
            ShortAddress::BROADCAST,
            ShortAddress(0x7D00),
            MessageKind::Poll,
        );
        buf[SHORT_MAC_LEN] = 42;
        assert_eq!(decode(&buf[..n]), Err(DecodeError::UnknownKind { code: 42 }));
    }

    #[test]
    fn truncated_frames_are_errors() {
        assert_eq!(
            decode(&[]),
            Err(DecodeError::TooShort { have: 0, need: 1 })
        );
        assert_eq!(
            decode(&[0xC5, 0, 1, 2]),
            Err(DecodeError::TooShort {
                have: 4,
                need: BLINK_LEN
            })
        );
        assert_eq!(
            decode(&[0x41, 0x88, 0, 0, 0]),
            Err(DecodeError::TooShort {
                have: 5,
                need: SHORT_MAC_LEN + 1
            })
        );
    }
}
