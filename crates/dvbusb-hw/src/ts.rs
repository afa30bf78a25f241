//! MPEG transport-stream framing.
//!
//! Every DVB-USB receiver in the table delivers a raw TS: 188-byte packets,
//! each starting with the 0x47 sync byte, carrying a 13-bit PID in bytes 1–2
//! and a 4-bit continuity counter in byte 3.
//!
//! ```text
//!  byte 0   byte 1            byte 2     byte 3
//! ┌──────┬─┬─┬─┬─────────┬──────────┬────┬────┬──────┐
//! │ 0x47 │E│S│P│ PID hi5 │ PID lo8  │scr │afc │  CC  │
//! └──────┴─┴─┴─┴─────────┴──────────┴────┴────┴──────┘
//! ```

/// Size of one TS packet in bytes.
pub const PACKET_SIZE: usize = 188;

/// Sync byte at the start of each packet.
pub const SYNC_BYTE: u8 = 0x47;

/// Null-packet PID (stuffing).
pub const NULL_PID: u16 = 0x1FFF;

/// PID of the Program Association Table.
pub const PAT_PID: u16 = 0x0000;

/// Extract the PID from a packet header.
///
/// Returns `None` when the slice is shorter than a header or the sync byte is
/// missing.
#[must_use]
pub fn pid(packet: &[u8]) -> Option<u16> {
    if packet.len() < 4 || packet[0] != SYNC_BYTE {
        return None;
    }
    Some((u16::from(packet[1] & 0x1F) << 8) | u16::from(packet[2]))
}

/// Extract the continuity counter from a packet header.
#[must_use]
pub fn continuity_counter(packet: &[u8]) -> Option<u8> {
    if packet.len() < 4 || packet[0] != SYNC_BYTE {
        return None;
    }
    Some(packet[3] & 0x0F)
}

/// Whether the packet carries payload (adaptation field control bit 0).
#[must_use]
pub fn has_payload(packet: &[u8]) -> bool {
    packet.len() >= 4 && packet[3] & 0x10 != 0
}

/// Write a packet header for `pid` with payload only and continuity `cc`.
///
/// The slice must hold at least [`PACKET_SIZE`] bytes; the payload is filled
/// with 0xFF stuffing.
pub fn write_packet(out: &mut [u8], pid: u16, cc: u8) {
    let packet = &mut out[..PACKET_SIZE];
    packet[0] = SYNC_BYTE;
    packet[1] = ((pid >> 8) & 0x1F) as u8;
    packet[2] = (pid & 0xFF) as u8;
    packet[3] = 0x10 | (cc & 0x0F);
    packet[4..].fill(0xFF);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_fields() {
        let mut buf = [0u8; PACKET_SIZE];
        write_packet(&mut buf, 0x0123, 7);
        assert_eq!(pid(&buf), Some(0x0123));
        assert_eq!(continuity_counter(&buf), Some(7));
        assert!(has_payload(&buf));
    }

    #[test]
    fn rejects_missing_sync() {
        let buf = [0u8; PACKET_SIZE];
        assert_eq!(pid(&buf), None);
        assert_eq!(pid(&[SYNC_BYTE, 0]), None);
    }

    #[test]
    fn pid_is_thirteen_bits() {
        let mut buf = [0u8; PACKET_SIZE];
        write_packet(&mut buf, 0xFFFF, 0);
        assert_eq!(pid(&buf), Some(NULL_PID));
    }
}
