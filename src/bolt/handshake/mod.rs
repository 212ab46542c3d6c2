//! Bolt handshake.
//!
//! The client opens every connection with a 20-byte preamble: the magic
//! `60 60 B0 17` followed by four version proposals, most preferred first.
//! Each proposal is `[0x00, minor_range, minor, major]`; a non-zero range
//! offers every minor from `minor - range` up to `minor`. The server answers
//! with a single chosen version in the same layout, or all zeroes to reject.

mod version;

pub use version::BoltVersion;

/// Handshake magic preamble.
pub const MAGIC: [u8; 4] = [0x60, 0x60, 0xB0, 0x17];

/// Size of the client's handshake message.
pub const REQUEST_SIZE: usize = 20;

/// Size of the server's reply.
pub const REPLY_SIZE: usize = 4;

/// Version proposals, most preferred first. Ranges span only minors this
/// driver fully implements: 5.0–5.7, 4.1–4.4, and 3.0.
const PROPOSALS: [[u8; 4]; 4] = [
    [0x00, 7, 7, 5], // 5.7 back to 5.0
    [0x00, 3, 4, 4], // 4.4 back to 4.1
    [0x00, 0, 0, 3], // 3.0
    [0x00, 0, 0, 0], // padding
];

/// Build the 20-byte client handshake message.
pub fn request() -> [u8; REQUEST_SIZE] {
    let mut buf = [0u8; REQUEST_SIZE];
    buf[..4].copy_from_slice(&MAGIC);
    for (i, proposal) in PROPOSALS.iter().enumerate() {
        buf[4 + i * 4..8 + i * 4].copy_from_slice(proposal);
    }
    buf
}

/// Parse the server's 4-byte reply. `None` means the server rejected every
/// proposal (all-zero reply) or picked a version outside the supported set.
pub fn parse_reply(reply: [u8; REPLY_SIZE]) -> Option<BoltVersion> {
    let version = BoltVersion::new(reply[3], reply[2]);
    if version == BoltVersion::new(0, 0) || !version.is_supported() {
        return None;
    }
    Some(version)
}
