//! Minimal ISO-BMFF walking for track-id repair.
//!
//! Ad and content encoders do not always agree on track ids. When they
//! differ, the decoder treats the switch as a new track and stalls, so the
//! pipeline rewrites the id inside each init fragment's `tkhd` box to match
//! the id the stream started with.

/// Byte offset of `track_ID` from the start of the `tkhd` payload
/// (version/flags, then 32- or 64-bit timestamps depending on version).
const TKHD_V0_TRACK_ID_OFFSET: usize = 12;
const TKHD_V1_TRACK_ID_OFFSET: usize = 20;

fn read_u32(data: &[u8], at: usize) -> Option<u32> {
    let bytes = data.get(at..at + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Locate the `tkhd` payload (past its size/type header) inside a
/// `moov > trak` hierarchy. Returns the offset of the version byte.
fn find_tkhd(data: &[u8]) -> Option<usize> {
    let moov = find_box(data, 0, data.len(), b"moov")?;
    let trak = find_box(data, moov.0, moov.1, b"trak")?;
    let tkhd = find_box(data, trak.0, trak.1, b"tkhd")?;
    Some(tkhd.0)
}

/// Scan the children of `[start, end)` for a box of the given type.
/// Returns (content_start, content_end). Only 32-bit box sizes are
/// handled; fragments with 64-bit sizes are left untouched.
fn find_box(data: &[u8], start: usize, end: usize, kind: &[u8; 4]) -> Option<(usize, usize)> {
    let mut at = start;
    while at + 8 <= end {
        let size = read_u32(data, at)? as usize;
        if size < 8 || at + size > end {
            return None;
        }
        if &data[at + 4..at + 8] == kind {
            return Some((at + 8, at + size));
        }
        at += size;
    }
    None
}

fn track_id_offset(data: &[u8]) -> Option<usize> {
    let tkhd = find_tkhd(data)?;
    let version = *data.get(tkhd)?;
    let offset = match version {
        0 => TKHD_V0_TRACK_ID_OFFSET,
        1 => TKHD_V1_TRACK_ID_OFFSET,
        _ => return None,
    };
    Some(tkhd + offset)
}

/// Read the track id out of an init fragment, if one is present.
pub fn parse_track_id(data: &[u8]) -> Option<u32> {
    let at = track_id_offset(data)?;
    read_u32(data, at)
}

/// Overwrite the track id in place. Returns `false` when no `tkhd` was
/// found and the data is unchanged.
pub fn rewrite_track_id(data: &mut [u8], track_id: u32) -> bool {
    let Some(at) = track_id_offset(data) else {
        return false;
    };
    if data.len() < at + 4 {
        return false;
    }
    data[at..at + 4].copy_from_slice(&track_id.to_be_bytes());
    true
}
