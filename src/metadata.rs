use log::debug;

use super::collab::MetadataSink;

pub const TYPE_CORE: [u8; 4] = *b"core";
pub const TYPE_SSNC: [u8; 4] = *b"ssnc";

/// On-wire metadata frame: 4-byte type, 4-byte code, 32-bit big-endian
/// length, payload.
pub fn encode_frame(kind: [u8; 4], code: [u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(12 + payload.len());
    frame.extend_from_slice(&kind);
    frame.extend_from_slice(&code);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);

    frame
}

/// Walks a dmap-tagged SET_PARAMETER body and fans the items out to the
/// sink, bracketed by `ssnc/strt` and `ssnc/stop`.
pub fn process_dmap(sink: &dyn MetadataSink, content: &[u8]) {
    sink.process(TYPE_SSNC, *b"strt", &[]);

    // skip the outer container tag and length
    let mut off = 8;
    while off + 8 <= content.len() {
        let code = [content[off], content[off + 1], content[off + 2], content[off + 3]];
        let length = u32::from_be_bytes([
            content[off + 4],
            content[off + 5],
            content[off + 6],
            content[off + 7],
        ]) as usize;
        off += 8;

        let end = (off + length).min(content.len());
        sink.process(TYPE_CORE, code, &content[off..end]);
        off = end;
    }

    sink.process(TYPE_SSNC, *b"stop", &[]);
}

/// Cover art is not tagged like the rest of the metadata; it travels as a
/// singleton `ssnc/PICT` record.
pub fn process_cover_art(sink: &dyn MetadataSink, content: &[u8]) {
    debug!("relaying {} bytes of cover art", content.len());
    sink.process(TYPE_SSNC, *b"PICT", content);
}
