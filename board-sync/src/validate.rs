//! Structural check of v1 document updates before they reach Yrs.
//!
//! Yrs reads strings without checking UTF-8 and pre-allocates from
//! sender-supplied counts. Either can abort the process while applying an
//! update, so every delta from the network or the cache is walked here first:
//!
//! ```text
//! update     := varuint(clients) client_blocks* delete_set
//! client     := varuint(blocks) varuint(client) varuint(clock) block*
//! block      := info:u8 ( gc | skip | item )
//! delete_set := varuint(clients) ( varuint(client) varuint(ranges) (clock len)* )*
//! ```
//!
//! Only the layout is checked. Whether the update makes sense for a given
//! document is still up to Yrs.

use yrs::encoding::read::{Cursor, Error, Read};

/// Deepest `Any` value accepted; Yrs decodes these recursively.
const MAX_ANY_DEPTH: usize = 64;

const BLOCK_GC: u8 = 0;
const BLOCK_SKIP: u8 = 10;

const HAS_ORIGIN: u8 = 0b1000_0000;
const HAS_RIGHT_ORIGIN: u8 = 0b0100_0000;
const HAS_PARENT_SUB: u8 = 0b0010_0000;

const CONTENT_DELETED: u8 = 1;
const CONTENT_JSON: u8 = 2;
const CONTENT_BINARY: u8 = 3;
const CONTENT_STRING: u8 = 4;
const CONTENT_EMBED: u8 = 5;
const CONTENT_FORMAT: u8 = 6;
const CONTENT_TYPE: u8 = 7;
const CONTENT_ANY: u8 = 8;
const CONTENT_DOC: u8 = 9;

const TYPE_XML_ELEMENT: u8 = 3;

/// Walk a v1-encoded update and reject anything Yrs cannot apply safely.
pub(crate) fn check_update_v1(bytes: &[u8]) -> Result<(), Error> {
    let mut cursor = Cursor::new(bytes);

    let clients: u32 = cursor.read_var()?;
    bounded(&cursor, clients, 3)?;
    for _ in 0..clients {
        let blocks: u32 = cursor.read_var()?;
        bounded(&cursor, blocks, 1)?;
        let _client: u32 = cursor.read_var()?;
        let _clock: u32 = cursor.read_var()?;
        for _ in 0..blocks {
            check_block(&mut cursor)?;
        }
    }

    check_delete_set(&mut cursor)
}

fn check_block(cursor: &mut Cursor) -> Result<(), Error> {
    let info = cursor.read_u8()?;
    match info {
        BLOCK_GC | BLOCK_SKIP => {
            let _len: u32 = cursor.read_var()?;
            Ok(())
        }
        info => {
            if info & HAS_ORIGIN != 0 {
                skip_id(cursor)?;
            }
            if info & HAS_RIGHT_ORIGIN != 0 {
                skip_id(cursor)?;
            }
            if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
                let parent_info: u32 = cursor.read_var()?;
                if parent_info == 1 {
                    check_string(cursor)?;
                } else {
                    skip_id(cursor)?;
                }
                if info & HAS_PARENT_SUB != 0 {
                    check_string(cursor)?;
                }
            }
            check_content(cursor, info & 0b1111)
        }
    }
}

fn check_content(cursor: &mut Cursor, content_ref: u8) -> Result<(), Error> {
    match content_ref {
        CONTENT_DELETED => {
            let _len: u32 = cursor.read_var()?;
        }
        CONTENT_JSON => {
            // Yrs reads one entry more than the stored count
            let count: u32 = cursor.read_var()?;
            bounded(cursor, count, 1)?;
            for _ in 0..=count {
                check_string(cursor)?;
            }
        }
        CONTENT_BINARY => {
            cursor.read_buf()?;
        }
        CONTENT_STRING | CONTENT_EMBED => check_string(cursor)?,
        CONTENT_FORMAT => {
            check_string(cursor)?;
            check_string(cursor)?;
        }
        CONTENT_TYPE => match cursor.read_u8()? {
            TYPE_XML_ELEMENT => check_string(cursor)?,
            0..=6 | 9 | 15 => {}
            _ => return Err(Error::UnexpectedValue),
        },
        CONTENT_ANY => {
            let count: u32 = cursor.read_var()?;
            bounded(cursor, count, 1)?;
            for _ in 0..count {
                check_any(cursor, 0)?;
            }
        }
        CONTENT_DOC => {
            check_string(cursor)?;
            check_any(cursor, 0)?;
        }
        // Move content and unknown refs are not produced by this crate's peers
        _ => return Err(Error::UnexpectedValue),
    }
    Ok(())
}

fn check_any(cursor: &mut Cursor, depth: usize) -> Result<(), Error> {
    if depth > MAX_ANY_DEPTH {
        return Err(Error::Custom(format!(
            "value nested deeper than {MAX_ANY_DEPTH}"
        )));
    }
    match cursor.read_u8()? {
        127 | 126 | 121 | 120 => {}
        125 => {
            let _: i64 = cursor.read_var()?;
        }
        124 => {
            cursor.read_exact(4)?;
        }
        123 | 122 => {
            cursor.read_exact(8)?;
        }
        119 => check_string(cursor)?,
        118 => {
            let len: u32 = cursor.read_var()?;
            bounded(cursor, len, 2)?;
            for _ in 0..len {
                check_string(cursor)?;
                check_any(cursor, depth + 1)?;
            }
        }
        117 => {
            let len: u32 = cursor.read_var()?;
            bounded(cursor, len, 1)?;
            for _ in 0..len {
                check_any(cursor, depth + 1)?;
            }
        }
        116 => {
            cursor.read_buf()?;
        }
        _ => return Err(Error::UnexpectedValue),
    }
    Ok(())
}

fn check_delete_set(cursor: &mut Cursor) -> Result<(), Error> {
    let clients: u32 = cursor.read_var()?;
    bounded(cursor, clients, 2)?;
    for _ in 0..clients {
        let _client: u32 = cursor.read_var()?;
        let ranges: u32 = cursor.read_var()?;
        bounded(cursor, ranges, 2)?;
        for _ in 0..ranges {
            let _clock: u32 = cursor.read_var()?;
            let _len: u32 = cursor.read_var()?;
        }
    }
    Ok(())
}

fn check_string(cursor: &mut Cursor) -> Result<(), Error> {
    let at = cursor.next;
    let bytes = cursor.read_buf()?;
    std::str::from_utf8(bytes)
        .map(|_| ())
        .map_err(|e| Error::Custom(format!("invalid UTF-8 in string at byte {at}: {e}")))
}

fn skip_id(cursor: &mut Cursor) -> Result<(), Error> {
    let _client: u32 = cursor.read_var()?;
    let _clock: u32 = cursor.read_var()?;
    Ok(())
}

/// A count of `n` entries, each at least `min_size` bytes, must fit in what is left.
fn bounded(cursor: &Cursor, n: u32, min_size: usize) -> Result<(), Error> {
    let remaining = cursor.buf.len() - cursor.next;
    let needed = (n as usize).saturating_mul(min_size);
    if needed > remaining {
        return Err(Error::EndOfBuffer(needed));
    }
    Ok(())
}
