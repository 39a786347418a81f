//! Versioned binary encoding of `ProgressRecord`.
//!
//! Layout (big-endian):
//! `version: u32` | `begin: u64` | `end: u64` | `flags: u8` | `closed_time: i64`?
//!
//! `closed_time` is present only when `FLAG_HAS_CLOSED_TIME` is set. Decoding
//! never falls back to another layout: an unknown version is rejected before
//! the payload is looked at.

use holo_combiner::combiner::CombineError;

use crate::status::ProgressRecord;

/// Version tag written by `encode`.
pub const STATUS_FORMAT_VERSION: u32 = 1;

const FLAG_CLOSED: u8 = 0x01;
const FLAG_INFINITE_END: u8 = 0x02;
const FLAG_HAS_CLOSED_TIME: u8 = 0x04;
const KNOWN_FLAGS: u8 = FLAG_CLOSED | FLAG_INFINITE_END | FLAG_HAS_CLOSED_TIME;

pub fn encode(record: &ProgressRecord) -> Vec<u8> {
    let closed_time = record.effective_closed_time();
    let mut out = Vec::with_capacity(4 + 8 + 8 + 1 + closed_time.map_or(0, |_| 8));
    out.extend_from_slice(&STATUS_FORMAT_VERSION.to_be_bytes());
    out.extend_from_slice(&record.begin.to_be_bytes());
    out.extend_from_slice(&record.end.to_be_bytes());

    let mut flags = 0u8;
    if record.closed {
        flags |= FLAG_CLOSED;
    }
    if record.infinite_end {
        flags |= FLAG_INFINITE_END;
    }
    if closed_time.is_some() {
        flags |= FLAG_HAS_CLOSED_TIME;
    }
    out.push(flags);
    if let Some(time) = closed_time {
        out.extend_from_slice(&time.to_be_bytes());
    }
    out
}

pub fn decode(data: &[u8]) -> Result<ProgressRecord, CombineError> {
    let mut offset = 0usize;
    let version = read_u32(data, &mut offset)?;
    if version != STATUS_FORMAT_VERSION {
        return Err(CombineError::UnsupportedVersion {
            found: version,
            expected: STATUS_FORMAT_VERSION,
        });
    }

    let begin = read_u64(data, &mut offset)?;
    let end = read_u64(data, &mut offset)?;
    let flags = read_u8(data, &mut offset)?;
    if flags & !KNOWN_FLAGS != 0 {
        return Err(CombineError::malformed(format!(
            "unknown status flags {flags:#04x}"
        )));
    }
    let closed = flags & FLAG_CLOSED != 0;
    let closed_time = if flags & FLAG_HAS_CLOSED_TIME != 0 {
        if !closed {
            return Err(CombineError::malformed("close time on an open file"));
        }
        Some(read_u64(data, &mut offset)? as i64)
    } else {
        None
    };
    if offset != data.len() {
        return Err(CombineError::malformed(format!(
            "{} trailing bytes after status",
            data.len() - offset
        )));
    }

    Ok(ProgressRecord {
        begin,
        end,
        infinite_end: flags & FLAG_INFINITE_END != 0,
        closed,
        closed_time,
    })
}

fn read_u32(data: &[u8], offset: &mut usize) -> Result<u32, CombineError> {
    let bytes = take::<4>(data, offset, "short version tag")?;
    Ok(u32::from_be_bytes(bytes))
}

fn read_u64(data: &[u8], offset: &mut usize) -> Result<u64, CombineError> {
    let bytes = take::<8>(data, offset, "short u64")?;
    Ok(u64::from_be_bytes(bytes))
}

fn read_u8(data: &[u8], offset: &mut usize) -> Result<u8, CombineError> {
    let [byte] = take::<1>(data, offset, "short flags")?;
    Ok(byte)
}

fn take<const N: usize>(
    data: &[u8],
    offset: &mut usize,
    what: &'static str,
) -> Result<[u8; N], CombineError> {
    let end = *offset + N;
    let slice = data
        .get(*offset..end)
        .ok_or_else(|| CombineError::malformed(what))?;
    let mut buf = [0u8; N];
    buf.copy_from_slice(slice);
    *offset = end;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn layout_is_stable() {
        let bytes = encode(&ProgressRecord::file_closed(7));
        let mut expected = vec![0, 0, 0, 1];
        expected.extend_from_slice(&[0; 16]);
        expected.push(FLAG_CLOSED | FLAG_HAS_CLOSED_TIME);
        expected.extend_from_slice(&7i64.to_be_bytes());
        assert_eq!(bytes, expected);

        let open = encode(&ProgressRecord::replicated_and_ingested(1, 2));
        assert_eq!(open.len(), 4 + 8 + 8 + 1);
    }

    #[test]
    fn wrong_version_is_rejected() {
        let mut bytes = encode(&ProgressRecord::ingested_until(10));
        bytes[3] = 2;
        match decode(&bytes) {
            Err(CombineError::UnsupportedVersion { found, expected }) => {
                assert_eq!(found, 2);
                assert_eq!(expected, STATUS_FORMAT_VERSION);
            }
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[test]
    fn version_is_checked_before_payload() {
        // A foreign version with a garbage payload still reports the version.
        let bytes = [0, 0, 0, 9, 0xff];
        assert!(matches!(
            decode(&bytes),
            Err(CombineError::UnsupportedVersion { found: 9, .. })
        ));
    }

    #[test]
    fn structural_problems_are_malformed() {
        let good = encode(&ProgressRecord::file_closed(3));

        assert!(matches!(decode(&[0, 0]), Err(CombineError::MalformedRecord(_))));
        assert!(matches!(
            decode(&good[..good.len() - 1]),
            Err(CombineError::MalformedRecord(_))
        ));

        let mut trailing = good.clone();
        trailing.push(0);
        assert!(matches!(decode(&trailing), Err(CombineError::MalformedRecord(_))));

        let mut unknown_flag = encode(&ProgressRecord::new_file());
        unknown_flag[20] = 0x80;
        assert!(matches!(
            decode(&unknown_flag),
            Err(CombineError::MalformedRecord(_))
        ));

        let mut open_with_time = good;
        open_with_time[20] = FLAG_HAS_CLOSED_TIME;
        assert!(matches!(
            decode(&open_with_time),
            Err(CombineError::MalformedRecord(_))
        ));
    }

    #[test]
    fn stray_close_time_is_not_encoded() {
        let stray = ProgressRecord {
            closed_time: Some(5),
            ..ProgressRecord::ingested_until(1)
        };
        let decoded = decode(&encode(&stray)).expect("decode");
        assert_eq!(decoded, ProgressRecord::ingested_until(1));
        assert_eq!(decoded.closed_time, None);
    }

    fn arb_record() -> impl Strategy<Value = ProgressRecord> {
        (
            any::<u64>(),
            any::<u64>(),
            any::<bool>(),
            any::<bool>(),
            proptest::option::of(any::<i64>()),
        )
            .prop_map(|(begin, end, infinite_end, closed, time)| ProgressRecord {
                begin,
                end,
                infinite_end,
                closed,
                closed_time: time,
            })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(record in arb_record()) {
            prop_assert_eq!(decode(&encode(&record)).expect("decode"), record);
        }
    }
}
