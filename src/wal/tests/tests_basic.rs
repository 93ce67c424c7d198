#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use crate::encoding::{decode_from_slice, encode_to_vec};
    use crate::storage::StorageConfig;
    use crate::wal::tests::helpers::{collect_payloads, open_writer, write_all};
    use crate::wal::{FileSegment, WalError, WalRandomReader, WalWriter};

    #[test]
    fn test_single_writer_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("receiver.wal");
        let writer = open_writer(&path);

        let buffers: [&[u8]; 3] = [b"\x01", b"\x02\x03", b""];
        let segments = write_all(&writer, &buffers).unwrap();
        writer.close().unwrap();

        // Sequential replay yields exactly the written buffers, in order.
        let payloads = collect_payloads(&path).unwrap();
        assert_eq!(payloads.len(), 3);
        for (payload, expected) in payloads.iter().zip(buffers.iter()) {
            assert_eq!(payload.as_slice(), *expected);
        }

        // Each segment reads back bit-identical.
        let reader = WalRandomReader::open(&path).unwrap();
        for (segment, expected) in segments.iter().zip(buffers.iter()) {
            assert_eq!(reader.read(segment).unwrap().as_slice(), *expected);
        }
    }

    #[test]
    fn test_segment_fields() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("receiver.wal");
        let writer = open_writer(&path);

        let first = writer.write(b"aaaa").unwrap();
        let second = writer.write(b"bb").unwrap();

        assert_eq!(first.path, path);
        assert_eq!(first.offset, 0);
        assert_eq!(first.length, 4);

        // 4-byte prefix + 4 payload bytes.
        assert_eq!(second.offset, 8);
        assert_eq!(second.length, 2);
        assert_eq!(writer.position().unwrap(), 14);
    }

    #[test]
    fn test_length_prefix_is_big_endian() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("receiver.wal");
        let writer = open_writer(&path);
        writer.write(&[0xEE; 5]).unwrap();
        writer.close().unwrap();

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(&contents[..4], &[0x00, 0x00, 0x00, 0x05]);
        assert_eq!(&contents[4..], &[0xEE; 5]);
    }

    #[test]
    fn test_empty_file_replays_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("receiver.wal");
        let writer = open_writer(&path);
        writer.close().unwrap();

        let payloads = collect_payloads(&path).unwrap();
        assert!(payloads.is_empty());
    }

    #[test]
    fn test_reopen_with_append_support_continues_offsets() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("receiver.wal");
        let config = StorageConfig {
            append_support: true,
        };

        let writer = WalWriter::open(&path, &config).unwrap();
        writer.write(b"one").unwrap();
        writer.close().unwrap();

        let writer = WalWriter::open(&path, &config).unwrap();
        let segment = writer.write(b"two").unwrap();
        assert_eq!(segment.offset, 7); // prefix(4) + "one"(3)
        writer.close().unwrap();

        let payloads = collect_payloads(&path).unwrap();
        assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn test_reopen_without_append_support_starts_fresh() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("receiver.wal");

        let writer = open_writer(&path);
        writer.write(b"stale").unwrap();
        writer.close().unwrap();

        let writer = open_writer(&path);
        writer.write(b"fresh").unwrap();
        writer.close().unwrap();

        let payloads = collect_payloads(&path).unwrap();
        assert_eq!(payloads, vec![b"fresh".to_vec()]);
    }

    #[test]
    fn test_segment_wire_round_trip() {
        let segment = FileSegment::new("/logs/receiver-3.wal", 4096, 117);
        let bytes = encode_to_vec(&segment).unwrap();
        let (decoded, consumed) = decode_from_slice::<FileSegment>(&bytes).unwrap();
        assert_eq!(decoded, segment);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_segment_wire_layout() {
        let segment = FileSegment::new("ab", 1, 2);
        let bytes = encode_to_vec(&segment).unwrap();

        // [u32 len=2 LE]["ab"][i64 offset LE][i32 length LE]
        let mut expected = Vec::new();
        expected.extend_from_slice(&2u32.to_le_bytes());
        expected.extend_from_slice(b"ab");
        expected.extend_from_slice(&1i64.to_le_bytes());
        expected.extend_from_slice(&2i32.to_le_bytes());
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_segment_negative_offset_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1u32.to_le_bytes());
        bytes.push(b'x');
        bytes.extend_from_slice(&(-1i64).to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());

        assert!(decode_from_slice::<FileSegment>(&bytes).is_err());
    }

    #[test]
    fn test_write_after_close_rejected() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("receiver.wal");
        let writer = open_writer(&path);

        writer.write(b"before").unwrap();
        writer.close().unwrap();

        let err = writer.write(b"after").unwrap_err();
        assert!(matches!(err, WalError::Closed));
        assert!(matches!(writer.position().unwrap_err(), WalError::Closed));
    }

    #[test]
    fn test_close_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("receiver.wal");
        let writer = open_writer(&path);

        writer.close().unwrap();
        writer.close().unwrap();
    }
}
