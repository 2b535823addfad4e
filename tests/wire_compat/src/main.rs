fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use chunkline_protocol::{
        Chunk, Priority, TransferProgress, TransferRequest, TransferStatistics, TransferStatus,
    };

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    /// Loads a fixture JSON file and returns it as a `serde_json::Value`.
    fn load_fixture(name: &str) -> serde_json::Value {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    /// Normalizes numbers so that `65` and `65.0` compare as equal.
    ///
    /// Peers written in other languages may emit integer-valued floats
    /// without a fractional part.
    fn normalize_value(v: &serde_json::Value) -> serde_json::Value {
        match v {
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(f) => serde_json::json!(f),
                None => v.clone(),
            },
            serde_json::Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), normalize_value(v)))
                    .collect(),
            ),
            serde_json::Value::Array(arr) => {
                serde_json::Value::Array(arr.iter().map(normalize_value).collect())
            }
            _ => v.clone(),
        }
    }

    /// Deserializes a fixture, re-serializes it, and compares the JSON values.
    fn roundtrip_test<T>(name: &str) -> T
    where
        T: serde::de::DeserializeOwned + serde::Serialize,
    {
        let fixture = load_fixture(name);
        let parsed: T = serde_json::from_value(fixture.clone())
            .unwrap_or_else(|e| panic!("failed to deserialize {name}: {e}"));
        let reserialized = serde_json::to_value(&parsed)
            .unwrap_or_else(|e| panic!("failed to re-serialize {name}: {e}"));

        assert_eq!(
            normalize_value(&fixture),
            normalize_value(&reserialized),
            "roundtrip mismatch for {name}:\n  fixture: {fixture}\n  ours:    {reserialized}"
        );
        parsed
    }

    #[test]
    fn fixture_chunk() {
        let chunk: Chunk = roundtrip_test("chunk.json");
        assert_eq!(chunk.payload, b"ABCD");
        assert_eq!(chunk.sequence_number, 0);
        assert!(!chunk.is_last());
    }

    #[test]
    fn fixture_chunk_out_of_range_rejected() {
        let fixture = load_fixture("chunk_out_of_range.json");
        let err = serde_json::from_value::<Chunk>(fixture).unwrap_err();
        assert!(err.to_string().contains("out of range"), "{err}");
    }

    #[test]
    fn fixture_transfer_request() {
        let request: TransferRequest = roundtrip_test("transfer_request.json");
        assert_eq!(request.priority, Priority::High);
        assert_eq!(request.encryption_key_id.as_deref(), Some("team-key"));
        assert!(request.resumable);
    }

    #[test]
    fn fixture_transfer_progress() {
        let progress: TransferProgress = roundtrip_test("transfer_progress.json");
        assert_eq!(progress.status, TransferStatus::Transferring);
        assert_eq!(progress.failed_chunks, vec![1]);
        assert_eq!(progress.remaining(), 1024);
    }

    #[test]
    fn fixture_transfer_statistics() {
        let stats: TransferStatistics = roundtrip_test("transfer_statistics.json");
        assert_eq!(stats.total_transfers, 12);
        assert_eq!(stats.active_transfers, 1);
    }

    #[test]
    fn status_strings() {
        for (status, wire) in [
            (TransferStatus::Pending, "pending"),
            (TransferStatus::Transferring, "transferring"),
            (TransferStatus::Paused, "paused"),
            (TransferStatus::Completed, "completed"),
            (TransferStatus::Failed, "failed"),
            (TransferStatus::Cancelled, "cancelled"),
        ] {
            assert_eq!(serde_json::to_value(status).unwrap(), wire);
        }
    }
}
