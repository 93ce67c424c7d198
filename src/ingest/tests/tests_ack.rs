#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::ingest::tests::helpers::{
        FakeConnector, FakeSource, VecStore, batch, init_tracing, wait_for,
    };
    use crate::ingest::{EventBatch, IngestorConfig, PollingIngestor};

    const WAIT: Duration = Duration::from_secs(5);

    fn config(endpoint: &str) -> IngestorConfig {
        IngestorConfig {
            endpoints: vec![endpoint.to_string()],
            parallelism: 1,
            max_batch_size: 100,
        }
    }

    /// One successful batch: the store sees the events, `ack` fires
    /// exactly once, `nack` never.
    #[test]
    fn test_successful_batch_is_acked() {
        init_tracing();
        let source = FakeSource::new(vec![Ok(batch("S1", &["alpha", "beta"]))]);
        let connector = FakeConnector::single("src://a", source.clone());
        let store = VecStore::new();

        let ingestor = PollingIngestor::new(config("src://a"), connector, store.clone());
        ingestor.start().unwrap();

        assert!(wait_for(|| source.ack_log() == vec!["S1"], WAIT));
        ingestor.stop().unwrap();

        assert_eq!(source.ack_log(), vec!["S1"]);
        assert!(source.nack_log().is_empty());

        // Events became records with body and headers preserved.
        let records = store.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].body, b"alpha");
        assert_eq!(records[0].headers.get("tag"), Some(&"alpha".to_string()));
        assert_eq!(records[1].body, b"beta");
    }

    /// The ack happens only after the store callback has returned.
    #[test]
    fn test_store_precedes_ack() {
        init_tracing();
        let source = FakeSource::new(vec![Ok(batch("S1", &["x"]))]);
        let connector = FakeConnector::single("src://a", source.clone());
        let store = VecStore::new();

        let ingestor = PollingIngestor::new(config("src://a"), connector, store.clone());
        ingestor.start().unwrap();

        assert!(wait_for(|| !source.ack_log().is_empty(), WAIT));
        // By the time the ack is visible the record must already be
        // stored.
        assert_eq!(store.len(), 1);
        ingestor.stop().unwrap();
    }

    /// An error batch is logged and skipped: no ack, no nack, and the
    /// worker keeps polling (the following batch is processed normally).
    #[test]
    fn test_error_batch_skipped_and_worker_continues() {
        init_tracing();
        let source = FakeSource::new(vec![
            Ok(EventBatch::Error {
                message: "busy".into(),
            }),
            Ok(batch("S3", &["after-busy"])),
        ]);
        let connector = FakeConnector::single("src://a", source.clone());
        let store = VecStore::new();

        let ingestor = PollingIngestor::new(config("src://a"), connector, store.clone());
        ingestor.start().unwrap();

        assert!(wait_for(|| source.ack_log() == vec!["S3"], WAIT));
        ingestor.stop().unwrap();

        // The error batch produced neither an ack nor a nack.
        assert_eq!(source.ack_log(), vec!["S3"]);
        assert!(source.nack_log().is_empty());
        assert_eq!(store.bodies(), vec![b"after-busy".to_vec()]);

        // Connection back in the pool after shutdown.
        assert_eq!(ingestor.idle_connections(), 1);
    }

    /// Several batches in sequence are all stored and acked in order.
    #[test]
    fn test_multiple_batches_acked_in_order() {
        init_tracing();
        let source = FakeSource::new(vec![
            Ok(batch("S1", &["a"])),
            Ok(batch("S2", &["b"])),
            Ok(batch("S3", &["c"])),
        ]);
        let connector = FakeConnector::single("src://a", source.clone());
        let store = VecStore::new();

        let ingestor = PollingIngestor::new(config("src://a"), connector, store.clone());
        ingestor.start().unwrap();

        assert!(wait_for(|| source.ack_log().len() == 3, WAIT));
        ingestor.stop().unwrap();

        assert_eq!(source.ack_log(), vec!["S1", "S2", "S3"]);
        assert_eq!(
            store.bodies(),
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]
        );
    }
}
