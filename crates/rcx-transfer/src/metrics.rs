//! Prometheus counters for the transfer engine
//!
//! Registered into a caller-owned registry; counter names get the `_total`
//! suffix from the encoder.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use rcx_core::types::TransferDirection;

type Labels = Vec<(String, String)>;

#[derive(Clone)]
pub struct TransferMetrics {
    chunks_fetched: Counter,
    chunk_retries: Counter,
    bytes_fetched: Counter,
    transfers: Family<Labels, Counter>,
    transfer_duration: Family<Labels, Histogram>,
}

impl TransferMetrics {
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            chunks_fetched: Counter::default(),
            chunk_retries: Counter::default(),
            bytes_fetched: Counter::default(),
            transfers: Family::default(),
            transfer_duration: Family::<Labels, Histogram>::new_with_constructor(|| {
                Histogram::new([0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0])
            }),
        };
        registry.register(
            "rcx_chunks_fetched",
            "Chunks fetched over the network",
            metrics.chunks_fetched.clone(),
        );
        registry.register(
            "rcx_chunk_retries",
            "Chunk fetch or submit attempts that were retried",
            metrics.chunk_retries.clone(),
        );
        registry.register(
            "rcx_bytes_fetched",
            "Raw chunk bytes fetched over the network",
            metrics.bytes_fetched.clone(),
        );
        registry.register(
            "rcx_transfers",
            "Transfers that reached a final outcome",
            metrics.transfers.clone(),
        );
        registry.register(
            "rcx_transfer_duration_seconds",
            "Wall time of transfer runs that completed",
            metrics.transfer_duration.clone(),
        );
        metrics
    }

    pub fn chunk_fetched(&self, bytes: usize) {
        self.chunks_fetched.inc();
        self.bytes_fetched.inc_by(bytes as u64);
    }

    pub fn chunk_retried(&self) {
        self.chunk_retries.inc();
    }

    /// `outcome` is one of `completed`, `failed`, `cancelled`.
    pub fn transfer_finished(&self, direction: TransferDirection, outcome: &str) {
        self.transfers
            .get_or_create(&labels(direction, outcome))
            .inc();
    }

    pub fn observe_duration(&self, direction: TransferDirection, seconds: f64) {
        self.transfer_duration
            .get_or_create(&labels(direction, "completed"))
            .observe(seconds);
    }
}

fn labels(direction: TransferDirection, outcome: &str) -> Labels {
    vec![
        ("direction".to_string(), direction.as_str().to_string()),
        ("outcome".to_string(), outcome.to_string()),
    ]
}

/// Prometheus text exposition of `registry`.
pub fn render(registry: &Registry) -> Result<String, std::fmt::Error> {
    let mut body = String::new();
    encode(&mut body, registry)?;
    Ok(body)
}
