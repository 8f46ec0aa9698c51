use prometheus::{
    CounterVec, Histogram, HistogramOpts, HistogramTimer, HistogramVec, IntCounter, IntGauge,
    Opts, Registry,
};
use std::sync::Arc;

/// Metrics collector for the rate limiter and its stores
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Decision metrics
    decisions: CounterVec,
    request_duration: Histogram,

    // Store metrics
    store_operations: CounterVec,
    store_operation_duration: HistogramVec,
    expiry_reconciliations: IntCounter,
    memory_entries: IntGauge,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let decisions = CounterVec::new(
            Opts::new(
                "ratelimit_decisions_total",
                "Number of rate limit decisions by outcome",
            ),
            &["outcome"],
        )?;

        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "ratelimit_request_duration_seconds",
            "Duration of rate limit lookups in seconds",
        ))?;

        let store_operations = CounterVec::new(
            Opts::new(
                "ratelimit_store_operations_total",
                "Number of store operations by backend, operation and result",
            ),
            &["backend", "operation", "result"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "ratelimit_store_operation_duration_seconds",
                "Duration of store operations in seconds",
            ),
            &["backend", "operation"],
        )?;

        let expiry_reconciliations = IntCounter::new(
            "ratelimit_expiry_reconciliations_total",
            "Number of keys found without a TTL and given one explicitly",
        )?;

        let memory_entries = IntGauge::new(
            "ratelimit_memory_entries",
            "Number of live entries held by the in-process store",
        )?;

        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(store_operations.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(expiry_reconciliations.clone()))?;
        registry.register(Box::new(memory_entries.clone()))?;

        Ok(Self {
            registry,
            decisions,
            request_duration,
            store_operations,
            store_operation_duration,
            expiry_reconciliations,
            memory_entries,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a request admitted within its quota
    pub fn record_admitted(&self) {
        self.decisions.with_label_values(&["admitted"]).inc();
    }

    /// Record a request over its quota
    pub fn record_limited(&self) {
        self.decisions.with_label_values(&["limited"]).inc();
    }

    /// Record a lookup that failed in the store
    pub fn record_error(&self) {
        self.decisions.with_label_values(&["error"]).inc();
    }

    /// Create a timer for measuring lookup duration
    pub fn start_request_timer(&self) -> HistogramTimer {
        self.request_duration.start_timer()
    }

    /// Record a store operation
    pub fn record_store_operation(&self, backend: &str, operation: &str, result: &str) {
        self.store_operations
            .with_label_values(&[backend, operation, result])
            .inc();
    }

    /// Record store operation duration
    pub fn record_store_operation_duration(
        &self,
        backend: &str,
        operation: &str,
        duration_seconds: f64,
    ) {
        self.store_operation_duration
            .with_label_values(&[backend, operation])
            .observe(duration_seconds);
    }

    /// Record a key that had to be given an explicit expiry
    pub fn record_expiry_reconciliation(&self) {
        self.expiry_reconciliations.inc();
    }

    /// Set the number of live in-process entries
    pub fn set_memory_entries(&self, count: usize) {
        self.memory_entries.set(count as i64);
    }
}
