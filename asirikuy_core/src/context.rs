// asirikuy_core/src/context.rs

//! Explicit run context handed to every component constructor in place of
//! module-level globals: run-wide configuration, the run span and the
//! symbol tables, validated once at construction.

use crate::error::{BridgeError, BridgeResult};
use crate::rates;
use crate::settings;
use crate::utils;

/// Cooperative stop flag, polled once per bar and once per candidate.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// Everything a run shares across its instances.
#[derive(Debug, Clone)]
pub struct RunContext {
    initial_balance: f64,
    account_currency: String,
    broker_name: String,
    ref_broker_name: String,
    account_label: String,
    history_path: std::path::PathBuf,
    base_timeframe: u32,
    from_time: Option<i64>,
    to_time: Option<i64>,
    statistics: settings::StatisticsSettings,
    threads: usize,
    exit_results_path: std::path::PathBuf,
    /// Instance id -> traded symbol.
    symbols: std::collections::BTreeMap<i32, String>,
    /// Traded symbol -> auxiliary conversion symbols that may be loaded.
    conversion_symbols: std::collections::BTreeMap<String, Vec<String>>,
    stop: StopHandle,
    span: tracing::Span,
}

impl RunContext {
    /// Context with neutral defaults, used by tests and embedding code.
    pub fn new(initial_balance: f64, account_currency: &str, base_timeframe: u32) -> Self {
        Self {
            initial_balance,
            account_currency: account_currency.to_string(),
            broker_name: String::new(),
            ref_broker_name: String::new(),
            account_label: String::new(),
            history_path: std::path::PathBuf::from("."),
            base_timeframe,
            from_time: None,
            to_time: None,
            statistics: settings::StatisticsSettings::default(),
            threads: 1,
            exit_results_path: std::path::PathBuf::from("."),
            symbols: std::collections::BTreeMap::new(),
            conversion_symbols: std::collections::BTreeMap::new(),
            stop: StopHandle::new(),
            span: tracing::info_span!("run", currency = account_currency),
        }
    }

    /// Builds and validates a context from loaded settings.
    pub fn from_settings(settings: &settings::Settings) -> BridgeResult<Self> {
        let common = &settings.common;
        let parse = |value: &Option<String>| -> BridgeResult<Option<i64>> {
            value
                .as_deref()
                .map(|v| utils::parse_run_date(v).map_err(|e| BridgeError::Config(e.to_string())))
                .transpose()
        };

        let mut context = Self::new(common.initial_balance, &common.account_currency, common.base_timeframe)
            .with_broker_names(&common.broker_name, &common.ref_broker_name)
            .with_account_label(&common.account_label)
            .with_history_path(&common.history_path)
            .with_window(parse(&common.from_date)?, parse(&common.to_date)?)
            .with_statistics(common.statistics.clone())
            .with_threads(settings.threads())
            .with_exit_results_path(&common.exit_results_path);

        for system in &settings.systems {
            context.register_symbol(system.instance_id, &system.symbol)?;
        }
        context.span = tracing::info_span!("run", mode = %common.mode, currency = %common.account_currency);

        Ok(context)
    }

    pub fn with_broker_names(mut self, broker: &str, ref_broker: &str) -> Self {
        self.broker_name = broker.to_string();
        self.ref_broker_name = ref_broker.to_string();
        self
    }

    pub fn with_account_label(mut self, label: &str) -> Self {
        self.account_label = label.to_string();
        self
    }

    pub fn with_history_path<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.history_path = path.as_ref().to_path_buf();
        self
    }

    pub fn with_window(mut self, from_time: Option<i64>, to_time: Option<i64>) -> Self {
        self.from_time = from_time;
        self.to_time = to_time;
        self
    }

    pub fn with_statistics(mut self, statistics: settings::StatisticsSettings) -> Self {
        self.statistics = statistics;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_exit_results_path<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.exit_results_path = path.as_ref().to_path_buf();
        self
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Records the traded symbol of an instance and its conversion candidates.
    pub fn register_symbol(&mut self, instance_id: i32, symbol: &str) -> BridgeResult<()> {
        if self.symbols.contains_key(&instance_id) {
            return Err(BridgeError::DuplicateInstance(instance_id));
        }
        if rates::split_pair(symbol).is_none() {
            tracing::warn!("Symbol {} is not a currency pair, no conversion applied", symbol);
        }
        self.symbols.insert(instance_id, symbol.to_string());
        self.conversion_symbols
            .entry(symbol.to_string())
            .or_insert_with(|| rates::conversion_symbols(symbol, &self.account_currency));
        Ok(())
    }

    // Getters

    pub fn get_initial_balance(&self) -> f64 {
        self.initial_balance
    }

    pub fn get_account_currency(&self) -> &str {
        &self.account_currency
    }

    pub fn get_broker_name(&self) -> &str {
        &self.broker_name
    }

    pub fn get_ref_broker_name(&self) -> &str {
        &self.ref_broker_name
    }

    pub fn get_account_label(&self) -> &str {
        &self.account_label
    }

    pub fn get_history_path(&self) -> &std::path::Path {
        &self.history_path
    }

    pub fn get_base_timeframe(&self) -> u32 {
        self.base_timeframe
    }

    pub fn get_statistics(&self) -> &settings::StatisticsSettings {
        &self.statistics
    }

    pub fn get_threads(&self) -> usize {
        self.threads
    }

    pub fn get_exit_results_path(&self) -> &std::path::Path {
        &self.exit_results_path
    }

    pub fn get_stop_handle(&self) -> &StopHandle {
        &self.stop
    }

    pub fn get_span(&self) -> &tracing::Span {
        &self.span
    }

    pub fn get_symbol(&self, instance_id: i32) -> Option<&str> {
        self.symbols.get(&instance_id).map(String::as_str)
    }

    pub fn get_conversion_symbols(&self, symbol: &str) -> &[String] {
        self.conversion_symbols.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Distinct traded symbols in instance id order.
    pub fn traded_symbols(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for symbol in self.symbols.values() {
            if !out.contains(symbol) {
                out.push(symbol.clone());
            }
        }
        out
    }

    /// The engine runs only strictly inside the configured window.
    pub fn in_window(&self, time: i64) -> bool {
        self.from_time.is_none_or(|from| time > from) && self.to_time.is_none_or(|to| time < to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_is_exclusive() {
        let context = RunContext::new(10_000.0, "USD", 1).with_window(Some(100), Some(200));
        assert!(!context.in_window(100));
        assert!(context.in_window(101));
        assert!(!context.in_window(200));
        assert!(RunContext::new(1.0, "USD", 1).in_window(0));
    }

    #[test]
    fn test_register_symbol_rejects_duplicate_id() {
        let mut context = RunContext::new(10_000.0, "USD", 1);
        context.register_symbol(1, "EURJPY").unwrap();
        assert_eq!(context.get_conversion_symbols("EURJPY").len(), 4);
        assert!(matches!(
            context.register_symbol(1, "GBPUSD"),
            Err(BridgeError::DuplicateInstance(1))
        ));
    }

    #[test]
    fn test_stop_handle_is_shared() {
        let stop = StopHandle::new();
        let context = RunContext::new(1.0, "USD", 1).with_stop_handle(stop.clone());
        stop.request_stop();
        assert!(context.get_stop_handle().is_stop_requested());
    }
}
