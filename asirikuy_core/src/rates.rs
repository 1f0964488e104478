// asirikuy_core/src/rates.rs

//! Rate Buffer Manager.
//! Loads base-timeframe history, makes multi-file sets coherent, refactors to the
//! timeframes each instance declares and serves look-ahead free rolling views.

use crate::error::{BridgeError, BridgeResult};
use crate::native;

/// Sentinel symbol meaning "the instrument under test".
pub const SAME_AS_TRADED: &str = "D";
/// Over-allocation applied to every buffer to absorb weekend and holiday gaps.
pub const CAPACITY_MULTIPLIER: f64 = 1.2;

/// One OHLCV candle. `time` is the bar open in unix seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default, serde::Serialize)]
pub struct Rate {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub short_swap: f64,
    pub long_swap: f64,
}

/// A strategy's declaration of one buffer it needs.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateRequirement {
    /// Symbol to load, or `"D"` for the traded symbol.
    #[serde(default = "default_requirement_symbol")]
    pub symbol: String,
    /// Target timeframe in minutes, 0 for the strategy timeframe.
    #[serde(default)]
    pub timeframe: u32,
    pub bars: usize,
}

fn default_requirement_symbol() -> String {
    SAME_AS_TRADED.to_string()
}

/// Metadata of one buffer slot, fixed at instance setup.
#[derive(Debug, Clone, PartialEq)]
pub struct RateBufferDescriptor {
    pub slot: usize,
    pub is_enabled: bool,
    pub required_timeframe: u32,
    pub actual_timeframe: u32,
    pub bars_required: usize,
    /// Window size in base bars, see `buffer_capacity`.
    pub capacity: usize,
    pub symbol_used: String,
    pub digits: u32,
    pub point: f64,
}

impl RateBufferDescriptor {
    /// Layout handed to the framework. Bars are delivered already refactored,
    /// so the actual timeframe reported is the required one.
    pub fn to_c(&self, delivered: usize) -> native::CRatesInfo {
        native::CRatesInfo {
            is_enabled: if self.is_enabled { 1.0 } else { 0.0 },
            required_timeframe: self.required_timeframe as f64,
            total_bars_required: self.bars_required as f64,
            actual_timeframe: self.required_timeframe as f64,
            rates_array_size: delivered as f64,
            point: self.point,
            digits: self.digits as f64,
        }
    }
}

/// `barsRequired * 1.2 * requiredTF / actualTF`, rounded.
pub fn buffer_capacity(bars_required: usize, required_timeframe: u32, actual_timeframe: u32) -> usize {
    let ratio = required_timeframe as f64 / actual_timeframe.max(1) as f64;
    (bars_required as f64 * CAPACITY_MULTIPLIER * ratio).round() as usize
}

/// Parses the history timestamp formats: `dd/mm/yy HH:MM`, then ISO variants.
pub fn parse_history_time(value: &str) -> Option<i64> {
    const FORMATS: &[&str] = &["%d/%m/%y %H:%M", "%d/%m/%Y %H:%M", "%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M"];
    let trimmed = value.trim();
    FORMATS
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(trimmed, fmt).ok())
        .map(|dt| dt.and_utc().timestamp())
}

/// Reads a headerless history CSV:
/// `time,open,high,low,close,volume[,shortSwap,longSwap]`.
/// Duplicate timestamps keep the first row, a backwards timestamp is an error.
pub fn load_history_csv(path: &std::path::Path) -> BridgeResult<Vec<Rate>> {
    if !path.is_file() {
        return Err(BridgeError::MissingHistory(path.to_path_buf()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;

    let mut rates: Vec<Rate> = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record?;
        if record.len() < 6 {
            return Err(BridgeError::HistoryParse {
                path: path.to_path_buf(),
                line: line + 1,
                reason: format!("expected at least 6 columns, got {}", record.len()),
            });
        }

        let time = parse_history_time(&record[0]).ok_or_else(|| BridgeError::HistoryParse {
            path: path.to_path_buf(),
            line: line + 1,
            reason: format!("unparseable timestamp '{}'", &record[0]),
        })?;

        let field = |i: usize| -> BridgeResult<f64> {
            match record.get(i) {
                None => Ok(0.0),
                Some(raw) => raw.parse::<f64>().map_err(|e| BridgeError::HistoryParse {
                    path: path.to_path_buf(),
                    line: line + 1,
                    reason: format!("column {}: {}", i, e),
                }),
            }
        };

        let rate = Rate {
            time,
            open: field(1)?,
            high: field(2)?,
            low: field(3)?,
            close: field(4)?,
            volume: field(5)?,
            short_swap: field(6)?,
            long_swap: field(7)?,
        };

        if let Some(last) = rates.last() {
            if rate.time == last.time {
                continue;
            }
            if rate.time < last.time {
                return Err(BridgeError::NonMonotonicTimestamps {
                    path: path.display().to_string(),
                    index: line,
                });
            }
        }
        rates.push(rate);
    }

    Ok(rates)
}

/// Fails unless timestamps are strictly increasing.
pub fn check_strictly_increasing(rates: &[Rate], label: &str) -> BridgeResult<()> {
    match rates.windows(2).position(|w| w[1].time <= w[0].time) {
        Some(i) => Err(BridgeError::NonMonotonicTimestamps {
            path: label.to_string(),
            index: i + 1,
        }),
        None => Ok(()),
    }
}

/// Aggregates base bars into `target_timeframe` bars aligned to multiples of the
/// target period. The target must not be finer than the base.
pub fn refactor(rates: &[Rate], base_timeframe: u32, target_timeframe: u32) -> BridgeResult<Vec<Rate>> {
    if target_timeframe < base_timeframe || base_timeframe == 0 {
        return Err(BridgeError::InvalidTimeframe {
            base: base_timeframe,
            target: target_timeframe,
        });
    }
    if target_timeframe == base_timeframe {
        return Ok(rates.to_vec());
    }

    let period = target_timeframe as i64 * 60;
    let mut out: Vec<Rate> = Vec::with_capacity(rates.len() * base_timeframe as usize / target_timeframe as usize + 1);

    for rate in rates {
        let bucket = rate.time.div_euclid(period) * period;
        match out.last_mut() {
            Some(bar) if bar.time == bucket => {
                bar.high = bar.high.max(rate.high);
                bar.low = bar.low.min(rate.low);
                bar.close = rate.close;
                bar.volume += rate.volume;
                bar.short_swap = rate.short_swap;
                bar.long_swap = rate.long_swap;
            }
            _ => out.push(Rate { time: bucket, ..*rate }),
        }
    }

    Ok(out)
}

/// Inner join on time: keeps only timestamps present in every series.
pub fn make_coherent(series: &[Vec<Rate>]) -> Vec<Vec<Rate>> {
    if series.len() < 2 {
        return series.to_vec();
    }

    let mut common: std::collections::BTreeSet<i64> = series[0].iter().map(|r| r.time).collect();
    for other in &series[1..] {
        let times: std::collections::HashSet<i64> = other.iter().map(|r| r.time).collect();
        common.retain(|t| times.contains(t));
    }

    series
        .iter()
        .map(|s| s.iter().filter(|r| common.contains(&r.time)).copied().collect())
        .collect()
}

/// Base and term currency of a pair such as `EURJPY` or `EURJPYm`.
pub fn split_pair(symbol: &str) -> Option<(&str, &str, &str)> {
    if symbol.len() < 6 || !symbol.is_char_boundary(6) {
        return None;
    }
    Some((&symbol[0..3], &symbol[3..6], &symbol[6..]))
}

/// Auxiliary quote symbols needed when the account currency is neither side of the pair.
/// Order: base+acc, acc+base, term+acc, acc+term. Any broker suffix is kept.
pub fn conversion_symbols(symbol: &str, account_currency: &str) -> Vec<String> {
    match split_pair(symbol) {
        Some((base, term, suffix)) if account_currency != base && account_currency != term => vec![
            format!("{}{}{}", base, account_currency, suffix),
            format!("{}{}{}", account_currency, base, suffix),
            format!("{}{}{}", term, account_currency, suffix),
            format!("{}{}{}", account_currency, term, suffix),
        ],
        _ => Vec::new(),
    }
}

/// Which leg an auxiliary series converts and in which direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionLeg {
    BaseAccount,
    AccountBase,
    TermAccount,
    AccountTerm,
}

#[derive(Debug, Clone)]
pub struct ConversionSeries {
    pub symbol: String,
    pub leg: ConversionLeg,
    pub series: std::sync::Arc<Vec<Rate>>,
}

impl ConversionSeries {
    /// Open of the latest bar starting at or before `time`.
    fn rate_at(&self, time: i64) -> Option<f64> {
        let idx = self.series.partition_point(|r| r.time <= time);
        if idx == 0 { None } else { Some(self.series[idx - 1].open) }
    }
}

/// A rolling, look-ahead free window onto one refactored series.
#[derive(Debug, Clone)]
pub struct RateBuffer {
    descriptor: RateBufferDescriptor,
    base: std::sync::Arc<Vec<Rate>>,
    series: std::sync::Arc<Vec<Rate>>,
    base_period: i64,
    period: i64,
    base_cursor: usize,
    cursor: usize,
    window_start: usize,
}

impl RateBuffer {
    pub fn new(
        descriptor: RateBufferDescriptor,
        base: std::sync::Arc<Vec<Rate>>,
        series: std::sync::Arc<Vec<Rate>>,
    ) -> Self {
        let base_period = descriptor.actual_timeframe as i64 * 60;
        let period = descriptor.required_timeframe as i64 * 60;
        Self {
            descriptor,
            base,
            series,
            base_period,
            period,
            base_cursor: 0,
            cursor: 0,
            window_start: 0,
        }
    }

    /// Moves the window so it holds bars fully closed at or before `time`.
    /// The window spans the last `capacity` closed base bars; a refactored bar
    /// only part of which lies inside the window is left out.
    pub fn advance_to(&mut self, time: i64) {
        while self.base_cursor < self.base.len() && self.base[self.base_cursor].time + self.base_period <= time {
            self.base_cursor += 1;
        }
        while self.cursor < self.series.len() && self.series[self.cursor].time + self.period <= time {
            self.cursor += 1;
        }

        let oldest_base = self.base_cursor.saturating_sub(self.descriptor.capacity);
        let window_open = match self.base.get(oldest_base) {
            Some(rate) if self.base_cursor > 0 => rate.time,
            _ => i64::MIN,
        };
        let closed = &self.series[..self.cursor];
        self.window_start = closed.partition_point(|r| r.time < window_open);
    }

    pub fn view(&self) -> &[Rate] {
        &self.series[self.window_start..self.cursor]
    }

    pub fn descriptor(&self) -> &RateBufferDescriptor {
        &self.descriptor
    }

    pub fn is_warmed_up(&self) -> bool {
        self.view().len() >= self.descriptor.bars_required
    }
}

/// Every buffer an instance reads, plus its conversion quotes.
#[derive(Debug, Clone)]
pub struct InstanceRates {
    symbol: String,
    account_currency: String,
    primary: std::sync::Arc<Vec<Rate>>,
    buffers: Vec<RateBuffer>,
    conversion: Vec<ConversionSeries>,
}

impl InstanceRates {
    pub fn get_symbol(&self) -> &str {
        &self.symbol
    }

    /// Base-timeframe series of the traded symbol; drives the bar cursor.
    pub fn get_primary(&self) -> &std::sync::Arc<Vec<Rate>> {
        &self.primary
    }

    pub fn get_buffers(&self) -> &[RateBuffer] {
        &self.buffers
    }

    pub fn get_conversion(&self) -> &[ConversionSeries] {
        &self.conversion
    }

    pub fn advance_to(&mut self, time: i64) {
        for buffer in &mut self.buffers {
            buffer.advance_to(time);
        }
    }

    pub fn views(&self) -> Vec<native::BufferView<'_>> {
        self.buffers
            .iter()
            .map(|b| native::BufferView {
                descriptor: b.descriptor(),
                bars: b.view(),
            })
            .collect()
    }

    pub fn is_warmed_up(&self) -> bool {
        self.buffers.iter().all(RateBuffer::is_warmed_up)
    }

    fn leg_rate(&self, leg: ConversionLeg, time: i64) -> Option<f64> {
        self.conversion
            .iter()
            .find(|c| c.leg == leg)
            .and_then(|c| c.rate_at(time))
            .filter(|r| *r > 0.0)
    }

    /// Factor turning an amount in the pair's term currency into account currency.
    /// `price` is the current price of the traded pair.
    pub fn quote_conversion(&self, time: i64, price: f64) -> f64 {
        let Some((base, term, _)) = split_pair(&self.symbol) else {
            return 1.0;
        };
        if self.account_currency == term {
            return 1.0;
        }
        if self.account_currency == base {
            return if price > 0.0 { 1.0 / price } else { 1.0 };
        }
        if let Some(r) = self.leg_rate(ConversionLeg::TermAccount, time) {
            return r;
        }
        if let Some(r) = self.leg_rate(ConversionLeg::AccountTerm, time) {
            return 1.0 / r;
        }
        if price > 0.0 {
            if let Some(r) = self.leg_rate(ConversionLeg::BaseAccount, time) {
                return r / price;
            }
            if let Some(r) = self.leg_rate(ConversionLeg::AccountBase, time) {
                return 1.0 / (r * price);
            }
        }
        1.0
    }

    /// Factor turning an amount in the pair's base currency into account currency.
    pub fn base_conversion(&self, time: i64, price: f64) -> f64 {
        let Some((base, term, _)) = split_pair(&self.symbol) else {
            return 1.0;
        };
        if self.account_currency == base {
            return 1.0;
        }
        if self.account_currency == term {
            return price;
        }
        if let Some(r) = self.leg_rate(ConversionLeg::BaseAccount, time) {
            return r;
        }
        if let Some(r) = self.leg_rate(ConversionLeg::AccountBase, time) {
            return 1.0 / r;
        }
        self.quote_conversion(time, price) * price
    }
}

/// Owns every loaded history of a run. Histories are read-only once loaded and
/// shared across instances and optimization workers through `Arc`.
#[derive(Debug)]
pub struct RateBufferManager {
    history_dir: std::path::PathBuf,
    base_timeframe: u32,
    histories: std::collections::HashMap<String, std::sync::Arc<Vec<Rate>>>,
    conversions: std::collections::HashMap<String, std::sync::Arc<Vec<Rate>>>,
    refactored: std::sync::Mutex<std::collections::HashMap<(String, u32), std::sync::Arc<Vec<Rate>>>>,
}

impl RateBufferManager {
    pub fn new<P: AsRef<std::path::Path>>(history_dir: P, base_timeframe: u32) -> Self {
        Self {
            history_dir: history_dir.as_ref().to_path_buf(),
            base_timeframe,
            histories: std::collections::HashMap::new(),
            conversions: std::collections::HashMap::new(),
            refactored: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn get_base_timeframe(&self) -> u32 {
        self.base_timeframe
    }

    /// `{history_dir}/{SYMBOL}_{base_tf}.csv`
    pub fn history_path(&self, symbol: &str) -> std::path::PathBuf {
        self.history_dir.join(format!("{}_{}.csv", symbol, self.base_timeframe))
    }

    /// Loads the history of every distinct symbol. When more than one file is
    /// involved, all of them are intersected on time before any buffer is built.
    pub fn load_symbols(&mut self, symbols: &[String]) -> BridgeResult<()> {
        let mut distinct: Vec<String> = Vec::new();
        for symbol in symbols {
            if !distinct.contains(symbol) && !self.histories.contains_key(symbol) {
                distinct.push(symbol.clone());
            }
        }

        let mut loaded = Vec::with_capacity(distinct.len());
        for symbol in &distinct {
            let path = self.history_path(symbol);
            tracing::info!("Loading rates for {} from {}", symbol, path.display());
            loaded.push(load_history_csv(&path)?);
        }

        for (symbol, rates) in distinct.into_iter().zip(loaded) {
            self.histories.insert(symbol, std::sync::Arc::new(rates));
        }
        self.make_loaded_coherent();
        Ok(())
    }

    /// Registers an in-memory history, validating its ordering.
    pub fn insert_history(&mut self, symbol: &str, rates: Vec<Rate>) -> BridgeResult<()> {
        check_strictly_increasing(&rates, symbol)?;
        self.histories.insert(symbol.to_string(), std::sync::Arc::new(rates));
        self.invalidate_refactored();
        Ok(())
    }

    /// Intersects all loaded histories on time.
    pub fn make_loaded_coherent(&mut self) {
        if self.histories.len() < 2 {
            return;
        }
        tracing::info!("Making rates coherent across {} files", self.histories.len());

        let mut symbols: Vec<String> = self.histories.keys().cloned().collect();
        symbols.sort();
        let series: Vec<Vec<Rate>> = symbols.iter().map(|s| self.histories[s].as_ref().clone()).collect();
        let coherent = make_coherent(&series);

        for (symbol, rates) in symbols.into_iter().zip(coherent) {
            self.histories.insert(symbol, std::sync::Arc::new(rates));
        }
        self.invalidate_refactored();
    }

    /// Loads whichever auxiliary quote files exist for the traded symbols.
    /// Absent combinations are skipped silently. Returns how many were loaded.
    pub fn load_conversion_symbols(&mut self, traded: &[String], account_currency: &str) -> BridgeResult<usize> {
        let mut count = 0;
        for symbol in traded {
            for candidate in conversion_symbols(symbol, account_currency) {
                if self.conversions.contains_key(&candidate) || self.histories.contains_key(&candidate) {
                    continue;
                }
                let path = self.history_path(&candidate);
                if !path.is_file() {
                    continue;
                }
                tracing::info!("Loading conversion quotes {}", candidate);
                let rates = load_history_csv(&path)?;
                self.conversions.insert(candidate, std::sync::Arc::new(rates));
                count += 1;
            }
        }
        Ok(count)
    }

    pub fn history(&self, symbol: &str) -> Option<std::sync::Arc<Vec<Rate>>> {
        self.histories.get(symbol).cloned()
    }

    fn invalidate_refactored(&mut self) {
        if let Ok(mut cache) = self.refactored.lock() {
            cache.clear();
        }
    }

    fn refactored(&self, symbol: &str, timeframe: u32) -> BridgeResult<std::sync::Arc<Vec<Rate>>> {
        let base = self
            .history(symbol)
            .ok_or_else(|| BridgeError::MissingHistory(self.history_path(symbol)))?;
        if timeframe == self.base_timeframe {
            return Ok(base);
        }

        let key = (symbol.to_string(), timeframe);
        if let Some(hit) = self.refactored.lock().ok().and_then(|c| c.get(&key).cloned()) {
            return Ok(hit);
        }
        let series = std::sync::Arc::new(refactor(&base, self.base_timeframe, timeframe)?);
        if let Ok(mut cache) = self.refactored.lock() {
            cache.insert(key, series.clone());
        }
        Ok(series)
    }

    /// Builds the buffers of one instance from its declared requirements.
    /// Fails before any bar is processed on a bad timeframe, a missing history
    /// or a history shorter than a requirement.
    pub fn build_instance_rates(
        &self,
        symbol: &str,
        strategy_timeframe: u32,
        requirements: &[RateRequirement],
        digits: u32,
        account_currency: &str,
    ) -> BridgeResult<InstanceRates> {
        if requirements.len() > native::MAX_RATES_BUFFERS {
            return Err(BridgeError::TooManyRateBuffers(requirements.len()));
        }

        let primary = self
            .history(symbol)
            .ok_or_else(|| BridgeError::MissingHistory(self.history_path(symbol)))?;

        let mut buffers = Vec::with_capacity(requirements.len());
        for (slot, requirement) in requirements.iter().enumerate() {
            let required_timeframe = if requirement.timeframe == 0 {
                strategy_timeframe
            } else {
                requirement.timeframe
            };
            if required_timeframe < self.base_timeframe {
                return Err(BridgeError::InvalidTimeframe {
                    base: self.base_timeframe,
                    target: required_timeframe,
                });
            }

            let symbol_used = if requirement.symbol == SAME_AS_TRADED {
                symbol.to_string()
            } else {
                requirement.symbol.clone()
            };

            let base = self
                .history(&symbol_used)
                .ok_or_else(|| BridgeError::MissingHistory(self.history_path(&symbol_used)))?;
            let series = self.refactored(&symbol_used, required_timeframe)?;

            if series.len() < requirement.bars {
                return Err(BridgeError::InsufficientBars {
                    symbol: symbol_used,
                    required: requirement.bars,
                    available: series.len(),
                });
            }

            let descriptor = RateBufferDescriptor {
                slot,
                is_enabled: true,
                required_timeframe,
                actual_timeframe: self.base_timeframe,
                bars_required: requirement.bars,
                capacity: buffer_capacity(requirement.bars, required_timeframe, self.base_timeframe),
                symbol_used,
                digits,
                point: 1.0 / 10f64.powi(digits as i32),
            };
            buffers.push(RateBuffer::new(descriptor, base, series));
        }

        let legs = [
            ConversionLeg::BaseAccount,
            ConversionLeg::AccountBase,
            ConversionLeg::TermAccount,
            ConversionLeg::AccountTerm,
        ];
        let conversion: Vec<ConversionSeries> = conversion_symbols(symbol, account_currency)
            .into_iter()
            .zip(legs)
            .filter_map(|(candidate, leg)| {
                self.conversions
                    .get(&candidate)
                    .or_else(|| self.histories.get(&candidate))
                    .map(|series| ConversionSeries {
                        symbol: candidate.clone(),
                        leg,
                        series: series.clone(),
                    })
            })
            .collect();

        if !conversion_symbols(symbol, account_currency).is_empty() && conversion.is_empty() {
            tracing::warn!(
                "No conversion quotes found for {} in {}; profits are left in the term currency",
                symbol,
                account_currency
            );
        }

        Ok(InstanceRates {
            symbol: symbol.to_string(),
            account_currency: account_currency.to_string(),
            primary,
            buffers,
            conversion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars(start: i64, step: i64, n: usize) -> Vec<Rate> {
        (0..n)
            .map(|i| {
                let p = 1.0 + i as f64 * 0.001;
                Rate {
                    time: start + step * i as i64,
                    open: p,
                    high: p + 0.0005,
                    low: p - 0.0005,
                    close: p + 0.0002,
                    volume: 1.0,
                    ..Default::default()
                }
            })
            .collect()
    }

    #[test]
    fn test_buffer_capacity_formula() {
        assert_eq!(buffer_capacity(100, 60, 60), 120);
        assert_eq!(buffer_capacity(100, 240, 60), 480);
        assert_eq!(buffer_capacity(5, 15, 1), 90);
        assert_eq!(buffer_capacity(3, 1, 1), 4);
    }

    #[test]
    fn test_refactor_rejects_finer_target() {
        let err = refactor(&bars(0, 3600, 10), 60, 15).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidTimeframe { base: 60, target: 15 }));
    }

    #[test]
    fn test_refactor_aggregates_ohlcv() {
        let base = bars(0, 60, 10);
        let out = refactor(&base, 1, 5).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].time, 0);
        assert_eq!(out[1].time, 300);
        assert_eq!(out[0].open, base[0].open);
        assert_eq!(out[0].close, base[4].close);
        assert_eq!(out[0].high, base[4].high);
        assert_eq!(out[0].low, base[0].low);
        assert_eq!(out[0].volume, 5.0);
    }

    #[test]
    fn test_make_coherent_inner_join() {
        let a = bars(0, 60, 6);
        let mut b = bars(60, 60, 6);
        b.remove(2);
        let out = make_coherent(&[a, b]);
        assert_eq!(out[0].len(), out[1].len());
        let ta: Vec<i64> = out[0].iter().map(|r| r.time).collect();
        let tb: Vec<i64> = out[1].iter().map(|r| r.time).collect();
        assert_eq!(ta, tb);
        assert_eq!(ta, vec![60, 120, 240, 300]);
    }

    #[test]
    fn test_conversion_symbols() {
        assert_eq!(
            conversion_symbols("EURJPY", "USD"),
            vec!["EURUSD", "USDEUR", "JPYUSD", "USDJPY"]
        );
        assert_eq!(conversion_symbols("EURJPYm", "USD")[3], "USDJPYm");
        assert!(conversion_symbols("EURUSD", "USD").is_empty());
        assert!(conversion_symbols("EURUSD", "EUR").is_empty());
    }

    #[test]
    fn test_coarse_view_exposes_only_closed_bars() {
        let mut manager = RateBufferManager::new(".", 1);
        manager.insert_history("EURUSD", bars(0, 60, 600)).unwrap();
        let requirement = RateRequirement { symbol: SAME_AS_TRADED.to_string(), timeframe: 60, bars: 2 };
        let mut rates = manager.build_instance_rates("EURUSD", 60, &[requirement], 5, "USD").unwrap();

        // 01:30, hour 01:00 still forming
        rates.advance_to(5400);
        let view = rates.get_buffers()[0].view();
        assert_eq!(view.last().map(|r| r.time), Some(0));

        rates.advance_to(7200);
        let view = rates.get_buffers()[0].view();
        assert_eq!(view.last().map(|r| r.time), Some(3600));
        assert!(view.iter().all(|r| r.time + 3600 <= 7200));
    }

    #[test]
    fn test_base_view_respects_capacity() {
        let mut manager = RateBufferManager::new(".", 1);
        manager.insert_history("EURUSD", bars(0, 60, 100)).unwrap();
        let requirement = RateRequirement { symbol: "D".to_string(), timeframe: 0, bars: 10 };
        let mut rates = manager.build_instance_rates("EURUSD", 1, &[requirement], 5, "USD").unwrap();

        rates.advance_to(60 * 5);
        assert_eq!(rates.get_buffers()[0].view().len(), 5);
        assert!(!rates.is_warmed_up());

        rates.advance_to(60 * 50);
        let view = rates.get_buffers()[0].view();
        assert_eq!(view.len(), 12);
        assert_eq!(view.last().map(|r| r.time), Some(60 * 49));
        assert!(rates.is_warmed_up());
    }

    #[test]
    fn test_insufficient_bars_is_data_error() {
        let mut manager = RateBufferManager::new(".", 1);
        manager.insert_history("EURUSD", bars(0, 60, 10)).unwrap();
        let requirement = RateRequirement { symbol: "D".to_string(), timeframe: 5, bars: 5 };
        let err = manager.build_instance_rates("EURUSD", 1, &[requirement], 5, "USD").unwrap_err();
        assert_eq!(err.category(), "data");
    }

    #[test]
    fn test_non_monotonic_rejected() {
        let mut data = bars(0, 60, 5);
        data.swap(1, 2);
        let mut manager = RateBufferManager::new(".", 1);
        assert!(manager.insert_history("EURUSD", data).is_err());
    }

    #[test]
    fn test_load_history_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("EURUSD_60.csv");
        std::fs::write(
            &path,
            "01/02/10 00:00,1.3,1.31,1.29,1.305,100\n\
             01/02/10 01:00,1.305,1.32,1.30,1.31,120,-0.5,0.2\n\
             01/02/10 01:00,9,9,9,9,9\n",
        )
        .unwrap();
        let rates = load_history_csv(&path).unwrap();
        assert_eq!(rates.len(), 2);
        assert_eq!(rates[0].time, 1_264_982_400);
        assert_eq!(rates[1].time - rates[0].time, 3600);
        assert_eq!(rates[1].short_swap, -0.5);
        assert_eq!(rates[1].long_swap, 0.2);
        assert_eq!(rates[0].long_swap, 0.0);
    }

    #[test]
    fn test_missing_history_file() {
        let err = load_history_csv(std::path::Path::new("/nonexistent/EURUSD_1.csv")).unwrap_err();
        assert!(matches!(err, BridgeError::MissingHistory(_)));
    }

    #[test]
    fn test_quote_conversion_via_cross() {
        let mut manager = RateBufferManager::new(".", 60);
        manager.insert_history("EURJPY", bars(0, 3600, 10)).unwrap();
        let usdjpy: Vec<Rate> = bars(0, 3600, 10).into_iter().map(|r| Rate { open: 100.0, ..r }).collect();
        manager.insert_history("USDJPY", usdjpy).unwrap();
        let rates = manager
            .build_instance_rates("EURJPY", 60, &[RateRequirement { symbol: "D".into(), timeframe: 0, bars: 1 }], 3, "USD")
            .unwrap();
        assert_eq!(rates.get_conversion().len(), 1);
        assert!((rates.quote_conversion(7200, 130.0) - 0.01).abs() < 1e-12);
    }
}
