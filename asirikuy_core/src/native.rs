// asirikuy_core/src/native.rs

//! C-compatible layouts shared with the native strategy framework and the
//! `NativeEngine` capability the execution loop drives once per bar.

use crate::rates;

/// Number of numeric slots in a settings vector.
pub const SETTINGS_SIZE: usize = 64;
/// Number of numeric slots in an account info vector.
pub const ACCOUNT_INFO_SIZE: usize = 10;
/// Number of slots in a bid/ask vector.
pub const BID_ASK_SIZE: usize = 6;
/// Rate buffer slots per instance.
pub const MAX_RATES_BUFFERS: usize = 10;
/// Doubles per strategy result record.
pub const STRATEGY_RESULT_SIZE: usize = 10;

/// One candle as the framework reads it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CRates {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub time: i32,
}

impl From<&rates::Rate> for CRates {
    fn from(rate: &rates::Rate) -> Self {
        Self {
            open: rate.open,
            high: rate.high,
            low: rate.low,
            close: rate.close,
            volume: rate.volume,
            time: rate.time as i32,
        }
    }
}

/// Order record layout (`COrderInfo`), all fields as doubles.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct COrderInfo {
    pub ticket: f64,
    pub instance_id: f64,
    pub order_type: f64,
    pub open_time: f64,
    pub close_time: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub expiration: f64,
    pub open_price: f64,
    pub close_price: f64,
    pub lots: f64,
    pub profit: f64,
    pub commission: f64,
    pub swap: f64,
    pub is_open: f64,
}

/// Rate buffer descriptor layout (`CRatesInfo`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CRatesInfo {
    pub is_enabled: f64,
    pub required_timeframe: f64,
    pub total_bars_required: f64,
    pub actual_timeframe: f64,
    pub rates_array_size: f64,
    pub point: f64,
    pub digits: f64,
}

/// Settings vector slots the bridge reads or writes.
pub mod settings_index {
    pub const IS_SPREAD_BETTING: usize = 40;
    pub const USE_SL: usize = 41;
    pub const USE_TP: usize = 42;
    pub const RUN_EVERY_TICK: usize = 43;
    pub const INSTANCE_MANAGEMENT: usize = 44;
    pub const MAX_OPEN_ORDERS: usize = 45;
    pub const IS_BACKTESTING: usize = 46;
    pub const DISABLE_COMPOUNDING: usize = 47;
    pub const TIMED_EXIT_BARS: usize = 48;
    pub const ORIGINAL_EQUITY: usize = 49;
    pub const OPERATIONAL_MODE: usize = 50;
    pub const STRATEGY_INSTANCE_ID: usize = 51;
    pub const INTERNAL_STRATEGY_ID: usize = 52;
    pub const TIMEFRAME: usize = 53;
    pub const SAVE_TICK_DATA: usize = 54;
    pub const ANALYSIS_WINDOW_SIZE: usize = 55;
    pub const PARAMETER_SET_POOL: usize = 56;
    pub const ACCOUNT_RISK_PERCENT: usize = 57;
    pub const MAX_DRAWDOWN_PERCENT: usize = 58;
    pub const MAX_SPREAD: usize = 59;
    pub const SL_ATR_MULTIPLIER: usize = 60;
    pub const TP_ATR_MULTIPLIER: usize = 61;
    pub const ATR_AVERAGING_PERIOD: usize = 62;
    pub const ORDERINFO_ARRAY_SIZE: usize = 63;

    const NAMED: [(&str, usize); 24] = [
        ("IS_SPREAD_BETTING", IS_SPREAD_BETTING),
        ("USE_SL", USE_SL),
        ("USE_TP", USE_TP),
        ("RUN_EVERY_TICK", RUN_EVERY_TICK),
        ("INSTANCE_MANAGEMENT", INSTANCE_MANAGEMENT),
        ("MAX_OPEN_ORDERS", MAX_OPEN_ORDERS),
        ("IS_BACKTESTING", IS_BACKTESTING),
        ("DISABLE_COMPOUNDING", DISABLE_COMPOUNDING),
        ("TIMED_EXIT_BARS", TIMED_EXIT_BARS),
        ("ORIGINAL_EQUITY", ORIGINAL_EQUITY),
        ("OPERATIONAL_MODE", OPERATIONAL_MODE),
        ("STRATEGY_INSTANCE_ID", STRATEGY_INSTANCE_ID),
        ("INTERNAL_STRATEGY_ID", INTERNAL_STRATEGY_ID),
        ("TIMEFRAME", TIMEFRAME),
        ("SAVE_TICK_DATA", SAVE_TICK_DATA),
        ("ANALYSIS_WINDOW_SIZE", ANALYSIS_WINDOW_SIZE),
        ("PARAMETER_SET_POOL", PARAMETER_SET_POOL),
        ("ACCOUNT_RISK_PERCENT", ACCOUNT_RISK_PERCENT),
        ("MAX_DRAWDOWN_PERCENT", MAX_DRAWDOWN_PERCENT),
        ("MAX_SPREAD", MAX_SPREAD),
        ("SL_ATR_MULTIPLIER", SL_ATR_MULTIPLIER),
        ("TP_ATR_MULTIPLIER", TP_ATR_MULTIPLIER),
        ("ATR_AVERAGING_PERIOD", ATR_AVERAGING_PERIOD),
        ("ORDERINFO_ARRAY_SIZE", ORDERINFO_ARRAY_SIZE),
    ];

    /// Name -> slot table used to resolve settings by name.
    /// `ADDITIONAL_PARAM_1`..`ADDITIONAL_PARAM_40` occupy slots 0..39.
    pub fn lookup(name: &str) -> Option<usize> {
        if let Some(n) = name.strip_prefix("ADDITIONAL_PARAM_") {
            return match n.parse::<usize>() {
                Ok(n) if (1..=40).contains(&n) => Some(n - 1),
                _ => None,
            };
        }
        NAMED.iter().find(|(n, _)| *n == name).map(|(_, index)| *index)
    }

    /// Display name of a slot.
    pub fn name(index: usize) -> String {
        if index < IS_SPREAD_BETTING {
            return format!("ADDITIONAL_PARAM_{}", index + 1);
        }
        NAMED
            .iter()
            .find(|(_, i)| *i == index)
            .map(|(n, _)| n.to_string())
            .unwrap_or_else(|| index.to_string())
    }
}

/// Account info vector slots.
pub mod account_index {
    pub const ACCOUNT_NUMBER: usize = 0;
    pub const BALANCE: usize = 1;
    pub const EQUITY: usize = 2;
    pub const MARGIN: usize = 3;
    pub const LEVERAGE: usize = 4;
    pub const CONTRACT_SIZE: usize = 5;
    pub const MINIMUM_STOP: usize = 6;
    pub const STOPOUT_PERCENT: usize = 7;
    pub const TOTAL_OPEN_TRADE_RISK_PERCENT: usize = 8;
    pub const LARGEST_DRAWDOWN_PERCENT: usize = 9;
}

/// Bid/ask vector slots.
pub mod bid_ask_index {
    pub const BID: usize = 0;
    pub const ASK: usize = 1;
    pub const BASE_CONVERSION_BID: usize = 2;
    pub const BASE_CONVERSION_ASK: usize = 3;
    pub const QUOTE_CONVERSION_BID: usize = 4;
    pub const QUOTE_CONVERSION_ASK: usize = 5;
}

/// Bit flags packed into `StrategyResult::trading_signals`.
pub mod signal_flags {
    pub const OPEN_BUY: u32 = 0x0000_0001;
    pub const CLOSE_BUY: u32 = 0x0000_0002;
    pub const UPDATE_BUY: u32 = 0x0000_0004;
    pub const OPEN_BUYLIMIT: u32 = 0x0000_0008;
    pub const CLOSE_BUYLIMIT: u32 = 0x0000_0010;
    pub const UPDATE_BUYLIMIT: u32 = 0x0000_0020;
    pub const OPEN_BUYSTOP: u32 = 0x0000_0040;
    pub const CLOSE_BUYSTOP: u32 = 0x0000_0080;
    pub const UPDATE_BUYSTOP: u32 = 0x0000_0100;
    pub const OPEN_SELL: u32 = 0x0001_0000;
    pub const CLOSE_SELL: u32 = 0x0002_0000;
    pub const UPDATE_SELL: u32 = 0x0004_0000;
    pub const OPEN_SELLLIMIT: u32 = 0x0008_0000;
    pub const CLOSE_SELLLIMIT: u32 = 0x0010_0000;
    pub const UPDATE_SELLLIMIT: u32 = 0x0020_0000;
    pub const OPEN_SELLSTOP: u32 = 0x0040_0000;
    pub const CLOSE_SELLSTOP: u32 = 0x0080_0000;
    pub const UPDATE_SELLSTOP: u32 = 0x0100_0000;
}

/// One record of the native results vector (`StrategyResults`).
/// SL/TP fields are distances from the entry price, not absolute levels.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StrategyResult {
    pub ticket_number: f64,
    pub trading_signals: f64,
    pub lots: f64,
    pub entry_price: f64,
    pub broker_sl: f64,
    pub broker_tp: f64,
    pub internal_sl: f64,
    pub internal_tp: f64,
    pub use_trailing_sl: f64,
    pub expiration_time: f64,
}

impl StrategyResult {
    pub fn from_slice(values: &[f64]) -> Self {
        let v = |i: usize| values.get(i).copied().unwrap_or(0.0);
        Self {
            ticket_number: v(0),
            trading_signals: v(1),
            lots: v(2),
            entry_price: v(3),
            broker_sl: v(4),
            broker_tp: v(5),
            internal_sl: v(6),
            internal_tp: v(7),
            use_trailing_sl: v(8),
            expiration_time: v(9),
        }
    }

    pub fn signal_word(&self) -> u32 {
        if self.trading_signals > 0.0 { self.trading_signals as u32 } else { 0 }
    }

    /// Ticket as an integer; -1 addresses every order of the signalled type.
    pub fn ticket(&self) -> i64 {
        self.ticket_number as i64
    }
}

/// One populated rate buffer slot handed to the engine.
#[derive(Debug, Clone, Copy)]
pub struct BufferView<'a> {
    pub descriptor: &'a rates::RateBufferDescriptor,
    pub bars: &'a [rates::Rate],
}

/// Everything the engine sees for one bar of one instance.
#[derive(Debug, Clone)]
pub struct BarSnapshot<'a> {
    pub instance_id: i32,
    /// Index of the bar in the primary series. Host-side only.
    pub bar_index: usize,
    pub current_time: i64,
    pub settings: &'a [f64; SETTINGS_SIZE],
    pub symbol: &'a str,
    pub account_currency: &'a str,
    pub broker_name: &'a str,
    pub ref_broker_name: &'a str,
    pub account_info: [f64; ACCOUNT_INFO_SIZE],
    pub bid_ask: [f64; BID_ASK_SIZE],
    pub open_orders: Vec<COrderInfo>,
    pub buffers: Vec<BufferView<'a>>,
}

impl BarSnapshot<'_> {
    pub fn bid(&self) -> f64 {
        self.bid_ask[bid_ask_index::BID]
    }

    pub fn ask(&self) -> f64 {
        self.bid_ask[bid_ask_index::ASK]
    }

    pub fn max_open_orders(&self) -> usize {
        (self.settings[settings_index::MAX_OPEN_ORDERS].max(1.0)) as usize
    }
}

/// Return code plus results vector of one per-bar call.
#[derive(Debug, Clone, Default)]
pub struct BarOutcome {
    pub code: i32,
    pub results: Vec<StrategyResult>,
}

impl BarOutcome {
    pub fn success(results: Vec<StrategyResult>) -> Self {
        Self { code: 0, results }
    }

    pub fn failure(code: i32) -> Self {
        Self { code, results: Vec::new() }
    }
}

/// The opaque strategy framework: init, evaluate one bar, deinit.
/// Implementations must accept calls for different instances concurrently;
/// the instance registry guarantees at most one call in flight per instance.
pub trait NativeEngine: Send + Sync {
    fn init_instance(&self, instance_id: i32, is_backtesting: bool, config_path: &str, account_label: &str) -> i32;

    fn run_bar(&self, snapshot: &BarSnapshot<'_>) -> BarOutcome;

    fn deinit_instance(&self, instance_id: i32);

    fn framework_version(&self) -> (i32, i32, i32) {
        (0, 0, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_sizes_match_c() {
        assert_eq!(std::mem::size_of::<COrderInfo>(), 15 * 8);
        assert_eq!(std::mem::size_of::<CRatesInfo>(), 7 * 8);
        assert_eq!(std::mem::size_of::<StrategyResult>(), STRATEGY_RESULT_SIZE * 8);
    }

    #[test]
    fn test_settings_lookup() {
        assert_eq!(settings_index::lookup("ADDITIONAL_PARAM_1"), Some(0));
        assert_eq!(settings_index::lookup("ADDITIONAL_PARAM_40"), Some(39));
        assert_eq!(settings_index::lookup("ADDITIONAL_PARAM_41"), None);
        assert_eq!(settings_index::lookup("MAX_OPEN_ORDERS"), Some(45));
        assert_eq!(settings_index::lookup("TIMEFRAME"), Some(53));
        assert_eq!(settings_index::lookup("NOPE"), None);
        assert_eq!(settings_index::name(0), "ADDITIONAL_PARAM_1");
        assert_eq!(settings_index::name(45), "MAX_OPEN_ORDERS");
    }

    #[test]
    fn test_strategy_result_from_slice() {
        let raw = [3.0, 1.0, 0.5, 1.1, 0.002, 0.004, 0.0, 0.0, 0.0, 0.0];
        let result = StrategyResult::from_slice(&raw);
        assert_eq!(result.ticket(), 3);
        assert_eq!(result.signal_word(), signal_flags::OPEN_BUY);
        assert_eq!(result.lots, 0.5);
        assert_eq!(StrategyResult::from_slice(&[]).signal_word(), 0);
    }
}
