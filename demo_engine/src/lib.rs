// demo_engine/src/lib.rs

//! A moving average crossover strategy behind the framework C ABI
//! (`initInstanceC`, `deinitInstance`, `c_runStrategy`, `getFrameworkVersion`).
//! Parameters: `ADDITIONAL_PARAM_1` short window, `ADDITIONAL_PARAM_2` long
//! window, `ADDITIONAL_PARAM_3` lots.

#![allow(non_snake_case)]

use asirikuy_core::error::ReturnCode;
use asirikuy_core::native::{self, CRates, CRatesInfo, COrderInfo, StrategyResult, signal_flags};
use asirikuy_core::orders::OrderType;

use std::os::raw::{c_char, c_int};

const VERSION: (c_int, c_int, c_int) = (1, 0, 0);

static INSTANCES: std::sync::Mutex<Vec<c_int>> = std::sync::Mutex::new(Vec::new());

fn instances() -> std::sync::MutexGuard<'static, Vec<c_int>> {
    INSTANCES.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// A simple moving average crossover strategy.
/// Goes long when the short SMA is above the long SMA and short when it is below,
/// reversing any opposite position on the same bar.
#[derive(Debug, Clone, Copy)]
pub struct MovingAverageCrossStrategy {
    /// The window size for the short-term Simple Moving Average (SMA).
    short_window: usize,
    /// The window size for the long-term Simple Moving Average (SMA).
    long_window: usize,
    lots: f64,
}

impl MovingAverageCrossStrategy {
    /// Reads the windows and lot size from the settings vector.
    ///
    /// # Returns
    /// * `None` when the windows are missing or the short one is not below the long one.
    pub fn from_settings(settings: &[f64]) -> Option<Self> {
        let value = |index: usize| settings.get(index).copied().unwrap_or(0.0);
        let short_window = value(0) as usize;
        let long_window = value(1) as usize;
        let lots = if value(2) > 0.0 { value(2) } else { 0.1 };

        if short_window == 0 || short_window >= long_window {
            return None;
        }
        Some(Self {
            short_window,
            long_window,
            lots,
        })
    }

    /// Calculates the results vector for one bar.
    ///
    /// # Arguments
    /// * `closes` - Close prices of the primary buffer, oldest first.
    /// * `open_orders` - Orders this instance holds.
    ///
    /// # Returns
    /// * Signals to apply, empty while there is not enough history.
    pub fn calculate_signals(&self, closes: &[f64], open_orders: &[COrderInfo]) -> Vec<StrategyResult> {
        let (Some(short_sma), Some(long_sma)) = (sma(closes, self.short_window), sma(closes, self.long_window)) else {
            return Vec::new();
        };

        let has = |order_type: OrderType| open_orders.iter().any(|o| o.order_type as i32 == order_type as i32);
        let mut signals = Vec::new();

        if short_sma > long_sma && !has(OrderType::Buy) {
            // EXIT SHORT
            if has(OrderType::Sell) {
                signals.push(signal(-1.0, signal_flags::CLOSE_SELL, 0.0));
            }
            // LONG
            signals.push(signal(0.0, signal_flags::OPEN_BUY, self.lots));
        } else if short_sma < long_sma && !has(OrderType::Sell) {
            // EXIT LONG
            if has(OrderType::Buy) {
                signals.push(signal(-1.0, signal_flags::CLOSE_BUY, 0.0));
            }
            // SHORT
            signals.push(signal(0.0, signal_flags::OPEN_SELL, self.lots));
        }
        signals
    }
}

fn signal(ticket: f64, flags: u32, lots: f64) -> StrategyResult {
    StrategyResult {
        ticket_number: ticket,
        trading_signals: flags as f64,
        lots,
        ..Default::default()
    }
}

/// Simple moving average of the last `window` values.
pub fn sma(values: &[f64], window: usize) -> Option<f64> {
    if window == 0 || values.len() < window {
        return None;
    }
    let tail = &values[values.len() - window..];
    Some(tail.iter().sum::<f64>() / window as f64)
}

fn write_results(out: &mut [f64], results: &[StrategyResult]) {
    for (chunk, result) in out.chunks_mut(native::STRATEGY_RESULT_SIZE).zip(results) {
        let fields = [
            result.ticket_number,
            result.trading_signals,
            result.lots,
            result.entry_price,
            result.broker_sl,
            result.broker_tp,
            result.internal_sl,
            result.internal_tp,
            result.use_trailing_sl,
            result.expiration_time,
        ];
        chunk.copy_from_slice(&fields[..chunk.len()]);
    }
}

/// C function exported for dynamic loading.
/// Registers an instance.
///
/// # Returns
/// * `0` on success, `TooManyInstances` when the id is already registered.
#[unsafe(no_mangle)]
pub extern "C" fn initInstanceC(
    instance_id: c_int,
    _is_testing: c_int,
    _config: *const c_char,
    _account_name: *const c_char,
) -> c_int {
    let mut registered = instances();
    if registered.contains(&instance_id) {
        return ReturnCode::TooManyInstances as c_int;
    }
    registered.push(instance_id);
    ReturnCode::Success as c_int
}

/// C function exported for dynamic loading.
#[unsafe(no_mangle)]
pub extern "C" fn deinitInstance(instance_id: c_int) -> c_int {
    let mut registered = instances();
    match registered.iter().position(|id| *id == instance_id) {
        Some(position) => {
            registered.swap_remove(position);
            ReturnCode::Success as c_int
        }
        None => ReturnCode::UnknownInstanceId as c_int,
    }
}

/// C function exported for dynamic loading.
///
/// # Safety
/// Every pointer must be null or valid for reads of the size the framework contract states.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn getFrameworkVersion(major: *mut c_int, minor: *mut c_int, bugfix: *mut c_int) {
    if major.is_null() || minor.is_null() || bugfix.is_null() {
        return;
    }
    unsafe {
        *major = VERSION.0;
        *minor = VERSION.1;
        *bugfix = VERSION.2;
    }
}

/// C function exported for dynamic loading.
/// Evaluates one bar of one instance and fills `out_results`.
///
/// # Safety
/// Pointers must be valid for the sizes the settings, descriptors and order count declare.
#[unsafe(no_mangle)]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn c_runStrategy(
    settings: *const f64,
    _trade_symbol: *const c_char,
    _account_currency: *const c_char,
    _broker_name: *const c_char,
    _ref_broker_name: *const c_char,
    _current_time: *const c_int,
    open_orders_count: *const c_int,
    order_info: *const COrderInfo,
    _account_info: *const f64,
    _bid_ask: *const f64,
    rates_info: *const CRatesInfo,
    rates_0: *const CRates,
    _rates_1: *const CRates,
    _rates_2: *const CRates,
    _rates_3: *const CRates,
    _rates_4: *const CRates,
    _rates_5: *const CRates,
    _rates_6: *const CRates,
    _rates_7: *const CRates,
    _rates_8: *const CRates,
    _rates_9: *const CRates,
    out_results: *mut f64,
) -> c_int {
    // Check for null pointers to prevent crashes.
    if settings.is_null() || rates_info.is_null() || rates_0.is_null() || out_results.is_null() {
        return ReturnCode::NullPointer as c_int;
    }
    let settings = unsafe { std::slice::from_raw_parts(settings, native::SETTINGS_SIZE) };

    let instance_id = settings[native::settings_index::STRATEGY_INSTANCE_ID] as c_int;
    if !instances().contains(&instance_id) {
        return ReturnCode::UnknownInstanceId as c_int;
    }
    let Some(strategy) = MovingAverageCrossStrategy::from_settings(settings) else {
        return ReturnCode::InvalidParameter as c_int;
    };

    let info = unsafe { &*rates_info };
    let count = info.rates_array_size.max(0.0) as usize;
    let closes: Vec<f64> = unsafe { std::slice::from_raw_parts(rates_0, count) }
        .iter()
        .map(|r| r.close)
        .collect();

    let order_count = if open_orders_count.is_null() { 0 } else { unsafe { *open_orders_count }.max(0) as usize };
    let open_orders: &[COrderInfo] = if order_info.is_null() || order_count == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(order_info, order_count) }
    };

    let max_orders = settings[native::settings_index::MAX_OPEN_ORDERS].max(1.0) as usize;
    let out = unsafe { std::slice::from_raw_parts_mut(out_results, native::STRATEGY_RESULT_SIZE * max_orders) };
    out.fill(0.0);

    let results = strategy.calculate_signals(&closes, open_orders);
    write_results(out, &results);
    ReturnCode::Success as c_int
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(order_type: OrderType) -> COrderInfo {
        COrderInfo {
            ticket: 1.0,
            order_type: order_type as i32 as f64,
            is_open: 1.0,
            ..Default::default()
        }
    }

    fn strategy() -> MovingAverageCrossStrategy {
        MovingAverageCrossStrategy::from_settings(&[2.0, 4.0, 0.5]).unwrap()
    }

    #[test]
    fn test_rejects_inverted_windows() {
        assert!(MovingAverageCrossStrategy::from_settings(&[4.0, 2.0]).is_none());
        assert!(MovingAverageCrossStrategy::from_settings(&[]).is_none());
    }

    #[test]
    fn test_sma() {
        assert_eq!(sma(&[1.0, 2.0, 3.0, 4.0], 2), Some(3.5));
        assert_eq!(sma(&[1.0], 2), None);
    }

    #[test]
    fn test_rising_prices_open_long_and_close_short() {
        let closes = [1.0, 1.1, 1.2, 1.3];
        let signals = strategy().calculate_signals(&closes, &[order(OrderType::Sell)]);
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].signal_word(), signal_flags::CLOSE_SELL);
        assert_eq!(signals[0].ticket(), -1);
        assert_eq!(signals[1].signal_word(), signal_flags::OPEN_BUY);
        assert_eq!(signals[1].lots, 0.5);
    }

    #[test]
    fn test_holds_existing_position() {
        let closes = [1.0, 1.1, 1.2, 1.3];
        assert!(strategy().calculate_signals(&closes, &[order(OrderType::Buy)]).is_empty());
        assert!(strategy().calculate_signals(&closes[..3], &[]).is_empty());
    }

    #[test]
    fn test_c_abi_round_trip() {
        let mut settings = [0.0; native::SETTINGS_SIZE];
        settings[0] = 2.0;
        settings[1] = 4.0;
        settings[native::settings_index::MAX_OPEN_ORDERS] = 2.0;
        settings[native::settings_index::STRATEGY_INSTANCE_ID] = 901.0;

        let rates: Vec<CRates> = [1.3, 1.2, 1.1, 1.0]
            .iter()
            .map(|close| CRates {
                close: *close,
                ..Default::default()
            })
            .collect();
        let info = CRatesInfo {
            is_enabled: 1.0,
            rates_array_size: rates.len() as f64,
            ..Default::default()
        };
        let mut out = [0.0; native::STRATEGY_RESULT_SIZE * 2];
        let empty = std::ffi::CString::new("").unwrap();
        let open_count: c_int = 0;
        let null = std::ptr::null::<CRates>();

        assert_eq!(initInstanceC(901, 1, empty.as_ptr(), empty.as_ptr()), 0);
        let code = unsafe {
            c_runStrategy(
                settings.as_ptr(),
                empty.as_ptr(),
                empty.as_ptr(),
                empty.as_ptr(),
                empty.as_ptr(),
                &0,
                &open_count,
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null(),
                &info,
                rates.as_ptr(),
                null,
                null,
                null,
                null,
                null,
                null,
                null,
                null,
                null,
                out.as_mut_ptr(),
            )
        };
        assert_eq!(code, 0);
        assert_eq!(StrategyResult::from_slice(&out).signal_word(), signal_flags::OPEN_SELL);
        assert_eq!(deinitInstance(901), 0);
        assert_eq!(deinitInstance(901), ReturnCode::UnknownInstanceId as c_int);
    }
}
